//! # mimir-peercontrol
//!
//! The peer controller (Section 4.8, C8): a monitor loop that watches
//! the overlay transport's current peering set, chooses which peer to
//! stay connected through, and broadcasts online/offline transitions to
//! registered [`PeerStateListener`]s.
//!
//! This is the one core component with no request/response protocol of
//! its own: it only polls `Transport::peers_json` and drives
//! `Transport::add_peer`/`remove_peer`. Its candidate bookkeeping
//! mirrors `mimir-directory`'s `TrackerList`: a small in-memory score per
//! known URI, updated every cycle, never persisted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mimir_types::traits::{PeerStateListener, Transport};
use serde::Deserialize;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

/// Poll cadence (Section 4.8).
pub const POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Minimum time on the current peer before a best-peer switch is
/// considered (Section 4.8 "Best-peer switch").
const BEST_PEER_SWITCH_AFTER: Duration = Duration::from_secs(30);

/// Candidates outside this cost band are never switch/jump targets
/// (Section 4.8): a cost of 0 usually means "not yet measured", and the
/// overlay reports very large costs for unreachable peers.
const VIABLE_COST_RANGE: std::ops::Range<f64> = 0.0..300.0;

/// How long the current peer must be `Up=false` before `jumpPeer` may
/// fire (Section 4.8 "Jump on failure").
const JUMP_GRACE_PERIOD: Duration = Duration::from_secs(12);

/// Minimum time between jumps (Section 4.8 "Hysteresis").
const MIN_JUMP_INTERVAL: Duration = Duration::from_secs(10);

/// Minimum time since the last reported network change before a jump is
/// allowed (Section 4.8 "Jump on failure").
const MIN_SINCE_NETWORK_CHANGE: Duration = Duration::from_secs(5);

/// One entry in the transport's peers snapshot.
///
/// Field names follow the overlay's own peers-API convention (the same
/// one `Transport::peers_json` is documented to forward verbatim), not
/// this crate's naming style.
#[derive(Clone, Debug, Deserialize)]
struct PeerSnapshotEntry {
    remote: String,
    up: bool,
    #[serde(default)]
    cost: f64,
}

/// Per-candidate-URI bookkeeping (Section 4.8 "store `(fails, cost)` per
/// candidate URI").
#[derive(Clone, Copy, Debug, Default)]
struct Candidate {
    fails: u32,
    cost: f64,
}

struct ControllerState {
    candidates: HashMap<String, Candidate>,
    current: Option<String>,
    current_since: Instant,
    down_since: Option<Instant>,
    last_jump: Option<Instant>,
    last_network_change: Option<Instant>,
    online: bool,
}

impl ControllerState {
    fn new(now: Instant) -> Self {
        Self {
            candidates: HashMap::new(),
            current: None,
            current_since: now,
            down_since: None,
            last_jump: None,
            last_network_change: None,
            online: false,
        }
    }
}

/// The peer controller (Section 4.8, C8). Generic over `Transport` the
/// same way `Supervisor`/`DirectoryClient` are: this core has no
/// `Arc<dyn Transport>` because `Transport::Error` makes it non-object-
/// safe.
pub struct PeerController<T: Transport> {
    transport: Arc<T>,
    listeners: Mutex<Vec<Arc<dyn PeerStateListener>>>,
    state: Mutex<ControllerState>,
    wake: Notify,
    running: AtomicBool,
}

impl<T: Transport + 'static> PeerController<T> {
    pub fn new(transport: Arc<T>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            listeners: Mutex::new(Vec::new()),
            state: Mutex::new(ControllerState::new(Instant::now())),
            wake: Notify::new(),
            running: AtomicBool::new(true),
        })
    }

    pub async fn register_listener(&self, listener: Arc<dyn PeerStateListener>) {
        self.listeners.lock().await.push(listener);
    }

    /// Signal that the local network changed (new interface, address
    /// change, etc.), waking the poll loop immediately instead of
    /// waiting out the rest of [`POLL_INTERVAL`] (Section 4.8).
    pub async fn notify_network_change(&self) {
        self.state.lock().await.last_network_change = Some(Instant::now());
        self.wake.notify_one();
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Run the monitor loop until [`Self::stop`] is called.
    pub async fn run(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            self.tick().await;
            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = self.wake.notified() => {}
            }
        }
    }

    async fn tick(&self) {
        let snapshot = match self.fetch_snapshot().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "failed to read peers snapshot");
                return;
            }
        };
        if snapshot.is_empty() {
            return;
        }

        let now = Instant::now();
        let mut state = self.state.lock().await;
        for entry in &snapshot {
            state
                .candidates
                .entry(entry.remote.clone())
                .or_default()
                .cost = entry.cost;
        }

        if state.current.is_none() {
            let first = snapshot[0].remote.clone();
            info!(peer = %first, "selecting initial peer");
            state.current = Some(first);
            state.current_since = now;
        }

        let current = state.current.clone().expect("just ensured present");
        let current_entry = snapshot.iter().find(|e| e.remote == current);
        let current_up = current_entry.map(|e| e.up).unwrap_or(false);
        let current_cost = current_entry.map(|e| e.cost).unwrap_or(0.0);

        if current_up {
            state.down_since = None;
            if now.duration_since(state.current_since) >= BEST_PEER_SWITCH_AFTER {
                self.maybe_switch_to_best(&mut state, &snapshot, &current, now).await;
            }
        } else {
            state.candidates.entry(current.clone()).or_default().fails += 1;
            if state.down_since.is_none() {
                state.down_since = Some(now);
            }
            self.maybe_jump(&mut state, &snapshot, &current, now).await;
        }

        self.report_transition(&mut state, current_up, current_cost).await;
    }

    async fn maybe_switch_to_best(
        &self,
        state: &mut ControllerState,
        snapshot: &[PeerSnapshotEntry],
        current: &str,
        now: Instant,
    ) {
        let mut best: Option<(&str, f64)> = None;
        for entry in snapshot {
            if entry.remote == current || !VIABLE_COST_RANGE.contains(&entry.cost) {
                continue;
            }
            match best {
                None => best = Some((entry.remote.as_str(), entry.cost)),
                Some((_, best_cost)) if entry.cost < best_cost => {
                    best = Some((entry.remote.as_str(), entry.cost))
                }
                _ => {}
            }
        }
        let Some((winner, cost)) = best else {
            return;
        };
        let winner = winner.to_string();
        info!(from = %current, to = %winner, cost, "switching to best-cost peer");
        for entry in snapshot {
            if entry.remote != winner {
                if let Err(e) = self.transport.remove_peer(&entry.remote).await {
                    debug!(peer = %entry.remote, error = %e, "failed to drop peer after best-peer switch");
                }
            }
        }
        state.current = Some(winner);
        state.current_since = now;
    }

    async fn maybe_jump(
        &self,
        state: &mut ControllerState,
        snapshot: &[PeerSnapshotEntry],
        current: &str,
        now: Instant,
    ) {
        let Some(down_since) = state.down_since else {
            return;
        };
        if now.duration_since(down_since) < JUMP_GRACE_PERIOD {
            return;
        }
        if state.last_jump.is_some_and(|t| now.duration_since(t) < MIN_JUMP_INTERVAL) {
            return;
        }
        if state
            .last_network_change
            .is_some_and(|t| now.duration_since(t) < MIN_SINCE_NETWORK_CHANGE)
        {
            return;
        }

        let mut candidates: Vec<&str> = snapshot
            .iter()
            .map(|e| e.remote.as_str())
            .filter(|uri| *uri != current)
            .collect();
        candidates.sort_by(|a, b| {
            let ca = state.candidates.get(*a).copied().unwrap_or_default();
            let cb = state.candidates.get(*b).copied().unwrap_or_default();
            ca.fails.cmp(&cb.fails).then(ca.cost.total_cmp(&cb.cost))
        });
        let Some(target) = candidates.first().copied() else {
            debug!(current, "peer down but no alternative candidate to jump to");
            return;
        };
        let target = target.to_string();
        info!(from = %current, to = %target, "jumping to alternate peer");
        if let Err(e) = self.transport.remove_peer(current).await {
            debug!(peer = %current, error = %e, "failed to remove failed peer");
        }
        if let Err(e) = self.transport.add_peer(&target).await {
            warn!(peer = %target, error = %e, "failed to add jump target peer");
        }
        state.current = Some(target);
        state.current_since = now;
        state.down_since = None;
        state.last_jump = Some(now);
    }

    async fn report_transition(&self, state: &mut ControllerState, online: bool, cost: f64) {
        if state.online == online {
            return;
        }
        state.online = online;
        let host = state.current.clone().unwrap_or_default();
        let listeners = self.listeners.lock().await.clone();
        for listener in listeners {
            listener.on_peer_state(online, host.clone(), cost).await;
        }
    }

    async fn fetch_snapshot(&self) -> Result<Vec<PeerSnapshotEntry>, serde_json::Error> {
        let raw = self.transport.peers_json().await;
        serde_json::from_str(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mimir_types::model::{OverlayAddress, PeerKey};
    use mimir_types::traits::Connection;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Mutex as TokioMutex;

    #[derive(Debug, thiserror::Error)]
    #[error("test transport error")]
    struct TestError;

    struct NullConn;

    #[async_trait]
    impl Connection for NullConn {
        type Error = TestError;
        async fn write(&mut self, _data: &[u8]) -> Result<(), Self::Error> {
            Ok(())
        }
        async fn read(&mut self, _buf: &mut [u8]) -> Result<usize, Self::Error> {
            std::future::pending().await
        }
        async fn read_with_timeout(
            &mut self,
            _buf: &mut [u8],
            _timeout_ms: u64,
        ) -> Result<Option<usize>, Self::Error> {
            Ok(None)
        }
        async fn close(&mut self) {}
    }

    struct TestTransport {
        snapshot: StdMutex<String>,
        removed: StdMutex<Vec<String>>,
        added: StdMutex<Vec<String>>,
    }

    impl TestTransport {
        fn new(snapshot: &str) -> Self {
            Self {
                snapshot: StdMutex::new(snapshot.to_string()),
                removed: StdMutex::new(Vec::new()),
                added: StdMutex::new(Vec::new()),
            }
        }

        fn set_snapshot(&self, snapshot: &str) {
            *self.snapshot.lock().expect("not poisoned") = snapshot.to_string();
        }
    }

    #[async_trait]
    impl Transport for TestTransport {
        type Conn = NullConn;
        type Error = TestError;
        async fn connect(&self, _peer_pubkey: &PeerKey) -> Result<Self::Conn, Self::Error> {
            Ok(NullConn)
        }
        async fn accept(&self) -> Result<(Self::Conn, OverlayAddress), Self::Error> {
            std::future::pending().await
        }
        async fn close_connection(&self, _peer_pubkey: &PeerKey) {}
        async fn peers_json(&self) -> String {
            self.snapshot.lock().expect("not poisoned").clone()
        }
        async fn paths_json(&self) -> String {
            "[]".into()
        }
        async fn add_peer(&self, uri: &str) -> Result<(), Self::Error> {
            self.added.lock().expect("not poisoned").push(uri.to_string());
            Ok(())
        }
        async fn remove_peer(&self, uri: &str) -> Result<(), Self::Error> {
            self.removed.lock().expect("not poisoned").push(uri.to_string());
            Ok(())
        }
        async fn public_key(&self) -> OverlayAddress {
            [0u8; 32]
        }
    }

    #[derive(Default)]
    struct RecordingListener {
        events: TokioMutex<Vec<(bool, String, f64)>>,
    }

    #[async_trait]
    impl PeerStateListener for RecordingListener {
        async fn on_peer_state(&self, online: bool, host: String, cost: f64) {
            self.events.lock().await.push((online, host, cost));
        }
    }

    #[tokio::test]
    async fn selects_first_peer_on_first_tick() {
        let transport = Arc::new(TestTransport::new(
            r#"[{"remote":"tcp://a","up":true,"cost":50.0}]"#,
        ));
        let controller = PeerController::new(transport);
        controller.tick().await;
        let state = controller.state.lock().await;
        assert_eq!(state.current.as_deref(), Some("tcp://a"));
    }

    #[tokio::test]
    async fn online_transition_is_reported_to_listeners() {
        let transport = Arc::new(TestTransport::new(
            r#"[{"remote":"tcp://a","up":true,"cost":50.0}]"#,
        ));
        let controller = PeerController::new(transport);
        let listener = Arc::new(RecordingListener::default());
        controller.register_listener(listener.clone()).await;

        controller.tick().await;

        let events = listener.events.lock().await;
        assert_eq!(events.len(), 1);
        assert!(events[0].0);
        assert_eq!(events[0].1, "tcp://a");
    }

    #[tokio::test]
    async fn best_peer_switch_happens_after_dwell_time_and_drops_others() {
        let transport = Arc::new(TestTransport::new(
            r#"[{"remote":"tcp://a","up":true,"cost":250.0},{"remote":"tcp://b","up":true,"cost":10.0}]"#,
        ));
        let controller = PeerController::new(transport.clone());
        controller.tick().await;
        {
            let mut state = controller.state.lock().await;
            state.current_since = Instant::now() - BEST_PEER_SWITCH_AFTER - Duration::from_secs(1);
        }

        controller.tick().await;

        let state = controller.state.lock().await;
        assert_eq!(state.current.as_deref(), Some("tcp://b"));
        let removed = transport.removed.lock().expect("not poisoned");
        assert_eq!(removed.as_slice(), &["tcp://a".to_string()]);
    }

    #[tokio::test]
    async fn jump_on_failure_respects_grace_period_and_hysteresis() {
        let transport = Arc::new(TestTransport::new(
            r#"[{"remote":"tcp://a","up":false,"cost":50.0},{"remote":"tcp://b","up":true,"cost":20.0}]"#,
        ));
        let controller = PeerController::new(transport.clone());
        controller.tick().await;
        assert_eq!(
            controller.state.lock().await.current.as_deref(),
            Some("tcp://a")
        );

        // Still within the grace period: no jump yet.
        controller.tick().await;
        assert_eq!(
            controller.state.lock().await.current.as_deref(),
            Some("tcp://a")
        );

        {
            let mut state = controller.state.lock().await;
            state.down_since = Some(Instant::now() - JUMP_GRACE_PERIOD - Duration::from_secs(1));
        }
        controller.tick().await;

        let state = controller.state.lock().await;
        assert_eq!(state.current.as_deref(), Some("tcp://b"));
        assert!(state.last_jump.is_some());
        let added = transport.added.lock().expect("not poisoned");
        assert_eq!(added.as_slice(), &["tcp://b".to_string()]);
    }

    #[tokio::test]
    async fn jump_is_suppressed_within_hysteresis_window_of_a_recent_network_change() {
        let transport = Arc::new(TestTransport::new(
            r#"[{"remote":"tcp://a","up":false,"cost":50.0},{"remote":"tcp://b","up":true,"cost":20.0}]"#,
        ));
        let controller = PeerController::new(transport.clone());
        controller.tick().await;
        {
            let mut state = controller.state.lock().await;
            state.down_since = Some(Instant::now() - JUMP_GRACE_PERIOD - Duration::from_secs(1));
            state.last_network_change = Some(Instant::now());
        }

        controller.tick().await;

        let state = controller.state.lock().await;
        assert_eq!(state.current.as_deref(), Some("tcp://a"));
    }
}
