//! # mimir-server
//!
//! The P2P supervisor (Section 4.5, C5): accepts inbound sockets, dials
//! outbound whenever Storage reports a contact with pending messages and
//! no live session, and maintains the "at most one connection per peer
//! public key" invariant (Section 3).
//!
//! Cyclic reference (Section 9 "Design notes"): the supervisor owns each
//! [`mimir_session::Session`] outright and drives its task; the session
//! only holds a non-owning `Arc<dyn EventListener>` back to the
//! supervisor. Here that non-owning listener is a small per-session
//! [`SessionListener`], not the supervisor itself: a session's handle is
//! produced alongside it by `Session::new_outbound`/`new_inbound`, after
//! the listener has already been handed to the constructor, so the
//! listener stashes the handle in a slot the spawning code fills in
//! immediately afterward (before the task is spawned, and therefore
//! before the handshake can possibly reach `Auth2Done` and call back).
//! `SessionListener` registers that handle into the supervisor's
//! `connections` map on `on_client_connected` and forwards every
//! callback to the caller-supplied upstream listener (the application
//! layer, e.g. `mimir-daemon`).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use mimir_crypto::ed25519::SigningKey;
use mimir_directory::DirectoryClient;
use mimir_session::{Session, SessionHandle};
use mimir_types::model::{OutboundMessage, OverlayAddress, Peer, PeerKey};
use mimir_types::traits::{Connection, EventListener, Storage, Transport};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Outbound dial policy (Section 4.5, Section 5).
pub const DIAL_ATTEMPTS: u32 = 5;
pub const DIAL_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(3);

/// Cadence at which the pending-message scan loop wakes up to look for
/// contacts that need a fresh outbound session.
pub const PENDING_SCAN_INTERVAL: Duration = Duration::from_secs(2);

/// Cadence at which the accept loop polls for an overlay address change
/// while waiting for the next inbound connection.
pub const ACCEPT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("no address candidates available for peer")]
    NoCandidates,

    #[error("storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, ServerError>;

/// One P2P supervisor instance: one overlay identity, one listening
/// accept loop, one outbound dial loop.
pub struct Supervisor<T: Transport, S: Storage> {
    transport: Arc<T>,
    storage: Arc<S>,
    directory: Arc<DirectoryClient<T>>,
    signing_key: SigningKey,
    local_pubkey: PeerKey,
    client_id: u32,
    upstream: Arc<dyn EventListener>,
    connections: Mutex<HashMap<PeerKey, (u64, SessionHandle)>>,
    connecting: Mutex<HashSet<PeerKey>>,
    last_overlay_address: Mutex<OverlayAddress>,
    /// Monotonic counter distinguishing successive sessions for the same
    /// peer, so a closing session never evicts a newer one that has
    /// already replaced it in `connections`.
    next_gen: AtomicU64,
}

impl<T: Transport + 'static, S: Storage + 'static> Supervisor<T, S> {
    pub fn new(
        transport: Arc<T>,
        storage: Arc<S>,
        directory: Arc<DirectoryClient<T>>,
        signing_key: SigningKey,
        local_pubkey: PeerKey,
        client_id: u32,
        upstream: Arc<dyn EventListener>,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            storage,
            directory,
            signing_key,
            local_pubkey,
            client_id,
            upstream,
            connections: Mutex::new(HashMap::new()),
            connecting: Mutex::new(HashSet::new()),
            last_overlay_address: Mutex::new([0u8; 32]),
            next_gen: AtomicU64::new(0),
        })
    }

    /// Currently live peer public keys (Section 3 invariant: at most one
    /// active session per peer key, enforced by this map).
    pub async fn connected_peers(&self) -> Vec<PeerKey> {
        self.connections.lock().await.keys().copied().collect()
    }

    /// Queue an outbound message for `peer`, writing directly to a live
    /// session's send queue if one exists. Callers still persist the
    /// message in Storage themselves (Section 3: "remains unsent until
    /// delivery receipt"); this only short-circuits the next scan when a
    /// session is already up.
    pub async fn send_if_connected(&self, peer: &PeerKey, message: OutboundMessage) -> bool {
        if let Some((_, handle)) = self.connections.lock().await.get(peer) {
            handle.send_message(message).await;
            true
        } else {
            false
        }
    }

    /// Run the accept loop forever (or until the transport errors
    /// fatally). Spawns one inbound [`Session`] task per accepted
    /// connection.
    pub async fn run_accept_loop(self: Arc<Self>) -> Result<()> {
        *self.last_overlay_address.lock().await = self.transport.public_key().await;
        loop {
            match tokio::time::timeout(ACCEPT_POLL_INTERVAL, self.transport.accept()).await {
                Ok(Ok((conn, observed_address))) => {
                    self.clone().spawn_inbound(conn, observed_address).await;
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "accept failed");
                }
                Err(_) => {
                    self.check_overlay_address_change().await;
                }
            }
        }
    }

    /// Yggdrasil address changes are detected by polling
    /// `transport.public_key()` during accept timeouts (Section 4.5).
    /// When it changes, every live session is torn down (the transport
    /// itself owns actually rebinding its listening socket); sessions
    /// are recreated on demand by the pending-message loop.
    async fn check_overlay_address_change(&self) {
        let current = self.transport.public_key().await;
        let mut last = self.last_overlay_address.lock().await;
        if *last != current {
            info!(?last, ?current, "overlay address changed, tearing down sessions");
            *last = current;
            let handles: Vec<SessionHandle> = self
                .connections
                .lock()
                .await
                .values()
                .map(|(_, h)| h.clone())
                .collect();
            for handle in handles {
                handle.stop();
            }
        }
    }

    async fn spawn_inbound(self: Arc<Self>, conn: T::Conn, observed_address: OverlayAddress) {
        let local_address = self.transport.public_key().await;
        let listener = SessionListener::new(self.clone());
        let (session, handle) = Session::new_inbound(
            conn,
            self.local_pubkey,
            self.signing_key.clone(),
            self.client_id,
            local_address,
            observed_address,
            listener.clone(),
        );
        listener.register(handle);
        tokio::spawn(async move {
            if let Err(e) = session.run().await {
                debug!(error = %e, "inbound session ended");
            }
        });
    }

    /// Run the pending-message scan loop forever: for every contact with
    /// at least one unsent message and no live session, resolve
    /// addresses and dial (Section 4.5).
    pub async fn run_pending_loop(self: Arc<Self>) {
        loop {
            if let Err(e) = self.clone().scan_pending_once().await {
                warn!(error = %e, "pending-message scan failed");
            }
            tokio::time::sleep(PENDING_SCAN_INTERVAL).await;
        }
    }

    async fn scan_pending_once(self: Arc<Self>) -> Result<()> {
        let contacts = self
            .storage
            .get_contacts_with_unsent_messages()
            .await
            .map_err(|e| ServerError::Storage(e.to_string()))?;
        for peer in contacts {
            let already_connected = self.connections.lock().await.contains_key(&peer);
            if already_connected {
                continue;
            }
            let newly_claimed = self.connecting.lock().await.insert(peer);
            if !newly_claimed {
                continue;
            }
            let this = self.clone();
            tokio::spawn(async move {
                let result = this.clone().dial_and_connect(peer).await;
                this.connecting.lock().await.remove(&peer);
                if let Err(e) = result {
                    debug!(peer = ?peer, error = %e, "dial attempt failed");
                }
            });
        }
        Ok(())
    }

    /// Resolve `peer`'s candidate addresses (cache first, tracker on a
    /// cache miss or all-dead cache), sort by priority, and dial each
    /// candidate in turn (Section 4.5).
    async fn dial_and_connect(self: Arc<Self>, peer: PeerKey) -> Result<()> {
        let now = now_unix();
        let mut candidates = self
            .storage
            .get_contact_peers(&peer)
            .await
            .map_err(|e| ServerError::Storage(e.to_string()))?;
        candidates.retain(|p| !p.is_expired(now));

        if candidates.is_empty() {
            candidates = self
                .directory
                .resolve_addrs(peer)
                .await
                .map_err(|e| ServerError::Transport(e.to_string()))?;
            for p in &candidates {
                let _ = self
                    .storage
                    .save_ip(&peer, p.overlay_address, p.client_id, p.priority, p.expiration)
                    .await;
            }
        }

        if candidates.is_empty() {
            return Err(ServerError::NoCandidates);
        }

        candidates.sort_by_key(|p| p.priority);
        dedup_by_address(&mut candidates);

        // `Transport::connect` (Section 6) is keyed by public key alone —
        // the overlay address is deterministically derivable from it —
        // so every candidate dials the same target. The priority-ordered
        // candidate list still governs retry order and is what gets
        // persisted via `save_ip`; see DESIGN.md.
        for candidate in &candidates {
            if let Some(conn) = self.try_dial(peer, candidate).await {
                self.clone().spawn_outbound(conn, peer).await;
                return Ok(());
            }
        }
        Err(ServerError::NoCandidates)
    }

    /// Attempt to connect to `peer`, retrying up to [`DIAL_ATTEMPTS`]
    /// times with an `i*1s` delay between attempts and a
    /// [`DIAL_ATTEMPT_TIMEOUT`] deadline per attempt (Section 5).
    async fn try_dial(&self, peer: PeerKey, candidate: &Peer) -> Option<T::Conn> {
        debug!(peer = ?peer, priority = candidate.priority, "dialing candidate");
        for attempt in 0..DIAL_ATTEMPTS {
            let outcome = tokio::time::timeout(DIAL_ATTEMPT_TIMEOUT, self.transport.connect(&peer)).await;
            match outcome {
                Ok(Ok(conn)) => return Some(conn),
                Ok(Err(e)) => {
                    debug!(peer = ?peer, attempt, error = %e, "dial attempt failed");
                }
                Err(_) => {
                    debug!(peer = ?peer, attempt, "dial attempt timed out");
                }
            }
            if attempt + 1 < DIAL_ATTEMPTS {
                tokio::time::sleep(Duration::from_secs(u64::from(attempt) + 1)).await;
            }
        }
        None
    }

    async fn spawn_outbound(self: Arc<Self>, conn: T::Conn, peer: PeerKey) {
        let local_address = self.transport.public_key().await;
        let listener = SessionListener::new(self.clone());
        let (session, handle) = Session::new_outbound(
            conn,
            self.local_pubkey,
            self.signing_key.clone(),
            peer,
            self.client_id,
            local_address,
            listener.clone(),
        );
        listener.register(handle);
        tokio::spawn(async move {
            if let Err(e) = session.run().await {
                debug!(error = %e, "outbound session ended");
            }
        });
    }
}

fn dedup_by_address(candidates: &mut Vec<Peer>) {
    let mut seen = HashSet::new();
    candidates.retain(|p| seen.insert(p.overlay_address));
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// The non-owning side of the supervisor/session cycle (Section 9).
///
/// One instance per spawned session. `handle_slot` is filled in by the
/// spawning code immediately after `Session::new_outbound`/`new_inbound`
/// returns (and therefore strictly before the session's task starts
/// running), so by the time any callback can fire the slot is always
/// populated. `my_gen` records which `connections` entry belongs to this
/// session, so `on_connection_closed` only ever removes its own entry —
/// never one a newer session has already replaced it with.
struct SessionListener<T: Transport, S: Storage> {
    supervisor: Arc<Supervisor<T, S>>,
    handle_slot: StdMutex<Option<SessionHandle>>,
    my_gen: StdMutex<Option<u64>>,
}

impl<T: Transport + 'static, S: Storage + 'static> SessionListener<T, S> {
    fn new(supervisor: Arc<Supervisor<T, S>>) -> Arc<Self> {
        Arc::new(Self {
            supervisor,
            handle_slot: StdMutex::new(None),
            my_gen: StdMutex::new(None),
        })
    }

    fn register(&self, handle: SessionHandle) {
        *self.handle_slot.lock().expect("handle_slot not poisoned") = Some(handle);
    }

    fn handle(&self) -> SessionHandle {
        self.handle_slot
            .lock()
            .expect("handle_slot not poisoned")
            .clone()
            .expect("handle registered before the session can reach Auth2Done")
    }
}

#[async_trait]
impl<T: Transport + 'static, S: Storage + 'static> EventListener for SessionListener<T, S> {
    async fn on_client_connected(&self, peer: PeerKey) {
        let gen = self.supervisor.next_gen.fetch_add(1, Ordering::SeqCst);
        *self.my_gen.lock().expect("my_gen not poisoned") = Some(gen);

        let mut connections = self.supervisor.connections.lock().await;
        if let Some((_, old)) = connections.insert(peer, (gen, self.handle())) {
            warn!(peer = ?peer, "replacing existing session for peer (at-most-one invariant)");
            old.stop();
        }
        drop(connections);
        self.supervisor.upstream.on_client_connected(peer).await;
    }

    async fn on_connection_closed(&self, peer: PeerKey) {
        let my_gen = *self.my_gen.lock().expect("my_gen not poisoned");
        if let Some(my_gen) = my_gen {
            let mut connections = self.supervisor.connections.lock().await;
            if connections.get(&peer).map(|(g, _)| *g) == Some(my_gen) {
                connections.remove(&peer);
            }
        }
        self.supervisor.upstream.on_connection_closed(peer).await;
    }

    async fn on_message_delivered(&self, peer: PeerKey, guid: u64) {
        if let Err(e) = self.supervisor.storage.mark_delivered(&peer, guid).await {
            warn!(peer = ?peer, guid, error = %e, "failed to mark message delivered");
        }
        self.supervisor.upstream.on_message_delivered(peer, guid).await;
    }

    async fn on_message_received(&self, peer: PeerKey, guid: u64, msg_type: u16, data: Vec<u8>) {
        self.supervisor
            .upstream
            .on_message_received(peer, guid, msg_type, data)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mimir_crypto::ed25519::KeyPair;
    use mimir_types::model::{
        Contact, GroupChat, GroupMember, GroupMessage,
    };
    use mimir_types::traits::ResolverReceiver;
    use std::collections::VecDeque as Deque;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Mutex as TMutex;

    #[derive(Debug, thiserror::Error)]
    #[error("mem conn closed")]
    struct MemConnError;

    /// An in-memory duplex `Connection`, mirroring `mimir-session`'s test
    /// double: two `MemConn`s share a pair of byte queues.
    struct MemConn {
        inbox: Arc<TMutex<Deque<u8>>>,
        outbox: Arc<TMutex<Deque<u8>>>,
    }

    #[async_trait]
    impl Connection for MemConn {
        type Error = MemConnError;

        async fn write(&mut self, data: &[u8]) -> std::result::Result<(), Self::Error> {
            self.outbox.lock().await.extend(data.iter().copied());
            Ok(())
        }

        async fn read(&mut self, buf: &mut [u8]) -> std::result::Result<usize, Self::Error> {
            loop {
                {
                    let mut inbox = self.inbox.lock().await;
                    if !inbox.is_empty() {
                        let n = buf.len().min(inbox.len());
                        for slot in buf.iter_mut().take(n) {
                            *slot = inbox.pop_front().expect("checked non-empty");
                        }
                        return Ok(n);
                    }
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }

        async fn read_with_timeout(
            &mut self,
            buf: &mut [u8],
            timeout_ms: u64,
        ) -> std::result::Result<Option<usize>, Self::Error> {
            match tokio::time::timeout(Duration::from_millis(timeout_ms), self.read(buf)).await {
                Ok(result) => result.map(Some),
                Err(_) => Ok(None),
            }
        }

        async fn close(&mut self) {}
    }

    fn paired_conns() -> (MemConn, MemConn) {
        let a_to_b = Arc::new(TMutex::new(Deque::new()));
        let b_to_a = Arc::new(TMutex::new(Deque::new()));
        (
            MemConn {
                inbox: b_to_a.clone(),
                outbox: a_to_b.clone(),
            },
            MemConn {
                inbox: a_to_b,
                outbox: b_to_a,
            },
        )
    }

    /// A `Transport` whose `accept()` hands out connections queued via
    /// [`TestTransport::push_inbound`], and whose `connect()` always
    /// fails (not exercised by the tests in this module).
    struct TestTransport {
        public_key: Mutex<OverlayAddress>,
        pending_accepts: TMutex<Deque<(MemConn, OverlayAddress)>>,
    }

    impl TestTransport {
        fn new(public_key: OverlayAddress) -> Self {
            Self {
                public_key: Mutex::new(public_key),
                pending_accepts: TMutex::new(Deque::new()),
            }
        }

        async fn push_inbound(&self, conn: MemConn, observed_address: OverlayAddress) {
            self.pending_accepts
                .lock()
                .await
                .push_back((conn, observed_address));
        }
    }

    #[async_trait]
    impl Transport for TestTransport {
        type Conn = MemConn;
        type Error = MemConnError;

        async fn connect(&self, _peer_pubkey: &PeerKey) -> std::result::Result<Self::Conn, Self::Error> {
            Err(MemConnError)
        }

        async fn accept(&self) -> std::result::Result<(Self::Conn, OverlayAddress), Self::Error> {
            loop {
                if let Some(pair) = self.pending_accepts.lock().await.pop_front() {
                    return Ok(pair);
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }

        async fn close_connection(&self, _peer_pubkey: &PeerKey) {}

        async fn peers_json(&self) -> String {
            "[]".into()
        }

        async fn paths_json(&self) -> String {
            "[]".into()
        }

        async fn add_peer(&self, _uri: &str) -> std::result::Result<(), Self::Error> {
            Ok(())
        }

        async fn remove_peer(&self, _uri: &str) -> std::result::Result<(), Self::Error> {
            Ok(())
        }

        async fn public_key(&self) -> OverlayAddress {
            *self.public_key.lock().await
        }
    }

    /// A `Storage` double tracking only what these tests need; every
    /// other method answers with an empty/default value.
    #[derive(Default)]
    struct TestStorage {
        contacts_with_unsent: TMutex<Vec<PeerKey>>,
        contact_peers: TMutex<HashMap<PeerKey, Vec<Peer>>>,
        delivered: TMutex<Vec<(PeerKey, u64)>>,
    }

    #[async_trait]
    impl Storage for TestStorage {
        type Error = MemConnError;

        async fn get_contacts_with_unsent_messages(&self) -> std::result::Result<Vec<PeerKey>, Self::Error> {
            Ok(self.contacts_with_unsent.lock().await.clone())
        }

        async fn get_contact_peers(&self, pubkey: &PeerKey) -> std::result::Result<Vec<Peer>, Self::Error> {
            Ok(self
                .contact_peers
                .lock()
                .await
                .get(pubkey)
                .cloned()
                .unwrap_or_default())
        }

        async fn save_ip(
            &self,
            _pubkey: &PeerKey,
            _addr: OverlayAddress,
            _client_id: u32,
            _priority: u8,
            _expiration: u64,
        ) -> std::result::Result<(), Self::Error> {
            Ok(())
        }

        async fn get_unsent_messages(&self, _pubkey: &PeerKey) -> std::result::Result<Vec<OutboundMessage>, Self::Error> {
            Ok(Vec::new())
        }

        async fn get_message(&self, _guid: u64) -> std::result::Result<Option<OutboundMessage>, Self::Error> {
            Ok(None)
        }

        async fn mark_delivered(&self, pubkey: &PeerKey, guid: u64) -> std::result::Result<(), Self::Error> {
            self.delivered.lock().await.push((*pubkey, guid));
            Ok(())
        }

        async fn get_contact(&self, _pubkey: &PeerKey) -> std::result::Result<Option<Contact>, Self::Error> {
            Ok(None)
        }

        async fn update_contact(&self, _pubkey: &PeerKey, _contact: Contact) -> std::result::Result<(), Self::Error> {
            Ok(())
        }

        async fn get_group_chat(&self, _chat_id: u64) -> std::result::Result<Option<GroupChat>, Self::Error> {
            Ok(None)
        }

        async fn get_group_chat_list(&self) -> std::result::Result<Vec<GroupChat>, Self::Error> {
            Ok(Vec::new())
        }

        async fn upsert_group_chat(&self, _chat: GroupChat) -> std::result::Result<(), Self::Error> {
            Ok(())
        }

        async fn add_group_message(&self, _message: GroupMessage) -> std::result::Result<(), Self::Error> {
            Ok(())
        }

        async fn delete_group_message_by_guid(&self, _chat_id: u64, _guid: u64) -> std::result::Result<(), Self::Error> {
            Ok(())
        }

        async fn check_group_message_exists(&self, _chat_id: u64, _guid: u64) -> std::result::Result<bool, Self::Error> {
            Ok(false)
        }

        async fn get_group_chat_timestamp(&self, _chat_id: u64) -> std::result::Result<Option<u64>, Self::Error> {
            Ok(None)
        }

        async fn update_group_member_info(&self, _member: GroupMember) -> std::result::Result<(), Self::Error> {
            Ok(())
        }

        async fn get_latest_group_member_update_time(&self, _chat_id: u64) -> std::result::Result<u64, Self::Error> {
            Ok(0)
        }

        async fn update_group_member_online_status(
            &self,
            _chat_id: u64,
            _pubkey: &PeerKey,
            _online: bool,
            _last_seen: u64,
        ) -> std::result::Result<(), Self::Error> {
            Ok(())
        }
    }

    struct NullReceiver;

    #[async_trait]
    impl ResolverReceiver for NullReceiver {
        async fn on_announce(&self, _ttl: u64) {}
        async fn on_error(&self) {}
    }

    #[derive(Default)]
    struct RecordingListener {
        connected: AtomicUsize,
        closed: AtomicUsize,
    }

    #[async_trait]
    impl EventListener for RecordingListener {
        async fn on_client_connected(&self, _peer: PeerKey) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_connection_closed(&self, _peer: PeerKey) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_message_delivered(&self, _peer: PeerKey, _guid: u64) {}
        async fn on_message_received(&self, _peer: PeerKey, _guid: u64, _msg_type: u16, _data: Vec<u8>) {}
    }

    fn make_supervisor(
        local_kp: &KeyPair,
        public_key: OverlayAddress,
        upstream: Arc<dyn EventListener>,
    ) -> Arc<Supervisor<TestTransport, TestStorage>> {
        let transport = Arc::new(TestTransport::new(public_key));
        let storage = Arc::new(TestStorage::default());
        let directory = Arc::new(DirectoryClient::new(
            transport.clone(),
            mimir_directory::TrackerList::default(),
            local_kp.verifying_key.to_bytes(),
            local_kp.signing_key.clone(),
            Arc::new(NullReceiver),
        ));
        Supervisor::new(
            transport,
            storage,
            directory,
            local_kp.signing_key.clone(),
            local_kp.verifying_key.to_bytes(),
            1,
            upstream,
        )
    }

    #[tokio::test]
    async fn session_listener_registers_and_deregisters() {
        let local_kp = KeyPair::generate();
        let upstream = Arc::new(RecordingListener::default());
        let supervisor = make_supervisor(&local_kp, [0u8; 32], upstream.clone());
        let peer = [5u8; 32];

        let listener = SessionListener::new(supervisor.clone());
        listener.register(fake_handle());
        listener.on_client_connected(peer).await;

        assert_eq!(supervisor.connected_peers().await, vec![peer]);
        assert_eq!(upstream.connected.load(Ordering::SeqCst), 1);

        listener.on_connection_closed(peer).await;

        assert!(supervisor.connected_peers().await.is_empty());
        assert_eq!(upstream.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_generation_never_evicts_a_newer_session() {
        let local_kp = KeyPair::generate();
        let upstream = Arc::new(RecordingListener::default());
        let supervisor = make_supervisor(&local_kp, [0u8; 32], upstream);
        let peer = [6u8; 32];

        let first = SessionListener::new(supervisor.clone());
        first.register(fake_handle());
        first.on_client_connected(peer).await;

        let second = SessionListener::new(supervisor.clone());
        second.register(fake_handle());
        second.on_client_connected(peer).await;

        // `first`'s late-arriving close must not remove `second`'s entry.
        first.on_connection_closed(peer).await;
        assert_eq!(supervisor.connected_peers().await, vec![peer]);

        second.on_connection_closed(peer).await;
        assert!(supervisor.connected_peers().await.is_empty());
    }

    #[tokio::test]
    async fn full_handshake_through_accept_loop_registers_session() {
        let local_kp = KeyPair::generate();
        let remote_kp = KeyPair::generate();
        let upstream = Arc::new(RecordingListener::default());
        let supervisor = make_supervisor(&local_kp, [0u8; 32], upstream.clone());

        let (conn_local, conn_remote) = paired_conns();
        supervisor.transport.push_inbound(conn_local, [0u8; 32]).await;

        let accept_task = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.run_accept_loop().await })
        };

        let remote_listener = Arc::new(RecordingListener::default());
        let (outbound_session, _outbound_handle) = Session::new_outbound(
            conn_remote,
            remote_kp.verifying_key.to_bytes(),
            remote_kp.signing_key.clone(),
            local_kp.verifying_key.to_bytes(),
            2,
            [0u8; 32],
            remote_listener,
        );
        let outbound_task = tokio::spawn(async move { outbound_session.run().await });

        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(
            supervisor.connected_peers().await,
            vec![remote_kp.verifying_key.to_bytes()]
        );
        assert_eq!(upstream.connected.load(Ordering::SeqCst), 1);

        accept_task.abort();
        outbound_task.abort();
    }

    #[tokio::test]
    async fn send_if_connected_returns_false_with_no_session() {
        let local_kp = KeyPair::generate();
        let upstream = Arc::new(RecordingListener::default());
        let supervisor = make_supervisor(&local_kp, [0u8; 32], upstream);
        let message = OutboundMessage {
            guid: 1,
            reply_to: 0,
            send_time: 0,
            edit_time: 0,
            msg_type: 0,
            data: Vec::new(),
        };
        assert!(!supervisor.send_if_connected(&[1u8; 32], message).await);
    }

    #[tokio::test]
    async fn pending_scan_with_no_contacts_is_a_no_op() {
        let local_kp = KeyPair::generate();
        let upstream = Arc::new(RecordingListener::default());
        let supervisor = make_supervisor(&local_kp, [0u8; 32], upstream);
        supervisor.clone().scan_pending_once().await.expect("scan ok");
        assert!(supervisor.connections.lock().await.is_empty());
    }

    #[tokio::test]
    async fn pending_scan_dials_a_contact_with_no_candidates_and_fails_gracefully() {
        let local_kp = KeyPair::generate();
        let upstream = Arc::new(RecordingListener::default());
        let supervisor = make_supervisor(&local_kp, [0u8; 32], upstream);
        let contact = [7u8; 32];
        supervisor
            .storage
            .contacts_with_unsent
            .lock()
            .await
            .push(contact);

        supervisor.clone().scan_pending_once().await.expect("scan ok");
        tokio::time::sleep(Duration::from_millis(50)).await;

        // No cached addresses and an empty tracker list: the dial
        // attempt fails with `NoCandidates` and never connects.
        assert!(supervisor.connections.lock().await.is_empty());
        assert!(!supervisor.connecting.lock().await.contains(&contact));
    }

    #[tokio::test]
    async fn overlay_address_change_tears_down_sessions() {
        let local_kp = KeyPair::generate();
        let upstream = Arc::new(RecordingListener::default());
        let supervisor = make_supervisor(&local_kp, [1u8; 32], upstream.clone());

        let peer = [2u8; 32];
        let listener = SessionListener::new(supervisor.clone());
        listener.register(fake_handle());
        supervisor
            .connections
            .lock()
            .await
            .insert(peer, (0, listener.handle()));

        *supervisor.last_overlay_address.lock().await = [1u8; 32];
        *supervisor.transport.public_key.lock().await = [9u8; 32];
        supervisor.check_overlay_address_change().await;

        // The handle itself doesn't expose whether `stop()` ran, but the
        // address bookkeeping must have updated regardless.
        assert_eq!(*supervisor.last_overlay_address.lock().await, [9u8; 32]);
    }

    fn fake_handle() -> SessionHandle {
        let kp = KeyPair::generate();
        let (_session, handle) = Session::new_outbound(
            FakeConn,
            kp.verifying_key.to_bytes(),
            kp.signing_key.clone(),
            [0u8; 32],
            0,
            [0u8; 32],
            Arc::new(RecordingListener::default()),
        );
        handle
    }

    struct FakeConn;

    #[async_trait]
    impl Connection for FakeConn {
        type Error = MemConnError;
        async fn write(&mut self, _data: &[u8]) -> std::result::Result<(), Self::Error> {
            Ok(())
        }
        async fn read(&mut self, _buf: &mut [u8]) -> std::result::Result<usize, Self::Error> {
            std::future::pending().await
        }
        async fn read_with_timeout(
            &mut self,
            _buf: &mut [u8],
            _timeout_ms: u64,
        ) -> std::result::Result<Option<usize>, Self::Error> {
            Ok(None)
        }
        async fn close(&mut self) {}
    }
}
