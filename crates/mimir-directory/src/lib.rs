//! # mimir-directory
//!
//! The tracker (directory) client (Section 4.3, C3): announces this
//! node's overlay address to the best-ranked tracker, resolves a peer's
//! current addresses, and keeps a latency-ranked list of known trackers.
//!
//! The tracker protocol is request/response with no pipelining: one
//! in-flight request per client, serialized by a single mutex (Section
//! 4.3 "Concurrency"). Packets are authenticated (every `ANNOUNCE` is
//! signed) but not encrypted — per the spec's Non-goals, the tracker
//! protocol carries no confidentiality or forward secrecy.

use std::sync::Arc;
use std::time::{Duration, Instant};

use mimir_codec::tracker::{self, TrackerRecord, TrackerRequest, TrackerResponse};
use mimir_crypto::ed25519::{Signature, SigningKey, VerifyingKey};
use mimir_types::model::{OverlayAddress, Peer, PeerKey};
use mimir_types::traits::{Connection, ResolverReceiver, Transport};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Bounded request/response deadline for every tracker exchange
/// (Section 5 "Cancellation/timeouts").
pub const REQUEST_TIMEOUT: Duration = Duration::from_millis(1500);

/// Penalty applied to a tracker's score after a failed attempt
/// (Section 4.3).
pub const FAILURE_PENALTY_MS: f64 = 25.0;

/// Errors raised by the directory client. Recovery policy matches
/// Section 7.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    /// The 1.5s request deadline elapsed. Policy: penalize the tracker
    /// that was tried; the caller may retry against a different one.
    #[error("tracker request timed out")]
    Timeout,

    /// The underlying connection failed.
    #[error("tracker connection error: {0}")]
    Io(String),

    /// A response frame failed to decode.
    #[error("malformed tracker response: {0}")]
    Malformed(String),

    /// No tracker is registered to try.
    #[error("no trackers configured")]
    NoTrackers,
}

impl From<mimir_codec::FrameError> for DirectoryError {
    fn from(e: mimir_codec::FrameError) -> Self {
        match e {
            mimir_codec::FrameError::Io(io) => DirectoryError::Io(io.to_string()),
            other => DirectoryError::Malformed(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, DirectoryError>;

/// A tracker's observed-latency score (Section 4.3).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrackerScore {
    pub pubkey: PeerKey,
    /// Lower is better. Updated with measured RTT on success, penalized
    /// by [`FAILURE_PENALTY_MS`] on failure.
    pub score_ms: f64,
}

/// An ordered list of trackers with latency-ranked selection.
///
/// `best_tracker` is a stable lowest-score scan (strict `<`, never `<=`)
/// so ties resolve to the first-registered tracker, matching Testable
/// Property's "stable on ties" requirement.
#[derive(Clone, Debug, Default)]
pub struct TrackerList {
    trackers: Vec<TrackerScore>,
}

impl TrackerList {
    pub fn new(pubkeys: impl IntoIterator<Item = PeerKey>) -> Self {
        Self {
            trackers: pubkeys
                .into_iter()
                .map(|pubkey| TrackerScore {
                    pubkey,
                    score_ms: 0.0,
                })
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }

    /// The lowest-scoring tracker, or `None` if the list is empty.
    pub fn best_tracker(&self) -> Option<PeerKey> {
        let mut best: Option<&TrackerScore> = None;
        for candidate in &self.trackers {
            match best {
                None => best = Some(candidate),
                Some(current) if candidate.score_ms < current.score_ms => best = Some(candidate),
                _ => {}
            }
        }
        best.map(|t| t.pubkey)
    }

    pub fn penalize(&mut self, pubkey: &PeerKey) {
        if let Some(t) = self.trackers.iter_mut().find(|t| &t.pubkey == pubkey) {
            t.score_ms += FAILURE_PENALTY_MS;
        }
    }

    pub fn record_rtt(&mut self, pubkey: &PeerKey, rtt_ms: f64) {
        if let Some(t) = self.trackers.iter_mut().find(|t| &t.pubkey == pubkey) {
            t.score_ms = rtt_ms;
        }
    }

    pub fn scores(&self) -> &[TrackerScore] {
        &self.trackers
    }
}

/// Accumulate bytes from a [`Connection`] until a complete tracker
/// response has been read, or the deadline elapses.
async fn read_response_with_deadline<C: Connection>(
    conn: &mut C,
    deadline: Duration,
) -> Result<(u32, u8, TrackerResponse)> {
    let start = Instant::now();
    let mut buf = Vec::new();
    loop {
        if let Some((_, nonce, cmd, resp)) = tracker::try_decode_response(&buf)? {
            return Ok((nonce, cmd, resp));
        }
        let remaining = deadline
            .checked_sub(start.elapsed())
            .ok_or(DirectoryError::Timeout)?;
        let mut scratch = [0u8; 1024];
        let read = tokio::time::timeout(remaining, conn.read(&mut scratch))
            .await
            .map_err(|_| DirectoryError::Timeout)?
            .map_err(|e| DirectoryError::Io(e.to_string()))?;
        if read == 0 {
            return Err(DirectoryError::Io("tracker closed connection".into()));
        }
        buf.extend_from_slice(&scratch[..read]);
    }
}

/// The directory (tracker) client (Section 4.3, C3).
pub struct DirectoryClient<T: Transport> {
    transport: Arc<T>,
    trackers: Mutex<TrackerList>,
    local_pubkey: PeerKey,
    signing_key: SigningKey,
    receiver: Arc<dyn ResolverReceiver>,
    /// Serializes the whole request path: one in-flight tracker request
    /// at a time (Section 4.3 "Concurrency").
    request_lock: Mutex<()>,
}

impl<T: Transport> DirectoryClient<T> {
    pub fn new(
        transport: Arc<T>,
        trackers: TrackerList,
        local_pubkey: PeerKey,
        signing_key: SigningKey,
        receiver: Arc<dyn ResolverReceiver>,
    ) -> Self {
        Self {
            transport,
            trackers: Mutex::new(trackers),
            local_pubkey,
            signing_key,
            receiver,
            request_lock: Mutex::new(()),
        }
    }

    pub async fn best_tracker(&self) -> Option<PeerKey> {
        self.trackers.lock().await.best_tracker()
    }

    pub async fn scores(&self) -> Vec<TrackerScore> {
        self.trackers.lock().await.scores().to_vec()
    }

    /// Announce this node's current overlay address to the best tracker
    /// (Section 4.3). Re-announcing at the returned `ttl` cadence is the
    /// caller's responsibility.
    pub async fn announce(
        &self,
        address: OverlayAddress,
        priority: u8,
        client_id: u32,
    ) -> Result<u64> {
        let _guard = self.request_lock.lock().await;
        let tracker = self
            .best_tracker()
            .await
            .ok_or(DirectoryError::NoTrackers)?;
        let signature = self.signing_key.sign(&address);
        let req = TrackerRequest::Announce {
            pubkey: self.local_pubkey,
            priority,
            client_id,
            addr: address,
            signature: signature.to_bytes(),
        };
        match self.exchange(tracker, &req).await {
            Ok((_, TrackerResponse::AnnounceAck { ttl })) => {
                self.receiver.on_announce(ttl).await;
                Ok(ttl)
            }
            Ok((_, other)) => Err(DirectoryError::Malformed(format!(
                "expected AnnounceAck, got {other:?}"
            ))),
            Err(e) => {
                self.trackers.lock().await.penalize(&tracker);
                self.receiver.on_error().await;
                Err(e)
            }
        }
    }

    /// Resolve a peer's currently announced addresses (Section 4.3).
    /// Records whose signature does not verify under `pubkey` are
    /// silently dropped (never returned, never penalize the tracker). An
    /// all-invalid or empty reply fires `on_error` (Testable Property
    /// 10).
    pub async fn resolve_addrs(&self, pubkey: PeerKey) -> Result<Vec<Peer>> {
        let _guard = self.request_lock.lock().await;
        let tracker = self
            .best_tracker()
            .await
            .ok_or(DirectoryError::NoTrackers)?;
        let req = TrackerRequest::GetAddrs { pubkey };
        let records = match self.exchange(tracker, &req).await {
            Ok((_, TrackerResponse::GetAddrsReply { records })) => records,
            Ok((_, other)) => {
                return Err(DirectoryError::Malformed(format!(
                    "expected GetAddrsReply, got {other:?}"
                )))
            }
            Err(e) => {
                self.trackers.lock().await.penalize(&tracker);
                self.receiver.on_error().await;
                return Err(e);
            }
        };

        let verifying_key = match VerifyingKey::from_bytes(&pubkey) {
            Ok(vk) => vk,
            Err(_) => {
                self.receiver.on_error().await;
                return Ok(Vec::new());
            }
        };

        let peers: Vec<Peer> = records
            .into_iter()
            .filter_map(|r| verified_peer(&verifying_key, &r))
            .collect();

        if peers.is_empty() {
            self.receiver.on_error().await;
        }
        Ok(peers)
    }

    async fn exchange(
        &self,
        tracker: PeerKey,
        req: &TrackerRequest,
    ) -> Result<(u32, TrackerResponse)> {
        let mut conn = self
            .transport
            .connect(&tracker)
            .await
            .map_err(|e| DirectoryError::Io(e.to_string()))?;
        let started = Instant::now();
        let nonce = rand_nonce();
        let buf = tracker::encode_request(nonce, req);
        tokio::time::timeout(REQUEST_TIMEOUT, conn.write(&buf))
            .await
            .map_err(|_| DirectoryError::Timeout)?
            .map_err(|e| DirectoryError::Io(e.to_string()))?;
        let remaining = REQUEST_TIMEOUT
            .checked_sub(started.elapsed())
            .unwrap_or(Duration::ZERO);
        let (resp_nonce, _cmd, resp) = read_response_with_deadline(&mut conn, remaining).await?;
        conn.close().await;
        if resp_nonce != nonce {
            return Err(DirectoryError::Malformed(
                "tracker response nonce mismatch".into(),
            ));
        }
        let rtt_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.trackers.lock().await.record_rtt(&tracker, rtt_ms);
        debug!(tracker = ?tracker, rtt_ms, "tracker exchange completed");
        Ok((resp_nonce, resp))
    }
}

fn verified_peer(verifying_key: &VerifyingKey, record: &TrackerRecord) -> Option<Peer> {
    let signature = Signature::from_bytes(&record.signature);
    if verifying_key.verify(&record.addr, &signature).is_err() {
        warn!("dropping tracker record with invalid signature");
        return None;
    }
    Some(Peer {
        overlay_address: record.addr,
        client_id: record.client_id,
        priority: record.priority,
        expiration: record.ttl,
    })
}

fn rand_nonce() -> u32 {
    let bytes = mimir_crypto::random_bytes(4);
    u32::from_be_bytes(bytes.try_into().expect("4 random bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn best_tracker_prefers_lowest_score_stable_on_ties() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        let c = [3u8; 32];
        let mut list = TrackerList::new([a, b, c]);
        assert_eq!(list.best_tracker(), Some(a));
        list.record_rtt(&b, 10.0);
        // a and c are both still at 0.0; a (registered first) wins the tie.
        assert_eq!(list.best_tracker(), Some(a));
        list.record_rtt(&a, 10.0);
        list.record_rtt(&b, 50.0);
        // a=10.0, b=50.0, c=0.0: c is now the sole lowest score.
        assert_eq!(list.best_tracker(), Some(c));
    }

    #[test]
    fn penalize_increases_score() {
        let a = [1u8; 32];
        let mut list = TrackerList::new([a]);
        list.penalize(&a);
        assert_eq!(list.scores()[0].score_ms, FAILURE_PENALTY_MS);
        list.penalize(&a);
        assert_eq!(list.scores()[0].score_ms, FAILURE_PENALTY_MS * 2.0);
    }

    #[test]
    fn empty_list_has_no_best_tracker() {
        let list = TrackerList::default();
        assert_eq!(list.best_tracker(), None);
    }
}
