use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mimir_codec::mediator::{self, Request, Response};
use mimir_crypto::ed25519::SigningKey;
use mimir_types::model::{Invite, PeerKey};
use mimir_types::traits::{Connection, Transport};
use tokio::sync::{oneshot, Mutex, Notify};
use tracing::warn;

use crate::wire;
use crate::{MediatorError, Result};

/// Request/response deadline (Section 5 "Cancellation/timeouts").
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Keepalive cadence: PING is sent after this much inactivity, chosen
/// under the overlay transport's 300s idle limit (Section 4.6).
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(240);

/// How often the keepalive task wakes to check the inactivity clock.
const KEEPALIVE_POLL_INTERVAL: Duration = Duration::from_secs(30);

const READ_POLL_TIMEOUT_MS: u64 = 1000;

/// `create_chat`'s proof-of-work target: the submitted signature's
/// leading bytes must be zero (Section 4.6, Testable Property 9).
pub const PROOF_OF_WORK_PREFIX_ZERO_BYTES: usize = 2;

struct OutboundFrame {
    bytes: Vec<u8>,
}

/// The background read loop's event sink. Kept crate-private and
/// distinct from the public `MediatorListener`: member-info-request
/// pushes and system-vs-regular message classification both need state
/// (subscribers, `InfoProvider`, the mediator's own pubkey) that only
/// `MediatorManager` (C7) holds; the bare client (C6) just demultiplexes
/// the wire.
#[async_trait]
pub(crate) trait ClientEvents: Send + Sync {
    async fn on_group_message(&self, mediator_pubkey: PeerKey, msg: wire::WireGroupMessage);
    async fn on_invite(&self, mediator_pubkey: PeerKey, invite: Invite);
    async fn on_member_info_request(&self, mediator_pubkey: PeerKey, chat_id: u64, last_update: u64);
    async fn on_disconnected(&self, mediator_pubkey: PeerKey, reason: String);
}

/// A single persistent, authenticated, multiplexed session to one
/// mediator (Section 4.6, C6).
pub struct MediatorClient {
    pub mediator_pubkey: PeerKey,
    local_pubkey: PeerKey,
    signing_key: SigningKey,
    out_queue: Arc<Mutex<VecDeque<OutboundFrame>>>,
    out_notify: Arc<Notify>,
    pending: Arc<Mutex<HashMap<u16, oneshot::Sender<Response>>>>,
    next_req_id: AtomicU64,
    running: Arc<AtomicBool>,
    stop: Arc<Notify>,
    last_activity: Arc<StdMutex<Instant>>,
}

impl MediatorClient {
    /// Open a connection to `mediator_pubkey`, select the mediator
    /// protocol, mutually authenticate, then spawn the background
    /// read/write loop and the keepalive task.
    pub(crate) async fn connect<T: Transport + 'static>(
        transport: Arc<T>,
        mediator_pubkey: PeerKey,
        local_pubkey: PeerKey,
        signing_key: SigningKey,
        events: Arc<dyn ClientEvents>,
    ) -> Result<Arc<Self>> {
        let mut conn = transport
            .connect(&mediator_pubkey)
            .await
            .map_err(|e| MediatorError::Io(e.to_string()))?;
        conn.write(&[mediator::PROTOCOL_SELECTOR])
            .await
            .map_err(|e| MediatorError::Io(e.to_string()))?;

        let nonce = handshake_get_nonce(&mut conn, &local_pubkey).await?;
        let sig = signing_key.sign(&nonce);
        let auth_payload = wire::encode_auth(&local_pubkey, &nonce, &sig.to_bytes());
        send_handshake_request(&mut conn, wire::CMD_AUTH, 1, &auth_payload).await?;
        let resp = recv_handshake_response(&mut conn).await?;
        if !resp.is_ok() {
            return Err(MediatorError::AuthFail);
        }

        let out_queue = Arc::new(Mutex::new(VecDeque::new()));
        let out_notify = Arc::new(Notify::new());
        let pending = Arc::new(Mutex::new(HashMap::new()));
        let running = Arc::new(AtomicBool::new(true));
        let stop = Arc::new(Notify::new());
        let last_activity = Arc::new(StdMutex::new(Instant::now()));

        let client = Arc::new(Self {
            mediator_pubkey,
            local_pubkey,
            signing_key,
            out_queue: out_queue.clone(),
            out_notify: out_notify.clone(),
            pending: pending.clone(),
            next_req_id: AtomicU64::new(2),
            running: running.clone(),
            stop: stop.clone(),
            last_activity: last_activity.clone(),
        });

        tokio::spawn(run_loop(
            conn,
            out_queue,
            out_notify,
            pending,
            running,
            stop,
            last_activity,
            events,
            mediator_pubkey,
        ));
        tokio::spawn(keepalive_loop(Arc::downgrade(&client)));

        Ok(client)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ask the background loop to close the socket. Idempotent.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.stop.notify_one();
    }

    async fn request(&self, cmd: u8, payload: Vec<u8>) -> Result<Response> {
        if !self.is_running() {
            return Err(MediatorError::NotRunning);
        }
        let (req_id, rx) = {
            let mut pending = self.pending.lock().await;
            let mut req_id;
            loop {
                req_id = (self.next_req_id.fetch_add(1, Ordering::Relaxed) & 0xffff) as u16;
                if req_id != 0 && !mediator::is_push(req_id) && !pending.contains_key(&req_id) {
                    break;
                }
            }
            let (tx, rx) = oneshot::channel();
            pending.insert(req_id, tx);
            (req_id, rx)
        };

        *self.last_activity.lock().expect("last_activity mutex poisoned") = Instant::now();
        let req = Request { cmd, req_id, payload };
        self.out_queue
            .lock()
            .await
            .push_back(OutboundFrame { bytes: mediator::encode_request(&req) });
        self.out_notify.notify_one();

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(resp)) => {
                if resp.is_ok() {
                    Ok(resp)
                } else {
                    Err(MediatorError::Rejected(resp.error_message().unwrap_or_default()))
                }
            }
            Ok(Err(_)) => Err(MediatorError::Timeout),
            Err(_) => {
                self.pending.lock().await.remove(&req_id);
                Err(MediatorError::Timeout)
            }
        }
    }

    /// Create a chat, computing the proof-of-work signature locally
    /// before submitting (Section 4.6 "Create-chat proof-of-work").
    pub async fn create_chat(&self, name: &str, description: &str) -> Result<(u64, [u8; 32])> {
        let nonce_resp = self
            .request(wire::CMD_GET_NONCE, wire::encode_get_nonce(&self.local_pubkey))
            .await?;
        let nonce = wire::decode_nonce(&nonce_resp.payload)?;
        let (counter, sig) = find_proof_of_work(&self.signing_key, &nonce);
        let payload = wire::encode_create_chat(&nonce, counter, &sig.to_bytes(), name, description);
        let resp = self.request(wire::CMD_CREATE_CHAT, payload).await?;
        wire::decode_create_chat_reply(&resp.payload)
    }

    pub async fn delete_chat(&self, chat_id: u64) -> Result<()> {
        self.request(wire::CMD_DELETE_CHAT, wire::encode_chat_id(chat_id)).await?;
        Ok(())
    }

    pub async fn add_user(&self, chat_id: u64, user: &PeerKey) -> Result<()> {
        self.request(wire::CMD_ADD_USER, wire::encode_add_or_delete_user(chat_id, user))
            .await?;
        Ok(())
    }

    pub async fn delete_user(&self, chat_id: u64, user: &PeerKey) -> Result<()> {
        self.request(wire::CMD_DELETE_USER, wire::encode_add_or_delete_user(chat_id, user))
            .await?;
        Ok(())
    }

    pub async fn leave_chat(&self, chat_id: u64) -> Result<()> {
        self.request(wire::CMD_LEAVE_CHAT, wire::encode_chat_id(chat_id)).await?;
        Ok(())
    }

    /// Subscribe to `chat_id`; returns the mediator's current
    /// `last_server_msg_id` for backfill comparison (Section 4.7).
    pub async fn subscribe(&self, chat_id: u64) -> Result<u64> {
        let resp = self.request(wire::CMD_SUBSCRIBE, wire::encode_chat_id(chat_id)).await?;
        wire::decode_u64_reply(&resp.payload)
    }

    pub async fn get_last_message_id(&self, chat_id: u64) -> Result<u64> {
        let resp = self
            .request(wire::CMD_GET_LAST_MESSAGE_ID, wire::encode_chat_id(chat_id))
            .await?;
        wire::decode_u64_reply(&resp.payload)
    }

    /// Fetch messages strictly after `since_id`, capped at 500 per page
    /// (Section 4.7 backfill).
    pub async fn get_messages_since(
        &self,
        chat_id: u64,
        since_id: u64,
        limit: u32,
    ) -> Result<Vec<wire::WireGroupMessage>> {
        let resp = self
            .request(
                wire::CMD_GET_MESSAGES_SINCE,
                wire::encode_get_messages_since(chat_id, since_id, limit.min(500)),
            )
            .await?;
        wire::decode_messages_since_reply(&resp.payload)
    }

    pub async fn send_message(&self, chat_id: u64, guid: u64, blob: &[u8]) -> Result<u64> {
        let resp = self
            .request(wire::CMD_SEND_MESSAGE, wire::encode_send_message(chat_id, guid, blob))
            .await?;
        wire::decode_u64_reply(&resp.payload)
    }

    pub async fn send_invite(&self, chat_id: u64, invitee: &PeerKey, shared_key: &[u8; 32]) -> Result<()> {
        self.request(
            wire::CMD_SEND_INVITE,
            wire::encode_send_invite(chat_id, invitee, shared_key),
        )
        .await?;
        Ok(())
    }

    pub async fn respond_to_invite(&self, chat_id: u64, accepted: bool) -> Result<()> {
        self.request(
            wire::CMD_RESPOND_TO_INVITE,
            wire::encode_respond_to_invite(chat_id, accepted),
        )
        .await?;
        Ok(())
    }

    /// Push a freshly encrypted member-profile blob (Section 4.7
    /// "Member-info request handling" is the caller's job: this just
    /// ships the already-encrypted bytes).
    pub async fn update_member_info(&self, chat_id: u64, encrypted_blob: &[u8]) -> Result<()> {
        self.request(
            wire::CMD_UPDATE_MEMBER_INFO,
            wire::encode_update_member_info(chat_id, encrypted_blob),
        )
        .await?;
        Ok(())
    }

    pub async fn get_members_info(&self, chat_id: u64, since_ts: u64) -> Result<Vec<wire::WireMemberInfo>> {
        let resp = self
            .request(wire::CMD_GET_MEMBERS_INFO, wire::encode_get_members_info(chat_id, since_ts))
            .await?;
        wire::decode_members_info_reply(&resp.payload)
    }

    pub async fn get_members(&self, chat_id: u64) -> Result<Vec<wire::WireMember>> {
        let resp = self.request(wire::CMD_GET_MEMBERS, wire::encode_chat_id(chat_id)).await?;
        wire::decode_members_reply(&resp.payload)
    }

    pub async fn ping(&self) -> Result<()> {
        self.request(wire::CMD_PING, Vec::new()).await?;
        Ok(())
    }
}

/// Find the smallest `counter` (starting from 0) for which
/// `sign(nonce || counter)` begins with [`PROOF_OF_WORK_PREFIX_ZERO_BYTES`]
/// zero bytes (Section 4.6, Testable Property 9). Pure and
/// network-free so it can be exercised directly in tests.
fn find_proof_of_work(
    signing_key: &SigningKey,
    nonce: &[u8; 32],
) -> (u32, mimir_crypto::ed25519::Signature) {
    let mut counter: u32 = 0;
    loop {
        let mut msg = Vec::with_capacity(36);
        msg.extend_from_slice(nonce);
        msg.extend_from_slice(&counter.to_be_bytes());
        let sig = signing_key.sign(&msg);
        let bytes = sig.to_bytes();
        if bytes[..PROOF_OF_WORK_PREFIX_ZERO_BYTES].iter().all(|b| *b == 0) {
            return (counter, sig);
        }
        counter = counter.wrapping_add(1);
    }
}

async fn handshake_get_nonce<C: Connection>(conn: &mut C, local_pubkey: &PeerKey) -> Result<[u8; 32]> {
    send_handshake_request(conn, wire::CMD_GET_NONCE, 1, &wire::encode_get_nonce(local_pubkey)).await?;
    let resp = recv_handshake_response(conn).await?;
    if !resp.is_ok() {
        return Err(MediatorError::AuthFail);
    }
    wire::decode_nonce(&resp.payload)
}

async fn send_handshake_request<C: Connection>(
    conn: &mut C,
    cmd: u8,
    req_id: u16,
    payload: &[u8],
) -> Result<()> {
    let req = Request { cmd, req_id, payload: payload.to_vec() };
    let bytes = mediator::encode_request(&req);
    conn.write(&bytes).await.map_err(|e| MediatorError::Io(e.to_string()))
}

async fn recv_handshake_response<C: Connection>(conn: &mut C) -> Result<Response> {
    let mut buf = Vec::new();
    loop {
        if let Some((_, resp)) = mediator::try_decode_response(&buf)? {
            return Ok(resp);
        }
        let mut scratch = [0u8; 1024];
        let n = conn.read(&mut scratch).await.map_err(|e| MediatorError::Io(e.to_string()))?;
        if n == 0 {
            return Err(MediatorError::Io("mediator closed connection during handshake".into()));
        }
        buf.extend_from_slice(&scratch[..n]);
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_loop<C: Connection>(
    mut conn: C,
    out_queue: Arc<Mutex<VecDeque<OutboundFrame>>>,
    out_notify: Arc<Notify>,
    pending: Arc<Mutex<HashMap<u16, oneshot::Sender<Response>>>>,
    running: Arc<AtomicBool>,
    stop: Arc<Notify>,
    last_activity: Arc<StdMutex<Instant>>,
    events: Arc<dyn ClientEvents>,
    mediator_pubkey: PeerKey,
) {
    let mut buf = Vec::new();
    let disconnect_reason: String = 'run: loop {
        if !running.load(Ordering::SeqCst) {
            break 'run "stopped by caller".to_string();
        }
        while let Some(frame) = out_queue.lock().await.pop_front() {
            if let Err(e) = conn.write(&frame.bytes).await {
                break 'run format!("write error: {e}");
            }
        }

        let mut scratch = [0u8; 4096];
        tokio::select! {
            biased;
            _ = stop.notified() => {
                break 'run "stopped by caller".to_string();
            }
            _ = out_notify.notified() => {
                continue 'run;
            }
            read_result = conn.read_with_timeout(&mut scratch, READ_POLL_TIMEOUT_MS) => {
                match read_result {
                    Ok(Some(0)) => break 'run "mediator closed the connection".to_string(),
                    Ok(Some(n)) => {
                        *last_activity.lock().expect("last_activity mutex poisoned") = Instant::now();
                        buf.extend_from_slice(&scratch[..n]);
                        if let Err(e) = drain_frames(&mut buf, &pending, &events, mediator_pubkey).await {
                            break 'run format!("decode error: {e}");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => break 'run format!("read error: {e}"),
                }
            }
        }
    };

    running.store(false, Ordering::SeqCst);
    conn.close().await;
    pending.lock().await.clear();
    events.on_disconnected(mediator_pubkey, disconnect_reason).await;
}

async fn drain_frames(
    buf: &mut Vec<u8>,
    pending: &Arc<Mutex<HashMap<u16, oneshot::Sender<Response>>>>,
    events: &Arc<dyn ClientEvents>,
    mediator_pubkey: PeerKey,
) -> Result<()> {
    loop {
        let decoded = mediator::try_decode_response(buf)?;
        let (consumed, resp) = match decoded {
            Some(v) => v,
            None => return Ok(()),
        };
        buf.drain(..consumed);
        if mediator::is_push(resp.req_id) {
            dispatch_push(resp, events, mediator_pubkey).await;
        } else if let Some(tx) = pending.lock().await.remove(&resp.req_id) {
            let _ = tx.send(resp);
        } else {
            warn!(req_id = resp.req_id, "mediator response for unknown req_id, dropping");
        }
    }
}

async fn dispatch_push(resp: Response, events: &Arc<dyn ClientEvents>, mediator_pubkey: PeerKey) {
    match resp.req_id {
        mediator::PUSH_GROUP_MESSAGE | mediator::PUSH_MESSAGE => {
            let mut buf = resp.payload.as_slice();
            match wire::decode_group_message(&mut buf) {
                Ok(msg) => events.on_group_message(mediator_pubkey, msg).await,
                Err(e) => warn!(error = %e, "dropping malformed group-message push"),
            }
        }
        mediator::PUSH_INVITE => match wire::decode_invite_push(&resp.payload) {
            Ok((chat_id, inviter, invitee, shared_key, created_at)) => {
                events
                    .on_invite(
                        mediator_pubkey,
                        Invite { chat_id, inviter, invitee, shared_key, created_at },
                    )
                    .await;
            }
            Err(e) => warn!(error = %e, "dropping malformed invite push"),
        },
        mediator::PUSH_MEMBER_INFO_REQUEST => match wire::decode_member_info_request_push(&resp.payload) {
            Ok((chat_id, last_update)) => {
                events.on_member_info_request(mediator_pubkey, chat_id, last_update).await;
            }
            Err(e) => warn!(error = %e, "dropping malformed member-info-request push"),
        },
        _ => {}
    }
}

async fn keepalive_loop(client: Weak<MediatorClient>) {
    loop {
        tokio::time::sleep(KEEPALIVE_POLL_INTERVAL).await;
        let Some(client) = client.upgrade() else {
            return;
        };
        if !client.is_running() {
            return;
        }
        let idle = client
            .last_activity
            .lock()
            .expect("last_activity mutex poisoned")
            .elapsed();
        if idle >= KEEPALIVE_INTERVAL && client.ping().await.is_err() {
            client.stop();
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proof_of_work_signature_has_zero_prefix() {
        let key = SigningKey::generate();
        let nonce = [7u8; 32];
        let (counter, sig) = find_proof_of_work(&key, &nonce);
        let mut msg = Vec::new();
        msg.extend_from_slice(&nonce);
        msg.extend_from_slice(&counter.to_be_bytes());
        assert!(key.verifying_key().verify(&msg, &sig).is_ok());
        let bytes = sig.to_bytes();
        assert_eq!(bytes[0], 0);
        assert_eq!(bytes[1], 0);
    }

    #[test]
    fn proof_of_work_terminates_from_zero() {
        let key = SigningKey::generate();
        let nonce = [3u8; 32];
        let (counter, _sig) = find_proof_of_work(&key, &nonce);
        // Incrementing from 0 must reach a solution in a bounded number
        // of tries (Testable Property 9); a few million is generous
        // slack over the ~64k expected case.
        assert!(counter < 5_000_000);
    }
}
