//! The mediator manager (Section 4.7, C7): a keyed pool of
//! [`MediatorClient`]s plus the reconnect, resubscribe-and-backfill, and
//! push-routing policy layered on top of it.
//!
//! `mimir-server` is this crate's closest relative in shape: both own a
//! collection of per-peer sessions behind a map, and both break the
//! resulting owner/session cycle with a `Weak` back-reference from the
//! session's event sink rather than holding the owner strongly.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use mimir_assembler::AssembledMessage;
use mimir_crypto::ed25519::SigningKey;
use mimir_types::model::{GroupChat, Invite, PeerKey};
use mimir_types::traits::{InfoProvider, MediatorListener, Storage, Transport};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::client::{ClientEvents, MediatorClient};
use crate::wire;
use crate::{MediatorError, Result};

/// Reconnect backoff policy (Section 4.7): doubling from 2s, capped at
/// 60s, abandoned after 30 attempts.
const RECONNECT_INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const RECONNECT_MAX_BACKOFF: Duration = Duration::from_secs(60);
const RECONNECT_MAX_ATTEMPTS: u32 = 30;

/// Backfill page size cap (Section 4.7, matches `MediatorClient`'s own
/// clamp in `get_messages_since`).
const BACKFILL_PAGE_SIZE: u32 = 500;

/// A pool of [`MediatorClient`] sessions, one per mediator this node
/// talks to, plus the policy that keeps chat subscriptions alive across
/// reconnects and routes pushes to the application layer.
///
/// Chat membership and subscription state live in `Storage`, not here:
/// this type holds only the live network sessions and in-flight
/// reconnect tasks, so a restart just reconstructs it from whatever
/// `storage.get_group_chat_list()` already says.
pub struct MediatorManager<T: Transport, S: Storage, I: InfoProvider> {
    transport: Arc<T>,
    storage: Arc<S>,
    info_provider: Arc<I>,
    local_pubkey: PeerKey,
    signing_key: SigningKey,
    attachments_dir: PathBuf,
    upstream: Arc<dyn MediatorListener>,
    clients: Mutex<HashMap<PeerKey, Arc<MediatorClient>>>,
    /// Set by the caller from the peer controller's online/offline
    /// transitions (Section 4.8); gates whether a reconnect backoff loop
    /// keeps trying or cancels (Section 4.7 "if the network is offline,
    /// cancel"). Defaults to `true` so a manager used without a peer
    /// controller wired up behaves as if always online.
    network_online: AtomicBool,
}

impl<T, S, I> MediatorManager<T, S, I>
where
    T: Transport + 'static,
    S: Storage + 'static,
    I: InfoProvider + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<T>,
        storage: Arc<S>,
        info_provider: Arc<I>,
        local_pubkey: PeerKey,
        signing_key: SigningKey,
        attachments_dir: PathBuf,
        upstream: Arc<dyn MediatorListener>,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            storage,
            info_provider,
            local_pubkey,
            signing_key,
            attachments_dir,
            upstream,
            clients: Mutex::new(HashMap::new()),
            network_online: AtomicBool::new(true),
        })
    }

    /// Record the overlay's online/offline state, as observed by the
    /// peer controller (Section 4.8). A reconnect loop in progress checks
    /// this before every retry.
    pub fn set_network_online(&self, online: bool) {
        self.network_online.store(online, Ordering::SeqCst);
    }

    /// Subscribe to and backfill every group chat Storage currently
    /// knows about. Intended to run once at startup.
    pub async fn start(self: &Arc<Self>) {
        let chats = match self.storage.get_group_chat_list().await {
            Ok(chats) => chats,
            Err(e) => {
                warn!(error = %e, "failed to list group chats at startup");
                return;
            }
        };
        for chat in chats {
            if let Err(e) = self.ensure_subscribed(&chat).await {
                warn!(chat_id = chat.chat_id, error = %e, "initial chat subscription failed");
            }
        }
    }

    /// Get the running client for `mediator_pubkey`, connecting and
    /// authenticating a fresh one if none exists or the existing one has
    /// stopped (Section 4.7 "reusing when running").
    pub async fn get_or_create(self: &Arc<Self>, mediator_pubkey: PeerKey) -> Result<Arc<MediatorClient>> {
        let mut clients = self.clients.lock().await;
        if let Some(existing) = clients.get(&mediator_pubkey) {
            if existing.is_running() {
                return Ok(existing.clone());
            }
        }
        let events: Arc<dyn ClientEvents> = Arc::new(ManagerEvents {
            manager: Arc::downgrade(self),
        });
        let client = MediatorClient::connect(
            self.transport.clone(),
            mediator_pubkey,
            self.local_pubkey,
            self.signing_key.clone(),
            events,
        )
        .await?;
        clients.insert(mediator_pubkey, client.clone());
        Ok(client)
    }

    /// Subscribe to `chat`'s mediator and backfill it, firing
    /// `on_chat_reconnected` on success. Safe to call for a chat that is
    /// already subscribed: the mediator side treats `subscribe` as
    /// idempotent.
    pub async fn ensure_subscribed(self: &Arc<Self>, chat: &GroupChat) -> Result<()> {
        let client = self.get_or_create(chat.mediator_pubkey).await?;
        self.resubscribe_and_backfill(chat, &client).await
    }

    async fn resubscribe_and_backfill(&self, chat: &GroupChat, client: &Arc<MediatorClient>) -> Result<()> {
        let server_last_id = client.subscribe(chat.chat_id).await?;
        let mut since = self
            .storage
            .get_group_chat_timestamp(chat.chat_id)
            .await
            .map_err(|e| MediatorError::Storage(e.to_string()))?
            .unwrap_or(0);

        while since < server_last_id {
            let page = client
                .get_messages_since(chat.chat_id, since, BACKFILL_PAGE_SIZE)
                .await?;
            if page.is_empty() {
                break;
            }
            for record in page.iter().cloned() {
                let next_since = record.server_msg_id;
                // Section 9 "Open questions": a backfill record whose own
                // `chat_id` disagrees with the chat we asked for is
                // dropped with a warning rather than treated as fatal —
                // it never advances `since` past records we can trust.
                if record.chat_id != chat.chat_id {
                    warn!(
                        requested = chat.chat_id,
                        record_chat_id = record.chat_id,
                        "get_messages_since record chat_id mismatch, dropping"
                    );
                    since = next_since;
                    continue;
                }
                let raw = to_raw(record);
                if let Err(e) =
                    mimir_assembler::assemble_and_store(&*self.storage, &self.attachments_dir, chat, raw).await
                {
                    warn!(chat_id = chat.chat_id, error = %e, "failed to assemble backfilled message");
                }
                since = next_since;
            }
        }

        let mut updated = chat.clone();
        updated.subscribed = true;
        self.storage
            .upsert_group_chat(updated)
            .await
            .map_err(|e| MediatorError::Storage(e.to_string()))?;
        self.upstream.on_chat_reconnected(chat.chat_id).await;
        Ok(())
    }

    async fn handle_group_message(&self, _mediator_pubkey: PeerKey, msg: wire::WireGroupMessage) {
        let chat = match self.storage.get_group_chat(msg.chat_id).await {
            Ok(Some(chat)) => chat,
            Ok(None) => {
                warn!(chat_id = msg.chat_id, "group message push for unknown chat, dropping");
                return;
            }
            Err(e) => {
                warn!(error = %e, "storage lookup failed for group message push");
                return;
            }
        };
        let raw = to_raw(msg);
        match mimir_assembler::assemble_and_store(&*self.storage, &self.attachments_dir, &chat, raw).await {
            Ok(AssembledMessage::Chat(message)) => {
                self.upstream.on_chat_message(chat.chat_id, message).await;
            }
            Ok(AssembledMessage::System { event, target, actor }) => {
                self.upstream.on_system_event(chat.chat_id, event, target, actor).await;
            }
            // A deletion is invisible (Section 4.7): it already removed
            // the row, and a duplicate is a pure no-op.
            Ok(AssembledMessage::Deleted { .. }) | Ok(AssembledMessage::Duplicate) => {}
            Err(e) => warn!(chat_id = chat.chat_id, error = %e, "failed to assemble inbound group message"),
        }
    }

    async fn handle_member_info_request(&self, mediator_pubkey: PeerKey, chat_id: u64, last_update: u64) {
        let chat = match self.storage.get_group_chat(chat_id).await {
            Ok(Some(chat)) => chat,
            Ok(None) => return,
            Err(e) => {
                warn!(chat_id, error = %e, "storage lookup failed for member-info request");
                return;
            }
        };
        let profile = match self.info_provider.get_my_info(last_update).await {
            Ok(Some(profile)) => profile,
            // Unchanged since `last_update`: no response is sent.
            Ok(None) => return,
            Err(e) => {
                warn!(chat_id, error = %e, "info provider lookup failed for member-info request");
                return;
            }
        };
        let plaintext = match serde_json::to_vec(&profile) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(chat_id, error = %e, "failed to serialize local profile");
                return;
            }
        };
        let encrypted = mimir_crypto::aead::encrypt(&plaintext, &chat.shared_key);
        let client = self.clients.lock().await.get(&mediator_pubkey).cloned();
        let Some(client) = client else {
            return;
        };
        if let Err(e) = client.update_member_info(chat_id, &encrypted).await {
            warn!(chat_id, error = %e, "failed to push member-info update");
        }
    }

    async fn handle_disconnected(self: Arc<Self>, mediator_pubkey: PeerKey, reason: String) {
        warn!(mediator = ?mediator_pubkey, reason, "mediator session disconnected");
        self.clients.lock().await.remove(&mediator_pubkey);
        self.mark_chats_unsubscribed(mediator_pubkey).await;
        self.clone().spawn_reconnect(mediator_pubkey);
    }

    async fn mark_chats_unsubscribed(&self, mediator_pubkey: PeerKey) {
        let Ok(chats) = self.storage.get_group_chat_list().await else {
            return;
        };
        for mut chat in chats.into_iter().filter(|c| c.mediator_pubkey == mediator_pubkey) {
            chat.subscribed = false;
            let _ = self.storage.upsert_group_chat(chat).await;
        }
    }

    fn spawn_reconnect(self: Arc<Self>, mediator_pubkey: PeerKey) {
        tokio::spawn(async move {
            let mut delay = RECONNECT_INITIAL_BACKOFF;
            for attempt in 0..RECONNECT_MAX_ATTEMPTS {
                if !self.network_online.load(Ordering::SeqCst) {
                    debug!(mediator = ?mediator_pubkey, "network offline, cancelling mediator reconnect");
                    return;
                }
                tokio::time::sleep(delay).await;
                if !self.network_online.load(Ordering::SeqCst) {
                    return;
                }
                match self.get_or_create(mediator_pubkey).await {
                    Ok(client) => {
                        debug!(mediator = ?mediator_pubkey, attempt, "reconnected to mediator");
                        self.resubscribe_all_for_mediator(mediator_pubkey, &client).await;
                        return;
                    }
                    Err(e) => {
                        debug!(mediator = ?mediator_pubkey, attempt, error = %e, "mediator reconnect attempt failed");
                    }
                }
                delay = (delay * 2).min(RECONNECT_MAX_BACKOFF);
            }
            warn!(mediator = ?mediator_pubkey, "exhausted mediator reconnect attempts");
        });
    }

    async fn resubscribe_all_for_mediator(&self, mediator_pubkey: PeerKey, client: &Arc<MediatorClient>) {
        let Ok(chats) = self.storage.get_group_chat_list().await else {
            return;
        };
        for chat in chats.into_iter().filter(|c| c.mediator_pubkey == mediator_pubkey) {
            if let Err(e) = self.resubscribe_and_backfill(&chat, client).await {
                warn!(chat_id = chat.chat_id, error = %e, "resubscribe after reconnect failed");
            }
        }
    }
}

fn to_raw(msg: wire::WireGroupMessage) -> mimir_assembler::RawGroupMessage {
    mimir_assembler::RawGroupMessage {
        chat_id: msg.chat_id,
        server_msg_id: msg.server_msg_id,
        guid: msg.guid,
        author: msg.author,
        timestamp: msg.timestamp,
        blob: msg.blob,
    }
}

/// The non-owning side of the manager/client cycle, mirroring
/// `mimir-server`'s `SessionListener`: one instance per live
/// `MediatorClient`, holding only a `Weak` reference back so the client
/// (owned strongly by `clients`) never keeps the manager alive through
/// its own event sink.
struct ManagerEvents<T: Transport, S: Storage, I: InfoProvider> {
    manager: Weak<MediatorManager<T, S, I>>,
}

#[async_trait]
impl<T, S, I> ClientEvents for ManagerEvents<T, S, I>
where
    T: Transport + 'static,
    S: Storage + 'static,
    I: InfoProvider + 'static,
{
    async fn on_group_message(&self, mediator_pubkey: PeerKey, msg: wire::WireGroupMessage) {
        if let Some(manager) = self.manager.upgrade() {
            manager.handle_group_message(mediator_pubkey, msg).await;
        }
    }

    async fn on_invite(&self, _mediator_pubkey: PeerKey, invite: Invite) {
        if let Some(manager) = self.manager.upgrade() {
            manager.upstream.on_invite(invite).await;
        }
    }

    async fn on_member_info_request(&self, mediator_pubkey: PeerKey, chat_id: u64, last_update: u64) {
        if let Some(manager) = self.manager.upgrade() {
            manager
                .handle_member_info_request(mediator_pubkey, chat_id, last_update)
                .await;
        }
    }

    async fn on_disconnected(&self, mediator_pubkey: PeerKey, reason: String) {
        if let Some(manager) = self.manager.upgrade() {
            manager.handle_disconnected(mediator_pubkey, reason).await;
        }
    }
}

/// Reconnect backoff math (Section 8, Testable Property 8), factored out
/// of [`MediatorManager::spawn_reconnect`]'s sleep loop so the doubling
/// and cap can be checked without actually waiting out 30 attempts.
#[cfg(test)]
fn backoff_schedule() -> Vec<Duration> {
    let mut delay = RECONNECT_INITIAL_BACKOFF;
    let mut schedule = Vec::with_capacity(RECONNECT_MAX_ATTEMPTS as usize);
    for _ in 0..RECONNECT_MAX_ATTEMPTS {
        schedule.push(delay);
        delay = (delay * 2).min(RECONNECT_MAX_BACKOFF);
    }
    schedule
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_backoff_doubles_from_2s_and_caps_at_60s_over_30_attempts() {
        let schedule = backoff_schedule();
        assert_eq!(schedule.len(), 30);
        assert_eq!(schedule[0], Duration::from_secs(2));
        assert_eq!(schedule[1], Duration::from_secs(4));
        assert_eq!(schedule[2], Duration::from_secs(8));
        assert_eq!(schedule[3], Duration::from_secs(16));
        assert_eq!(schedule[4], Duration::from_secs(32));
        // 2 * 2^5 = 64s would exceed the cap; it clamps to 60s and stays
        // there for every subsequent attempt.
        for delay in &schedule[5..] {
            assert_eq!(*delay, Duration::from_secs(60));
        }
    }
    use async_trait::async_trait;
    use mimir_crypto::ed25519::KeyPair;
    use mimir_types::model::{Contact, GroupMember, GroupMessage, OutboundMessage, OverlayAddress, Peer, SystemEvent};
    use mimir_types::traits::{Connection, LocalProfile};
    use std::collections::VecDeque as Deque;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Mutex as TMutex;

    #[derive(Debug, thiserror::Error)]
    #[error("mem conn closed")]
    struct MemConnError;

    /// An in-memory duplex `Connection`, the same double `mimir-session`
    /// and `mimir-server` use for full-protocol tests.
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

    /// A `Transport` whose `connect()` hands out a single pre-queued
    /// connection once, mirroring the one-shot dial a test needs.
    struct TestTransport {
        conn: TMutex<Option<MemConn>>,
    }

    #[async_trait]
    impl Transport for TestTransport {
        type Conn = MemConn;
        type Error = MemConnError;

        async fn connect(&self, _peer_pubkey: &PeerKey) -> std::result::Result<Self::Conn, Self::Error> {
            self.conn.lock().await.take().ok_or(MemConnError)
        }

        async fn accept(&self) -> std::result::Result<(Self::Conn, OverlayAddress), Self::Error> {
            std::future::pending().await
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
            [0u8; 32]
        }
    }

    #[derive(Default)]
    struct TestStorage {
        chats: StdMutex<HashMap<u64, GroupChat>>,
        messages: StdMutex<Vec<GroupMessage>>,
    }

    #[async_trait]
    impl Storage for TestStorage {
        type Error = MemConnError;

        async fn get_contacts_with_unsent_messages(&self) -> std::result::Result<Vec<PeerKey>, Self::Error> {
            Ok(vec![])
        }
        async fn get_contact_peers(&self, _pubkey: &PeerKey) -> std::result::Result<Vec<Peer>, Self::Error> {
            Ok(vec![])
        }
        async fn save_ip(
            &self,
            _: &PeerKey,
            _: OverlayAddress,
            _: u32,
            _: u8,
            _: u64,
        ) -> std::result::Result<(), Self::Error> {
            Ok(())
        }
        async fn get_unsent_messages(&self, _pubkey: &PeerKey) -> std::result::Result<Vec<OutboundMessage>, Self::Error> {
            Ok(vec![])
        }
        async fn get_message(&self, _guid: u64) -> std::result::Result<Option<OutboundMessage>, Self::Error> {
            Ok(None)
        }
        async fn mark_delivered(&self, _: &PeerKey, _: u64) -> std::result::Result<(), Self::Error> {
            Ok(())
        }
        async fn get_contact(&self, _pubkey: &PeerKey) -> std::result::Result<Option<Contact>, Self::Error> {
            Ok(None)
        }
        async fn update_contact(&self, _: &PeerKey, _: Contact) -> std::result::Result<(), Self::Error> {
            Ok(())
        }
        async fn get_group_chat(&self, chat_id: u64) -> std::result::Result<Option<GroupChat>, Self::Error> {
            Ok(self.chats.lock().expect("not poisoned").get(&chat_id).cloned())
        }
        async fn get_group_chat_list(&self) -> std::result::Result<Vec<GroupChat>, Self::Error> {
            Ok(self.chats.lock().expect("not poisoned").values().cloned().collect())
        }
        async fn upsert_group_chat(&self, chat: GroupChat) -> std::result::Result<(), Self::Error> {
            self.chats.lock().expect("not poisoned").insert(chat.chat_id, chat);
            Ok(())
        }
        async fn add_group_message(&self, message: GroupMessage) -> std::result::Result<(), Self::Error> {
            self.messages.lock().expect("not poisoned").push(message);
            Ok(())
        }
        async fn delete_group_message_by_guid(&self, chat_id: u64, guid: u64) -> std::result::Result<(), Self::Error> {
            self.messages
                .lock()
                .expect("not poisoned")
                .retain(|m| !(m.chat_id == chat_id && m.guid == guid));
            Ok(())
        }
        async fn check_group_message_exists(&self, chat_id: u64, guid: u64) -> std::result::Result<bool, Self::Error> {
            Ok(self
                .messages
                .lock()
                .expect("not poisoned")
                .iter()
                .any(|m| m.chat_id == chat_id && m.guid == guid))
        }
        async fn get_group_chat_timestamp(&self, chat_id: u64) -> std::result::Result<Option<u64>, Self::Error> {
            Ok(self
                .messages
                .lock()
                .expect("not poisoned")
                .iter()
                .filter(|m| m.chat_id == chat_id)
                .map(|m| m.server_msg_id)
                .max())
        }
        async fn update_group_member_info(&self, _member: GroupMember) -> std::result::Result<(), Self::Error> {
            Ok(())
        }
        async fn get_latest_group_member_update_time(&self, _chat_id: u64) -> std::result::Result<u64, Self::Error> {
            Ok(0)
        }
        async fn update_group_member_online_status(
            &self,
            _: u64,
            _: &PeerKey,
            _: bool,
            _: u64,
        ) -> std::result::Result<(), Self::Error> {
            Ok(())
        }
    }

    struct TestInfoProvider {
        profile: Option<LocalProfile>,
    }

    #[async_trait]
    impl InfoProvider for TestInfoProvider {
        type Error = MemConnError;

        async fn get_my_info(&self, _since: u64) -> std::result::Result<Option<LocalProfile>, Self::Error> {
            Ok(self.profile.clone())
        }
        async fn get_contact_update_time(&self) -> std::result::Result<u64, Self::Error> {
            Ok(0)
        }
        async fn update_contact_info(&self, _: &PeerKey, _: Contact) -> std::result::Result<(), Self::Error> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingListener {
        chat_messages: TMutex<Vec<(u64, GroupMessage)>>,
        system_events: TMutex<Vec<(u64, SystemEvent)>>,
        reconnected: TMutex<Vec<u64>>,
        invites: TMutex<Vec<Invite>>,
    }

    #[async_trait]
    impl MediatorListener for RecordingListener {
        async fn on_chat_message(&self, chat_id: u64, message: GroupMessage) {
            self.chat_messages.lock().await.push((chat_id, message));
        }
        async fn on_system_event(
            &self,
            chat_id: u64,
            event: SystemEvent,
            _target: Option<PeerKey>,
            _actor: Option<PeerKey>,
        ) {
            self.system_events.lock().await.push((chat_id, event));
        }
        async fn on_invite(&self, invite: Invite) {
            self.invites.lock().await.push(invite);
        }
        async fn on_chat_reconnected(&self, chat_id: u64) {
            self.reconnected.lock().await.push(chat_id);
        }
        async fn on_disconnected(&self, _mediator_pubkey: PeerKey, _reason: String) {}
    }

    fn sample_message_text_body(guid: u64) -> Vec<u8> {
        let header = mimir_codec::p2p::MessageTextHeader {
            guid,
            reply_to: None,
            send_time: 100,
            edit_time: None,
            msg_type: 0,
            payload_size: None,
        };
        let encoded = mimir_codec::p2p::encode(
            0,
            &mimir_codec::p2p::P2pMessage::MessageText {
                header,
                payload: Some(b"hi".to_vec()),
            },
        )
        .expect("encodes");
        encoded[16..].to_vec()
    }

    fn sample_chat(chat_id: u64, mediator_pubkey: PeerKey, shared_key: [u8; 32]) -> GroupChat {
        GroupChat {
            chat_id,
            mediator_pubkey,
            shared_key,
            name: "room".into(),
            description: String::new(),
            avatar: None,
            subscribed: false,
            muted: false,
        }
    }

    async fn mem_read_exact(conn: &mut MemConn, n: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            let mut scratch = vec![0u8; n - out.len()];
            let read = conn.read(&mut scratch).await.expect("mem conn read");
            out.extend_from_slice(&scratch[..read]);
        }
        out
    }

    async fn mem_read_request(conn: &mut MemConn) -> (u16, Vec<u8>) {
        let prefix = mem_read_exact(conn, 8).await;
        let req_id = u16::from_be_bytes([prefix[2], prefix[3]]);
        let len = u32::from_be_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]) as usize;
        let payload = mem_read_exact(conn, len).await;
        (req_id, payload)
    }

    async fn mem_write_response(conn: &mut MemConn, req_id: u16, status: u8, payload: Vec<u8>) {
        let mut buf = Vec::with_capacity(7 + payload.len());
        buf.push(status);
        buf.extend_from_slice(&req_id.to_be_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);
        conn.write(&buf).await.expect("mem conn write");
    }

    /// Answers exactly the GET_NONCE/AUTH/SUBSCRIBE/GET_MESSAGES_SINCE
    /// sequence a single `ensure_subscribed` call drives, then goes idle
    /// so the client's background loop doesn't see a spurious EOF.
    async fn run_fake_mediator(mut conn: MemConn, message: wire::WireGroupMessage) {
        let _selector = mem_read_exact(&mut conn, 1).await;

        let (req_id, _get_nonce_payload) = mem_read_request(&mut conn).await;
        mem_write_response(&mut conn, req_id, mimir_codec::mediator::STATUS_OK, [7u8; 32].to_vec()).await;

        let (req_id, _auth_payload) = mem_read_request(&mut conn).await;
        mem_write_response(&mut conn, req_id, mimir_codec::mediator::STATUS_OK, Vec::new()).await;

        let (req_id, _subscribe_payload) = mem_read_request(&mut conn).await;
        mem_write_response(
            &mut conn,
            req_id,
            mimir_codec::mediator::STATUS_OK,
            message.server_msg_id.to_be_bytes().to_vec(),
        )
        .await;

        let (req_id, _get_messages_since_payload) = mem_read_request(&mut conn).await;
        let mut payload = Vec::new();
        payload.extend_from_slice(&1u32.to_be_bytes());
        payload.extend_from_slice(&wire::encode_group_message(&message));
        mem_write_response(&mut conn, req_id, mimir_codec::mediator::STATUS_OK, payload).await;

        std::future::pending::<()>().await;
    }

    /// Same handshake/subscribe sequence as [`run_fake_mediator`], but
    /// answers `GET_MESSAGES_SINCE` with an arbitrary batch of records in
    /// one page, for tests that need more than one backfilled message.
    async fn run_fake_mediator_batch(mut conn: MemConn, server_last_id: u64, messages: Vec<wire::WireGroupMessage>) {
        let _selector = mem_read_exact(&mut conn, 1).await;

        let (req_id, _get_nonce_payload) = mem_read_request(&mut conn).await;
        mem_write_response(&mut conn, req_id, mimir_codec::mediator::STATUS_OK, [7u8; 32].to_vec()).await;

        let (req_id, _auth_payload) = mem_read_request(&mut conn).await;
        mem_write_response(&mut conn, req_id, mimir_codec::mediator::STATUS_OK, Vec::new()).await;

        let (req_id, _subscribe_payload) = mem_read_request(&mut conn).await;
        mem_write_response(
            &mut conn,
            req_id,
            mimir_codec::mediator::STATUS_OK,
            server_last_id.to_be_bytes().to_vec(),
        )
        .await;

        let (req_id, _get_messages_since_payload) = mem_read_request(&mut conn).await;
        let mut payload = Vec::new();
        payload.extend_from_slice(&(messages.len() as u32).to_be_bytes());
        for msg in &messages {
            payload.extend_from_slice(&wire::encode_group_message(msg));
        }
        mem_write_response(&mut conn, req_id, mimir_codec::mediator::STATUS_OK, payload).await;

        std::future::pending::<()>().await;
    }

    fn make_manager(
        transport: Arc<TestTransport>,
        storage: Arc<TestStorage>,
        info_provider: Arc<TestInfoProvider>,
        upstream: Arc<RecordingListener>,
        mediator_pubkey: PeerKey,
    ) -> Arc<MediatorManager<TestTransport, TestStorage, TestInfoProvider>> {
        let _ = mediator_pubkey;
        let local_kp = KeyPair::generate();
        MediatorManager::new(
            transport,
            storage,
            info_provider,
            local_kp.verifying_key.to_bytes(),
            local_kp.signing_key.clone(),
            std::env::temp_dir(),
            upstream,
        )
    }

    #[tokio::test]
    async fn ensure_subscribed_backfills_and_fires_reconnected() {
        let mediator_pubkey = KeyPair::generate().verifying_key.to_bytes();
        let (conn_local, conn_fake) = paired_conns();
        let transport = Arc::new(TestTransport {
            conn: TMutex::new(Some(conn_local)),
        });
        let storage = Arc::new(TestStorage::default());
        let shared_key = [3u8; 32];
        let chat = sample_chat(77, mediator_pubkey, shared_key);
        storage.upsert_group_chat(chat.clone()).await.expect("insert chat");
        let info_provider = Arc::new(TestInfoProvider { profile: None });
        let upstream = Arc::new(RecordingListener::default());
        let manager = make_manager(transport, storage.clone(), info_provider, upstream.clone(), mediator_pubkey);

        let message = wire::WireGroupMessage {
            chat_id: 77,
            server_msg_id: 1,
            guid: 42,
            author: [1u8; 32],
            timestamp: 100,
            blob: mimir_crypto::aead::encrypt(&sample_message_text_body(42), &shared_key),
        };
        let fake = tokio::spawn(run_fake_mediator(conn_fake, message));

        manager.ensure_subscribed(&chat).await.expect("subscribe and backfill");

        assert_eq!(upstream.reconnected.lock().await.as_slice(), &[77]);
        let stored = storage.messages.lock().expect("not poisoned");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].guid, 42);
        drop(stored);

        let chats = storage.get_group_chat_list().await.expect("list");
        assert!(chats.iter().find(|c| c.chat_id == 77).expect("chat").subscribed);

        fake.abort();
    }

    #[tokio::test]
    async fn backfill_drops_records_whose_chat_id_disagrees_with_the_request() {
        let mediator_pubkey = KeyPair::generate().verifying_key.to_bytes();
        let (conn_local, conn_fake) = paired_conns();
        let transport = Arc::new(TestTransport {
            conn: TMutex::new(Some(conn_local)),
        });
        let storage = Arc::new(TestStorage::default());
        let shared_key = [3u8; 32];
        let chat = sample_chat(77, mediator_pubkey, shared_key);
        storage.upsert_group_chat(chat.clone()).await.expect("insert chat");
        let info_provider = Arc::new(TestInfoProvider { profile: None });
        let upstream = Arc::new(RecordingListener::default());
        let manager = make_manager(transport, storage.clone(), info_provider, upstream.clone(), mediator_pubkey);

        let mismatched = wire::WireGroupMessage {
            chat_id: 999, // disagrees with the `77` this backfill was requested for
            server_msg_id: 1,
            guid: 1,
            author: [1u8; 32],
            timestamp: 100,
            blob: mimir_crypto::aead::encrypt(&sample_message_text_body(1), &shared_key),
        };
        let good = wire::WireGroupMessage {
            chat_id: 77,
            server_msg_id: 2,
            guid: 2,
            author: [1u8; 32],
            timestamp: 100,
            blob: mimir_crypto::aead::encrypt(&sample_message_text_body(2), &shared_key),
        };
        let fake = tokio::spawn(run_fake_mediator_batch(conn_fake, 2, vec![mismatched, good]));

        manager.ensure_subscribed(&chat).await.expect("subscribe and backfill");

        let stored = storage.messages.lock().expect("not poisoned");
        assert_eq!(stored.len(), 1, "the mismatched record must be dropped, not stored");
        assert_eq!(stored[0].guid, 2);
        drop(stored);

        let timestamp = storage.get_group_chat_timestamp(77).await.expect("timestamp");
        assert_eq!(timestamp, Some(2));

        fake.abort();
    }

    #[tokio::test]
    async fn group_message_push_dispatches_chat_message_to_upstream() {
        let mediator_pubkey = [9u8; 32];
        let shared_key = [4u8; 32];
        let storage = Arc::new(TestStorage::default());
        let chat = sample_chat(5, mediator_pubkey, shared_key);
        storage.upsert_group_chat(chat).await.expect("insert");
        let transport = Arc::new(TestTransport { conn: TMutex::new(None) });
        let info_provider = Arc::new(TestInfoProvider { profile: None });
        let upstream = Arc::new(RecordingListener::default());
        let manager = make_manager(transport, storage, info_provider, upstream.clone(), mediator_pubkey);

        let blob = mimir_crypto::aead::encrypt(&sample_message_text_body(9), &shared_key);
        let msg = wire::WireGroupMessage {
            chat_id: 5,
            server_msg_id: 1,
            guid: 9,
            author: [1u8; 32],
            timestamp: 10,
            blob,
        };
        manager.handle_group_message(mediator_pubkey, msg).await;

        let recorded = upstream.chat_messages.lock().await;
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].1.guid, 9);
    }

    #[tokio::test]
    async fn system_message_push_dispatches_system_event_to_upstream() {
        let mediator_pubkey = [9u8; 32];
        let storage = Arc::new(TestStorage::default());
        let chat = sample_chat(6, mediator_pubkey, [0u8; 32]);
        storage.upsert_group_chat(chat).await.expect("insert");
        let transport = Arc::new(TestTransport { conn: TMutex::new(None) });
        let info_provider = Arc::new(TestInfoProvider { profile: None });
        let upstream = Arc::new(RecordingListener::default());
        let manager = make_manager(transport, storage, info_provider, upstream.clone(), mediator_pubkey);

        let mut blob = vec![SystemEvent::UserAdded as u8];
        blob.extend_from_slice(&[2u8; 32]);
        blob.extend_from_slice(&[3u8; 32]);
        let msg = wire::WireGroupMessage {
            chat_id: 6,
            server_msg_id: 1,
            guid: 500,
            author: mediator_pubkey,
            timestamp: 10,
            blob,
        };
        manager.handle_group_message(mediator_pubkey, msg).await;

        let recorded = upstream.system_events.lock().await;
        assert_eq!(recorded, &vec![(6, SystemEvent::UserAdded)]);
    }

    #[tokio::test]
    async fn group_message_push_for_unknown_chat_is_dropped() {
        let mediator_pubkey = [9u8; 32];
        let storage = Arc::new(TestStorage::default());
        let transport = Arc::new(TestTransport { conn: TMutex::new(None) });
        let info_provider = Arc::new(TestInfoProvider { profile: None });
        let upstream = Arc::new(RecordingListener::default());
        let manager = make_manager(transport, storage, info_provider, upstream.clone(), mediator_pubkey);

        let msg = wire::WireGroupMessage {
            chat_id: 999,
            server_msg_id: 1,
            guid: 1,
            author: [1u8; 32],
            timestamp: 1,
            blob: vec![],
        };
        manager.handle_group_message(mediator_pubkey, msg).await;

        assert!(upstream.chat_messages.lock().await.is_empty());
    }

    #[tokio::test]
    async fn member_info_request_is_a_no_op_when_profile_unchanged() {
        let mediator_pubkey = [9u8; 32];
        let storage = Arc::new(TestStorage::default());
        let chat = sample_chat(1, mediator_pubkey, [1u8; 32]);
        storage.upsert_group_chat(chat).await.expect("insert");
        let transport = Arc::new(TestTransport { conn: TMutex::new(None) });
        let info_provider = Arc::new(TestInfoProvider { profile: None });
        let upstream = Arc::new(RecordingListener::default());
        let manager = make_manager(transport, storage, info_provider, upstream, mediator_pubkey);

        // No client registered for this mediator either; the handler
        // must return early on the unchanged-profile check before ever
        // reaching for one.
        manager.handle_member_info_request(mediator_pubkey, 1, 100).await;
    }

    #[tokio::test]
    async fn mark_chats_unsubscribed_flips_flag_for_matching_mediator_only() {
        let mediator = [9u8; 32];
        let other_mediator = [8u8; 32];
        let storage = Arc::new(TestStorage::default());
        storage
            .upsert_group_chat(sample_chat(1, mediator, [0u8; 32]))
            .await
            .expect("insert a");
        storage
            .upsert_group_chat(sample_chat(2, other_mediator, [0u8; 32]))
            .await
            .expect("insert b");
        // `subscribed` starts false from `sample_chat`; flip it true to
        // observe the unsubscribe actually change something.
        for id in [1u64, 2u64] {
            let mut chat = storage.get_group_chat(id).await.expect("get").expect("present");
            chat.subscribed = true;
            storage.upsert_group_chat(chat).await.expect("update");
        }

        let transport = Arc::new(TestTransport { conn: TMutex::new(None) });
        let info_provider = Arc::new(TestInfoProvider { profile: None });
        let upstream = Arc::new(RecordingListener::default());
        let manager = make_manager(transport, storage.clone(), info_provider, upstream, mediator);

        manager.mark_chats_unsubscribed(mediator).await;

        let chats = storage.get_group_chat_list().await.expect("list");
        let a = chats.iter().find(|c| c.chat_id == 1).expect("chat a");
        let b = chats.iter().find(|c| c.chat_id == 2).expect("chat b");
        assert!(!a.subscribed);
        assert!(b.subscribed);
    }
}
