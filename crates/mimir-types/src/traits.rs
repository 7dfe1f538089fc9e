//! Collaborator traits (Section 6 and Section 9 "Polymorphism").
//!
//! These are the capability interfaces the protocol core consumes but does
//! not implement: the overlay transport, persistent storage, the local
//! profile provider, and the callback surfaces the core uses to report
//! state transitions upward. Concrete implementations live outside this
//! workspace (or, for tests, in `mimir-integration-tests`).
//!
//! All methods are async and object-safe (`async-trait`) because every
//! consumer in this core holds these as `Arc<dyn Trait>` — a session does
//! not know at compile time whether it is talking to a real overlay socket
//! or a test double.

use std::error::Error as StdError;

use async_trait::async_trait;

use crate::model::{
    Contact, GroupChat, GroupMember, GroupMessage, Invite, OutboundMessage, OverlayAddress,
    Peer, PeerKey, SystemEvent,
};

/// A bidirectional byte stream keyed to a single overlay peer.
///
/// Mirrors the `Connection` shape in Section 6: a plain read/write/close
/// surface with an explicit timed-read variant for the directory client's
/// bounded waits.
#[async_trait]
pub trait Connection: Send + Sync {
    type Error: StdError + Send + Sync + 'static;

    /// Write the entire buffer to the stream.
    async fn write(&mut self, data: &[u8]) -> Result<(), Self::Error>;

    /// Read into `buf`, returning the number of bytes read (0 on EOF).
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error>;

    /// Read into `buf` with a deadline. `Ok(None)` means the deadline
    /// elapsed with no data available.
    async fn read_with_timeout(
        &mut self,
        buf: &mut [u8],
        timeout_ms: u64,
    ) -> Result<Option<usize>, Self::Error>;

    /// Close the stream. Idempotent.
    async fn close(&mut self);
}

/// The overlay transport collaborator (Section 6).
///
/// Provides peer-keyed bidirectional connections over the underlying
/// routing mesh (Yggdrasil-style IPv6 overlay). This core never
/// constructs or tears down the mesh itself; it only dials and accepts
/// through this interface.
#[async_trait]
pub trait Transport: Send + Sync {
    type Conn: Connection;
    type Error: StdError + Send + Sync + 'static;

    /// Open a connection to `peer_pubkey`. Resolution of the overlay
    /// address from the pubkey is the transport's responsibility.
    async fn connect(&self, peer_pubkey: &PeerKey) -> Result<Self::Conn, Self::Error>;

    /// Accept the next inbound connection on this node's listening
    /// overlay socket, along with the remote overlay address it arrived
    /// from (used for the NAT-aware subnet check in Section 4.4, before
    /// the HELLO that rekeys the session by pubkey has been read). Not
    /// itemized in Section 6's collaborator method list, but required by
    /// the P2P supervisor's accept loop (Section 4.5); grounded in the
    /// same "listening socket on the overlay address" the supervisor is
    /// said to own.
    async fn accept(&self) -> Result<(Self::Conn, OverlayAddress), Self::Error>;

    /// Close any connection the transport is tracking for `peer_pubkey`.
    async fn close_connection(&self, peer_pubkey: &PeerKey);

    /// JSON snapshot of the overlay's current peer set, as consumed by
    /// the peer controller (Section 4.8).
    async fn peers_json(&self) -> String;

    /// JSON snapshot of current overlay paths.
    async fn paths_json(&self) -> String;

    /// Add a peering URI to the overlay's configuration.
    async fn add_peer(&self, uri: &str) -> Result<(), Self::Error>;

    /// Remove a peering URI from the overlay's configuration.
    async fn remove_peer(&self, uri: &str) -> Result<(), Self::Error>;

    /// This node's own overlay address, used for the HELLO NAT-aware
    /// address field (Section 4.4).
    async fn public_key(&self) -> OverlayAddress;
}

/// The local message/contact persistence collaborator (Section 6).
///
/// This core treats Storage as durable and thread-safe; it never caches
/// state Storage is the source of truth for beyond the lifetime of a
/// single operation.
#[async_trait]
pub trait Storage: Send + Sync {
    type Error: StdError + Send + Sync + 'static;

    /// Contacts that have at least one undelivered outbound message.
    async fn get_contacts_with_unsent_messages(&self) -> Result<Vec<PeerKey>, Self::Error>;

    /// Cached overlay address records for a contact, freshest first.
    async fn get_contact_peers(&self, pubkey: &PeerKey) -> Result<Vec<Peer>, Self::Error>;

    /// Record a freshly resolved or announced address for a contact.
    async fn save_ip(
        &self,
        pubkey: &PeerKey,
        addr: OverlayAddress,
        client_id: u32,
        priority: u8,
        expiration: u64,
    ) -> Result<(), Self::Error>;

    /// All messages queued for `pubkey` that have not yet been delivered.
    async fn get_unsent_messages(&self, pubkey: &PeerKey) -> Result<Vec<OutboundMessage>, Self::Error>;

    /// Fetch a single outbound message by guid.
    async fn get_message(&self, guid: u64) -> Result<Option<OutboundMessage>, Self::Error>;

    /// Mark an outbound message delivered (idempotent).
    async fn mark_delivered(&self, pubkey: &PeerKey, guid: u64) -> Result<(), Self::Error>;

    /// Look up a locally known contact record.
    async fn get_contact(&self, pubkey: &PeerKey) -> Result<Option<Contact>, Self::Error>;

    /// Apply an `INFO_RESPONSE` to a contact record.
    async fn update_contact(&self, pubkey: &PeerKey, contact: Contact) -> Result<(), Self::Error>;

    /// Look up a group chat by its mediator-assigned id.
    async fn get_group_chat(&self, chat_id: u64) -> Result<Option<GroupChat>, Self::Error>;

    /// All group chats the local user is a member of.
    async fn get_group_chat_list(&self) -> Result<Vec<GroupChat>, Self::Error>;

    /// Upsert a group chat record (e.g. on create/join/resubscribe).
    async fn upsert_group_chat(&self, chat: GroupChat) -> Result<(), Self::Error>;

    /// Persist an assembled group message.
    #[allow(clippy::too_many_arguments)]
    async fn add_group_message(&self, message: GroupMessage) -> Result<(), Self::Error>;

    /// Remove a group message by its sender-assigned guid (Section 4.7,
    /// `MessageDeleted`).
    async fn delete_group_message_by_guid(&self, chat_id: u64, guid: u64) -> Result<(), Self::Error>;

    /// Dedup check used before persisting an assembled message
    /// (Section 3 invariants, Testable Property 6).
    async fn check_group_message_exists(&self, chat_id: u64, guid: u64) -> Result<bool, Self::Error>;

    /// Highest `server_msg_id` persisted for a chat, or `None` if empty.
    async fn get_group_chat_timestamp(&self, chat_id: u64) -> Result<Option<u64>, Self::Error>;

    /// Apply a decrypted member profile update.
    async fn update_group_member_info(&self, member: GroupMember) -> Result<(), Self::Error>;

    /// Most recent `info_updated_at` this node has persisted for any
    /// member of a chat (used to answer `0x51` member-info requests).
    async fn get_latest_group_member_update_time(&self, chat_id: u64) -> Result<u64, Self::Error>;

    /// Flip a member's online/offline flag and last-seen time.
    async fn update_group_member_online_status(
        &self,
        chat_id: u64,
        pubkey: &PeerKey,
        online: bool,
        last_seen: u64,
    ) -> Result<(), Self::Error>;
}

/// The local profile provider collaborator (Section 6).
///
/// Backs `INFO_RESPONSE` answers (Section 4.4) and `update_member_info`
/// payload construction (Section 4.7).
#[async_trait]
pub trait InfoProvider: Send + Sync {
    type Error: StdError + Send + Sync + 'static;

    /// The local profile as of `since`, or `None` if unchanged.
    async fn get_my_info(&self, since: u64) -> Result<Option<LocalProfile>, Self::Error>;

    /// Last time the local contact-facing profile changed.
    async fn get_contact_update_time(&self) -> Result<u64, Self::Error>;

    /// Apply an externally observed update to the local contact profile
    /// cache (used when a peer's `INFO_RESPONSE` updates what we show
    /// about ourselves to them, mirrored back for consistency checks).
    async fn update_contact_info(&self, pubkey: &PeerKey, contact: Contact) -> Result<(), Self::Error>;
}

/// Nickname/info/avatar snapshot returned by [`InfoProvider::get_my_info`].
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LocalProfile {
    pub nickname: String,
    pub info: String,
    pub avatar: Vec<u8>,
    pub updated_at: u64,
}

/// Event sink for a single P2P session and its owning supervisor
/// (Section 4.4, Section 4.5).
#[async_trait]
pub trait EventListener: Send + Sync {
    /// Fired exactly once per session, after the handshake completes and
    /// (server role) the profile INFO_REQUEST has been sent.
    async fn on_client_connected(&self, peer: PeerKey);

    /// Fired when a session's socket is torn down, for any reason.
    async fn on_connection_closed(&self, peer: PeerKey);

    /// Fired when an `OK(guid)` with nonzero guid is observed.
    async fn on_message_delivered(&self, peer: PeerKey, guid: u64);

    /// Fired when a complete inbound `MESSAGE_TEXT` frame has been
    /// received and acknowledged.
    async fn on_message_received(&self, peer: PeerKey, guid: u64, msg_type: u16, data: Vec<u8>);
}

/// Event sink for mediator push traffic, registered per chat
/// (Section 4.7).
#[async_trait]
pub trait MediatorListener: Send + Sync {
    /// A regular (non-system) chat message push.
    async fn on_chat_message(&self, chat_id: u64, message: GroupMessage);

    /// A parsed system event push.
    async fn on_system_event(&self, chat_id: u64, event: SystemEvent, target: Option<PeerKey>, actor: Option<PeerKey>);

    /// An invite push (`0x41`).
    async fn on_invite(&self, invite: Invite);

    /// A mediator session was (re)subscribed and backfilled for a chat;
    /// the caller should retry any undelivered messages for that chat.
    async fn on_chat_reconnected(&self, chat_id: u64);

    /// The mediator session dropped.
    async fn on_disconnected(&self, mediator_pubkey: PeerKey, reason: String);
}

/// Peer-controller online/offline transition sink (Section 4.8).
#[async_trait]
pub trait PeerStateListener: Send + Sync {
    async fn on_peer_state(&self, online: bool, host: String, cost: f64);
}

/// Directory (tracker) client result sink (Section 4.3).
#[async_trait]
pub trait ResolverReceiver: Send + Sync {
    /// Announce succeeded; re-announce at `ttl`-second cadence.
    async fn on_announce(&self, ttl: u64);

    /// A resolve/announce attempt produced no usable result.
    async fn on_error(&self);
}
