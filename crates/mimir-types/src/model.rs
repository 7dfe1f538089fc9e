//! Shared domain types for the Mimir protocol stack.
//!
//! These structures correspond 1:1 with the data model in the Mimir
//! protocol specification (Section 3). All integers are logical values;
//! their on-wire big-endian encodings live in `mimir-codec`.

use serde::{Deserialize, Serialize};

/// 32-byte Ed25519 public key. The stable identity of an endpoint
/// everywhere in the system.
pub type PeerKey = [u8; 32];

/// 32-byte overlay (Yggdrasil-style) routing address.
pub type OverlayAddress = [u8; 32];

/// 32-byte symmetric key shared between group chat members.
pub type SharedKey = [u8; 32];

/// A local record of a contact, keyed by [`PeerKey`].
///
/// Mutated by `INFO_RESPONSE` handling in a P2P session (Section 4.4).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    /// Last-known overlay address reachable for this contact.
    pub last_address: Option<OverlayAddress>,
    /// Unix time of the last accepted profile update.
    pub last_update_time: u64,
    /// Avatar bytes, if any.
    pub avatar: Option<Vec<u8>>,
    /// Display nickname, if any.
    pub nickname: Option<String>,
    /// Free-form profile info text.
    pub info: Option<String>,
}

/// A directory (tracker) record for a peer, as returned by `GET_ADDRS`.
///
/// Created on announce/resolve; expires at `expiration`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// The overlay address at which this peer can be reached.
    pub overlay_address: OverlayAddress,
    /// Client implementation identifier reported by the peer.
    pub client_id: u32,
    /// Lower sorts first in candidate ordering.
    pub priority: u8,
    /// Unix time after which this record must be considered dead.
    pub expiration: u64,
}

impl Peer {
    /// Whether this record has expired as of `now` (Unix seconds).
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expiration
    }
}

/// A locally queued outgoing P2P message.
///
/// `guid` is assigned by the sender and is unique within that sender.
/// The record is persisted until an `OK(guid)` delivery receipt is
/// observed; it is resent across reconnects.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Locally generated, globally unique (within this sender) identifier.
    pub guid: u64,
    /// `guid` of the message this one replies to, or 0 for none.
    pub reply_to: u64,
    /// Unix time the message was originally composed.
    pub send_time: u64,
    /// Unix time of the most recent edit, or 0 if never edited.
    pub edit_time: u64,
    /// Application-defined message type (1 = image, 3 = file, etc.).
    pub msg_type: u16,
    /// Opaque message body.
    pub data: Vec<u8>,
}

/// The state of one directed P2P socket (Section 4.4).
///
/// A closed enum: no dynamic states are introduced at runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Socket exists, no protocol exchange has happened yet.
    Created,
    /// Inbound socket accepted, awaiting HELLO.
    ConnectedIn,
    /// Outbound socket connected, about to send HELLO.
    ConnectedOut,
    /// Outbound role: HELLO has been written.
    HelloSent,
    /// Inbound role: CHALLENGE has been written after a valid HELLO.
    ChallengeSent,
    /// Outbound role: CHALLENGE_ANSWER has been written.
    ChallengeAnswered,
    /// First challenge/response round has completed and was verified.
    AuthDone,
    /// Outbound role: CHALLENGE2 has been written.
    Challenge2Sent,
    /// Inbound role: CHALLENGE_ANSWER2 has been written.
    Challenge2Answered,
    /// Both sides have mutually authenticated. Messages may flow.
    Auth2Done,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Created
    }
}

/// A group chat the local user is (or was) a member of.
///
/// `chat_id` is assigned by the mediator, never generated locally.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroupChat {
    /// Mediator-assigned chat identifier.
    pub chat_id: u64,
    /// Public key of the mediator that hosts this chat.
    pub mediator_pubkey: PeerKey,
    /// Symmetric key used to encrypt/decrypt message bodies and profiles.
    pub shared_key: SharedKey,
    /// Display name.
    pub name: String,
    /// Description text.
    pub description: String,
    /// Avatar bytes, if any.
    pub avatar: Option<Vec<u8>>,
    /// Whether the local client currently holds a live subscription.
    pub subscribed: bool,
    /// Whether push notifications for this chat are muted.
    pub muted: bool,
}

/// A member of a [`GroupChat`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroupMember {
    /// Chat this membership applies to.
    pub chat_id: u64,
    /// Member's identity key.
    pub pubkey: PeerKey,
    /// Display nickname, if the member has published one.
    pub nickname: Option<String>,
    /// Free-form profile info.
    pub info: Option<String>,
    /// Avatar bytes, if any.
    pub avatar: Option<Vec<u8>>,
    /// Bitfield of mediator-granted permissions.
    pub permissions: u8,
    /// Whether the member is currently online.
    pub online: bool,
    /// Unix time the member was last seen online.
    pub last_seen: u64,
    /// Unix time of the member's most recently applied profile update.
    pub info_updated_at: u64,
}

/// A message in a [`GroupChat`], as persisted after assembly (Section 4.9).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroupMessage {
    /// Chat this message belongs to.
    pub chat_id: u64,
    /// Mediator-assigned, strictly monotonic-per-chat identifier.
    pub server_msg_id: u64,
    /// Sender-assigned identifier, used for deduplication.
    pub guid: u64,
    /// Author's identity key. Equal to the mediator's key for system
    /// messages, and never equal to it otherwise.
    pub author: PeerKey,
    /// Unix time the message was sent.
    pub timestamp: u64,
    /// Application-defined message type.
    pub msg_type: u16,
    /// Whether this is a synthetic system message (membership events,
    /// deletions). System messages are never decrypted.
    pub system: bool,
    /// Message body. Encrypted at rest on the wire; decrypted by the
    /// assembler before this struct is constructed, except for system
    /// messages which carry their event payload directly.
    pub data: Vec<u8>,
}

/// System event codes carried by a mediator push whose `author` equals the
/// mediator's own public key (Section 4.7).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SystemEvent {
    UserAdded = 0x01,
    UserEntered = 0x02,
    UserLeft = 0x03,
    UserBanned = 0x04,
    ChatDeleted = 0x05,
    ChatInfoChange = 0x06,
    PermsChanged = 0x07,
    MessageDeleted = 0x08,
}

impl SystemEvent {
    /// Decode a system event code, or `None` for an unrecognized byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::UserAdded),
            0x02 => Some(Self::UserEntered),
            0x03 => Some(Self::UserLeft),
            0x04 => Some(Self::UserBanned),
            0x05 => Some(Self::ChatDeleted),
            0x06 => Some(Self::ChatInfoChange),
            0x07 => Some(Self::PermsChanged),
            0x08 => Some(Self::MessageDeleted),
            _ => None,
        }
    }
}

/// A pending group invite between `send_invite` and `respond_to_invite`
/// (Section 4.6). Held only in memory by the mediator manager; Storage
/// owns any durable record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Invite {
    pub chat_id: u64,
    pub inviter: PeerKey,
    pub invitee: PeerKey,
    pub shared_key: SharedKey,
    pub created_at: u64,
}

/// Enough information for the daemon to seed a mediator manager from
/// configuration, without hardcoding any particular mediator's network
/// location.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MediatorInfo {
    pub pubkey: PeerKey,
    pub address_hint: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_expiration() {
        let p = Peer {
            overlay_address: [0u8; 32],
            client_id: 1,
            priority: 0,
            expiration: 1000,
        };
        assert!(!p.is_expired(999));
        assert!(p.is_expired(1000));
        assert!(p.is_expired(1001));
    }

    #[test]
    fn connection_state_default_is_created() {
        assert_eq!(ConnectionState::default(), ConnectionState::Created);
    }

    #[test]
    fn system_event_round_trip() {
        for code in [0x01u8, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08] {
            assert!(SystemEvent::from_u8(code).is_some());
        }
        assert!(SystemEvent::from_u8(0x09).is_none());
    }
}
