//! # mimir-assembler
//!
//! The message assembler (Section 4.9, C9): turns one inbound mediator
//! group-message record into Storage side effects — decrypt, dedup,
//! attachment extraction, and system-event application — and hands the
//! caller (the mediator manager, C7) enough back to fire its listener
//! hooks.
//!
//! This crate is a stateless library, not a collaborator trait: C7 calls
//! straight into [`assemble_and_store`] for every push and every backfill
//! page.

use std::path::Path;

use mimir_codec::p2p::{self, FrameHeader, P2pMessage, ATTACHMENT_FILE, ATTACHMENT_IMAGE, TYPE_MESSAGE_TEXT};
use mimir_types::model::{GroupChat, GroupMessage, PeerKey, SystemEvent};
use mimir_types::traits::Storage;
use rand::RngCore;
use tracing::warn;

/// System-message type tag Storage rows use (Section 4.9).
pub const SYSTEM_MESSAGE_TYPE: u16 = 1000;

#[derive(Debug, thiserror::Error)]
pub enum AssemblerError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("attachment I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AssemblerError>;

/// One raw group-message record as received from the mediator, before
/// decryption or system-message classification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawGroupMessage {
    pub chat_id: u64,
    pub server_msg_id: u64,
    pub guid: u64,
    pub author: PeerKey,
    pub timestamp: u64,
    /// Ciphertext for a regular message, plaintext event bytes for a
    /// system message (system messages are never encrypted — Section
    /// 4.7).
    pub blob: Vec<u8>,
}

/// What `assemble_and_store` did with one [`RawGroupMessage`]. The
/// manager uses this to decide which `MediatorListener` hook to fire;
/// the Storage side effect has already happened by the time this is
/// returned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AssembledMessage {
    /// A regular chat message was decrypted and stored.
    Chat(GroupMessage),
    /// A non-delete system event was applied and stored as a
    /// `system=true` row.
    System {
        event: SystemEvent,
        target: Option<PeerKey>,
        actor: Option<PeerKey>,
    },
    /// `MessageDeleted` removed a row; no row was inserted for the
    /// system message itself (Section 4.7).
    Deleted { guid: u64 },
    /// `(chat_id, guid)` was already persisted; a no-op (Testable
    /// Property 6).
    Duplicate,
}

/// Placeholder JSON substituted for an attachment body that failed to
/// parse as JSON metadata.
const CORRUPTED_PLACEHOLDER: &str = r#"{"corrupted":true}"#;

/// Apply one inbound group-message record (Section 4.9).
pub async fn assemble_and_store<S: Storage>(
    storage: &S,
    attachments_dir: &Path,
    chat: &GroupChat,
    raw: RawGroupMessage,
) -> Result<AssembledMessage> {
    if raw.author == chat.mediator_pubkey {
        return apply_system_message(storage, raw).await;
    }

    if storage
        .check_group_message_exists(raw.chat_id, raw.guid)
        .await
        .map_err(|e| AssemblerError::Storage(e.to_string()))?
    {
        return Ok(AssembledMessage::Duplicate);
    }

    let plaintext = match mimir_crypto::aead::decrypt(&raw.blob, &chat.shared_key) {
        Ok(p) => p,
        Err(_) => {
            let placeholder = GroupMessage {
                chat_id: raw.chat_id,
                server_msg_id: raw.server_msg_id,
                guid: raw.guid,
                author: raw.author,
                timestamp: raw.timestamp,
                msg_type: 0,
                system: false,
                data: b"[message could not be decrypted]".to_vec(),
            };
            storage
                .add_group_message(placeholder.clone())
                .await
                .map_err(|e| AssemblerError::Storage(e.to_string()))?;
            return Ok(AssembledMessage::Chat(placeholder));
        }
    };

    let header = FrameHeader {
        stream: 0,
        msg_type: TYPE_MESSAGE_TEXT,
        size: plaintext.len() as u64,
    };
    let (msg_type, data) = match p2p::decode(&header, &plaintext) {
        Ok(P2pMessage::MessageText { header, payload }) => {
            let data = payload.unwrap_or_default();
            let data = if matches!(header.msg_type, ATTACHMENT_IMAGE | ATTACHMENT_FILE) {
                extract_attachment(attachments_dir, &data).await?
            } else {
                data
            };
            (header.msg_type, data)
        }
        Ok(_) | Err(_) => {
            warn!(chat_id = raw.chat_id, guid = raw.guid, "decrypted body is not a MESSAGE_TEXT record");
            (0, b"[malformed message]".to_vec())
        }
    };

    let message = GroupMessage {
        chat_id: raw.chat_id,
        server_msg_id: raw.server_msg_id,
        guid: raw.guid,
        author: raw.author,
        timestamp: raw.timestamp,
        msg_type,
        system: false,
        data,
    };
    storage
        .add_group_message(message.clone())
        .await
        .map_err(|e| AssemblerError::Storage(e.to_string()))?;
    Ok(AssembledMessage::Chat(message))
}

/// A mediator-authored push: parse the leading event byte (Section 4.7)
/// and either delete a row (`MessageDeleted`, invisible) or store a
/// `system=true` placeholder row plus report the event for dispatch.
async fn apply_system_message<S: Storage>(storage: &S, raw: RawGroupMessage) -> Result<AssembledMessage> {
    let mut buf = raw.blob.as_slice();
    let Some((event_byte, rest)) = buf.split_first() else {
        warn!(chat_id = raw.chat_id, "empty system-message payload");
        return Ok(AssembledMessage::Duplicate);
    };
    buf = rest;
    let Some(event) = SystemEvent::from_u8(*event_byte) else {
        warn!(event_byte, "unrecognized system event code");
        return Ok(AssembledMessage::Duplicate);
    };

    if event == SystemEvent::MessageDeleted {
        if buf.len() < 8 {
            warn!("MessageDeleted payload too short");
            return Ok(AssembledMessage::Duplicate);
        }
        let deleted_guid = u64::from_be_bytes(buf[..8].try_into().expect("checked length"));
        storage
            .delete_group_message_by_guid(raw.chat_id, deleted_guid)
            .await
            .map_err(|e| AssemblerError::Storage(e.to_string()))?;
        return Ok(AssembledMessage::Deleted { guid: deleted_guid });
    }

    let (target, actor) = if buf.len() >= 64 {
        let mut target = [0u8; 32];
        target.copy_from_slice(&buf[0..32]);
        let mut actor = [0u8; 32];
        actor.copy_from_slice(&buf[32..64]);
        (Some(target), Some(actor))
    } else {
        (None, None)
    };

    if storage
        .check_group_message_exists(raw.chat_id, raw.guid)
        .await
        .map_err(|e| AssemblerError::Storage(e.to_string()))?
    {
        return Ok(AssembledMessage::Duplicate);
    }

    let message = GroupMessage {
        chat_id: raw.chat_id,
        server_msg_id: raw.server_msg_id,
        guid: raw.guid,
        author: raw.author,
        timestamp: raw.timestamp,
        msg_type: SYSTEM_MESSAGE_TYPE,
        system: true,
        data: raw.blob.clone(),
    };
    storage
        .add_group_message(message)
        .await
        .map_err(|e| AssemblerError::Storage(e.to_string()))?;
    Ok(AssembledMessage::System { event, target, actor })
}

/// Split `data` into `jsonSize: u32` metadata + trailing file bytes,
/// write the file under `attachments_dir` with a random name, and
/// return metadata rewritten to point at it. An unparsable metadata
/// section yields [`CORRUPTED_PLACEHOLDER`] instead of failing the
/// whole message (Section 4.9).
async fn extract_attachment(attachments_dir: &Path, data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < 4 {
        return Ok(CORRUPTED_PLACEHOLDER.as_bytes().to_vec());
    }
    let json_size = u32::from_be_bytes(data[0..4].try_into().expect("checked length")) as usize;
    if data.len() < 4 + json_size {
        return Ok(CORRUPTED_PLACEHOLDER.as_bytes().to_vec());
    }
    let metadata_bytes = &data[4..4 + json_size];
    let file_bytes = &data[4 + json_size..];

    let mut metadata: serde_json::Value = match serde_json::from_slice(metadata_bytes) {
        Ok(v) => v,
        Err(_) => return Ok(CORRUPTED_PLACEHOLDER.as_bytes().to_vec()),
    };

    tokio::fs::create_dir_all(attachments_dir).await?;
    let filename = random_filename();
    let path = attachments_dir.join(&filename);
    tokio::fs::write(&path, file_bytes).await?;

    if let Some(obj) = metadata.as_object_mut() {
        obj.insert("localFilename".to_string(), serde_json::Value::String(filename));
    }
    Ok(serde_json::to_vec(&metadata).unwrap_or_else(|_| CORRUPTED_PLACEHOLDER.as_bytes().to_vec()))
}

fn random_filename() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex_encode(&bytes)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mimir_types::model::{Contact, OutboundMessage, Peer};
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct MemStorage {
        messages: StdMutex<Vec<GroupMessage>>,
    }

    #[derive(Debug, thiserror::Error)]
    #[error("mem storage error")]
    struct MemStorageError;

    #[async_trait::async_trait]
    impl Storage for MemStorage {
        type Error = MemStorageError;

        async fn get_contacts_with_unsent_messages(&self) -> std::result::Result<Vec<PeerKey>, Self::Error> {
            Ok(vec![])
        }
        async fn get_contact_peers(&self, _pubkey: &PeerKey) -> std::result::Result<Vec<Peer>, Self::Error> {
            Ok(vec![])
        }
        async fn save_ip(&self, _: &PeerKey, _: mimir_types::model::OverlayAddress, _: u32, _: u8, _: u64) -> std::result::Result<(), Self::Error> {
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
        async fn get_group_chat(&self, _chat_id: u64) -> std::result::Result<Option<GroupChat>, Self::Error> {
            Ok(None)
        }
        async fn get_group_chat_list(&self) -> std::result::Result<Vec<GroupChat>, Self::Error> {
            Ok(vec![])
        }
        async fn upsert_group_chat(&self, _chat: GroupChat) -> std::result::Result<(), Self::Error> {
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
        async fn get_group_chat_timestamp(&self, _chat_id: u64) -> std::result::Result<Option<u64>, Self::Error> {
            Ok(None)
        }
        async fn update_group_member_info(&self, _member: mimir_types::model::GroupMember) -> std::result::Result<(), Self::Error> {
            Ok(())
        }
        async fn get_latest_group_member_update_time(&self, _chat_id: u64) -> std::result::Result<u64, Self::Error> {
            Ok(0)
        }
        async fn update_group_member_online_status(&self, _: u64, _: &PeerKey, _: bool, _: u64) -> std::result::Result<(), Self::Error> {
            Ok(())
        }
    }

    fn test_chat() -> GroupChat {
        GroupChat {
            chat_id: 77,
            mediator_pubkey: [9u8; 32],
            shared_key: [5u8; 32],
            name: "room".into(),
            description: String::new(),
            avatar: None,
            subscribed: true,
            muted: false,
        }
    }

    fn encrypted_message_text(shared_key: &[u8; 32], guid: u64) -> Vec<u8> {
        let header = mimir_codec::p2p::MessageTextHeader {
            guid,
            reply_to: None,
            send_time: 100,
            edit_time: None,
            msg_type: 0,
            payload_size: None,
        };
        let plaintext = p2p::encode(0, &P2pMessage::MessageText { header, payload: Some(b"hi".to_vec()) })
            .expect("encodes");
        // `encode` includes the 16-byte stream/type/size frame prefix;
        // the mediator blob is the inner body only, mirroring what
        // `decode_body` expects.
        let body = plaintext[16..].to_vec();
        mimir_crypto::aead::encrypt(&body, shared_key)
    }

    #[tokio::test]
    async fn regular_message_decrypts_and_stores() {
        let storage = MemStorage::default();
        let chat = test_chat();
        let blob = encrypted_message_text(&chat.shared_key, 42);
        let raw = RawGroupMessage {
            chat_id: 77,
            server_msg_id: 101,
            guid: 42,
            author: [1u8; 32],
            timestamp: 100,
            blob,
        };
        let dir = tempfile::tempdir().expect("tempdir");
        let outcome = assemble_and_store(&storage, dir.path(), &chat, raw).await.expect("assembles");
        match outcome {
            AssembledMessage::Chat(msg) => {
                assert_eq!(msg.guid, 42);
                assert_eq!(msg.data, b"hi");
            }
            other => panic!("expected Chat, got {other:?}"),
        }
        assert_eq!(storage.messages.lock().expect("not poisoned").len(), 1);
    }

    #[tokio::test]
    async fn duplicate_guid_is_a_no_op() {
        let storage = MemStorage::default();
        let chat = test_chat();
        let blob = encrypted_message_text(&chat.shared_key, 42);
        let raw = RawGroupMessage {
            chat_id: 77,
            server_msg_id: 101,
            guid: 42,
            author: [1u8; 32],
            timestamp: 100,
            blob: blob.clone(),
        };
        let dir = tempfile::tempdir().expect("tempdir");
        assemble_and_store(&storage, dir.path(), &chat, raw.clone()).await.expect("assembles");
        let outcome = assemble_and_store(&storage, dir.path(), &chat, raw).await.expect("assembles");
        assert_eq!(outcome, AssembledMessage::Duplicate);
        assert_eq!(storage.messages.lock().expect("not poisoned").len(), 1);
    }

    #[tokio::test]
    async fn undecryptable_message_stores_error_placeholder() {
        let storage = MemStorage::default();
        let chat = test_chat();
        let raw = RawGroupMessage {
            chat_id: 77,
            server_msg_id: 102,
            guid: 43,
            author: [1u8; 32],
            timestamp: 100,
            blob: b"not a valid aead envelope at all, too short".to_vec(),
        };
        let dir = tempfile::tempdir().expect("tempdir");
        let outcome = assemble_and_store(&storage, dir.path(), &chat, raw).await.expect("assembles");
        match outcome {
            AssembledMessage::Chat(msg) => assert_eq!(msg.data, b"[message could not be decrypted]"),
            other => panic!("expected Chat placeholder, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn message_deleted_system_event_removes_row_without_inserting() {
        let storage = MemStorage::default();
        let chat = test_chat();
        let blob = encrypted_message_text(&chat.shared_key, 0xABCD);
        let raw = RawGroupMessage {
            chat_id: 77,
            server_msg_id: 103,
            guid: 0xABCD,
            author: [1u8; 32],
            timestamp: 100,
            blob,
        };
        let dir = tempfile::tempdir().expect("tempdir");
        assemble_and_store(&storage, dir.path(), &chat, raw).await.expect("assembles");
        assert_eq!(storage.messages.lock().expect("not poisoned").len(), 1);

        let mut payload = vec![SystemEvent::MessageDeleted as u8];
        payload.extend_from_slice(&0xABCDu64.to_be_bytes());
        let delete_raw = RawGroupMessage {
            chat_id: 77,
            server_msg_id: 104,
            guid: 999,
            author: chat.mediator_pubkey,
            timestamp: 101,
            blob: payload,
        };
        let outcome = assemble_and_store(&storage, dir.path(), &chat, delete_raw).await.expect("assembles");
        assert_eq!(outcome, AssembledMessage::Deleted { guid: 0xABCD });
        assert_eq!(storage.messages.lock().expect("not poisoned").len(), 0);
    }

    #[tokio::test]
    async fn ordinary_system_event_is_stored_as_system_row() {
        let storage = MemStorage::default();
        let chat = test_chat();
        let mut payload = vec![SystemEvent::UserAdded as u8];
        payload.extend_from_slice(&[2u8; 32]);
        payload.extend_from_slice(&[3u8; 32]);
        let raw = RawGroupMessage {
            chat_id: 77,
            server_msg_id: 105,
            guid: 500,
            author: chat.mediator_pubkey,
            timestamp: 100,
            blob: payload,
        };
        let dir = tempfile::tempdir().expect("tempdir");
        let outcome = assemble_and_store(&storage, dir.path(), &chat, raw).await.expect("assembles");
        match outcome {
            AssembledMessage::System { event, target, actor } => {
                assert_eq!(event, SystemEvent::UserAdded);
                assert_eq!(target, Some([2u8; 32]));
                assert_eq!(actor, Some([3u8; 32]));
            }
            other => panic!("expected System, got {other:?}"),
        }
        let stored = storage.messages.lock().expect("not poisoned");
        assert_eq!(stored.len(), 1);
        assert!(stored[0].system);
        assert_eq!(stored[0].msg_type, SYSTEM_MESSAGE_TYPE);
    }
}
