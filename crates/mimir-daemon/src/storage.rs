//! SQLite-backed implementation of the `Storage` and `InfoProvider`
//! collaborator traits (Section 6).
//!
//! The protocol core (`mimir-session`, `mimir-server`, `mimir-mediator`,
//! `mimir-assembler`) only ever sees these traits; this module is the
//! one place in the workspace that actually owns a database connection.
//! Mirrors the teacher daemon's `state.db.lock().await` pattern: a
//! single `tokio::sync::Mutex<rusqlite::Connection>` serializes access,
//! and individual queries stay synchronous rusqlite calls rather than a
//! separate blocking pool, since every call here is a handful of
//! indexed single-row operations.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use mimir_types::model::{
    Contact, GroupChat, GroupMember, GroupMessage, OutboundMessage, OverlayAddress, Peer, PeerKey,
};
use mimir_types::traits::{InfoProvider, LocalProfile, Storage};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("corrupt row: {0}")]
    Corrupt(&'static str),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Sqlite-backed implementation shared by every collaborator trait the
/// daemon owns concretely.
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open (creating if needed) the database at `path` and apply the
    /// schema.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS contacts (
            pubkey BLOB PRIMARY KEY,
            last_address BLOB,
            last_update_time INTEGER NOT NULL DEFAULT 0,
            avatar BLOB,
            nickname TEXT,
            info TEXT
        );

        CREATE TABLE IF NOT EXISTS peers (
            pubkey BLOB NOT NULL,
            overlay_address BLOB NOT NULL,
            client_id INTEGER NOT NULL,
            priority INTEGER NOT NULL,
            expiration INTEGER NOT NULL,
            PRIMARY KEY (pubkey, overlay_address)
        );

        CREATE TABLE IF NOT EXISTS outbound_messages (
            pubkey BLOB NOT NULL,
            guid INTEGER NOT NULL,
            reply_to INTEGER NOT NULL,
            send_time INTEGER NOT NULL,
            edit_time INTEGER NOT NULL,
            msg_type INTEGER NOT NULL,
            data BLOB NOT NULL,
            delivered INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (pubkey, guid)
        );

        CREATE TABLE IF NOT EXISTS group_chats (
            chat_id INTEGER PRIMARY KEY,
            mediator_pubkey BLOB NOT NULL,
            shared_key BLOB NOT NULL,
            name TEXT NOT NULL,
            description TEXT NOT NULL,
            avatar BLOB,
            subscribed INTEGER NOT NULL,
            muted INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS group_members (
            chat_id INTEGER NOT NULL,
            pubkey BLOB NOT NULL,
            nickname TEXT,
            info TEXT,
            avatar BLOB,
            permissions INTEGER NOT NULL,
            online INTEGER NOT NULL,
            last_seen INTEGER NOT NULL,
            info_updated_at INTEGER NOT NULL,
            PRIMARY KEY (chat_id, pubkey)
        );

        CREATE TABLE IF NOT EXISTS group_messages (
            chat_id INTEGER NOT NULL,
            server_msg_id INTEGER NOT NULL,
            guid INTEGER NOT NULL,
            author BLOB NOT NULL,
            timestamp INTEGER NOT NULL,
            msg_type INTEGER NOT NULL,
            system INTEGER NOT NULL,
            data BLOB NOT NULL,
            PRIMARY KEY (chat_id, guid)
        );

        CREATE TABLE IF NOT EXISTS local_profile (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            nickname TEXT NOT NULL DEFAULT '',
            info TEXT NOT NULL DEFAULT '',
            avatar BLOB NOT NULL DEFAULT x'',
            updated_at INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS identity (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            signing_key BLOB NOT NULL,
            created_at INTEGER NOT NULL
        );
        ",
    )
}

fn to_key32(bytes: Vec<u8>, what: &'static str) -> Result<[u8; 32]> {
    bytes.try_into().map_err(|_| StorageError::Corrupt(what))
}

#[async_trait]
impl Storage for SqliteStorage {
    type Error = StorageError;

    async fn get_contacts_with_unsent_messages(&self) -> Result<Vec<PeerKey>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT pubkey FROM outbound_messages WHERE delivered = 0",
        )?;
        let rows = stmt
            .query_map([], |row| row.get::<_, Vec<u8>>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(|b| to_key32(b, "contact pubkey")).collect()
    }

    async fn get_contact_peers(&self, pubkey: &PeerKey) -> Result<Vec<Peer>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT overlay_address, client_id, priority, expiration FROM peers
             WHERE pubkey = ?1 ORDER BY expiration DESC",
        )?;
        let rows = stmt
            .query_map(params![pubkey.as_slice()], |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, u8>(2)?,
                    row.get::<_, u64>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(addr, client_id, priority, expiration)| {
                Ok(Peer {
                    overlay_address: to_key32(addr, "peer overlay address")?,
                    client_id,
                    priority,
                    expiration,
                })
            })
            .collect()
    }

    async fn save_ip(
        &self,
        pubkey: &PeerKey,
        addr: OverlayAddress,
        client_id: u32,
        priority: u8,
        expiration: u64,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO peers (pubkey, overlay_address, client_id, priority, expiration)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(pubkey, overlay_address) DO UPDATE SET
                client_id = excluded.client_id,
                priority = excluded.priority,
                expiration = excluded.expiration",
            params![
                pubkey.as_slice(),
                addr.as_slice(),
                client_id,
                priority,
                expiration
            ],
        )?;
        Ok(())
    }

    async fn get_unsent_messages(&self, pubkey: &PeerKey) -> Result<Vec<OutboundMessage>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT guid, reply_to, send_time, edit_time, msg_type, data
             FROM outbound_messages WHERE pubkey = ?1 AND delivered = 0 ORDER BY send_time ASC",
        )?;
        let rows = stmt
            .query_map(params![pubkey.as_slice()], |row| {
                Ok(OutboundMessage {
                    guid: row.get::<_, i64>(0)? as u64,
                    reply_to: row.get::<_, i64>(1)? as u64,
                    send_time: row.get::<_, i64>(2)? as u64,
                    edit_time: row.get::<_, i64>(3)? as u64,
                    msg_type: row.get::<_, i64>(4)? as u16,
                    data: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn get_message(&self, guid: u64) -> Result<Option<OutboundMessage>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT guid, reply_to, send_time, edit_time, msg_type, data
             FROM outbound_messages WHERE guid = ?1 LIMIT 1",
            params![guid as i64],
            |row| {
                Ok(OutboundMessage {
                    guid: row.get::<_, i64>(0)? as u64,
                    reply_to: row.get::<_, i64>(1)? as u64,
                    send_time: row.get::<_, i64>(2)? as u64,
                    edit_time: row.get::<_, i64>(3)? as u64,
                    msg_type: row.get::<_, i64>(4)? as u16,
                    data: row.get(5)?,
                })
            },
        )
        .optional()
        .map_err(StorageError::from)
    }

    async fn mark_delivered(&self, pubkey: &PeerKey, guid: u64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE outbound_messages SET delivered = 1 WHERE pubkey = ?1 AND guid = ?2",
            params![pubkey.as_slice(), guid as i64],
        )?;
        Ok(())
    }

    async fn get_contact(&self, pubkey: &PeerKey) -> Result<Option<Contact>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT last_address, last_update_time, avatar, nickname, info
             FROM contacts WHERE pubkey = ?1",
            params![pubkey.as_slice()],
            |row| {
                let last_address: Option<Vec<u8>> = row.get(0)?;
                Ok((
                    last_address,
                    row.get::<_, i64>(1)? as u64,
                    row.get::<_, Option<Vec<u8>>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            },
        )
        .optional()?
        .map(|(addr, last_update_time, avatar, nickname, info)| {
            Ok(Contact {
                last_address: addr.map(|a| to_key32(a, "contact last address")).transpose()?,
                last_update_time,
                avatar,
                nickname,
                info,
            })
        })
        .transpose()
    }

    async fn update_contact(&self, pubkey: &PeerKey, contact: Contact) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO contacts (pubkey, last_address, last_update_time, avatar, nickname, info)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(pubkey) DO UPDATE SET
                last_address = excluded.last_address,
                last_update_time = excluded.last_update_time,
                avatar = excluded.avatar,
                nickname = excluded.nickname,
                info = excluded.info",
            params![
                pubkey.as_slice(),
                contact.last_address.map(|a| a.to_vec()),
                contact.last_update_time as i64,
                contact.avatar,
                contact.nickname,
                contact.info,
            ],
        )?;
        Ok(())
    }

    async fn get_group_chat(&self, chat_id: u64) -> Result<Option<GroupChat>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT mediator_pubkey, shared_key, name, description, avatar, subscribed, muted
             FROM group_chats WHERE chat_id = ?1",
            params![chat_id as i64],
            |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<Vec<u8>>>(4)?,
                    row.get::<_, bool>(5)?,
                    row.get::<_, bool>(6)?,
                ))
            },
        )
        .optional()?
        .map(|(mediator, shared_key, name, description, avatar, subscribed, muted)| {
            Ok(GroupChat {
                chat_id,
                mediator_pubkey: to_key32(mediator, "chat mediator pubkey")?,
                shared_key: to_key32(shared_key, "chat shared key")?,
                name,
                description,
                avatar,
                subscribed,
                muted,
            })
        })
        .transpose()
    }

    async fn get_group_chat_list(&self) -> Result<Vec<GroupChat>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT chat_id, mediator_pubkey, shared_key, name, description, avatar, subscribed, muted
             FROM group_chats",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)? as u64,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<Vec<u8>>>(5)?,
                    row.get::<_, bool>(6)?,
                    row.get::<_, bool>(7)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(
                |(chat_id, mediator, shared_key, name, description, avatar, subscribed, muted)| {
                    Ok(GroupChat {
                        chat_id,
                        mediator_pubkey: to_key32(mediator, "chat mediator pubkey")?,
                        shared_key: to_key32(shared_key, "chat shared key")?,
                        name,
                        description,
                        avatar,
                        subscribed,
                        muted,
                    })
                },
            )
            .collect()
    }

    async fn upsert_group_chat(&self, chat: GroupChat) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO group_chats
                (chat_id, mediator_pubkey, shared_key, name, description, avatar, subscribed, muted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(chat_id) DO UPDATE SET
                mediator_pubkey = excluded.mediator_pubkey,
                shared_key = excluded.shared_key,
                name = excluded.name,
                description = excluded.description,
                avatar = excluded.avatar,
                subscribed = excluded.subscribed,
                muted = excluded.muted",
            params![
                chat.chat_id as i64,
                chat.mediator_pubkey.as_slice(),
                chat.shared_key.as_slice(),
                chat.name,
                chat.description,
                chat.avatar,
                chat.subscribed,
                chat.muted,
            ],
        )?;
        Ok(())
    }

    async fn add_group_message(&self, message: GroupMessage) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO group_messages
                (chat_id, server_msg_id, guid, author, timestamp, msg_type, system, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                message.chat_id as i64,
                message.server_msg_id as i64,
                message.guid as i64,
                message.author.as_slice(),
                message.timestamp as i64,
                message.msg_type,
                message.system,
                message.data,
            ],
        )?;
        Ok(())
    }

    async fn delete_group_message_by_guid(&self, chat_id: u64, guid: u64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM group_messages WHERE chat_id = ?1 AND guid = ?2",
            params![chat_id as i64, guid as i64],
        )?;
        Ok(())
    }

    async fn check_group_message_exists(&self, chat_id: u64, guid: u64) -> Result<bool> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM group_messages WHERE chat_id = ?1 AND guid = ?2",
            params![chat_id as i64, guid as i64],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    async fn get_group_chat_timestamp(&self, chat_id: u64) -> Result<Option<u64>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT MAX(server_msg_id) FROM group_messages WHERE chat_id = ?1",
            params![chat_id as i64],
            |row| row.get::<_, Option<i64>>(0),
        )
        .map(|opt| opt.map(|v| v as u64))
        .map_err(StorageError::from)
    }

    async fn update_group_member_info(&self, member: GroupMember) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO group_members
                (chat_id, pubkey, nickname, info, avatar, permissions, online, last_seen, info_updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(chat_id, pubkey) DO UPDATE SET
                nickname = excluded.nickname,
                info = excluded.info,
                avatar = excluded.avatar,
                permissions = excluded.permissions,
                info_updated_at = excluded.info_updated_at",
            params![
                member.chat_id as i64,
                member.pubkey.as_slice(),
                member.nickname,
                member.info,
                member.avatar,
                member.permissions,
                member.online,
                member.last_seen as i64,
                member.info_updated_at as i64,
            ],
        )?;
        Ok(())
    }

    async fn get_latest_group_member_update_time(&self, chat_id: u64) -> Result<u64> {
        let conn = self.conn.lock().await;
        let value: Option<i64> = conn.query_row(
            "SELECT MAX(info_updated_at) FROM group_members WHERE chat_id = ?1",
            params![chat_id as i64],
            |row| row.get(0),
        )?;
        Ok(value.unwrap_or(0) as u64)
    }

    async fn update_group_member_online_status(
        &self,
        chat_id: u64,
        pubkey: &PeerKey,
        online: bool,
        last_seen: u64,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE group_members SET online = ?3, last_seen = ?4
             WHERE chat_id = ?1 AND pubkey = ?2",
            params![chat_id as i64, pubkey.as_slice(), online, last_seen as i64],
        )?;
        Ok(())
    }
}

#[async_trait]
impl InfoProvider for SqliteStorage {
    type Error = StorageError;

    async fn get_my_info(&self, since: u64) -> Result<Option<LocalProfile>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT nickname, info, avatar, updated_at FROM local_profile WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, i64>(3)? as u64,
                    ))
                },
            )
            .optional()?;
        Ok(row.and_then(|(nickname, info, avatar, updated_at)| {
            if updated_at <= since {
                None
            } else {
                Some(LocalProfile {
                    nickname,
                    info,
                    avatar,
                    updated_at,
                })
            }
        }))
    }

    async fn get_contact_update_time(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        let value: Option<i64> = conn
            .query_row(
                "SELECT updated_at FROM local_profile WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.unwrap_or(0) as u64)
    }

    async fn update_contact_info(&self, pubkey: &PeerKey, contact: Contact) -> Result<()> {
        Storage::update_contact(self, pubkey, contact).await
    }
}

impl SqliteStorage {
    /// Queue a freshly composed outbound message (Section 3:
    /// `OutboundMessage`). Insertion is the application layer's job in
    /// the spec (Storage is an external collaborator); this is that
    /// entry point for the daemon's `send_message` RPC command.
    pub async fn queue_outbound_message(&self, pubkey: &PeerKey, msg: &OutboundMessage) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO outbound_messages (pubkey, guid, reply_to, send_time, edit_time, msg_type, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                pubkey.as_slice(),
                msg.guid as i64,
                msg.reply_to as i64,
                msg.send_time as i64,
                msg.edit_time as i64,
                msg.msg_type,
                msg.data,
            ],
        )?;
        Ok(())
    }

    /// Set the local profile (used by the daemon's identity commands;
    /// not part of the `InfoProvider` read surface itself).
    pub async fn set_my_profile(&self, nickname: &str, info: &str, avatar: &[u8], updated_at: u64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO local_profile (id, nickname, info, avatar, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                nickname = excluded.nickname,
                info = excluded.info,
                avatar = excluded.avatar,
                updated_at = excluded.updated_at",
            params![nickname, info, avatar, updated_at as i64],
        )?;
        Ok(())
    }

    /// Persist the local Ed25519 signing key (raw 32-byte seed).
    pub async fn save_identity(&self, signing_key: &[u8; 32], created_at: u64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO identity (id, signing_key, created_at) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET signing_key = excluded.signing_key",
            params![signing_key.as_slice(), created_at as i64],
        )?;
        Ok(())
    }

    /// Load the previously persisted local signing key, if any.
    pub async fn load_identity(&self) -> Result<Option<[u8; 32]>> {
        let conn = self.conn.lock().await;
        let bytes: Option<Vec<u8>> = conn
            .query_row("SELECT signing_key FROM identity WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()?;
        bytes.map(|b| to_key32(b, "identity signing key")).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_chat(chat_id: u64) -> GroupChat {
        GroupChat {
            chat_id,
            mediator_pubkey: [7u8; 32],
            shared_key: [9u8; 32],
            name: "Test".to_string(),
            description: "desc".to_string(),
            avatar: None,
            subscribed: true,
            muted: false,
        }
    }

    #[tokio::test]
    async fn group_chat_roundtrip() {
        let storage = SqliteStorage::in_memory().expect("open in-memory db");
        storage
            .upsert_group_chat(sample_chat(77))
            .await
            .expect("upsert chat");
        let fetched = storage
            .get_group_chat(77)
            .await
            .expect("get chat")
            .expect("chat present");
        assert_eq!(fetched.chat_id, 77);
        assert_eq!(fetched.mediator_pubkey, [7u8; 32]);
        assert!(fetched.subscribed);
    }

    #[tokio::test]
    async fn group_message_dedup_is_idempotent() {
        let storage = SqliteStorage::in_memory().expect("open in-memory db");
        storage
            .upsert_group_chat(sample_chat(1))
            .await
            .expect("upsert chat");
        let msg = GroupMessage {
            chat_id: 1,
            server_msg_id: 101,
            guid: 0xABCD,
            author: [1u8; 32],
            timestamp: 1000,
            msg_type: 0,
            system: false,
            data: b"hello".to_vec(),
        };
        assert!(!storage
            .check_group_message_exists(1, 0xABCD)
            .await
            .expect("check exists"));
        storage
            .add_group_message(msg.clone())
            .await
            .expect("add message");
        storage.add_group_message(msg).await.expect("add message again");
        assert!(storage
            .check_group_message_exists(1, 0xABCD)
            .await
            .expect("check exists"));
        assert_eq!(
            storage
                .get_group_chat_timestamp(1)
                .await
                .expect("get timestamp"),
            Some(101)
        );
    }

    #[tokio::test]
    async fn message_deleted_removes_row_without_inserting_system_row() {
        let storage = SqliteStorage::in_memory().expect("open in-memory db");
        storage
            .upsert_group_chat(sample_chat(77))
            .await
            .expect("upsert chat");
        let msg = GroupMessage {
            chat_id: 77,
            server_msg_id: 50,
            guid: 0xABCD,
            author: [1u8; 32],
            timestamp: 1000,
            msg_type: 0,
            system: false,
            data: b"hi".to_vec(),
        };
        storage.add_group_message(msg).await.expect("add message");
        assert!(storage
            .check_group_message_exists(77, 0xABCD)
            .await
            .expect("check exists"));
        storage
            .delete_group_message_by_guid(77, 0xABCD)
            .await
            .expect("delete message");
        assert!(!storage
            .check_group_message_exists(77, 0xABCD)
            .await
            .expect("check exists"));
    }

    #[tokio::test]
    async fn outbound_message_stays_unsent_until_marked_delivered() {
        let storage = SqliteStorage::in_memory().expect("open in-memory db");
        let pubkey = [3u8; 32];
        let conn = storage.conn.lock().await;
        conn.execute(
            "INSERT INTO outbound_messages (pubkey, guid, reply_to, send_time, edit_time, msg_type, data)
             VALUES (?1, 42, 0, 100, 0, 0, x'68656c6c6f')",
            params![pubkey.as_slice()],
        )
        .expect("insert outbound message");
        drop(conn);

        let unsent = storage
            .get_unsent_messages(&pubkey)
            .await
            .expect("get unsent");
        assert_eq!(unsent.len(), 1);
        assert_eq!(unsent[0].guid, 42);

        storage
            .mark_delivered(&pubkey, 42)
            .await
            .expect("mark delivered");
        let unsent = storage
            .get_unsent_messages(&pubkey)
            .await
            .expect("get unsent");
        assert!(unsent.is_empty());
    }

    #[tokio::test]
    async fn identity_roundtrip() {
        let storage = SqliteStorage::in_memory().expect("open in-memory db");
        assert!(storage
            .load_identity()
            .await
            .expect("load identity")
            .is_none());
        storage
            .save_identity(&[5u8; 32], 1000)
            .await
            .expect("save identity");
        assert_eq!(
            storage.load_identity().await.expect("load identity"),
            Some([5u8; 32])
        );
    }
}
