//! Mediator-backed group chat command handlers (Section 4.6/4.7).

use std::sync::Arc;

use mimir_types::model::GroupChat;
use mimir_types::traits::Storage;
use serde_json::Value;

use crate::rpc::RpcError;
use crate::DaemonState;

type Result = std::result::Result<Value, RpcError>;

fn parse_pubkey(value: &Value, field: &str) -> std::result::Result<mimir_types::model::PeerKey, RpcError> {
    let hex_str = value
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| RpcError::invalid_params(&format!("{field} required")))?;
    let bytes = hex::decode(hex_str).map_err(|_| RpcError::invalid_params(&format!("{field} must be hex")))?;
    bytes
        .try_into()
        .map_err(|_| RpcError::invalid_params(&format!("{field} must be 32 bytes")))
}

fn chat_id_of(params: &Value) -> std::result::Result<u64, RpcError> {
    params
        .get("chat_id")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| RpcError::invalid_params("chat_id required"))
}

fn chat_json(chat: &GroupChat) -> Value {
    serde_json::json!({
        "chat_id": chat.chat_id,
        "mediator_pubkey": hex::encode(chat.mediator_pubkey),
        "name": chat.name,
        "description": chat.description,
        "subscribed": chat.subscribed,
        "muted": chat.muted,
    })
}

async fn require_chat(state: &Arc<DaemonState>, chat_id: u64) -> std::result::Result<GroupChat, RpcError> {
    state
        .storage
        .get_group_chat(chat_id)
        .await
        .map_err(|e| RpcError::internal_error(&format!("storage error: {e}")))?
        .ok_or_else(|| RpcError::invalid_params(&format!("unknown chat_id {chat_id}")))
}

/// Create a new group chat on a mediator and persist the mediator-issued
/// chat id and shared key (Section 4.6).
pub async fn create_chat(state: &Arc<DaemonState>, params: &Value) -> Result {
    let mediator_pubkey = parse_pubkey(params, "mediator_pubkey")?;
    let name = params
        .get("name")
        .and_then(|v| v.as_str())
        .ok_or_else(|| RpcError::invalid_params("name required"))?;
    let description = params.get("description").and_then(|v| v.as_str()).unwrap_or("");

    let client = state
        .mediator_manager
        .get_or_create(mediator_pubkey)
        .await
        .map_err(|e| RpcError::internal_error(&format!("mediator connection failed: {e}")))?;
    let (chat_id, shared_key) = client
        .create_chat(name, description)
        .await
        .map_err(|e| RpcError::internal_error(&format!("create_chat failed: {e}")))?;

    let chat = GroupChat {
        chat_id,
        mediator_pubkey,
        shared_key,
        name: name.to_string(),
        description: description.to_string(),
        avatar: None,
        subscribed: false,
        muted: false,
    };
    state
        .storage
        .upsert_group_chat(chat.clone())
        .await
        .map_err(|e| RpcError::internal_error(&format!("storage error: {e}")))?;
    state
        .mediator_manager
        .ensure_subscribed(&chat)
        .await
        .map_err(|e| RpcError::internal_error(&format!("subscribe failed: {e}")))?;

    Ok(chat_json(&require_chat(state, chat_id).await?))
}

/// All group chats the local user is a member of.
pub async fn list_chats(state: &Arc<DaemonState>) -> Result {
    let chats = state
        .storage
        .get_group_chat_list()
        .await
        .map_err(|e| RpcError::internal_error(&format!("storage error: {e}")))?;
    Ok(serde_json::json!(chats.iter().map(chat_json).collect::<Vec<_>>()))
}

/// A single group chat's locally cached record.
pub async fn get_chat(state: &Arc<DaemonState>, params: &Value) -> Result {
    let chat_id = chat_id_of(params)?;
    Ok(chat_json(&require_chat(state, chat_id).await?))
}

/// Re-subscribe to and backfill a chat (e.g. after the daemon restarts).
pub async fn subscribe_chat(state: &Arc<DaemonState>, params: &Value) -> Result {
    let chat_id = chat_id_of(params)?;
    let chat = require_chat(state, chat_id).await?;
    state
        .mediator_manager
        .ensure_subscribed(&chat)
        .await
        .map_err(|e| RpcError::internal_error(&format!("subscribe failed: {e}")))?;
    Ok(serde_json::json!({"subscribed": true}))
}

/// Encrypt and send a group message (Section 4.7).
pub async fn send_group_message(state: &Arc<DaemonState>, params: &Value) -> Result {
    let chat_id = chat_id_of(params)?;
    let guid = params
        .get("guid")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| RpcError::invalid_params("guid required"))?;
    let plaintext_hex = params
        .get("data")
        .and_then(|v| v.as_str())
        .ok_or_else(|| RpcError::invalid_params("data (hex) required"))?;
    let plaintext = hex::decode(plaintext_hex).map_err(|_| RpcError::invalid_params("data must be hex"))?;

    let chat = require_chat(state, chat_id).await?;
    let blob = mimir_crypto::aead::encrypt(&plaintext, &chat.shared_key);

    let client = state
        .mediator_manager
        .get_or_create(chat.mediator_pubkey)
        .await
        .map_err(|e| RpcError::internal_error(&format!("mediator connection failed: {e}")))?;
    let server_msg_id = client
        .send_message(chat_id, guid, &blob)
        .await
        .map_err(|e| RpcError::internal_error(&format!("send failed: {e}")))?;

    Ok(serde_json::json!({"server_msg_id": server_msg_id}))
}

/// Send a group invite (Section 4.6).
pub async fn send_invite(state: &Arc<DaemonState>, params: &Value) -> Result {
    let chat_id = chat_id_of(params)?;
    let invitee = parse_pubkey(params, "invitee")?;
    let chat = require_chat(state, chat_id).await?;
    let client = state
        .mediator_manager
        .get_or_create(chat.mediator_pubkey)
        .await
        .map_err(|e| RpcError::internal_error(&format!("mediator connection failed: {e}")))?;
    client
        .send_invite(chat_id, &invitee, &chat.shared_key)
        .await
        .map_err(|e| RpcError::internal_error(&format!("invite failed: {e}")))?;
    Ok(serde_json::json!({"invited": true}))
}

/// Accept or decline a pending invite (Section 4.6).
pub async fn respond_to_invite(state: &Arc<DaemonState>, params: &Value) -> Result {
    let chat_id = chat_id_of(params)?;
    let accepted = params
        .get("accepted")
        .and_then(|v| v.as_bool())
        .ok_or_else(|| RpcError::invalid_params("accepted (bool) required"))?;
    let mediator_pubkey = parse_pubkey(params, "mediator_pubkey")?;
    let client = state
        .mediator_manager
        .get_or_create(mediator_pubkey)
        .await
        .map_err(|e| RpcError::internal_error(&format!("mediator connection failed: {e}")))?;
    client
        .respond_to_invite(chat_id, accepted)
        .await
        .map_err(|e| RpcError::internal_error(&format!("respond_to_invite failed: {e}")))?;
    Ok(serde_json::json!({"accepted": accepted}))
}

/// Add a user to a chat (owner/moderator operation, Section 4.6).
pub async fn add_member(state: &Arc<DaemonState>, params: &Value) -> Result {
    let chat_id = chat_id_of(params)?;
    let user = parse_pubkey(params, "pubkey")?;
    let chat = require_chat(state, chat_id).await?;
    let client = state
        .mediator_manager
        .get_or_create(chat.mediator_pubkey)
        .await
        .map_err(|e| RpcError::internal_error(&format!("mediator connection failed: {e}")))?;
    client
        .add_user(chat_id, &user)
        .await
        .map_err(|e| RpcError::internal_error(&format!("add_user failed: {e}")))?;
    Ok(serde_json::json!({"added": true}))
}

/// Remove a user from a chat.
pub async fn remove_member(state: &Arc<DaemonState>, params: &Value) -> Result {
    let chat_id = chat_id_of(params)?;
    let user = parse_pubkey(params, "pubkey")?;
    let chat = require_chat(state, chat_id).await?;
    let client = state
        .mediator_manager
        .get_or_create(chat.mediator_pubkey)
        .await
        .map_err(|e| RpcError::internal_error(&format!("mediator connection failed: {e}")))?;
    client
        .delete_user(chat_id, &user)
        .await
        .map_err(|e| RpcError::internal_error(&format!("delete_user failed: {e}")))?;
    Ok(serde_json::json!({"removed": true}))
}

/// Leave a chat.
pub async fn leave_chat(state: &Arc<DaemonState>, params: &Value) -> Result {
    let chat_id = chat_id_of(params)?;
    let chat = require_chat(state, chat_id).await?;
    let client = state
        .mediator_manager
        .get_or_create(chat.mediator_pubkey)
        .await
        .map_err(|e| RpcError::internal_error(&format!("mediator connection failed: {e}")))?;
    client
        .leave_chat(chat_id)
        .await
        .map_err(|e| RpcError::internal_error(&format!("leave_chat failed: {e}")))?;
    Ok(serde_json::json!({"left": true}))
}

/// Delete a chat (owner operation).
pub async fn delete_chat(state: &Arc<DaemonState>, params: &Value) -> Result {
    let chat_id = chat_id_of(params)?;
    let chat = require_chat(state, chat_id).await?;
    let client = state
        .mediator_manager
        .get_or_create(chat.mediator_pubkey)
        .await
        .map_err(|e| RpcError::internal_error(&format!("mediator connection failed: {e}")))?;
    client
        .delete_chat(chat_id)
        .await
        .map_err(|e| RpcError::internal_error(&format!("delete_chat failed: {e}")))?;
    Ok(serde_json::json!({"deleted": true}))
}

/// Current membership list for a chat, as reported by its mediator.
pub async fn get_members(state: &Arc<DaemonState>, params: &Value) -> Result {
    let chat_id = chat_id_of(params)?;
    let chat = require_chat(state, chat_id).await?;
    let client = state
        .mediator_manager
        .get_or_create(chat.mediator_pubkey)
        .await
        .map_err(|e| RpcError::internal_error(&format!("mediator connection failed: {e}")))?;
    let members = client
        .get_members(chat_id)
        .await
        .map_err(|e| RpcError::internal_error(&format!("get_members failed: {e}")))?;
    Ok(serde_json::json!(members
        .into_iter()
        .map(|m| serde_json::json!({
            "pubkey": hex::encode(m.pubkey),
            "permissions": m.permissions,
            "online": m.online,
            "last_seen": m.last_seen,
        }))
        .collect::<Vec<_>>()))
}
