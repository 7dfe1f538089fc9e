//! Identity & contact command handlers.

use std::sync::Arc;

use mimir_types::traits::Storage;
use serde_json::Value;

use crate::rpc::RpcError;
use crate::DaemonState;

type Result = std::result::Result<Value, RpcError>;

fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// This node's own Ed25519 public key, as 64-char lower-case hex.
pub async fn get_my_pubkey(state: &Arc<DaemonState>) -> Result {
    Ok(serde_json::json!({"pubkey": hex::encode(state.local_pubkey)}))
}

/// Update the local profile (Section 4.7 `update_member_info` source).
pub async fn update_profile(state: &Arc<DaemonState>, params: &Value) -> Result {
    let nickname = params
        .get("nickname")
        .and_then(|v| v.as_str())
        .ok_or_else(|| RpcError::invalid_params("nickname required"))?;
    let info = params.get("info").and_then(|v| v.as_str()).unwrap_or("");

    state
        .storage
        .set_my_profile(nickname, info, &[], now())
        .await
        .map_err(|e| RpcError::internal_error(&format!("storage error: {e}")))?;

    Ok(serde_json::json!({"updated": true}))
}

/// The local profile as last set by [`update_profile`].
pub async fn get_profile(state: &Arc<DaemonState>) -> Result {
    use mimir_types::traits::InfoProvider;
    let profile = state
        .storage
        .get_my_info(0)
        .await
        .map_err(|e| RpcError::internal_error(&format!("storage error: {e}")))?;
    match profile {
        Some(p) => Ok(serde_json::json!({
            "nickname": p.nickname,
            "info": p.info,
            "updated_at": p.updated_at,
        })),
        None => Ok(serde_json::json!({"nickname": "", "info": "", "updated_at": 0})),
    }
}

fn parse_pubkey(params: &Value) -> std::result::Result<mimir_types::model::PeerKey, RpcError> {
    let hex_str = params
        .get("pubkey")
        .and_then(|v| v.as_str())
        .ok_or_else(|| RpcError::invalid_params("pubkey required"))?;
    let bytes = hex::decode(hex_str).map_err(|_| RpcError::invalid_params("pubkey must be hex"))?;
    bytes
        .try_into()
        .map_err(|_| RpcError::invalid_params("pubkey must be 32 bytes"))
}

/// Look up a locally known contact record.
pub async fn get_contact(state: &Arc<DaemonState>, params: &Value) -> Result {
    let pubkey = parse_pubkey(params)?;
    let contact = state
        .storage
        .get_contact(&pubkey)
        .await
        .map_err(|e| RpcError::internal_error(&format!("storage error: {e}")))?;
    Ok(serde_json::to_value(contact).unwrap_or(Value::Null))
}

/// Contacts that currently have at least one undelivered outbound
/// message (Section 4.5 dial policy input).
pub async fn get_contacts_with_unsent(state: &Arc<DaemonState>) -> Result {
    let pubkeys = state
        .storage
        .get_contacts_with_unsent_messages()
        .await
        .map_err(|e| RpcError::internal_error(&format!("storage error: {e}")))?;
    Ok(serde_json::json!(pubkeys.into_iter().map(hex::encode).collect::<Vec<_>>()))
}
