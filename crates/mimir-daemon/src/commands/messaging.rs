//! Direct P2P messaging command handlers (Section 4.4/4.5).

use std::sync::Arc;

use mimir_types::model::OutboundMessage;
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

fn parse_pubkey(params: &Value, field: &str) -> std::result::Result<mimir_types::model::PeerKey, RpcError> {
    let hex_str = params
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| RpcError::invalid_params(&format!("{field} required")))?;
    let bytes = hex::decode(hex_str).map_err(|_| RpcError::invalid_params(&format!("{field} must be hex")))?;
    bytes
        .try_into()
        .map_err(|_| RpcError::invalid_params(&format!("{field} must be 32 bytes")))
}

fn message_json(msg: &OutboundMessage) -> Value {
    serde_json::json!({
        "guid": msg.guid,
        "reply_to": msg.reply_to,
        "send_time": msg.send_time,
        "edit_time": msg.edit_time,
        "msg_type": msg.msg_type,
        "data": hex::encode(&msg.data),
    })
}

/// Queue an outbound P2P message. If a session to the peer is already
/// live, hand it straight to the session's send queue (Section 3:
/// `send_if_connected` only short-circuits the next dial-policy scan,
/// the record still persists until the delivery receipt arrives).
pub async fn send_message(state: &Arc<DaemonState>, params: &Value) -> Result {
    let peer = parse_pubkey(params, "peer")?;
    let guid = params
        .get("guid")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| RpcError::invalid_params("guid required"))?;
    let reply_to = params.get("reply_to").and_then(|v| v.as_u64()).unwrap_or(0);
    let msg_type = params
        .get("msg_type")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| RpcError::invalid_params("msg_type required"))? as u16;
    let data_hex = params
        .get("data")
        .and_then(|v| v.as_str())
        .ok_or_else(|| RpcError::invalid_params("data (hex) required"))?;
    let data = hex::decode(data_hex).map_err(|_| RpcError::invalid_params("data must be hex"))?;

    let message = OutboundMessage {
        guid,
        reply_to,
        send_time: now(),
        edit_time: 0,
        msg_type,
        data,
    };

    state
        .storage
        .queue_outbound_message(&peer, &message)
        .await
        .map_err(|e| RpcError::internal_error(&format!("storage error: {e}")))?;

    let delivered_inline = state.supervisor.send_if_connected(&peer, message).await;
    Ok(serde_json::json!({"queued": true, "sent_inline": delivered_inline}))
}

/// Undelivered messages queued for a peer.
pub async fn list_unsent_messages(state: &Arc<DaemonState>, params: &Value) -> Result {
    let peer = parse_pubkey(params, "peer")?;
    let messages = state
        .storage
        .get_unsent_messages(&peer)
        .await
        .map_err(|e| RpcError::internal_error(&format!("storage error: {e}")))?;
    Ok(serde_json::json!(messages.iter().map(message_json).collect::<Vec<_>>()))
}

/// A single outbound message by guid.
pub async fn get_message(state: &Arc<DaemonState>, params: &Value) -> Result {
    let guid = params
        .get("guid")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| RpcError::invalid_params("guid required"))?;
    let message = state
        .storage
        .get_message(guid)
        .await
        .map_err(|e| RpcError::internal_error(&format!("storage error: {e}")))?;
    Ok(message.as_ref().map(message_json).unwrap_or(Value::Null))
}
