//! Directory, overlay, and P2P session command handlers.

use std::sync::Arc;

use mimir_types::traits::{Storage, Transport};
use serde_json::Value;

use crate::rpc::RpcError;
use crate::DaemonState;

type Result = std::result::Result<Value, RpcError>;

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

/// Announce this node's current overlay address to the best tracker
/// (Section 4.3).
pub async fn announce(state: &Arc<DaemonState>, params: &Value) -> Result {
    let priority = params
        .get("priority")
        .and_then(|v| v.as_u64())
        .unwrap_or(0) as u8;
    let address = state.transport.public_key().await;
    let ttl = state
        .directory
        .announce(address, priority, state.config.network.client_id)
        .await
        .map_err(|e| RpcError::internal_error(&format!("announce failed: {e}")))?;
    Ok(serde_json::json!({"ttl": ttl}))
}

/// Resolve a contact's currently announced overlay addresses (Section
/// 4.3). Freshly resolved addresses are cached via `Storage::save_ip`.
pub async fn resolve_peer(state: &Arc<DaemonState>, params: &Value) -> Result {
    let pubkey = parse_pubkey(params)?;
    let peers = state
        .directory
        .resolve_addrs(pubkey)
        .await
        .map_err(|e| RpcError::internal_error(&format!("resolve failed: {e}")))?;
    for peer in &peers {
        if let Err(e) = state
            .storage
            .save_ip(&pubkey, peer.overlay_address, peer.client_id, peer.priority, peer.expiration)
            .await
        {
            tracing::warn!(error = %e, "failed to cache resolved peer address");
        }
    }
    Ok(serde_json::json!(peers
        .into_iter()
        .map(|p| serde_json::json!({
            "overlay_address": hex::encode(p.overlay_address),
            "client_id": p.client_id,
            "priority": p.priority,
            "expiration": p.expiration,
        }))
        .collect::<Vec<_>>()))
}

/// Cached overlay address records for a contact.
pub async fn get_contact_peers(state: &Arc<DaemonState>, params: &Value) -> Result {
    let pubkey = parse_pubkey(params)?;
    let peers = state
        .storage
        .get_contact_peers(&pubkey)
        .await
        .map_err(|e| RpcError::internal_error(&format!("storage error: {e}")))?;
    Ok(serde_json::json!(peers
        .into_iter()
        .map(|p| serde_json::json!({
            "overlay_address": hex::encode(p.overlay_address),
            "client_id": p.client_id,
            "priority": p.priority,
            "expiration": p.expiration,
        }))
        .collect::<Vec<_>>()))
}

/// Current tracker latency scores (Section 4.3).
pub async fn get_tracker_scores(state: &Arc<DaemonState>) -> Result {
    let scores = state.directory.scores().await;
    Ok(serde_json::json!(scores
        .into_iter()
        .map(|s| serde_json::json!({"pubkey": hex::encode(s.pubkey), "score_ms": s.score_ms}))
        .collect::<Vec<_>>()))
}

/// Peer public keys with a currently live P2P session (Section 3 "at
/// most one connection per peer" invariant).
pub async fn get_connected_peers(state: &Arc<DaemonState>) -> Result {
    let peers = state.supervisor.connected_peers().await;
    Ok(serde_json::json!(peers.into_iter().map(hex::encode).collect::<Vec<_>>()))
}

/// Add a peering URI to the overlay transport's configuration (Section
/// 4.8).
pub async fn add_overlay_peer(state: &Arc<DaemonState>, params: &Value) -> Result {
    let uri = params
        .get("uri")
        .and_then(|v| v.as_str())
        .ok_or_else(|| RpcError::invalid_params("uri required"))?;
    state
        .transport
        .add_peer(uri)
        .await
        .map_err(|e| RpcError::internal_error(&format!("transport error: {e}")))?;
    state.peer_controller.notify_network_change().await;
    Ok(serde_json::json!({"added": true}))
}

/// Remove a peering URI from the overlay transport's configuration.
pub async fn remove_overlay_peer(state: &Arc<DaemonState>, params: &Value) -> Result {
    let uri = params
        .get("uri")
        .and_then(|v| v.as_str())
        .ok_or_else(|| RpcError::invalid_params("uri required"))?;
    state
        .transport
        .remove_peer(uri)
        .await
        .map_err(|e| RpcError::internal_error(&format!("transport error: {e}")))?;
    state.peer_controller.notify_network_change().await;
    Ok(serde_json::json!({"removed": true}))
}

/// The current overlay peering/path snapshot, as reported by the
/// transport (Section 4.8).
pub async fn get_overlay_status(state: &Arc<DaemonState>) -> Result {
    let peers_json = state.transport.peers_json().await;
    let paths_json = state.transport.paths_json().await;
    let peers: Value = serde_json::from_str(&peers_json).unwrap_or(Value::Array(vec![]));
    let paths: Value = serde_json::from_str(&paths_json).unwrap_or(Value::Array(vec![]));
    Ok(serde_json::json!({"peers": peers, "paths": paths}))
}
