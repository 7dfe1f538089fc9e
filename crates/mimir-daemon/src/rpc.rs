//! JSON-RPC server over Unix socket.
//!
//! Listens on a Unix domain socket, accepts connections, and dispatches
//! line-delimited JSON-RPC 2.0 method calls to the appropriate command
//! handlers.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tracing::{debug, error, info, warn};

use crate::commands;
use crate::DaemonState;

/// JSON-RPC request.
#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    /// JSON-RPC version (must be "2.0").
    pub jsonrpc: String,
    /// Request ID.
    pub id: serde_json::Value,
    /// Method name.
    pub method: String,
    /// Parameters.
    #[serde(default)]
    pub params: serde_json::Value,
}

/// JSON-RPC success response.
#[derive(Debug, Serialize)]
pub struct RpcResponse {
    /// JSON-RPC version.
    pub jsonrpc: String,
    /// Request ID.
    pub id: serde_json::Value,
    /// Result or error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

/// JSON-RPC error object.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RpcError {
    /// Standard JSON-RPC error code, or a Mimir-specific code below -32000.
    pub code: i32,
    /// Error name.
    pub message: String,
    /// Optional structured data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl RpcResponse {
    pub fn success(id: serde_json::Value, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: serde_json::Value, error: RpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

impl RpcError {
    // Standard JSON-RPC errors.

    pub fn parse_error() -> Self {
        Self {
            code: -32700,
            message: "PARSE_ERROR".to_string(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: -32601,
            message: "METHOD_NOT_FOUND".to_string(),
            data: Some(serde_json::json!({"method": method})),
        }
    }

    pub fn invalid_params(detail: &str) -> Self {
        Self {
            code: -32602,
            message: "INVALID_PARAMS".to_string(),
            data: Some(serde_json::json!({"detail": detail})),
        }
    }

    pub fn internal_error(detail: &str) -> Self {
        Self {
            code: -32603,
            message: "INTERNAL_ERROR".to_string(),
            data: Some(serde_json::json!({"detail": detail})),
        }
    }
}

/// The RPC server.
pub struct RpcServer {
    state: Arc<DaemonState>,
    socket_path: PathBuf,
}

impl RpcServer {
    pub fn new(state: Arc<DaemonState>, socket_path: PathBuf) -> Self {
        Self { state, socket_path }
    }

    /// Run the server, accepting connections.
    pub async fn run(&self) -> anyhow::Result<()> {
        let _ = std::fs::remove_file(&self.socket_path);

        let listener = UnixListener::bind(&self.socket_path)?;
        info!("IPC server listening on {:?}", self.socket_path);

        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let state = self.state.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(state, stream).await {
                            warn!("Connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }
}

/// Handle a single client connection.
async fn handle_connection(state: Arc<DaemonState>, stream: tokio::net::UnixStream) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            break;
        }

        let response = match serde_json::from_str::<RpcRequest>(&line) {
            Ok(request) => dispatch_request(state.clone(), request).await,
            Err(_) => RpcResponse::error(serde_json::Value::Null, RpcError::parse_error()),
        };

        let mut response_json = serde_json::to_string(&response)?;
        response_json.push('\n');
        writer.write_all(response_json.as_bytes()).await?;
        writer.flush().await?;
    }

    Ok(())
}

/// Dispatch a JSON-RPC request to the appropriate command handler.
async fn dispatch_request(state: Arc<DaemonState>, request: RpcRequest) -> RpcResponse {
    let id = request.id.clone();
    let method = request.method.as_str();

    debug!("Dispatching RPC method: {}", method);

    let result = match method {
        // Identity & contacts
        "get_my_pubkey" => commands::identity::get_my_pubkey(&state).await,
        "update_profile" => commands::identity::update_profile(&state, &request.params).await,
        "get_profile" => commands::identity::get_profile(&state).await,
        "get_contact" => commands::identity::get_contact(&state, &request.params).await,
        "get_contacts_with_unsent" => commands::identity::get_contacts_with_unsent(&state).await,

        // Directory & overlay
        "announce" => commands::network::announce(&state, &request.params).await,
        "resolve_peer" => commands::network::resolve_peer(&state, &request.params).await,
        "get_contact_peers" => commands::network::get_contact_peers(&state, &request.params).await,
        "get_tracker_scores" => commands::network::get_tracker_scores(&state).await,
        "get_connected_peers" => commands::network::get_connected_peers(&state).await,
        "add_overlay_peer" => commands::network::add_overlay_peer(&state, &request.params).await,
        "remove_overlay_peer" => commands::network::remove_overlay_peer(&state, &request.params).await,
        "get_overlay_status" => commands::network::get_overlay_status(&state).await,

        // Group chats
        "create_chat" => commands::groups::create_chat(&state, &request.params).await,
        "list_chats" => commands::groups::list_chats(&state).await,
        "get_chat" => commands::groups::get_chat(&state, &request.params).await,
        "subscribe_chat" => commands::groups::subscribe_chat(&state, &request.params).await,
        "send_group_message" => commands::groups::send_group_message(&state, &request.params).await,
        "send_invite" => commands::groups::send_invite(&state, &request.params).await,
        "respond_to_invite" => commands::groups::respond_to_invite(&state, &request.params).await,
        "add_member" => commands::groups::add_member(&state, &request.params).await,
        "remove_member" => commands::groups::remove_member(&state, &request.params).await,
        "leave_chat" => commands::groups::leave_chat(&state, &request.params).await,
        "delete_chat" => commands::groups::delete_chat(&state, &request.params).await,
        "get_members" => commands::groups::get_members(&state, &request.params).await,

        // Direct P2P messaging
        "send_message" => commands::messaging::send_message(&state, &request.params).await,
        "list_unsent_messages" => commands::messaging::list_unsent_messages(&state, &request.params).await,
        "get_message" => commands::messaging::get_message(&state, &request.params).await,

        // Diagnostics & event subscription
        "get_daemon_logs" => commands::diagnostics::get_daemon_logs(&state, &request.params).await,
        "export_diagnostics" => commands::diagnostics::export_diagnostics(&state).await,
        "get_network_stats" => commands::diagnostics::get_network_stats(&state).await,
        "subscribe_events" => commands::diagnostics::subscribe_events(&state, &request.params).await,
        "unsubscribe_events" => commands::diagnostics::unsubscribe_events(&state, &request.params).await,

        _ => Err(RpcError::method_not_found(method)),
    };

    match result {
        Ok(value) => RpcResponse::success(id, value),
        Err(err) => RpcResponse::error(id, err),
    }
}
