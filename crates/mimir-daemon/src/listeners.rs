//! Bridges from the core crates' collaborator-callback traits
//! (`mimir_types::traits::{EventListener, MediatorListener,
//! PeerStateListener, ResolverReceiver}`) to the daemon's JSON event bus.
//!
//! Every bridge here is a thin `Arc<EventBus>` wrapper: the durable side
//! effects (`mark_delivered`, assembling and storing group messages) are
//! already applied inside `mimir-server`/`mimir-mediator`/`mimir-assembler`
//! before these callbacks fire, so these only need to translate a
//! callback into a notification the UI can subscribe to. The one
//! exception is `DaemonEventListener::on_client_connected`, which also
//! drains Storage's queue of unsent messages for the newly connected
//! peer (Section 8, Testable Property 5 "delivery liveness" — nothing
//! else in this workspace resends a message that was queued before its
//! session existed).

use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use mimir_server::Supervisor;
use mimir_types::model::{GroupMessage, Invite, PeerKey, SystemEvent};
use mimir_types::traits::{EventListener, MediatorListener, PeerStateListener, ResolverReceiver, Storage};
use tracing::warn;

use crate::events::{Event, EventBus};
use crate::storage::SqliteStorage;
use crate::transport::TcpOverlayTransport;

fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn emit(bus: &EventBus, event_type: &str, payload: serde_json::Value) {
    bus.emit(Event {
        event_type: event_type.to_string(),
        timestamp: now(),
        payload,
    });
}

/// Upstream for `mimir-server`'s [`Supervisor`](mimir_server::Supervisor).
///
/// Holds only a `Weak` back-reference to the supervisor it resends
/// through, set once via [`bind_supervisor`](Self::bind_supervisor) after
/// `Supervisor::new` has returned (the supervisor isn't constructed until
/// after it is handed this listener as its upstream, so the reference
/// can't exist at construction time the way `mimir-mediator`'s
/// `ManagerEvents` does it). The supervisor owns this listener strongly
/// through its `upstream` field; a strong reference back would leak both.
pub struct DaemonEventListener {
    bus: Arc<EventBus>,
    storage: Arc<SqliteStorage>,
    supervisor: OnceLock<Weak<Supervisor<TcpOverlayTransport, SqliteStorage>>>,
}

impl DaemonEventListener {
    pub fn new(bus: Arc<EventBus>, storage: Arc<SqliteStorage>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            storage,
            supervisor: OnceLock::new(),
        })
    }

    pub fn bind_supervisor(&self, supervisor: &Arc<Supervisor<TcpOverlayTransport, SqliteStorage>>) {
        let _ = self.supervisor.set(Arc::downgrade(supervisor));
    }
}

#[async_trait]
impl EventListener for DaemonEventListener {
    async fn on_client_connected(&self, peer: PeerKey) {
        emit(
            &self.bus,
            "ClientConnected",
            serde_json::json!({"peer": hex::encode(peer)}),
        );

        if let Some(supervisor) = self.supervisor.get().and_then(Weak::upgrade) {
            match self.storage.get_unsent_messages(&peer).await {
                Ok(messages) => {
                    for message in messages {
                        supervisor.send_if_connected(&peer, message).await;
                    }
                }
                Err(e) => warn!(peer = %hex::encode(peer), error = %e, "failed to drain unsent messages on connect"),
            }
        }
    }

    async fn on_connection_closed(&self, peer: PeerKey) {
        emit(
            &self.bus,
            "ConnectionClosed",
            serde_json::json!({"peer": hex::encode(peer)}),
        );
    }

    async fn on_message_delivered(&self, peer: PeerKey, guid: u64) {
        emit(
            &self.bus,
            "MessageDelivered",
            serde_json::json!({"peer": hex::encode(peer), "guid": guid}),
        );
    }

    async fn on_message_received(&self, peer: PeerKey, guid: u64, msg_type: u16, data: Vec<u8>) {
        emit(
            &self.bus,
            "MessageReceived",
            serde_json::json!({
                "peer": hex::encode(peer),
                "guid": guid,
                "msg_type": msg_type,
                "data": hex::encode(data),
            }),
        );
    }
}

/// Upstream for `mimir-mediator`'s [`MediatorManager`](mimir_mediator::MediatorManager).
pub struct DaemonMediatorListener {
    bus: Arc<EventBus>,
}

impl DaemonMediatorListener {
    pub fn new(bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self { bus })
    }
}

#[async_trait]
impl MediatorListener for DaemonMediatorListener {
    async fn on_chat_message(&self, chat_id: u64, message: GroupMessage) {
        emit(
            &self.bus,
            "ChatMessage",
            serde_json::json!({
                "chat_id": chat_id,
                "server_msg_id": message.server_msg_id,
                "guid": message.guid,
                "author": hex::encode(message.author),
                "timestamp": message.timestamp,
                "msg_type": message.msg_type,
                "data": hex::encode(message.data),
            }),
        );
    }

    async fn on_system_event(
        &self,
        chat_id: u64,
        event: SystemEvent,
        target: Option<PeerKey>,
        actor: Option<PeerKey>,
    ) {
        emit(
            &self.bus,
            "SystemEvent",
            serde_json::json!({
                "chat_id": chat_id,
                "event": format!("{event:?}"),
                "target": target.map(hex::encode),
                "actor": actor.map(hex::encode),
            }),
        );
    }

    async fn on_invite(&self, invite: Invite) {
        emit(
            &self.bus,
            "InviteReceived",
            serde_json::json!({
                "chat_id": invite.chat_id,
                "inviter": hex::encode(invite.inviter),
                "invitee": hex::encode(invite.invitee),
                "created_at": invite.created_at,
            }),
        );
    }

    async fn on_chat_reconnected(&self, chat_id: u64) {
        emit(
            &self.bus,
            "ChatReconnected",
            serde_json::json!({"chat_id": chat_id}),
        );
    }

    async fn on_disconnected(&self, mediator_pubkey: PeerKey, reason: String) {
        emit(
            &self.bus,
            "MediatorDisconnected",
            serde_json::json!({"mediator": hex::encode(mediator_pubkey), "reason": reason}),
        );
    }
}

/// Upstream for `mimir-peercontrol`'s [`PeerController`](mimir_peercontrol::PeerController).
pub struct DaemonPeerListener {
    bus: Arc<EventBus>,
}

impl DaemonPeerListener {
    pub fn new(bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self { bus })
    }
}

#[async_trait]
impl PeerStateListener for DaemonPeerListener {
    async fn on_peer_state(&self, online: bool, host: String, cost: f64) {
        emit(
            &self.bus,
            "PeerStateChanged",
            serde_json::json!({"online": online, "host": host, "cost": cost}),
        );
    }
}

/// Upstream for `mimir-directory`'s [`DirectoryClient`](mimir_directory::DirectoryClient).
pub struct DaemonResolverReceiver {
    bus: Arc<EventBus>,
}

impl DaemonResolverReceiver {
    pub fn new(bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self { bus })
    }
}

#[async_trait]
impl ResolverReceiver for DaemonResolverReceiver {
    async fn on_announce(&self, ttl: u64) {
        emit(&self.bus, "TrackerAnnounced", serde_json::json!({"ttl": ttl}));
    }

    async fn on_error(&self) {
        emit(&self.bus, "TrackerError", serde_json::json!({}));
    }
}
