//! mimir-daemon: the Mimir network daemon.
//!
//! Single OS process running a Tokio async runtime. Wires the protocol
//! core crates (directory client, P2P supervisor, mediator manager, peer
//! controller) to a concrete SQLite `Storage`/`InfoProvider` and a
//! dev-grade TCP overlay transport, then exposes them over JSON-RPC on a
//! Unix socket (Section 32).

mod commands;
mod config;
mod events;
mod listeners;
mod rpc;
mod storage;
mod transport;

use std::path::PathBuf;
use std::sync::Arc;

use mimir_crypto::ed25519::SigningKey;
use mimir_directory::{DirectoryClient, TrackerList};
use mimir_mediator::MediatorManager;
use mimir_peercontrol::PeerController;
use mimir_server::Supervisor;
use mimir_types::model::PeerKey;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::config::DaemonConfig;
use crate::events::{Event, EventBus};
use crate::listeners::{
    DaemonEventListener, DaemonMediatorListener, DaemonPeerListener, DaemonResolverReceiver,
};
use crate::rpc::RpcServer;
use crate::storage::SqliteStorage;
use crate::transport::TcpOverlayTransport;

/// Daemon-wide shared state, handed to every RPC command handler as
/// `Arc<DaemonState>`.
pub struct DaemonState {
    pub storage: Arc<SqliteStorage>,
    pub transport: Arc<TcpOverlayTransport>,
    pub directory: Arc<DirectoryClient<TcpOverlayTransport>>,
    pub supervisor: Arc<Supervisor<TcpOverlayTransport, SqliteStorage>>,
    pub mediator_manager: Arc<MediatorManager<TcpOverlayTransport, SqliteStorage, SqliteStorage>>,
    pub peer_controller: Arc<PeerController<TcpOverlayTransport>>,
    pub signing_key: SigningKey,
    pub local_pubkey: PeerKey,
    pub config: DaemonConfig,
    pub event_bus: Arc<EventBus>,
    pub shutdown_tx: broadcast::Sender<()>,
}

/// Load the persisted signing key from storage, generating and saving a
/// fresh one on first run.
async fn load_or_generate_identity(storage: &SqliteStorage) -> anyhow::Result<SigningKey> {
    if let Some(bytes) = storage.load_identity().await? {
        return Ok(SigningKey::from_bytes(&bytes));
    }
    let key = SigningKey::generate();
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    storage.save_identity(&key.to_bytes(), now).await?;
    Ok(key)
}

fn parse_pubkey_hex(hex_str: &str) -> anyhow::Result<PeerKey> {
    let bytes = hex::decode(hex_str)?;
    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("public key must be 32 bytes, got hex {hex_str:?}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mimir=info".parse()?),
        )
        .init();

    info!("Mimir daemon starting");

    // 1. Load config
    let config = DaemonConfig::load()?;
    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)?;
    std::fs::create_dir_all(config.attachments_dir())?;

    // 2. Open storage and load/generate identity
    let db_path = data_dir.join("mimir.db");
    let storage = Arc::new(SqliteStorage::open(&db_path)?);
    let signing_key = load_or_generate_identity(&storage).await?;
    let local_pubkey = signing_key.verifying_key().to_bytes();
    info!(pubkey = %hex::encode(local_pubkey), "identity loaded");

    // 3. Bind the overlay transport and seed its address book from
    // configured mediator hints.
    let transport = Arc::new(TcpOverlayTransport::bind(config.network.listen_port).await?);
    info!(addr = ?transport.local_addr(), "overlay transport bound");
    for mediator in &config.network.mediators {
        let pubkey = parse_pubkey_hex(&mediator.pubkey_hex)?;
        if let Some(hint) = &mediator.address_hint {
            let addr: std::net::SocketAddr = hint.parse()?;
            transport.register_peer_address(pubkey, addr).await;
        }
    }

    // 4. Event bus and shutdown channel
    let event_bus = Arc::new(EventBus::new(1000));
    let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);

    // 5. Directory client
    let trackers = config
        .network
        .tracker_pubkeys_hex
        .iter()
        .map(|s| parse_pubkey_hex(s))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let directory = Arc::new(DirectoryClient::new(
        transport.clone(),
        TrackerList::new(trackers),
        local_pubkey,
        signing_key.clone(),
        DaemonResolverReceiver::new(event_bus.clone()),
    ));

    // 6. P2P supervisor
    let event_listener = DaemonEventListener::new(event_bus.clone(), storage.clone());
    let supervisor = Supervisor::new(
        transport.clone(),
        storage.clone(),
        directory.clone(),
        signing_key.clone(),
        local_pubkey,
        config.network.client_id,
        event_listener.clone(),
    );
    event_listener.bind_supervisor(&supervisor);

    // 7. Mediator manager
    let mediator_manager = MediatorManager::new(
        transport.clone(),
        storage.clone(),
        storage.clone(),
        local_pubkey,
        signing_key.clone(),
        config.attachments_dir(),
        DaemonMediatorListener::new(event_bus.clone()),
    );

    // 8. Peer controller, wired to toggle the mediator manager's
    // reconnect policy on overlay online/offline transitions (Section 4.7
    // "if the network is offline, cancel").
    let peer_controller = PeerController::new(transport.clone());
    peer_controller
        .register_listener(DaemonPeerListener::new(event_bus.clone()))
        .await;
    peer_controller
        .register_listener(Arc::new(NetworkOnlineBridge {
            mediator_manager: mediator_manager.clone(),
        }))
        .await;

    let state = Arc::new(DaemonState {
        storage,
        transport: transport.clone(),
        directory,
        supervisor: supervisor.clone(),
        mediator_manager: mediator_manager.clone(),
        peer_controller: peer_controller.clone(),
        signing_key,
        local_pubkey,
        config,
        event_bus: event_bus.clone(),
        shutdown_tx: shutdown_tx.clone(),
    });

    // 9. Spawn the long-running core tasks.
    tokio::spawn(supervisor.clone().run_accept_loop());
    tokio::spawn(supervisor.run_pending_loop());
    tokio::spawn(peer_controller.run());
    mediator_manager.start().await;

    // 10. Start the RPC surface.
    let socket_path: PathBuf = state.config.data_dir().join("daemon.sock");
    let rpc_server = RpcServer::new(state.clone(), socket_path.clone());
    info!(socket = ?socket_path, "starting JSON-RPC server");

    event_bus.emit(Event {
        event_type: "DaemonStarted".to_string(),
        timestamp: std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs(),
        payload: serde_json::json!({"version": env!("CARGO_PKG_VERSION")}),
    });

    let mut shutdown_rx = shutdown_tx.subscribe();
    tokio::select! {
        result = rpc_server.run() => {
            if let Err(e) = result {
                error!("RPC server error: {}", e);
            }
        }
        _ = shutdown_rx.recv() => {
            info!("Shutdown signal received");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, shutting down");
        }
    }

    info!("Daemon shutting down gracefully");
    peer_controller.stop();
    let _ = std::fs::remove_file(&socket_path);
    info!("Daemon stopped");
    Ok(())
}

/// Keeps `MediatorManager::set_network_online` in sync with the peer
/// controller's online/offline transitions, so its reconnect loops cancel
/// while the overlay itself is down.
struct NetworkOnlineBridge {
    mediator_manager: Arc<MediatorManager<TcpOverlayTransport, SqliteStorage, SqliteStorage>>,
}

#[async_trait::async_trait]
impl mimir_types::traits::PeerStateListener for NetworkOnlineBridge {
    async fn on_peer_state(&self, online: bool, _host: String, _cost: f64) {
        self.mediator_manager.set_network_online(online);
    }
}
