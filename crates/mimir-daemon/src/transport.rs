//! A minimal TCP-based stand-in for the overlay transport collaborator
//! (Section 6).
//!
//! The real Yggdrasil-style overlay and its QUIC-based node-to-node
//! transport are out of scope for this core (Section 1: "the overlay
//! transport... consumed only through named interfaces") — the teacher
//! repo's own `ochra-transport` crate builds a full onion-routed QUIC
//! stack for a different protocol entirely and was deliberately not
//! pulled into this workspace (see `DESIGN.md`). What the daemon binary
//! needs is just enough of a concrete `Transport`/`Connection` pair to
//! actually open sockets for local development and the integration
//! tests; a production deployment swaps this module out for a real
//! overlay binding without touching any other crate, since every
//! consumer only ever sees the `mimir_types::traits::Transport` trait
//! object.

use std::collections::HashMap;
use std::net::SocketAddr;

use async_trait::async_trait;
use mimir_types::model::{OverlayAddress, PeerKey};
use mimir_types::traits::{Connection, Transport};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum TcpTransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no known address for peer")]
    UnknownPeer,
}

/// One bidirectional TCP stream standing in for an overlay `Connection`.
pub struct TcpConnection {
    stream: TcpStream,
}

impl TcpConnection {
    fn new(stream: TcpStream) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl Connection for TcpConnection {
    type Error = TcpTransportError;

    async fn write(&mut self, data: &[u8]) -> Result<(), Self::Error> {
        self.stream.write_all(data).await?;
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        Ok(self.stream.read(buf).await?)
    }

    async fn read_with_timeout(
        &mut self,
        buf: &mut [u8],
        timeout_ms: u64,
    ) -> Result<Option<usize>, Self::Error> {
        match tokio::time::timeout(
            std::time::Duration::from_millis(timeout_ms),
            self.stream.read(buf),
        )
        .await
        {
            Ok(result) => Ok(Some(result?)),
            Err(_elapsed) => Ok(None),
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

/// Deterministically folds a socket address into a 32-byte pseudo
/// overlay address, so the NAT-aware subnet check in Section 4.4 has
/// something stable to compare against during local development. Not a
/// real Yggdrasil address.
fn pseudo_overlay_address(addr: SocketAddr) -> OverlayAddress {
    let mut out = [0u8; 32];
    match addr.ip() {
        std::net::IpAddr::V4(v4) => {
            out[0] = 0x02;
            out[28..32].copy_from_slice(&v4.octets());
        }
        std::net::IpAddr::V6(v6) => {
            out[..16].copy_from_slice(&v6.octets()[..16]);
        }
    }
    let port = addr.port().to_be_bytes();
    out[16..18].copy_from_slice(&port);
    out
}

/// A dev-grade overlay transport over plain TCP. `PeerKey -> SocketAddr`
/// resolution comes from an in-memory address book populated by
/// `add_peer`/config bootstrap entries, rather than actual mesh routing.
pub struct TcpOverlayTransport {
    listener: TcpListener,
    local_addr: SocketAddr,
    address_book: Mutex<HashMap<PeerKey, SocketAddr>>,
    peering_uris: Mutex<Vec<String>>,
}

impl TcpOverlayTransport {
    pub async fn bind(port: u16) -> Result<Self, TcpTransportError> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            address_book: Mutex::new(HashMap::new()),
            peering_uris: Mutex::new(Vec::new()),
        })
    }

    /// Record where a peer's HELLO-advertised pubkey can be reached.
    /// Used both for outbound dials and to seed the address book from
    /// `DaemonConfig`'s `mediators[].address_hint`.
    pub async fn register_peer_address(&self, pubkey: PeerKey, addr: SocketAddr) {
        self.address_book.lock().await.insert(pubkey, addr);
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl Transport for TcpOverlayTransport {
    type Conn = TcpConnection;
    type Error = TcpTransportError;

    async fn connect(&self, peer_pubkey: &PeerKey) -> Result<Self::Conn, Self::Error> {
        let addr = *self
            .address_book
            .lock()
            .await
            .get(peer_pubkey)
            .ok_or(TcpTransportError::UnknownPeer)?;
        let stream = TcpStream::connect(addr).await?;
        Ok(TcpConnection::new(stream))
    }

    async fn accept(&self) -> Result<(Self::Conn, OverlayAddress), Self::Error> {
        let (stream, remote) = self.listener.accept().await?;
        Ok((TcpConnection::new(stream), pseudo_overlay_address(remote)))
    }

    async fn close_connection(&self, peer_pubkey: &PeerKey) {
        self.address_book.lock().await.remove(peer_pubkey);
    }

    async fn peers_json(&self) -> String {
        let uris = self.peering_uris.lock().await;
        let entries: Vec<serde_json::Value> = uris
            .iter()
            .map(|uri| serde_json::json!({"remote": uri, "up": true, "cost": 10.0}))
            .collect();
        serde_json::to_string(&entries).unwrap_or_else(|_| "[]".to_string())
    }

    async fn paths_json(&self) -> String {
        "[]".to_string()
    }

    async fn add_peer(&self, uri: &str) -> Result<(), Self::Error> {
        self.peering_uris.lock().await.push(uri.to_string());
        Ok(())
    }

    async fn remove_peer(&self, uri: &str) -> Result<(), Self::Error> {
        self.peering_uris.lock().await.retain(|u| u != uri);
        Ok(())
    }

    async fn public_key(&self) -> OverlayAddress {
        pseudo_overlay_address(self.local_addr)
    }
}
