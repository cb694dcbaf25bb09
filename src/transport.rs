//! # Secure Transport
//!
//! Capability interface between the session layer and whatever produces
//! authenticated byte streams. A transport listens, dials, and hands back
//! [`SecureStream`]s whose remote identity has already been verified.
//!
//! Two variants exist:
//!
//! | Variant | Use |
//! |---------|-----|
//! | [`QuicTransport`] | QUIC + TLS 1.3 mutual auth, one bidirectional stream per session |
//! | [`MemoryTransport`](crate::memory::MemoryTransport) | in-process pipes for tests |
//!
//! ## QUIC session setup
//!
//! 1. TLS handshake; both certificates verified by [`crate::crypto`]
//! 2. NodeId read back from the peer's verified certificate
//! 3. Dialer opens one bidirectional stream and writes [`SESSION_PREAMBLE`]
//! 4. Acceptor reads and checks the preamble; the stream now carries frames

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use quinn::{ClientConfig, Connection, Endpoint, VarInt};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::crypto::{
    SERVER_NAME, create_client_config, create_server_config, extract_verified_identity,
    generate_ed25519_cert,
};
use crate::error::{DisconnectReason, NetworkError};
use crate::identity::{Keypair, NodeId, PeerEndpoint};

/// First bytes written on a fresh session stream.
pub const SESSION_PREAMBLE: &[u8; 8] = b"MGSESS01";

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Inbound handshake that has been accepted but not yet completed.
pub type PendingHandshake = Pin<Box<dyn Future<Output = Result<SecureStream, NetworkError>> + Send>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Handle on the connection underneath a stream.
pub trait TransportLink: Send + Sync {
    fn is_open(&self) -> bool;
    fn close(&self, reason: DisconnectReason);
}

/// An authenticated duplex stream to a verified peer.
pub struct SecureStream {
    pub peer: NodeId,
    pub remote: PeerEndpoint,
    pub direction: Direction,
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    pub link: Arc<dyn TransportLink>,
}

impl fmt::Debug for SecureStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureStream")
            .field("peer", &self.peer)
            .field("remote", &self.remote)
            .field("direction", &self.direction)
            .field("open", &self.link.is_open())
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait SecureTransport: Send + Sync + 'static {
    /// Endpoint other nodes can dial to reach this transport.
    fn local_endpoint(&self) -> PeerEndpoint;

    /// Wait for the next inbound connection. `None` once the transport is closed.
    async fn accept(&self) -> Option<PendingHandshake>;

    /// Dial and authenticate a peer.
    async fn dial(&self, endpoint: &PeerEndpoint) -> Result<SecureStream, NetworkError>;

    /// Stop listening. Established streams are unaffected.
    fn close(&self);
}

struct QuicLink(Connection);

impl TransportLink for QuicLink {
    fn is_open(&self) -> bool {
        self.0.close_reason().is_none()
    }

    fn close(&self, reason: DisconnectReason) {
        self.0
            .close(VarInt::from_u32(reason.code()), reason.as_str().as_bytes());
    }
}

pub struct QuicTransport {
    endpoint: Endpoint,
    client_config: ClientConfig,
    local: PeerEndpoint,
}

impl QuicTransport {
    /// Bind a QUIC endpoint presenting a certificate derived from `keypair`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(addr: SocketAddr, keypair: &Keypair) -> Result<Self> {
        let (server_certs, server_key) = generate_ed25519_cert(keypair)?;
        let (client_certs, client_key) = generate_ed25519_cert(keypair)?;
        let server_config = create_server_config(server_certs, server_key)?;
        let client_config = create_client_config(client_certs, client_key)?;

        let endpoint = Endpoint::server(server_config, addr)
            .with_context(|| format!("failed to bind QUIC endpoint on {}", addr))?;
        let local = PeerEndpoint::from(
            endpoint
                .local_addr()
                .context("failed to read bound QUIC address")?,
        );

        debug!(local = %local, "QUIC transport bound");

        Ok(Self {
            endpoint,
            client_config,
            local,
        })
    }
}

async fn resolve(endpoint: &PeerEndpoint) -> Result<SocketAddr, NetworkError> {
    let mut addrs = tokio::net::lookup_host((endpoint.host(), endpoint.port()))
        .await
        .map_err(|e| NetworkError::HandshakeFailed(format!("cannot resolve {}: {}", endpoint, e)))?;
    addrs
        .next()
        .ok_or_else(|| NetworkError::HandshakeFailed(format!("no address for {}", endpoint)))
}

#[async_trait]
impl SecureTransport for QuicTransport {
    fn local_endpoint(&self) -> PeerEndpoint {
        self.local.clone()
    }

    async fn accept(&self) -> Option<PendingHandshake> {
        let incoming = self.endpoint.accept().await?;
        Some(Box::pin(async move {
            let connection = incoming
                .await
                .map_err(|e| NetworkError::HandshakeFailed(e.to_string()))?;
            let peer = match extract_verified_identity(&connection) {
                Ok(peer) => peer,
                Err(e) => {
                    connection.close(VarInt::from_u32(0), b"unverified");
                    return Err(e);
                }
            };

            let (send, mut recv) = connection
                .accept_bi()
                .await
                .map_err(|_| NetworkError::TransportClosed)?;

            let mut preamble = [0u8; SESSION_PREAMBLE.len()];
            let preamble_ok = recv.read_exact(&mut preamble).await.is_ok() && &preamble == SESSION_PREAMBLE;
            if !preamble_ok {
                connection.close(VarInt::from_u32(0), b"bad preamble");
                return Err(NetworkError::HandshakeFailed("missing session preamble".into()));
            }

            Ok(SecureStream {
                peer,
                remote: PeerEndpoint::from(connection.remote_address()),
                direction: Direction::Inbound,
                reader: Box::new(recv),
                writer: Box::new(send),
                link: Arc::new(QuicLink(connection)),
            })
        }))
    }

    async fn dial(&self, endpoint: &PeerEndpoint) -> Result<SecureStream, NetworkError> {
        let addr = resolve(endpoint).await?;
        let connecting = self
            .endpoint
            .connect_with(self.client_config.clone(), addr, SERVER_NAME)
            .map_err(|e| NetworkError::HandshakeFailed(e.to_string()))?;
        let connection = connecting
            .await
            .map_err(|e| NetworkError::HandshakeFailed(e.to_string()))?;
        let peer = extract_verified_identity(&connection)?;

        let (mut send, recv) = connection
            .open_bi()
            .await
            .map_err(|_| NetworkError::TransportClosed)?;
        send.write_all(SESSION_PREAMBLE)
            .await
            .map_err(|_| NetworkError::TransportClosed)?;

        Ok(SecureStream {
            peer,
            remote: endpoint.clone(),
            direction: Direction::Outbound,
            reader: Box::new(recv),
            writer: Box::new(send),
            link: Arc::new(QuicLink(connection)),
        })
    }

    fn close(&self) {
        self.endpoint.close(VarInt::from_u32(0), b"shutdown");
    }
}
