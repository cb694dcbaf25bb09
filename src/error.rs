//! Error taxonomy shared by the session, routing and topic layers.
//!
//! Setup paths (binding sockets, building certificates) return
//! `anyhow::Result`; everything a caller can meaningfully react to at runtime
//! is a [`NetworkError`].

use std::fmt;

use crate::identity::{NodeId, PeerEndpoint};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// The dial did not complete within the configured connect timeout.
    ConnectTimeout,
    /// TLS negotiation or peer identity verification failed.
    HandshakeFailed(String),
    /// The underlying stream is gone, or the session is no longer active.
    TransportClosed,
    /// No active session exists for the target node.
    PeerUnreachable(NodeId),
    /// No node (local or remote) subscribes to the topic.
    NoSubscriber(String),
    /// No correlated response arrived in time.
    RequestTimeout,
    /// A session for this node already exists; the newer one was rejected.
    DuplicateSession(NodeId),
    /// The peer's outbound queue is full; the message was not enqueued.
    QueueFull(NodeId),
    /// An outbound attempt to the same endpoint is still in flight.
    AlreadyConnecting(PeerEndpoint),
    /// The remote side answered with a failure status.
    Rejected(String),
    /// A frame or payload could not be encoded or decoded.
    Codec(String),
    /// The component was stopped before the operation could complete.
    Shutdown,
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::ConnectTimeout => write!(f, "connection attempt timed out"),
            NetworkError::HandshakeFailed(reason) => write!(f, "handshake failed: {}", reason),
            NetworkError::TransportClosed => write!(f, "transport closed"),
            NetworkError::PeerUnreachable(node) => {
                write!(f, "no active session for peer {}", &node.to_hex()[..16])
            }
            NetworkError::NoSubscriber(topic) => write!(f, "no subscriber for topic '{}'", topic),
            NetworkError::RequestTimeout => write!(f, "request timed out"),
            NetworkError::DuplicateSession(node) => {
                write!(f, "session for peer {} already exists", &node.to_hex()[..16])
            }
            NetworkError::QueueFull(node) => {
                write!(f, "outbound queue for peer {} is full", &node.to_hex()[..16])
            }
            NetworkError::AlreadyConnecting(endpoint) => {
                write!(f, "already connecting to {}", endpoint)
            }
            NetworkError::Rejected(reason) => write!(f, "rejected by remote: {}", reason),
            NetworkError::Codec(reason) => write!(f, "codec error: {}", reason),
            NetworkError::Shutdown => write!(f, "shut down"),
        }
    }
}

impl std::error::Error for NetworkError {}

impl From<bincode::Error> for NetworkError {
    fn from(err: bincode::Error) -> Self {
        NetworkError::Codec(err.to_string())
    }
}

/// Why a session was torn down. Carried to the remote in the QUIC close frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    LocalShutdown,
    RemoteClosed,
    TransportError,
    DuplicatePeer,
    SelfConnection,
    Requested,
}

impl DisconnectReason {
    pub fn code(self) -> u32 {
        match self {
            DisconnectReason::LocalShutdown => 1,
            DisconnectReason::RemoteClosed => 2,
            DisconnectReason::TransportError => 3,
            DisconnectReason::DuplicatePeer => 4,
            DisconnectReason::SelfConnection => 5,
            DisconnectReason::Requested => 6,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DisconnectReason::LocalShutdown => "local shutdown",
            DisconnectReason::RemoteClosed => "remote closed",
            DisconnectReason::TransportError => "transport error",
            DisconnectReason::DuplicatePeer => "duplicate peer",
            DisconnectReason::SelfConnection => "self connection",
            DisconnectReason::Requested => "requested",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type CompletionFn<T> = Box<dyn FnOnce(Result<T, NetworkError>) + Send + 'static>;

/// Consumable handle around a result callback.
///
/// The callback runs exactly once: either through [`Completion::complete`],
/// or with [`NetworkError::Shutdown`] when the token is dropped unconsumed
/// (for example because the task carrying it was aborted).
pub struct Completion<T: 'static> {
    callback: Option<CompletionFn<T>>,
}

impl<T: 'static> Completion<T> {
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce(Result<T, NetworkError>) + Send + 'static,
    {
        Self {
            callback: Some(Box::new(callback)),
        }
    }

    pub fn complete(mut self, result: Result<T, NetworkError>) {
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }
}

impl<T: 'static> Drop for Completion<T> {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback(Err(NetworkError::Shutdown));
        }
    }
}

impl<T: 'static> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("pending", &self.callback.is_some())
            .finish()
    }
}
