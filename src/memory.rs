//! In-process transport.
//!
//! A [`MemoryNetwork`] is a shared switchboard; every [`MemoryTransport`]
//! bound on it listens at a symbolic [`PeerEndpoint`]. Dialing pairs two
//! `tokio::io::duplex` pipes and hands each side the other's NodeId, so the
//! session layer above behaves exactly as it does over QUIC.
//!
//! Tests can make an endpoint unresponsive (dials hang until the caller's
//! timeout fires) and count how many dials reached an endpoint.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{DisconnectReason, NetworkError};
use crate::identity::{NodeId, PeerEndpoint};
use crate::transport::{Direction, PendingHandshake, SecureStream, SecureTransport, TransportLink};

/// Bytes buffered in each direction of an in-memory stream.
const PIPE_CAPACITY: usize = 256 * 1024;

const ACCEPT_BACKLOG: usize = 64;

struct Listener {
    node_id: NodeId,
    tx: mpsc::Sender<SecureStream>,
}

#[derive(Default)]
struct NetworkState {
    listeners: HashMap<PeerEndpoint, Listener>,
    unresponsive: HashSet<PeerEndpoint>,
    dials: HashMap<PeerEndpoint, usize>,
}

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a listener for `node_id` at `endpoint`.
    pub fn bind(&self, endpoint: PeerEndpoint, node_id: NodeId) -> Result<MemoryTransport> {
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        let mut state = self.state();
        if state.listeners.contains_key(&endpoint) {
            anyhow::bail!("memory endpoint {} already bound", endpoint);
        }
        state.listeners.insert(endpoint.clone(), Listener { node_id, tx });
        Ok(MemoryTransport {
            network: self.clone(),
            local: endpoint,
            node_id,
            incoming: tokio::sync::Mutex::new(rx),
        })
    }

    /// Dials to an unresponsive endpoint never complete.
    pub fn set_unresponsive(&self, endpoint: &PeerEndpoint, unresponsive: bool) {
        let mut state = self.state();
        if unresponsive {
            state.unresponsive.insert(endpoint.clone());
        } else {
            state.unresponsive.remove(endpoint);
        }
    }

    /// Number of dials that have targeted `endpoint` so far.
    pub fn dial_count(&self, endpoint: &PeerEndpoint) -> usize {
        self.state().dials.get(endpoint).copied().unwrap_or(0)
    }
}

#[derive(Default)]
struct MemoryLink {
    closed: AtomicBool,
}

impl TransportLink for MemoryLink {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    fn close(&self, _reason: DisconnectReason) {
        self.closed.store(true, Ordering::Release);
    }
}

pub struct MemoryTransport {
    network: MemoryNetwork,
    local: PeerEndpoint,
    node_id: NodeId,
    incoming: tokio::sync::Mutex<mpsc::Receiver<SecureStream>>,
}

enum DialTarget {
    Hang,
    Refused,
    Listener(NodeId, mpsc::Sender<SecureStream>),
}

#[async_trait]
impl SecureTransport for MemoryTransport {
    fn local_endpoint(&self) -> PeerEndpoint {
        self.local.clone()
    }

    async fn accept(&self) -> Option<PendingHandshake> {
        let stream = self.incoming.lock().await.recv().await?;
        Some(Box::pin(async move { Ok(stream) }))
    }

    async fn dial(&self, endpoint: &PeerEndpoint) -> Result<SecureStream, NetworkError> {
        let target = {
            let mut state = self.network.state();
            *state.dials.entry(endpoint.clone()).or_default() += 1;
            if state.unresponsive.contains(endpoint) {
                DialTarget::Hang
            } else {
                match state.listeners.get(endpoint) {
                    Some(listener) => DialTarget::Listener(listener.node_id, listener.tx.clone()),
                    None => DialTarget::Refused,
                }
            }
        };

        let (listener_id, tx) = match target {
            DialTarget::Hang => std::future::pending().await,
            DialTarget::Refused => {
                return Err(NetworkError::HandshakeFailed(format!(
                    "connection refused by {}",
                    endpoint
                )));
            }
            DialTarget::Listener(node_id, tx) => (node_id, tx),
        };

        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        let (near_reader, near_writer) = tokio::io::split(near);
        let (far_reader, far_writer) = tokio::io::split(far);
        let link: Arc<dyn TransportLink> = Arc::new(MemoryLink::default());

        tx.send(SecureStream {
            peer: self.node_id,
            remote: self.local.clone(),
            direction: Direction::Inbound,
            reader: Box::new(far_reader),
            writer: Box::new(far_writer),
            link: link.clone(),
        })
        .await
        .map_err(|_| NetworkError::HandshakeFailed(format!("{} stopped listening", endpoint)))?;

        Ok(SecureStream {
            peer: listener_id,
            remote: endpoint.clone(),
            direction: Direction::Outbound,
            reader: Box::new(near_reader),
            writer: Box::new(near_writer),
            link,
        })
    }

    fn close(&self) {
        let mut state = self.network.state();
        if state
            .listeners
            .get(&self.local)
            .is_some_and(|listener| listener.node_id == self.node_id)
        {
            state.listeners.remove(&self.local);
        }
    }
}
