//! # High-Level Node API
//!
//! A [`Node`] is the single owning context of a meshgate instance. It wires
//! the transport, session manager, peer registry, topic manager and AMOP
//! engine together, keeps configured static peers connected, and tears
//! everything down on [`shutdown`](Node::shutdown).
//!
//! ## Quick Start
//!
//! ```ignore
//! let node = Node::bind("0.0.0.0:30300").await?;
//! node.add_static_peer("10.0.0.2:30300".parse()?);
//!
//! let mut deliveries = node.register_client("sdk-1", "127.0.0.1:20200");
//! node.subscribe_topic("sdk-1", r#"{"topics":["chain.block"]}"#)?;
//!
//! let answer = node.send_by_topic("chain.block", b"query".to_vec()).await?;
//! ```
//!
//! ## Component Integration
//!
//! - **SecureTransport**: QUIC with Ed25519 mutual TLS, or in-memory for tests
//! - **Host**: listening, outbound dials, handshake timeouts
//! - **PeerRegistry**: one session per peer, request/response and fan-out
//! - **Amop**: topic gossip and topic-addressed routing

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::amop::{Amop, AmopConfig, ClientDelivery};
use crate::error::{DisconnectReason, NetworkError};
use crate::host::{Host, HostConfig};
use crate::identity::{Keypair, NodeId, PeerEndpoint};
use crate::messages::PacketType;
use crate::registry::{InboundMessage, PeerEvent, PeerRegistry, PeerSessionInfo, RegistryConfig};
use crate::topics::{TopicError, TopicManager};
use crate::transport::{QuicTransport, SecureTransport};

/// Interval between attempts to reach disconnected static peers.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub host: HostConfig,
    pub registry: RegistryConfig,
    pub amop: AmopConfig,
    /// Peers the node dials at startup and redials whenever disconnected.
    pub static_peers: Vec<PeerEndpoint>,
    pub reconnect_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: HostConfig::default(),
            registry: RegistryConfig::default(),
            amop: AmopConfig::default(),
            static_peers: Vec::new(),
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
        }
    }
}

type StaticPeers = Arc<Mutex<Vec<PeerEndpoint>>>;

/// NodeId last seen behind each static endpoint. Lets the reconnect loop
/// recognise a session the peer dialed, whose endpoint is not the one we dial.
type KnownIds = Arc<Mutex<HashMap<PeerEndpoint, NodeId>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Node {
    keypair: Keypair,
    host: Arc<Host>,
    registry: Arc<PeerRegistry>,
    amop: Amop<PeerRegistry>,
    static_peers: StaticPeers,
    known_ids: KnownIds,
    reconnect_task: JoinHandle<()>,
    shut_down: AtomicBool,
}

impl Node {
    /// Create a node with a fresh identity listening on `addr` over QUIC.
    pub async fn bind(addr: &str) -> Result<Self> {
        Self::bind_with_config(addr, Keypair::generate(), NodeConfig::default()).await
    }

    pub async fn bind_with_keypair(addr: &str, keypair: Keypair) -> Result<Self> {
        Self::bind_with_config(addr, keypair, NodeConfig::default()).await
    }

    pub async fn bind_with_config(addr: &str, keypair: Keypair, config: NodeConfig) -> Result<Self> {
        let addr: SocketAddr = addr.parse().context("invalid socket address")?;
        let transport = QuicTransport::bind(addr, &keypair).context("failed to bind QUIC transport")?;
        Ok(Self::with_transport(keypair, Arc::new(transport), config))
    }

    /// Assemble a node over an already bound transport. The transport must
    /// present `keypair`'s identity. Must be called within a Tokio runtime.
    pub fn with_transport(
        keypair: Keypair,
        transport: Arc<dyn SecureTransport>,
        config: NodeConfig,
    ) -> Self {
        let node_id = keypair.node_id();
        let registry = PeerRegistry::new(node_id, config.registry.clone());
        let host = Arc::new(Host::new(transport, registry.clone(), config.host.clone()));

        let topics = Arc::new(TopicManager::new(node_id));
        let amop = Amop::spawn(
            registry.clone(),
            topics,
            registry.register_handler(PacketType::Amop),
            registry.subscribe_events(),
            config.amop.clone(),
        );

        host.start();

        let static_peers: StaticPeers = Arc::new(Mutex::new(Vec::new()));
        for endpoint in config.static_peers {
            let mut peers = lock(&static_peers);
            if !peers.contains(&endpoint) {
                peers.push(endpoint);
            }
        }
        let known_ids: KnownIds = Arc::new(Mutex::new(HashMap::new()));
        let reconnect_task = tokio::spawn(reconnect_loop(
            host.clone(),
            registry.clone(),
            static_peers.clone(),
            known_ids.clone(),
            config.reconnect_interval,
        ));

        info!(
            node = %node_id,
            endpoint = %host.local_endpoint(),
            "node started"
        );

        Self {
            keypair,
            host,
            registry,
            amop,
            static_peers,
            known_ids,
            reconnect_task,
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.keypair.node_id()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn local_endpoint(&self) -> PeerEndpoint {
        self.host.local_endpoint()
    }

    /// Lower-level access for modules that share the transport.
    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    // ========================================================================
    // Peers
    // ========================================================================

    /// Connect to `endpoint` and wait for the session.
    pub async fn connect(&self, endpoint: PeerEndpoint) -> Result<NodeId, NetworkError> {
        let (node, _session) = self.host.connect_and_wait(endpoint).await?;
        Ok(node)
    }

    /// Keep `endpoint` connected from now on. A first attempt starts
    /// immediately.
    pub fn add_static_peer(&self, endpoint: PeerEndpoint) {
        {
            let mut peers = lock(&self.static_peers);
            if peers.contains(&endpoint) {
                return;
            }
            peers.push(endpoint.clone());
        }
        dial_static(&self.host, &self.registry, &self.known_ids, endpoint);
    }

    pub fn static_peers(&self) -> Vec<PeerEndpoint> {
        lock(&self.static_peers).clone()
    }

    pub fn peers(&self) -> Vec<PeerSessionInfo> {
        self.registry.session_infos()
    }

    pub fn is_connected(&self, node: &NodeId) -> bool {
        self.registry.is_connected(node)
    }

    pub fn disconnect(&self, node: &NodeId) -> bool {
        self.registry.disconnect(node, DisconnectReason::Requested)
    }

    pub fn subscribe_peer_events(&self) -> tokio::sync::broadcast::Receiver<PeerEvent> {
        self.registry.subscribe_events()
    }

    /// Receive inbound messages for an application-defined packet type.
    pub fn register_handler(&self, packet_type: u16) -> mpsc::Receiver<InboundMessage> {
        self.registry.register_handler(PacketType::Custom(packet_type))
    }

    pub fn status_seq(&self) -> u32 {
        self.registry.status_seq()
    }

    pub fn set_status_seq(&self, seq: u32) {
        self.registry.set_status_seq(seq);
    }

    pub fn bump_status_seq(&self) -> u32 {
        self.registry.bump_status_seq()
    }

    // ========================================================================
    // Clients and topics
    // ========================================================================

    pub fn register_client(&self, client_id: &str, endpoint: &str) -> mpsc::Receiver<ClientDelivery> {
        self.amop.register_client(client_id, endpoint)
    }

    /// Subscribe a client using a `{"topics": [...]}` document.
    pub fn subscribe_topic(&self, client_id: &str, topic_info: &str) -> Result<(), TopicError> {
        self.amop.subscribe_topic(client_id, topic_info)
    }

    pub fn subscribe_topics<S: AsRef<str>>(&self, client_id: &str, topics: &[S]) -> Result<(), TopicError> {
        self.amop.subscribe_topics(client_id, topics)
    }

    pub fn unsubscribe_topic<S: AsRef<str>>(&self, client_id: &str, topics: &[S]) -> Result<(), TopicError> {
        self.amop.remove_topics(client_id, topics)
    }

    pub fn remove_client(&self, client_id: &str) -> bool {
        self.amop.remove_client(client_id)
    }

    pub async fn send_by_topic(&self, topic: &str, data: Vec<u8>) -> Result<Vec<u8>, NetworkError> {
        self.amop.send_by_topic(topic, data).await
    }

    pub fn async_send_by_topic<F>(&self, topic: &str, data: Vec<u8>, callback: F)
    where
        F: FnOnce(Result<Vec<u8>, NetworkError>) + Send + 'static,
    {
        self.amop.async_send_by_topic(topic, data, callback);
    }

    pub async fn broadcast_by_topic(&self, topic: &str, data: Vec<u8>) -> Result<usize, NetworkError> {
        self.amop.broadcast_by_topic(topic, data).await
    }

    pub fn nodes_by_topic(&self, topic: &str) -> Vec<NodeId> {
        self.amop.topics().nodes_by_topic(topic)
    }

    pub fn topics_by_node(&self, node: &NodeId) -> Vec<String> {
        self.amop.topics().topics_by_node(node)
    }

    pub fn topic_seq(&self) -> u32 {
        self.amop.topics().topic_seq()
    }

    /// Announce this node's topic sequence to every peer now.
    pub async fn sync_topics(&self) -> Result<(), NetworkError> {
        self.amop.sync_now().await
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.reconnect_task.abort();
        self.amop.quit().await;
        self.host.stop();
        self.registry.shutdown();
        info!(node = %self.node_id(), "node shut down");
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.reconnect_task.abort();
        self.host.stop();
        self.registry.shutdown();
    }
}

fn has_session_to(registry: &PeerRegistry, known_ids: &KnownIds, endpoint: &PeerEndpoint) -> bool {
    if lock(known_ids)
        .get(endpoint)
        .is_some_and(|node| registry.is_connected(node))
    {
        return true;
    }
    registry
        .session_infos()
        .iter()
        .any(|info| info.endpoint == *endpoint)
}

fn dial_static(host: &Host, registry: &PeerRegistry, known_ids: &KnownIds, endpoint: PeerEndpoint) {
    if has_session_to(registry, known_ids, &endpoint) || host.is_connecting(&endpoint) {
        return;
    }
    let target = endpoint.clone();
    let known = known_ids.clone();
    let started = host.connect(endpoint, move |result| match result {
        Ok((node, _)) => {
            debug!(endpoint = %target, peer = %node, "static peer connected");
            lock(&known).insert(target, node);
        }
        Err(NetworkError::DuplicateSession(node)) => {
            trace!(endpoint = %target, peer = %node, "static peer already connected");
            lock(&known).insert(target, node);
        }
        Err(e) => debug!(endpoint = %target, error = %e, "static peer unreachable"),
    });
    if let Err(e) = started {
        trace!(error = %e, "static dial skipped");
    }
}

/// Jittered so two nodes listing each other do not keep opening sessions
/// at the same instant.
fn jittered(interval: Duration) -> Duration {
    let spread = (interval.as_millis() / 4) as u64;
    if spread == 0 {
        return interval;
    }
    interval + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

async fn reconnect_loop(
    host: Arc<Host>,
    registry: Arc<PeerRegistry>,
    static_peers: StaticPeers,
    known_ids: KnownIds,
    interval: Duration,
) {
    loop {
        let targets = lock(&static_peers).clone();
        for endpoint in targets {
            dial_static(&host, &registry, &known_ids, endpoint);
        }
        let pause = jittered(interval);
        tokio::time::sleep(pause).await;
    }
}
