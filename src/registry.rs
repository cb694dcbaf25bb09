//! # Peer Registry
//!
//! Routing table of active sessions keyed by [`NodeId`], and the node-to-node
//! send path everything else is built on:
//!
//! | Operation | Semantics |
//! |-----------|-----------|
//! | [`send_by_node_id`](PeerRegistry::send_by_node_id) | request, wait for the correlated response |
//! | [`async_send_by_node_id`](PeerRegistry::async_send_by_node_id) | same, result delivered to a callback exactly once |
//! | [`send_oneway`](PeerRegistry::send_oneway) | fire-and-forget to one peer |
//! | [`multicast`](PeerRegistry::multicast) | best effort to a list of peers |
//! | [`broadcast`](PeerRegistry::broadcast) | best effort to every active session |
//!
//! Inbound traffic is demultiplexed by [`PacketType`]: a module calls
//! [`register_handler`](PeerRegistry::register_handler) and receives every
//! inbound message of that type together with a [`Responder`].
//!
//! ## Concurrency
//!
//! One `RwLock` guards the session table. It is held only to look up, insert
//! or remove entries; sessions are cloned out before any I/O. Session tasks
//! report back through a single event channel drained by the dispatch task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::{Completion, DisconnectReason, NetworkError};
use crate::host::SessionSink;
use crate::identity::{NodeId, PeerEndpoint};
use crate::messages::{P2pMessage, PacketType};
use crate::protocols::P2pInterface;
use crate::session::{PeerSession, Responder, SessionContext, SessionEvent, DEFAULT_HEARTBEAT_INTERVAL};
use crate::table::{self, SessionTable, SharedTable};
use crate::transport::{Direction, SecureStream};

/// Default wait for a correlated response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared by every session's reader. The dispatch loop must never await
/// while draining it, or one slow handler would stall all peers.
const SESSION_EVENT_CHANNEL_SIZE: usize = 4096;
const HANDLER_CHANNEL_SIZE: usize = 1024;
const PEER_EVENT_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
pub struct RegistryConfig {
    pub heartbeat_interval: Duration,
    pub request_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SendOptions {
    pub timeout: Duration,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Snapshot of one active session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerSessionInfo {
    pub node_id: NodeId,
    pub endpoint: PeerEndpoint,
    pub direction: Direction,
    /// Status sequence from the peer's latest heartbeat.
    pub status_seq: u32,
    /// Time since the peer's latest heartbeat, if any arrived.
    pub heartbeat_age: Option<Duration>,
    pub heartbeats_sent: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerEvent {
    Connected(NodeId),
    Disconnected(NodeId, DisconnectReason),
}

#[derive(Debug)]
pub struct InboundMessage {
    pub from: NodeId,
    pub message: P2pMessage,
    pub responder: Responder,
}

type Handlers = Arc<RwLock<HashMap<PacketType, mpsc::Sender<InboundMessage>>>>;

pub struct PeerRegistry {
    local_id: NodeId,
    config: RegistryConfig,
    table: SharedTable,
    handlers: Handlers,
    session_events: mpsc::Sender<SessionEvent>,
    peer_events: broadcast::Sender<PeerEvent>,
    status_seq: Arc<AtomicU32>,
    running: AtomicBool,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl PeerRegistry {
    /// Create the registry and spawn its dispatch task.
    pub fn new(local_id: NodeId, config: RegistryConfig) -> Arc<Self> {
        let table: SharedTable = Arc::new(RwLock::new(SessionTable::default()));
        let handlers: Handlers = Arc::new(RwLock::new(HashMap::new()));
        let (session_events, events_rx) = mpsc::channel(SESSION_EVENT_CHANNEL_SIZE);
        let (peer_events, _) = broadcast::channel(PEER_EVENT_CAPACITY);

        let dispatcher = tokio::spawn(dispatch_loop(
            events_rx,
            table.clone(),
            handlers.clone(),
            peer_events.clone(),
        ));

        Arc::new(Self {
            local_id,
            config,
            table,
            handlers,
            session_events,
            peer_events,
            status_seq: Arc::new(AtomicU32::new(0)),
            running: AtomicBool::new(true),
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    pub fn local_node_id(&self) -> NodeId {
        self.local_id
    }

    pub fn get_session_by_node_id(&self, node: &NodeId) -> Option<Arc<PeerSession>> {
        table::read(&self.table)
            .get_by_node(node)
            .filter(|session| session.is_active())
            .cloned()
    }

    pub fn is_connected(&self, node: &NodeId) -> bool {
        self.get_session_by_node_id(node).is_some()
    }

    pub fn connected_node_ids(&self) -> Vec<NodeId> {
        table::read(&self.table)
            .sessions()
            .filter(|session| session.is_active())
            .map(|session| session.node_id())
            .collect()
    }

    pub fn session_count(&self) -> usize {
        table::read(&self.table).len()
    }

    pub fn session_infos(&self) -> Vec<PeerSessionInfo> {
        let sessions: Vec<Arc<PeerSession>> = table::read(&self.table)
            .sessions()
            .filter(|session| session.is_active())
            .cloned()
            .collect();
        sessions
            .iter()
            .map(|session| {
                let info = session.info();
                PeerSessionInfo {
                    node_id: info.node_id,
                    endpoint: info.endpoint.clone(),
                    direction: info.direction,
                    status_seq: session.peer_status_seq(),
                    heartbeat_age: session.last_heartbeat().map(|at| at.elapsed()),
                    heartbeats_sent: session.heartbeats_sent(),
                }
            })
            .collect()
    }

    fn active_session(&self, node: &NodeId) -> Result<Arc<PeerSession>, NetworkError> {
        self.get_session_by_node_id(node)
            .ok_or(NetworkError::PeerUnreachable(*node))
    }

    /// Send a request and wait for the response with the default timeout.
    pub async fn send_by_node_id(
        &self,
        node: &NodeId,
        message: P2pMessage,
    ) -> Result<P2pMessage, NetworkError> {
        let options = SendOptions {
            timeout: self.config.request_timeout,
        };
        self.request(node, message, options).await
    }

    pub async fn request(
        &self,
        node: &NodeId,
        message: P2pMessage,
        options: SendOptions,
    ) -> Result<P2pMessage, NetworkError> {
        let session = self.active_session(node)?;
        session.request(message, options.timeout).await
    }

    /// Request without waiting. `callback` runs exactly once, on a runtime
    /// worker, with the response or the failure.
    pub fn async_send_by_node_id<F>(
        &self,
        node: &NodeId,
        message: P2pMessage,
        callback: F,
        options: SendOptions,
    ) where
        F: FnOnce(Result<P2pMessage, NetworkError>) + Send + 'static,
    {
        let completion = Completion::new(callback);
        let session = match self.active_session(node) {
            Ok(session) => session,
            Err(e) => {
                completion.complete(Err(e));
                return;
            }
        };
        tokio::spawn(async move {
            let result = session.request(message, options.timeout).await;
            completion.complete(result);
        });
    }

    pub async fn send_oneway(&self, node: &NodeId, message: P2pMessage) -> Result<(), NetworkError> {
        let session = self.active_session(node)?;
        session.send(message).await
    }

    /// Best-effort delivery to each listed peer; returns how many accepted it.
    pub async fn multicast(&self, nodes: &[NodeId], message: P2pMessage) -> usize {
        let sessions: Vec<Arc<PeerSession>> = {
            let table = table::read(&self.table);
            nodes
                .iter()
                .filter_map(|node| table.get_by_node(node).cloned())
                .collect()
        };
        deliver_all(sessions, message)
    }

    pub async fn broadcast(&self, message: P2pMessage) -> usize {
        let sessions: Vec<Arc<PeerSession>> = table::read(&self.table).sessions().cloned().collect();
        deliver_all(sessions, message)
    }

    /// Route inbound messages of `packet_type` to the returned receiver.
    /// Replaces any earlier registration for the same type.
    pub fn register_handler(&self, packet_type: PacketType) -> mpsc::Receiver<InboundMessage> {
        let (tx, rx) = mpsc::channel(HANDLER_CHANNEL_SIZE);
        let mut handlers = self.handlers.write().unwrap_or_else(|p| p.into_inner());
        if handlers.insert(packet_type, tx).is_some() {
            debug!(?packet_type, "replacing inbound handler");
        }
        rx
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PeerEvent> {
        self.peer_events.subscribe()
    }

    pub fn status_seq(&self) -> u32 {
        self.status_seq.load(Ordering::Relaxed)
    }

    pub fn set_status_seq(&self, seq: u32) {
        self.status_seq.store(seq, Ordering::Relaxed);
    }

    pub fn bump_status_seq(&self) -> u32 {
        self.status_seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Disconnect one peer. Returns whether a session existed.
    pub fn disconnect(&self, node: &NodeId, reason: DisconnectReason) -> bool {
        let removed = table::write(&self.table).remove_node(node);
        let Some(session) = removed else {
            return false;
        };
        session.stop(reason);
        let _ = self.peer_events.send(PeerEvent::Disconnected(*node, reason));
        true
    }

    /// Refuse new sessions, stop all existing ones and the dispatch task.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.disconnect_all(DisconnectReason::LocalShutdown);
        if let Some(dispatcher) = self
            .dispatcher
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            dispatcher.abort();
        }
        info!("peer registry shut down");
    }

    /// Whether `candidate` should replace `existing` for the same peer.
    ///
    /// When both ends dial each other at once, each holds one session per
    /// direction. Both keep the connection dialed by the lower NodeId; in
    /// every other case the existing session wins.
    fn supersedes(&self, candidate: &PeerSession, existing: &PeerSession) -> bool {
        let direction = candidate.info().direction;
        if direction == existing.info().direction {
            return false;
        }
        let kept = if self.local_id < candidate.node_id() {
            Direction::Outbound
        } else {
            Direction::Inbound
        };
        direction == kept
    }

    fn session_context(&self) -> SessionContext {
        SessionContext {
            table: self.table.clone(),
            events: self.session_events.clone(),
            status_seq: self.status_seq.clone(),
            heartbeat_interval: self.config.heartbeat_interval,
        }
    }
}

impl SessionSink for PeerRegistry {
    fn on_established(&self, stream: SecureStream) -> Result<Arc<PeerSession>, NetworkError> {
        if !self.running.load(Ordering::Acquire) {
            stream.link.close(DisconnectReason::LocalShutdown);
            return Err(NetworkError::Shutdown);
        }

        let node = stream.peer;
        if node == self.local_id {
            stream.link.close(DisconnectReason::SelfConnection);
            return Err(NetworkError::HandshakeFailed("connected to self".into()));
        }

        let session = PeerSession::new(stream);
        let (key, replaced) = {
            let mut table = table::write(&self.table);
            match table.insert(session.clone()) {
                Ok(key) => (key, None),
                Err(e) => {
                    let supersedes = table
                        .get_by_node(&node)
                        .is_some_and(|existing| self.supersedes(&session, existing));
                    if !supersedes {
                        drop(table);
                        session.stop(DisconnectReason::DuplicatePeer);
                        warn!(
                            peer = %hex::encode(&node.as_bytes()[..8]),
                            endpoint = %session.info().endpoint,
                            "rejecting duplicate session"
                        );
                        return Err(e);
                    }
                    let old = table.remove_node(&node);
                    match table.insert(session.clone()) {
                        Ok(key) => (key, old),
                        Err(e) => {
                            drop(table);
                            session.stop(DisconnectReason::DuplicatePeer);
                            if let Some(old) = old {
                                old.stop(DisconnectReason::DuplicatePeer);
                            }
                            return Err(e);
                        }
                    }
                }
            }
        };

        session.start(key, self.session_context());
        if let Some(old) = replaced {
            // The peer stays connected throughout, so no events are published.
            old.stop(DisconnectReason::DuplicatePeer);
            info!(
                peer = %hex::encode(&node.as_bytes()[..8]),
                direction = ?session.info().direction,
                "simultaneous open, replaced session with the one both sides keep"
            );
            return Ok(session);
        }

        info!(
            peer = %hex::encode(&node.as_bytes()[..8]),
            endpoint = %session.info().endpoint,
            direction = ?session.info().direction,
            "peer connected"
        );
        let _ = self.peer_events.send(PeerEvent::Connected(node));
        Ok(session)
    }

    fn disconnect_all(&self, reason: DisconnectReason) {
        let sessions = table::write(&self.table).drain();
        for session in sessions {
            session.stop(reason);
            let _ = self
                .peer_events
                .send(PeerEvent::Disconnected(session.node_id(), reason));
        }
    }
}

#[async_trait]
impl P2pInterface for PeerRegistry {
    fn local_node_id(&self) -> NodeId {
        self.local_id
    }

    fn connected_peers(&self) -> Vec<NodeId> {
        self.connected_node_ids()
    }

    async fn request(
        &self,
        to: &NodeId,
        message: P2pMessage,
        options: SendOptions,
    ) -> Result<P2pMessage, NetworkError> {
        PeerRegistry::request(self, to, message, options).await
    }

    async fn send_oneway(&self, to: &NodeId, message: P2pMessage) -> Result<(), NetworkError> {
        PeerRegistry::send_oneway(self, to, message).await
    }

    async fn multicast(&self, to: &[NodeId], message: P2pMessage) -> usize {
        PeerRegistry::multicast(self, to, message).await
    }

    async fn broadcast(&self, message: P2pMessage) -> usize {
        PeerRegistry::broadcast(self, message).await
    }
}

/// Fan-out never waits on a peer's queue; a peer that stopped reading is
/// skipped instead of stalling delivery to the rest.
fn deliver_all(sessions: Vec<Arc<PeerSession>>, message: P2pMessage) -> usize {
    let mut delivered = 0;
    for session in sessions {
        match session.try_send(message.clone()) {
            Ok(()) => delivered += 1,
            Err(NetworkError::QueueFull(node)) => debug!(
                peer = %hex::encode(&node.as_bytes()[..8]),
                "outbound queue full, skipping peer"
            ),
            Err(e) => trace!(
                peer = %hex::encode(&session.node_id().as_bytes()[..8]),
                error = %e,
                "skipping peer"
            ),
        }
    }
    delivered
}

async fn dispatch_loop(
    mut events: mpsc::Receiver<SessionEvent>,
    table: SharedTable,
    handlers: Handlers,
    peer_events: broadcast::Sender<PeerEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Message { key, message } => {
                let session = table::read(&table).get(key).cloned();
                let Some(session) = session else {
                    trace!("dropping message from a session that already left");
                    continue;
                };
                let handler = handlers
                    .read()
                    .unwrap_or_else(|p| p.into_inner())
                    .get(&message.packet_type)
                    .cloned();
                let Some(handler) = handler else {
                    debug!(packet_type = ?message.packet_type, "no handler registered");
                    continue;
                };
                let inbound = InboundMessage {
                    from: session.node_id(),
                    responder: session.responder(&message),
                    message,
                };
                // try_send only: awaiting here would backpressure every reader
                if let Err(e) = handler.try_send(inbound) {
                    warn!(
                        peer = %hex::encode(&session.node_id().as_bytes()[..8]),
                        error = %e,
                        "inbound handler saturated, dropping message"
                    );
                }
            }
            SessionEvent::Closed { key, reason } => {
                let removed = table::write(&table).remove(key);
                if let Some(session) = removed {
                    session.stop(reason);
                    let node = session.node_id();
                    info!(
                        peer = %hex::encode(&node.as_bytes()[..8]),
                        %reason,
                        "peer disconnected"
                    );
                    let _ = peer_events.send(PeerEvent::Disconnected(node, reason));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::memory::{MemoryNetwork, MemoryTransport};
    use crate::transport::SecureTransport;
    use std::sync::atomic::AtomicUsize;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    struct Peer {
        id: NodeId,
        transport: MemoryTransport,
        registry: Arc<PeerRegistry>,
    }

    fn peer(network: &MemoryNetwork, name: &str) -> Peer {
        let id = Keypair::generate().node_id();
        let transport = network.bind(PeerEndpoint::new(name, 1), id).unwrap();
        let registry = PeerRegistry::new(id, RegistryConfig::default());
        Peer {
            id,
            transport,
            registry,
        }
    }

    /// Dial `b` from `a` and register both ends.
    async fn link(a: &Peer, b: &Peer) -> Result<(), NetworkError> {
        let outbound = a.transport.dial(&b.transport.local_endpoint()).await?;
        let inbound = b.transport.accept().await.unwrap().await?;
        b.registry.on_established(inbound)?;
        a.registry.on_established(outbound)?;
        Ok(())
    }

    #[tokio::test]
    async fn second_session_for_same_node_rejected() {
        let network = MemoryNetwork::new();
        let a = peer(&network, "a");
        let b = peer(&network, "b");
        link(&a, &b).await.expect("first link");
        let first = a.registry.get_session_by_node_id(&b.id).unwrap();

        let err = link(&a, &b).await.unwrap_err();
        assert_eq!(err, NetworkError::DuplicateSession(a.id));

        let kept = a.registry.get_session_by_node_id(&b.id).unwrap();
        assert!(Arc::ptr_eq(&first, &kept));
        assert_eq!(a.registry.session_count(), 1);
        assert_eq!(b.registry.session_count(), 1);
    }

    #[tokio::test]
    async fn self_connection_rejected() {
        let network = MemoryNetwork::new();
        let a = peer(&network, "a");
        let outbound = a.transport.dial(&a.transport.local_endpoint()).await.unwrap();
        let err = a.registry.on_established(outbound).unwrap_err();
        assert!(matches!(err, NetworkError::HandshakeFailed(_)));
        assert_eq!(a.registry.session_count(), 0);
    }

    #[tokio::test]
    async fn unknown_peer_is_unreachable() {
        let network = MemoryNetwork::new();
        let a = peer(&network, "a");
        let stranger = Keypair::generate().node_id();

        let err = a
            .registry
            .send_by_node_id(&stranger, P2pMessage::request(PacketType::Custom(1), vec![]))
            .await
            .unwrap_err();
        assert_eq!(err, NetworkError::PeerUnreachable(stranger));

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let (tx, rx) = tokio::sync::oneshot::channel();
        a.registry.async_send_by_node_id(
            &stranger,
            P2pMessage::request(PacketType::Custom(1), vec![]),
            move |result| {
                seen.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(result);
            },
            SendOptions::default(),
        );
        let result = tokio::time::timeout(TEST_TIMEOUT, rx).await.unwrap().unwrap();
        assert_eq!(result.unwrap_err(), NetworkError::PeerUnreachable(stranger));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn requests_reach_registered_handler() {
        let network = MemoryNetwork::new();
        let a = peer(&network, "a");
        let b = peer(&network, "b");
        let mut inbound = b.registry.register_handler(PacketType::Custom(7));
        link(&a, &b).await.unwrap();

        let a_id = a.id;
        tokio::spawn(async move {
            while let Some(msg) = inbound.recv().await {
                assert_eq!(msg.from, a_id);
                let mut reply = msg.message.payload.clone();
                reply.reverse();
                msg.responder.respond(reply).await.unwrap();
            }
        });

        let response = a
            .registry
            .send_by_node_id(&b.id, P2pMessage::request(PacketType::Custom(7), vec![1, 2, 3]))
            .await
            .expect("response");
        assert_eq!(response.payload, vec![3, 2, 1]);

        let (tx, rx) = tokio::sync::oneshot::channel();
        a.registry.async_send_by_node_id(
            &b.id,
            P2pMessage::request(PacketType::Custom(7), vec![9, 8]),
            move |result| {
                let _ = tx.send(result);
            },
            SendOptions::default(),
        );
        let response = tokio::time::timeout(TEST_TIMEOUT, rx).await.unwrap().unwrap();
        assert_eq!(response.unwrap().payload, vec![8, 9]);
    }

    #[tokio::test]
    async fn oneway_and_broadcast_delivery() {
        let network = MemoryNetwork::new();
        let a = peer(&network, "a");
        let b = peer(&network, "b");
        let c = peer(&network, "c");
        let mut b_inbound = b.registry.register_handler(PacketType::Custom(3));
        let mut c_inbound = c.registry.register_handler(PacketType::Custom(3));
        link(&a, &b).await.unwrap();
        link(&a, &c).await.unwrap();

        let delivered = a
            .registry
            .broadcast(P2pMessage::oneway(PacketType::Custom(3), b"all".to_vec()))
            .await;
        assert_eq!(delivered, 2);

        let missing = Keypair::generate().node_id();
        let delivered = a
            .registry
            .multicast(
                &[c.id, missing],
                P2pMessage::oneway(PacketType::Custom(3), b"some".to_vec()),
            )
            .await;
        assert_eq!(delivered, 1);

        let got = tokio::time::timeout(TEST_TIMEOUT, b_inbound.recv()).await.unwrap().unwrap();
        assert_eq!(got.message.payload, b"all");
        assert!(!got.responder.expects_response());

        for expected in [b"all".as_slice(), b"some".as_slice()] {
            let got = tokio::time::timeout(TEST_TIMEOUT, c_inbound.recv()).await.unwrap().unwrap();
            assert_eq!(got.message.payload, expected);
        }
    }

    #[tokio::test]
    async fn disconnect_propagates_to_remote() {
        let network = MemoryNetwork::new();
        let a = peer(&network, "a");
        let b = peer(&network, "b");
        let mut b_events = b.registry.subscribe_events();
        link(&a, &b).await.unwrap();

        let connected = tokio::time::timeout(TEST_TIMEOUT, b_events.recv()).await.unwrap().unwrap();
        assert_eq!(connected, PeerEvent::Connected(a.id));

        assert!(a.registry.disconnect(&b.id, DisconnectReason::Requested));
        assert!(!a.registry.disconnect(&b.id, DisconnectReason::Requested));
        assert!(!a.registry.is_connected(&b.id));

        let event = tokio::time::timeout(TEST_TIMEOUT, b_events.recv()).await.unwrap().unwrap();
        assert_eq!(event, PeerEvent::Disconnected(a.id, DisconnectReason::RemoteClosed));
        assert!(!b.registry.is_connected(&a.id));
    }

    #[tokio::test]
    async fn session_infos_report_peer_status() {
        let network = MemoryNetwork::new();
        let a = peer(&network, "a");
        let b = peer(&network, "b");
        b.registry.set_status_seq(41);
        assert_eq!(b.registry.bump_status_seq(), 42);
        link(&a, &b).await.unwrap();

        let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
        loop {
            let infos = a.registry.session_infos();
            if infos.len() == 1 && infos[0].status_seq == 42 {
                assert_eq!(infos[0].node_id, b.id);
                assert_eq!(infos[0].direction, Direction::Outbound);
                assert!(infos[0].heartbeat_age.is_some());
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "status never arrived");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn shutdown_refuses_new_sessions() {
        let network = MemoryNetwork::new();
        let a = peer(&network, "a");
        let b = peer(&network, "b");
        link(&a, &b).await.unwrap();

        a.registry.shutdown();
        assert_eq!(a.registry.session_count(), 0);

        let c = peer(&network, "c");
        let err = link(&a, &c).await.unwrap_err();
        assert_eq!(err, NetworkError::Shutdown);
    }

    /// Answer every `Custom(kind)` request on `peer` with its own payload.
    fn echo(peer: &Peer, kind: u16) {
        let mut inbound = peer.registry.register_handler(PacketType::Custom(kind));
        tokio::spawn(async move {
            while let Some(msg) = inbound.recv().await {
                let payload = msg.message.payload.clone();
                let _ = msg.responder.respond(payload).await;
            }
        });
    }

    #[tokio::test]
    async fn stalled_peer_does_not_block_fanout() {
        let network = MemoryNetwork::new();
        let a = peer(&network, "a");
        let b = peer(&network, "b");
        let stalled = peer(&network, "stalled");

        // the stalled end accepts the stream and never reads from it
        let outbound = a
            .transport
            .dial(&stalled.transport.local_endpoint())
            .await
            .unwrap();
        let _unread = stalled.transport.accept().await.unwrap().await.unwrap();
        a.registry.on_established(outbound).unwrap();
        link(&a, &b).await.unwrap();
        echo(&b, 6);

        let payload = vec![0u8; 4096];
        let mut skipped = false;
        let flood = async {
            for _ in 0..1500 {
                let delivered = a
                    .registry
                    .broadcast(P2pMessage::oneway(PacketType::Custom(5), payload.clone()))
                    .await;
                skipped |= delivered < 2;
                tokio::task::yield_now().await;
            }
        };
        tokio::time::timeout(Duration::from_secs(20), flood)
            .await
            .expect("broadcast waited on a stalled peer");
        assert!(skipped, "stalled peer queue never filled");

        let delivered = a
            .registry
            .multicast(
                &[stalled.id, b.id],
                P2pMessage::oneway(PacketType::Custom(5), payload.clone()),
            )
            .await;
        assert!(delivered <= 1);

        let response = a
            .registry
            .send_by_node_id(&b.id, P2pMessage::request(PacketType::Custom(6), b"alive".to_vec()))
            .await
            .expect("healthy peer still answers");
        assert_eq!(response.payload, b"alive");
    }

    #[tokio::test]
    async fn simultaneous_open_keeps_one_connection_on_both_sides() {
        let network = MemoryNetwork::new();
        let a = peer(&network, "a");
        let b = peer(&network, "b");
        echo(&b, 8);

        let a_dialed = a.transport.dial(&b.transport.local_endpoint()).await.unwrap();
        let a_dialed_at_b = b.transport.accept().await.unwrap().await.unwrap();
        let b_dialed = b.transport.dial(&a.transport.local_endpoint()).await.unwrap();
        let b_dialed_at_a = a.transport.accept().await.unwrap().await.unwrap();

        // each side registers its own dial first, then sees the other's
        a.registry.on_established(a_dialed).unwrap();
        b.registry.on_established(b_dialed).unwrap();
        let a_late = a.registry.on_established(b_dialed_at_a);
        let b_late = b.registry.on_established(a_dialed_at_b);
        assert_ne!(a_late.is_ok(), b_late.is_ok(), "exactly one side swaps");

        let a_dials = a.id < b.id;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let a_view = a.registry.get_session_by_node_id(&b.id).expect("a kept a session");
        let b_view = b.registry.get_session_by_node_id(&a.id).expect("b kept a session");
        let expected_at_a = if a_dials { Direction::Outbound } else { Direction::Inbound };
        let expected_at_b = if a_dials { Direction::Inbound } else { Direction::Outbound };
        assert_eq!(a_view.info().direction, expected_at_a);
        assert_eq!(b_view.info().direction, expected_at_b);
        assert_eq!(a.registry.session_count(), 1);
        assert_eq!(b.registry.session_count(), 1);

        let response = a
            .registry
            .send_by_node_id(&b.id, P2pMessage::request(PacketType::Custom(8), b"one".to_vec()))
            .await
            .expect("kept connection carries traffic");
        assert_eq!(response.payload, b"one");
    }

    #[tokio::test]
    async fn saturated_handler_does_not_stall_other_traffic() {
        let network = MemoryNetwork::new();
        let a = peer(&network, "a");
        let b = peer(&network, "b");
        let _never_drained = b.registry.register_handler(PacketType::Custom(5));
        echo(&b, 6);
        link(&a, &b).await.unwrap();

        for _ in 0..HANDLER_CHANNEL_SIZE + 100 {
            a.registry
                .send_oneway(&b.id, P2pMessage::oneway(PacketType::Custom(5), vec![1]))
                .await
                .unwrap();
        }

        let response = tokio::time::timeout(
            TEST_TIMEOUT,
            a.registry
                .send_by_node_id(&b.id, P2pMessage::request(PacketType::Custom(6), b"next".to_vec())),
        )
        .await
        .expect("dispatch stalled behind a full handler")
        .expect("response");
        assert_eq!(response.payload, b"next");
    }
}
