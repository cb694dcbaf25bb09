//! # AMOP: Topic Synchronization and Routing
//!
//! Topic-scoped messaging on top of the peer registry. Every node gossips a
//! topic sequence; peers that see a newer sequence fetch the full topic list.
//! With that mesh view, data addressed to a topic reaches either one random
//! subscribing node or all of them.
//!
//! ## Sync protocol
//!
//! ```text
//!  A                                   B
//!  |--- TopicSeq(7) (every period) --->|  cached seq for A < 7?
//!  |<-------- RequestTopics -----------|
//!  |--- ResponseTopics(7, topics) ---->|  cache A's topics
//! ```
//!
//! Lost messages are never retried individually; the next announcement
//! repairs the view.
//!
//! ## Architecture
//!
//! `Amop` is a cheap-to-clone handle. Routing calls run on the caller's task;
//! a single actor owns the sync timer and the inbound message stream.
//! Requests for local clients run on a bounded worker pool.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

use crate::error::{Completion, NetworkError};
use crate::identity::NodeId;
use crate::messages::{AmopMessage, AmopStatus, P2pMessage, PacketType};
use crate::protocols::P2pInterface;
use crate::registry::{DEFAULT_REQUEST_TIMEOUT, InboundMessage, PeerEvent, SendOptions};
use crate::session::Responder;
use crate::topics::{TopicError, TopicManager};

// ============================================================================
// Configuration
// ============================================================================

/// Interval between topic sequence announcements.
pub const DEFAULT_TOPIC_SYNC_PERIOD: Duration = Duration::from_millis(2000);

/// Wait for a peer's topic list.
pub const DEFAULT_TOPIC_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Wait for a local client to answer a topic request.
pub const DEFAULT_CLIENT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Concurrent local request handlers.
pub const DEFAULT_WORKER_LIMIT: usize = 64;

const COMMAND_CHANNEL_SIZE: usize = 64;
const CLIENT_CHANNEL_SIZE: usize = 1024;

#[derive(Clone, Debug)]
pub struct AmopConfig {
    pub topic_sync_period: Duration,
    pub topic_request_timeout: Duration,
    /// Timeout for `send_by_topic` to a remote subscriber.
    pub message_timeout: Duration,
    pub client_response_timeout: Duration,
    pub worker_limit: usize,
}

impl Default for AmopConfig {
    fn default() -> Self {
        Self {
            topic_sync_period: DEFAULT_TOPIC_SYNC_PERIOD,
            topic_request_timeout: DEFAULT_TOPIC_REQUEST_TIMEOUT,
            message_timeout: DEFAULT_REQUEST_TIMEOUT,
            client_response_timeout: DEFAULT_CLIENT_RESPONSE_TIMEOUT,
            worker_limit: DEFAULT_WORKER_LIMIT,
        }
    }
}

/// Topic data handed to a local client.
#[derive(Debug)]
pub enum ClientDelivery {
    /// Answer through `reply`; dropping it reports the client as gone.
    Request {
        from: NodeId,
        topic: String,
        data: Vec<u8>,
        reply: oneshot::Sender<Vec<u8>>,
    },
    Broadcast {
        from: NodeId,
        topic: String,
        data: Vec<u8>,
    },
}

enum Command {
    SyncNow(oneshot::Sender<()>),
    Announce,
    Quit,
}

// ============================================================================
// Shared state
// ============================================================================

type ClientChannels = RwLock<HashMap<String, mpsc::Sender<ClientDelivery>>>;

struct Shared<N: P2pInterface> {
    network: Arc<N>,
    topics: Arc<TopicManager>,
    clients: ClientChannels,
    workers: Arc<Semaphore>,
    fetching: Mutex<HashSet<NodeId>>,
    config: AmopConfig,
}

/// Clears a peer from the in-flight fetch set however the fetch ends.
struct FetchGuard<'a> {
    fetching: &'a Mutex<HashSet<NodeId>>,
    peer: NodeId,
}

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        self.fetching
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.peer);
    }
}

fn amop_message(kind_is_request: bool, message: &AmopMessage) -> Result<P2pMessage, NetworkError> {
    let payload = message.encode()?;
    Ok(if kind_is_request {
        P2pMessage::request(PacketType::Amop, payload)
    } else {
        P2pMessage::oneway(PacketType::Amop, payload)
    })
}

impl<N: P2pInterface> Shared<N> {
    fn local_id(&self) -> NodeId {
        self.topics.local_node_id()
    }

    fn client_sender(&self, client_id: &str) -> Option<mpsc::Sender<ClientDelivery>> {
        self.clients
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(client_id)
            .cloned()
    }

    fn topic_seq_message(&self) -> Result<P2pMessage, NetworkError> {
        amop_message(
            false,
            &AmopMessage::TopicSeq {
                seq: self.topics.topic_seq(),
            },
        )
    }

    async fn broadcast_topic_seq(&self) {
        let pruned = self.topics.retain_peers(&self.network.connected_peers());
        if pruned > 0 {
            debug!(pruned, "dropped topics of departed peers");
        }
        match self.topic_seq_message() {
            Ok(message) => {
                let delivered = self.network.broadcast(message).await;
                trace!(seq = self.topics.topic_seq(), delivered, "topic seq announced");
            }
            Err(e) => warn!(error = %e, "failed to encode topic seq"),
        }
    }

    async fn announce_to(&self, peer: NodeId) {
        let result = match self.topic_seq_message() {
            Ok(message) => self.network.send_oneway(&peer, message).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            debug!(peer = %hex::encode(&peer.as_bytes()[..8]), error = %e, "topic seq announce failed");
        }
    }

    /// Fetch `peer`'s topics if `seq` is newer than the cache and no fetch
    /// is already running.
    fn maybe_fetch(self: &Arc<Self>, peer: NodeId, seq: u32) {
        if !self.topics.needs_refresh(&peer, seq) {
            return;
        }
        if !self
            .fetching
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(peer)
        {
            trace!(peer = %hex::encode(&peer.as_bytes()[..8]), "topic fetch already in flight");
            return;
        }
        let shared = self.clone();
        tokio::spawn(async move { shared.fetch_topics(peer).await });
    }

    async fn fetch_topics(&self, peer: NodeId) {
        let _guard = FetchGuard {
            fetching: &self.fetching,
            peer,
        };
        let options = SendOptions {
            timeout: self.config.topic_request_timeout,
        };
        let response = match amop_message(true, &AmopMessage::RequestTopics) {
            Ok(request) => self.network.request(&peer, request, options).await,
            Err(e) => Err(e),
        };
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                debug!(
                    peer = %hex::encode(&peer.as_bytes()[..8]),
                    error = %e,
                    "topic fetch failed, next announcement will retry"
                );
                return;
            }
        };
        match AmopMessage::decode(&response.payload) {
            Ok(AmopMessage::ResponseTopics { seq, topics }) => {
                if self.network.connected_peers().contains(&peer) {
                    self.topics.update_peer_topics(peer, seq, topics);
                }
            }
            Ok(other) => debug!(kind = other.kind_name(), "unexpected reply to topic request"),
            Err(e) => debug!(error = %e, "undecodable topic response"),
        }
    }

    /// Hand a request to one random local subscriber of `topic`.
    async fn deliver_request(&self, from: NodeId, topic: &str, data: Vec<u8>) -> (AmopStatus, Vec<u8>) {
        let candidates: Vec<(String, mpsc::Sender<ClientDelivery>)> = self
            .topics
            .clients_by_topic(topic)
            .into_iter()
            .filter_map(|client| self.client_sender(&client).map(|tx| (client, tx)))
            .collect();
        let Some((client, sender)) = pick_random(&candidates) else {
            return (AmopStatus::NoSubscriber, Vec::new());
        };

        let (reply, answer) = oneshot::channel();
        let delivery = ClientDelivery::Request {
            from,
            topic: topic.to_string(),
            data,
            reply,
        };
        if sender.send(delivery).await.is_err() {
            debug!(client = %client, topic, "client channel closed");
            return (AmopStatus::ClientGone, Vec::new());
        }

        match tokio::time::timeout(self.config.client_response_timeout, answer).await {
            Ok(Ok(data)) => (AmopStatus::Ok, data),
            Ok(Err(_)) => (AmopStatus::ClientGone, Vec::new()),
            Err(_) => {
                debug!(client = %client, topic, "client did not answer in time");
                (AmopStatus::Timeout, Vec::new())
            }
        }
    }

    /// Hand a broadcast to every local subscriber of `topic`. Returns how
    /// many clients accepted it.
    fn deliver_broadcast(&self, from: NodeId, topic: &str, data: &[u8]) -> usize {
        let mut delivered = 0;
        for client in self.topics.clients_by_topic(topic) {
            let Some(sender) = self.client_sender(&client) else {
                continue;
            };
            let delivery = ClientDelivery::Broadcast {
                from,
                topic: topic.to_string(),
                data: data.to_vec(),
            };
            match sender.try_send(delivery) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(client = %client, topic, error = %e, "dropping broadcast for client"),
            }
        }
        delivered
    }

    async fn answer_request(
        &self,
        from: NodeId,
        topic: String,
        data: Vec<u8>,
        responder: Responder,
        permit: OwnedSemaphorePermit,
    ) {
        let (status, data) = self.deliver_request(from, &topic, data).await;
        drop(permit);

        let reply = AmopMessage::Response { status, data };
        let sent = match reply.encode() {
            Ok(payload) => responder.respond(payload).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            debug!(peer = %hex::encode(&from.as_bytes()[..8]), topic, error = %e, "failed to answer topic request");
        }
    }

    /// Every worker is occupied; answer `Timeout` at once.
    fn reject_busy(&self, from: NodeId, topic: &str, responder: Responder) {
        debug!(peer = %hex::encode(&from.as_bytes()[..8]), topic, "worker pool full, rejecting topic request");
        let busy = AmopMessage::Response {
            status: AmopStatus::Timeout,
            data: Vec::new(),
        };
        let sent = match busy.encode() {
            Ok(payload) => responder.try_respond(payload),
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            debug!(topic, error = %e, "failed to reject topic request");
        }
    }

    async fn answer_topic_request(&self, responder: Responder) {
        let (seq, topics) = self.topics.local_topics();
        let sent = match (AmopMessage::ResponseTopics { seq, topics }).encode() {
            Ok(payload) => responder.respond(payload).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            debug!(error = %e, "failed to answer topic list request");
        }
    }

    fn dispatch(self: &Arc<Self>, inbound: InboundMessage) {
        let from = inbound.from;
        let message = match AmopMessage::decode(&inbound.message.payload) {
            Ok(message) => message,
            Err(e) => {
                debug!(peer = %hex::encode(&from.as_bytes()[..8]), error = %e, "undecodable AMOP message");
                return;
            }
        };
        trace!(peer = %hex::encode(&from.as_bytes()[..8]), kind = message.kind_name(), "AMOP message");

        match message {
            AmopMessage::TopicSeq { seq } => self.maybe_fetch(from, seq),
            AmopMessage::RequestTopics => {
                let shared = self.clone();
                tokio::spawn(async move { shared.answer_topic_request(inbound.responder).await });
            }
            AmopMessage::ResponseTopics { seq, topics } => {
                self.topics.update_peer_topics(from, seq, topics);
            }
            AmopMessage::Request { topic, data } => {
                let responder = inbound.responder;
                match self.workers.clone().try_acquire_owned() {
                    Ok(permit) => {
                        let shared = self.clone();
                        tokio::spawn(async move {
                            shared.answer_request(from, topic, data, responder, permit).await
                        });
                    }
                    Err(_) => self.reject_busy(from, &topic, responder),
                }
            }
            AmopMessage::Broadcast { topic, data } => {
                if self.deliver_broadcast(from, &topic, &data) == 0 {
                    trace!(topic = %topic, "no local subscriber for broadcast");
                }
            }
            AmopMessage::Response { .. } => {
                trace!("dropping uncorrelated AMOP response");
            }
        }
    }
}

fn pick_random<T: Clone>(items: &[T]) -> Option<T> {
    items.choose(&mut rand::thread_rng()).cloned()
}

fn status_to_result(topic: &str, status: AmopStatus, data: Vec<u8>) -> Result<Vec<u8>, NetworkError> {
    match status {
        AmopStatus::Ok => Ok(data),
        AmopStatus::NoSubscriber => Err(NetworkError::NoSubscriber(topic.to_string())),
        AmopStatus::Timeout => Err(NetworkError::RequestTimeout),
        AmopStatus::ClientGone => Err(NetworkError::Rejected("subscriber dropped the request".into())),
    }
}

// ============================================================================
// Handle (public API - cheap to clone)
// ============================================================================

pub struct Amop<N: P2pInterface> {
    shared: Arc<Shared<N>>,
    cmd_tx: mpsc::Sender<Command>,
}

impl<N: P2pInterface> Clone for Amop<N> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            cmd_tx: self.cmd_tx.clone(),
        }
    }
}

impl<N: P2pInterface> Amop<N> {
    /// Spawn the sync actor.
    ///
    /// `inbound` carries every [`PacketType::Amop`] message for this node and
    /// `peer_events` the registry's connect/disconnect stream.
    pub fn spawn(
        network: Arc<N>,
        topics: Arc<TopicManager>,
        inbound: mpsc::Receiver<InboundMessage>,
        peer_events: broadcast::Receiver<PeerEvent>,
        config: AmopConfig,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let shared = Arc::new(Shared {
            network,
            topics,
            clients: RwLock::new(HashMap::new()),
            workers: Arc::new(Semaphore::new(config.worker_limit.max(1))),
            fetching: Mutex::new(HashSet::new()),
            config,
        });
        tokio::spawn(run(shared.clone(), cmd_rx, inbound, peer_events));
        Self { shared, cmd_tx }
    }

    pub fn topics(&self) -> &Arc<TopicManager> {
        &self.shared.topics
    }

    // ------------------------------------------------------------------------
    // Local clients
    // ------------------------------------------------------------------------

    /// Register a client; topic data for it arrives on the returned channel.
    /// Registering an existing id replaces its channel.
    pub fn register_client(&self, client_id: &str, endpoint: &str) -> mpsc::Receiver<ClientDelivery> {
        let (tx, rx) = mpsc::channel(CLIENT_CHANNEL_SIZE);
        self.shared.topics.register_client(client_id, endpoint);
        self.shared
            .clients
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(client_id.to_string(), tx);
        debug!(client = client_id, endpoint, "client registered");
        rx
    }

    /// Apply a `{"topics": [...]}` document for a registered client.
    pub fn subscribe_topic(&self, client_id: &str, topic_info: &str) -> Result<(), TopicError> {
        self.require_client(client_id)?;
        let changed = self.shared.topics.subscribe_topic_info(client_id, topic_info)?;
        self.announce_if(changed);
        Ok(())
    }

    pub fn subscribe_topics<S: AsRef<str>>(&self, client_id: &str, topics: &[S]) -> Result<(), TopicError> {
        self.require_client(client_id)?;
        let changed = self
            .shared
            .topics
            .register_client_topics(client_id, topics.iter().map(|t| t.as_ref().to_string()))?;
        self.announce_if(changed);
        Ok(())
    }

    pub fn remove_topics<S: AsRef<str>>(&self, client_id: &str, topics: &[S]) -> Result<(), TopicError> {
        let changed = self.shared.topics.remove_topics(client_id, topics)?;
        self.announce_if(changed);
        Ok(())
    }

    /// Drop a client and its subscriptions. Returns false if it was unknown.
    pub fn remove_client(&self, client_id: &str) -> bool {
        let seq = self.shared.topics.topic_seq();
        let existed = self.shared.topics.remove_client(client_id);
        self.shared
            .clients
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(client_id);
        self.announce_if(self.shared.topics.topic_seq() != seq);
        existed
    }

    fn require_client(&self, client_id: &str) -> Result<(), TopicError> {
        if self.shared.client_sender(client_id).is_none() {
            return Err(TopicError::UnknownClient(client_id.to_string()));
        }
        Ok(())
    }

    fn announce_if(&self, changed: bool) {
        if changed {
            let _ = self.cmd_tx.try_send(Command::Announce);
        }
    }

    // ------------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------------

    /// Send `data` to one random subscriber of `topic` and return its answer.
    pub async fn send_by_topic(&self, topic: &str, data: Vec<u8>) -> Result<Vec<u8>, NetworkError> {
        let nodes = self.shared.topics.nodes_by_topic(topic);
        let Some(target) = pick_random(&nodes) else {
            return Err(NetworkError::NoSubscriber(topic.to_string()));
        };

        let local_id = self.shared.local_id();
        if target == local_id {
            trace!(topic, "delivering topic request locally");
            let (status, data) = self.shared.deliver_request(local_id, topic, data).await;
            return status_to_result(topic, status, data);
        }

        trace!(topic, peer = %hex::encode(&target.as_bytes()[..8]), "routing topic request");
        let request = amop_message(
            true,
            &AmopMessage::Request {
                topic: topic.to_string(),
                data,
            },
        )?;
        let options = SendOptions {
            timeout: self.shared.config.message_timeout,
        };
        let response = self.shared.network.request(&target, request, options).await?;
        match AmopMessage::decode(&response.payload)? {
            AmopMessage::Response { status, data } => status_to_result(topic, status, data),
            other => Err(NetworkError::Codec(format!(
                "expected topic response, got {}",
                other.kind_name()
            ))),
        }
    }

    /// [`send_by_topic`](Self::send_by_topic) with the result delivered to
    /// `callback`, exactly once.
    pub fn async_send_by_topic<F>(&self, topic: &str, data: Vec<u8>, callback: F)
    where
        F: FnOnce(Result<Vec<u8>, NetworkError>) + Send + 'static,
    {
        let completion = Completion::new(callback);
        let amop = self.clone();
        let topic = topic.to_string();
        tokio::spawn(async move {
            let result = amop.send_by_topic(&topic, data).await;
            completion.complete(result);
        });
    }

    /// Send `data` to every subscriber of `topic`. Returns how many nodes
    /// it reached, this node included when a local client took it.
    pub async fn broadcast_by_topic(&self, topic: &str, data: Vec<u8>) -> Result<usize, NetworkError> {
        let nodes = self.shared.topics.nodes_by_topic(topic);
        if nodes.is_empty() {
            return Err(NetworkError::NoSubscriber(topic.to_string()));
        }

        let local_id = self.shared.local_id();
        let remote: Vec<NodeId> = nodes.iter().copied().filter(|node| *node != local_id).collect();
        let mut reached = 0;
        if !remote.is_empty() {
            let message = amop_message(
                false,
                &AmopMessage::Broadcast {
                    topic: topic.to_string(),
                    data: data.clone(),
                },
            )?;
            reached += self.shared.network.multicast(&remote, message).await;
        }
        if nodes.contains(&local_id) && self.shared.deliver_broadcast(local_id, topic, &data) > 0 {
            reached += 1;
        }
        debug!(topic, subscribers = nodes.len(), reached, "topic broadcast");
        Ok(reached)
    }

    // ------------------------------------------------------------------------
    // Control
    // ------------------------------------------------------------------------

    /// Announce the topic sequence to every peer now.
    pub async fn sync_now(&self) -> Result<(), NetworkError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::SyncNow(tx))
            .await
            .map_err(|_| NetworkError::Shutdown)?;
        rx.await.map_err(|_| NetworkError::Shutdown)
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

// ============================================================================
// Actor
// ============================================================================

async fn run<N: P2pInterface>(
    shared: Arc<Shared<N>>,
    mut cmd_rx: mpsc::Receiver<Command>,
    mut inbound: mpsc::Receiver<InboundMessage>,
    mut peer_events: broadcast::Receiver<PeerEvent>,
) {
    let mut ticker = tokio::time::interval(shared.config.topic_sync_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut events_open = true;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::SyncNow(reply)) => {
                        shared.broadcast_topic_seq().await;
                        let _ = reply.send(());
                    }
                    Some(Command::Announce) => {
                        let shared = shared.clone();
                        tokio::spawn(async move { shared.broadcast_topic_seq().await });
                    }
                    Some(Command::Quit) => {
                        debug!("AMOP actor quitting");
                        break;
                    }
                    None => {
                        debug!("AMOP handle dropped, actor quitting");
                        break;
                    }
                }
            }
            message = inbound.recv() => {
                match message {
                    Some(message) => shared.dispatch(message),
                    None => {
                        debug!("AMOP inbound channel closed, actor quitting");
                        break;
                    }
                }
            }
            event = peer_events.recv(), if events_open => {
                match event {
                    Ok(PeerEvent::Connected(peer)) => {
                        let shared = shared.clone();
                        tokio::spawn(async move { shared.announce_to(peer).await });
                    }
                    Ok(PeerEvent::Disconnected(peer, _)) => {
                        if shared.topics.remove_peer(&peer) {
                            debug!(peer = %hex::encode(&peer.as_bytes()[..8]), "dropped topics of disconnected peer");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "peer events lagged, resynchronizing topic cache");
                        shared.topics.retain_peers(&shared.network.connected_peers());
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        events_open = false;
                    }
                }
            }
            _ = ticker.tick() => {
                let shared = shared.clone();
                tokio::spawn(async move { shared.broadcast_topic_seq().await });
            }
        }
    }
}
