//! # Topic Manager
//!
//! Subscription state for the topic overlay.
//!
//! - **Local**: client id → (endpoint, topics), plus the reverse index
//!   topic → client ids. Both live under one lock so the index never drifts
//!   from the client map.
//! - **Remote**: per-peer cache of the topic list each peer last advertised,
//!   tagged with the peer's topic sequence.
//!
//! The local topic sequence changes exactly when the node's effective topic
//! set changes, i.e. when a topic gains its first local subscriber or loses
//! its last one. Peers use it to decide whether to refetch our list.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Deserialize;
use tracing::{debug, trace};

use crate::identity::NodeId;

/// Maximum topic name length in bytes.
pub const MAX_TOPIC_LENGTH: usize = 256;

/// Maximum topics cached for a single peer.
/// SECURITY: Bounds memory a peer can pin with one topic response.
pub const MAX_PEER_TOPICS: usize = 10_000;

#[inline]
pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty() && topic.len() <= MAX_TOPIC_LENGTH && !topic.chars().any(char::is_control)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicError {
    /// Topic-info document is not `{"topics": [...]}`.
    InvalidTopicInfo(String),
    InvalidTopic(String),
    UnknownClient(String),
}

impl fmt::Display for TopicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTopicInfo(reason) => write!(f, "invalid topic info: {}", reason),
            Self::InvalidTopic(topic) => write!(f, "invalid topic name {:?}", topic),
            Self::UnknownClient(client) => write!(f, "client {} is not registered", client),
        }
    }
}

impl std::error::Error for TopicError {}

#[derive(Deserialize)]
struct TopicInfo {
    topics: Vec<String>,
}

/// Parse a client topic-info document of the form `{"topics": ["a", "b"]}`.
pub fn parse_topic_info(json: &str) -> Result<Vec<String>, TopicError> {
    let info: TopicInfo =
        serde_json::from_str(json).map_err(|e| TopicError::InvalidTopicInfo(e.to_string()))?;
    Ok(info.topics)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub client_id: String,
    pub endpoint: String,
    pub topics: Vec<String>,
}

struct ClientEntry {
    endpoint: String,
    topics: BTreeSet<String>,
}

struct LocalTopics {
    seq: u32,
    clients: HashMap<String, ClientEntry>,
    index: HashMap<String, BTreeSet<String>>,
}

impl LocalTopics {
    /// Returns true if `topic` had no local subscriber before.
    fn link(&mut self, client_id: &str, topic: &str) -> bool {
        let owners = self.index.entry(topic.to_string()).or_default();
        let first = owners.is_empty();
        owners.insert(client_id.to_string());
        first
    }

    /// Returns true if `topic` lost its last local subscriber.
    fn unlink(&mut self, client_id: &str, topic: &str) -> bool {
        let Some(owners) = self.index.get_mut(topic) else {
            return false;
        };
        owners.remove(client_id);
        if owners.is_empty() {
            self.index.remove(topic);
            return true;
        }
        false
    }

    fn bump(&mut self) {
        self.seq = self.seq.wrapping_add(1);
        debug!(seq = self.seq, topics = self.index.len(), "local topic set changed");
    }
}

/// Topics one peer advertised, tagged with that peer's topic sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerTopics {
    pub seq: u32,
    pub topics: BTreeSet<String>,
}

pub struct TopicManager {
    local_id: NodeId,
    local: RwLock<LocalTopics>,
    peers: RwLock<HashMap<NodeId, PeerTopics>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl TopicManager {
    pub fn new(local_id: NodeId) -> Self {
        Self {
            local_id,
            local: RwLock::new(LocalTopics {
                seq: 1,
                clients: HashMap::new(),
                index: HashMap::new(),
            }),
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn local_node_id(&self) -> NodeId {
        self.local_id
    }

    // ========================================================================
    // Local clients
    // ========================================================================

    /// Register a client, or update its endpoint. Returns true if it is new.
    pub fn register_client(&self, client_id: &str, endpoint: &str) -> bool {
        let mut local = write(&self.local);
        match local.clients.get_mut(client_id) {
            Some(entry) => {
                entry.endpoint = endpoint.to_string();
                false
            }
            None => {
                local.clients.insert(
                    client_id.to_string(),
                    ClientEntry {
                        endpoint: endpoint.to_string(),
                        topics: BTreeSet::new(),
                    },
                );
                true
            }
        }
    }

    pub fn is_registered(&self, client_id: &str) -> bool {
        read(&self.local).clients.contains_key(client_id)
    }

    /// Add topics to a client's subscription set.
    ///
    /// Every name is validated before anything changes. Returns whether the
    /// local topic sequence was bumped.
    pub fn register_client_topics<I, S>(&self, client_id: &str, topics: I) -> Result<bool, TopicError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let topics: Vec<String> = topics.into_iter().map(Into::into).collect();
        if let Some(bad) = topics.iter().find(|t| !is_valid_topic(t)) {
            return Err(TopicError::InvalidTopic(bad.clone()));
        }

        let mut local = write(&self.local);
        let Some(entry) = local.clients.get_mut(client_id) else {
            return Err(TopicError::UnknownClient(client_id.to_string()));
        };
        let added: Vec<String> = topics
            .into_iter()
            .filter(|topic| entry.topics.insert(topic.clone()))
            .collect();

        let mut changed = false;
        for topic in &added {
            changed |= local.link(client_id, topic);
        }
        if changed {
            local.bump();
        }
        Ok(changed)
    }

    /// Apply a `{"topics": [...]}` document for a client.
    pub fn subscribe_topic_info(&self, client_id: &str, json: &str) -> Result<bool, TopicError> {
        let topics = parse_topic_info(json)?;
        self.register_client_topics(client_id, topics)
    }

    /// Remove topics from a client. Unknown names are ignored.
    pub fn remove_topics<S: AsRef<str>>(&self, client_id: &str, topics: &[S]) -> Result<bool, TopicError> {
        let mut local = write(&self.local);
        let Some(entry) = local.clients.get_mut(client_id) else {
            return Err(TopicError::UnknownClient(client_id.to_string()));
        };
        let removed: Vec<String> = topics
            .iter()
            .map(|t| t.as_ref().to_string())
            .filter(|topic| entry.topics.remove(topic))
            .collect();

        let mut changed = false;
        for topic in &removed {
            changed |= local.unlink(client_id, topic);
        }
        if changed {
            local.bump();
        }
        Ok(changed)
    }

    /// Drop a client and all its topics. Returns false if it was unknown.
    pub fn remove_client(&self, client_id: &str) -> bool {
        let mut local = write(&self.local);
        let Some(entry) = local.clients.remove(client_id) else {
            return false;
        };
        let mut changed = false;
        for topic in &entry.topics {
            changed |= local.unlink(client_id, topic);
        }
        if changed {
            local.bump();
        }
        true
    }

    pub fn topic_seq(&self) -> u32 {
        read(&self.local).seq
    }

    /// Consistent snapshot of the sequence and the topics it describes.
    pub fn local_topics(&self) -> (u32, Vec<String>) {
        let local = read(&self.local);
        let mut topics: Vec<String> = local.index.keys().cloned().collect();
        topics.sort();
        (local.seq, topics)
    }

    pub fn client_topics(&self, client_id: &str) -> Option<Vec<String>> {
        read(&self.local)
            .clients
            .get(client_id)
            .map(|entry| entry.topics.iter().cloned().collect())
    }

    pub fn client_info(&self, client_id: &str) -> Option<ClientInfo> {
        read(&self.local).clients.get(client_id).map(|entry| ClientInfo {
            client_id: client_id.to_string(),
            endpoint: entry.endpoint.clone(),
            topics: entry.topics.iter().cloned().collect(),
        })
    }

    /// Local clients subscribed to `topic`, in id order.
    pub fn clients_by_topic(&self, topic: &str) -> Vec<String> {
        read(&self.local)
            .index
            .get(topic)
            .map(|owners| owners.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_local_subscriber(&self, topic: &str) -> bool {
        read(&self.local).index.contains_key(topic)
    }

    // ========================================================================
    // Mesh view
    // ========================================================================

    pub fn topics_by_node(&self, node: &NodeId) -> Vec<String> {
        if *node == self.local_id {
            return self.local_topics().1;
        }
        read(&self.peers)
            .get(node)
            .map(|peer| peer.topics.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every node with a subscriber for `topic`, this node included, sorted.
    pub fn nodes_by_topic(&self, topic: &str) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = read(&self.peers)
            .iter()
            .filter(|(_, peer)| peer.topics.contains(topic))
            .map(|(node, _)| *node)
            .collect();
        if self.has_local_subscriber(topic) {
            nodes.push(self.local_id);
        }
        nodes.sort();
        nodes
    }

    pub fn peer_seq(&self, node: &NodeId) -> Option<u32> {
        read(&self.peers).get(node).map(|peer| peer.seq)
    }

    /// True if `seq` is newer than what is cached for `node`.
    pub fn needs_refresh(&self, node: &NodeId, seq: u32) -> bool {
        self.peer_seq(node).is_none_or(|cached| seq > cached)
    }

    /// Replace a peer's cached topics unless the cache already holds a newer
    /// sequence. Invalid names are dropped. Returns whether it applied.
    pub fn update_peer_topics(&self, node: NodeId, seq: u32, topics: Vec<String>) -> bool {
        let topics: BTreeSet<String> = topics
            .into_iter()
            .filter(|topic| {
                let valid = is_valid_topic(topic);
                if !valid {
                    trace!(peer = %hex::encode(&node.as_bytes()[..8]), "ignoring invalid topic name");
                }
                valid
            })
            .take(MAX_PEER_TOPICS)
            .collect();

        let mut peers = write(&self.peers);
        if peers.get(&node).is_some_and(|cached| seq < cached.seq) {
            trace!(
                peer = %hex::encode(&node.as_bytes()[..8]),
                seq,
                "ignoring stale topic list"
            );
            return false;
        }
        debug!(
            peer = %hex::encode(&node.as_bytes()[..8]),
            seq,
            topics = topics.len(),
            "peer topics updated"
        );
        peers.insert(node, PeerTopics { seq, topics });
        true
    }

    pub fn remove_peer(&self, node: &NodeId) -> bool {
        write(&self.peers).remove(node).is_some()
    }

    /// Drop cached topics for every peer not in `connected`.
    pub fn retain_peers(&self, connected: &[NodeId]) -> usize {
        let mut peers = write(&self.peers);
        let before = peers.len();
        peers.retain(|node, _| connected.contains(node));
        before - peers.len()
    }

    pub fn peer_topics(&self) -> HashMap<NodeId, PeerTopics> {
        read(&self.peers).clone()
    }
}
