//! Generational session table.
//!
//! Sessions live in slots addressed by [`SessionKey`] = (index, generation).
//! Removing a session bumps its slot's generation, so a key held by a timer
//! or an in-flight event stops resolving the moment the session leaves the
//! table, even if the slot is later reused for another peer.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::NetworkError;
use crate::identity::NodeId;
use crate::session::PeerSession;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionKey {
    index: u32,
    generation: u32,
}

struct Slot {
    generation: u32,
    session: Option<Arc<PeerSession>>,
}

#[derive(Default)]
pub(crate) struct SessionTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_node: HashMap<NodeId, SessionKey>,
}

pub(crate) type SharedTable = Arc<RwLock<SessionTable>>;

pub(crate) fn read(table: &SharedTable) -> RwLockReadGuard<'_, SessionTable> {
    table.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn write(table: &SharedTable) -> RwLockWriteGuard<'_, SessionTable> {
    table.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SessionTable {
    /// Insert a session. At most one session per NodeId.
    pub fn insert(&mut self, session: Arc<PeerSession>) -> Result<SessionKey, NetworkError> {
        let node = session.node_id();
        if self.by_node.contains_key(&node) {
            return Err(NetworkError::DuplicateSession(node));
        }

        let key = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.session = Some(session);
                SessionKey {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    session: Some(session),
                });
                SessionKey {
                    index,
                    generation: 0,
                }
            }
        };

        self.by_node.insert(node, key);
        Ok(key)
    }

    pub fn get(&self, key: SessionKey) -> Option<&Arc<PeerSession>> {
        self.slots
            .get(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.session.as_ref())
    }

    pub fn get_by_node(&self, node: &NodeId) -> Option<&Arc<PeerSession>> {
        self.by_node.get(node).and_then(|key| self.get(*key))
    }

    pub fn remove(&mut self, key: SessionKey) -> Option<Arc<PeerSession>> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        let session = slot.session.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(key.index);
        self.by_node.remove(&session.node_id());
        Some(session)
    }

    pub fn remove_node(&mut self, node: &NodeId) -> Option<Arc<PeerSession>> {
        let key = *self.by_node.get(node)?;
        self.remove(key)
    }

    pub fn drain(&mut self) -> Vec<Arc<PeerSession>> {
        let keys: Vec<SessionKey> = self.by_node.values().copied().collect();
        keys.into_iter().filter_map(|key| self.remove(key)).collect()
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Arc<PeerSession>> {
        self.slots.iter().filter_map(|slot| slot.session.as_ref())
    }

    pub fn len(&self) -> usize {
        self.by_node.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Keypair, PeerEndpoint};
    use crate::memory::MemoryNetwork;
    use crate::transport::SecureTransport;

    async fn session_for(network: &MemoryNetwork, name: &str) -> Arc<PeerSession> {
        let local = PeerEndpoint::new(format!("{}-local", name), 1);
        let remote = PeerEndpoint::new(name, 1);
        let _listener = network
            .bind(remote.clone(), Keypair::generate().node_id())
            .unwrap();
        let dialer = network.bind(local, Keypair::generate().node_id()).unwrap();
        let stream = dialer.dial(&remote).await.unwrap();
        PeerSession::new(stream)
    }

    #[tokio::test]
    async fn one_session_per_node() {
        let network = MemoryNetwork::new();
        let session = session_for(&network, "a").await;
        let mut table = SessionTable::default();

        let key = table.insert(session.clone()).unwrap();
        assert!(table.get(key).is_some());
        assert!(matches!(
            table.insert(session.clone()),
            Err(NetworkError::DuplicateSession(_))
        ));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn stale_key_never_resolves_after_reuse() {
        let network = MemoryNetwork::new();
        let first = session_for(&network, "a").await;
        let second = session_for(&network, "b").await;
        let mut table = SessionTable::default();

        let old_key = table.insert(first.clone()).unwrap();
        assert!(table.remove(old_key).is_some());
        assert!(table.remove(old_key).is_none());

        let new_key = table.insert(second.clone()).unwrap();
        assert_eq!(new_key.index, old_key.index);
        assert_ne!(new_key.generation, old_key.generation);
        assert!(table.get(old_key).is_none());
        assert_eq!(
            table.get(new_key).map(|s| s.node_id()),
            Some(second.node_id())
        );
        assert!(table.get_by_node(&first.node_id()).is_none());
    }

    #[tokio::test]
    async fn drain_empties_table() {
        let network = MemoryNetwork::new();
        let mut table = SessionTable::default();
        table.insert(session_for(&network, "a").await).unwrap();
        table.insert(session_for(&network, "b").await).unwrap();

        assert_eq!(table.drain().len(), 2);
        assert_eq!(table.len(), 0);
        assert_eq!(table.sessions().count(), 0);
    }
}
