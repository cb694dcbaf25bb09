//! Protocol trait definitions for the meshgate networking layer.
//!
//! Higher-level modules talk to peers through [`P2pInterface`] rather than
//! the concrete [`PeerRegistry`](crate::registry::PeerRegistry), so topic
//! routing can be exercised against an in-process fake in tests.
//!
//! | Operation | Delivery |
//! |-----------|----------|
//! | `request` | one peer, waits for the correlated response |
//! | `send_oneway` | one peer, no response |
//! | `multicast` | listed peers, best effort |
//! | `broadcast` | every connected peer, best effort |

use async_trait::async_trait;

use crate::error::NetworkError;
use crate::identity::NodeId;
use crate::messages::P2pMessage;
use crate::registry::SendOptions;

/// Node-to-node messaging used by the topic layer.
#[async_trait]
pub trait P2pInterface: Send + Sync + 'static {
    fn local_node_id(&self) -> NodeId;

    /// Peers with an active session.
    fn connected_peers(&self) -> Vec<NodeId>;

    /// Send a request and wait for the peer's response.
    async fn request(
        &self,
        to: &NodeId,
        message: P2pMessage,
        options: SendOptions,
    ) -> Result<P2pMessage, NetworkError>;

    async fn send_oneway(&self, to: &NodeId, message: P2pMessage) -> Result<(), NetworkError>;

    /// Returns how many of `to` accepted the message.
    async fn multicast(&self, to: &[NodeId], message: P2pMessage) -> usize;

    /// Returns how many peers accepted the message.
    async fn broadcast(&self, message: P2pMessage) -> usize;
}
