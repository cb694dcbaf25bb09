//! # meshgate - P2P Gateway Transport and Topic Messaging
//!
//! meshgate connects blockchain gateway nodes into an authenticated mesh and
//! routes application data between their clients by topic:
//!
//! - **Identity**: Ed25519 keypairs; a node's id is its 32-byte public key
//! - **Transport**: QUIC with mutual TLS 1.3 over self-signed Ed25519 certificates
//! - **Sessions**: one per peer, with heartbeats carrying the node's status sequence
//! - **AMOP**: topic sequence gossip, topic list sync, and topic-addressed
//!   request/broadcast routing
//!
//! ## Architecture
//!
//! - `Host` listens and dials, and hands every verified stream to the registry
//! - `PeerRegistry` owns the sessions and the node-to-node send path
//! - `Amop` is a cheap-to-clone handle over an actor that owns topic gossip
//! - `Node` owns all of the above and shuts them down together
//!
//! ## Security Model
//!
//! - Identity = public key; a certificate's common name must be the hex of
//!   its own key, and the handshake yields the peer's verified `NodeId`
//! - One session per `NodeId`; duplicates and self connections are refused
//! - Frames are length-prefixed and size-bounded before allocation
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API combining all components |
//! | `identity` | Keypairs, NodeIds, peer endpoints |
//! | `crypto` | TLS certificate generation and verification |
//! | `transport` | Secure transport trait and QUIC implementation |
//! | `memory` | In-process transport for tests |
//! | `host` | Listening, outbound connection tracking, handshake timeouts |
//! | `session` | Per-peer reader, writer and heartbeat tasks |
//! | `registry` | Session table, unicast/request/multicast/broadcast |
//! | `topics` | Local subscriptions and the per-peer topic cache |
//! | `amop` | Topic sync protocol and topic routing |
//! | `protocols` | Node-to-node messaging trait used by `amop` |
//! | `messages` | Frame codec and wire types |

mod amop;
mod crypto;
mod error;
mod host;
mod identity;
mod memory;
mod messages;
mod node;
mod protocols;
mod registry;
mod session;
mod table;
mod topics;
mod transport;

pub use amop::{
    Amop, AmopConfig, ClientDelivery, DEFAULT_CLIENT_RESPONSE_TIMEOUT, DEFAULT_TOPIC_REQUEST_TIMEOUT,
    DEFAULT_TOPIC_SYNC_PERIOD, DEFAULT_WORKER_LIMIT,
};
pub use error::{Completion, DisconnectReason, NetworkError};
pub use host::{
    ConnectResult, DEFAULT_CONNECT_TIMEOUT, DEFAULT_HANDSHAKE_TIMEOUT, Host, HostConfig, SessionSink,
};
pub use identity::{Keypair, NodeId, PeerEndpoint};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use messages::{AmopMessage, AmopStatus, FrameKind, MAX_FRAME_SIZE, P2pMessage, PacketType};
pub use node::{DEFAULT_RECONNECT_INTERVAL, Node, NodeConfig};
pub use protocols::P2pInterface;
pub use registry::{
    DEFAULT_REQUEST_TIMEOUT, InboundMessage, PeerEvent, PeerRegistry, PeerSessionInfo, RegistryConfig,
    SendOptions,
};
pub use session::{DEFAULT_HEARTBEAT_INTERVAL, PeerInfo, PeerSession, Responder, SessionState};
pub use topics::{
    ClientInfo, MAX_TOPIC_LENGTH, PeerTopics, TopicError, TopicManager, is_valid_topic, parse_topic_info,
};
pub use transport::{
    BoxedReader, BoxedWriter, Direction, PendingHandshake, QuicTransport, SecureStream, SecureTransport,
    TransportLink,
};
