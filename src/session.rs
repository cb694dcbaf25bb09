//! # Peer Sessions
//!
//! A [`PeerSession`] is one verified, active connection to one peer. It owns
//! three tasks once started:
//!
//! - **writer**: drains a single ordered queue onto the stream, so frames to
//!   a peer leave in the order they were enqueued
//! - **reader**: decodes frames, records heartbeats, completes pending
//!   requests, and forwards everything else to the registry as events
//! - **heartbeat**: periodically enqueues the node's status sequence
//!
//! ## Lifecycle
//!
//! ```text
//! Created --start()--> Active --stop()--> Stopped
//!    \__________________stop()_____________^
//! ```
//!
//! The heartbeat task never holds the session itself between ticks. It keeps
//! the session's [`SessionKey`] and resolves it in the registry's table on
//! every tick; once the session has been removed the key stops resolving and
//! the task exits. `stop()` also aborts it, and a heartbeat is only enqueued
//! while holding the state lock, so none is produced after `stop()` returns.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use crate::error::{DisconnectReason, NetworkError};
use crate::identity::{NodeId, PeerEndpoint};
use crate::messages::{FrameKind, P2pMessage, PacketType, encode_frame, read_frame};
use crate::table::{self, SessionKey, SharedTable};
use crate::transport::{BoxedReader, BoxedWriter, Direction, SecureStream, TransportLink};

/// Interval between heartbeats on each session.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Frames queued per session before senders wait.
const OUTBOUND_QUEUE_SIZE: usize = 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Active,
    Stopped,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    pub node_id: NodeId,
    pub endpoint: PeerEndpoint,
    pub direction: Direction,
}

/// What a session reports to its owner.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    Message { key: SessionKey, message: P2pMessage },
    Closed { key: SessionKey, reason: DisconnectReason },
}

/// Everything a session needs from its owner to run.
pub(crate) struct SessionContext {
    pub table: SharedTable,
    pub events: mpsc::Sender<SessionEvent>,
    pub status_seq: Arc<AtomicU32>,
    pub heartbeat_interval: Duration,
}

type PendingResponses = Arc<Mutex<HashMap<u32, oneshot::Sender<P2pMessage>>>>;

struct SessionIo {
    reader: BoxedReader,
    writer: BoxedWriter,
    outbound_rx: mpsc::Receiver<Vec<u8>>,
}

#[derive(Default)]
struct Liveness {
    status_seq: AtomicU32,
    last_heartbeat: Mutex<Option<Instant>>,
}

impl Liveness {
    fn record(&self, status_seq: u32) {
        self.status_seq.store(status_seq, Ordering::Relaxed);
        *lock(&self.last_heartbeat) = Some(Instant::now());
    }
}

pub struct PeerSession {
    info: PeerInfo,
    state: Mutex<SessionState>,
    link: Arc<dyn TransportLink>,
    outbound: mpsc::Sender<Vec<u8>>,
    io: Mutex<Option<SessionIo>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    pending: PendingResponses,
    next_seq: AtomicU32,
    liveness: Arc<Liveness>,
    heartbeats_sent: AtomicU64,
}

impl PeerSession {
    pub(crate) fn new(stream: SecureStream) -> Arc<Self> {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
        Arc::new(Self {
            info: PeerInfo {
                node_id: stream.peer,
                endpoint: stream.remote,
                direction: stream.direction,
            },
            state: Mutex::new(SessionState::Created),
            link: stream.link,
            outbound,
            io: Mutex::new(Some(SessionIo {
                reader: stream.reader,
                writer: stream.writer,
                outbound_rx,
            })),
            tasks: Mutex::new(Vec::new()),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_seq: AtomicU32::new(1),
            liveness: Arc::new(Liveness::default()),
            heartbeats_sent: AtomicU64::new(0),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.info.node_id
    }

    pub fn info(&self) -> &PeerInfo {
        &self.info
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Last status sequence the peer announced in a heartbeat.
    pub fn peer_status_seq(&self) -> u32 {
        self.liveness.status_seq.load(Ordering::Relaxed)
    }

    pub fn last_heartbeat(&self) -> Option<Instant> {
        *lock(&self.liveness.last_heartbeat)
    }

    pub fn heartbeats_sent(&self) -> u64 {
        self.heartbeats_sent.load(Ordering::Relaxed)
    }

    /// Spawn the session tasks. No-op unless the session is `Created`.
    pub(crate) fn start(&self, key: SessionKey, ctx: SessionContext) {
        let mut state = lock(&self.state);
        if *state != SessionState::Created {
            return;
        }
        let Some(io) = lock(&self.io).take() else {
            return;
        };

        let writer = tokio::spawn(write_loop(io.writer, io.outbound_rx, key, ctx.events.clone()));
        let reader = tokio::spawn(read_loop(
            io.reader,
            key,
            self.info.node_id,
            self.pending.clone(),
            self.liveness.clone(),
            ctx.events,
        ));
        let heartbeat = tokio::spawn(heartbeat_loop(
            key,
            ctx.table,
            ctx.status_seq,
            ctx.heartbeat_interval,
        ));
        lock(&self.tasks).extend([writer, reader, heartbeat]);
        *state = SessionState::Active;

        debug!(
            peer = %hex::encode(&self.info.node_id.as_bytes()[..8]),
            endpoint = %self.info.endpoint,
            direction = ?self.info.direction,
            "session started"
        );
    }

    /// Tear the session down. Idempotent.
    ///
    /// Pending requests fail with `TransportClosed`. The link is closed with
    /// `reason` only if the transport is still open.
    pub fn stop(&self, reason: DisconnectReason) {
        {
            let mut state = lock(&self.state);
            if *state == SessionState::Stopped {
                return;
            }
            *state = SessionState::Stopped;
        }

        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        lock(&self.io).take();
        lock(&self.pending).clear();

        if self.link.is_open() {
            self.link.close(reason);
        }

        debug!(
            peer = %hex::encode(&self.info.node_id.as_bytes()[..8]),
            %reason,
            "session stopped"
        );
    }

    /// Enqueue a message. Does nothing unless the session is active.
    pub async fn send(&self, message: P2pMessage) -> Result<(), NetworkError> {
        if !self.is_active() {
            return Err(NetworkError::TransportClosed);
        }
        let frame = encode_frame(&message)?;
        self.outbound
            .send(frame)
            .await
            .map_err(|_| NetworkError::TransportClosed)
    }

    /// Enqueue without waiting for queue space. Fails with `QueueFull` when
    /// the peer is not draining its queue.
    pub fn try_send(&self, message: P2pMessage) -> Result<(), NetworkError> {
        if !self.is_active() {
            return Err(NetworkError::TransportClosed);
        }
        let frame = encode_frame(&message)?;
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => NetworkError::QueueFull(self.info.node_id),
            mpsc::error::TrySendError::Closed(_) => NetworkError::TransportClosed,
        })
    }

    /// Send `message` as a request and wait for the correlated response.
    pub async fn request(
        &self,
        mut message: P2pMessage,
        timeout: Duration,
    ) -> Result<P2pMessage, NetworkError> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        message.kind = FrameKind::Request;
        message.seq = seq;

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(seq, tx);
        let _cleanup = PendingCleanup {
            pending: &self.pending,
            seq,
        };

        self.send(message).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(NetworkError::TransportClosed),
            Err(_) => Err(NetworkError::RequestTimeout),
        }
    }

    /// Reply handle for an inbound message; inert unless it is a request.
    pub(crate) fn responder(&self, request: &P2pMessage) -> Responder {
        if !request.expects_response() {
            return Responder::none();
        }
        Responder {
            target: Some(ReplyTarget {
                outbound: self.outbound.clone(),
                peer: self.info.node_id,
                packet_type: request.packet_type,
                seq: request.seq,
            }),
        }
    }

    fn send_heartbeat(&self, status_seq: u32) -> bool {
        let state = lock(&self.state);
        if *state != SessionState::Active {
            return false;
        }
        let Ok(frame) = encode_frame(&P2pMessage::heartbeat(status_seq)) else {
            return false;
        };
        match self.outbound.try_send(frame) {
            Ok(()) => {
                self.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                trace!(
                    peer = %hex::encode(&self.info.node_id.as_bytes()[..8]),
                    "outbound queue full, skipping heartbeat"
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("info", &self.info)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

struct PendingCleanup<'a> {
    pending: &'a PendingResponses,
    seq: u32,
}

impl Drop for PendingCleanup<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.seq);
    }
}

#[derive(Debug)]
struct ReplyTarget {
    outbound: mpsc::Sender<Vec<u8>>,
    peer: NodeId,
    packet_type: PacketType,
    seq: u32,
}

/// Single-use reply handle for an inbound request.
///
/// Consumed by [`Responder::respond`]; dropping it without responding leaves
/// the requester to its timeout.
#[derive(Debug)]
pub struct Responder {
    target: Option<ReplyTarget>,
}

impl Responder {
    pub(crate) fn none() -> Self {
        Self { target: None }
    }

    pub fn expects_response(&self) -> bool {
        self.target.is_some()
    }

    pub async fn respond(self, payload: Vec<u8>) -> Result<(), NetworkError> {
        let Some(target) = self.target else {
            return Ok(());
        };
        let frame = encode_frame(&P2pMessage::response(target.packet_type, target.seq, payload))?;
        target
            .outbound
            .send(frame)
            .await
            .map_err(|_| NetworkError::TransportClosed)
    }

    /// Reply without waiting for queue space. Fails with `QueueFull` when the
    /// peer's outbound queue has no room.
    pub fn try_respond(self, payload: Vec<u8>) -> Result<(), NetworkError> {
        let Some(target) = self.target else {
            return Ok(());
        };
        let frame = encode_frame(&P2pMessage::response(target.packet_type, target.seq, payload))?;
        target.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => NetworkError::QueueFull(target.peer),
            mpsc::error::TrySendError::Closed(_) => NetworkError::TransportClosed,
        })
    }
}

#[cfg(test)]
impl Responder {
    /// Responder whose reply frame lands in the returned queue.
    pub(crate) fn detached(packet_type: PacketType, seq: u32) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (outbound, rx) = mpsc::channel(8);
        let responder = Self {
            target: Some(ReplyTarget {
                outbound,
                peer: NodeId::from_bytes([0; 32]),
                packet_type,
                seq,
            }),
        };
        (responder, rx)
    }
}

async fn write_loop(
    mut writer: BoxedWriter,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    key: SessionKey,
    events: mpsc::Sender<SessionEvent>,
) {
    while let Some(frame) = outbound.recv().await {
        let written = match writer.write_all(&frame).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            debug!(error = %e, "session write failed");
            let _ = events
                .send(SessionEvent::Closed {
                    key,
                    reason: DisconnectReason::TransportError,
                })
                .await;
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(
    mut reader: BoxedReader,
    key: SessionKey,
    peer: NodeId,
    pending: PendingResponses,
    liveness: Arc<Liveness>,
    events: mpsc::Sender<SessionEvent>,
) {
    let reason = loop {
        match read_frame(&mut reader).await {
            Ok(Some(message)) => {
                if let Some(status_seq) = message.heartbeat_status() {
                    trace!(
                        peer = %hex::encode(&peer.as_bytes()[..8]),
                        status_seq,
                        "heartbeat received"
                    );
                    liveness.record(status_seq);
                    continue;
                }
                if message.kind == FrameKind::Response {
                    let waiter = lock(&pending).remove(&message.seq);
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(message);
                        }
                        None => trace!(seq = message.seq, "dropping uncorrelated response"),
                    }
                    continue;
                }
                if events
                    .send(SessionEvent::Message { key, message })
                    .await
                    .is_err()
                {
                    break DisconnectReason::LocalShutdown;
                }
            }
            Ok(None) | Err(NetworkError::TransportClosed) => break DisconnectReason::RemoteClosed,
            Err(e) => {
                debug!(
                    peer = %hex::encode(&peer.as_bytes()[..8]),
                    error = %e,
                    "dropping session after read error"
                );
                break DisconnectReason::TransportError;
            }
        }
    };
    let _ = events.send(SessionEvent::Closed { key, reason }).await;
}

async fn heartbeat_loop(
    key: SessionKey,
    table: SharedTable,
    status_seq: Arc<AtomicU32>,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let session = table::read(&table).get(key).cloned();
        let Some(session) = session else {
            trace!("heartbeat target left the session table");
            break;
        };
        if !session.send_heartbeat(status_seq.load(Ordering::Relaxed)) {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::memory::MemoryNetwork;
    use crate::table::SessionTable;
    use crate::transport::SecureTransport;
    use std::sync::RwLock;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    struct Harness {
        session: Arc<PeerSession>,
        key: SessionKey,
        table: SharedTable,
        events: mpsc::Receiver<SessionEvent>,
        status_seq: Arc<AtomicU32>,
    }

    fn start_session(session: Arc<PeerSession>, heartbeat_interval: Duration) -> Harness {
        let table: SharedTable = Arc::new(RwLock::new(SessionTable::default()));
        let key = table::write(&table).insert(session.clone()).unwrap();
        let (tx, events) = mpsc::channel(64);
        let status_seq = Arc::new(AtomicU32::new(0));
        session.start(
            key,
            SessionContext {
                table: table.clone(),
                events: tx,
                status_seq: status_seq.clone(),
                heartbeat_interval,
            },
        );
        Harness {
            session,
            key,
            table,
            events,
            status_seq,
        }
    }

    async fn connected_pair() -> (Arc<PeerSession>, Arc<PeerSession>) {
        let network = MemoryNetwork::new();
        let a = network
            .bind(PeerEndpoint::new("a", 1), Keypair::generate().node_id())
            .unwrap();
        let b = network
            .bind(PeerEndpoint::new("b", 1), Keypair::generate().node_id())
            .unwrap();
        let outbound = a.dial(&PeerEndpoint::new("b", 1)).await.unwrap();
        let inbound = b.accept().await.unwrap().await.unwrap();
        (PeerSession::new(outbound), PeerSession::new(inbound))
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + TEST_TIMEOUT;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn heartbeats_carry_status_and_stop_with_session() {
        let (a, b) = connected_pair().await;
        let ha = start_session(a, Duration::from_millis(20));
        let hb = start_session(b, Duration::from_secs(3600));
        ha.status_seq.store(77, Ordering::Relaxed);

        assert!(wait_for(|| ha.session.heartbeats_sent() >= 3).await);
        assert!(wait_for(|| hb.session.peer_status_seq() == 77).await);
        assert!(hb.session.last_heartbeat().is_some());

        ha.session.stop(DisconnectReason::Requested);
        let sent_at_stop = ha.session.heartbeats_sent();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(ha.session.heartbeats_sent(), sent_at_stop);
        assert_eq!(ha.session.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn heartbeat_exits_when_key_goes_stale() {
        let (a, _b) = connected_pair().await;
        let ha = start_session(a, Duration::from_millis(20));
        assert!(wait_for(|| ha.session.heartbeats_sent() >= 1).await);

        let removed = table::write(&ha.table).remove(ha.key);
        assert!(removed.is_some());
        tokio::time::sleep(Duration::from_millis(60)).await;
        let settled = ha.session.heartbeats_sent();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ha.session.heartbeats_sent(), settled);
    }

    #[tokio::test]
    async fn request_response_correlates() {
        let (a, b) = connected_pair().await;
        let ha = start_session(a, Duration::from_secs(3600));
        let mut hb = start_session(b, Duration::from_secs(3600));

        let responder_session = hb.session.clone();
        tokio::spawn(async move {
            while let Some(event) = hb.events.recv().await {
                if let SessionEvent::Message { message, .. } = event {
                    assert_eq!(message.payload, b"ping");
                    let responder = responder_session.responder(&message);
                    assert!(responder.expects_response());
                    responder.respond(b"pong".to_vec()).await.unwrap();
                }
            }
        });

        let response = ha
            .session
            .request(
                P2pMessage::request(PacketType::Custom(1), b"ping".to_vec()),
                TEST_TIMEOUT,
            )
            .await
            .expect("response");
        assert_eq!(response.kind, FrameKind::Response);
        assert_eq!(response.payload, b"pong");
    }

    #[tokio::test]
    async fn unanswered_request_times_out_and_clears_waiter() {
        let (a, b) = connected_pair().await;
        let ha = start_session(a, Duration::from_secs(3600));
        let _hb = start_session(b, Duration::from_secs(3600));

        let err = ha
            .session
            .request(
                P2pMessage::request(PacketType::Custom(1), vec![]),
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert_eq!(err, NetworkError::RequestTimeout);
        assert!(lock(&ha.session.pending).is_empty());
    }

    #[tokio::test]
    async fn remote_stop_reports_closed() {
        let (a, b) = connected_pair().await;
        let mut ha = start_session(a, Duration::from_secs(3600));
        let hb = start_session(b, Duration::from_secs(3600));

        hb.session.stop(DisconnectReason::Requested);

        let event = tokio::time::timeout(TEST_TIMEOUT, ha.events.recv())
            .await
            .expect("closed event")
            .expect("channel open");
        match event {
            SessionEvent::Closed { key, reason } => {
                assert_eq!(key, ha.key);
                assert_eq!(reason, DisconnectReason::RemoteClosed);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn stopped_session_refuses_sends_and_restart() {
        let (a, _b) = connected_pair().await;
        let ha = start_session(a, Duration::from_secs(3600));
        assert_eq!(lock(&ha.session.tasks).len(), 3);

        ha.session.stop(DisconnectReason::Requested);
        ha.session.stop(DisconnectReason::Requested);

        let err = ha
            .session
            .send(P2pMessage::oneway(PacketType::Custom(2), vec![1]))
            .await
            .unwrap_err();
        assert_eq!(err, NetworkError::TransportClosed);

        let (tx, _rx) = mpsc::channel(1);
        ha.session.start(
            ha.key,
            SessionContext {
                table: ha.table.clone(),
                events: tx,
                status_seq: Arc::new(AtomicU32::new(0)),
                heartbeat_interval: Duration::from_millis(10),
            },
        );
        assert_eq!(ha.session.state(), SessionState::Stopped);
        assert!(lock(&ha.session.tasks).is_empty());
    }
}
