//! # Session Manager
//!
//! [`Host`] owns the listening side of a [`SecureTransport`] and the set of
//! outbound connection attempts still in flight. Every transport that
//! completes a verified handshake, inbound or outbound, is handed to a
//! [`SessionSink`] which turns it into a live [`PeerSession`].
//!
//! ## Pending connections
//!
//! At most one outbound attempt per [`PeerEndpoint`] is in flight. The entry
//! is inserted before dialing and removed by a guard on every exit path
//! (success, failure, timeout, abort), always before the caller's result
//! callback runs.
//!
//! ## Timeouts
//!
//! | Phase | Default |
//! |-------|---------|
//! | outbound dial + handshake | [`DEFAULT_CONNECT_TIMEOUT`] |
//! | inbound handshake | [`DEFAULT_HANDSHAKE_TIMEOUT`] |

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use crate::error::{Completion, DisconnectReason, NetworkError};
use crate::identity::{NodeId, PeerEndpoint};
use crate::session::PeerSession;
use crate::transport::{PendingHandshake, SecureStream, SecureTransport};

/// Upper bound on an outbound dial including the TLS handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(50);

/// Upper bound on completing an accepted inbound handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct HostConfig {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

/// Receives every verified transport the host produces.
pub trait SessionSink: Send + Sync + 'static {
    /// Register and start a session for `stream`.
    fn on_established(&self, stream: SecureStream) -> Result<Arc<PeerSession>, NetworkError>;

    /// Stop every active session.
    fn disconnect_all(&self, reason: DisconnectReason);
}

pub type ConnectResult = Result<(NodeId, Arc<PeerSession>), NetworkError>;

struct PendingDial {
    attempt: u64,
    abort: AbortHandle,
}

type PendingSet = Arc<Mutex<HashMap<PeerEndpoint, PendingDial>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One outbound attempt. Clears its pending entry before reporting, and
/// reports `Shutdown` if dropped without a result.
struct ConnectAttempt {
    pending: PendingSet,
    endpoint: PeerEndpoint,
    attempt: u64,
    completion: Option<Completion<(NodeId, Arc<PeerSession>)>>,
}

impl ConnectAttempt {
    fn clear(&self) {
        let mut pending = lock(&self.pending);
        if pending
            .get(&self.endpoint)
            .is_some_and(|dial| dial.attempt == self.attempt)
        {
            pending.remove(&self.endpoint);
        }
    }

    fn finish(mut self, result: ConnectResult) {
        self.clear();
        if let Some(completion) = self.completion.take() {
            completion.complete(result);
        }
    }
}

impl Drop for ConnectAttempt {
    fn drop(&mut self) {
        self.clear();
    }
}

pub struct Host {
    transport: Arc<dyn SecureTransport>,
    sink: Arc<dyn SessionSink>,
    config: HostConfig,
    pending: PendingSet,
    next_attempt: AtomicU64,
    started: AtomicBool,
    running: Arc<AtomicBool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Host {
    pub fn new(
        transport: Arc<dyn SecureTransport>,
        sink: Arc<dyn SessionSink>,
        config: HostConfig,
    ) -> Self {
        Self {
            transport,
            sink,
            config,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_attempt: AtomicU64::new(1),
            started: AtomicBool::new(false),
            running: Arc::new(AtomicBool::new(false)),
            accept_task: Mutex::new(None),
        }
    }

    /// Begin accepting inbound connections. Only the first call has effect.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        self.running.store(true, Ordering::Release);
        let task = tokio::spawn(accept_loop(
            self.transport.clone(),
            self.sink.clone(),
            self.config.handshake_timeout,
            self.running.clone(),
        ));
        *lock(&self.accept_task) = Some(task);
        info!(local = %self.transport.local_endpoint(), "host listening");
    }

    /// Stop listening, abort pending dials and disconnect every session.
    /// Idempotent; a no-op if the host never started.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.transport.close();
        if let Some(task) = lock(&self.accept_task).take() {
            task.abort();
        }

        let aborts: Vec<AbortHandle> = lock(&self.pending)
            .drain()
            .map(|(_, dial)| dial.abort)
            .collect();
        for abort in aborts {
            abort.abort();
        }

        self.sink.disconnect_all(DisconnectReason::LocalShutdown);
        info!("host stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn local_endpoint(&self) -> PeerEndpoint {
        self.transport.local_endpoint()
    }

    pub fn pending_connections(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_connecting(&self, endpoint: &PeerEndpoint) -> bool {
        lock(&self.pending).contains_key(endpoint)
    }

    /// Start an outbound connection to `endpoint`.
    ///
    /// `on_result` runs exactly once with the new session or the failure.
    /// Fails immediately with `AlreadyConnecting` if an attempt to the same
    /// endpoint is in flight, or `Shutdown` if the host is not running.
    pub fn connect<F>(&self, endpoint: PeerEndpoint, on_result: F) -> Result<(), NetworkError>
    where
        F: FnOnce(ConnectResult) + Send + 'static,
    {
        // `stop` clears `running` before draining the pending set, so the
        // check and the insert must share one critical section.
        let mut pending = lock(&self.pending);
        if !self.is_running() {
            return Err(NetworkError::Shutdown);
        }
        if pending.contains_key(&endpoint) {
            return Err(NetworkError::AlreadyConnecting(endpoint));
        }

        let attempt = self.next_attempt.fetch_add(1, Ordering::Relaxed);
        let guard = ConnectAttempt {
            pending: self.pending.clone(),
            endpoint: endpoint.clone(),
            attempt,
            completion: Some(Completion::new(on_result)),
        };
        let transport = self.transport.clone();
        let sink = self.sink.clone();
        let running = self.running.clone();
        let timeout = self.config.connect_timeout;

        debug!(endpoint = %endpoint, attempt, "connecting");
        let task = tokio::spawn(async move {
            let result = establish(&*transport, &*sink, &guard.endpoint, timeout, &running).await;
            if let Err(e) = &result {
                debug!(endpoint = %guard.endpoint, error = %e, "outbound connection failed");
            }
            guard.finish(result);
        });
        pending.insert(
            endpoint,
            PendingDial {
                attempt,
                abort: task.abort_handle(),
            },
        );
        Ok(())
    }

    /// Connect and wait for the outcome.
    pub async fn connect_and_wait(&self, endpoint: PeerEndpoint) -> ConnectResult {
        let (tx, rx) = oneshot::channel();
        self.connect(endpoint, move |result| {
            let _ = tx.send(result);
        })?;
        rx.await.unwrap_or(Err(NetworkError::Shutdown))
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.accept_task).take() {
            task.abort();
        }
        let aborts: Vec<AbortHandle> = lock(&self.pending)
            .drain()
            .map(|(_, dial)| dial.abort)
            .collect();
        for abort in aborts {
            abort.abort();
        }
    }
}

async fn establish(
    transport: &dyn SecureTransport,
    sink: &dyn SessionSink,
    endpoint: &PeerEndpoint,
    timeout: Duration,
    running: &AtomicBool,
) -> ConnectResult {
    let stream = match tokio::time::timeout(timeout, transport.dial(endpoint)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(NetworkError::ConnectTimeout),
    };
    if !running.load(Ordering::Acquire) {
        stream.link.close(DisconnectReason::LocalShutdown);
        return Err(NetworkError::Shutdown);
    }
    let peer = stream.peer;
    let session = sink.on_established(stream)?;
    Ok((peer, session))
}

async fn accept_loop(
    transport: Arc<dyn SecureTransport>,
    sink: Arc<dyn SessionSink>,
    handshake_timeout: Duration,
    running: Arc<AtomicBool>,
) {
    while let Some(pending) = transport.accept().await {
        if !running.load(Ordering::Acquire) {
            break;
        }
        tokio::spawn(complete_inbound(
            pending,
            sink.clone(),
            handshake_timeout,
            running.clone(),
        ));
    }
    debug!("accept loop exited");
}

async fn complete_inbound(
    pending: PendingHandshake,
    sink: Arc<dyn SessionSink>,
    handshake_timeout: Duration,
    running: Arc<AtomicBool>,
) {
    let stream = match tokio::time::timeout(handshake_timeout, pending).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!(error = %e, "inbound handshake failed");
            return;
        }
        Err(_) => {
            debug!("inbound handshake timed out");
            return;
        }
    };
    if !running.load(Ordering::Acquire) {
        stream.link.close(DisconnectReason::LocalShutdown);
        return;
    }

    let peer = stream.peer;
    let remote = stream.remote.clone();
    if let Err(e) = sink.on_established(stream) {
        warn!(
            peer = %hex::encode(&peer.as_bytes()[..8]),
            remote = %remote,
            error = %e,
            "inbound session rejected"
        );
    }
}
