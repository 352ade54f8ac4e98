//! Per-client control session state
//!
//! A [`Control`] is created after a successful `Auth` handshake and lives until its
//! connection fails, its heartbeat lapses, or a newer session for the same client
//! supersedes it. Public request paths only interact with it through
//! [`Control::request_proxy`]; the multiplexer only through [`Control::register_proxy`].

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use backhaul_protocol::ServerMessage;

use crate::config::SessionConfig;
use crate::error::ServerError;
use crate::proxy::ProxyConn;
use crate::tunnel::Tunnel;

/// Outbound queue depth per control connection
const OUTBOUND_QUEUE: usize = 64;

static NEXT_CONTROL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Active,
    Closing,
    Closed,
}

/// What happened to a proxy connection handed to [`Control::register_proxy`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyDisposition {
    /// Given to a waiting public request
    Matched,
    /// Parked in the idle pool for the next request
    Pooled,
    /// Idle pool was full; connection closed
    Discarded,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<ProxyConn>,
}

#[derive(Default)]
struct ProxyQueue {
    waiters: VecDeque<Waiter>,
    idle: VecDeque<ProxyConn>,
    next_waiter: u64,
}

impl ProxyQueue {
    fn take_idle(&mut self, max_idle: Duration) -> Option<ProxyConn> {
        while let Some(conn) = self.idle.pop_front() {
            if conn.registered_at().elapsed() < max_idle {
                return Some(conn);
            }
        }
        None
    }

    fn reap(&mut self, max_idle: Duration) -> usize {
        let before = self.idle.len();
        self.idle
            .retain(|conn| conn.registered_at().elapsed() < max_idle);
        self.waiters.retain(|w| !w.tx.is_closed());
        before - self.idle.len()
    }
}

pub struct Control {
    id: u64,
    client_id: String,
    version: String,
    peer_addr: Option<SocketAddr>,
    connected_at: DateTime<Utc>,
    config: SessionConfig,
    outbound: mpsc::Sender<ServerMessage>,
    state: Mutex<ControlState>,
    proxies: Mutex<ProxyQueue>,
    tunnels: Mutex<Vec<Arc<Tunnel>>>,
    last_heartbeat: Mutex<Instant>,
    shutdown: CancellationToken,
}

impl Control {
    /// Create an active control; the receiver feeds the connection's writer task
    pub fn new(
        client_id: String,
        version: String,
        peer_addr: Option<SocketAddr>,
        config: SessionConfig,
    ) -> (Arc<Self>, mpsc::Receiver<ServerMessage>) {
        let (outbound, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let control = Arc::new(Self {
            id: NEXT_CONTROL_ID.fetch_add(1, Ordering::Relaxed),
            client_id,
            version,
            peer_addr,
            connected_at: Utc::now(),
            config,
            outbound,
            state: Mutex::new(ControlState::Active),
            proxies: Mutex::new(ProxyQueue::default()),
            tunnels: Mutex::new(Vec::new()),
            last_heartbeat: Mutex::new(Instant::now()),
            shutdown: CancellationToken::new(),
        });
        (control, rx)
    }

    /// Process-unique instance id (distinguishes sessions of the same client)
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> ControlState {
        *self.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ControlState::Active
    }

    /// Resolves once the session has been asked to shut down
    pub async fn cancelled(&self) {
        self.shutdown.cancelled().await
    }

    /// Queue a message for the client without waiting
    pub fn send(&self, msg: ServerMessage) -> bool {
        match self.outbound.try_send(msg) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(client_id = %self.client_id, "Dropped outbound message: {}", e);
                false
            }
        }
    }

    /// Queue a message for the client, waiting for queue space
    pub async fn send_async(&self, msg: ServerMessage) -> bool {
        self.outbound.send(msg).await.is_ok()
    }

    /// Record a liveness signal
    pub fn touch(&self) {
        *self.last_heartbeat.lock() = Instant::now();
    }

    pub fn since_heartbeat(&self) -> Duration {
        self.last_heartbeat.lock().elapsed()
    }

    /// `Some(elapsed)` when the heartbeat window has lapsed
    pub fn heartbeat_expired(&self) -> Option<Duration> {
        let elapsed = self.since_heartbeat();
        (elapsed > self.config.heartbeat_timeout).then_some(elapsed)
    }

    /// Snapshot of the tunnels this control owns
    pub fn tunnels(&self) -> Vec<Arc<Tunnel>> {
        self.tunnels.lock().clone()
    }

    /// Attach a freshly registered tunnel; refused once the control is closing
    ///
    /// A tunnel already owned for the same route is replaced and closed.
    pub fn adopt_tunnel(&self, tunnel: Arc<Tunnel>) -> bool {
        let state = self.state.lock();
        if *state != ControlState::Active {
            return false;
        }
        let mut tunnels = self.tunnels.lock();
        if let Some(index) = tunnels.iter().position(|t| t.route() == tunnel.route()) {
            let replaced = tunnels.remove(index);
            if !Arc::ptr_eq(&replaced, &tunnel) {
                replaced.close();
            }
        }
        tunnels.push(tunnel);
        true
    }

    /// Detach the owned tunnel with this URL
    pub fn take_tunnel(&self, url: &str) -> Option<Arc<Tunnel>> {
        let mut tunnels = self.tunnels.lock();
        let index = tunnels.iter().position(|t| t.url() == url)?;
        Some(tunnels.remove(index))
    }

    /// Detach every owned tunnel (teardown)
    pub fn take_tunnels(&self) -> Vec<Arc<Tunnel>> {
        std::mem::take(&mut *self.tunnels.lock())
    }

    /// Wait for a proxy connection for one public request
    ///
    /// Uses a pooled idle proxy when one is available; otherwise queues a demand
    /// behind earlier ones and asks the client for a new proxy.
    pub async fn request_proxy(&self, timeout: Duration) -> Result<ProxyConn, ServerError> {
        let deadline = Instant::now() + timeout;
        let (waiter_id, mut rx) = {
            let mut queue = self.proxies.lock();
            if !self.is_active() {
                return Err(ServerError::SessionClosed);
            }
            if let Some(conn) = queue.take_idle(self.config.proxy_idle_timeout) {
                tracing::trace!(client_id = %self.client_id, "Using pooled proxy connection");
                return Ok(conn);
            }

            let (tx, rx) = oneshot::channel();
            queue.next_waiter += 1;
            let id = queue.next_waiter;
            queue.waiters.push_back(Waiter { id, tx });
            (id, rx)
        };

        // The demand waits for queue space within the same budget as the proxy
        let outcome = tokio::time::timeout(timeout, async {
            tokio::select! {
                biased;
                conn = &mut rx => {
                    return conn.map_err(|_| ServerError::SessionClosed);
                }
                sent = self.outbound.send(ServerMessage::ReqProxy) => {
                    if sent.is_err() {
                        return Err(ServerError::SessionClosed);
                    }
                }
            }
            (&mut rx).await.map_err(|_| ServerError::SessionClosed)
        })
        .await;

        let err = match outcome {
            Ok(Ok(conn)) => return Ok(conn),
            Ok(Err(e)) if Instant::now() < deadline => e,
            Ok(Err(_)) | Err(_) => ServerError::Timeout(timeout),
        };

        self.proxies.lock().waiters.retain(|w| w.id != waiter_id);
        // A proxy may have landed between the failure and the removal
        match rx.try_recv() {
            Ok(conn) => Ok(conn),
            Err(_) => Err(err),
        }
    }

    /// Hand over a proxy connection that arrived through `RegProxy`
    ///
    /// Waiters are served oldest first; a waiter whose requester already gave up
    /// is skipped. Fails with `SessionClosed` (dropping the connection) once the
    /// control is shutting down.
    pub fn register_proxy(&self, conn: ProxyConn) -> Result<ProxyDisposition, ServerError> {
        let mut queue = self.proxies.lock();
        if !self.is_active() {
            return Err(ServerError::SessionClosed);
        }

        let mut conn = conn;
        while let Some(waiter) = queue.waiters.pop_front() {
            if waiter.tx.is_closed() {
                continue;
            }
            match waiter.tx.send(conn) {
                Ok(()) => return Ok(ProxyDisposition::Matched),
                Err(returned) => conn = returned,
            }
        }

        if queue.idle.len() >= self.config.proxy_pool_size {
            tracing::debug!(client_id = %self.client_id, "Proxy pool full, closing connection");
            return Ok(ProxyDisposition::Discarded);
        }
        queue.idle.push_back(conn);
        Ok(ProxyDisposition::Pooled)
    }

    /// Number of public requests currently waiting for a proxy
    pub fn pending_proxies(&self) -> usize {
        self.proxies.lock().waiters.len()
    }

    /// Number of parked proxy connections
    pub fn idle_proxies(&self) -> usize {
        self.proxies.lock().idle.len()
    }

    /// Drop expired idle proxies and abandoned waiters
    pub fn reap_proxies(&self) -> usize {
        self.proxies.lock().reap(self.config.proxy_idle_timeout)
    }

    /// Move to `Closing`: fail pending waits, drop idle proxies, close tunnels
    ///
    /// Returns false if the control was already closing. Registry cleanup is the
    /// session's job once it observes the cancellation.
    pub fn shutdown(&self, reason: &str) -> bool {
        {
            let mut state = self.state.lock();
            if *state != ControlState::Active {
                return false;
            }
            *state = ControlState::Closing;
        }

        tracing::info!(client_id = %self.client_id, control = self.id, "Closing control: {}", reason);
        self.shutdown.cancel();

        let (waiters, idle) = {
            let mut queue = self.proxies.lock();
            (
                std::mem::take(&mut queue.waiters),
                std::mem::take(&mut queue.idle),
            )
        };
        // Dropping the senders wakes every waiter with SessionClosed
        drop(waiters);
        drop(idle);

        for tunnel in self.tunnels.lock().iter() {
            tunnel.close();
        }
        true
    }

    /// Terminal state, set once the session has released everything
    pub(crate) fn mark_closed(&self) {
        *self.state.lock() = ControlState::Closed;
    }
}

impl std::fmt::Debug for Control {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Control")
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}
