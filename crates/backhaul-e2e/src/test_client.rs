//! Protocol-level tunnel client for E2E tests
//!
//! Opens a control connection, registers tunnels, and answers `ReqProxy` by
//! dialing proxy connections that relay to the matching local service.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use backhaul_common::BoxedStream;
use backhaul_protocol::{ClientMessage, Protocol, ServerMessage, TunnelCodec};

use crate::harness::TestServer;

type ClientFramed = Framed<BoxedStream, TunnelCodec<ServerMessage, ClientMessage>>;

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Client behavior knobs
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub version: String,
    /// Send `Ping` on this interval; `None` goes silent after auth
    pub ping_interval: Option<Duration>,
    /// Dial a proxy connection for every `ReqProxy`
    pub answer_proxies: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            version: "e2e".to_string(),
            ping_interval: Some(Duration::from_millis(500)),
            answer_proxies: true,
        }
    }
}

/// A tunnel to request
#[derive(Debug, Clone)]
pub struct TunnelSpec {
    pub protocol: Protocol,
    pub hostname: Option<String>,
    pub subdomain: Option<String>,
    pub remote_port: Option<u16>,
    pub local_addr: String,
}

impl TunnelSpec {
    pub fn http_hostname(hostname: &str, local_addr: impl Into<String>) -> Self {
        Self {
            hostname: Some(hostname.to_string()),
            ..Self::http(local_addr)
        }
    }

    pub fn http_subdomain(subdomain: &str, local_addr: impl Into<String>) -> Self {
        Self {
            subdomain: Some(subdomain.to_string()),
            ..Self::http(local_addr)
        }
    }

    /// HTTP tunnel on a server-chosen subdomain
    pub fn http(local_addr: impl Into<String>) -> Self {
        Self {
            protocol: Protocol::Http,
            hostname: None,
            subdomain: None,
            remote_port: None,
            local_addr: local_addr.into(),
        }
    }

    /// TCP tunnel on a server-chosen port
    pub fn tcp(local_addr: impl Into<String>) -> Self {
        Self {
            protocol: Protocol::Tcp,
            ..Self::http(local_addr)
        }
    }

    pub fn tcp_port(port: u16, local_addr: impl Into<String>) -> Self {
        Self {
            remote_port: Some(port),
            ..Self::tcp(local_addr)
        }
    }
}

struct Inner {
    client_id: String,
    tunnel_addr: SocketAddr,
    tls: Option<TlsConnector>,
    outbound: mpsc::Sender<ClientMessage>,
    /// `req_id` -> reply slot for `NewTunnel`
    pending: Mutex<HashMap<String, oneshot::Sender<Result<String, String>>>>,
    /// Tunnel URL -> local address to relay to
    routes: RwLock<HashMap<String, String>>,
    answer_proxies: AtomicBool,
    proxy_requests: AtomicUsize,
    next_req: AtomicU64,
    /// Fires when the control connection ends for any reason
    closed: CancellationToken,
}

/// A connected test client
pub struct TestClient {
    inner: Arc<Inner>,
    tasks: Vec<JoinHandle<()>>,
}

impl TestClient {
    /// Authenticate as `client_id` with default options
    pub async fn connect(server: &TestServer, client_id: &str) -> Result<Self> {
        Self::connect_with(server, client_id, ClientOptions::default()).await
    }

    pub async fn connect_with(
        server: &TestServer,
        client_id: &str,
        options: ClientOptions,
    ) -> Result<Self> {
        let tls = server
            .client_tls_config()?
            .map(|config| TlsConnector::from(Arc::new(config)));

        let stream = dial(server.tunnel_addr, tls.as_ref()).await?;
        let mut framed: ClientFramed = Framed::new(stream, TunnelCodec::new());

        framed
            .send(ClientMessage::Auth {
                client_id: client_id.to_string(),
                version: options.version.clone(),
                user: None,
            })
            .await?;

        match next_message(&mut framed).await? {
            ServerMessage::AuthResp { error: Some(e), .. } => bail!("Auth rejected: {}", e),
            ServerMessage::AuthResp { .. } => {}
            other => bail!("Expected AuthResp, got {:?}", other),
        }

        let (outbound, outbound_rx) = mpsc::channel(64);
        let inner = Arc::new(Inner {
            client_id: client_id.to_string(),
            tunnel_addr: server.tunnel_addr,
            tls,
            outbound,
            pending: Mutex::new(HashMap::new()),
            routes: RwLock::new(HashMap::new()),
            answer_proxies: AtomicBool::new(options.answer_proxies),
            proxy_requests: AtomicUsize::new(0),
            next_req: AtomicU64::new(1),
            closed: CancellationToken::new(),
        });

        let (sink, stream) = framed.split();
        let mut tasks = vec![
            tokio::spawn(write_loop(inner.clone(), sink, outbound_rx)),
            tokio::spawn(read_loop(inner.clone(), stream)),
        ];
        if let Some(interval) = options.ping_interval {
            tasks.push(tokio::spawn(ping_loop(inner.clone(), interval)));
        }

        Ok(Self { inner, tasks })
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// Register a tunnel and return its public URL
    pub async fn request_tunnel(&self, spec: TunnelSpec) -> Result<String> {
        let req_id = self.inner.next_req.fetch_add(1, Ordering::Relaxed).to_string();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(req_id.clone(), tx);

        let local_addr = spec.local_addr.clone();
        self.send(ClientMessage::ReqTunnel {
            req_id: req_id.clone(),
            protocol: spec.protocol,
            hostname: spec.hostname,
            subdomain: spec.subdomain,
            remote_port: spec.remote_port,
            local_addr: spec.local_addr,
        })
        .await?;

        let reply = match tokio::time::timeout(REPLY_TIMEOUT, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => bail!("Control connection closed before NewTunnel"),
            Err(_) => {
                self.inner.pending.lock().remove(&req_id);
                bail!("Timed out waiting for NewTunnel");
            }
        };

        let url = reply.map_err(|e| anyhow!("Tunnel refused: {}", e))?;
        self.inner.routes.write().insert(url.clone(), local_addr);
        Ok(url)
    }

    /// Release a tunnel by URL
    pub async fn unregister(&self, url: &str) -> Result<()> {
        self.send(ClientMessage::UnregTunnel {
            url: url.to_string(),
        })
        .await?;
        self.inner.routes.write().remove(url);
        Ok(())
    }

    pub fn set_answer_proxies(&self, answer: bool) {
        self.inner.answer_proxies.store(answer, Ordering::SeqCst);
    }

    /// Number of `ReqProxy` messages received so far
    pub fn proxy_requests(&self) -> usize {
        self.inner.proxy_requests.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Wait until the server closes the control connection
    pub async fn wait_closed(&self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.inner.closed.cancelled())
            .await
            .context("Control connection still open")
    }

    /// Drop the control connection and all proxy connections
    pub fn disconnect(&mut self) {
        self.inner.closed.cancel();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    async fn send(&self, msg: ClientMessage) -> Result<()> {
        self.inner
            .outbound
            .send(msg)
            .await
            .map_err(|_| anyhow!("Control connection closed"))
    }
}

impl Drop for TestClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Open a raw connection to the tunnel port
async fn dial(addr: SocketAddr, tls: Option<&TlsConnector>) -> Result<BoxedStream> {
    let tcp = TcpStream::connect(addr)
        .await
        .with_context(|| format!("Failed to connect to {}", addr))?;
    tcp.set_nodelay(true)?;

    match tls {
        Some(connector) => {
            let stream = connector.connect("localhost".try_into()?, tcp).await?;
            Ok(Box::new(stream))
        }
        None => Ok(Box::new(tcp)),
    }
}

async fn next_message(framed: &mut ClientFramed) -> Result<ServerMessage> {
    match tokio::time::timeout(REPLY_TIMEOUT, framed.next()).await {
        Ok(Some(msg)) => Ok(msg?),
        Ok(None) => bail!("Server closed the connection"),
        Err(_) => bail!("Timed out waiting for the server"),
    }
}

async fn write_loop(
    inner: Arc<Inner>,
    mut sink: futures_util::stream::SplitSink<ClientFramed, ClientMessage>,
    mut outbound: mpsc::Receiver<ClientMessage>,
) {
    loop {
        let msg = tokio::select! {
            _ = inner.closed.cancelled() => break,
            msg = outbound.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        if let Err(e) = sink.send(msg).await {
            tracing::debug!("Test client write failed: {}", e);
            break;
        }
    }
    let _ = sink.close().await;
    inner.closed.cancel();
}

async fn read_loop(inner: Arc<Inner>, mut stream: futures_util::stream::SplitStream<ClientFramed>) {
    loop {
        let msg = tokio::select! {
            _ = inner.closed.cancelled() => break,
            msg = stream.next() => match msg {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    tracing::debug!("Test client read failed: {}", e);
                    break;
                }
                None => break,
            },
        };

        match msg {
            ServerMessage::NewTunnel { req_id, url, error, .. } => {
                if let Some(tx) = inner.pending.lock().remove(&req_id) {
                    let _ = tx.send(match error {
                        Some(e) => Err(e),
                        None => Ok(url),
                    });
                }
            }
            ServerMessage::ReqProxy => {
                inner.proxy_requests.fetch_add(1, Ordering::SeqCst);
                if inner.answer_proxies.load(Ordering::SeqCst) {
                    let inner = inner.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = inner.closed.cancelled() => {}
                            result = run_proxy(&inner) => {
                                if let Err(e) = result {
                                    tracing::debug!("Test proxy ended: {:#}", e);
                                }
                            }
                        }
                    });
                }
            }
            ServerMessage::Pong => {}
            other => tracing::warn!("Unexpected message on control connection: {:?}", other),
        }
    }

    inner.pending.lock().clear();
    inner.closed.cancel();
}

async fn ping_loop(inner: Arc<Inner>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = inner.closed.cancelled() => break,
            _ = ticker.tick() => {
                if inner.outbound.send(ClientMessage::Ping).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// One proxy connection: register, wait for `StartProxy`, then relay
async fn run_proxy(inner: &Inner) -> Result<()> {
    let stream = dial(inner.tunnel_addr, inner.tls.as_ref()).await?;
    let mut framed: ClientFramed = Framed::new(stream, TunnelCodec::new());
    framed
        .send(ClientMessage::RegProxy {
            client_id: inner.client_id.clone(),
        })
        .await?;

    // Pooled proxies may sit idle for a while, so no timeout here
    let url = match framed.next().await {
        Some(Ok(ServerMessage::StartProxy { url, .. })) => url,
        Some(Ok(other)) => bail!("Expected StartProxy, got {:?}", other),
        Some(Err(e)) => return Err(e.into()),
        None => bail!("Proxy connection closed before StartProxy"),
    };

    let local_addr = inner
        .routes
        .read()
        .get(&url)
        .cloned()
        .ok_or_else(|| anyhow!("No local address for {}", url))?;

    let parts = framed.into_parts();
    let mut remote = parts.io;
    let mut local = TcpStream::connect(&local_addr)
        .await
        .with_context(|| format!("Failed to connect to local service {}", local_addr))?;
    if !parts.read_buf.is_empty() {
        local.write_all(&parts.read_buf).await?;
    }

    tokio::io::copy_bidirectional(&mut remote, &mut local).await?;
    Ok(())
}
