//! Test server harness for E2E tests
//!
//! Starts the multiplexer and the public HTTP plane on ephemeral ports, wired to
//! fresh registries, and exposes the shared state for assertions.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use backhaul_server::{
    ControlRegistry, HttpPlane, Multiplexer, RegistryConfig, ServerState, SessionConfig, TcpPlane,
    TunnelRegistry,
};

use crate::certificates::TestCertificates;

/// Global counter for allocating unique port ranges to each test server
static PORT_RANGE_COUNTER: AtomicU16 = AtomicU16::new(0);

/// Number of ports per test server
const PORTS_PER_SERVER: u16 = 10;

/// Base port for TCP plane allocations
const BASE_TCP_PORT: u16 = 51000;

/// Knobs for a test server
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub domain: String,
    /// Serve the tunnel port over TLS with generated certificates
    pub tls: bool,
    pub session: SessionConfig,
    pub registry: RegistryConfig,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            domain: "example.com".to_string(),
            tls: false,
            session: SessionConfig {
                handshake_timeout: Duration::from_secs(2),
                proxy_timeout: Duration::from_secs(5),
                ..SessionConfig::default()
            },
            registry: RegistryConfig::default(),
        }
    }
}

/// A running test server instance
pub struct TestServer {
    /// Shared tunnel port (control and proxy connections)
    pub tunnel_addr: SocketAddr,
    /// Public HTTP plane
    pub http_addr: SocketAddr,
    pub domain: String,
    /// TCP tunnel port range reserved for this server
    pub tcp_port_range: (u16, u16),
    /// Set when the tunnel port speaks TLS
    pub certs: Option<Arc<TestCertificates>>,
    /// Registries, for assertions
    pub state: Arc<ServerState>,
    shutdown: CancellationToken,
}

impl TestServer {
    /// Start a plaintext test server with default options
    pub async fn start() -> Result<Self> {
        Self::start_with(ServerOptions::default()).await
    }

    pub async fn start_with(options: ServerOptions) -> Result<Self> {
        let certs = options.tls.then(|| Arc::new(TestCertificates::generate()));
        let tls_acceptor = match &certs {
            Some(certs) => {
                let tls_config = backhaul_common::load_server_config_from_pem(
                    &certs.server_cert_pem,
                    &certs.server_key_pem,
                )
                .context("Failed to load server TLS config")?;
                Some(TlsAcceptor::from(Arc::new(tls_config)))
            }
            None => None,
        };

        // Allocate a unique port range for this test server
        let range_index = PORT_RANGE_COUNTER.fetch_add(1, Ordering::Relaxed);
        let start_port = BASE_TCP_PORT + (range_index * PORTS_PER_SERVER);
        let tcp_port_range = (start_port, start_port + PORTS_PER_SERVER - 1);

        let controls = ControlRegistry::new();
        let tunnels = TunnelRegistry::open(&options.registry).context("Failed to open registry")?;
        let tcp_plane = TcpPlane::new("127.0.0.1".parse()?, tcp_port_range);
        let state = ServerState::new(
            controls,
            tunnels.clone(),
            tcp_plane,
            options.domain.clone(),
            "http",
            options.session.clone(),
        );

        let multiplexer = Multiplexer::new(state.clone(), tls_acceptor);
        let http_plane = HttpPlane::new(tunnels, None, options.session.proxy_timeout);

        // Bind to ephemeral ports
        let tunnel_listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("Failed to bind tunnel port")?;
        let http_listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("Failed to bind HTTP plane")?;
        let tunnel_addr = tunnel_listener.local_addr()?;
        let http_addr = http_listener.local_addr()?;

        let shutdown = CancellationToken::new();

        let token = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = multiplexer.run_with_listener(tunnel_listener) => {
                    if let Err(e) = result {
                        tracing::error!("Tunnel listener error: {}", e);
                    }
                }
                _ = token.cancelled() => {
                    tracing::debug!("Tunnel listener shutting down");
                }
            }
        });

        let token = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = http_plane.run_with_listener(http_listener) => {
                    if let Err(e) = result {
                        tracing::error!("HTTP plane error: {}", e);
                    }
                }
                _ = token.cancelled() => {}
            }
        });

        Ok(Self {
            tunnel_addr,
            http_addr,
            domain: options.domain,
            tcp_port_range,
            certs,
            state,
            shutdown,
        })
    }

    /// Client TLS config trusting this server's CA, if TLS is on
    pub fn client_tls_config(&self) -> Result<Option<rustls::ClientConfig>> {
        self.certs
            .as_ref()
            .map(|certs| {
                backhaul_common::load_client_config_from_pem(&certs.ca_cert_pem)
                    .context("Failed to load client TLS config")
            })
            .transpose()
    }

    /// Public base URL of the HTTP plane
    pub fn http_base(&self) -> String {
        format!("http://{}", self.http_addr)
    }

    /// Host header value for a subdomain of the server domain
    pub fn host_for(&self, subdomain: &str) -> String {
        format!("{}.{}", subdomain, self.domain)
    }

    /// Stop listeners and close every control session
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            self.shutdown.cancel();
            self.state.controls.close_all();
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
