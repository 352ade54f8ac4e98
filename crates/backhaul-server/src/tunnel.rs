use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use backhaul_common::BoxedStream;
use backhaul_protocol::Protocol;

use crate::cache::Weighted;
use crate::control::Control;
use crate::error::ServerError;

/// Dead proxies are retried this many times before a public request gives up
const START_PROXY_ATTEMPTS: usize = 3;

/// Persisted part of a tunnel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelRecord {
    pub route: String,
    pub client_id: String,
    pub protocol: Protocol,
    pub url: String,
    pub local_addr: String,
    #[serde(default)]
    pub remote_port: Option<u16>,
    pub created_at: DateTime<Utc>,
}

/// A public route bound to one client's local service
///
/// Immutable once created. The owning control is held weakly so a tunnel that
/// outlives its session (evicted late, or restored from the journal) never keeps
/// the session alive.
#[derive(Debug)]
pub struct Tunnel {
    record: TunnelRecord,
    control: Weak<Control>,
    restored: bool,
    closed: CancellationToken,
}

impl Tunnel {
    pub fn new(record: TunnelRecord, control: &Arc<Control>) -> Arc<Self> {
        Arc::new(Self {
            record,
            control: Arc::downgrade(control),
            restored: false,
            closed: CancellationToken::new(),
        })
    }

    /// Rebuild a reservation from the journal; it has no owner until reclaimed
    pub fn restore(record: TunnelRecord) -> Arc<Self> {
        Arc::new(Self {
            record,
            control: Weak::new(),
            restored: true,
            closed: CancellationToken::new(),
        })
    }

    pub fn route(&self) -> &str {
        &self.record.route
    }

    pub fn client_id(&self) -> &str {
        &self.record.client_id
    }

    pub fn protocol(&self) -> Protocol {
        self.record.protocol
    }

    pub fn url(&self) -> &str {
        &self.record.url
    }

    pub fn local_addr(&self) -> &str {
        &self.record.local_addr
    }

    pub fn remote_port(&self) -> Option<u16> {
        self.record.remote_port
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.record.created_at
    }

    pub fn record(&self) -> &TunnelRecord {
        &self.record
    }

    /// Loaded from the journal rather than created by a session
    pub fn is_restored(&self) -> bool {
        self.restored
    }

    /// The owning control, if it is still in memory
    pub fn owner(&self) -> Option<Arc<Control>> {
        self.control.upgrade()
    }

    /// Whether the owning control is active
    pub fn is_live(&self) -> bool {
        self.owner().is_some_and(|control| control.is_active())
    }

    /// Stop serving this tunnel (cancels its TCP listener, if any)
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the tunnel is closed
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Obtain a proxy connection for one public connection
    ///
    /// Waits for the owning control to supply a proxy, announces the public peer
    /// with `StartProxy`, and returns the raw stream. A proxy that dies before
    /// `StartProxy` goes through is discarded and another one is requested, all
    /// within the same overall `timeout`.
    pub async fn request_proxy(
        &self,
        client_addr: &str,
        timeout: Duration,
    ) -> Result<BoxedStream, ServerError> {
        let control = self
            .owner()
            .ok_or_else(|| ServerError::TunnelOffline(self.record.route.clone()))?;

        let deadline = Instant::now() + timeout;
        let mut last_error = None;

        for attempt in 1..=START_PROXY_ATTEMPTS {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let mut conn = match control.request_proxy(remaining).await {
                Ok(conn) => conn,
                // Report the caller's full budget, not the last slice of it
                Err(ServerError::Timeout(_)) => return Err(ServerError::Timeout(timeout)),
                Err(e) => return Err(e),
            };

            match conn.start(&self.record.url, client_addr).await {
                Ok(()) => return Ok(conn.into_stream()),
                Err(e) => {
                    tracing::debug!(
                        route = %self.record.route,
                        attempt,
                        "Proxy connection failed to start: {}",
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| ServerError::TunnelOffline(self.record.route.clone())))
    }
}

impl Weighted for Tunnel {
    fn weight(&self) -> usize {
        std::mem::size_of::<Tunnel>()
            + self.record.route.len()
            + self.record.client_id.len()
            + self.record.url.len()
            + self.record.local_addr.len()
    }
}

/// Route key for a TCP tunnel on `port`
pub fn tcp_route(port: u16) -> String {
    format!("tcp:{}", port)
}

/// Normalize a Host header value into an HTTP route key
///
/// Strips the port and any trailing dot and lower-cases the name.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let name = match host.rsplit_once(':') {
        Some((name, port))
            if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) && !name.ends_with(':') =>
        {
            name
        }
        _ => host,
    };
    name.trim_end_matches('.').to_ascii_lowercase()
}

/// Validate subdomain format (alphanumeric and hyphens only)
pub fn is_valid_subdomain(subdomain: &str) -> bool {
    if subdomain.is_empty() || subdomain.len() > 63 {
        return false;
    }

    let bytes = subdomain.as_bytes();
    if !bytes[0].is_ascii_alphanumeric() || !bytes[bytes.len() - 1].is_ascii_alphanumeric() {
        return false;
    }

    subdomain
        .bytes()
        .all(|c| c.is_ascii_alphanumeric() || c == b'-')
}

/// Validate a full hostname: dot-separated labels that are each valid subdomains
pub fn is_valid_hostname(hostname: &str) -> bool {
    hostname.len() <= 253 && hostname.split('.').all(is_valid_subdomain)
}
