use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};

use crate::error::ServerError;
use crate::tunnel::Tunnel;

/// Port allocator for TCP tunnels
pub struct PortAllocator {
    start: u16,
    end: u16,
    allocated: RwLock<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(start: u16, end: u16) -> Arc<Self> {
        Arc::new(Self {
            start,
            end,
            allocated: RwLock::new(HashSet::new()),
        })
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    /// Allocate the lowest free port accepted by `accept`
    pub fn allocate_where(&self, mut accept: impl FnMut(u16) -> bool) -> Option<u16> {
        let mut allocated = self.allocated.write();
        let port = (self.start..=self.end).find(|port| !allocated.contains(port) && accept(*port))?;
        allocated.insert(port);
        Some(port)
    }

    /// Claim a specific port; false if it is outside the range or taken
    pub fn claim(&self, port: u16) -> bool {
        self.contains(port) && self.allocated.write().insert(port)
    }

    /// Release a port back to the pool
    pub fn release(&self, port: u16) {
        self.allocated.write().remove(&port);
    }

    pub fn is_allocated(&self, port: u16) -> bool {
        self.allocated.read().contains(&port)
    }
}

/// Public listeners for TCP tunnels, one per allocated port
pub struct TcpPlane {
    bind_host: IpAddr,
    ports: Arc<PortAllocator>,
}

impl TcpPlane {
    pub fn new(bind_host: IpAddr, port_range: (u16, u16)) -> Arc<Self> {
        Arc::new(Self {
            bind_host,
            ports: PortAllocator::new(port_range.0, port_range.1),
        })
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    /// Bind a public listener on `requested`, or on a free port from the range
    ///
    /// `available` filters out ports whose route is still reserved in the tunnel
    /// registry. Ports the OS refuses to bind are skipped.
    pub async fn bind(
        &self,
        requested: Option<u16>,
        available: impl Fn(u16) -> bool,
    ) -> Result<(TcpListener, u16), ServerError> {
        if let Some(port) = requested.filter(|p| *p != 0) {
            if !self.ports.contains(port) {
                return Err(ServerError::InvalidRoute(format!(
                    "port {} is outside the tunnel range",
                    port
                )));
            }
            if !available(port) || !self.ports.claim(port) {
                return Err(ServerError::InvalidRoute(format!("port {} is in use", port)));
            }
            return match TcpListener::bind(SocketAddr::new(self.bind_host, port)).await {
                Ok(listener) => Ok((listener, port)),
                Err(e) => {
                    self.ports.release(port);
                    Err(e.into())
                }
            };
        }

        let mut refused = HashSet::new();
        loop {
            let port = self
                .ports
                .allocate_where(|p| !refused.contains(&p) && available(p))
                .ok_or(ServerError::PortsExhausted)?;

            match TcpListener::bind(SocketAddr::new(self.bind_host, port)).await {
                Ok(listener) => return Ok((listener, port)),
                Err(e) => {
                    tracing::debug!(port, "Skipping port that failed to bind: {}", e);
                    self.ports.release(port);
                    refused.insert(port);
                }
            }
        }
    }

    /// Accept public connections for `tunnel` until it is closed
    pub fn serve(
        self: &Arc<Self>,
        listener: TcpListener,
        port: u16,
        tunnel: Arc<Tunnel>,
        proxy_timeout: Duration,
    ) {
        let this = self.clone();
        tokio::spawn(async move {
            tracing::info!(route = %tunnel.route(), port, "TCP plane listening");

            loop {
                tokio::select! {
                    _ = tunnel.closed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer_addr)) => {
                            let tunnel = tunnel.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer_addr, &tunnel, proxy_timeout).await {
                                    tracing::warn!(route = %tunnel.route(), "TCP connection from {} failed: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!(port, "TCP accept error: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }

            drop(listener);
            this.ports.release(port);
            tracing::info!(route = %tunnel.route(), port, "TCP listener closed");
        });
    }
}

/// Relay one public TCP connection over a proxy connection
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    tunnel: &Tunnel,
    proxy_timeout: Duration,
) -> Result<(), ServerError> {
    tracing::debug!(route = %tunnel.route(), "TCP connection from {}", peer_addr);

    let mut proxy = tunnel
        .request_proxy(&peer_addr.to_string(), proxy_timeout)
        .await?;

    let (sent, received) = tokio::io::copy_bidirectional(&mut stream, &mut proxy).await?;
    tracing::debug!(
        route = %tunnel.route(),
        sent,
        received,
        "TCP connection from {} finished",
        peer_addr
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_lowest_free_port() {
        let ports = PortAllocator::new(40000, 40002);
        assert_eq!(ports.allocate_where(|_| true), Some(40000));
        assert_eq!(ports.allocate_where(|_| true), Some(40001));

        ports.release(40000);
        assert!(!ports.is_allocated(40000));
        assert_eq!(ports.allocate_where(|_| true), Some(40000));
    }

    #[test]
    fn test_allocate_respects_predicate_and_exhaustion() {
        let ports = PortAllocator::new(40000, 40002);
        assert_eq!(ports.allocate_where(|p| p != 40000), Some(40001));
        assert_eq!(ports.allocate_where(|p| p != 40000), Some(40002));
        assert_eq!(ports.allocate_where(|p| p != 40000), None);
    }

    #[test]
    fn test_claim() {
        let ports = PortAllocator::new(40000, 40002);
        assert!(ports.claim(40001));
        assert!(!ports.claim(40001));
        assert!(!ports.claim(39999));
        assert_eq!(ports.allocate_where(|_| true), Some(40000));
        assert_eq!(ports.allocate_where(|_| true), Some(40002));
    }

    #[tokio::test]
    async fn test_bind_skips_ports_in_use() {
        let blocker = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken = blocker.local_addr().unwrap().port();
        // A two-port range starting at a bound port
        let Some(end) = taken.checked_add(1) else {
            return;
        };

        let plane = TcpPlane::new("127.0.0.1".parse().unwrap(), (taken, end));
        match plane.bind(None, |_| true).await {
            Ok((_listener, port)) => assert_eq!(port, end),
            // The neighbouring port may belong to someone else too
            Err(e) => assert!(matches!(e, ServerError::PortsExhausted)),
        }
        assert!(!plane.ports().is_allocated(taken));
    }

    #[tokio::test]
    async fn test_bind_rejects_requested_port_outside_range() {
        let plane = TcpPlane::new("127.0.0.1".parse().unwrap(), (40000, 40010));
        let err = plane.bind(Some(50000), |_| true).await.unwrap_err();
        assert!(matches!(err, ServerError::InvalidRoute(_)));
    }

    #[tokio::test]
    async fn test_bind_rejects_reserved_port() {
        let plane = TcpPlane::new("127.0.0.1".parse().unwrap(), (40000, 40010));
        let err = plane.bind(Some(40005), |p| p != 40005).await.unwrap_err();
        assert!(matches!(err, ServerError::InvalidRoute(_)));
        assert!(!plane.ports().is_allocated(40005));
    }
}
