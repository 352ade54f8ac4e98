use std::sync::Arc;

use crate::config::SessionConfig;
use crate::control_registry::ControlRegistry;
use crate::tcp_plane::TcpPlane;
use crate::tunnel_registry::TunnelRegistry;

/// Everything a connection task needs, built once at startup and shared
pub struct ServerState {
    pub controls: Arc<ControlRegistry>,
    pub tunnels: Arc<TunnelRegistry>,
    pub tcp_plane: Arc<TcpPlane>,
    /// Base domain for generated subdomains and TCP URLs
    pub domain: String,
    /// Scheme of the URLs handed out for HTTP tunnels
    pub http_scheme: String,
    pub session: SessionConfig,
}

impl ServerState {
    pub fn new(
        controls: Arc<ControlRegistry>,
        tunnels: Arc<TunnelRegistry>,
        tcp_plane: Arc<TcpPlane>,
        domain: impl Into<String>,
        http_scheme: impl Into<String>,
        session: SessionConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            controls,
            tunnels,
            tcp_plane,
            domain: domain.into(),
            http_scheme: http_scheme.into(),
            session,
        })
    }
}
