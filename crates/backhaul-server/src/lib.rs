//! Backhaul tunnel server library
//!
//! Registries, control sessions, the shared tunnel-port multiplexer and the public
//! HTTP and TCP planes. The binary wires these together; the e2e harness embeds
//! them directly.

mod cache;
mod config;
mod control;
mod control_registry;
mod error;
mod http_plane;
mod journal;
mod mqtt;
mod multiplexer;
mod proxy;
mod reporting;
mod session;
mod state;
mod tcp_plane;
mod tunnel;
mod tunnel_registry;

// Re-export public types
pub use config::{
    LogSink, MqttConfig, RegistryConfig, ReportingConfig, ResolvedServerConfig, ServerConfig,
    SessionConfig, DEFAULT_MQTT_TOPIC, DEFAULT_REGISTRY_CAPACITY,
};
pub use control::{Control, ControlState, ProxyDisposition};
pub use control_registry::ControlRegistry;
pub use error::ServerError;
pub use http_plane::HttpPlane;
pub use mqtt::MqttError;
pub use multiplexer::Multiplexer;
pub use proxy::ProxyConn;
pub use reporting::{
    ClientReport, HttpReportSink, MqttReportSink, ReportError, ReportSink, Reporter, TunnelReport,
};
pub use session::{validate_client_id, ControlFramed};
pub use state::ServerState;
pub use tcp_plane::{PortAllocator, TcpPlane};
pub use tunnel::{normalize_host, tcp_route, Tunnel, TunnelRecord};
pub use tunnel_registry::TunnelRegistry;
