//! End-to-end test utilities for the Backhaul tunnel server
//!
//! Runs the real multiplexer and public planes on ephemeral ports and drives them
//! with a protocol-level client, so tests need nothing beyond loopback.

pub mod certificates;
pub mod harness;
pub mod mock_service;
pub mod mock_tcp_service;
pub mod test_client;

pub use certificates::TestCertificates;
pub use harness::{ServerOptions, TestServer};
pub use mock_service::MockHttpService;
pub use mock_tcp_service::{MockTcpService, TcpServiceMode};
pub use test_client::{ClientOptions, TestClient, TunnelSpec};
