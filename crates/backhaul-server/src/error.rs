use std::time::Duration;

use thiserror::Error;

use backhaul_protocol::CodecError;

/// Errors raised by the registries, control sessions and listeners
///
/// Every connection task returns one of these to its accept loop, which logs it
/// and closes the connection. None of them is fatal to the process.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Malformed or unexpected message on a connection
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// `Auth` message failed validation
    #[error("Authentication failed: {0}")]
    AuthFailure(String),

    /// Route is bound to a different live (or reserved) owner
    #[error("Route {route} is already bound to client {owner}")]
    RouteConflict { route: String, owner: String },

    /// Requested hostname, subdomain or port is not acceptable
    #[error("Invalid route: {0}")]
    InvalidRoute(String),

    /// `RegProxy` for a client with no live control
    #[error("No live control for client {0}")]
    UnknownClient(String),

    /// Control went silent for longer than the heartbeat window
    #[error("No heartbeat from {client_id} for {elapsed:?}")]
    HeartbeatTimeout { client_id: String, elapsed: Duration },

    /// First message did not arrive within the handshake deadline
    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// No proxy connection arrived before the deadline
    #[error("Timed out after {0:?} waiting for a proxy connection")]
    Timeout(Duration),

    /// Control is closing or closed
    #[error("Control session is closed")]
    SessionClosed,

    /// Tunnel exists but its owner is gone
    #[error("Tunnel {0} has no live control")]
    TunnelOffline(String),

    /// TCP port range is fully allocated
    #[error("No TCP ports available")]
    PortsExhausted,

    /// Tunnel journal could not be read or written
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

impl ServerError {
    /// Whether the public request path should answer with a gateway timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, ServerError::Timeout(_))
    }
}
