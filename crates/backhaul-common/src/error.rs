use thiserror::Error;

/// Errors raised while building TLS configuration
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Certificate error: {0}")]
    Certificate(String),
}
