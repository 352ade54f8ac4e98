use tokio::io::{AsyncRead, AsyncWrite};

/// Any bidirectional byte stream a tunnel connection can run over
///
/// Implemented for plain TCP, TLS and in-memory duplex streams alike.
pub trait TunnelStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> TunnelStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Type-erased tunnel stream
pub type BoxedStream = Box<dyn TunnelStream>;
