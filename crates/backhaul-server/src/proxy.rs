use std::net::SocketAddr;
use std::time::Instant;

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio_util::codec::Encoder;

use backhaul_common::BoxedStream;
use backhaul_protocol::{ClientMessage, ServerMessage, TunnelCodec};

use crate::error::ServerError;

/// A proxy connection offered by a client through `RegProxy`
///
/// Carries no framing after `StartProxy`; from then on it is a raw byte pipe to
/// the client's local service.
pub struct ProxyConn {
    stream: BoxedStream,
    peer_addr: Option<SocketAddr>,
    registered_at: Instant,
}

impl ProxyConn {
    pub fn new(stream: BoxedStream, peer_addr: Option<SocketAddr>) -> Self {
        Self {
            stream,
            peer_addr,
            registered_at: Instant::now(),
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// When the multiplexer handed this connection over
    pub fn registered_at(&self) -> Instant {
        self.registered_at
    }

    /// Tell the client which tunnel and public peer this connection now serves
    pub async fn start(&mut self, url: &str, client_addr: &str) -> Result<(), ServerError> {
        let mut codec = TunnelCodec::<ClientMessage, ServerMessage>::new();
        let mut buf = BytesMut::with_capacity(128);
        codec.encode(
            ServerMessage::StartProxy {
                url: url.to_string(),
                client_addr: client_addr.to_string(),
            },
            &mut buf,
        )?;

        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub fn into_stream(self) -> BoxedStream {
        self.stream
    }
}

impl std::fmt::Debug for ProxyConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConn")
            .field("peer_addr", &self.peer_addr)
            .field("registered_at", &self.registered_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio_util::codec::Decoder;

    #[tokio::test]
    async fn test_start_writes_start_proxy_frame() {
        let (server_side, mut client_side) = tokio::io::duplex(1024);
        let mut conn = ProxyConn::new(Box::new(server_side), None);

        conn.start("http://foo.example.com", "203.0.113.7:5555")
            .await
            .unwrap();

        let mut codec = TunnelCodec::<ServerMessage, ClientMessage>::new();
        let mut buf = BytesMut::new();
        let msg = loop {
            if let Some(msg) = codec.decode(&mut buf).unwrap() {
                break msg;
            }
            let n = client_side.read_buf(&mut buf).await.unwrap();
            assert!(n > 0, "stream closed before a full frame");
        };

        match msg {
            ServerMessage::StartProxy { url, client_addr } => {
                assert_eq!(url, "http://foo.example.com");
                assert_eq!(client_addr, "203.0.113.7:5555");
            }
            other => panic!("Unexpected message: {:?}", other),
        }
    }
}
