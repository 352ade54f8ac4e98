use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;

use backhaul_common::BoxedStream;
use backhaul_protocol::{ClientMessage, TunnelCodec};

use crate::error::ServerError;
use crate::proxy::ProxyConn;
use crate::session::{self, ControlFramed, Hello};
use crate::state::ServerState;

/// Shared tunnel-port listener
///
/// Every connection starts with one framed message: `Auth` turns it into a control
/// session, `RegProxy` hands it to an existing control as a proxy connection.
pub struct Multiplexer {
    state: Arc<ServerState>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl Multiplexer {
    pub fn new(state: Arc<ServerState>, tls_acceptor: Option<TlsAcceptor>) -> Arc<Self> {
        Arc::new(Self {
            state,
            tls_acceptor,
        })
    }

    /// Start listening for tunnel client connections
    pub async fn run(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.run_with_listener(listener).await
    }

    pub async fn run_with_listener(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        tracing::info!(
            tls = self.tls_acceptor.is_some(),
            "Tunnel listener on {}",
            listener.local_addr()?
        );

        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::error!("Tunnel accept error: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            let this = self.clone();

            tokio::spawn(async move {
                match this.handle_connection(stream, peer_addr).await {
                    Ok(()) => {}
                    Err(ServerError::SessionClosed) => {
                        tracing::debug!("Connection from {} closed: control is closing", peer_addr);
                    }
                    Err(e) => {
                        tracing::warn!("Connection error from {}: {}", peer_addr, e);
                    }
                }
            });
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ServerError> {
        tracing::debug!("New tunnel connection from {}", peer_addr);
        let _ = stream.set_nodelay(true);
        let timeout = self.state.session.handshake_timeout;

        let stream: BoxedStream = match &self.tls_acceptor {
            Some(acceptor) => match tokio::time::timeout(timeout, acceptor.accept(stream)).await {
                Ok(Ok(tls_stream)) => Box::new(tls_stream),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Err(ServerError::HandshakeTimeout(timeout)),
            },
            None => Box::new(stream),
        };

        let mut framed: ControlFramed = Framed::new(stream, TunnelCodec::new());
        let first = match tokio::time::timeout(timeout, framed.next()).await {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(e))) => return Err(e.into()),
            Ok(None) => {
                return Err(ServerError::Protocol(
                    "connection closed before the first message".to_string(),
                ))
            }
            Err(_) => return Err(ServerError::HandshakeTimeout(timeout)),
        };

        match first {
            ClientMessage::Auth {
                client_id,
                version,
                user,
            } => {
                let hello = Hello {
                    client_id,
                    version,
                    user,
                };
                session::serve(self.state.clone(), framed, hello, Some(peer_addr)).await
            }
            ClientMessage::RegProxy { client_id } => {
                self.register_proxy(framed, client_id, peer_addr)
            }
            other => Err(ServerError::Protocol(format!(
                "expected Auth or RegProxy, got {:?}",
                other
            ))),
        }
    }

    fn register_proxy(
        &self,
        framed: ControlFramed,
        client_id: String,
        peer_addr: SocketAddr,
    ) -> Result<(), ServerError> {
        let parts = framed.into_parts();
        if !parts.read_buf.is_empty() {
            return Err(ServerError::Protocol(format!(
                "{} unexpected bytes after RegProxy",
                parts.read_buf.len()
            )));
        }

        let control = self
            .state
            .controls
            .get(&client_id)
            .ok_or_else(|| ServerError::UnknownClient(client_id.clone()))?;

        let disposition = control.register_proxy(ProxyConn::new(parts.io, Some(peer_addr)))?;
        tracing::debug!(client_id = %client_id, ?disposition, "Proxy connection registered from {}", peer_addr);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::control_registry::ControlRegistry;
    use crate::tcp_plane::TcpPlane;
    use crate::tunnel_registry::TunnelRegistry;
    use bytes::BytesMut;
    use futures_util::SinkExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_util::codec::Encoder;

    use backhaul_protocol::ServerMessage;

    async fn start() -> (Arc<ServerState>, SocketAddr) {
        let state = ServerState::new(
            ControlRegistry::new(),
            TunnelRegistry::new(1 << 20, Duration::ZERO),
            TcpPlane::new("127.0.0.1".parse().unwrap(), (42000, 42010)),
            "example.com",
            "http",
            SessionConfig {
                handshake_timeout: Duration::from_millis(200),
                ..SessionConfig::default()
            },
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(Multiplexer::new(state.clone(), None).run_with_listener(listener));
        (state, addr)
    }

    async fn expect_closed(mut stream: TcpStream) {
        let mut buf = [0u8; 64];
        let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .expect("connection was not closed");
        // EOF or reset both count as closed
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    #[tokio::test]
    async fn test_unknown_client_proxy_is_closed() {
        let (state, addr) = start().await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(stream, TunnelCodec::<ServerMessage, ClientMessage>::new());
        framed
            .send(ClientMessage::RegProxy {
                client_id: "zz:zz:zz".to_string(),
            })
            .await
            .unwrap();

        expect_closed(framed.into_inner()).await;
        assert!(state.controls.is_empty());
        assert!(state.tunnels.is_empty());
    }

    #[tokio::test]
    async fn test_silent_connection_times_out() {
        let (state, addr) = start().await;
        let stream = TcpStream::connect(addr).await.unwrap();
        expect_closed(stream).await;
        assert!(state.controls.is_empty());
    }

    #[tokio::test]
    async fn test_garbage_first_frame_is_closed() {
        let (state, addr) = start().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&[0, 0, 0, 5, b'h', b'e', b'l', b'l', b'o']).await.unwrap();
        expect_closed(stream).await;
        assert!(state.controls.is_empty());
    }

    #[tokio::test]
    async fn test_bytes_after_reg_proxy_rejected() {
        let (state, addr) = start().await;

        // A live control for the client
        let control_stream = TcpStream::connect(addr).await.unwrap();
        let mut control = Framed::new(control_stream, TunnelCodec::<ServerMessage, ClientMessage>::new());
        control
            .send(ClientMessage::Auth {
                client_id: "aa:bb:cc".to_string(),
                version: String::new(),
                user: None,
            })
            .await
            .unwrap();
        assert!(matches!(
            control.next().await.unwrap().unwrap(),
            ServerMessage::AuthResp { error: None, .. }
        ));

        let mut codec = TunnelCodec::<ServerMessage, ClientMessage>::new();
        let mut buf = BytesMut::new();
        codec
            .encode(
                ClientMessage::RegProxy {
                    client_id: "aa:bb:cc".to_string(),
                },
                &mut buf,
            )
            .unwrap();
        buf.extend_from_slice(b"GET / HTTP/1.1\r\n");

        let mut proxy = TcpStream::connect(addr).await.unwrap();
        proxy.write_all(&buf).await.unwrap();
        expect_closed(proxy).await;

        let control = state.controls.get("aa:bb:cc").unwrap();
        assert_eq!(control.idle_proxies(), 0);
        assert!(control.is_active());
    }
}
