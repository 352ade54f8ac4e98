//! Mock TCP service standing in for a client-side raw TCP application

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Behavior of each accepted connection
#[derive(Clone, Debug)]
pub enum TcpServiceMode {
    /// Write back everything read until EOF
    Echo,
    /// Read once, answer with the given bytes, close
    FixedResponse(Vec<u8>),
}

/// Local TCP service on an ephemeral port
pub struct MockTcpService {
    addr: SocketAddr,
    /// Bytes received per finished connection
    received: Arc<Mutex<Vec<Vec<u8>>>>,
    shutdown: CancellationToken,
}

impl MockTcpService {
    /// Start in echo mode
    pub async fn start() -> Self {
        Self::start_with_mode(TcpServiceMode::Echo).await
    }

    pub async fn start_with_mode(mode: TcpServiceMode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock TCP service");
        let addr = listener.local_addr().expect("mock TCP service has no address");

        let received = Arc::new(Mutex::new(Vec::new()));
        let shutdown = CancellationToken::new();

        let accept_received = received.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let stream = tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => stream,
                        Err(e) => {
                            tracing::error!("Mock TCP accept error: {}", e);
                            break;
                        }
                    },
                };
                let received = accept_received.clone();
                let mode = mode.clone();
                tokio::spawn(async move {
                    let data = serve(stream, mode).await;
                    received.lock().push(data);
                });
            }
        });

        Self {
            addr,
            received,
            shutdown,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn addr_string(&self) -> String {
        self.addr.to_string()
    }

    /// Number of connections that have run to completion
    pub fn connection_count(&self) -> usize {
        self.received.lock().len()
    }

    pub fn total_bytes_received(&self) -> usize {
        self.received.lock().iter().map(Vec::len).sum()
    }
}

impl Drop for MockTcpService {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn serve(mut stream: TcpStream, mode: TcpServiceMode) -> Vec<u8> {
    let mut received = Vec::new();
    let mut buf = [0u8; 4096];

    match mode {
        TcpServiceMode::Echo => loop {
            match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    received.extend_from_slice(&buf[..n]);
                    if stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        },
        TcpServiceMode::FixedResponse(response) => {
            if let Ok(n) = stream.read(&mut buf).await {
                received.extend_from_slice(&buf[..n]);
            }
            let _ = stream.write_all(&response).await;
            let _ = stream.shutdown().await;
        }
    }

    received
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_tcp_echo() {
        let service = MockTcpService::start().await;

        let mut stream = TcpStream::connect(service.addr()).await.unwrap();
        stream.write_all(b"Hello, TCP!").await.unwrap();

        let mut buf = [0u8; 32];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"Hello, TCP!");

        drop(stream);
        for _ in 0..50 {
            if service.connection_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(service.connection_count(), 1);
        assert_eq!(service.total_bytes_received(), 11);
    }

    #[tokio::test]
    async fn test_tcp_fixed_response() {
        let service =
            MockTcpService::start_with_mode(TcpServiceMode::FixedResponse(b"PONG".to_vec())).await;

        let mut stream = TcpStream::connect(service.addr()).await.unwrap();
        stream.write_all(b"PING").await.unwrap();

        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"PONG");
    }
}
