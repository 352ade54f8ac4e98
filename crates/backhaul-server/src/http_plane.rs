use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, HOST};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use backhaul_protocol::Protocol;

use crate::error::ServerError;
use crate::tunnel_registry::TunnelRegistry;

type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Public HTTP(S) listener routing requests to tunnels by Host header
pub struct HttpPlane {
    tunnels: Arc<TunnelRegistry>,
    /// Optional TLS acceptor for HTTPS mode
    tls_acceptor: Option<TlsAcceptor>,
    proxy_timeout: Duration,
}

impl HttpPlane {
    pub fn new(
        tunnels: Arc<TunnelRegistry>,
        tls_acceptor: Option<TlsAcceptor>,
        proxy_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            tunnels,
            tls_acceptor,
            proxy_timeout,
        })
    }

    fn scheme(&self) -> &'static str {
        if self.tls_acceptor.is_some() {
            "https"
        } else {
            "http"
        }
    }

    /// Serve an HTTP connection on any AsyncRead + AsyncWrite stream
    async fn serve_connection<S>(self: Arc<Self>, stream: S, peer_addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);

        let service = service_fn(move |req| {
            let this = self.clone();
            async move { Ok::<_, hyper::Error>(this.handle_request(req, peer_addr).await) }
        });

        if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
            tracing::debug!("HTTP connection error from {}: {}", peer_addr, e);
        }
    }

    /// Start listening for public HTTP/HTTPS traffic
    pub async fn run(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.run_with_listener(listener).await
    }

    pub async fn run_with_listener(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        tracing::info!(
            "{} plane listening on {}",
            self.scheme().to_uppercase(),
            listener.local_addr()?
        );

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            tracing::debug!("HTTP connection from {}", peer_addr);
            let this = self.clone();

            tokio::spawn(async move {
                if let Some(ref acceptor) = this.tls_acceptor {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            this.serve_connection(tls_stream, peer_addr).await;
                        }
                        Err(e) => {
                            tracing::warn!("TLS handshake failed from {}: {}", peer_addr, e);
                        }
                    }
                } else {
                    this.serve_connection(stream, peer_addr).await;
                }
            });
        }
    }

    async fn handle_request(
        self: Arc<Self>,
        mut req: Request<Incoming>,
        peer_addr: SocketAddr,
    ) -> Response<ProxyBody> {
        let host = req
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string)
            .or_else(|| req.uri().host().map(str::to_string));

        let Some(host) = host else {
            return text_response(StatusCode::BAD_REQUEST, "Missing Host header".to_string());
        };

        tracing::debug!("HTTP request: {} {} (Host: {})", req.method(), req.uri(), host);

        let tunnel = match self.tunnels.lookup_host(&host) {
            Some(tunnel) if tunnel.protocol() == Protocol::Http => tunnel,
            _ => {
                tracing::debug!("No tunnel for host: {}", host);
                return text_response(
                    StatusCode::NOT_FOUND,
                    format!("Tunnel {} not found", host),
                );
            }
        };

        let stream = match tunnel
            .request_proxy(&peer_addr.to_string(), self.proxy_timeout)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(route = %tunnel.route(), "No proxy connection: {}", e);
                return error_response(&e, &host);
            }
        };

        let (mut sender, conn) = match hyper::client::conn::http1::handshake(TokioIo::new(stream)).await {
            Ok(parts) => parts,
            Err(e) => {
                tracing::warn!(route = %tunnel.route(), "Proxy handshake failed: {}", e);
                return text_response(StatusCode::BAD_GATEWAY, format!("Tunnel {} unavailable", host));
            }
        };
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!("Proxied connection error: {}", e);
            }
        });

        let headers = req.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&peer_addr.ip().to_string()) {
            headers.append("x-forwarded-for", value);
        }
        headers.insert("x-forwarded-proto", HeaderValue::from_static(self.scheme()));

        match sender.send_request(req).await {
            Ok(response) => response.map(|body| body.boxed()),
            Err(e) => {
                tracing::warn!(route = %tunnel.route(), "Proxied request failed: {}", e);
                text_response(StatusCode::BAD_GATEWAY, format!("Tunnel {} unavailable", host))
            }
        }
    }
}

fn error_response(err: &ServerError, host: &str) -> Response<ProxyBody> {
    if err.is_timeout() {
        text_response(
            StatusCode::GATEWAY_TIMEOUT,
            format!("Tunnel {} did not respond in time", host),
        )
    } else {
        text_response(StatusCode::BAD_GATEWAY, format!("Tunnel {} unavailable", host))
    }
}

fn text_response(status: StatusCode, body: String) -> Response<ProxyBody> {
    let mut response = Response::new(
        Full::new(Bytes::from(body))
            .map_err(|never| match never {})
            .boxed(),
    );
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert("content-type", HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let timeout = error_response(&ServerError::Timeout(Duration::from_secs(1)), "foo");
        assert_eq!(timeout.status(), StatusCode::GATEWAY_TIMEOUT);

        let offline = error_response(&ServerError::TunnelOffline("foo".into()), "foo");
        assert_eq!(offline.status(), StatusCode::BAD_GATEWAY);

        let closed = error_response(&ServerError::SessionClosed, "foo");
        assert_eq!(closed.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_text_response_body() {
        let response = text_response(StatusCode::NOT_FOUND, "Tunnel x not found".to_string());
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"Tunnel x not found");
    }
}
