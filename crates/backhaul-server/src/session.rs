//! Control connection driver
//!
//! Runs one authenticated control session from registration to teardown: a writer
//! task drains the control's outbound queue, and the reader loop handles client
//! messages and the maintenance tick.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use uuid::Uuid;

use backhaul_common::BoxedStream;
use backhaul_protocol::{ClientMessage, Protocol, ServerMessage, TunnelCodec};

use crate::control::Control;
use crate::error::ServerError;
use crate::state::ServerState;
use crate::tunnel::{is_valid_hostname, is_valid_subdomain, tcp_route, Tunnel, TunnelRecord};

/// Server side of a control connection
pub type ControlFramed = Framed<BoxedStream, TunnelCodec<ClientMessage, ServerMessage>>;

const MAX_CLIENT_ID_LEN: usize = 128;

/// Attempts at picking an unused random subdomain
const RANDOM_SUBDOMAIN_ATTEMPTS: usize = 8;

/// Identity presented in `Auth`
#[derive(Debug, Clone)]
pub struct Hello {
    pub client_id: String,
    pub version: String,
    pub user: Option<String>,
}

/// A tunnel request as received in `ReqTunnel`
#[derive(Debug, Clone)]
pub struct TunnelRequest {
    pub req_id: String,
    pub protocol: Protocol,
    pub hostname: Option<String>,
    pub subdomain: Option<String>,
    pub remote_port: Option<u16>,
    pub local_addr: String,
}

pub fn validate_client_id(client_id: &str) -> Result<(), ServerError> {
    if client_id.is_empty() {
        return Err(ServerError::AuthFailure("empty client id".to_string()));
    }
    if client_id.len() > MAX_CLIENT_ID_LEN {
        return Err(ServerError::AuthFailure(format!(
            "client id longer than {} bytes",
            MAX_CLIENT_ID_LEN
        )));
    }
    if !client_id
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b':' | b'-' | b'_' | b'.'))
    {
        return Err(ServerError::AuthFailure(format!(
            "client id {:?} contains illegal characters",
            client_id
        )));
    }
    Ok(())
}

/// Serve an authenticated control connection until it ends
pub async fn serve(
    state: Arc<ServerState>,
    mut framed: ControlFramed,
    hello: Hello,
    peer_addr: Option<SocketAddr>,
) -> Result<(), ServerError> {
    if let Err(e) = validate_client_id(&hello.client_id) {
        let _ = framed
            .send(ServerMessage::AuthResp {
                client_id: hello.client_id,
                error: Some(e.to_string()),
            })
            .await;
        return Err(e);
    }

    let (control, outbound) = Control::new(
        hello.client_id.clone(),
        hello.version,
        peer_addr,
        state.session.clone(),
    );
    let (sink, stream) = framed.split();
    let writer = tokio::spawn(write_loop(control.clone(), sink, outbound));

    state.controls.add(control.clone());
    tracing::info!(
        client_id = %control.client_id(),
        user = ?hello.user,
        version = %control.version(),
        "Client authenticated from {:?}",
        peer_addr
    );

    control.send(ServerMessage::AuthResp {
        client_id: hello.client_id,
        error: None,
    });
    // Warm one proxy for the first public request
    control.send(ServerMessage::ReqProxy);

    let result = read_loop(&state, &control, stream).await;

    teardown(&state, &control);
    writer.abort();
    result
}

async fn write_loop(
    control: Arc<Control>,
    mut sink: SplitSink<ControlFramed, ServerMessage>,
    mut outbound: mpsc::Receiver<ServerMessage>,
) {
    loop {
        tokio::select! {
            _ = control.cancelled() => break,
            msg = outbound.recv() => match msg {
                Some(msg) => {
                    if let Err(e) = sink.send(msg).await {
                        tracing::debug!(client_id = %control.client_id(), "Control write failed: {}", e);
                        control.shutdown("write failed");
                        break;
                    }
                }
                None => break,
            }
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(
    state: &ServerState,
    control: &Arc<Control>,
    mut stream: SplitStream<ControlFramed>,
) -> Result<(), ServerError> {
    let tick = (control.config().heartbeat_timeout / 4)
        .clamp(Duration::from_millis(10), Duration::from_secs(5));
    let mut maintenance = tokio::time::interval(tick);
    maintenance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = control.cancelled() => return Ok(()),
            _ = maintenance.tick() => {
                if let Some(elapsed) = control.heartbeat_expired() {
                    return Err(ServerError::HeartbeatTimeout {
                        client_id: control.client_id().to_string(),
                        elapsed,
                    });
                }
                let reaped = control.reap_proxies();
                if reaped > 0 {
                    tracing::debug!(client_id = %control.client_id(), reaped, "Dropped idle proxies");
                }
            }
            frame = stream.next() => {
                let msg = match frame {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        tracing::info!(client_id = %control.client_id(), "Client disconnected");
                        return Ok(());
                    }
                };
                control.touch();
                handle_message(state, control, msg).await?;
            }
        }
    }
}

async fn handle_message(
    state: &ServerState,
    control: &Arc<Control>,
    msg: ClientMessage,
) -> Result<(), ServerError> {
    match msg {
        ClientMessage::ReqTunnel {
            req_id,
            protocol,
            hostname,
            subdomain,
            remote_port,
            local_addr,
        } => {
            let request = TunnelRequest {
                req_id,
                protocol,
                hostname,
                subdomain,
                remote_port,
                local_addr,
            };
            let reply = match open_tunnel(state, control, &request).await {
                Ok(tunnel) => {
                    tracing::info!(
                        client_id = %control.client_id(),
                        route = %tunnel.route(),
                        "Tunnel established: {} -> {}",
                        tunnel.url(),
                        tunnel.local_addr()
                    );
                    ServerMessage::NewTunnel {
                        req_id: request.req_id,
                        url: tunnel.url().to_string(),
                        protocol: request.protocol,
                        error: None,
                    }
                }
                Err(e) => {
                    tracing::warn!(client_id = %control.client_id(), "Tunnel request refused: {}", e);
                    ServerMessage::tunnel_refused(request.req_id, request.protocol, e.to_string())
                }
            };
            control.send_async(reply).await;
        }
        ClientMessage::UnregTunnel { url } => match control.take_tunnel(&url) {
            Some(tunnel) => {
                state.tunnels.release(&tunnel);
                tunnel.close();
                tracing::info!(client_id = %control.client_id(), route = %tunnel.route(), "Tunnel released");
            }
            None => {
                tracing::debug!(client_id = %control.client_id(), "UnregTunnel for unknown url {}", url);
            }
        },
        ClientMessage::Ping => {
            control.send(ServerMessage::Pong);
        }
        ClientMessage::Auth { .. } | ClientMessage::RegProxy { .. } => {
            return Err(ServerError::Protocol(
                "handshake message on an established control connection".to_string(),
            ));
        }
    }
    Ok(())
}

/// Resolve, register and attach the tunnel described by `request`
pub async fn open_tunnel(
    state: &ServerState,
    control: &Arc<Control>,
    request: &TunnelRequest,
) -> Result<Arc<Tunnel>, ServerError> {
    match request.protocol {
        Protocol::Http => {
            let route = http_route(state, control.client_id(), request)?;
            let tunnel = Tunnel::new(
                TunnelRecord {
                    url: format!("{}://{}", state.http_scheme, route),
                    route,
                    client_id: control.client_id().to_string(),
                    protocol: Protocol::Http,
                    local_addr: request.local_addr.clone(),
                    remote_port: None,
                    created_at: Utc::now(),
                },
                control,
            );
            state.tunnels.add(tunnel.clone())?;
            attach(state, control, &tunnel)?;
            Ok(tunnel)
        }
        Protocol::Tcp => {
            let client_id = control.client_id().to_string();
            let (listener, port) = state
                .tcp_plane
                .bind(request.remote_port, |port| {
                    state.tunnels.is_available(&tcp_route(port), &client_id)
                })
                .await?;

            let tunnel = Tunnel::new(
                TunnelRecord {
                    route: tcp_route(port),
                    client_id,
                    protocol: Protocol::Tcp,
                    url: format!("tcp://{}:{}", state.domain, port),
                    local_addr: request.local_addr.clone(),
                    remote_port: Some(port),
                    created_at: Utc::now(),
                },
                control,
            );

            let registered = state
                .tunnels
                .add(tunnel.clone())
                .and_then(|()| attach(state, control, &tunnel));
            if let Err(e) = registered {
                state.tcp_plane.ports().release(port);
                return Err(e);
            }

            state
                .tcp_plane
                .serve(listener, port, tunnel.clone(), state.session.proxy_timeout);
            Ok(tunnel)
        }
    }
}

fn http_route(
    state: &ServerState,
    client_id: &str,
    request: &TunnelRequest,
) -> Result<String, ServerError> {
    if let Some(hostname) = request.hostname.as_deref().filter(|h| !h.is_empty()) {
        let hostname = hostname.trim_end_matches('.').to_ascii_lowercase();
        if !is_valid_hostname(&hostname) {
            return Err(ServerError::InvalidRoute(format!(
                "invalid hostname {:?}",
                hostname
            )));
        }
        return Ok(hostname);
    }

    if let Some(subdomain) = request.subdomain.as_deref().filter(|s| !s.is_empty()) {
        let subdomain = subdomain.to_ascii_lowercase();
        if !is_valid_subdomain(&subdomain) {
            return Err(ServerError::InvalidRoute(format!(
                "invalid subdomain {:?}",
                subdomain
            )));
        }
        return Ok(format!("{}.{}", subdomain, state.domain));
    }

    for _ in 0..RANDOM_SUBDOMAIN_ATTEMPTS {
        let route = format!("{}.{}", random_subdomain(), state.domain);
        if state.tunnels.is_available(&route, client_id) {
            return Ok(route);
        }
    }
    Err(ServerError::InvalidRoute(
        "could not pick an unused subdomain".to_string(),
    ))
}

/// Random 8-character subdomain that starts with a letter
fn random_subdomain() -> String {
    let id = Uuid::new_v4().simple().to_string();
    let mut chars = id.chars();
    let prefix = match chars.next() {
        // Map 0-9 to a-j
        Some(c) if c.is_ascii_digit() => char::from(b'a' + (c as u8 - b'0')),
        Some(c) => c,
        None => 'a',
    };
    std::iter::once(prefix).chain(chars.take(7)).collect()
}

/// Hand a registered tunnel to its control, undoing the registration if the
/// control started closing in the meantime
fn attach(state: &ServerState, control: &Control, tunnel: &Arc<Tunnel>) -> Result<(), ServerError> {
    if control.adopt_tunnel(tunnel.clone()) {
        return Ok(());
    }
    state.tunnels.release(tunnel);
    tunnel.close();
    Err(ServerError::SessionClosed)
}

fn teardown(state: &ServerState, control: &Arc<Control>) {
    control.shutdown("session ended");

    let tunnels = control.take_tunnels();
    for tunnel in &tunnels {
        state.tunnels.release(tunnel);
        tunnel.close();
    }
    let deregistered = state.controls.remove(control);
    control.mark_closed();

    tracing::info!(
        client_id = %control.client_id(),
        control = control.id(),
        tunnels = tunnels.len(),
        deregistered,
        "Control session closed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::control_registry::ControlRegistry;
    use crate::tcp_plane::TcpPlane;
    use crate::tunnel_registry::TunnelRegistry;
    use tokio::io::DuplexStream;

    type ClientFramed = Framed<DuplexStream, TunnelCodec<ServerMessage, ClientMessage>>;

    fn test_state(session: SessionConfig) -> Arc<ServerState> {
        ServerState::new(
            ControlRegistry::new(),
            TunnelRegistry::new(1 << 20, Duration::ZERO),
            TcpPlane::new("127.0.0.1".parse().unwrap(), (41000, 41100)),
            "example.com",
            "http",
            session,
        )
    }

    fn start(
        state: &Arc<ServerState>,
        client_id: &str,
    ) -> (ClientFramed, tokio::task::JoinHandle<Result<(), ServerError>>) {
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let io: BoxedStream = Box::new(server_io);
        let framed: ControlFramed = Framed::new(io, TunnelCodec::new());
        let hello = Hello {
            client_id: client_id.to_string(),
            version: "test".to_string(),
            user: None,
        };
        let task = tokio::spawn(serve(state.clone(), framed, hello, None));
        (Framed::new(client_io, TunnelCodec::new()), task)
    }

    async fn next(client: &mut ClientFramed) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for server message")
            .expect("connection closed")
            .expect("decode error")
    }

    async fn next_skipping_req_proxy(client: &mut ClientFramed) -> ServerMessage {
        loop {
            match next(client).await {
                ServerMessage::ReqProxy => continue,
                other => return other,
            }
        }
    }

    fn http_request(req_id: &str, subdomain: Option<&str>, hostname: Option<&str>) -> ClientMessage {
        ClientMessage::ReqTunnel {
            req_id: req_id.to_string(),
            protocol: Protocol::Http,
            hostname: hostname.map(str::to_string),
            subdomain: subdomain.map(str::to_string),
            remote_port: None,
            local_addr: "127.0.0.1:3000".to_string(),
        }
    }

    #[test]
    fn test_client_id_validation() {
        assert!(validate_client_id("aa:bb:cc").is_ok());
        assert!(validate_client_id("host-1.lan_eth0").is_ok());
        assert!(validate_client_id("").is_err());
        assert!(validate_client_id("has space").is_err());
        assert!(validate_client_id(&"a".repeat(129)).is_err());
    }

    #[test]
    fn test_random_subdomain_shape() {
        for _ in 0..50 {
            let sub = random_subdomain();
            assert_eq!(sub.len(), 8);
            assert!(sub.as_bytes()[0].is_ascii_alphabetic());
            assert!(is_valid_subdomain(&sub));
        }
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let state = test_state(SessionConfig::default());
        let (mut client, task) = start(&state, "aa:bb:cc");

        match next(&mut client).await {
            ServerMessage::AuthResp { client_id, error } => {
                assert_eq!(client_id, "aa:bb:cc");
                assert!(error.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(next(&mut client).await, ServerMessage::ReqProxy));
        assert!(state.controls.get("aa:bb:cc").is_some());

        client
            .send(http_request("1", Some("Foo"), None))
            .await
            .unwrap();
        match next_skipping_req_proxy(&mut client).await {
            ServerMessage::NewTunnel { req_id, url, error, .. } => {
                assert_eq!(req_id, "1");
                assert_eq!(url, "http://foo.example.com");
                assert!(error.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(state.tunnels.lookup_host("foo.example.com").is_some());

        client.send(ClientMessage::Ping).await.unwrap();
        assert!(matches!(
            next_skipping_req_proxy(&mut client).await,
            ServerMessage::Pong
        ));

        client
            .send(ClientMessage::UnregTunnel {
                url: "http://foo.example.com".to_string(),
            })
            .await
            .unwrap();
        client.send(ClientMessage::Ping).await.unwrap();
        next_skipping_req_proxy(&mut client).await;
        assert!(state.tunnels.lookup_host("foo.example.com").is_none());

        client
            .send(http_request("2", None, Some("bar.example.org")))
            .await
            .unwrap();
        next_skipping_req_proxy(&mut client).await;
        assert!(state.tunnels.get("bar.example.org").is_some());

        drop(client);
        task.await.unwrap().unwrap();

        assert!(state.controls.is_empty());
        assert!(state.tunnels.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_subdomain_refused() {
        let state = test_state(SessionConfig::default());
        let (mut client, _task) = start(&state, "aa:bb:cc");
        next(&mut client).await;

        client
            .send(http_request("1", Some("-bad-"), None))
            .await
            .unwrap();
        match next_skipping_req_proxy(&mut client).await {
            ServerMessage::NewTunnel { url, error, .. } => {
                assert!(url.is_empty());
                assert!(error.unwrap().contains("invalid subdomain"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(state.tunnels.is_empty());
    }

    #[tokio::test]
    async fn test_route_conflict_between_clients() {
        let state = test_state(SessionConfig::default());
        let (mut first, _t1) = start(&state, "aa:aa:aa");
        let (mut second, _t2) = start(&state, "bb:bb:bb");
        next(&mut first).await;
        next(&mut second).await;

        first.send(http_request("1", Some("foo"), None)).await.unwrap();
        next_skipping_req_proxy(&mut first).await;

        second.send(http_request("1", Some("foo"), None)).await.unwrap();
        match next_skipping_req_proxy(&mut second).await {
            ServerMessage::NewTunnel { error, .. } => {
                assert!(error.unwrap().contains("aa:aa:aa"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            state.tunnels.get("foo.example.com").unwrap().client_id(),
            "aa:aa:aa"
        );
    }

    #[tokio::test]
    async fn test_rejected_auth_gets_error_reply() {
        let state = test_state(SessionConfig::default());
        let (mut client, task) = start(&state, "bad id");

        match next(&mut client).await {
            ServerMessage::AuthResp { error, .. } => assert!(error.is_some()),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            task.await.unwrap(),
            Err(ServerError::AuthFailure(_))
        ));
        assert!(state.controls.is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_timeout_tears_down() {
        let state = test_state(SessionConfig {
            heartbeat_timeout: Duration::from_millis(100),
            ..SessionConfig::default()
        });
        let (mut client, task) = start(&state, "aa:bb:cc");
        next(&mut client).await;
        client.send(http_request("1", Some("foo"), None)).await.unwrap();
        next_skipping_req_proxy(&mut client).await;

        // Stay silent
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(ServerError::HeartbeatTimeout { .. })));
        assert!(state.controls.get("aa:bb:cc").is_none());
        assert!(state.tunnels.lookup_host("foo.example.com").is_none());
    }

    #[tokio::test]
    async fn test_tcp_tunnel_gets_port_from_range() {
        let state = test_state(SessionConfig::default());
        let (mut client, _task) = start(&state, "aa:bb:cc");
        next(&mut client).await;

        client
            .send(ClientMessage::ReqTunnel {
                req_id: "t".to_string(),
                protocol: Protocol::Tcp,
                hostname: None,
                subdomain: None,
                remote_port: None,
                local_addr: "127.0.0.1:22".to_string(),
            })
            .await
            .unwrap();

        match next_skipping_req_proxy(&mut client).await {
            ServerMessage::NewTunnel { url, error, protocol, .. } => {
                assert!(error.is_none(), "refused: {:?}", error);
                assert_eq!(protocol, Protocol::Tcp);
                let port: u16 = url.rsplit(':').next().unwrap().parse().unwrap();
                assert!((41000..=41100).contains(&port));
                assert_eq!(url, format!("tcp://example.com:{}", port));
                assert!(state.tunnels.get(&tcp_route(port)).is_some());
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
