use serde::{Deserialize, Serialize};

/// Public protocol a tunnel is exposed on
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Routed by Host header on the shared HTTP/HTTPS listeners
    Http,
    /// Raw TCP on a dedicated public port
    Tcp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Http => f.write_str("http"),
            Protocol::Tcp => f.write_str("tcp"),
        }
    }
}

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First message on a control connection
    Auth {
        /// Stable client identity (e.g. a MAC address)
        client_id: String,
        /// Client software version
        #[serde(default)]
        version: String,
        /// Optional user name
        #[serde(default)]
        user: Option<String>,
    },

    /// First message on a proxy connection
    RegProxy {
        /// Identity of the control this proxy belongs to
        client_id: String,
    },

    /// Request a new public route
    ReqTunnel {
        /// Correlates the `NewTunnel` reply
        req_id: String,
        /// Public protocol
        protocol: Protocol,
        /// Full hostname (HTTP only)
        #[serde(default)]
        hostname: Option<String>,
        /// Subdomain under the server domain (HTTP only)
        #[serde(default)]
        subdomain: Option<String>,
        /// Requested public port (TCP only, 0 or None = allocate)
        #[serde(default)]
        remote_port: Option<u16>,
        /// Client-side target the route forwards to, for display and reporting
        local_addr: String,
    },

    /// Release a previously registered tunnel
    UnregTunnel {
        /// URL returned in `NewTunnel`
        url: String,
    },

    /// Keepalive
    Ping,
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Reply to `Auth`
    AuthResp {
        /// Echo of the accepted identity
        client_id: String,
        /// Set when authentication failed
        #[serde(default)]
        error: Option<String>,
    },

    /// Reply to `ReqTunnel`
    NewTunnel {
        /// Echo of the request id
        req_id: String,
        /// Public URL (empty on error)
        url: String,
        /// Public protocol
        protocol: Protocol,
        /// Set when the tunnel was refused
        #[serde(default)]
        error: Option<String>,
    },

    /// Ask the client to open one more proxy connection
    ReqProxy,

    /// Sent on a proxy connection right before relaying a public connection
    StartProxy {
        /// Tunnel URL the public connection arrived on
        url: String,
        /// Public peer address
        client_addr: String,
    },

    /// Keepalive reply
    Pong,
}

impl ServerMessage {
    /// Build a `NewTunnel` refusal
    pub fn tunnel_refused(req_id: String, protocol: Protocol, reason: impl Into<String>) -> Self {
        ServerMessage::NewTunnel {
            req_id,
            url: String::new(),
            protocol,
            error: Some(reason.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_wire_shape() {
        let msg = ClientMessage::RegProxy {
            client_id: "aa:bb:cc".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"reg_proxy","client_id":"aa:bb:cc"}"#);
    }

    #[test]
    fn test_auth_optional_fields_default() {
        let parsed: ClientMessage =
            serde_json::from_str(r#"{"type":"auth","client_id":"11:22:33:44:55:66"}"#).unwrap();

        match parsed {
            ClientMessage::Auth {
                client_id,
                version,
                user,
            } => {
                assert_eq!(client_id, "11:22:33:44:55:66");
                assert!(version.is_empty());
                assert!(user.is_none());
            }
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_req_tunnel_parses_tcp() {
        let parsed: ClientMessage = serde_json::from_str(
            r#"{"type":"req_tunnel","req_id":"r1","protocol":"tcp","remote_port":31000,"local_addr":"127.0.0.1:22"}"#,
        )
        .unwrap();

        match parsed {
            ClientMessage::ReqTunnel {
                protocol,
                remote_port,
                hostname,
                ..
            } => {
                assert_eq!(protocol, Protocol::Tcp);
                assert_eq!(remote_port, Some(31000));
                assert!(hostname.is_none());
            }
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_tunnel_refused() {
        let msg = ServerMessage::tunnel_refused("r1".into(), Protocol::Http, "taken");
        match msg {
            ServerMessage::NewTunnel { url, error, .. } => {
                assert!(url.is_empty());
                assert_eq!(error.as_deref(), Some("taken"));
            }
            _ => panic!("Wrong variant"),
        }
    }
}
