//! Server configuration with environment variable priority
//!
//! Configuration is resolved in this order (first found wins):
//! 1. Environment variables (BACKHAUL_*)
//! 2. Config file (server.toml)
//! 3. Default values

use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Environment variable prefix
const ENV_PREFIX: &str = "BACKHAUL";

/// Default registry weight budget
pub const DEFAULT_REGISTRY_CAPACITY: usize = 1024 * 1024;

/// Server configuration (parsed from TOML, can be overridden by env)
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Shared listener for control and proxy connections
    pub tunnel_addr: Option<String>,

    /// Public HTTP listener; an empty string disables it
    pub http_addr: Option<String>,

    /// Public HTTPS listener (requires TLS material)
    pub https_addr: Option<String>,

    /// Base domain for generated subdomains and TCP URLs
    pub domain: Option<String>,

    /// Certificate PEM file for the tunnel and HTTPS listeners
    pub tls_cert: Option<String>,

    /// Private key PEM file for the tunnel and HTTPS listeners
    pub tls_key: Option<String>,

    /// Log sink: "stdout", "none", or a file path
    pub log: Option<String>,

    pub log_level: Option<String>,

    /// TCP port range for TCP tunnels
    pub tcp_port_range: Option<(u16, u16)>,

    pub registry: RegistrySection,
    pub session: SessionSection,
    pub reporting: ReportingSection,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct RegistrySection {
    /// Journal file; tunnels are kept in memory only when unset
    pub cache_file: Option<String>,
    pub capacity_bytes: Option<usize>,
    pub restore_grace_secs: Option<u64>,
    pub flush_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct SessionSection {
    pub handshake_timeout_secs: Option<u64>,
    pub heartbeat_timeout_secs: Option<u64>,
    pub proxy_timeout_secs: Option<u64>,
    pub proxy_pool_size: Option<usize>,
    pub proxy_idle_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ReportingSection {
    pub enabled: Option<bool>,
    /// HTTP endpoint receiving JSON snapshots
    pub url: Option<String>,
    pub interval_secs: Option<u64>,
    /// MQTT broker, `tcp://host:port` or `host[:port]`
    pub mqtt_broker: Option<String>,
    pub mqtt_topic: Option<String>,
    pub mqtt_client_id: Option<String>,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
}

/// Timeouts and limits applied to every control session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Deadline for the first message on a new connection
    pub handshake_timeout: Duration,
    /// Session closes when no frame arrives for this long
    pub heartbeat_timeout: Duration,
    /// How long a public request waits for a proxy connection
    pub proxy_timeout: Duration,
    /// Maximum parked proxy connections per control
    pub proxy_pool_size: usize,
    /// Parked proxies older than this are dropped
    pub proxy_idle_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
            proxy_timeout: Duration::from_secs(15),
            proxy_pool_size: 10,
            proxy_idle_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub capacity_bytes: usize,
    pub cache_file: Option<PathBuf>,
    /// Restored entries keep their route reserved for this long after startup
    pub restore_grace: Duration,
    pub flush_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: DEFAULT_REGISTRY_CAPACITY,
            cache_file: None,
            restore_grace: Duration::from_secs(300),
            flush_interval: Duration::from_secs(10),
        }
    }
}

/// Default MQTT topic for client reports
pub const DEFAULT_MQTT_TOPIC: &str = "backhaul/clients";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttConfig {
    /// `host:port`
    pub broker: String,
    pub topic: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Enabled reporting; at least one destination is set
#[derive(Debug, Clone)]
pub struct ReportingConfig {
    pub url: Option<String>,
    pub mqtt: Option<MqttConfig>,
    pub interval: Duration,
}

/// Where log output goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSink {
    Stdout,
    None,
    File(PathBuf),
}

impl LogSink {
    fn parse(value: &str) -> Self {
        match value {
            "" | "stdout" => LogSink::Stdout,
            "none" | "false" => LogSink::None,
            path => LogSink::File(PathBuf::from(path)),
        }
    }
}

/// Resolved server configuration
#[derive(Debug)]
pub struct ResolvedServerConfig {
    pub tunnel_addr: SocketAddr,
    pub http_addr: Option<SocketAddr>,
    pub https_addr: Option<SocketAddr>,
    pub domain: String,
    /// (cert, key) PEM paths
    pub tls: Option<(PathBuf, PathBuf)>,
    pub log: LogSink,
    pub log_level: String,
    pub tcp_port_range: (u16, u16),
    pub registry: RegistryConfig,
    pub session: SessionConfig,
    /// `None` when reporting is disabled
    pub reporting: Option<ReportingConfig>,
}

impl ResolvedServerConfig {
    /// Scheme used in URLs handed back for HTTP tunnels
    pub fn http_scheme(&self) -> &'static str {
        if self.http_addr.is_none() && self.https_addr.is_some() {
            "https"
        } else {
            "http"
        }
    }
}

/// Lookup function for environment overrides (swapped out in tests)
type EnvLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

fn process_env(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn parse_addr(name: &str, value: &str) -> anyhow::Result<SocketAddr> {
    value
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid {} '{}': {}", name, value, e))
}

/// Normalize `tcp://host:port`, `mqtt://host` or `host[:port]` to `host:port`
fn parse_broker(value: &str) -> anyhow::Result<String> {
    let value = value.trim();
    let host = match value.split_once("://") {
        Some(("tcp" | "mqtt", rest)) => rest,
        Some((scheme, _)) => {
            return Err(anyhow::anyhow!(
                "Unsupported MQTT broker scheme '{}' in '{}'",
                scheme,
                value
            ))
        }
        None => value,
    };
    let host = host.trim_end_matches('/');
    if host.is_empty() {
        return Err(anyhow::anyhow!("Empty MQTT broker address"));
    }

    let has_port = host
        .rsplit_once(':')
        .map_or(false, |(_, port)| port.parse::<u16>().is_ok());
    if has_port {
        Ok(host.to_string())
    } else {
        Ok(format!("{}:1883", host))
    }
}

fn parse_optional_addr(name: &str, value: Option<String>) -> anyhow::Result<Option<SocketAddr>> {
    match value {
        Some(v) if !v.trim().is_empty() => parse_addr(name, v.trim()).map(Some),
        _ => Ok(None),
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file (optional)
    pub fn load(path: &str) -> anyhow::Result<Self> {
        if !Path::new(path).exists() {
            tracing::info!("No config file at {}, using environment and defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path, e))?;
        let config =
            toml::from_str(&content).map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path, e))?;
        tracing::info!("Loaded config from {}", path);
        Ok(config)
    }

    /// Resolve configuration from environment variables first, then config file
    pub fn resolve(self) -> anyhow::Result<ResolvedServerConfig> {
        self.resolve_with(&process_env)
    }

    fn resolve_with(self, lookup: EnvLookup<'_>) -> anyhow::Result<ResolvedServerConfig> {
        let get_env = |name: &str| lookup(&format!("{}_{}", ENV_PREFIX, name));
        let get_env_u16 = |name: &str| get_env(name).and_then(|v| v.parse::<u16>().ok());

        // Tunnel listener: ENV > config > default 0.0.0.0:4443
        let tunnel_addr = get_env("TUNNEL_ADDR")
            .or(self.tunnel_addr)
            .unwrap_or_else(|| "0.0.0.0:4443".to_string());
        let tunnel_addr = parse_addr("tunnel_addr", &tunnel_addr)?;

        // HTTP listener: ENV > config > default 0.0.0.0:8080, empty disables
        let http_addr = get_env("HTTP_ADDR")
            .or(self.http_addr)
            .or_else(|| Some("0.0.0.0:8080".to_string()));
        let http_addr = parse_optional_addr("http_addr", http_addr)?;

        let https_addr = parse_optional_addr("https_addr", get_env("HTTPS_ADDR").or(self.https_addr))?;

        let domain = get_env("DOMAIN")
            .or(self.domain)
            .unwrap_or_else(|| "localhost".to_string())
            .trim_end_matches('.')
            .to_ascii_lowercase();

        let tls_cert = get_env("TLS_CERT").or(self.tls_cert);
        let tls_key = get_env("TLS_KEY").or(self.tls_key);
        let tls = match (tls_cert, tls_key) {
            (Some(cert), Some(key)) => Some((PathBuf::from(cert), PathBuf::from(key))),
            (None, None) => None,
            _ => anyhow::bail!("Both tls_cert and tls_key must be set to enable TLS"),
        };

        if https_addr.is_some() && tls.is_none() {
            anyhow::bail!(
                "HTTPS listener requires TLS material. Set BACKHAUL_TLS_CERT and BACKHAUL_TLS_KEY or tls_cert/tls_key in config"
            );
        }

        let log = LogSink::parse(&get_env("LOG").or(self.log).unwrap_or_default());
        let log_level = get_env("LOG_LEVEL")
            .or(self.log_level)
            .unwrap_or_else(|| "info".to_string());

        // TCP port range: ENV > config > default 30000-40000
        let tcp_port_start = get_env_u16("TCP_PORT_START")
            .or(self.tcp_port_range.map(|r| r.0))
            .unwrap_or(30000);
        let tcp_port_end = get_env_u16("TCP_PORT_END")
            .or(self.tcp_port_range.map(|r| r.1))
            .unwrap_or(40000);
        if tcp_port_start > tcp_port_end {
            anyhow::bail!(
                "Invalid TCP port range {}-{}",
                tcp_port_start,
                tcp_port_end
            );
        }

        let defaults = RegistryConfig::default();
        let cache_file = get_env("REGISTRY_CACHE_FILE")
            .or_else(|| lookup("REGISTRY_CACHE_FILE"))
            .or(self.registry.cache_file)
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);
        let registry = RegistryConfig {
            capacity_bytes: self
                .registry
                .capacity_bytes
                .unwrap_or(defaults.capacity_bytes),
            cache_file,
            restore_grace: self
                .registry
                .restore_grace_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.restore_grace),
            flush_interval: self
                .registry
                .flush_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.flush_interval),
        };

        let defaults = SessionConfig::default();
        let secs = |value: Option<u64>, default: Duration| {
            value.map(Duration::from_secs).unwrap_or(default)
        };
        let session = SessionConfig {
            handshake_timeout: secs(self.session.handshake_timeout_secs, defaults.handshake_timeout),
            heartbeat_timeout: secs(self.session.heartbeat_timeout_secs, defaults.heartbeat_timeout),
            proxy_timeout: secs(self.session.proxy_timeout_secs, defaults.proxy_timeout),
            proxy_pool_size: self
                .session
                .proxy_pool_size
                .unwrap_or(defaults.proxy_pool_size),
            proxy_idle_timeout: secs(self.session.proxy_idle_secs, defaults.proxy_idle_timeout),
        };

        let non_empty = |value: Option<String>| value.filter(|v| !v.trim().is_empty());
        let report_url = non_empty(get_env("REPORT_URL").or(self.reporting.url));
        let mqtt_broker = non_empty(get_env("REPORT_MQTT_BROKER").or(self.reporting.mqtt_broker));
        let reporting = if self.reporting.enabled.unwrap_or(false) {
            let mqtt = match mqtt_broker {
                Some(broker) => Some(MqttConfig {
                    broker: parse_broker(&broker)?,
                    topic: get_env("REPORT_MQTT_TOPIC")
                        .or(self.reporting.mqtt_topic)
                        .unwrap_or_else(|| DEFAULT_MQTT_TOPIC.to_string()),
                    client_id: self
                        .reporting
                        .mqtt_client_id
                        .unwrap_or_else(|| "backhaul-server".to_string()),
                    username: get_env("REPORT_MQTT_USERNAME").or(self.reporting.mqtt_username),
                    password: get_env("REPORT_MQTT_PASSWORD").or(self.reporting.mqtt_password),
                }),
                None => None,
            };
            if report_url.is_none() && mqtt.is_none() {
                return Err(anyhow::anyhow!(
                    "Reporting enabled without a destination. Set BACKHAUL_REPORT_URL or \
                     BACKHAUL_REPORT_MQTT_BROKER (reporting.url or reporting.mqtt_broker in config)"
                ));
            }
            Some(ReportingConfig {
                url: report_url,
                mqtt,
                interval: Duration::from_secs(self.reporting.interval_secs.unwrap_or(5).max(1)),
            })
        } else {
            None
        };

        Ok(ResolvedServerConfig {
            tunnel_addr,
            http_addr,
            https_addr,
            domain,
            tls,
            log,
            log_level,
            tcp_port_range: (tcp_port_start, tcp_port_end),
            registry,
            session,
            reporting,
        })
    }

    /// Load config file and resolve with environment variable overrides
    pub fn load_and_resolve(path: &str) -> anyhow::Result<ResolvedServerConfig> {
        Self::load(path)?.resolve()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn resolve(config: ServerConfig, vars: &[(&str, &str)]) -> anyhow::Result<ResolvedServerConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        config.resolve_with(&|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = resolve(ServerConfig::default(), &[]).unwrap();
        assert_eq!(config.tunnel_addr, "0.0.0.0:4443".parse().unwrap());
        assert_eq!(config.http_addr, Some("0.0.0.0:8080".parse().unwrap()));
        assert!(config.https_addr.is_none());
        assert_eq!(config.domain, "localhost");
        assert_eq!(config.log, LogSink::Stdout);
        assert_eq!(config.tcp_port_range, (30000, 40000));
        assert_eq!(config.registry.capacity_bytes, DEFAULT_REGISTRY_CAPACITY);
        assert!(config.registry.cache_file.is_none());
        assert_eq!(config.registry.restore_grace, Duration::from_secs(300));
        assert!(config.reporting.is_none());
        assert_eq!(config.http_scheme(), "http");
    }

    #[test]
    fn test_toml_sections() {
        let config: ServerConfig = toml::from_str(
            r#"
            domain = "Tunnels.Example.com"
            http_addr = ""
            log = "none"
            tcp_port_range = [41000, 41010]

            [registry]
            cache_file = "/var/lib/backhaul/tunnels.jsonl"
            capacity_bytes = 4096

            [session]
            heartbeat_timeout_secs = 5
            proxy_pool_size = 2
            "#,
        )
        .unwrap();

        let config = resolve(config, &[]).unwrap();
        assert_eq!(config.domain, "tunnels.example.com");
        assert!(config.http_addr.is_none());
        assert_eq!(config.log, LogSink::None);
        assert_eq!(config.tcp_port_range, (41000, 41010));
        assert_eq!(
            config.registry.cache_file,
            Some(PathBuf::from("/var/lib/backhaul/tunnels.jsonl"))
        );
        assert_eq!(config.registry.capacity_bytes, 4096);
        assert_eq!(config.session.heartbeat_timeout, Duration::from_secs(5));
        assert_eq!(config.session.proxy_pool_size, 2);
        assert_eq!(config.session.proxy_timeout, Duration::from_secs(15));
    }

    #[test]
    fn test_env_overrides_file() {
        let config = ServerConfig {
            domain: Some("file.example.com".to_string()),
            ..ServerConfig::default()
        };
        let config = resolve(
            config,
            &[
                ("BACKHAUL_DOMAIN", "env.example.com"),
                ("BACKHAUL_TCP_PORT_START", "50000"),
                ("BACKHAUL_TCP_PORT_END", "50100"),
                ("BACKHAUL_LOG", "/tmp/backhaul.log"),
            ],
        )
        .unwrap();
        assert_eq!(config.domain, "env.example.com");
        assert_eq!(config.tcp_port_range, (50000, 50100));
        assert_eq!(config.log, LogSink::File(PathBuf::from("/tmp/backhaul.log")));
    }

    #[test]
    fn test_inverted_port_range_rejected() {
        assert!(resolve(
            ServerConfig::default(),
            &[("BACKHAUL_TCP_PORT_START", "50000")]
        )
        .is_err());
    }

    #[test]
    fn test_unprefixed_cache_file_variable() {
        let config = resolve(
            ServerConfig::default(),
            &[("REGISTRY_CACHE_FILE", "/tmp/tunnels.jsonl")],
        )
        .unwrap();
        assert_eq!(
            config.registry.cache_file,
            Some(PathBuf::from("/tmp/tunnels.jsonl"))
        );
    }

    #[test]
    fn test_https_requires_tls() {
        let config = ServerConfig {
            https_addr: Some("0.0.0.0:8443".to_string()),
            ..ServerConfig::default()
        };
        assert!(resolve(config, &[]).is_err());
    }

    #[test]
    fn test_reporting_requires_url() {
        let mut config = ServerConfig::default();
        config.reporting.enabled = Some(true);
        assert!(resolve(config, &[]).is_err());

        let mut config = ServerConfig::default();
        config.reporting.enabled = Some(true);
        let config = resolve(config, &[("BACKHAUL_REPORT_URL", "http://127.0.0.1:9/report")]).unwrap();
        let reporting = config.reporting.unwrap();
        assert_eq!(reporting.url.as_deref(), Some("http://127.0.0.1:9/report"));
        assert!(reporting.mqtt.is_none());
        assert_eq!(reporting.interval, Duration::from_secs(5));
    }

    #[test]
    fn test_mqtt_reporting_section() {
        let config: ServerConfig = toml::from_str(
            r#"
            [reporting]
            enabled = true
            interval_secs = 30
            mqtt_broker = "tcp://broker.example.com"
            mqtt_username = "backhaul"
            "#,
        )
        .unwrap();

        let config = resolve(config, &[("BACKHAUL_REPORT_MQTT_PASSWORD", "secret")]).unwrap();
        let reporting = config.reporting.unwrap();
        assert!(reporting.url.is_none());
        assert_eq!(reporting.interval, Duration::from_secs(30));
        assert_eq!(
            reporting.mqtt,
            Some(MqttConfig {
                broker: "broker.example.com:1883".to_string(),
                topic: DEFAULT_MQTT_TOPIC.to_string(),
                client_id: "backhaul-server".to_string(),
                username: Some("backhaul".to_string()),
                password: Some("secret".to_string()),
            })
        );
    }

    #[test]
    fn test_parse_broker() {
        assert_eq!(parse_broker("tcp://10.0.0.5:1884").unwrap(), "10.0.0.5:1884");
        assert_eq!(parse_broker("mqtt://broker/").unwrap(), "broker:1883");
        assert_eq!(parse_broker("localhost").unwrap(), "localhost:1883");
        assert_eq!(parse_broker("[::1]:1883").unwrap(), "[::1]:1883");
        assert!(parse_broker("ssl://broker:8883").is_err());
        assert!(parse_broker("tcp://").is_err());
    }

    #[test]
    fn test_disabled_reporting_ignores_destinations() {
        let mut config = ServerConfig::default();
        config.reporting.mqtt_broker = Some("broker:1883".to_string());
        let config = resolve(config, &[("BACKHAUL_REPORT_URL", "http://127.0.0.1:9/report")]).unwrap();
        assert!(config.reporting.is_none());
    }

    #[test]
    fn test_invalid_address_rejected() {
        let config = ServerConfig {
            tunnel_addr: Some("not-an-address".to_string()),
            ..ServerConfig::default()
        };
        assert!(resolve(config, &[]).is_err());
    }
}
