//! Periodic publication of connected clients and their tunnels
//!
//! Reporting only ever reads registry snapshots. Sink failures back off
//! exponentially and are otherwise ignored. Snapshots go to an HTTP endpoint
//! ([`HttpReportSink`]) or an MQTT broker ([`MqttReportSink`]).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use backhaul_protocol::Protocol;

use crate::config::MqttConfig;
use crate::control_registry::ControlRegistry;
use crate::mqtt::{Incoming, MqttCodec, MqttError, Outgoing};

/// Connect and CONNACK deadline for each MQTT publish
const MQTT_TIMEOUT: Duration = Duration::from_secs(10);

/// One connected client as published by the reporter
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ClientReport {
    pub client_id: String,
    pub version: String,
    pub connected_at: DateTime<Utc>,
    pub tunnels: Vec<TunnelReport>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TunnelReport {
    pub url: String,
    pub protocol: Protocol,
    pub remote_port: Option<u16>,
    pub local_addr: String,
}

#[derive(Debug, Serialize)]
struct ReportPayload<'a> {
    generated_at: DateTime<Utc>,
    clients: &'a [ClientReport],
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Report endpoint returned {0}")]
    Status(u16),

    #[error("MQTT error: {0}")]
    Mqtt(#[from] MqttError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Destination for client snapshots
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn publish(&self, clients: &[ClientReport]) -> Result<(), ReportError>;
}

/// POSTs each snapshot as JSON
pub struct HttpReportSink {
    client: reqwest::Client,
    url: String,
}

impl HttpReportSink {
    pub fn new(url: impl Into<String>) -> Result<Self, ReportError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ReportSink for HttpReportSink {
    async fn publish(&self, clients: &[ClientReport]) -> Result<(), ReportError> {
        let payload = ReportPayload {
            generated_at: Utc::now(),
            clients,
        };
        let response = self.client.post(&self.url).json(&payload).send().await?;
        if !response.status().is_success() {
            return Err(ReportError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Publishes each snapshot as a QoS 0 MQTT message
///
/// Opens a short-lived broker session per publish: `CONNECT`, wait for an
/// accepting `CONNACK`, `PUBLISH`, `DISCONNECT`.
pub struct MqttReportSink {
    config: MqttConfig,
    timeout: Duration,
}

impl MqttReportSink {
    pub fn new(config: MqttConfig) -> Self {
        Self {
            config,
            timeout: MQTT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn connect(&self) -> Result<Framed<TcpStream, MqttCodec>, MqttError> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&self.config.broker))
            .await
            .map_err(|_| MqttError::Timeout)??;
        let mut framed = Framed::new(stream, MqttCodec::new());

        framed
            .send(Outgoing::Connect {
                client_id: self.config.client_id.clone(),
                username: self.config.username.clone(),
                password: self.config.password.clone(),
                keep_alive_secs: self.timeout.as_secs().min(u64::from(u16::MAX)) as u16,
            })
            .await?;

        let reply = tokio::time::timeout(self.timeout, framed.next())
            .await
            .map_err(|_| MqttError::Timeout)?;
        match reply {
            Some(Ok(Incoming::ConnAck {
                code: 0,
                session_present,
            })) => {
                tracing::trace!(broker = %self.config.broker, session_present, "MQTT broker accepted connection");
                Ok(framed)
            }
            Some(Ok(Incoming::ConnAck { code, .. })) => Err(MqttError::Refused(code)),
            Some(Ok(Incoming::Other(packet))) => Err(MqttError::UnexpectedPacket(packet)),
            Some(Err(e)) => Err(e),
            None => Err(MqttError::Closed),
        }
    }
}

#[async_trait]
impl ReportSink for MqttReportSink {
    async fn publish(&self, clients: &[ClientReport]) -> Result<(), ReportError> {
        let payload = serde_json::to_vec(&ReportPayload {
            generated_at: Utc::now(),
            clients,
        })?;

        let mut framed = self.connect().await?;
        framed
            .send(Outgoing::Publish {
                topic: self.config.topic.clone(),
                payload: Bytes::from(payload),
                retain: false,
            })
            .await?;
        framed.send(Outgoing::Disconnect).await?;
        Ok(())
    }
}

/// Background task publishing `ControlRegistry` snapshots on an interval
pub struct Reporter {
    controls: Arc<ControlRegistry>,
    sink: Arc<dyn ReportSink>,
    interval: Duration,
    max_backoff: Duration,
}

impl Reporter {
    pub fn new(controls: Arc<ControlRegistry>, sink: Arc<dyn ReportSink>, interval: Duration) -> Self {
        Self {
            controls,
            sink,
            interval,
            max_backoff: Duration::from_secs(300).max(interval),
        }
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff.max(self.interval);
        self
    }

    /// Delay before the next publish after `failures` consecutive failures
    fn delay(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.min(16));
        self.interval.saturating_mul(factor).min(self.max_backoff)
    }

    /// Publish until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        let mut failures = 0u32;
        loop {
            let clients = self.controls.snapshot();
            match self.sink.publish(&clients).await {
                Ok(()) => {
                    if failures > 0 {
                        tracing::info!("Reporting recovered after {} failures", failures);
                    }
                    failures = 0;
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    tracing::warn!(failures, "Failed to publish client report: {}", e);
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.delay(failures)) => {}
            }
        }
        tracing::debug!("Reporter stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::control::Control;
    use parking_lot::Mutex;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct RecordingSink {
        snapshots: Mutex<Vec<Vec<ClientReport>>>,
        fail_first: AtomicUsize,
    }

    #[async_trait]
    impl ReportSink for RecordingSink {
        async fn publish(&self, clients: &[ClientReport]) -> Result<(), ReportError> {
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ReportError::Status(503));
            }
            self.snapshots.lock().push(clients.to_vec());
            Ok(())
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let reporter = Reporter::new(
            ControlRegistry::new(),
            Arc::new(RecordingSink::default()),
            Duration::from_secs(5),
        )
        .with_max_backoff(Duration::from_secs(60));

        assert_eq!(reporter.delay(0), Duration::from_secs(5));
        assert_eq!(reporter.delay(1), Duration::from_secs(10));
        assert_eq!(reporter.delay(3), Duration::from_secs(40));
        assert_eq!(reporter.delay(4), Duration::from_secs(60));
        assert_eq!(reporter.delay(100), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_publishes_connected_clients() {
        let controls = ControlRegistry::new();
        let (control, _rx) = Control::new("aa:bb:cc".into(), "1.0".into(), None, SessionConfig::default());
        controls.add(control);

        let sink = Arc::new(RecordingSink {
            fail_first: AtomicUsize::new(1),
            ..RecordingSink::default()
        });
        let cancel = CancellationToken::new();
        let reporter = Reporter::new(controls, sink.clone(), Duration::from_millis(10));
        let task = tokio::spawn(reporter.run(cancel.clone()));

        for _ in 0..200 {
            if !sink.snapshots.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        task.await.unwrap();

        let snapshots = sink.snapshots.lock();
        let first = snapshots.first().expect("no report published after a failure");
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].client_id, "aa:bb:cc");
        assert_eq!(first[0].version, "1.0");
    }

    #[test]
    fn test_report_json_shape() {
        let report = TunnelReport {
            url: "tcp://example.com:31000".to_string(),
            protocol: Protocol::Tcp,
            remote_port: Some(31000),
            local_addr: "127.0.0.1:22".to_string(),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["protocol"], "tcp");
        assert_eq!(json["remote_port"], 31000);
    }

    fn mqtt_config(broker: SocketAddr) -> MqttConfig {
        MqttConfig {
            broker: broker.to_string(),
            topic: "backhaul/clients".to_string(),
            client_id: "backhaul-test".to_string(),
            username: None,
            password: None,
        }
    }

    fn client_report() -> ClientReport {
        ClientReport {
            client_id: "aa:bb:cc".to_string(),
            version: "1.0".to_string(),
            connected_at: Utc::now(),
            tunnels: vec![TunnelReport {
                url: "tcp://example.com:31000".to_string(),
                protocol: Protocol::Tcp,
                remote_port: Some(31000),
                local_addr: "127.0.0.1:22".to_string(),
            }],
        }
    }

    /// Read one MQTT packet as (fixed header, body)
    async fn read_packet(stream: &mut TcpStream) -> (u8, Vec<u8>) {
        let header = stream.read_u8().await.unwrap();
        let mut len = 0usize;
        for shift in 0..4 {
            let byte = stream.read_u8().await.unwrap();
            len += usize::from(byte & 0x7F) << (7 * shift);
            if byte & 0x80 == 0 {
                break;
            }
        }
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await.unwrap();
        (header, body)
    }

    #[tokio::test]
    async fn test_mqtt_sink_publishes_snapshot() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let broker = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let connect = read_packet(&mut stream).await;
            stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();
            let publish = read_packet(&mut stream).await;
            let disconnect = read_packet(&mut stream).await;
            (connect, publish, disconnect)
        });

        let sink = MqttReportSink::new(mqtt_config(addr));
        sink.publish(&[client_report()]).await.unwrap();

        let ((connect_header, connect), (publish_header, publish), disconnect) =
            broker.await.unwrap();

        assert_eq!(connect_header, 0x10);
        assert_eq!(&connect[2..6], b"MQTT");
        // Variable header is 10 bytes, then the length-prefixed client id
        assert_eq!(&connect[12..], b"backhaul-test");

        assert_eq!(publish_header, 0x30);
        let topic_len = usize::from(u16::from_be_bytes([publish[0], publish[1]]));
        assert_eq!(&publish[2..2 + topic_len], b"backhaul/clients");
        let json: serde_json::Value = serde_json::from_slice(&publish[2 + topic_len..]).unwrap();
        assert_eq!(json["clients"][0]["client_id"], "aa:bb:cc");
        assert_eq!(json["clients"][0]["tunnels"][0]["remote_port"], 31000);

        assert_eq!(disconnect, (0xE0, Vec::new()));
    }

    #[tokio::test]
    async fn test_mqtt_sink_reports_refused_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_packet(&mut stream).await;
            // Not authorized
            stream.write_all(&[0x20, 0x02, 0x00, 0x05]).await.unwrap();
            let _ = stream.read_u8().await;
        });

        let sink = MqttReportSink::new(mqtt_config(addr));
        let result = sink.publish(&[client_report()]).await;
        assert!(matches!(
            result,
            Err(ReportError::Mqtt(MqttError::Refused(5)))
        ));
    }

    #[tokio::test]
    async fn test_mqtt_sink_times_out_on_silent_broker() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let sink = MqttReportSink::new(mqtt_config(addr)).with_timeout(Duration::from_millis(100));
        let result = sink.publish(&[]).await;
        assert!(matches!(result, Err(ReportError::Mqtt(MqttError::Timeout))));
    }
}
