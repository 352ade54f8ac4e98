use std::fs::OpenOptions;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use backhaul_server::{
    ControlRegistry, HttpPlane, HttpReportSink, LogSink, MqttReportSink, Multiplexer, ReportSink,
    Reporter, ResolvedServerConfig, ServerConfig, ServerState, TcpPlane, TunnelRegistry,
};

/// Tunnel server - accepts tunnel connections and routes traffic
#[derive(Parser, Debug)]
#[command(name = "backhaul-server")]
#[command(about = "Self-hosted reverse tunnel server")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "server.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install crypto provider before any TLS operations
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let args = Args::parse();

    let config = ServerConfig::load_and_resolve(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config))?;

    init_logging(&config)?;
    tracing::info!("Starting tunnel server with config: {}", args.config);
    tracing::info!("Domain: {}", config.domain);
    tracing::info!(
        "TCP port range: {}-{}",
        config.tcp_port_range.0,
        config.tcp_port_range.1
    );

    let tls_acceptor = match &config.tls {
        Some((cert, key)) => {
            let tls_config = backhaul_common::load_server_config(cert, key)
                .context("Failed to load TLS configuration")?;
            Some(TlsAcceptor::from(Arc::new(tls_config)))
        }
        None => {
            tracing::info!("TLS disabled, tunnel port is plaintext");
            None
        }
    };

    // Shared state
    let controls = ControlRegistry::new();
    let tunnels =
        TunnelRegistry::open(&config.registry).context("Failed to open tunnel registry")?;
    let tcp_plane = TcpPlane::new(config.tunnel_addr.ip(), config.tcp_port_range);
    let state = ServerState::new(
        controls.clone(),
        tunnels.clone(),
        tcp_plane,
        config.domain.clone(),
        config.http_scheme(),
        config.session.clone(),
    );

    let cancel = CancellationToken::new();

    let flusher = tunnels
        .is_persistent()
        .then(|| tunnels.spawn_flusher(config.registry.flush_interval, cancel.clone()));

    if let Some(reporting) = &config.reporting {
        let mut sinks: Vec<Arc<dyn ReportSink>> = Vec::new();
        if let Some(url) = &reporting.url {
            let sink = HttpReportSink::new(url.clone()).context("Failed to build reporting client")?;
            tracing::info!("Reporting to {} every {:?}", url, reporting.interval);
            sinks.push(Arc::new(sink));
        }
        if let Some(mqtt) = &reporting.mqtt {
            tracing::info!(
                "Reporting to MQTT broker {} topic {} every {:?}",
                mqtt.broker,
                mqtt.topic,
                reporting.interval
            );
            sinks.push(Arc::new(MqttReportSink::new(mqtt.clone())));
        }
        for sink in sinks {
            let reporter = Reporter::new(controls.clone(), sink, reporting.interval);
            tokio::spawn(reporter.run(cancel.clone()));
        }
    }

    let multiplexer = Multiplexer::new(state, tls_acceptor.clone());
    let http_plane = config
        .http_addr
        .map(|addr| (addr, HttpPlane::new(tunnels.clone(), None, config.session.proxy_timeout)));
    let https_plane = match (config.https_addr, tls_acceptor) {
        (Some(addr), Some(acceptor)) => Some((
            addr,
            HttpPlane::new(tunnels.clone(), Some(acceptor), config.session.proxy_timeout),
        )),
        _ => None,
    };

    let result = tokio::select! {
        result = multiplexer.run(config.tunnel_addr) => {
            result.context("Tunnel listener stopped")
        }
        result = run_plane(http_plane) => {
            result.context("HTTP plane stopped")
        }
        result = run_plane(https_plane) => {
            result.context("HTTPS plane stopped")
        }
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received, cleaning up...");
            Ok(())
        }
    };

    // Persist the journal before sessions tear down so live tunnels survive a restart
    cancel.cancel();
    if let Some(flusher) = flusher {
        if let Err(e) = flusher.await {
            tracing::error!("Journal flusher failed: {}", e);
        }
    }
    controls.close_all();

    if let Err(ref e) = result {
        tracing::error!("{:#}", e);
    }
    tracing::info!("Server shutdown complete");
    result
}

/// Run an optional public plane; never resolves when disabled
async fn run_plane(plane: Option<(SocketAddr, Arc<HttpPlane>)>) -> Result<()> {
    match plane {
        Some((addr, plane)) => plane.run(addr).await,
        None => std::future::pending().await,
    }
}

fn init_logging(config: &ResolvedServerConfig) -> Result<()> {
    let level: LevelFilter = config
        .log_level
        .parse()
        .with_context(|| format!("Invalid log level {:?}", config.log_level))?;
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    match &config.log {
        LogSink::Stdout => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogSink::None => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::sink)
            .init(),
        LogSink::File(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
    }
    Ok(())
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}
