//! UrlProxy - Main entry point
//!
//! Exposes a local development service to other devices on the LAN

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use urlproxy::{
    network, ChannelSink, DisabledFirewall, FirewallController, LogSink, ProxyEngine, RequestLog,
    Settings, SystemFirewall,
};

/// UrlProxy - Expose a localhost service to the LAN over HTTP(S)
#[derive(Parser, Debug)]
#[command(name = "urlproxy")]
#[command(author = "UrlProxy Contributors")]
#[command(version = "1.0.0")]
#[command(about = "Expose a localhost service to the LAN through a reverse proxy")]
struct Args {
    /// Settings file (defaults to the platform config directory)
    #[arg(long, env = "URLPROXY_SETTINGS")]
    settings: Option<PathBuf>,

    /// Port to listen on
    #[arg(long, env = "URLPROXY_PORT")]
    port: Option<u16>,

    /// Base URL of the service to expose
    #[arg(long, env = "URLPROXY_TARGET")]
    target: Option<String>,

    /// Name of the inbound firewall rule
    #[arg(long, env = "URLPROXY_RULE_NAME")]
    rule_name: Option<String>,

    /// Serve HTTPS with a generated self-signed certificate
    #[arg(long, env = "URLPROXY_TLS")]
    tls: Option<bool>,

    /// Do not add or remove a firewall rule
    #[arg(long)]
    no_firewall: bool,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    /// Command-line and environment values take precedence over the file
    fn apply_to(&self, settings: &mut Settings) {
        if let Some(port) = self.port {
            settings.port = port;
        }
        if let Some(target) = &self.target {
            settings.target_url = target.clone();
        }
        if let Some(rule_name) = &self.rule_name {
            settings.firewall_rule_name = rule_name.clone();
        }
        if let Some(tls) = self.tls {
            settings.use_https = tls;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting UrlProxy v{}", env!("CARGO_PKG_VERSION"));

    let settings_path = args.settings.clone().or_else(Settings::default_path);
    let mut settings = match &settings_path {
        Some(path) => Settings::load_or_default(path),
        None => {
            warn!("No configuration directory available; using default settings");
            Settings::default()
        }
    };
    args.apply_to(&mut settings);

    let config = settings
        .to_proxy_config()
        .context("Invalid proxy configuration")?;

    let firewall: Arc<dyn FirewallController> = if args.no_firewall {
        Arc::new(DisabledFirewall)
    } else {
        let firewall = SystemFirewall::new();
        info!("Firewall backend: {}", firewall.backend().name());
        Arc::new(firewall)
    };

    if !args.no_firewall && !firewall.is_elevated() {
        warn!(
            "Not running with administrator privileges; \
             the firewall rule will likely not be added"
        );
    }

    // Request log events are drained here so the proxy never waits on output
    let request_log = Arc::new(RequestLog::new());
    let (sink, mut events) = ChannelSink::channel();
    let drain_log = Arc::clone(&request_log);
    let drain = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            info!("{}", event);
            drain_log.record(event);
        }
    });

    let engine = ProxyEngine::new(config.clone(), firewall, Arc::new(sink));

    if let Some(path) = &settings_path {
        settings.save_or_warn(path);
    }
    engine
        .start()
        .await
        .with_context(|| format!("Failed to start proxy on port {}", config.port()))?;

    let addresses = engine.addresses();
    if addresses.is_empty() {
        warn!("No LAN addresses found; the proxy is only reachable from this machine");
    }
    for entry in &addresses {
        info!(
            "Reachable at {}://{}:{} ({})",
            config.scheme(),
            entry.address,
            config.port(),
            entry.name
        );
    }
    info!(
        "Connect devices to {}",
        config.connection_url(network::primary_address())
    );
    info!("Forwarding to {}", config.target_base_url());
    info!("Press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutting down");
    engine.stop().await;

    // The engine holds the last sender; dropping it ends the drain task
    drop(engine);
    let _ = drain.await;
    info!("{} requests in the recent request log", request_log.len());

    Ok(())
}
