//! Proxy lifecycle
//!
//! [`ProxyEngine`] owns the listener, the TLS identity and the firewall rule
//! for one run of the proxy and moves through
//! `Stopped -> Starting -> Running -> Stopping -> Stopped`.

use crate::certificate::{CertificateError, TlsIdentity};
use crate::config::ProxyConfig;
use crate::events::LogSink;
use crate::firewall::FirewallController;
use crate::network::{self, InterfaceAddress};
use crate::proxy::{Forwarder, ProxyServer};
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to start proxy listener on port {port}")]
    ServerStart {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("failed to generate TLS certificate")]
    Certificate(#[source] CertificateError),

    #[error("certificate generation task did not complete")]
    CertificateTask(#[source] tokio::task::JoinError),

    #[error("failed to configure TLS listener")]
    Tls(#[source] CertificateError),

    #[error("failed to build outbound HTTP client")]
    Client(#[source] reqwest::Error),

    #[error("proxy must be stopped to change its configuration")]
    NotStopped,
}

/// Everything that exists only while the proxy runs
struct RunningProxy {
    server: ProxyServer,
    identity: Option<TlsIdentity>,
    firewall_rule: String,
    addresses: Vec<InterfaceAddress>,
}

struct Lifecycle {
    state: EngineState,
    config: ProxyConfig,
    running: Option<RunningProxy>,
}

pub struct ProxyEngine {
    lifecycle: Mutex<Lifecycle>,
    firewall: Arc<dyn FirewallController>,
    sink: Arc<dyn LogSink>,
}

impl ProxyEngine {
    pub fn new(
        config: ProxyConfig,
        firewall: Arc<dyn FirewallController>,
        sink: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            lifecycle: Mutex::new(Lifecycle {
                state: EngineState::Stopped,
                config,
                running: None,
            }),
            firewall,
            sink,
        }
    }

    pub fn state(&self) -> EngineState {
        self.lifecycle.lock().state
    }

    pub fn config(&self) -> ProxyConfig {
        self.lifecycle.lock().config.clone()
    }

    /// Replace the configuration used by the next [`start`](Self::start)
    pub fn reconfigure(&self, config: ProxyConfig) -> Result<(), EngineError> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state != EngineState::Stopped {
            return Err(EngineError::NotStopped);
        }
        lifecycle.config = config;
        Ok(())
    }

    /// Address the listener is bound to, while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lifecycle
            .lock()
            .running
            .as_ref()
            .map(|running| running.server.local_addr())
    }

    /// LAN addresses discovered when the current run started
    pub fn addresses(&self) -> Vec<InterfaceAddress> {
        self.lifecycle
            .lock()
            .running
            .as_ref()
            .map(|running| running.addresses.clone())
            .unwrap_or_default()
    }

    /// The certificate served by the current run, if it uses TLS
    pub fn identity_pem(&self) -> Option<String> {
        self.lifecycle
            .lock()
            .running
            .as_ref()
            .and_then(|running| running.identity.as_ref())
            .map(|identity| identity.pem_bundle().to_string())
    }

    /// Start the proxy. Does nothing unless the engine is stopped.
    ///
    /// On error the engine is back in `Stopped` and nothing is left behind:
    /// no listener, and the firewall rule removed again. The same holds when
    /// the returned future is dropped before it completes.
    pub async fn start(&self) -> Result<(), EngineError> {
        let config = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state != EngineState::Stopped {
                debug!("Start requested while {:?}, ignoring", lifecycle.state);
                return Ok(());
            }
            lifecycle.state = EngineState::Starting;
            lifecycle.config.clone()
        };
        let mut guard = StartGuard::new(self);

        info!(
            "Starting proxy on port {} -> {}",
            config.port(),
            config.target_base_url()
        );

        let running = self.launch(&config, &mut guard).await?;
        let local_addr = running.server.local_addr();
        {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.running = Some(running);
            lifecycle.state = EngineState::Running;
        }
        guard.disarm();

        info!("Proxy running on {}://{}", config.scheme(), local_addr);
        Ok(())
    }

    /// Stop the proxy. Does nothing unless the engine is running.
    pub async fn stop(&self) {
        let running = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state != EngineState::Running {
                debug!("Stop requested while {:?}, ignoring", lifecycle.state);
                return;
            }
            lifecycle.state = EngineState::Stopping;
            lifecycle.running.take()
        };

        if let Some(running) = running {
            running.server.shutdown().await;
            drop(running.identity);
            self.remove_firewall_rule(&running.firewall_rule).await;
        }

        self.lifecycle.lock().state = EngineState::Stopped;
        info!("Proxy stopped");
    }

    async fn launch(
        &self,
        config: &ProxyConfig,
        guard: &mut StartGuard<'_>,
    ) -> Result<RunningProxy, EngineError> {
        let addresses = network::list_addresses();
        for entry in &addresses {
            debug!("Interface {} has address {}", entry.name, entry.address);
        }

        let identity = if config.use_tls() {
            let ips: Vec<String> = addresses
                .iter()
                .map(|entry| entry.address.to_string())
                .collect();
            let identity =
                tokio::task::spawn_blocking(move || TlsIdentity::generate(ips.as_slice()))
                    .await
                    .map_err(EngineError::CertificateTask)?
                    .map_err(EngineError::Certificate)?;
            Some(identity)
        } else {
            None
        };

        let tls = identity
            .as_ref()
            .map(|identity| identity.server_config().map(TlsAcceptor::from))
            .transpose()
            .map_err(EngineError::Tls)?;

        let client = Forwarder::build_client().map_err(EngineError::Client)?;
        let forwarder = Forwarder::new(config.target_base_url(), client, Arc::clone(&self.sink));

        let port = config.port();
        let firewall_rule = config.firewall_rule_name().to_string();
        guard.firewall_rule = Some(firewall_rule.clone());
        if let Err(e) = self.firewall.add_rule(port, &firewall_rule).await {
            warn!(
                "Could not add firewall rule '{}' for port {}: {}",
                firewall_rule, port, e
            );
        }

        match ProxyServer::bind(port, tls, forwarder).await {
            Ok(server) => Ok(RunningProxy {
                server,
                identity,
                firewall_rule,
                addresses,
            }),
            Err(source) => {
                self.remove_firewall_rule(&firewall_rule).await;
                guard.firewall_rule = None;
                Err(EngineError::ServerStart { port, source })
            }
        }
    }

    async fn remove_firewall_rule(&self, rule_name: &str) {
        if let Err(e) = self.firewall.remove_rule(rule_name).await {
            warn!("Could not remove firewall rule '{}': {}", rule_name, e);
        }
    }
}

/// Returns the engine to `Stopped` when a start does not reach `Running`,
/// including when the start future is dropped mid-way. A firewall rule that
/// may already be in place is withdrawn in the background.
struct StartGuard<'a> {
    engine: &'a ProxyEngine,
    firewall_rule: Option<String>,
    armed: bool,
}

impl<'a> StartGuard<'a> {
    fn new(engine: &'a ProxyEngine) -> Self {
        Self {
            engine,
            firewall_rule: None,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        {
            let mut lifecycle = self.engine.lifecycle.lock();
            if lifecycle.state == EngineState::Starting {
                lifecycle.state = EngineState::Stopped;
            }
        }

        let Some(rule_name) = self.firewall_rule.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let firewall = Arc::clone(&self.engine.firewall);
                handle.spawn(async move {
                    if let Err(e) = firewall.remove_rule(&rule_name).await {
                        warn!("Could not remove firewall rule '{}': {}", rule_name, e);
                    }
                });
            }
            Err(_) => warn!(
                "Start abandoned without a runtime; firewall rule '{}' may remain",
                rule_name
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RequestLog;
    use crate::firewall::{DisabledFirewall, FirewallError, FirewallResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct FailingFirewall {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl FirewallController for FailingFirewall {
        async fn add_rule(&self, port: u16, rule_name: &str) -> FirewallResult<()> {
            self.calls.lock().push(format!("add {} {}", port, rule_name));
            Err(FirewallError::PermissionDenied("test".to_string()))
        }

        async fn remove_rule(&self, rule_name: &str) -> FirewallResult<()> {
            self.calls.lock().push(format!("remove {}", rule_name));
            Err(FirewallError::PermissionDenied("test".to_string()))
        }

        fn is_elevated(&self) -> bool {
            false
        }
    }

    /// Records calls; the first `add_rule` never completes when `stall_add` is set
    #[derive(Default)]
    struct StallingFirewall {
        stall_add: AtomicBool,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl FirewallController for StallingFirewall {
        async fn add_rule(&self, port: u16, rule_name: &str) -> FirewallResult<()> {
            self.calls.lock().push(format!("add {} {}", port, rule_name));
            if self.stall_add.swap(false, Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        async fn remove_rule(&self, rule_name: &str) -> FirewallResult<()> {
            self.calls.lock().push(format!("remove {}", rule_name));
            Ok(())
        }

        fn is_elevated(&self) -> bool {
            true
        }
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("0.0.0.0:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn plain_config(port: u16) -> ProxyConfig {
        ProxyConfig::new(port, "http://127.0.0.1:1", false, "EngineTestRule").unwrap()
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_noop() {
        let firewall = Arc::new(FailingFirewall::default());
        let engine = ProxyEngine::new(
            plain_config(free_port()),
            firewall.clone(),
            Arc::new(RequestLog::new()),
        );

        engine.stop().await;
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(firewall.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_firewall_failure_does_not_prevent_start() {
        let firewall = Arc::new(FailingFirewall::default());
        let engine = ProxyEngine::new(
            plain_config(free_port()),
            firewall.clone(),
            Arc::new(RequestLog::new()),
        );

        engine.start().await.unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        assert!(engine.local_addr().is_some());

        engine.stop().await;
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(engine.local_addr().is_none());
        assert_eq!(
            *firewall.calls.lock(),
            vec![
                format!("add {} EngineTestRule", engine.config().port()),
                "remove EngineTestRule".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_port_in_use_fails_start_and_rolls_back() {
        let occupied = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let port = occupied.local_addr().unwrap().port();
        let firewall = Arc::new(FailingFirewall::default());
        let engine = ProxyEngine::new(
            plain_config(port),
            firewall.clone(),
            Arc::new(RequestLog::new()),
        );

        let err = engine.start().await.unwrap_err();
        assert!(matches!(err, EngineError::ServerStart { port: p, .. } if p == port));
        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(firewall.calls.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_reconfigure_only_while_stopped() {
        let engine = ProxyEngine::new(
            plain_config(free_port()),
            Arc::new(DisabledFirewall),
            Arc::new(RequestLog::new()),
        );

        engine.start().await.unwrap();
        assert!(matches!(
            engine.reconfigure(plain_config(free_port())),
            Err(EngineError::NotStopped)
        ));

        engine.stop().await;
        let next = plain_config(free_port());
        engine.reconfigure(next.clone()).unwrap();
        assert_eq!(engine.config(), next);
    }

    #[tokio::test]
    async fn test_tls_run_exposes_identity() {
        let config =
            ProxyConfig::new(free_port(), "http://127.0.0.1:1", true, "EngineTestRule").unwrap();
        let engine = ProxyEngine::new(
            config,
            Arc::new(DisabledFirewall),
            Arc::new(RequestLog::new()),
        );

        assert!(engine.identity_pem().is_none());
        engine.start().await.unwrap();
        let pem = engine.identity_pem().unwrap();
        assert!(pem.contains("PRIVATE KEY"));
        assert!(pem.contains("BEGIN CERTIFICATE"));

        engine.stop().await;
        assert!(engine.identity_pem().is_none());
    }

    #[tokio::test]
    async fn test_abandoned_start_returns_to_stopped() {
        let firewall = Arc::new(StallingFirewall::default());
        firewall.stall_add.store(true, Ordering::SeqCst);
        let engine = ProxyEngine::new(
            plain_config(free_port()),
            firewall.clone(),
            Arc::new(RequestLog::new()),
        );
        let port = engine.config().port();

        let attempt = tokio::time::timeout(Duration::from_millis(100), engine.start()).await;
        assert!(attempt.is_err());
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(engine.local_addr().is_none());

        // The rule withdrawal runs on a spawned task
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            *firewall.calls.lock(),
            vec![
                format!("add {} EngineTestRule", port),
                "remove EngineTestRule".to_string(),
            ]
        );

        engine.start().await.unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        assert!(engine.local_addr().is_some());

        engine.stop().await;
        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(firewall.calls.lock().len(), 4);
    }
}
