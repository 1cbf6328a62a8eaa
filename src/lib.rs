//! UrlProxy - expose a local development service to the LAN
//!
//! Runs a reverse proxy on `0.0.0.0:<port>` that forwards every request to a
//! single target base URL, so phones, tablets and emulators can reach a
//! service that only listens on localhost:
//! - Self-signed HTTPS certificate covering localhost, the emulator host
//!   alias and every LAN address
//! - Inbound firewall rule added on start and removed on stop
//! - One request log event per forwarded request
//! - Persisted settings with CLI/environment overrides

pub mod certificate;
pub mod config;
pub mod engine;
pub mod events;
pub mod firewall;
pub mod network;
pub mod proxy;
pub mod settings;

pub use certificate::{CertificateError, SubjectAltName, TlsIdentity};
pub use config::{ConfigError, ProxyConfig};
pub use engine::{EngineError, EngineState, ProxyEngine};
pub use events::{ChannelSink, LogEvent, LogSink, RequestLog};
pub use firewall::{
    DisabledFirewall, FirewallBackend, FirewallController, FirewallError, SystemFirewall,
};
pub use network::InterfaceAddress;
pub use proxy::{Forwarder, ForwardError, ProxyServer};
pub use settings::{Settings, SettingsError};
