//! Proxy configuration

use std::net::Ipv4Addr;
use thiserror::Error;
use url::Url;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_TARGET_URL: &str = "http://localhost:5059";
pub const DEFAULT_FIREWALL_RULE_NAME: &str = "AAProxyRule";
pub const DEFAULT_USE_TLS: bool = true;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("port must be between 1 and 65535")]
    InvalidPort,

    #[error("invalid target URL '{url}': {reason}")]
    InvalidTargetUrl { url: String, reason: String },

    #[error("firewall rule name must not be empty")]
    EmptyRuleName,
}

/// Validated proxy configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    port: u16,
    target_base_url: String,
    use_tls: bool,
    firewall_rule_name: String,
}

impl ProxyConfig {
    /// Validate and build a configuration.
    ///
    /// The target must be an absolute `http` or `https` URL with a host.
    /// Trailing slashes are removed so request paths can be appended as-is.
    pub fn new(
        port: u16,
        target_base_url: &str,
        use_tls: bool,
        firewall_rule_name: &str,
    ) -> Result<Self, ConfigError> {
        if port == 0 {
            return Err(ConfigError::InvalidPort);
        }

        let trimmed = target_base_url.trim().trim_end_matches('/');
        let invalid = |reason: String| ConfigError::InvalidTargetUrl {
            url: target_base_url.to_string(),
            reason,
        };

        let parsed = Url::parse(trimmed).map_err(|e| invalid(e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported scheme '{}'", parsed.scheme())));
        }
        if parsed.host_str().map_or(true, str::is_empty) {
            return Err(invalid("missing host".to_string()));
        }

        let firewall_rule_name = firewall_rule_name.trim();
        if firewall_rule_name.is_empty() {
            return Err(ConfigError::EmptyRuleName);
        }

        Ok(Self {
            port,
            target_base_url: trimmed.to_string(),
            use_tls,
            firewall_rule_name: firewall_rule_name.to_string(),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Target base URL, never ending in `/`
    pub fn target_base_url(&self) -> &str {
        &self.target_base_url
    }

    pub fn use_tls(&self) -> bool {
        self.use_tls
    }

    pub fn firewall_rule_name(&self) -> &str {
        &self.firewall_rule_name
    }

    pub fn scheme(&self) -> &'static str {
        if self.use_tls {
            "https"
        } else {
            "http"
        }
    }

    /// URL another device on the LAN should open, falling back to
    /// `localhost` when no address was discovered
    pub fn connection_url(&self, host: Option<Ipv4Addr>) -> String {
        match host {
            Some(ip) => format!("{}://{}:{}", self.scheme(), ip, self.port),
            None => format!("{}://localhost:{}", self.scheme(), self.port),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            target_base_url: DEFAULT_TARGET_URL.to_string(),
            use_tls: DEFAULT_USE_TLS,
            firewall_rule_name: DEFAULT_FIREWALL_RULE_NAME.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_slash_trimmed() {
        let config = ProxyConfig::new(3000, "http://localhost:5059/", false, "Rule").unwrap();
        assert_eq!(config.target_base_url(), "http://localhost:5059");

        let config = ProxyConfig::new(3000, "https://10.0.0.5:8443/api//", true, "Rule").unwrap();
        assert_eq!(config.target_base_url(), "https://10.0.0.5:8443/api");
    }

    #[test]
    fn test_rejects_port_zero() {
        assert_eq!(
            ProxyConfig::new(0, DEFAULT_TARGET_URL, false, "Rule"),
            Err(ConfigError::InvalidPort)
        );
    }

    #[test]
    fn test_rejects_bad_targets() {
        for target in ["localhost:5059", "not a url", "ftp://example.com", ""] {
            let result = ProxyConfig::new(3000, target, false, "Rule");
            assert!(
                matches!(result, Err(ConfigError::InvalidTargetUrl { .. })),
                "accepted {:?}",
                target
            );
        }
    }

    #[test]
    fn test_rejects_empty_rule_name() {
        assert_eq!(
            ProxyConfig::new(3000, DEFAULT_TARGET_URL, false, "  "),
            Err(ConfigError::EmptyRuleName)
        );
    }

    #[test]
    fn test_connection_url() {
        let config = ProxyConfig::default();
        assert_eq!(
            config.connection_url(Some(Ipv4Addr::new(192, 168, 1, 20))),
            "https://192.168.1.20:3000"
        );

        let config = ProxyConfig::new(8080, DEFAULT_TARGET_URL, false, "Rule").unwrap();
        assert_eq!(config.connection_url(None), "http://localhost:8080");
    }
}
