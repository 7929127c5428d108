//! Server configuration with declared, statically-typed defaults.
//!
//! Every knob has its default spelled out in the [`Default`] impl — there
//! is no runtime field discovery. Missing fields in a loaded TOML document
//! fall back to those defaults per-field.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The TOML document failed to parse or type-check.
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Runtime settings for a [`Server`](crate::server::Server).
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server name used in startup logs.
    pub name: String,
    /// Deployment environment tag (`dev`, `stage`, `prod`, ...).
    pub environment: String,
    /// Interface the listener binds.
    pub host: IpAddr,
    /// Port the listener binds.
    pub port: u16,
    /// Seconds a session may stay idle before it is closed.
    pub idle_timeout_secs: u64,
    /// Scratch buffer size for socket reads, in bytes.
    pub read_buffer_bytes: usize,
    /// Wall-clock budget for one handler run, in seconds.
    pub operation_budget_secs: u64,
    /// Grace period between shutdown fan-out and process exit, in seconds.
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "playwire".into(),
            environment: "dev".into(),
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8309,
            idle_timeout_secs: 30,
            read_buffer_bytes: 1024,
            operation_budget_secs: 5,
            shutdown_grace_secs: 5,
        }
    }
}

impl ServerConfig {
    /// Parse a TOML document, filling missing fields from the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed or mistyped documents.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Address the listener binds.
    #[must_use]
    pub fn listen_addr(&self) -> SocketAddr { SocketAddr::new(self.host, self.port) }

    /// Idle timeout as a [`Duration`].
    #[must_use]
    pub fn idle_timeout(&self) -> Duration { Duration::from_secs(self.idle_timeout_secs) }

    /// Handler execution budget as a [`Duration`].
    #[must_use]
    pub fn operation_budget(&self) -> Duration {
        Duration::from_secs(self.operation_budget_secs)
    }

    /// Shutdown grace period as a [`Duration`].
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration { Duration::from_secs(self.shutdown_grace_secs) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_declared_table() {
        let config = ServerConfig::default();
        assert_eq!(config.name, "playwire");
        assert_eq!(config.environment, "dev");
        assert_eq!(config.port, 8309);
        assert_eq!(config.idle_timeout(), Duration::from_secs(30));
        assert_eq!(config.read_buffer_bytes, 1024);
        assert_eq!(config.operation_budget(), Duration::from_secs(5));
        assert_eq!(config.shutdown_grace(), Duration::from_secs(5));
    }

    #[test]
    fn missing_fields_fall_back_per_field() {
        let config = ServerConfig::from_toml_str("port = 9000\nenvironment = \"prod\"\n")
            .expect("parse");
        assert_eq!(config.port, 9000);
        assert_eq!(config.environment, "prod");
        assert_eq!(config.idle_timeout_secs, 30);
    }

    #[test]
    fn mistyped_field_is_rejected() {
        let err = ServerConfig::from_toml_str("port = \"not-a-port\"\n").expect_err("parse fails");
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn listen_addr_combines_host_and_port() {
        let config = ServerConfig::from_toml_str("host = \"127.0.0.1\"\nport = 4000\n")
            .expect("parse");
        assert_eq!(config.listen_addr().to_string(), "127.0.0.1:4000");
    }
}
