//! Broker startup configuration
//!
//! Usually read from a TOML file:
//!
//! ```toml
//! bind_address = "127.0.0.1"
//! port = 5445
//! shutdown_grace_ms = 5000
//!
//! [[queues]]
//! name = "exampleQueue"
//! durable = true
//! ```

use std::path::Path;
use std::time::Duration;

use emberq_types::{Error, QueueDecl, Result};
use serde::{Deserialize, Serialize};

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5445
}

fn default_shutdown_grace_ms() -> u64 {
    5000
}

/// Everything the broker needs to start
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerConfig {
    /// Address the transport listener binds
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Listener port (0 = ephemeral)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Queues created at startup
    #[serde(default)]
    pub queues: Vec<QueueDecl>,

    /// How long `stop` waits for connections before force-closing them
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            queues: Vec::new(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl BrokerConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::Config(e.to_string()))
    }

    /// Declare a queue to create at startup
    pub fn with_queue(mut self, name: impl Into<String>, durable: bool) -> Self {
        self.queues.push(QueueDecl::new(name, durable));
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace_ms = grace.as_millis().try_into().unwrap_or(u64::MAX);
        self
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = BrokerConfig::from_toml_str("").unwrap();
        assert_eq!(config, BrokerConfig::default());
        assert_eq!(config.port, 5445);
        assert_eq!(config.shutdown_grace(), Duration::from_secs(5));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
bind_address = "0.0.0.0"
port = 6000
shutdown_grace_ms = 250

[[queues]]
name = "exampleQueue"
durable = true

[[queues]]
name = "scratch"
"#
        )
        .unwrap();

        let config = BrokerConfig::load(file.path()).unwrap();
        assert_eq!(config.bind_address, "0.0.0.0");
        assert_eq!(config.port, 6000);
        assert_eq!(config.shutdown_grace_ms, 250);
        assert_eq!(
            config.queues,
            vec![QueueDecl::new("exampleQueue", true), QueueDecl::new("scratch", false)]
        );
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        assert!(matches!(
            BrokerConfig::from_toml_str("prot = 1"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            BrokerConfig::load("/definitely/not/here.toml"),
            Err(Error::Config(_))
        ));
    }
}
