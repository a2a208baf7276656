//! Configuration for the minigd daemon

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

/// Environment prefix for overrides, e.g. `MINIGD_BIND_ADDR`
const ENV_PREFIX: &str = "MINIGD";

/// Default config file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "minigd.toml";

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node ID (stable UUID of this daemon)
    #[serde(default = "Uuid::new_v4")]
    pub node_id: Uuid,

    /// Human-readable peer name
    #[serde(default = "default_name")]
    pub name: String,

    /// Bind address for the internal RPC server
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// Address other peers use to reach this node (defaults to bind_addr)
    #[serde(default)]
    pub advertise_addr: Option<String>,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Transaction engine tuning
    #[serde(default)]
    pub txn: TxnConfig,
}

fn default_name() -> String {
    "localhost".to_string()
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 24007))
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Transaction engine timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxnConfig {
    /// Deadline for a single step dispatch to one node
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_ms: u64,

    /// How long the lock step waits for a busy lock
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_ms: u64,

    /// Lease TTL on a held lock; renewed at a third of this
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_ms: u64,

    /// Overall deadline for one transaction
    #[serde(default = "default_txn_timeout")]
    pub txn_timeout_ms: u64,
}

fn default_rpc_timeout() -> u64 {
    10_000
}
fn default_lock_timeout() -> u64 {
    5_000
}
fn default_lock_ttl() -> u64 {
    15_000
}
fn default_txn_timeout() -> u64 {
    60_000
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            rpc_timeout_ms: default_rpc_timeout(),
            lock_timeout_ms: default_lock_timeout(),
            lock_ttl_ms: default_lock_ttl(),
            txn_timeout_ms: default_txn_timeout(),
        }
    }
}

impl TxnConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    pub fn txn_timeout(&self) -> Duration {
        Duration::from_millis(self.txn_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: Uuid::new_v4(),
            name: default_name(),
            bind_addr: default_bind_addr(),
            advertise_addr: None,
            log_level: default_log_level(),
            txn: TxnConfig::default(),
        }
    }
}

impl Config {
    /// Load config from an optional TOML file, then `MINIGD_*` env vars
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let file = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        let settings = config::Config::builder()
            .add_source(config::File::from(file).required(path.is_some()))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .map_err(|e| crate::Error::InvalidConfig(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| crate::Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.name.trim().is_empty() {
            return Err(crate::Error::InvalidConfig("name must not be empty".into()));
        }
        if self.txn.lock_ttl_ms < 3 {
            return Err(crate::Error::InvalidConfig(
                "txn.lock_ttl_ms is too small to renew".into(),
            ));
        }
        if self.txn.rpc_timeout_ms == 0 || self.txn.txn_timeout_ms == 0 {
            return Err(crate::Error::InvalidConfig(
                "txn timeouts must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Address peers dial to reach this daemon
    pub fn advertised(&self) -> String {
        match &self.advertise_addr {
            Some(addr) => addr.clone(),
            None => format!("http://{}", self.bind_addr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("minigd.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            r#"
node_id = "6f1d2c4e-8a7b-4c3d-9e0f-112233445566"
name = "node-a"
bind_addr = "127.0.0.1:24010"

[txn]
rpc_timeout_ms = 250
"#
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.name, "node-a");
        assert_eq!(
            config.node_id.to_string(),
            "6f1d2c4e-8a7b-4c3d-9e0f-112233445566"
        );
        assert_eq!(config.txn.rpc_timeout(), Duration::from_millis(250));
        assert_eq!(config.txn.lock_ttl_ms, 15_000);
        assert_eq!(config.advertised(), "http://127.0.0.1:24010");
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let mut config = Config::default();
        config.txn.rpc_timeout_ms = 0;
        assert!(config.validate().is_err());
    }
}
