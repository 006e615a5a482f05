//! TOML-backed process configuration.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use crate::network::ServerCallbacks;
use crate::store::EntityId;

/// Process configuration, loaded once at startup.
///
/// Every field has a default, so an empty file (or no file at all) is
/// a valid development configuration — with no accounts, every login
/// is rejected.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// The socket address the server binds.
    pub address: SocketAddr,
    /// Worker threads for the scheduler pool.
    pub workers: usize,
    /// Maximum simultaneous connections, authenticated or not.
    pub max_connections: usize,
    /// Accounts as `login = "password"` pairs.
    pub accounts: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 7777).into(),
            workers: crate::sched::DEFAULT_WORKERS,
            max_connections: 1024,
            accounts: HashMap::new(),
        }
    }
}

impl Config {
    /// Loads and parses a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&text)
    }

    /// Parses a TOML configuration string.
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        toml::from_str(text).context("failed to parse configuration")
    }
}

/// [`ServerCallbacks`] backed by the configured account table.
pub(crate) struct ConfigAccounts {
    accounts: HashMap<String, String>,
}

impl ConfigAccounts {
    pub(crate) fn new(accounts: HashMap<String, String>) -> Self {
        Self { accounts }
    }
}

impl ServerCallbacks for ConfigAccounts {
    fn password_for(&self, login: &str) -> Option<String> {
        self.accounts.get(login).cloned()
    }

    fn session_opened(&self, login: &str, entity: EntityId) {
        tracing::info!(login, entity, "player session opened");
    }

    fn session_closed(&self, entity: EntityId) {
        tracing::info!(entity, "player session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.address.port(), 7777);
        assert_eq!(config.workers, crate::sched::DEFAULT_WORKERS);
        assert!(config.accounts.is_empty());
    }

    #[test]
    fn full_config_parses() {
        let config = Config::parse(
            r#"
            address = "127.0.0.1:4000"
            workers = 3
            max_connections = 64

            [accounts]
            my_login = "secret password"
            "#,
        )
        .unwrap();
        assert_eq!(config.address.port(), 4000);
        assert_eq!(config.workers, 3);
        assert_eq!(config.accounts["my_login"], "secret password");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(Config::parse("listen = \"0.0.0.0:1\"").is_err());
    }
}
