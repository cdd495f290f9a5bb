//! Configuration for the minikv client

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Client configuration
///
/// Immutable once handed to [`crate::Client::new`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Meta server addresses, tried in order
    pub meta_servers: Vec<String>,

    /// Global default bound for one RPC attempt and for background
    /// resolution/refresh of a table
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: u64,

    /// Bound for a single attempt against one meta server
    #[serde(default = "default_meta_timeout")]
    pub meta_timeout_ms: u64,

    /// TCP connect timeout
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Retries allowed after a stale-routing error triggers a refresh
    #[serde(default = "default_max_refresh_retries")]
    pub max_refresh_retries: u32,
}

fn default_operation_timeout() -> u64 {
    10_000
}
fn default_meta_timeout() -> u64 {
    3_000
}
fn default_connect_timeout() -> u64 {
    1_000
}
fn default_max_refresh_retries() -> u32 {
    1
}

impl ClientConfig {
    pub fn new<I, S>(meta_servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            meta_servers: meta_servers.into_iter().map(Into::into).collect(),
            operation_timeout_ms: default_operation_timeout(),
            meta_timeout_ms: default_meta_timeout(),
            connect_timeout_ms: default_connect_timeout(),
            max_refresh_retries: default_max_refresh_retries(),
        }
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_meta_timeout(mut self, timeout: Duration) -> Self {
        self.meta_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_refresh_retries(mut self, retries: u32) -> Self {
        self.max_refresh_retries = retries;
        self
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn meta_timeout(&self) -> Duration {
        Duration::from_millis(self.meta_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.meta_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one meta server is required".into(),
            ));
        }
        if let Some(addr) = self.meta_servers.iter().find(|a| a.trim().is_empty()) {
            return Err(Error::InvalidConfig(format!(
                "empty meta server address: {:?}",
                addr
            )));
        }
        for (name, value) in [
            ("operation_timeout_ms", self.operation_timeout_ms),
            ("meta_timeout_ms", self.meta_timeout_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
        ] {
            if value == 0 {
                return Err(Error::InvalidConfig(format!("{} must be positive", name)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_json() {
        let cfg: ClientConfig =
            serde_json::from_str(r#"{"meta_servers": ["127.0.0.1:34601"]}"#).unwrap();
        assert_eq!(cfg, ClientConfig::new(["127.0.0.1:34601"]));
        assert_eq!(cfg.operation_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.max_refresh_retries, 1);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate() {
        assert!(ClientConfig::new(Vec::<String>::new()).validate().is_err());
        assert!(ClientConfig::new(["a:1", " "]).validate().is_err());
        assert!(ClientConfig::new(["a:1"])
            .with_meta_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }
}
