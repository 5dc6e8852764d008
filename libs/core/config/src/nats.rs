use crate::{env_or_default, ConfigError, FromEnv};
use std::env;

pub const DEFAULT_NATS_URL: &str = "nats://127.0.0.1:4222";

/// NATS connection configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NatsConfig {
    pub url: String,
    /// Name reported to the server, shown in monitoring.
    pub client_name: Option<String>,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self::new(DEFAULT_NATS_URL)
    }
}

impl NatsConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client_name: None,
        }
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }
}

impl FromEnv for NatsConfig {
    /// Reads NATS_URL (default `nats://127.0.0.1:4222`) and NATS_CLIENT_NAME.
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            url: env_or_default("NATS_URL", DEFAULT_NATS_URL),
            client_name: env::var("NATS_CLIENT_NAME").ok().filter(|n| !n.is_empty()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nats_config_defaults() {
        temp_env::with_vars_unset(["NATS_URL", "NATS_CLIENT_NAME"], || {
            let config = NatsConfig::from_env().unwrap();
            assert_eq!(config, NatsConfig::default());
            assert_eq!(config.url, "nats://127.0.0.1:4222");
            assert!(config.client_name.is_none());
        });
    }

    #[test]
    fn test_nats_config_from_env() {
        temp_env::with_vars(
            [
                ("NATS_URL", Some("nats://nats:4222")),
                ("NATS_CLIENT_NAME", Some("jobs-worker")),
            ],
            || {
                let config = NatsConfig::from_env().unwrap();
                assert_eq!(config.url, "nats://nats:4222");
                assert_eq!(config.client_name.as_deref(), Some("jobs-worker"));
            },
        );
    }
}
