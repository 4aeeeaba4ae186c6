//! Environment configuration
//!
//! `UNRAID_HOST`, `UNRAID_PORT`, `UNRAID_USE_SSL` and `UNRAID_API_KEY` fill a
//! [`ClientConfig`]; anything unset keeps its default.

use crate::client::ClientConfig;
use crate::Result;
use ::config::{Config, Environment};
use serde::Deserialize;

/// Prefix shared by every environment variable the client reads
pub const ENV_PREFIX: &str = "UNRAID";

#[derive(Debug, Default, Deserialize)]
struct EnvSettings {
    host: Option<String>,
    port: Option<u16>,
    use_ssl: Option<bool>,
    api_key: Option<String>,
}

impl ClientConfig {
    /// Load the connection settings from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_environment(Environment::with_prefix(ENV_PREFIX))
    }

    fn from_environment(source: Environment) -> Result<Self> {
        let settings: EnvSettings = Config::builder()
            .add_source(source)
            .build()?
            .try_deserialize()?;

        let mut config = ClientConfig::default();
        if let Some(host) = settings.host {
            config.host = host;
        }
        if let Some(port) = settings.port {
            config.port = port;
        }
        if let Some(use_ssl) = settings.use_ssl {
            config.use_ssl = use_ssl;
        }
        config.api_key = settings.api_key.filter(|key| !key.is_empty());

        tracing::debug!(
            host = %config.host,
            port = config.port,
            use_ssl = config.use_ssl,
            "Loaded client configuration from environment"
        );
        Ok(config)
    }
}
