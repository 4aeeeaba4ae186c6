//! Unraid API client
//!
//! The client holds what every subscription needs from its owner: where the
//! GraphQL endpoint lives, whether it is served over TLS, and how to obtain a
//! bearer token. It also owns the per-client [`SubscriptionRegistry`].

use crate::auth::Authenticator;
use crate::subscription::{
    Callback, SubscriptionChannel, SubscriptionConfig, SubscriptionRegistry,
};
use crate::{Error, Result};
use serde_json::{Map, Value};
use std::net::Ipv6Addr;
use std::sync::Arc;
use url::Url;

/// Path of the GraphQL endpoint, shared by HTTP and WebSocket transports
pub const GRAPHQL_PATH: &str = "/graphql";

/// Configuration for the Unraid client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub use_ssl: bool,
    pub api_key: Option<String>,
    pub subscriptions: SubscriptionConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 443,
            use_ssl: true,
            api_key: None,
            subscriptions: SubscriptionConfig::default(),
        }
    }
}

/// Location of the GraphQL endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub use_ssl: bool,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, use_ssl: bool) -> Self {
        Self {
            host: host.into(),
            port,
            use_ssl,
        }
    }

    /// `http[s]://host:port/graphql`
    pub fn graphql_url(&self) -> Result<Url> {
        let scheme = if self.use_ssl { "https" } else { "http" };
        self.url(scheme)
    }

    /// `ws[s]://host:port/graphql`, mirroring the TLS setting of the HTTP side
    pub fn subscription_url(&self) -> Result<Url> {
        let scheme = if self.use_ssl { "wss" } else { "ws" };
        self.url(scheme)
    }

    fn url(&self, scheme: &str) -> Result<Url> {
        if self.host.is_empty() {
            return Err(Error::Configuration {
                message: "Host must not be empty".to_string(),
            });
        }

        // Bare IPv6 literals need brackets in the authority
        let host = match self.host.parse::<Ipv6Addr>() {
            Ok(ip) => format!("[{}]", ip),
            Err(_) => self.host.clone(),
        };
        let mut url = Url::parse(&format!("{}://{}", scheme, host))?;
        url.set_port(Some(self.port))
            .map_err(|_| Error::Configuration {
                message: format!("Cannot set port {} on host '{}'", self.port, self.host),
            })?;
        url.set_path(GRAPHQL_PATH);
        Ok(url)
    }
}

/// What a channel borrows from the client that owns it
#[derive(Debug, Clone)]
pub struct ClientContext {
    pub endpoint: Endpoint,
    pub authenticator: Authenticator,
}

/// Main Unraid client
#[derive(Debug)]
pub struct Client {
    context: Arc<ClientContext>,
    subscriptions: SubscriptionRegistry,
}

impl Client {
    /// Create a new client with the given configuration
    pub fn new(config: ClientConfig) -> Result<Self> {
        let authenticator = match &config.api_key {
            Some(key) => Authenticator::api_key(key.clone()),
            None => Authenticator::unauthenticated(),
        };
        Self::with_authenticator(config, authenticator)
    }

    /// Create a client whose tokens come from a custom authenticator
    pub fn with_authenticator(config: ClientConfig, authenticator: Authenticator) -> Result<Self> {
        let endpoint = Endpoint::new(config.host, config.port, config.use_ssl);

        // Surface a bad host now rather than on the first connection attempt
        let url = endpoint.subscription_url()?;
        tracing::debug!("Subscription endpoint: {}", url);

        let context = Arc::new(ClientContext {
            endpoint,
            authenticator,
        });
        let subscriptions = SubscriptionRegistry::new(context.clone(), config.subscriptions);

        Ok(Self {
            context,
            subscriptions,
        })
    }

    /// Create a client builder
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.context.endpoint
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.context.authenticator
    }

    /// Access the subscription registry
    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.subscriptions
    }

    /// Start a named subscription; see [`SubscriptionRegistry::subscribe`].
    pub fn subscribe(
        &self,
        name: &str,
        query: &str,
        variables: Map<String, Value>,
        callback: Option<Callback>,
    ) -> Result<Arc<SubscriptionChannel>> {
        self.subscriptions.subscribe(name, query, variables, callback)
    }

    pub async fn unsubscribe(&self, name: &str) -> Result<()> {
        self.subscriptions.unsubscribe(name).await
    }

    pub async fn stop_all(&self) {
        self.subscriptions.stop_all().await
    }
}

/// Builder for creating a client
pub struct ClientBuilder {
    config: ClientConfig,
    authenticator: Option<Authenticator>,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
            authenticator: None,
        }
    }

    /// Start from an existing configuration
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn use_ssl(mut self, use_ssl: bool) -> Self {
        self.config.use_ssl = use_ssl;
        self
    }

    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.config.api_key = Some(api_key.into());
        self
    }

    /// Replace the API-key authenticator with a custom token source
    pub fn authenticator(mut self, authenticator: Authenticator) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn subscription_config(mut self, config: SubscriptionConfig) -> Self {
        self.config.subscriptions = config;
        self
    }

    pub fn build(self) -> Result<Client> {
        match self.authenticator {
            Some(authenticator) => Client::with_authenticator(self.config, authenticator),
            None => Client::new(self.config),
        }
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
