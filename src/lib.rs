//! Unraid GraphQL subscriptions
//!
//! A client-side engine for long-lived GraphQL subscriptions against the Unraid
//! API, spoken over WebSocket with the `graphql-ws` protocol. Each subscription
//! runs as its own tokio task that authenticates, performs the
//! `connection_init` / `connection_ack` handshake, streams `data` frames to a
//! user callback, and reconnects with backoff when the transport drops.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use unraid_subscriptions::{Callback, Client};
//!
//! #[tokio::main]
//! async fn main() -> unraid_subscriptions::Result<()> {
//!     let client = Client::builder()
//!         .host("tower.local")
//!         .port(443)
//!         .use_ssl(true)
//!         .api_key("your-api-key")
//!         .build()?;
//!
//!     client.subscribe(
//!         "array",
//!         "subscription { arraySubscription { state } }",
//!         Default::default(),
//!         Some(Callback::from_fn(|payload| {
//!             println!("array changed: {}", payload);
//!             Ok(())
//!         })),
//!     )?;
//!
//!     tokio::signal::ctrl_c().await.ok();
//!     client.stop_all().await;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod backoff;
pub mod client;
pub mod config;
pub mod invoke;
pub mod protocol;
pub mod subscription;

pub use auth::{Authenticator, TokenAccessor};
pub use backoff::{BackoffPolicy, JitterPolicy};
pub use client::{Client, ClientBuilder, ClientConfig, Endpoint};
pub use invoke::Invocable;
pub use protocol::{ProtocolMessage, StartPayload, SubscriptionId};
pub use subscription::{
    Callback, CallbackDispatcher, ChannelMetrics, ChannelStatus, SubscriptionChannel,
    SubscriptionConfig, SubscriptionRegistry, SubscriptionRequest,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the crate
///
/// Variants carry plain messages so that a channel can keep the last failure
/// around for inspection after its task has exited.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("Authentication error: {message}")]
    Authentication { message: String },

    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Subscription error: {message}")]
    Subscription { message: String },

    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Parse error: {message}")]
    Parse { message: String },

    #[error("Callback error: {message}")]
    Callback { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl Error {
    pub fn authentication(message: impl Into<String>) -> Self {
        Error::Authentication {
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Error::Connection {
            message: message.into(),
        }
    }

    pub fn subscription(message: impl Into<String>) -> Self {
        Error::Subscription {
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Error::InvalidArgument {
            message: message.into(),
        }
    }

    /// Only transport failures are worth another connection attempt. A
    /// rejected credential or a query-level failure will recur on reconnect.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Connection { .. })
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;

        match error {
            WsError::ConnectionClosed | WsError::AlreadyClosed => Error::Connection {
                message: "WebSocket connection closed".to_string(),
            },
            WsError::Http(response) if matches!(response.status().as_u16(), 401 | 403) => {
                Error::Authentication {
                    message: format!("WebSocket upgrade rejected with {}", response.status()),
                }
            }
            WsError::Url(e) => Error::Configuration {
                message: format!("Invalid WebSocket URL: {}", e),
            },
            other => Error::Connection {
                message: format!("WebSocket transport failed: {}", other),
            },
        }
    }
}

impl From<url::ParseError> for Error {
    fn from(error: url::ParseError) -> Self {
        Error::Configuration {
            message: format!("Invalid URL: {}", error),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Parse {
            message: format!("JSON parse error: {}", error),
        }
    }
}

impl From<::config::ConfigError> for Error {
    fn from(error: ::config::ConfigError) -> Self {
        Error::Configuration {
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_only_connection_errors_are_retryable() {
        assert!(Error::connection("reset by peer").is_retryable());
        assert!(!Error::authentication("expired").is_retryable());
        assert!(!Error::subscription("bad token").is_retryable());
        assert!(!Error::invalid_argument("dup").is_retryable());
    }

    #[test]
    fn test_tungstenite_close_maps_to_connection_error() {
        let err: Error = tokio_tungstenite::tungstenite::Error::ConnectionClosed.into();
        assert!(matches!(err, Error::Connection { .. }));
        assert!(err.to_string().contains("closed"));
    }

    #[test]
    fn test_rejected_upgrade_maps_to_authentication_error() {
        use tokio_tungstenite::tungstenite::http::Response;

        let response = Response::builder().status(401).body(None).unwrap();
        let err: Error = tokio_tungstenite::tungstenite::Error::Http(response).into();
        assert!(matches!(err, Error::Authentication { .. }));
        assert!(!err.is_retryable());

        let response = Response::builder().status(502).body(None).unwrap();
        let err: Error = tokio_tungstenite::tungstenite::Error::Http(response).into();
        assert!(err.is_retryable());
    }
}
