//! Real-time subscription infrastructure
//!
//! A [`SubscriptionChannel`] keeps one GraphQL subscription alive across any
//! number of physical WebSocket connections; a [`SubscriptionRegistry`] keeps a
//! client's channels under unique names; a [`CallbackDispatcher`] sits between
//! the two and the user's code so a failing callback never takes a channel down.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use unraid_subscriptions::auth::Authenticator;
//! use unraid_subscriptions::client::{ClientContext, Endpoint};
//! use unraid_subscriptions::subscription::{
//!     Callback, SubscriptionChannel, SubscriptionConfig, SubscriptionRequest,
//! };
//!
//! # async fn demo() {
//! let context = Arc::new(ClientContext {
//!     endpoint: Endpoint::new("tower.local", 443, true),
//!     authenticator: Authenticator::api_key("key"),
//! });
//! let request = SubscriptionRequest::new("subscription { info { os { uptime } } }")
//!     .name("uptime")
//!     .callback(Callback::from_async(|payload| async move {
//!         println!("{}", payload);
//!         Ok(())
//!     }));
//!
//! let channel = SubscriptionChannel::new(context, request, SubscriptionConfig::default());
//! channel.start();
//! // ...
//! channel.stop().await;
//! # }
//! ```

mod channel;
mod config;
mod dispatcher;
mod metrics;
mod registry;


pub use channel::{ChannelStatus, SubscriptionChannel};
pub use config::SubscriptionConfig;
pub use dispatcher::{CallbackDispatcher, DispatchOutcome};
pub use metrics::ChannelMetrics;
pub use registry::SubscriptionRegistry;

use crate::invoke::Invocable;
use crate::protocol::StartPayload;
use serde_json::{Map, Value};

/// User callback receiving each `payload.data` value; sync or async.
pub type Callback = Invocable<Value, anyhow::Result<()>>;

/// Everything needed to run one subscription
#[derive(Debug, Clone)]
pub struct SubscriptionRequest {
    pub name: Option<String>,
    pub query: String,
    pub variables: Map<String, Value>,
    pub operation_name: Option<String>,
    pub callback: Option<Callback>,
}

impl SubscriptionRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            name: None,
            query: query.into(),
            variables: Map::new(),
            operation_name: None,
            callback: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn variables(mut self, variables: Map<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    pub fn operation_name(mut self, operation_name: impl Into<String>) -> Self {
        self.operation_name = Some(operation_name.into());
        self
    }

    pub fn callback(mut self, callback: Callback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub(crate) fn start_payload(&self) -> StartPayload {
        StartPayload {
            query: self.query.clone(),
            variables: self.variables.clone(),
            operation_name: self.operation_name.clone(),
        }
    }
}
