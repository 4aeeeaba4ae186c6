use super::channel::SubscriptionChannel;
use super::config::SubscriptionConfig;
use super::{Callback, SubscriptionRequest};
use crate::client::ClientContext;
use crate::{Error, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info};

/// Named subscriptions owned by one client
#[derive(Debug)]
pub struct SubscriptionRegistry {
    context: Arc<ClientContext>,
    config: SubscriptionConfig,
    channels: DashMap<String, Arc<SubscriptionChannel>>,
}

impl SubscriptionRegistry {
    pub fn new(context: Arc<ClientContext>, config: SubscriptionConfig) -> Self {
        Self {
            context,
            config,
            channels: DashMap::new(),
        }
    }

    /// Create and start a channel under `name`.
    ///
    /// Fails if the name is taken; the existing channel is left untouched.
    /// Must be called from within a tokio runtime.
    pub fn subscribe(
        &self,
        name: &str,
        query: &str,
        variables: Map<String, Value>,
        callback: Option<Callback>,
    ) -> Result<Arc<SubscriptionChannel>> {
        let mut request = SubscriptionRequest::new(query).name(name).variables(variables);
        request.callback = callback;
        self.subscribe_request(request)
    }

    /// Like [`subscribe`](Self::subscribe) with full control over the request.
    /// The request must carry a name.
    pub fn subscribe_request(&self, request: SubscriptionRequest) -> Result<Arc<SubscriptionChannel>> {
        let name = request
            .name
            .clone()
            .ok_or_else(|| Error::invalid_argument("Subscription name is required"))?;

        match self.channels.entry(name) {
            Entry::Occupied(entry) => Err(Error::invalid_argument(format!(
                "Subscription '{}' already exists",
                entry.key()
            ))),
            Entry::Vacant(entry) => {
                let channel = Arc::new(SubscriptionChannel::new(
                    Arc::clone(&self.context),
                    request,
                    self.config.clone(),
                ));
                channel.start();
                info!(subscription = %entry.key(), "Registered subscription");
                entry.insert(Arc::clone(&channel));
                Ok(channel)
            }
        }
    }

    /// Stop the named channel and forget it.
    pub async fn unsubscribe(&self, name: &str) -> Result<()> {
        let channel = self
            .channels
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| {
                Error::invalid_argument(format!("Subscription '{}' does not exist", name))
            })?;

        channel.stop().await;
        // Only remove the entry we stopped; the name may have been reused meanwhile
        self.channels
            .remove_if(name, |_, current| Arc::ptr_eq(current, &channel));
        info!(subscription = %name, "Unsubscribed");
        Ok(())
    }

    /// Stop every channel concurrently and empty the registry.
    pub async fn stop_all(&self) {
        let channels: Vec<(String, Arc<SubscriptionChannel>)> = self
            .channels
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        if channels.is_empty() {
            return;
        }

        debug!("Stopping {} subscriptions", channels.len());
        futures::future::join_all(channels.iter().map(|(_, channel)| channel.stop())).await;

        for (name, channel) in &channels {
            self.channels
                .remove_if(name, |_, current| Arc::ptr_eq(current, channel));
        }
        info!("Stopped {} subscriptions", channels.len());
    }

    pub fn get_subscription(&self, name: &str) -> Result<Arc<SubscriptionChannel>> {
        self.channels
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| {
                Error::invalid_argument(format!("Subscription '{}' does not exist", name))
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Authenticator;
    use crate::client::Endpoint;
    use crate::subscription::ChannelStatus;
    use tokio_test::{assert_err, assert_ok};

    // Unauthenticated, so channels fail before touching the network
    fn registry() -> SubscriptionRegistry {
        let context = Arc::new(ClientContext {
            endpoint: Endpoint::new("test-host", 443, true),
            authenticator: Authenticator::unauthenticated(),
        });
        SubscriptionRegistry::new(context, SubscriptionConfig::default())
    }

    #[tokio::test]
    async fn test_subscribe_registers_and_starts() {
        let registry = registry();
        let channel = assert_ok!(registry.subscribe(
            "test_sub",
            "subscription { test }",
            Map::new(),
            None
        ));

        assert!(registry.contains("test_sub"));
        assert_eq!(registry.len(), 1);
        assert_eq!(channel.name(), "test_sub");
        assert!(Arc::ptr_eq(&channel, &registry.get_subscription("test_sub").unwrap()));

        // Token lookup fails, which is terminal
        let status = channel.finished().await;
        assert!(matches!(status, ChannelStatus::Failed(Error::Authentication { .. })));
    }

    #[tokio::test]
    async fn test_duplicate_name_is_rejected() {
        let registry = registry();
        let first = registry
            .subscribe("test_sub", "subscription { test }", Map::new(), None)
            .unwrap();

        let err = assert_err!(registry.subscribe(
            "test_sub",
            "subscription { other }",
            Map::new(),
            None
        ));
        assert_eq!(
            err,
            Error::invalid_argument("Subscription 'test_sub' already exists")
        );

        // Original entry untouched
        let current = registry.get_subscription("test_sub").unwrap();
        assert!(Arc::ptr_eq(&first, &current));
        assert_eq!(current.query(), "subscription { test }");
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_channel() {
        let registry = registry();
        let channel = registry
            .subscribe("test_sub", "subscription { test }", Map::new(), None)
            .unwrap();

        assert_ok!(registry.unsubscribe("test_sub").await);
        assert!(!registry.contains("test_sub"));
        assert!(!channel.is_running());
        assert!(!channel.has_task());

        // The name is free again
        assert_ok!(registry.subscribe("test_sub", "subscription { test }", Map::new(), None));
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_name_fails() {
        let registry = registry();
        let err = registry.unsubscribe("nonexistent").await.unwrap_err();
        assert_eq!(
            err,
            Error::invalid_argument("Subscription 'nonexistent' does not exist")
        );
    }

    #[test]
    fn test_get_unknown_subscription_fails() {
        let registry = registry();
        assert!(matches!(
            registry.get_subscription("nonexistent"),
            Err(Error::InvalidArgument { .. })
        ));
    }

    #[tokio::test]
    async fn test_stop_all_empties_registry() {
        let registry = registry();
        let channels: Vec<_> = ["sub1", "sub2", "sub3"]
            .iter()
            .map(|name| {
                registry
                    .subscribe(name, "subscription { test }", Map::new(), None)
                    .unwrap()
            })
            .collect();
        assert_eq!(registry.names(), vec!["sub1", "sub2", "sub3"]);

        registry.stop_all().await;

        assert!(registry.is_empty());
        for channel in channels {
            assert!(!channel.is_running());
            assert!(!channel.has_task());
        }

        // Nothing left to stop
        registry.stop_all().await;
    }

    #[tokio::test]
    async fn test_request_without_name_is_rejected() {
        let registry = registry();
        let err = registry
            .subscribe_request(SubscriptionRequest::new("subscription { test }"))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
        assert!(registry.is_empty());
    }
}
