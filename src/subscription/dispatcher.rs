//! Callback delivery boundary
//!
//! Whatever the callback does, an error it returns or a panic it raises stops
//! here: it is logged and counted, and the channel moves on to the next frame.

use super::metrics::ChannelMetrics;
use super::Callback;
use crate::Error;
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, warn};

/// Result of handing one payload to the callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// No callback is set
    Skipped,
    Delivered,
    /// The callback failed; the error is reported, never propagated
    Failed(Error),
}

/// Invokes a channel's callback with one payload at a time.
#[derive(Debug, Clone)]
pub struct CallbackDispatcher {
    subscription: String,
    callback: Option<Callback>,
    metrics: Arc<ChannelMetrics>,
}

impl CallbackDispatcher {
    pub fn new(
        subscription: impl Into<String>,
        callback: Option<Callback>,
        metrics: Arc<ChannelMetrics>,
    ) -> Self {
        Self {
            subscription: subscription.into(),
            callback,
            metrics,
        }
    }

    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    /// Deliver `payload`, returning once the callback has finished.
    ///
    /// Synchronous callbacks run inline on the calling task.
    pub async fn dispatch(&self, payload: Value) -> DispatchOutcome {
        let Some(callback) = &self.callback else {
            return DispatchOutcome::Skipped;
        };

        match AssertUnwindSafe(callback.invoke(payload)).catch_unwind().await {
            Ok(Ok(())) => {
                ChannelMetrics::incr(&self.metrics.payloads_delivered);
                DispatchOutcome::Delivered
            }
            Ok(Err(e)) => {
                ChannelMetrics::incr(&self.metrics.callback_failures);
                warn!(
                    subscription = %self.subscription,
                    "Subscription callback returned an error: {:#}", e
                );
                DispatchOutcome::Failed(Error::Callback {
                    message: format!("{:#}", e),
                })
            }
            Err(panic) => {
                ChannelMetrics::incr(&self.metrics.callback_failures);
                let message = panic_message(panic.as_ref());
                error!(
                    subscription = %self.subscription,
                    "Subscription callback panicked: {}", message
                );
                DispatchOutcome::Failed(Error::Callback {
                    message: format!("callback panicked: {}", message),
                })
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
