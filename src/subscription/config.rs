use crate::backoff::BackoffPolicy;
use std::time::Duration;

/// Subscription configuration
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    /// Delay schedule between reconnection attempts
    pub backoff: BackoffPolicy,
    /// Give up after this many consecutive reconnects; `None` retries for as
    /// long as the channel is running.
    pub max_reconnect_attempts: Option<u32>,
    /// How long to wait for `connection_ack` before treating the attempt as a
    /// transport failure.
    pub ack_timeout: Option<Duration>,
    /// How long `stop()` waits for the task to wind down before aborting it
    pub shutdown_timeout: Duration,
    /// Bound on the best-effort close handshake
    pub close_timeout: Duration,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            max_reconnect_attempts: None,
            ack_timeout: Some(Duration::from_secs(30)),
            shutdown_timeout: Duration::from_secs(5),
            close_timeout: Duration::from_secs(2),
        }
    }
}
