use std::sync::atomic::{AtomicU64, Ordering};

/// Per-channel counters for monitoring
#[derive(Debug, Default)]
pub struct ChannelMetrics {
    pub frames_received: AtomicU64,
    pub payloads_delivered: AtomicU64,
    pub callback_failures: AtomicU64,
    pub connection_attempts: AtomicU64,
    pub reconnects: AtomicU64,
}

impl ChannelMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames_count(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    pub fn delivered_count(&self) -> u64 {
        self.payloads_delivered.load(Ordering::Relaxed)
    }

    pub fn callback_failure_count(&self) -> u64 {
        self.callback_failures.load(Ordering::Relaxed)
    }

    pub fn connection_attempt_count(&self) -> u64 {
        self.connection_attempts.load(Ordering::Relaxed)
    }

    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
