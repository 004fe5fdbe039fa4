use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Capacity of each subscriber's delivery queue
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

fn default_subscriber_buffer() -> usize {
    64
}

impl BrokerConfig {
    /// Set the per-subscriber queue capacity (at least 1)
    #[must_use]
    pub fn with_subscriber_buffer(mut self, capacity: usize) -> Self {
        self.subscriber_buffer = capacity.max(1);
        self
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

/// Broker sequencing errors
///
/// These indicate a caller bug (wrong call order), not a runtime condition
/// worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// `start` was called more than once
    #[error("broker already started")]
    AlreadyStarted,
    /// `publish` was called before `start`
    #[error("broker not started")]
    NotStarted,
    /// `publish` was called after `stop`
    #[error("broker stopped")]
    Stopped,
}
