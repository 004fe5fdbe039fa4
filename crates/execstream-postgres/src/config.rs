//! Connection and event pipeline settings

use std::time::Duration;

use execstream_core::{BrokerConfig, Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

/// Postgres connection pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Connection URL
    pub url: String,
    /// Pool size; the event source holds one of these connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Seconds to wait for a pooled connection
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

fn default_max_connections() -> u32 {
    5
}

fn default_acquire_timeout_secs() -> u64 {
    30
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/execstream".to_string(),
            max_connections: default_max_connections(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
        }
    }
}

/// Event pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Notification channel the trigger publishes on
    #[serde(default = "default_channel")]
    pub channel: String,
    /// Per-subscriber queue capacity
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
    /// Capacity of the reported-error stream
    #[serde(default = "default_error_buffer")]
    pub error_buffer: usize,
}

fn default_channel() -> String {
    "execution_events".to_string()
}

fn default_subscriber_buffer() -> usize {
    64
}

fn default_error_buffer() -> usize {
    16
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel: default_channel(),
            subscriber_buffer: default_subscriber_buffer(),
            error_buffer: default_error_buffer(),
        }
    }
}

impl EventsConfig {
    /// Broker settings derived from these
    #[must_use]
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig::default().with_subscriber_buffer(self.subscriber_buffer)
    }
}

/// Open a connection pool
pub async fn connect_pool(config: &DatabaseConfig) -> Result<PgPool> {
    if config.max_connections < 2 {
        // One connection is held by the listener for its whole lifetime.
        return Err(Error::Internal(
            "database.max_connections must be at least 2".to_string(),
        ));
    }

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .connect(&config.url)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

    info!(
        max_connections = config.max_connections,
        "Postgres pool connected"
    );
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_defaults() {
        let config: EventsConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.channel, "execution_events");
        assert_eq!(config.subscriber_buffer, 64);
        assert_eq!(config.error_buffer, 16);
    }

    #[test]
    fn test_zero_buffer_is_clamped() {
        let config = EventsConfig {
            subscriber_buffer: 0,
            ..EventsConfig::default()
        };
        assert_eq!(config.broker_config().subscriber_buffer, 1);
    }

    #[test]
    fn test_database_defaults() {
        let config: DatabaseConfig =
            serde_json::from_str(r#"{"url": "postgres://db/exec"}"#).unwrap();
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.acquire_timeout_secs, 30);
    }
}
