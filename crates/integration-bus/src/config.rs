//! Event bus configuration from environment variables.

use std::env;
use std::time::Duration;

use thiserror::Error;

use crate::domain::RetryPolicy;

/// Default broker host.
pub const DEFAULT_HOST: &str = "localhost";

/// Default consumer queue name.
pub const DEFAULT_QUEUE_NAME: &str = "integration-events";

/// Queue names the broker reserves for itself.
const RESERVED_QUEUE_PREFIX: &str = "amq.";

/// Configuration for one event bus instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBusConfig {
    /// Broker host name
    pub host: String,

    /// Durable queue consumed by this service (one per subscribing service)
    pub queue_name: String,

    /// Retries after a failed connection attempt
    pub connect_retry_count: u32,

    /// Retries after a failed publish attempt
    pub publish_retry_count: u32,

    /// Backoff unit; the n-th retry waits `retry_base_delay * 2^n`
    pub retry_base_delay: Duration,

    /// Re-bind every registered event after the consumer channel is recreated
    pub rebind_on_recovery: bool,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            connect_retry_count: RetryPolicy::DEFAULT_RETRY_COUNT,
            publish_retry_count: RetryPolicy::DEFAULT_RETRY_COUNT,
            retry_base_delay: RetryPolicy::DEFAULT_BASE_DELAY,
            rebind_on_recovery: false,
        }
    }
}

impl EventBusConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `EVENTBUS_HOST`: Broker host (default: localhost)
    /// - `EVENTBUS_QUEUE`: Consumer queue name (default: integration-events)
    /// - `EVENTBUS_CONNECT_RETRIES`: Connection retries (default: 5)
    /// - `EVENTBUS_PUBLISH_RETRIES`: Publish retries (default: 5)
    /// - `EVENTBUS_RETRY_BASE_MS`: Backoff unit in milliseconds (default: 1000)
    /// - `EVENTBUS_REBIND_ON_RECOVERY`: Re-bind after channel recovery (default: false)
    ///
    /// Unparseable values fall back to their defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            host: env::var("EVENTBUS_HOST").unwrap_or(defaults.host),

            queue_name: env::var("EVENTBUS_QUEUE").unwrap_or(defaults.queue_name),

            connect_retry_count: env::var("EVENTBUS_CONNECT_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.connect_retry_count),

            publish_retry_count: env::var("EVENTBUS_PUBLISH_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.publish_retry_count),

            retry_base_delay: env::var("EVENTBUS_RETRY_BASE_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_base_delay),

            rebind_on_recovery: env::var("EVENTBUS_REBIND_ON_RECOVERY")
                .map(|v| v.to_lowercase() == "true" || v == "1")
                .unwrap_or(defaults.rebind_on_recovery),
        }
    }

    /// Config for `queue_name` with every other field defaulted.
    pub fn for_queue(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            ..Self::default()
        }
    }

    /// Reject values the broker would refuse.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if self.queue_name.trim().is_empty() {
            return Err(ConfigError::EmptyQueueName);
        }
        if self.queue_name.starts_with(RESERVED_QUEUE_PREFIX) {
            return Err(ConfigError::ReservedQueueName(self.queue_name.clone()));
        }
        Ok(())
    }

    /// Retry policy for establishing the broker connection.
    pub fn connect_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.connect_retry_count, self.retry_base_delay)
    }

    /// Retry policy for publishing one event.
    pub fn publish_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.publish_retry_count, self.retry_base_delay)
    }
}

/// Configuration errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Broker host must not be empty (set EVENTBUS_HOST)")]
    EmptyHost,

    #[error("Queue name must not be empty (set EVENTBUS_QUEUE)")]
    EmptyQueueName,

    #[error("Queue name '{0}' uses the broker-reserved 'amq.' prefix")]
    ReservedQueueName(String),
}
