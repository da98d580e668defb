//! Outbound (Driven) ports for the integration event bus.
//!
//! The bus reaches the message broker only through [`ConnectionFactory`],
//! [`Connection`] and [`Channel`], and obtains handler instances only
//! through [`HandlerResolver`]. Broker adapters live in `crate::adapters`.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use crate::domain::{BrokerError, ResolvedHandler};

/// Exchange routing type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Route on exact routing-key match.
    Direct,
}

/// Per-message publish flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishProperties {
    /// Delivery mode 2: the broker stores the message on disk.
    pub persistent: bool,
    /// Ask the broker to report messages that match no queue.
    pub mandatory: bool,
}

impl PublishProperties {
    /// Persistent and mandatory.
    #[must_use]
    pub fn persistent() -> Self {
        Self {
            persistent: true,
            mandatory: true,
        }
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Channel-scoped tag used to acknowledge the message.
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    /// Whether the broker delivered this message before without an ack.
    pub redelivered: bool,
}

/// Connection-level broker notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The connection was shut down.
    Shutdown { reason: String },
    /// A callback raised an error on the broker client.
    CallbackException { message: String },
    /// The broker stopped accepting publishes (resource alarm).
    Blocked { reason: String },
}

/// Channel-level failure reported while consuming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelFault {
    pub message: String,
}

/// Opens physical broker connections.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Open a new connection.
    ///
    /// # Errors
    ///
    /// Transient [`BrokerError`]s are retried by the caller.
    async fn connect(&self) -> Result<Arc<dyn Connection>, BrokerError>;

    /// Broker host, for logging.
    fn host(&self) -> &str;
}

/// One physical broker connection.
#[async_trait]
pub trait Connection: Send + Sync {
    fn is_open(&self) -> bool;

    /// Open a lightweight channel over this connection.
    async fn create_channel(&self) -> Result<Arc<dyn Channel>, BrokerError>;

    /// Subscribe to shutdown, callback-exception and blocked notifications.
    fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// A broker channel.
#[async_trait]
pub trait Channel: Send + Sync {
    fn is_open(&self) -> bool;

    /// Declare an exchange; idempotent for matching arguments.
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), BrokerError>;

    /// Declare a queue; idempotent for matching arguments.
    async fn declare_queue(
        &self,
        name: &str,
        durable: bool,
        exclusive: bool,
        auto_delete: bool,
    ) -> Result<(), BrokerError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: PublishProperties,
        body: Vec<u8>,
    ) -> Result<(), BrokerError>;

    /// Start consuming `queue` with manual acknowledgment.
    ///
    /// The receiver ends when the channel closes.
    async fn consume(&self, queue: &str) -> Result<mpsc::UnboundedReceiver<Delivery>, BrokerError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Subscribe to callback exceptions raised on this channel.
    fn faults(&self) -> broadcast::Receiver<ChannelFault>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Produces per-message resolution scopes.
pub trait HandlerResolver: Send + Sync {
    /// Open a scope lasting for the dispatch of one message.
    fn begin_scope(&self) -> Box<dyn HandlerScope>;
}

/// Handler instances for one message. Dropping the scope releases them.
pub trait HandlerScope: Send {
    /// Instance for `handler_name`, or `None` if nothing is registered.
    fn resolve(&self, handler_name: &str) -> Option<ResolvedHandler>;
}
