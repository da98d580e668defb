//! # Integration Bus - Broker-Backed Integration Events
//!
//! Lets independent services exchange integration events through a message
//! broker: publishers emit typed events, subscribers register typed handlers
//! and receive every event of that type published by any service.
//!
//! ## Data Flow
//!
//! ```text
//! ┌──────────────┐                                   ┌──────────────┐
//! │  Service A   │  publish(&OrderCreated)           │  Service B   │
//! │              │ ──────┐                           │  handlers    │
//! └──────────────┘       │                           └──────────────┘
//!                        ▼                                  ↑
//!               ┌──────────────────┐   routing key   ┌──────┴───────┐
//!               │  EXCHANGE_NAME   │ ──────────────→ │ B's queue    │
//!               │  (direct)        │  "OrderCreated" │ (durable)    │
//!               └──────────────────┘                 └──────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - **Acked after dispatch:** exactly one ack per message, whatever the
//!   handler outcome, so a failed handler does not see the message again
//!   (at most once per handler; no DLQ, no retry). Messages delivered but
//!   not yet acked are requeued if the consumer channel is lost
//! - **Ordered dispatch:** handlers of one event run in registration order
//! - **Resilient connection:** exponential backoff on connect and publish,
//!   reconnect on broker notifications, consumer channel recreated on fault
//!
//! ## Module Structure (Hexagonal Architecture)
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  adapters/ - InMemoryBroker, HandlerContainer                   │
//! └─────────────────────────────────────────────────────────────────┘
//!                          ↑ implements ↑
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  ports/inbound.rs  - EventBusApi                                │
//! │  ports/outbound.rs - ConnectionFactory, Connection, Channel,    │
//! │                      HandlerResolver, HandlerScope              │
//! └─────────────────────────────────────────────────────────────────┘
//!                          ↑ uses ↑
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  service/ - BrokerConnection, EventBus, Dispatcher              │
//! │  domain/  - IntegrationEvent, SubscriptionRegistry,             │
//! │             ConnectionStateMachine, RetryPolicy, codec          │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! let broker = InMemoryBroker::default();
//! let config = EventBusConfig::for_queue("ordering");
//! let connection = BrokerConnection::new(Arc::new(broker), config.connect_policy());
//!
//! let container = Arc::new(HandlerContainer::new());
//! container.register::<OrderCreated, ReserveStock, _>(|| ReserveStock);
//!
//! let bus = EventBus::new(connection, container, &config).await?;
//! bus.subscribe::<OrderCreated, ReserveStock>().await?;
//! bus.publish(&OrderCreated::new(42)).await?;
//! ```

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod adapters;
pub mod config;
pub mod domain;
pub mod ports;
pub mod service;

pub use adapters::{HandlerContainer, InMemoryBroker};
pub use config::{ConfigError, EventBusConfig};
pub use domain::{
    BrokerError, ConnectionState, EventBusError, EventMetadata, IntegrationEvent,
    IntegrationEventHandler, RetryPolicy, SubscriptionRegistry,
};
pub use ports::EventBusApi;
pub use service::{BrokerConnection, EventBus};

/// Name of the durable direct exchange every service publishes to.
pub const EXCHANGE_NAME: &str = "PadQEventBus";

/// Payload fragment (matched case-insensitively) that makes the consumer
/// fail the message before dispatch. The message is still acknowledged.
pub const FAULT_INJECTION_MARKER: &str = "throw-fake-exception";
