//! # Domain Layer - Integration Event Bus
//!
//! Broker-independent logic: event and handler contracts, the subscription
//! registry, the connection state machine and the retry policy.
//!
//! ## Components
//!
//! - `event`: IntegrationEvent trait, EventMetadata
//! - `handler`: IntegrationEventHandler trait, type-erased invokers
//! - `registry`: SubscriptionRegistry, SubscriptionBinding, EventType
//! - `state`: ConnectionState, ConnectionStateMachine
//! - `retry`: RetryPolicy with exponential backoff
//! - `codec`: JSON payloads (case-insensitive on decode)
//! - `errors`: EventBusError, BrokerError, TransitionError

pub mod codec;
pub mod errors;
pub mod event;
pub mod handler;
pub mod registry;
pub mod retry;
pub mod state;

pub use errors::*;
pub use event::*;
pub use handler::*;
pub use registry::*;
pub use retry::*;
pub use state::*;
