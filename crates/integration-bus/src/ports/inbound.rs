//! # Inbound Port - EventBusApi
//!
//! Driving port used by services to publish integration events and to
//! attach handlers to them.

use async_trait::async_trait;

use crate::domain::{EventBusError, IntegrationEvent, IntegrationEventHandler};

/// Publish/subscribe API of the integration event bus.
///
/// # Example
///
/// ```rust,ignore
/// use integration_bus::ports::EventBusApi;
///
/// async fn example(bus: &impl EventBusApi) -> Result<(), EventBusError> {
///     bus.subscribe::<OrderCreated, ReserveStock>().await?;
///     bus.publish(&OrderCreated::new(42)).await?;
///     bus.unsubscribe::<OrderCreated, ReserveStock>().await
/// }
/// ```
#[async_trait]
pub trait EventBusApi: Send + Sync {
    /// Publish `event` with its event name as routing key.
    ///
    /// # Errors
    ///
    /// - `ConnectionUnavailable`: the broker could not be reached
    /// - `Broker`: the publish failed after the retry budget
    /// - `Serialization`: the event could not be encoded
    /// - `Disposed`: the connection was disposed
    async fn publish<E: IntegrationEvent>(&self, event: &E) -> Result<(), EventBusError>;

    /// Bind handler `H` to event `E`.
    ///
    /// # Errors
    ///
    /// - `DuplicateHandlerRegistration`: the pair is already bound
    /// - `ConnectionUnavailable` / `Broker`: the queue binding failed
    async fn subscribe<E, H>(&self) -> Result<(), EventBusError>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>;

    /// Remove the binding of handler `H` to event `E`; no-op if absent.
    ///
    /// # Errors
    ///
    /// `ConnectionUnavailable` / `Broker` if the queue unbind failed.
    async fn unsubscribe<E, H>(&self) -> Result<(), EventBusError>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>;
}
