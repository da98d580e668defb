//! Typed handlers and their type-erased invokers.
//!
//! The registry stores one [`HandlerInvoker`] per (event, handler) pair.
//! At dispatch time the invoker receives a resolved handler instance and a
//! decoded event as `Any` values and restores their concrete types, so a
//! dispatch is a lookup plus one polymorphic call.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;

use super::event::{short_type_name, IntegrationEvent};

/// A handler instance produced by a [`HandlerScope`](crate::ports::outbound::HandlerScope).
pub type ResolvedHandler = Arc<dyn Any + Send + Sync>;

/// A payload decoded into its registered event type.
pub type DecodedEvent = Box<dyn Any + Send>;

/// Consumer-side logic for one integration event type.
///
/// Errors are logged by the bus and never redelivered: the message is
/// acknowledged whether or not the handler succeeds.
#[async_trait]
pub trait IntegrationEventHandler<E: IntegrationEvent>: Send + Sync + 'static {
    /// Process one event.
    async fn handle(&self, event: E) -> anyhow::Result<()>;

    /// Handler name, unique per event type.
    fn handler_name() -> &'static str
    where
        Self: Sized,
    {
        short_type_name::<Self>()
    }
}

/// Type-erased call into a concrete handler.
#[async_trait]
pub trait HandlerInvoker: Send + Sync {
    async fn invoke(&self, handler: ResolvedHandler, event: DecodedEvent) -> anyhow::Result<()>;
}

/// Invoker for handler `H` of event `E`.
pub struct TypedInvoker<E, H> {
    _marker: PhantomData<fn() -> (E, H)>,
}

impl<E, H> TypedInvoker<E, H> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<E, H> Default for TypedInvoker<E, H> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<E, H> HandlerInvoker for TypedInvoker<E, H>
where
    E: IntegrationEvent,
    H: IntegrationEventHandler<E>,
{
    async fn invoke(&self, handler: ResolvedHandler, event: DecodedEvent) -> anyhow::Result<()> {
        let handler = handler
            .downcast::<H>()
            .map_err(|_| anyhow!("resolved instance is not a {}", H::handler_name()))?;
        let event = event
            .downcast::<E>()
            .map_err(|_| anyhow!("decoded payload is not a {}", E::event_name()))?;
        handler.handle(*event).await
    }
}
