//! Error types for the integration event bus.

use thiserror::Error;

/// Errors reported by a broker client (the outbound ports).
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker host could not be reached.
    #[error("Broker unreachable: {0}")]
    Unreachable(String),

    /// Socket-level failure talking to the broker.
    #[error("Broker I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed underneath the caller.
    #[error("Broker connection closed")]
    ConnectionClosed,

    /// The channel was closed underneath the caller.
    #[error("Broker channel closed")]
    ChannelClosed,

    /// A queue or exchange referenced by the operation does not exist.
    #[error("Broker entity not found: {0}")]
    NotFound(String),

    /// The broker rejected the operation.
    #[error("Broker protocol error: {0}")]
    Protocol(String),
}

impl BrokerError {
    /// Whether the failure is a connectivity blip worth retrying.
    ///
    /// Only network-level failures are retried; protocol errors and
    /// missing topology are programmer or configuration errors.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unreachable(_) | Self::Io(_) | Self::ConnectionClosed | Self::ChannelClosed
        )
    }
}

/// Errors surfaced by the event bus.
#[derive(Debug, Error)]
pub enum EventBusError {
    /// A channel was requested while no broker connection is open.
    #[error("No broker connection is available to perform this action")]
    ConnectionUnavailable,

    /// The broker client failed (after any retries).
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// The (event, handler) pair is already registered.
    #[error("Handler type {handler} already registered for '{event}'")]
    DuplicateHandlerRegistration { event: String, handler: String },

    /// The event name has no registered bindings.
    #[error("No subscriptions registered for event '{0}'")]
    UnknownEvent(String),

    /// A payload could not be encoded or decoded.
    #[error("Failed to (de)serialize event '{event}': {source}")]
    Serialization {
        event: String,
        #[source]
        source: serde_json::Error,
    },

    /// A handler returned an error while processing an event.
    #[error("Handler {handler} failed for event '{event}': {message}")]
    HandlerExecution {
        event: String,
        handler: String,
        message: String,
    },

    /// The payload requested a simulated failure.
    #[error("Fake exception requested: \"{0}\"")]
    FaultInjected(String),

    /// The component was disposed.
    #[error("Event bus component has been disposed")]
    Disposed,
}

impl EventBusError {
    /// Whether a publish attempt failing with this error should be retried.
    ///
    /// A lost connection is retried: the next attempt reconnects first.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ConnectionUnavailable => true,
            Self::Broker(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Illegal connection state transition.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Invalid connection state transition: {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: super::state::ConnectionState,
    pub to: super::state::ConnectionState,
}
