//! Adapters layer for the integration event bus.
//!
//! Implementations of the outbound ports: a process-local broker and the
//! default handler container.

pub mod handler_container;
pub mod in_memory_broker;

pub use handler_container::HandlerContainer;
pub use in_memory_broker::{Binding, InMemoryBroker, MemoryChannel, MemoryConnection, PublishedMessage};
