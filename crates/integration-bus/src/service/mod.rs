//! Service layer: the broker connection, the event bus and its dispatcher.

pub mod connection;
pub mod dispatcher;
pub mod event_bus;

pub use connection::BrokerConnection;
pub use dispatcher::Dispatcher;
pub use event_bus::EventBus;
