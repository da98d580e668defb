//! Ports layer for the integration event bus.
//!
//! - Inbound (Driving) ports: API exposed to services publishing and
//!   subscribing to integration events
//! - Outbound (Driven) ports: the broker client and handler resolution

pub mod inbound;
pub mod outbound;

pub use inbound::*;
pub use outbound::*;
