//! # Integration Events
//!
//! An integration event is an immutable fact published by one service for
//! consumption by others. Its routing key on the broker is its short type
//! name (`OrderCreated`, not `orders::events::OrderCreated`), so two event
//! types sharing a short name collide on the exchange.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Last path segment of a type name, with generic arguments stripped.
///
/// `my_app::orders::OrderCreated` becomes `OrderCreated`.
#[must_use]
pub fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Identity and creation time carried by every integration event.
///
/// Meant to be embedded with `#[serde(flatten)]`; the embedding event's
/// own field names should then be lowercase for consume-side case folding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Unique event id.
    pub id: Uuid,
    /// When the event was created (UTC).
    pub creation_date: DateTime<Utc>,
}

impl EventMetadata {
    /// Fresh id, stamped now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            creation_date: Utc::now(),
        }
    }

    /// Metadata with explicit values (replayed or imported events).
    #[must_use]
    pub fn with(id: Uuid, creation_date: DateTime<Utc>) -> Self {
        Self { id, creation_date }
    }
}

impl Default for EventMetadata {
    fn default() -> Self {
        Self::new()
    }
}

/// A typed integration event.
///
/// Implementors are plain serde structs. The bus serializes them once on
/// publish and never mutates them.
///
/// ```rust,ignore
/// #[derive(Serialize, Deserialize)]
/// struct OrderCreated {
///     id: Uuid,
///     creation_date: DateTime<Utc>,
///     order_id: u64,
/// }
///
/// impl IntegrationEvent for OrderCreated {
///     fn id(&self) -> Uuid { self.id }
///     fn creation_date(&self) -> DateTime<Utc> { self.creation_date }
/// }
/// ```
pub trait IntegrationEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique event id.
    fn id(&self) -> Uuid;

    /// Creation timestamp.
    fn creation_date(&self) -> DateTime<Utc>;

    /// Event name, used as the broker routing key.
    fn event_name() -> &'static str
    where
        Self: Sized,
    {
        short_type_name::<Self>()
    }
}
