//! # Subscription Registry
//!
//! In-memory map from event name to the ordered handler bindings for that
//! event, plus the event type used to decode inbound payloads.
//!
//! ## Invariants
//!
//! | Invariant | Enforcement |
//! |-----------|-------------|
//! | One binding per (event, handler) pair | `add_binding()` duplicate check |
//! | Dispatch order = registration order | `Vec` per event name |
//! | Entry exists iff it has >= 1 binding | `remove_subscription_by_name()` drops both maps |
//! | Last removal notifies exactly once | listeners fired only on entry removal |

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::codec;
use super::errors::EventBusError;
use super::event::IntegrationEvent;
use super::handler::{DecodedEvent, HandlerInvoker, IntegrationEventHandler, TypedInvoker};

/// Callback raised with the event name when its last binding is removed.
pub type EventRemovedListener = Box<dyn Fn(&str) + Send + Sync>;

/// Concrete event type registered under an event name.
#[derive(Clone, Copy)]
pub struct EventType {
    name: &'static str,
    type_name: &'static str,
    type_id: TypeId,
    decode: fn(&[u8]) -> Result<DecodedEvent, serde_json::Error>,
}

impl EventType {
    /// Descriptor for event type `E`.
    #[must_use]
    pub fn of<E: IntegrationEvent>() -> Self {
        Self {
            name: E::event_name(),
            type_name: std::any::type_name::<E>(),
            type_id: TypeId::of::<E>(),
            decode: decode_as::<E>,
        }
    }

    /// Event name (routing key).
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Fully qualified Rust type name.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    #[must_use]
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Decode a payload into this type, matching fields case-insensitively.
    ///
    /// # Errors
    ///
    /// Returns the underlying `serde_json` error on malformed payloads.
    pub fn decode(&self, payload: &[u8]) -> Result<DecodedEvent, serde_json::Error> {
        (self.decode)(payload)
    }
}

impl fmt::Debug for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventType")
            .field("name", &self.name)
            .field("type_name", &self.type_name)
            .finish()
    }
}

fn decode_as<E: IntegrationEvent>(payload: &[u8]) -> Result<DecodedEvent, serde_json::Error> {
    codec::from_payload::<E>(payload).map(|event| Box::new(event) as DecodedEvent)
}

/// A registered (event, handler) pair.
#[derive(Clone)]
pub struct SubscriptionBinding {
    event_name: String,
    handler_name: String,
    invoker: Arc<dyn HandlerInvoker>,
}

impl SubscriptionBinding {
    /// Binding for handler `H` of event `E`.
    #[must_use]
    pub fn typed<E, H>() -> Self
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        Self::new(
            E::event_name(),
            H::handler_name(),
            Arc::new(TypedInvoker::<E, H>::new()),
        )
    }

    /// Binding with an explicit invoker.
    #[must_use]
    pub fn new(
        event_name: impl Into<String>,
        handler_name: impl Into<String>,
        invoker: Arc<dyn HandlerInvoker>,
    ) -> Self {
        Self {
            event_name: event_name.into(),
            handler_name: handler_name.into(),
            invoker,
        }
    }

    #[must_use]
    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    #[must_use]
    pub fn handler_name(&self) -> &str {
        &self.handler_name
    }

    #[must_use]
    pub fn invoker(&self) -> &Arc<dyn HandlerInvoker> {
        &self.invoker
    }
}

impl fmt::Debug for SubscriptionBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionBinding")
            .field("event_name", &self.event_name)
            .field("handler_name", &self.handler_name)
            .finish()
    }
}

impl PartialEq for SubscriptionBinding {
    fn eq(&self, other: &Self) -> bool {
        self.event_name == other.event_name && self.handler_name == other.handler_name
    }
}

impl Eq for SubscriptionBinding {}

/// Event name -> ordered handler bindings.
///
/// Owned by exactly one event bus; not shared as a mutable container.
#[derive(Default)]
pub struct SubscriptionRegistry {
    handlers: HashMap<String, Vec<SubscriptionBinding>>,
    event_types: HashMap<String, EventType>,
    listeners: Vec<EventRemovedListener>,
}

impl SubscriptionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for "last binding of an event removed".
    pub fn on_event_removed<F>(&mut self, listener: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    /// True iff no event names are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Event name used for `E`.
    #[must_use]
    pub fn event_name<E: IntegrationEvent>() -> &'static str {
        E::event_name()
    }

    /// Bind handler `H` to event `E`.
    ///
    /// # Errors
    ///
    /// [`EventBusError::DuplicateHandlerRegistration`] if the pair exists.
    pub fn add_subscription<E, H>(&mut self) -> Result<(), EventBusError>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        self.add_binding(SubscriptionBinding::typed::<E, H>(), EventType::of::<E>())
    }

    /// Append `binding` to its event's binding list.
    ///
    /// # Errors
    ///
    /// [`EventBusError::DuplicateHandlerRegistration`] if the pair exists;
    /// the registry is left unchanged.
    pub fn add_binding(
        &mut self,
        binding: SubscriptionBinding,
        event_type: EventType,
    ) -> Result<(), EventBusError> {
        let event_name = binding.event_name.clone();
        let duplicate = self
            .handlers
            .get(&event_name)
            .is_some_and(|bindings| bindings.iter().any(|b| b.handler_name == binding.handler_name));
        if duplicate {
            return Err(EventBusError::DuplicateHandlerRegistration {
                event: event_name,
                handler: binding.handler_name,
            });
        }

        self.handlers
            .entry(event_name.clone())
            .or_default()
            .push(binding);
        self.event_types.entry(event_name).or_insert(event_type);
        Ok(())
    }

    /// Unbind handler `H` from event `E`.
    ///
    /// Returns `true` when this removed the event's last binding.
    pub fn remove_subscription<E, H>(&mut self) -> bool
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        self.remove_subscription_by_name(E::event_name(), H::handler_name())
    }

    /// Unbind `handler_name` from `event_name`; no-op for unknown names.
    ///
    /// Removing the last binding drops the event entry and its type, then
    /// notifies every removal listener. Returns `true` in that case.
    pub fn remove_subscription_by_name(&mut self, event_name: &str, handler_name: &str) -> bool {
        let Some(bindings) = self.handlers.get_mut(event_name) else {
            return false;
        };
        let Some(position) = bindings.iter().position(|b| b.handler_name == handler_name) else {
            return false;
        };

        bindings.remove(position);
        if !bindings.is_empty() {
            return false;
        }

        self.handlers.remove(event_name);
        self.event_types.remove(event_name);
        for listener in &self.listeners {
            listener(event_name);
        }
        true
    }

    #[must_use]
    pub fn has_subscriptions_for_event(&self, event_name: &str) -> bool {
        self.handlers.contains_key(event_name)
    }

    /// Bindings for `event_name` in registration order.
    ///
    /// # Errors
    ///
    /// [`EventBusError::UnknownEvent`] if the name has no bindings; check
    /// [`has_subscriptions_for_event`](Self::has_subscriptions_for_event) first.
    pub fn get_handlers_for_event(
        &self,
        event_name: &str,
    ) -> Result<&[SubscriptionBinding], EventBusError> {
        self.handlers
            .get(event_name)
            .map(Vec::as_slice)
            .ok_or_else(|| EventBusError::UnknownEvent(event_name.to_string()))
    }

    #[must_use]
    pub fn get_event_type_by_name(&self, event_name: &str) -> Option<EventType> {
        self.event_types.get(event_name).copied()
    }

    /// Registered event names, sorted.
    #[must_use]
    pub fn event_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Drop every binding without notifying listeners.
    pub fn clear(&mut self) {
        self.handlers.clear();
        self.event_types.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    macro_rules! test_event {
        ($name:ident) => {
            #[derive(Serialize, Deserialize)]
            struct $name {
                id: Uuid,
                creation_date: DateTime<Utc>,
            }

            impl IntegrationEvent for $name {
                fn id(&self) -> Uuid {
                    self.id
                }
                fn creation_date(&self) -> DateTime<Utc> {
                    self.creation_date
                }
            }
        };
    }

    macro_rules! test_handler {
        ($name:ident, $event:ty) => {
            struct $name;

            #[async_trait]
            impl IntegrationEventHandler<$event> for $name {
                async fn handle(&self, _event: $event) -> anyhow::Result<()> {
                    Ok(())
                }
            }
        };
    }

    test_event!(OrderCreated);
    test_event!(OrderShipped);
    test_handler!(HandlerA, OrderCreated);
    test_handler!(HandlerB, OrderCreated);
    test_handler!(HandlerC, OrderCreated);
    test_handler!(ShippingHandler, OrderShipped);

    fn recording_registry() -> (SubscriptionRegistry, Arc<Mutex<Vec<String>>>) {
        let removed = Arc::new(Mutex::new(Vec::new()));
        let mut registry = SubscriptionRegistry::new();
        let sink = removed.clone();
        registry.on_event_removed(move |name| sink.lock().push(name.to_string()));
        (registry, removed)
    }

    #[test]
    fn test_add_creates_entry_and_type() {
        let mut registry = SubscriptionRegistry::new();
        assert!(registry.is_empty());

        registry.add_subscription::<OrderCreated, HandlerA>().unwrap();

        assert!(!registry.is_empty());
        assert!(registry.has_subscriptions_for_event("OrderCreated"));
        let event_type = registry.get_event_type_by_name("OrderCreated").unwrap();
        assert_eq!(event_type.name(), "OrderCreated");
        assert_eq!(event_type.type_id(), TypeId::of::<OrderCreated>());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = SubscriptionRegistry::new();
        registry.add_subscription::<OrderCreated, HandlerA>().unwrap();

        let err = registry
            .add_subscription::<OrderCreated, HandlerA>()
            .unwrap_err();

        assert!(matches!(
            err,
            EventBusError::DuplicateHandlerRegistration { ref event, ref handler }
                if event == "OrderCreated" && handler == "HandlerA"
        ));
        assert_eq!(registry.get_handlers_for_event("OrderCreated").unwrap().len(), 1);
    }

    #[test]
    fn test_handlers_in_registration_order() {
        let mut registry = SubscriptionRegistry::new();
        registry.add_subscription::<OrderCreated, HandlerB>().unwrap();
        registry.add_subscription::<OrderCreated, HandlerC>().unwrap();
        registry.add_subscription::<OrderCreated, HandlerA>().unwrap();

        let names = |r: &SubscriptionRegistry| -> Vec<String> {
            r.get_handlers_for_event("OrderCreated")
                .unwrap()
                .iter()
                .map(|b| b.handler_name().to_string())
                .collect()
        };

        assert_eq!(names(&registry), vec!["HandlerB", "HandlerC", "HandlerA"]);
        assert_eq!(names(&registry), names(&registry));

        registry.remove_subscription::<OrderCreated, HandlerC>();
        assert_eq!(names(&registry), vec!["HandlerB", "HandlerA"]);
    }

    #[test]
    fn test_remove_last_binding_notifies_once() {
        let (mut registry, removed) = recording_registry();
        registry.add_subscription::<OrderCreated, HandlerA>().unwrap();
        registry.add_subscription::<OrderCreated, HandlerB>().unwrap();

        assert!(!registry.remove_subscription::<OrderCreated, HandlerA>());
        assert!(removed.lock().is_empty());
        assert!(registry.get_event_type_by_name("OrderCreated").is_some());

        assert!(registry.remove_subscription::<OrderCreated, HandlerB>());
        assert_eq!(*removed.lock(), vec!["OrderCreated".to_string()]);
        assert!(!registry.has_subscriptions_for_event("OrderCreated"));
        assert!(registry.get_event_type_by_name("OrderCreated").is_none());
        assert!(registry.is_empty());

        // Removing again is a no-op.
        assert!(!registry.remove_subscription::<OrderCreated, HandlerB>());
        assert_eq!(removed.lock().len(), 1);
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let (mut registry, removed) = recording_registry();
        registry.add_subscription::<OrderCreated, HandlerA>().unwrap();

        assert!(!registry.remove_subscription_by_name("Unknown", "HandlerA"));
        assert!(!registry.remove_subscription::<OrderCreated, HandlerB>());

        assert!(registry.has_subscriptions_for_event("OrderCreated"));
        assert!(removed.lock().is_empty());
    }

    #[test]
    fn test_get_handlers_for_unknown_event_fails() {
        let registry = SubscriptionRegistry::new();
        assert!(matches!(
            registry.get_handlers_for_event("OrderCreated"),
            Err(EventBusError::UnknownEvent(_))
        ));
    }

    #[test]
    fn test_has_subscriptions_tracks_binding_sequences() {
        let (mut registry, removed) = recording_registry();

        registry.add_subscription::<OrderCreated, HandlerA>().unwrap();
        registry.add_subscription::<OrderShipped, ShippingHandler>().unwrap();
        registry.add_subscription::<OrderCreated, HandlerB>().unwrap();
        assert!(registry.has_subscriptions_for_event("OrderCreated"));
        assert!(registry.has_subscriptions_for_event("OrderShipped"));

        registry.remove_subscription::<OrderShipped, ShippingHandler>();
        assert!(!registry.has_subscriptions_for_event("OrderShipped"));
        assert!(registry.has_subscriptions_for_event("OrderCreated"));

        registry.remove_subscription::<OrderCreated, HandlerA>();
        assert!(registry.has_subscriptions_for_event("OrderCreated"));
        registry.add_subscription::<OrderCreated, HandlerA>().unwrap();
        registry.remove_subscription::<OrderCreated, HandlerB>();
        registry.remove_subscription::<OrderCreated, HandlerA>();
        assert!(!registry.has_subscriptions_for_event("OrderCreated"));

        assert_eq!(
            *removed.lock(),
            vec!["OrderShipped".to_string(), "OrderCreated".to_string()]
        );
    }

    #[test]
    fn test_clear_does_not_notify() {
        let (mut registry, removed) = recording_registry();
        registry.add_subscription::<OrderCreated, HandlerA>().unwrap();
        registry.add_subscription::<OrderShipped, ShippingHandler>().unwrap();
        assert_eq!(registry.event_names(), vec!["OrderCreated", "OrderShipped"]);

        registry.clear();

        assert!(registry.is_empty());
        assert!(registry.get_event_type_by_name("OrderCreated").is_none());
        assert!(removed.lock().is_empty());
    }

    #[test]
    fn test_event_type_decodes_case_insensitively() {
        let event_type = EventType::of::<OrderCreated>();
        let body = format!(
            r#"{{"Id":"{}","CreationDate":"2024-01-01T00:00:00Z"}}"#,
            Uuid::nil()
        );
        // `CreationDate` does not fold onto `creation_date`; only case differs
        // for `Id`, so the snake_case key is required for the date.
        assert!(event_type.decode(body.as_bytes()).is_err());

        let body = format!(
            r#"{{"ID":"{}","Creation_Date":"2024-01-01T00:00:00Z"}}"#,
            Uuid::nil()
        );
        let decoded = event_type.decode(body.as_bytes()).unwrap();
        let event = decoded.downcast::<OrderCreated>().unwrap();
        assert_eq!(event.id, Uuid::nil());
    }
}
