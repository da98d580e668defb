//! # Handler Container
//!
//! Default [`HandlerResolver`]: maps handler names to factories and builds
//! handler instances lazily, once per resolution scope.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::domain::{IntegrationEvent, IntegrationEventHandler, ResolvedHandler};
use crate::ports::{HandlerResolver, HandlerScope};

type HandlerFactory = Arc<dyn Fn() -> ResolvedHandler + Send + Sync>;

/// Registry of handler factories, keyed by handler name.
#[derive(Default)]
pub struct HandlerContainer {
    factories: RwLock<HashMap<String, HandlerFactory>>,
    scopes_opened: AtomicU64,
}

impl HandlerContainer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a fresh `H` in every scope that resolves it.
    pub fn register<E, H, F>(&self, factory: F)
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let factory: HandlerFactory = Arc::new(move || Arc::new(factory()) as ResolvedHandler);
        self.insert(H::handler_name(), factory);
    }

    /// Hand out the same `H` instance to every scope.
    pub fn register_instance<E, H>(&self, handler: Arc<H>)
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        let factory: HandlerFactory = Arc::new(move || handler.clone() as ResolvedHandler);
        self.insert(H::handler_name(), factory);
    }

    fn insert(&self, handler_name: &str, factory: HandlerFactory) {
        let replaced = self
            .factories
            .write()
            .insert(handler_name.to_string(), factory)
            .is_some();
        debug!(handler = handler_name, replaced, "Handler registered in container");
    }

    /// Forget the factory for `handler_name`.
    pub fn deregister(&self, handler_name: &str) -> bool {
        self.factories.write().remove(handler_name).is_some()
    }

    #[must_use]
    pub fn is_registered(&self, handler_name: &str) -> bool {
        self.factories.read().contains_key(handler_name)
    }

    /// Scopes opened so far (one per dispatched message).
    #[must_use]
    pub fn scopes_opened(&self) -> u64 {
        self.scopes_opened.load(Ordering::Relaxed)
    }
}

impl HandlerResolver for HandlerContainer {
    fn begin_scope(&self) -> Box<dyn HandlerScope> {
        self.scopes_opened.fetch_add(1, Ordering::Relaxed);
        Box::new(ContainerScope {
            factories: self.factories.read().clone(),
            instances: RefCell::new(HashMap::new()),
        })
    }
}

struct ContainerScope {
    factories: HashMap<String, HandlerFactory>,
    instances: RefCell<HashMap<String, ResolvedHandler>>,
}

impl HandlerScope for ContainerScope {
    fn resolve(&self, handler_name: &str) -> Option<ResolvedHandler> {
        if let Some(instance) = self.instances.borrow().get(handler_name) {
            return Some(instance.clone());
        }
        let instance = (self.factories.get(handler_name)?)();
        self.instances
            .borrow_mut()
            .insert(handler_name.to_string(), instance.clone());
        Some(instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::AtomicUsize;
    use uuid::Uuid;

    #[derive(Serialize, Deserialize)]
    struct PaymentCaptured {
        id: Uuid,
        creation_date: DateTime<Utc>,
    }

    impl IntegrationEvent for PaymentCaptured {
        fn id(&self) -> Uuid {
            self.id
        }
        fn creation_date(&self) -> DateTime<Utc> {
            self.creation_date
        }
    }

    struct SendReceipt;

    #[async_trait]
    impl IntegrationEventHandler<PaymentCaptured> for SendReceipt {
        async fn handle(&self, _event: PaymentCaptured) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_fresh_instance_per_scope() {
        let built = Arc::new(AtomicUsize::new(0));
        let container = HandlerContainer::new();
        let counter = built.clone();
        container.register::<PaymentCaptured, SendReceipt, _>(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            SendReceipt
        });

        let scope = container.begin_scope();
        let a = scope.resolve("SendReceipt").unwrap();
        let b = scope.resolve("SendReceipt").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.downcast::<SendReceipt>().is_ok());

        let other = container.begin_scope();
        other.resolve("SendReceipt").unwrap();

        assert_eq!(built.load(Ordering::SeqCst), 2);
        assert_eq!(container.scopes_opened(), 2);
    }

    #[test]
    fn test_singleton_instance() {
        let container = HandlerContainer::new();
        let handler = Arc::new(SendReceipt);
        container.register_instance::<PaymentCaptured, _>(handler.clone());

        let resolved = container.begin_scope().resolve("SendReceipt").unwrap();
        let resolved = resolved.downcast::<SendReceipt>().unwrap();
        assert!(Arc::ptr_eq(&resolved, &handler));
    }

    #[test]
    fn test_unknown_handler_resolves_none() {
        let container = HandlerContainer::new();
        container.register::<PaymentCaptured, SendReceipt, _>(|| SendReceipt);
        assert!(container.deregister("SendReceipt"));
        assert!(!container.is_registered("SendReceipt"));
        assert!(container.begin_scope().resolve("SendReceipt").is_none());
    }
}
