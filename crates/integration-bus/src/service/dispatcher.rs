//! # Dispatcher
//!
//! Delivers one inbound message to every handler bound to its event name.
//!
//! ```text
//! routing key ──→ bindings (registration order)
//!                    │
//!                    ├─ resolve handler in scope   (none → skip)
//!                    ├─ decode payload             (error → abort message)
//!                    └─ invoke                     (error → log, continue)
//! ```
//!
//! The caller acknowledges the message after `dispatch` returns, whatever
//! the outcome.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::domain::{EventBusError, SubscriptionRegistry};
use crate::ports::HandlerResolver;

/// Per-message handler dispatch.
pub struct Dispatcher {
    registry: Arc<Mutex<SubscriptionRegistry>>,
    resolver: Arc<dyn HandlerResolver>,
    dispatched: AtomicU64,
    handler_failures: AtomicU64,
}

impl Dispatcher {
    #[must_use]
    pub fn new(registry: Arc<Mutex<SubscriptionRegistry>>, resolver: Arc<dyn HandlerResolver>) -> Self {
        Self {
            registry,
            resolver,
            dispatched: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
        }
    }

    /// Run every handler bound to `event_name` against `payload`.
    ///
    /// Handler failures are logged and do not stop later handlers.
    ///
    /// # Errors
    ///
    /// [`EventBusError::Serialization`] if the payload does not decode into
    /// the registered event type; remaining handlers are skipped.
    pub async fn dispatch(&self, event_name: &str, payload: &[u8]) -> Result<(), EventBusError> {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        debug!(event = event_name, "Processing integration event");

        let (bindings, event_type) = {
            let registry = self.registry.lock();
            if !registry.has_subscriptions_for_event(event_name) {
                warn!(event = event_name, "No subscription for integration event");
                return Ok(());
            }
            (
                registry.get_handlers_for_event(event_name)?.to_vec(),
                registry.get_event_type_by_name(event_name),
            )
        };

        let scope = self.resolver.begin_scope();
        for binding in bindings {
            let Some(handler) = scope.resolve(binding.handler_name()) else {
                debug!(
                    event = event_name,
                    handler = binding.handler_name(),
                    "No handler instance resolved, skipping"
                );
                continue;
            };
            let Some(event_type) = event_type else {
                warn!(event = event_name, "No event type registered, skipping");
                continue;
            };

            let event = event_type
                .decode(payload)
                .map_err(|source| EventBusError::Serialization {
                    event: event_name.to_string(),
                    source,
                })?;

            if let Err(e) = binding.invoker().invoke(handler, event).await {
                self.handler_failures.fetch_add(1, Ordering::Relaxed);
                let failure = EventBusError::HandlerExecution {
                    event: event_name.to_string(),
                    handler: binding.handler_name().to_string(),
                    message: format!("{e:#}"),
                };
                warn!(error = %failure, "Integration event handler failed");
            }
        }
        Ok(())
    }

    /// Messages passed to `dispatch`.
    #[must_use]
    pub fn messages_dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Handler invocations that returned an error.
    #[must_use]
    pub fn handler_failures(&self) -> u64 {
        self.handler_failures.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::HandlerContainer;
    use crate::domain::{IntegrationEvent, IntegrationEventHandler};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    #[derive(Serialize, Deserialize)]
    struct InvoiceIssued {
        id: Uuid,
        creation_date: DateTime<Utc>,
        amount: u64,
    }

    impl IntegrationEvent for InvoiceIssued {
        fn id(&self) -> Uuid {
            self.id
        }
        fn creation_date(&self) -> DateTime<Utc> {
            self.creation_date
        }
    }

    type Log = Arc<Mutex<Vec<String>>>;

    struct Ledger(Log);
    struct Mailer(Log);
    struct Broken(Log);

    #[async_trait]
    impl IntegrationEventHandler<InvoiceIssued> for Ledger {
        async fn handle(&self, event: InvoiceIssued) -> anyhow::Result<()> {
            self.0.lock().push(format!("ledger:{}", event.amount));
            Ok(())
        }
    }

    #[async_trait]
    impl IntegrationEventHandler<InvoiceIssued> for Mailer {
        async fn handle(&self, event: InvoiceIssued) -> anyhow::Result<()> {
            self.0.lock().push(format!("mailer:{}", event.amount));
            Ok(())
        }
    }

    #[async_trait]
    impl IntegrationEventHandler<InvoiceIssued> for Broken {
        async fn handle(&self, _event: InvoiceIssued) -> anyhow::Result<()> {
            self.0.lock().push("broken".to_string());
            anyhow::bail!("ledger offline")
        }
    }

    fn payload(amount: u64) -> Vec<u8> {
        serde_json::to_vec(&InvoiceIssued {
            id: Uuid::new_v4(),
            creation_date: Utc::now(),
            amount,
        })
        .unwrap()
    }

    fn setup() -> (Dispatcher, Arc<Mutex<SubscriptionRegistry>>, Arc<HandlerContainer>, Log) {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(Mutex::new(SubscriptionRegistry::new()));
        let container = Arc::new(HandlerContainer::new());
        let (a, b, c) = (log.clone(), log.clone(), log.clone());
        container.register::<InvoiceIssued, Ledger, _>(move || Ledger(a.clone()));
        container.register::<InvoiceIssued, Mailer, _>(move || Mailer(b.clone()));
        container.register::<InvoiceIssued, Broken, _>(move || Broken(c.clone()));
        let dispatcher = Dispatcher::new(registry.clone(), container.clone());
        (dispatcher, registry, container, log)
    }

    #[tokio::test]
    async fn test_no_bindings_is_ok() {
        let (dispatcher, _, container, log) = setup();

        dispatcher.dispatch("InvoiceIssued", &payload(1)).await.unwrap();

        assert!(log.lock().is_empty());
        assert_eq!(container.scopes_opened(), 0);
        assert_eq!(dispatcher.messages_dispatched(), 1);
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_stop_the_next() {
        let (dispatcher, registry, _, log) = setup();
        {
            let mut registry = registry.lock();
            registry.add_subscription::<InvoiceIssued, Broken>().unwrap();
            registry.add_subscription::<InvoiceIssued, Ledger>().unwrap();
        }

        dispatcher.dispatch("InvoiceIssued", &payload(9)).await.unwrap();

        assert_eq!(*log.lock(), vec!["broken", "ledger:9"]);
        assert_eq!(dispatcher.handler_failures(), 1);
    }

    #[tokio::test]
    async fn test_unresolved_handler_is_skipped() {
        let (dispatcher, registry, container, log) = setup();
        {
            let mut registry = registry.lock();
            registry.add_subscription::<InvoiceIssued, Mailer>().unwrap();
            registry.add_subscription::<InvoiceIssued, Ledger>().unwrap();
        }
        container.deregister("Mailer");

        dispatcher.dispatch("InvoiceIssued", &payload(3)).await.unwrap();

        assert_eq!(*log.lock(), vec!["ledger:3"]);
    }

    #[tokio::test]
    async fn test_bad_payload_aborts_message() {
        let (dispatcher, registry, _, log) = setup();
        registry
            .lock()
            .add_subscription::<InvoiceIssued, Ledger>()
            .unwrap();

        let err = dispatcher
            .dispatch("InvoiceIssued", br#"{"amount": "lots"}"#)
            .await
            .unwrap_err();

        assert!(matches!(err, EventBusError::Serialization { ref event, .. } if event == "InvoiceIssued"));
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_case_insensitive_payload() {
        let (dispatcher, registry, _, log) = setup();
        registry
            .lock()
            .add_subscription::<InvoiceIssued, Mailer>()
            .unwrap();

        let body = format!(
            r#"{{"ID":"{}","creation_date":"2024-05-01T10:00:00Z","Amount":12}}"#,
            Uuid::new_v4()
        );
        dispatcher.dispatch("InvoiceIssued", body.as_bytes()).await.unwrap();

        assert_eq!(*log.lock(), vec!["mailer:12"]);
    }
}
