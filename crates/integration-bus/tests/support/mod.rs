//! Shared fixtures for the integration tests: sample events, recording
//! handlers and a bus wired to an in-memory broker.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use uuid::Uuid;

use integration_bus::{
    BrokerConnection, EventBus, EventBusConfig, EventMetadata, HandlerContainer, InMemoryBroker,
    IntegrationEvent, IntegrationEventHandler,
};

pub const QUEUE: &str = "ordering";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCreated {
    pub id: Uuid,
    pub creation_date: DateTime<Utc>,
    pub order_id: u64,
    #[serde(default)]
    pub note: Option<String>,
}

impl OrderCreated {
    pub fn new(order_id: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            creation_date: Utc::now(),
            order_id,
            note: None,
        }
    }

    pub fn with_note(order_id: u64, note: &str) -> Self {
        Self {
            note: Some(note.to_string()),
            ..Self::new(order_id)
        }
    }
}

impl IntegrationEvent for OrderCreated {
    fn id(&self) -> Uuid {
        self.id
    }
    fn creation_date(&self) -> DateTime<Utc> {
        self.creation_date
    }
}

/// Declared with flattened metadata, the other supported event shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderShipped {
    #[serde(flatten)]
    pub meta: EventMetadata,
    pub order_id: u64,
}

impl OrderShipped {
    pub fn new(order_id: u64) -> Self {
        Self {
            meta: EventMetadata::new(),
            order_id,
        }
    }
}

impl IntegrationEvent for OrderShipped {
    fn id(&self) -> Uuid {
        self.meta.id
    }
    fn creation_date(&self) -> DateTime<Utc> {
        self.meta.creation_date
    }
}

/// Handler invocations in call order, as `"<handler>:<order id>"`.
#[derive(Clone, Default)]
pub struct InvocationLog(Arc<Mutex<Vec<String>>>);

impl InvocationLog {
    pub fn record(&self, entry: String) {
        self.0.lock().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

pub struct HandlerA(pub InvocationLog);
pub struct HandlerB(pub InvocationLog);
pub struct FailingHandler(pub InvocationLog);
pub struct ShippingHandler(pub InvocationLog);

#[async_trait]
impl IntegrationEventHandler<OrderCreated> for HandlerA {
    async fn handle(&self, event: OrderCreated) -> anyhow::Result<()> {
        self.0.record(format!("A:{}", event.order_id));
        Ok(())
    }
}

#[async_trait]
impl IntegrationEventHandler<OrderCreated> for HandlerB {
    async fn handle(&self, event: OrderCreated) -> anyhow::Result<()> {
        self.0.record(format!("B:{}", event.order_id));
        Ok(())
    }
}

#[async_trait]
impl IntegrationEventHandler<OrderCreated> for FailingHandler {
    async fn handle(&self, event: OrderCreated) -> anyhow::Result<()> {
        self.0.record(format!("failing:{}", event.order_id));
        anyhow::bail!("inventory service unavailable")
    }
}

#[async_trait]
impl IntegrationEventHandler<OrderShipped> for ShippingHandler {
    async fn handle(&self, event: OrderShipped) -> anyhow::Result<()> {
        self.0.record(format!("shipped:{}", event.order_id));
        Ok(())
    }
}

/// Config with millisecond backoff so retry paths finish quickly.
pub fn fast_config() -> EventBusConfig {
    EventBusConfig {
        queue_name: QUEUE.to_string(),
        connect_retry_count: 2,
        publish_retry_count: 2,
        retry_base_delay: Duration::from_millis(1),
        ..EventBusConfig::default()
    }
}

/// A bus on a fresh in-memory broker with every sample handler registered.
pub struct Harness {
    pub broker: InMemoryBroker,
    pub connection: Arc<BrokerConnection>,
    pub container: Arc<HandlerContainer>,
    pub bus: Arc<EventBus>,
    pub log: InvocationLog,
}

impl Harness {
    pub async fn start() -> Self {
        Self::with_config(fast_config()).await
    }

    pub async fn with_config(config: EventBusConfig) -> Self {
        init_logging();

        let broker = InMemoryBroker::new(config.host.clone());
        let connection = BrokerConnection::new(Arc::new(broker.clone()), config.connect_policy());

        let log = InvocationLog::default();
        let container = Arc::new(HandlerContainer::new());
        let (a, b, f, s) = (log.clone(), log.clone(), log.clone(), log.clone());
        container.register::<OrderCreated, HandlerA, _>(move || HandlerA(a.clone()));
        container.register::<OrderCreated, HandlerB, _>(move || HandlerB(b.clone()));
        container.register::<OrderCreated, FailingHandler, _>(move || FailingHandler(f.clone()));
        container.register::<OrderShipped, ShippingHandler, _>(move || ShippingHandler(s.clone()));

        let bus = EventBus::new(connection.clone(), container.clone(), &config)
            .await
            .expect("bus should start against a reachable broker");

        Self {
            broker,
            connection,
            container,
            bus,
            log,
        }
    }

    /// Wait until the broker has seen `count` acknowledgments.
    pub async fn wait_for_acks(&self, count: u64) {
        let broker = self.broker.clone();
        wait_until(move || broker.acked_count() >= count).await;
    }
}

/// Poll `condition` until it holds, failing the test after 5 seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached within 5s");
}

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("integration_bus=debug")
        .with_test_writer()
        .try_init();
}
