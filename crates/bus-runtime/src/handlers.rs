//! Sample integration events and handlers wired by the runtime.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use integration_bus::{EventMetadata, IntegrationEvent, IntegrationEventHandler};

/// An order was placed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCreated {
    #[serde(flatten)]
    pub meta: EventMetadata,
    pub order_id: u64,
    pub total_cents: u64,
    /// Free-form note; `throw-fake-exception` makes the consumer fail it.
    #[serde(default)]
    pub note: Option<String>,
}

impl OrderCreated {
    pub fn new(order_id: u64, total_cents: u64) -> Self {
        Self {
            meta: EventMetadata::new(),
            order_id,
            total_cents,
            note: None,
        }
    }
}

impl IntegrationEvent for OrderCreated {
    fn id(&self) -> Uuid {
        self.meta.id
    }

    fn creation_date(&self) -> DateTime<Utc> {
        self.meta.creation_date
    }
}

/// Shared counters for the sample handlers.
#[derive(Debug, Default)]
pub struct Stats {
    pub reserved: AtomicU64,
    pub revenue_cents: AtomicU64,
}

impl Stats {
    pub fn reserved(&self) -> u64 {
        self.reserved.load(Ordering::Relaxed)
    }

    pub fn revenue_cents(&self) -> u64 {
        self.revenue_cents.load(Ordering::Relaxed)
    }
}

/// Reserves stock for a new order.
pub struct ReserveStock {
    pub stats: Arc<Stats>,
}

#[async_trait]
impl IntegrationEventHandler<OrderCreated> for ReserveStock {
    async fn handle(&self, event: OrderCreated) -> anyhow::Result<()> {
        self.stats.reserved.fetch_add(1, Ordering::Relaxed);
        info!(order_id = event.order_id, event_id = %event.meta.id, "Stock reserved");
        Ok(())
    }
}

/// Books revenue for a new order.
pub struct BookRevenue {
    pub stats: Arc<Stats>,
}

#[async_trait]
impl IntegrationEventHandler<OrderCreated> for BookRevenue {
    async fn handle(&self, event: OrderCreated) -> anyhow::Result<()> {
        self.stats
            .revenue_cents
            .fetch_add(event.total_cents, Ordering::Relaxed);
        info!(order_id = event.order_id, total_cents = event.total_cents, "Revenue booked");
        Ok(())
    }
}
