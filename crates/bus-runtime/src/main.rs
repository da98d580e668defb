//! # Bus Runtime
//!
//! Runs an integration event bus against the in-memory broker.
//!
//! ## Startup Sequence
//!
//! 1. Load logging and bus configuration (from env)
//! 2. Validate the bus configuration
//! 3. Connect, declare exchange and queue
//! 4. Subscribe the sample handlers
//! 5. Publish sample events (`EVENTBUS_DEMO_EVENTS`, default 3)
//! 6. Run until Ctrl+C, then shut down

mod handlers;
mod telemetry;

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use integration_bus::{BrokerConnection, EventBus, EventBusConfig, HandlerContainer, InMemoryBroker};

use crate::handlers::{BookRevenue, OrderCreated, ReserveStock, Stats};
use crate::telemetry::{init_tracing, TelemetryConfig};

/// How long to wait for sample events to be consumed before reporting.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = TelemetryConfig::from_env();
    init_tracing(&telemetry)?;

    let config = EventBusConfig::from_env();
    config.validate().context("invalid event bus configuration")?;

    info!("===========================================");
    info!("  Integration Bus Runtime v{}", env!("CARGO_PKG_VERSION"));
    info!("  Host: {}  Queue: {}", config.host, config.queue_name);
    info!("===========================================");

    let broker = InMemoryBroker::new(config.host.clone());
    let connection = BrokerConnection::new(Arc::new(broker.clone()), config.connect_policy());

    let stats = Arc::new(Stats::default());
    let container = Arc::new(HandlerContainer::new());
    {
        let stats = stats.clone();
        container.register::<OrderCreated, ReserveStock, _>(move || ReserveStock {
            stats: stats.clone(),
        });
    }
    {
        let stats = stats.clone();
        container.register::<OrderCreated, BookRevenue, _>(move || BookRevenue {
            stats: stats.clone(),
        });
    }

    let bus = EventBus::new(connection.clone(), container, &config)
        .await
        .context("failed to start event bus")?;
    bus.subscribe::<OrderCreated, ReserveStock>().await?;
    bus.subscribe::<OrderCreated, BookRevenue>().await?;

    let demo_events: u64 = env::var("EVENTBUS_DEMO_EVENTS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3);
    for order_id in 1..=demo_events {
        bus.publish(&OrderCreated::new(order_id, order_id * 1_250))
            .await
            .with_context(|| format!("failed to publish order {order_id}"))?;
    }

    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while broker.acked_count() < demo_events {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    if drained.is_err() {
        warn!(
            acked = broker.acked_count(),
            expected = demo_events,
            "Sample events not fully consumed"
        );
    }
    info!(
        published = bus.events_published(),
        dispatched = bus.messages_dispatched(),
        reserved = stats.reserved(),
        revenue_cents = stats.revenue_cents(),
        "Sample events processed"
    );

    info!("Bus is running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;

    bus.shutdown().await;
    connection.dispose().await;
    info!("Bus runtime stopped");
    Ok(())
}
