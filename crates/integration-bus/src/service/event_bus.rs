//! # Event Bus
//!
//! Publishes integration events to a durable direct exchange and consumes
//! them from one durable queue per service.
//!
//! ## Topology
//!
//! ```text
//! publish(OrderCreated) ──→ [EXCHANGE_NAME] ──routing key "OrderCreated"──→ [queue]
//!                                                                            │
//!                                                  consume loop ←────────────┘
//!                                                  (dispatch, then ack)
//! ```
//!
//! A queue binding exists for an event name exactly while the registry
//! holds at least one handler for it. When the last handler goes away the
//! binding is removed; when the registry empties the consumer channel is
//! closed until the next `subscribe`.
//!
//! ## Consumer recovery
//!
//! A channel fault or an unexpected end of the delivery stream closes the
//! consumer channel, reconnects if needed, declares exchange and queue on
//! a new channel and restarts consuming. Bindings live on the broker and
//! are only re-applied when `rebind_on_recovery` is set.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::connection::BrokerConnection;
use super::dispatcher::Dispatcher;
use crate::config::EventBusConfig;
use crate::domain::codec;
use crate::domain::{
    EventBusError, IntegrationEvent, IntegrationEventHandler, RetryPolicy, SubscriptionRegistry,
};
use crate::ports::{
    Channel, ChannelFault, Delivery, EventBusApi, ExchangeKind, HandlerResolver, PublishProperties,
};
use crate::{EXCHANGE_NAME, FAULT_INJECTION_MARKER};

/// Consumer-side resources, guarded by one async lock.
#[derive(Default)]
struct ConsumerState {
    /// Active queue; `None` after the registry emptied.
    queue_name: Option<String>,
    channel: Option<Arc<dyn Channel>>,
    task: Option<JoinHandle<()>>,
    /// Bumped on every start and stop; a loop only recovers its own generation.
    generation: u64,
}

impl ConsumerState {
    fn is_consuming(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

/// Broker-backed integration event bus.
pub struct EventBus {
    connection: Arc<BrokerConnection>,
    registry: Arc<Mutex<SubscriptionRegistry>>,
    removed_events: Mutex<mpsc::UnboundedReceiver<String>>,
    dispatcher: Arc<Dispatcher>,
    consumer: AsyncMutex<ConsumerState>,
    queue_name: String,
    publish_policy: RetryPolicy,
    rebind_on_recovery: bool,
    events_published: AtomicU64,
    this: Weak<EventBus>,
}

impl EventBus {
    /// Create the bus and its consumer channel.
    ///
    /// Connects if needed, then declares the exchange and the configured
    /// queue. Consuming starts with the first `subscribe`.
    ///
    /// # Errors
    ///
    /// `ConnectionUnavailable` if the broker cannot be reached within the
    /// connection's retry budget, `Broker` if the topology is refused.
    pub async fn new(
        connection: Arc<BrokerConnection>,
        resolver: Arc<dyn HandlerResolver>,
        config: &EventBusConfig,
    ) -> Result<Arc<Self>, EventBusError> {
        let (removed_tx, removed_rx) = mpsc::unbounded_channel();
        let mut registry = SubscriptionRegistry::new();
        registry.on_event_removed(move |event_name| {
            let _ = removed_tx.send(event_name.to_string());
        });
        let registry = Arc::new(Mutex::new(registry));
        let dispatcher = Arc::new(Dispatcher::new(registry.clone(), resolver));

        let bus = Arc::new_cyclic(|this| Self {
            connection,
            registry,
            removed_events: Mutex::new(removed_rx),
            dispatcher,
            consumer: AsyncMutex::new(ConsumerState::default()),
            queue_name: config.queue_name.clone(),
            publish_policy: config.publish_policy(),
            rebind_on_recovery: config.rebind_on_recovery,
            events_published: AtomicU64::new(0),
            this: this.clone(),
        });

        {
            let mut consumer = bus.consumer.lock().await;
            let channel = bus.create_consumer_channel(&bus.queue_name).await?;
            consumer.queue_name = Some(bus.queue_name.clone());
            consumer.channel = Some(channel);
        }

        info!(
            host = %bus.connection.host(),
            exchange = EXCHANGE_NAME,
            queue = %bus.queue_name,
            "Event bus ready"
        );
        Ok(bus)
    }

    /// The underlying connection.
    #[must_use]
    pub fn connection(&self) -> &Arc<BrokerConnection> {
        &self.connection
    }

    /// Configured consumer queue.
    #[must_use]
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Total events accepted by the broker.
    #[must_use]
    pub fn events_published(&self) -> u64 {
        self.events_published.load(Ordering::Relaxed)
    }

    /// Total inbound messages dispatched (fault-injected ones excluded).
    #[must_use]
    pub fn messages_dispatched(&self) -> u64 {
        self.dispatcher.messages_dispatched()
    }

    /// Whether `E` has at least one bound handler.
    #[must_use]
    pub fn has_subscriptions<E: IntegrationEvent>(&self) -> bool {
        self.registry
            .lock()
            .has_subscriptions_for_event(E::event_name())
    }

    /// Event names with at least one bound handler, sorted.
    #[must_use]
    pub fn subscribed_events(&self) -> Vec<String> {
        self.registry.lock().event_names()
    }

    /// Whether the consume loop is running.
    pub async fn is_consuming(&self) -> bool {
        self.consumer.lock().await.is_consuming()
    }

    // =========================================================================
    // Publish
    // =========================================================================

    /// Publish `event` to the exchange, routed by its event name.
    ///
    /// # Errors
    ///
    /// See [`EventBusApi::publish`].
    pub async fn publish<E: IntegrationEvent>(&self, event: &E) -> Result<(), EventBusError> {
        self.ensure_connected().await?;

        let event_name = E::event_name();
        let body = codec::to_payload(event).map_err(|source| EventBusError::Serialization {
            event: event_name.to_string(),
            source,
        })?;

        debug!(event_id = %event.id(), event = event_name, "Publishing event to broker");

        let body = body.as_slice();
        self.publish_policy
            .execute("publish", move || self.publish_once(event_name, body))
            .await?;

        self.events_published.fetch_add(1, Ordering::Relaxed);
        debug!(event_id = %event.id(), event = event_name, "Event published");
        Ok(())
    }

    async fn publish_once(&self, event_name: &str, body: &[u8]) -> Result<(), EventBusError> {
        // The link may have dropped since the previous attempt.
        self.ensure_connected().await?;
        let channel = self.connection.create_channel().await?;

        let result = async {
            channel
                .declare_exchange(EXCHANGE_NAME, ExchangeKind::Direct, true)
                .await?;
            channel
                .publish(
                    EXCHANGE_NAME,
                    event_name,
                    PublishProperties::persistent(),
                    body.to_vec(),
                )
                .await
        }
        .await;

        if let Err(e) = channel.close().await {
            debug!(error = %e, "Failed to close publish channel");
        }
        Ok(result?)
    }

    // =========================================================================
    // Subscribe / unsubscribe
    // =========================================================================

    /// Bind handler `H` to event `E` and make sure the queue is consumed.
    ///
    /// # Errors
    ///
    /// See [`EventBusApi::subscribe`].
    pub async fn subscribe<E, H>(&self) -> Result<(), EventBusError>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        let event_name = E::event_name();
        let mut consumer = self.consumer.lock().await;

        if consumer.queue_name.is_none() || consumer.channel.is_none() {
            self.reactivate_consumer(&mut consumer).await?;
        }

        let already_bound = self.registry.lock().has_subscriptions_for_event(event_name);
        if !already_bound {
            if let Some(queue) = consumer.queue_name.clone() {
                self.bind(&queue, event_name).await?;
            }
        }

        self.registry.lock().add_subscription::<E, H>()?;
        info!(
            event = event_name,
            handler = H::handler_name(),
            "Subscribing to event"
        );

        self.start_consuming(&mut consumer).await
    }

    /// Remove the binding of handler `H` to event `E`.
    ///
    /// # Errors
    ///
    /// See [`EventBusApi::unsubscribe`].
    pub async fn unsubscribe<E, H>(&self) -> Result<(), EventBusError>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        let mut consumer = self.consumer.lock().await;

        self.registry.lock().remove_subscription::<E, H>();
        info!(
            event = E::event_name(),
            handler = H::handler_name(),
            "Unsubscribing from event"
        );

        let removed: Vec<String> = {
            let mut events = self.removed_events.lock();
            let mut removed = Vec::new();
            while let Ok(event_name) = events.try_recv() {
                removed.push(event_name);
            }
            removed
        };
        for event_name in removed {
            self.on_event_removed(&mut consumer, &event_name).await?;
        }
        Ok(())
    }

    /// Unbind a dropped event name; close the consumer once nothing is left.
    async fn on_event_removed(
        &self,
        consumer: &mut ConsumerState,
        event_name: &str,
    ) -> Result<(), EventBusError> {
        let Some(queue) = consumer.queue_name.clone() else {
            return Ok(());
        };

        self.ensure_connected().await?;
        let channel = self.connection.create_channel().await?;
        let unbound = channel.unbind_queue(&queue, EXCHANGE_NAME, event_name).await;
        if let Err(e) = channel.close().await {
            debug!(error = %e, "Failed to close unbind channel");
        }
        unbound?;
        debug!(event = event_name, queue = %queue, "Queue unbound");

        if self.registry.lock().is_empty() {
            consumer.queue_name = None;
            self.stop_consuming(consumer).await;
            info!(queue = %queue, "No subscriptions left, consumer channel closed");
        }
        Ok(())
    }

    /// Stop consuming, close the consumer channel and forget every binding
    /// (no unbind, no removal notifications).
    pub async fn shutdown(&self) {
        let mut consumer = self.consumer.lock().await;
        self.stop_consuming(&mut consumer).await;
        self.registry.lock().clear();
        info!(queue = %self.queue_name, "Event bus shut down");
    }

    // =========================================================================
    // Consumer channel
    // =========================================================================

    async fn ensure_connected(&self) -> Result<(), EventBusError> {
        if self.connection.is_disposed() {
            return Err(EventBusError::Disposed);
        }
        if self.connection.is_connected() || self.connection.try_connect().await {
            Ok(())
        } else {
            Err(EventBusError::ConnectionUnavailable)
        }
    }

    async fn bind(&self, queue: &str, event_name: &str) -> Result<(), EventBusError> {
        self.ensure_connected().await?;
        let channel = self.connection.create_channel().await?;
        let bound = channel.bind_queue(queue, EXCHANGE_NAME, event_name).await;
        if let Err(e) = channel.close().await {
            debug!(error = %e, "Failed to close bind channel");
        }
        bound?;
        debug!(event = event_name, queue, "Queue bound");
        Ok(())
    }

    /// Open a channel with the exchange and `queue` declared on it.
    async fn create_consumer_channel(&self, queue: &str) -> Result<Arc<dyn Channel>, EventBusError> {
        self.ensure_connected().await?;
        debug!(queue, "Creating consumer channel");

        let channel = self.connection.create_channel().await?;
        channel
            .declare_exchange(EXCHANGE_NAME, ExchangeKind::Direct, true)
            .await?;
        channel.declare_queue(queue, true, false, false).await?;
        Ok(channel)
    }

    /// Restore queue name and channel after the registry emptied.
    async fn reactivate_consumer(&self, consumer: &mut ConsumerState) -> Result<(), EventBusError> {
        let queue = self.queue_name.clone();
        let channel = self.create_consumer_channel(&queue).await?;
        consumer.queue_name = Some(queue);
        consumer.channel = Some(channel);
        debug!(queue = %self.queue_name, "Consumer channel re-activated");
        Ok(())
    }

    async fn start_consuming(&self, consumer: &mut ConsumerState) -> Result<(), EventBusError> {
        if consumer.is_consuming() {
            return Ok(());
        }
        let (Some(channel), Some(queue)) = (consumer.channel.clone(), consumer.queue_name.clone())
        else {
            error!("Cannot start consuming without a consumer channel");
            return Ok(());
        };

        let faults = channel.faults();
        let deliveries = channel.consume(&queue).await?;
        self.spawn_consume_loop(consumer, channel, deliveries, faults);
        debug!(queue = %queue, generation = consumer.generation, "Consumer started");
        Ok(())
    }

    fn spawn_consume_loop(
        &self,
        consumer: &mut ConsumerState,
        channel: Arc<dyn Channel>,
        deliveries: mpsc::UnboundedReceiver<Delivery>,
        faults: broadcast::Receiver<ChannelFault>,
    ) {
        consumer.generation += 1;
        let consume_loop = ConsumeLoop {
            bus: self.this.clone(),
            dispatcher: self.dispatcher.clone(),
            channel,
            generation: consumer.generation,
        };
        consumer.task = Some(tokio::spawn(consume_loop.run(deliveries, faults)));
    }

    async fn stop_consuming(&self, consumer: &mut ConsumerState) {
        consumer.generation += 1;
        consumer.task = None;
        if let Some(channel) = consumer.channel.take() {
            if let Err(e) = channel.close().await {
                debug!(error = %e, "Failed to close consumer channel");
            }
        }
    }

    /// Replace a failed consumer channel and resume consuming.
    async fn recover_consumer(&self, generation: u64) {
        let mut consumer = self.consumer.lock().await;
        if consumer.generation != generation {
            return;
        }
        consumer.task = None;
        if let Some(channel) = consumer.channel.take() {
            if let Err(e) = channel.close().await {
                debug!(error = %e, "Failed to close faulted consumer channel");
            }
        }
        let Some(queue) = consumer.queue_name.clone() else {
            return;
        };

        warn!(queue = %queue, "Recreating consumer channel");
        match self.create_consumer_channel(&queue).await {
            Ok(channel) => consumer.channel = Some(channel),
            Err(e) => {
                error!(queue = %queue, error = %e, "Consumer channel could not be recreated");
                return;
            }
        }

        if self.rebind_on_recovery {
            let event_names = self.registry.lock().event_names();
            for event_name in event_names {
                if let Err(e) = self.bind(&queue, &event_name).await {
                    error!(event = %event_name, error = %e, "Failed to restore queue binding");
                }
            }
        }

        if let Err(e) = self.start_consuming(&mut consumer).await {
            error!(queue = %queue, error = %e, "Failed to restart consumer");
        }
    }
}

/// One consume loop over one consumer channel.
struct ConsumeLoop {
    bus: Weak<EventBus>,
    dispatcher: Arc<Dispatcher>,
    channel: Arc<dyn Channel>,
    generation: u64,
}

impl ConsumeLoop {
    async fn run(
        self,
        mut deliveries: mpsc::UnboundedReceiver<Delivery>,
        mut faults: broadcast::Receiver<ChannelFault>,
    ) {
        loop {
            tokio::select! {
                biased;

                fault = faults.recv() => match fault {
                    Ok(fault) => {
                        warn!(error = %fault.message, "Consumer channel fault");
                        break;
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                },
                delivery = deliveries.recv() => match delivery {
                    Some(delivery) => self.process(delivery).await,
                    None => {
                        debug!(generation = self.generation, "Consumer delivery stream ended");
                        break;
                    }
                },
            }
        }

        if let Some(bus) = self.bus.upgrade() {
            bus.recover_consumer(self.generation).await;
        }
    }

    /// Dispatch one delivery, then acknowledge it whatever the outcome.
    async fn process(&self, delivery: Delivery) {
        let event_name = delivery.routing_key.as_str();

        let outcome = match fault_injection(&delivery.body) {
            Some(message) => Err(EventBusError::FaultInjected(message)),
            None => self.dispatcher.dispatch(event_name, &delivery.body).await,
        };
        if let Err(e) = outcome {
            warn!(event = event_name, error = %e, "Error processing message");
        }

        // Even on failure the message leaves the queue; there is no DLX.
        if let Err(e) = self.channel.ack(delivery.delivery_tag).await {
            warn!(
                event = event_name,
                delivery_tag = delivery.delivery_tag,
                error = %e,
                "Failed to acknowledge message"
            );
        }
    }
}

/// The body, if it asks for a simulated handler failure.
fn fault_injection(body: &[u8]) -> Option<String> {
    let message = String::from_utf8_lossy(body);
    message
        .to_lowercase()
        .contains(FAULT_INJECTION_MARKER)
        .then(|| message.into_owned())
}

#[async_trait]
impl EventBusApi for EventBus {
    async fn publish<E: IntegrationEvent>(&self, event: &E) -> Result<(), EventBusError> {
        EventBus::publish(self, event).await
    }

    async fn subscribe<E, H>(&self) -> Result<(), EventBusError>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        EventBus::subscribe::<E, H>(self).await
    }

    async fn unsubscribe<E, H>(&self) -> Result<(), EventBusError>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        EventBus::unsubscribe::<E, H>(self).await
    }
}
