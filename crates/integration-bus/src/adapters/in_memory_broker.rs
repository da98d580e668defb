//! # In-Memory Broker
//!
//! Process-local message broker implementing the outbound broker ports.
//!
//! Models the subset of AMQP 0-9-1 the bus relies on: direct and fanout
//! exchanges, durable queues, queue bindings, one manual-ack consumer per
//! queue, redelivery of unacknowledged messages when a channel closes, and
//! connection/channel notifications.
//!
//! Suitable for single-process deployments and tests. Fault injection
//! hooks (`fail_next_connects`, `shutdown_connections`,
//! `fail_consumer_channels`, ...) drive the bus's recovery paths.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::domain::BrokerError;
use crate::ports::{
    Channel, ChannelFault, Connection, ConnectionEvent, ConnectionFactory, Delivery, ExchangeKind,
    PublishProperties,
};

/// Capacity of the per-connection and per-channel notification channels.
const NOTIFICATION_CAPACITY: usize = 16;

/// A queue binding on an exchange.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Binding {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

/// A message accepted by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub properties: PublishProperties,
    pub body: Vec<u8>,
}

impl PublishedMessage {
    /// Body as UTF-8 (lossy).
    #[must_use]
    pub fn body_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

#[derive(Debug, Clone)]
struct QueuedMessage {
    exchange: String,
    routing_key: String,
    body: Vec<u8>,
    redelivered: bool,
}

struct Consumer {
    channel_id: u64,
    sender: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct QueueState {
    messages: VecDeque<QueuedMessage>,
    consumer: Option<Consumer>,
}

struct ConnectionSlot {
    events: broadcast::Sender<ConnectionEvent>,
}

struct ChannelSlot {
    connection_id: u64,
    next_tag: u64,
    unacked: BTreeMap<u64, (String, QueuedMessage)>,
    faults: broadcast::Sender<ChannelFault>,
}

struct BrokerState {
    reachable: bool,
    failing_connects: u32,
    failing_publishes: u32,
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueState>,
    bindings: BTreeSet<Binding>,
    published: Vec<PublishedMessage>,
    connections: HashMap<u64, ConnectionSlot>,
    channels: HashMap<u64, ChannelSlot>,
    next_id: u64,
    connections_opened: u64,
    acked: u64,
    returned: u64,
}

impl BrokerState {
    fn new() -> Self {
        Self {
            reachable: true,
            failing_connects: 0,
            failing_publishes: 0,
            exchanges: HashMap::new(),
            queues: HashMap::new(),
            bindings: BTreeSet::new(),
            published: Vec::new(),
            connections: HashMap::new(),
            channels: HashMap::new(),
            next_id: 0,
            connections_opened: 0,
            acked: 0,
            returned: 0,
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn connection_open(&self, id: u64) -> bool {
        self.connections.contains_key(&id)
    }

    fn channel_open(&self, id: u64) -> bool {
        self.channels
            .get(&id)
            .is_some_and(|slot| self.connection_open(slot.connection_id))
    }

    fn ensure_channel(&self, id: u64) -> Result<(), BrokerError> {
        if self.channel_open(id) {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed)
        }
    }

    /// Close a channel: cancel its consumers and requeue unacked messages.
    fn close_channel(&mut self, id: u64) {
        let Some(slot) = self.channels.remove(&id) else {
            return;
        };

        for queue in self.queues.values_mut() {
            if queue.consumer.as_ref().is_some_and(|c| c.channel_id == id) {
                queue.consumer = None;
            }
        }

        for (_, (queue, mut message)) in slot.unacked.into_iter().rev() {
            if let Some(state) = self.queues.get_mut(&queue) {
                message.redelivered = true;
                state.messages.push_front(message);
            }
        }
    }

    /// Close a connection and every channel opened on it.
    ///
    /// Returns the notification sender; dropping it ends every watcher's
    /// event stream once the final notification is read.
    fn close_connection(&mut self, id: u64) -> Option<broadcast::Sender<ConnectionEvent>> {
        let events = self.connections.remove(&id)?.events;

        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, channel)| channel.connection_id == id)
            .map(|(channel_id, _)| *channel_id)
            .collect();
        for channel_id in channels {
            self.close_channel(channel_id);
        }
        Some(events)
    }

    fn route(&mut self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<usize, BrokerError> {
        if !self.exchanges.contains_key(exchange) {
            return Err(BrokerError::NotFound(format!("exchange '{exchange}'")));
        }

        let targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && b.routing_key == routing_key)
            .map(|b| b.queue.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        for queue in &targets {
            if let Some(state) = self.queues.get_mut(queue) {
                state.messages.push_back(QueuedMessage {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    body: body.to_vec(),
                    redelivered: false,
                });
            }
            self.pump(queue);
        }
        Ok(targets.len())
    }

    /// Push ready messages to the queue's consumer, if any.
    fn pump(&mut self, queue: &str) {
        let Some(state) = self.queues.get_mut(queue) else {
            return;
        };
        let Some((channel_id, sender)) = state
            .consumer
            .as_ref()
            .map(|c| (c.channel_id, c.sender.clone()))
        else {
            return;
        };
        let Some(channel) = self.channels.get_mut(&channel_id) else {
            state.consumer = None;
            return;
        };

        while let Some(message) = state.messages.pop_front() {
            channel.next_tag += 1;
            let delivery_tag = channel.next_tag;
            let delivery = Delivery {
                delivery_tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                body: message.body.clone(),
                redelivered: message.redelivered,
            };
            if sender.send(delivery).is_err() {
                // Consumer went away without closing its channel.
                state.messages.push_front(message);
                state.consumer = None;
                break;
            }
            channel.unacked.insert(delivery_tag, (queue.to_string(), message));
        }
    }
}

/// Process-local broker; cloning yields another handle to the same broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    host: String,
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    /// Create an empty, reachable broker answering for `host`.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            state: Arc::new(Mutex::new(BrokerState::new())),
        }
    }

    // =========================================================================
    // Fault injection
    // =========================================================================

    /// Make connection attempts fail (or succeed again).
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    /// Fail the next `count` connection attempts with a transient error.
    pub fn fail_next_connects(&self, count: u32) {
        self.state.lock().failing_connects = count;
    }

    /// Fail the next `count` publishes with a transient I/O error.
    pub fn fail_next_publishes(&self, count: u32) {
        self.state.lock().failing_publishes = count;
    }

    /// Shut down every open connection, as a broker restart would.
    ///
    /// Channels close (unacked messages are requeued) before the shutdown
    /// notification is raised.
    pub fn shutdown_connections(&self, reason: &str) -> usize {
        let senders: Vec<_> = {
            let mut state = self.state.lock();
            let ids: Vec<u64> = state.connections.keys().copied().collect();
            ids.into_iter()
                .filter_map(|id| state.close_connection(id))
                .collect()
        };
        for events in &senders {
            let _ = events.send(ConnectionEvent::Shutdown {
                reason: reason.to_string(),
            });
        }
        warn!(host = %self.host, connections = senders.len(), reason, "Broker connections shut down");
        senders.len()
    }

    /// Raise a flow-control block on every open connection.
    pub fn block_connections(&self, reason: &str) {
        self.notify_open_connections(ConnectionEvent::Blocked {
            reason: reason.to_string(),
        });
    }

    /// Raise a callback exception on every open connection.
    pub fn raise_callback_exception(&self, message: &str) {
        self.notify_open_connections(ConnectionEvent::CallbackException {
            message: message.to_string(),
        });
    }

    fn notify_open_connections(&self, event: ConnectionEvent) {
        let senders: Vec<_> = {
            let state = self.state.lock();
            state
                .connections
                .values()
                .map(|slot| slot.events.clone())
                .collect()
        };
        for events in senders {
            let _ = events.send(event.clone());
        }
    }

    /// Raise a callback exception on every channel that has a consumer.
    ///
    /// Returns the number of channels notified.
    pub fn fail_consumer_channels(&self, message: &str) -> usize {
        let senders: Vec<_> = {
            let state = self.state.lock();
            let consuming: BTreeSet<u64> = state
                .queues
                .values()
                .filter_map(|q| q.consumer.as_ref().map(|c| c.channel_id))
                .collect();
            consuming
                .iter()
                .filter_map(|id| state.channels.get(id))
                .map(|slot| slot.faults.clone())
                .collect()
        };
        for faults in &senders {
            let _ = faults.send(ChannelFault {
                message: message.to_string(),
            });
        }
        senders.len()
    }

    /// Drop every queue binding, as a broker losing its topology would.
    pub fn purge_bindings(&self) -> usize {
        let mut state = self.state.lock();
        let purged = state.bindings.len();
        state.bindings.clear();
        purged
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Messages accepted by the broker, in publish order.
    #[must_use]
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().published.clone()
    }

    #[must_use]
    pub fn published_count(&self) -> usize {
        self.state.lock().published.len()
    }

    #[must_use]
    pub fn bindings(&self) -> Vec<Binding> {
        self.state.lock().bindings.iter().cloned().collect()
    }

    #[must_use]
    pub fn has_binding(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        self.state.lock().bindings.contains(&Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        })
    }

    #[must_use]
    pub fn exchange_kind(&self, exchange: &str) -> Option<ExchangeKind> {
        self.state.lock().exchanges.get(exchange).copied()
    }

    #[must_use]
    pub fn queue_exists(&self, queue: &str) -> bool {
        self.state.lock().queues.contains_key(queue)
    }

    /// Messages ready for delivery on `queue` (not yet handed to a consumer).
    #[must_use]
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.messages.len())
    }

    #[must_use]
    pub fn has_consumer(&self, queue: &str) -> bool {
        self.state
            .lock()
            .queues
            .get(queue)
            .is_some_and(|q| q.consumer.is_some())
    }

    /// Delivered but not yet acknowledged messages, across all channels.
    #[must_use]
    pub fn unacked_count(&self) -> usize {
        self.state
            .lock()
            .channels
            .values()
            .map(|c| c.unacked.len())
            .sum()
    }

    #[must_use]
    pub fn acked_count(&self) -> u64 {
        self.state.lock().acked
    }

    /// Mandatory messages that matched no queue.
    #[must_use]
    pub fn returned_count(&self) -> u64 {
        self.state.lock().returned
    }

    #[must_use]
    pub fn connections_opened(&self) -> u64 {
        self.state.lock().connections_opened
    }

    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.state.lock().connections.len()
    }

    #[must_use]
    pub fn open_channels(&self) -> usize {
        let state = self.state.lock();
        state
            .channels
            .keys()
            .filter(|id| state.channel_open(**id))
            .count()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new("localhost")
    }
}

#[async_trait]
impl ConnectionFactory for InMemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn Connection>, BrokerError> {
        let mut state = self.state.lock();
        if !state.reachable {
            return Err(BrokerError::Unreachable(self.host.clone()));
        }
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(BrokerError::Unreachable(self.host.clone()));
        }

        let id = state.next_id();
        let (events, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        state.connections.insert(id, ConnectionSlot { events });
        state.connections_opened += 1;
        debug!(host = %self.host, connection = id, "Broker connection opened");

        Ok(Arc::new(MemoryConnection {
            id,
            state: self.state.clone(),
        }))
    }

    fn host(&self) -> &str {
        &self.host
    }
}

/// Connection to an [`InMemoryBroker`].
pub struct MemoryConnection {
    id: u64,
    state: Arc<Mutex<BrokerState>>,
}

#[async_trait]
impl Connection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.state.lock().connection_open(self.id)
    }

    async fn create_channel(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        let mut state = self.state.lock();
        if !state.connection_open(self.id) {
            return Err(BrokerError::ConnectionClosed);
        }
        let id = state.next_id();
        let (faults, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        state.channels.insert(
            id,
            ChannelSlot {
                connection_id: self.id,
                next_tag: 0,
                unacked: BTreeMap::new(),
                faults,
            },
        );
        Ok(Arc::new(MemoryChannel {
            id,
            state: self.state.clone(),
        }))
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        match self.state.lock().connections.get(&self.id) {
            Some(slot) => slot.events.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.state.lock().close_connection(self.id);
        debug!(connection = self.id, "Broker connection closed");
        Ok(())
    }
}

/// Channel on a [`MemoryConnection`].
pub struct MemoryChannel {
    id: u64,
    state: Arc<Mutex<BrokerState>>,
}

#[async_trait]
impl Channel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.state.lock().channel_open(self.id)
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        _durable: bool,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        state.ensure_channel(self.id)?;
        state.exchanges.entry(name.to_string()).or_insert(kind);
        Ok(())
    }

    async fn declare_queue(
        &self,
        name: &str,
        _durable: bool,
        _exclusive: bool,
        _auto_delete: bool,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        state.ensure_channel(self.id)?;
        state.queues.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        state.ensure_channel(self.id)?;
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::NotFound(format!("queue '{queue}'")));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::NotFound(format!("exchange '{exchange}'")));
        }
        state.bindings.insert(Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        });
        Ok(())
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        state.ensure_channel(self.id)?;
        state.bindings.remove(&Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        });
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: PublishProperties,
        body: Vec<u8>,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        state.ensure_channel(self.id)?;
        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            return Err(BrokerError::Io(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "publish interrupted",
            )));
        }

        let routed = state.route(exchange, routing_key, &body)?;
        if routed == 0 && properties.mandatory {
            state.returned += 1;
            debug!(exchange, routing_key, "Mandatory message matched no queue");
        }
        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            properties,
            body,
        });
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<mpsc::UnboundedReceiver<Delivery>, BrokerError> {
        let mut state = self.state.lock();
        state.ensure_channel(self.id)?;
        let Some(queue_state) = state.queues.get_mut(queue) else {
            return Err(BrokerError::NotFound(format!("queue '{queue}'")));
        };
        if queue_state.consumer.is_some() {
            return Err(BrokerError::Protocol(format!(
                "ACCESS_REFUSED - queue '{queue}' already has a consumer"
            )));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        queue_state.consumer = Some(Consumer {
            channel_id: self.id,
            sender,
        });
        state.pump(queue);
        Ok(receiver)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        state.ensure_channel(self.id)?;
        let removed = state
            .channels
            .get_mut(&self.id)
            .and_then(|slot| slot.unacked.remove(&delivery_tag));
        match removed {
            Some(_) => {
                state.acked += 1;
                Ok(())
            }
            None => Err(BrokerError::Protocol(format!(
                "PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"
            ))),
        }
    }

    fn faults(&self) -> broadcast::Receiver<ChannelFault> {
        match self.state.lock().channels.get(&self.id) {
            Some(slot) => slot.faults.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.state.lock().close_channel(self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXCHANGE: &str = "test-exchange";

    async fn topology(broker: &InMemoryBroker) -> Arc<dyn Channel> {
        let connection = broker.connect().await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        channel
            .declare_exchange(EXCHANGE, ExchangeKind::Direct, true)
            .await
            .unwrap();
        channel.declare_queue("orders", true, false, false).await.unwrap();
        channel
            .bind_queue("orders", EXCHANGE, "OrderCreated")
            .await
            .unwrap();
        channel
    }

    #[tokio::test]
    async fn test_direct_routing() {
        let broker = InMemoryBroker::default();
        let channel = topology(&broker).await;

        channel
            .publish(EXCHANGE, "OrderCreated", PublishProperties::persistent(), b"a".to_vec())
            .await
            .unwrap();
        channel
            .publish(EXCHANGE, "OrderShipped", PublishProperties::persistent(), b"b".to_vec())
            .await
            .unwrap();

        assert_eq!(broker.published_count(), 2);
        assert_eq!(broker.queue_depth("orders"), 1);
        assert_eq!(broker.returned_count(), 1);
    }

    #[tokio::test]
    async fn test_consume_and_ack() {
        let broker = InMemoryBroker::default();
        let channel = topology(&broker).await;
        channel
            .publish(EXCHANGE, "OrderCreated", PublishProperties::persistent(), b"x".to_vec())
            .await
            .unwrap();

        let mut deliveries = channel.consume("orders").await.unwrap();
        let delivery = deliveries.recv().await.unwrap();
        assert_eq!(delivery.routing_key, "OrderCreated");
        assert_eq!(broker.unacked_count(), 1);

        channel.ack(delivery.delivery_tag).await.unwrap();
        assert_eq!(broker.unacked_count(), 0);
        assert_eq!(broker.acked_count(), 1);
        assert!(channel.ack(delivery.delivery_tag).await.is_err());
    }

    #[tokio::test]
    async fn test_close_requeues_unacked() {
        let broker = InMemoryBroker::default();
        let channel = topology(&broker).await;
        channel
            .publish(EXCHANGE, "OrderCreated", PublishProperties::persistent(), b"x".to_vec())
            .await
            .unwrap();
        let mut deliveries = channel.consume("orders").await.unwrap();
        let _ = deliveries.recv().await.unwrap();

        channel.close().await.unwrap();

        assert!(deliveries.recv().await.is_none());
        assert!(!broker.has_consumer("orders"));
        assert_eq!(broker.queue_depth("orders"), 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_channels_and_notifies() {
        let broker = InMemoryBroker::default();
        let connection = broker.connect().await.unwrap();
        let mut events = connection.subscribe_events();
        let channel = connection.create_channel().await.unwrap();

        assert_eq!(broker.shutdown_connections("restart"), 1);

        assert!(!connection.is_open());
        assert!(!channel.is_open());
        assert!(matches!(
            events.recv().await.unwrap(),
            ConnectionEvent::Shutdown { .. }
        ));
        assert!(matches!(
            channel.declare_queue("q", true, false, false).await,
            Err(BrokerError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_connect_failures() {
        let broker = InMemoryBroker::default();
        broker.fail_next_connects(1);
        assert!(broker.connect().await.is_err());
        assert!(broker.connect().await.is_ok());

        broker.set_reachable(false);
        let err = broker.connect().await.err().unwrap();
        assert!(err.is_transient());
        assert_eq!(broker.connections_opened(), 1);
    }

    #[tokio::test]
    async fn test_exchange_redeclare_is_idempotent() {
        let broker = InMemoryBroker::default();
        let channel = topology(&broker).await;

        channel
            .declare_exchange(EXCHANGE, ExchangeKind::Direct, true)
            .await
            .unwrap();
        channel
            .declare_exchange(EXCHANGE, ExchangeKind::Direct, true)
            .await
            .unwrap();

        assert_eq!(broker.exchange_kind(EXCHANGE), Some(ExchangeKind::Direct));
    }
}
