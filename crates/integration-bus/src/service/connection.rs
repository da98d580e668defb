//! # Broker Connection
//!
//! Owns the single physical broker connection shared by publishing and
//! consuming. Connects lazily with exponential backoff and reconnects when
//! the broker reports a shutdown, a callback exception or a block.
//!
//! Lifecycle changes go through [`ConnectionStateMachine`]; concurrent
//! `try_connect` calls are serialized by an async lock so at most one
//! connect attempt is in flight.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use crate::domain::{ConnectionState, ConnectionStateMachine, EventBusError, RetryPolicy};
use crate::ports::{Channel, Connection, ConnectionEvent, ConnectionFactory};

/// Resilient handle on the broker connection.
pub struct BrokerConnection {
    factory: Arc<dyn ConnectionFactory>,
    retry: RetryPolicy,
    state: ConnectionStateMachine,
    connection: RwLock<Option<Arc<dyn Connection>>>,
    connect_lock: AsyncMutex<()>,
    disposed: AtomicBool,
    recoveries: AtomicU64,
}

impl BrokerConnection {
    /// Create a disconnected handle; nothing is opened until `try_connect`.
    #[must_use]
    pub fn new(factory: Arc<dyn ConnectionFactory>, retry: RetryPolicy) -> Arc<Self> {
        Arc::new(Self {
            factory,
            retry,
            state: ConnectionStateMachine::new(),
            connection: RwLock::new(None),
            connect_lock: AsyncMutex::new(()),
            disposed: AtomicBool::new(false),
            recoveries: AtomicU64::new(0),
        })
    }

    /// Broker host, as reported by the factory.
    #[must_use]
    pub fn host(&self) -> &str {
        self.factory.host()
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state.current()
    }

    /// Broker notifications that led to a reconnect attempt.
    #[must_use]
    pub fn recoveries(&self) -> u64 {
        self.recoveries.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// A connection is present, open, and this handle is not disposed.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.is_disposed()
            && self
                .connection
                .read()
                .as_ref()
                .is_some_and(|connection| connection.is_open())
    }

    /// Open the connection if needed, retrying transient failures.
    ///
    /// Returns `true` once connected. Connectivity failures are logged and
    /// reported as `false`, never as an error.
    pub async fn try_connect(self: &Arc<Self>) -> bool {
        if self.is_disposed() {
            return false;
        }
        if self.is_connected() && self.state() == ConnectionState::Connected {
            return true;
        }

        let _guard = self.connect_lock.lock().await;

        if self.is_disposed() {
            return false;
        }
        if self.is_connected() {
            // Link survived the notification (e.g. flow control); resync.
            if self.state() != ConnectionState::Connected && self.state.begin_connect() {
                let _ = self.state.transition(ConnectionState::Connected);
            }
            return true;
        }
        if !self.state.begin_connect() {
            return false;
        }

        info!(host = %self.host(), "Event bus client is trying to connect");

        let factory = &self.factory;
        let result = self
            .retry
            .execute("connect", move || factory.connect())
            .await;

        match result {
            Ok(connection) => {
                if self.state.transition(ConnectionState::Connected).is_err() {
                    // Disposed while the attempt was in flight.
                    if let Err(e) = connection.close().await {
                        debug!(error = %e, "Failed to close connection opened during dispose");
                    }
                    return false;
                }

                let previous = self.connection.write().replace(connection.clone());
                if let Some(previous) = previous {
                    if previous.is_open() {
                        if let Err(e) = previous.close().await {
                            debug!(error = %e, "Failed to close replaced connection");
                        }
                    }
                }

                self.spawn_watcher(connection);
                info!(
                    host = %self.host(),
                    "Event bus client acquired a persistent connection and is subscribed to failure events"
                );
                true
            }
            Err(e) => {
                let _ = self.state.transition(ConnectionState::Disconnected);
                error!(
                    host = %self.host(),
                    retries = self.retry.retry_count(),
                    error = %e,
                    "FATAL: event bus connection could not be created and opened"
                );
                false
            }
        }
    }

    /// Watch `connection` for broker notifications and reconnect on each.
    fn spawn_watcher(self: &Arc<Self>, connection: Arc<dyn Connection>) {
        let mut events = connection.subscribe_events();
        let this: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Connection notifications lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };

                let Some(this) = this.upgrade() else { break };
                if this.is_disposed() || !this.is_current(&connection) {
                    break;
                }

                match &event {
                    ConnectionEvent::Shutdown { reason } => {
                        warn!(reason = %reason, "A broker connection is shut down. Trying to re-connect...");
                    }
                    ConnectionEvent::CallbackException { message } => {
                        warn!(error = %message, "A broker connection threw an exception. Trying to re-connect...");
                    }
                    ConnectionEvent::Blocked { reason } => {
                        warn!(reason = %reason, "A broker connection is blocked. Trying to re-connect...");
                    }
                }

                this.state
                    .transition_from(ConnectionState::Connected, ConnectionState::ShuttingDown);
                this.try_connect().await;
                this.recoveries.fetch_add(1, Ordering::Relaxed);
            }
        });
    }

    fn is_current(&self, connection: &Arc<dyn Connection>) -> bool {
        self.connection.read().as_ref().is_some_and(|current| {
            Arc::as_ptr(current).cast::<()>() == Arc::as_ptr(connection).cast::<()>()
        })
    }

    /// Open a channel on the current connection. Never reconnects.
    ///
    /// # Errors
    ///
    /// - `Disposed` once [`dispose`](Self::dispose) ran
    /// - `ConnectionUnavailable` if not connected
    /// - `Broker` if the broker refuses the channel
    pub async fn create_channel(&self) -> Result<Arc<dyn Channel>, EventBusError> {
        if self.is_disposed() {
            return Err(EventBusError::Disposed);
        }
        if !self.is_connected() {
            return Err(EventBusError::ConnectionUnavailable);
        }
        let connection = self
            .connection
            .read()
            .clone()
            .ok_or(EventBusError::ConnectionUnavailable)?;
        Ok(connection.create_channel().await?)
    }

    /// Close the connection for good. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.state.transition(ConnectionState::Disposed);

        let connection = self.connection.write().take();
        if let Some(connection) = connection {
            if let Err(e) = connection.close().await {
                error!(error = %e, "Failed to close broker connection");
            }
        }
        info!(host = %self.host(), "Event bus connection disposed");
    }
}

impl Drop for BrokerConnection {
    fn drop(&mut self) {
        self.disposed.store(true, Ordering::SeqCst);
    }
}
