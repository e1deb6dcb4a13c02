//! Messaging client owning the process's single broker connection.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

use crate::config::schema::BrokerConfig;
use crate::messaging::handler::MessageHandler;
use crate::messaging::transport::{
    redact, Connection, Delivery, ExchangeType, MessagingError, Transport,
};
use crate::resilience::backoff::calculate_backoff;

/// Retry window and drain bound for the client.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub drain_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self::from(&BrokerConfig::default())
    }
}

impl From<&BrokerConfig> for ConnectOptions {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            attempts: config.connect_attempts.max(1),
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
            drain_timeout: Duration::from_millis(config.drain_timeout_ms),
        }
    }
}

/// A registered subscription, kept so reconnects can restore it.
#[derive(Clone)]
struct Subscription {
    exchange: String,
    kind: ExchangeType,
    consumer: String,
    handler: Arc<dyn MessageHandler>,
}

/// The live connection plus the consumer tasks reading from it.
struct LiveConnection {
    url: Url,
    inner: Box<dyn Connection>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
}

/// Messaging client.
///
/// Holds at most one live connection. `connect_to_broker` and `reconnect`
/// build the new connection and its consumers first, then swap it in and
/// close the old one.
pub struct MessagingClient {
    transport: Arc<dyn Transport>,
    options: ConnectOptions,
    connection: ArcSwapOption<LiveConnection>,
    subscriptions: Mutex<Vec<Subscription>>,
    /// Serializes connect, reconnect, subscribe and close.
    lifecycle: tokio::sync::Mutex<()>,
}

impl MessagingClient {
    pub fn new(transport: Arc<dyn Transport>, options: ConnectOptions) -> Self {
        Self {
            transport,
            options,
            connection: ArcSwapOption::empty(),
            subscriptions: Mutex::new(Vec::new()),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Connect to `url`, retrying with exponential backoff.
    pub async fn connect_to_broker(&self, url: &str) -> Result<(), MessagingError> {
        let url = Url::parse(url).map_err(|e| MessagingError::InvalidUrl(e.to_string()))?;
        let _guard = self.lifecycle.lock().await;

        let conn = self.establish(&url).await?;
        self.install(url, conn).await
    }

    /// Replace the live connection with a fresh one to the same broker.
    pub async fn reconnect(&self) -> Result<(), MessagingError> {
        let _guard = self.lifecycle.lock().await;
        let url = match self.connection.load_full() {
            Some(live) => live.url.clone(),
            None => return Err(MessagingError::NotConnected),
        };

        tracing::info!(url = %redact(&url), "Reconnecting to broker");
        let conn = self.establish(&url).await?;
        self.install(url, conn).await
    }

    /// Attach `handler` to `exchange`. Each delivery is handled on a task
    /// dedicated to this subscription.
    pub async fn subscribe(
        &self,
        exchange: &str,
        kind: ExchangeType,
        consumer: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), MessagingError> {
        let _guard = self.lifecycle.lock().await;
        let live = self.connection.load_full().ok_or(MessagingError::NotConnected)?;

        let subscription = Subscription {
            exchange: exchange.to_string(),
            kind,
            consumer: consumer.to_string(),
            handler,
        };
        let rx = live.inner.subscribe(exchange, kind, consumer).await?;
        let task = spawn_consumer(&subscription, rx);
        lock(&live.consumers).push(task);
        lock(&self.subscriptions).push(subscription);

        tracing::info!(exchange = %exchange, kind = %kind, consumer = %consumer, "Subscribed");
        Ok(())
    }

    /// Publish `body` to `exchange` over the live connection.
    pub async fn publish(
        &self,
        exchange: &str,
        kind: ExchangeType,
        body: Vec<u8>,
    ) -> Result<(), MessagingError> {
        let live = self.connection.load_full().ok_or(MessagingError::NotConnected)?;
        live.inner.publish(exchange, kind, body).await
    }

    /// Serialize `message` as JSON and publish it to `exchange`.
    pub async fn publish_json<T: Serialize>(
        &self,
        exchange: &str,
        kind: ExchangeType,
        message: &T,
    ) -> Result<(), MessagingError> {
        let body = serde_json::to_vec(message).map_err(|e| MessagingError::Encode(e.to_string()))?;
        self.publish(exchange, kind, body).await
    }

    /// Close the connection and let consumers drain. Safe to call repeatedly.
    pub async fn close(&self) -> Result<(), MessagingError> {
        let _guard = self.lifecycle.lock().await;
        let Some(live) = self.connection.swap(None) else {
            tracing::debug!("Messaging client already closed");
            return Ok(());
        };

        let result = live.inner.close().await;
        self.drain(&live).await;
        tracing::info!(url = %redact(&live.url), "Broker connection closed");
        result
    }

    /// Whether a live, open connection is installed.
    pub fn is_connected(&self) -> bool {
        self.connection
            .load()
            .as_ref()
            .map(|live| live.inner.is_open())
            .unwrap_or(false)
    }

    /// Number of registered subscriptions.
    pub fn subscription_count(&self) -> usize {
        lock(&self.subscriptions).len()
    }

    async fn establish(&self, url: &Url) -> Result<Box<dyn Connection>, MessagingError> {
        let attempts = self.options.attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.transport.connect(url).await {
                Ok(conn) => {
                    tracing::info!(url = %redact(url), attempt, "Connected to broker");
                    return Ok(conn);
                }
                Err(MessagingError::InvalidUrl(reason)) => {
                    return Err(MessagingError::InvalidUrl(reason));
                }
                Err(e) => {
                    tracing::warn!(url = %redact(url), attempt, error = %e, "Broker connection failed");
                    last_error = e.to_string();
                    if attempt < attempts {
                        let delay = calculate_backoff(
                            attempt,
                            self.options.base_delay_ms,
                            self.options.max_delay_ms,
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(MessagingError::BrokerUnreachable {
            url: redact(url),
            attempts,
            reason: last_error,
        })
    }

    /// Restore every subscription on `conn`, swap it in, retire the old one.
    async fn install(&self, url: Url, conn: Box<dyn Connection>) -> Result<(), MessagingError> {
        let subscriptions = lock(&self.subscriptions).clone();
        let mut consumers = Vec::with_capacity(subscriptions.len());
        for sub in &subscriptions {
            match conn.subscribe(&sub.exchange, sub.kind, &sub.consumer).await {
                Ok(rx) => consumers.push(spawn_consumer(sub, rx)),
                Err(e) => {
                    for task in &consumers {
                        task.abort();
                    }
                    let _ = conn.close().await;
                    return Err(e);
                }
            }
        }

        let live = Arc::new(LiveConnection {
            url,
            inner: conn,
            consumers: Mutex::new(consumers),
        });
        if let Some(old) = self.connection.swap(Some(live)) {
            if let Err(e) = old.inner.close().await {
                tracing::warn!(error = %e, "Failed to close replaced connection");
            }
            self.drain(&old).await;
        }
        Ok(())
    }

    async fn drain(&self, live: &LiveConnection) {
        let mut tasks = std::mem::take(&mut *lock(&live.consumers));
        let drained = tokio::time::timeout(self.options.drain_timeout, async {
            for task in tasks.iter_mut() {
                let _ = task.await;
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                timeout_ms = self.options.drain_timeout.as_millis() as u64,
                "Consumers did not drain in time, aborting"
            );
            for task in &tasks {
                task.abort();
            }
        }
    }
}

impl std::fmt::Debug for MessagingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagingClient")
            .field("connected", &self.is_connected())
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

fn spawn_consumer(
    subscription: &Subscription,
    mut rx: mpsc::UnboundedReceiver<Delivery>,
) -> JoinHandle<()> {
    let handler = subscription.handler.clone();
    let exchange = subscription.exchange.clone();
    let consumer = subscription.consumer.clone();

    tokio::spawn(async move {
        while let Some(delivery) = rx.recv().await {
            tracing::trace!(
                exchange = %exchange,
                consumer = %consumer,
                tag = delivery.delivery_tag,
                "Delivery received"
            );
            handler.handle(delivery).await;
        }
        tracing::debug!(exchange = %exchange, consumer = %consumer, "Consumer stopped");
    })
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
