//! AMQP 0-9-1 transport.
//!
//! Each subscription gets its own channel and a server-named, exclusive
//! queue bound to the exchange. Publishing shares one channel per
//! connection, reopened if the broker closed it.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, ConnectionProperties, ExchangeKind};
use tokio::sync::{mpsc, Mutex};
use url::Url;

use crate::messaging::transport::{Connection, Delivery, ExchangeType, MessagingError, Transport};

const SCHEMES: [&str; 2] = ["amqp", "amqps"];

/// Opens connections to an AMQP broker such as RabbitMQ.
#[derive(Debug, Clone)]
pub struct AmqpTransport {
    connect_timeout: Duration,
}

impl AmqpTransport {
    /// Create a transport that gives up on a single connection attempt
    /// after `connect_timeout`.
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for AmqpTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

fn transport_error(e: lapin::Error) -> MessagingError {
    MessagingError::Transport(e.to_string())
}

fn exchange_kind(kind: ExchangeType) -> ExchangeKind {
    match kind {
        ExchangeType::Direct => ExchangeKind::Direct,
        ExchangeType::Fanout => ExchangeKind::Fanout,
        ExchangeType::Topic => ExchangeKind::Topic,
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Connection>, MessagingError> {
        if !SCHEMES.contains(&url.scheme()) {
            return Err(MessagingError::InvalidUrl(format!(
                "unsupported scheme '{}'",
                url.scheme()
            )));
        }

        let connecting = lapin::Connection::connect(url.as_str(), ConnectionProperties::default());
        let connection = match tokio::time::timeout(self.connect_timeout, connecting).await {
            Ok(result) => result.map_err(transport_error)?,
            Err(_) => {
                return Err(MessagingError::Transport(format!(
                    "connect timed out after {:?}",
                    self.connect_timeout
                )))
            }
        };

        tracing::debug!(host = ?url.host_str(), "AMQP connection opened");
        Ok(Box::new(AmqpConnection {
            connection,
            publisher: Mutex::new(None),
            declared: DashMap::new(),
        }))
    }
}

struct AmqpConnection {
    connection: lapin::Connection,
    publisher: Mutex<Option<Channel>>,
    /// Exchanges declared on this connection and their kinds.
    declared: DashMap<String, ExchangeType>,
}

impl AmqpConnection {
    fn ensure_open(&self) -> Result<(), MessagingError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(MessagingError::Closed)
        }
    }

    async fn declare(
        &self,
        channel: &Channel,
        exchange: &str,
        kind: ExchangeType,
    ) -> Result<(), MessagingError> {
        if let Some(declared) = self.declared.get(exchange).map(|entry| *entry) {
            if declared != kind {
                return Err(MessagingError::ExchangeMismatch {
                    exchange: exchange.to_string(),
                    declared,
                    requested: kind,
                });
            }
        }

        channel
            .exchange_declare(
                exchange,
                exchange_kind(kind),
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(transport_error)?;
        self.declared.insert(exchange.to_string(), kind);
        Ok(())
    }

    async fn publisher(&self) -> Result<Channel, MessagingError> {
        let mut publisher = self.publisher.lock().await;
        if let Some(channel) = publisher.as_ref() {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
        }
        let channel = self.connection.create_channel().await.map_err(transport_error)?;
        *publisher = Some(channel.clone());
        Ok(channel)
    }
}

#[async_trait]
impl Connection for AmqpConnection {
    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    async fn publish(
        &self,
        exchange: &str,
        kind: ExchangeType,
        body: Vec<u8>,
    ) -> Result<(), MessagingError> {
        self.ensure_open()?;
        let channel = self.publisher().await?;
        self.declare(&channel, exchange, kind).await?;
        channel
            .basic_publish(
                exchange,
                "",
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default().with_content_type("application/json".into()),
            )
            .await
            .map_err(transport_error)?
            .await
            .map_err(transport_error)?;
        Ok(())
    }

    async fn subscribe(
        &self,
        exchange: &str,
        kind: ExchangeType,
        consumer: &str,
    ) -> Result<mpsc::UnboundedReceiver<Delivery>, MessagingError> {
        self.ensure_open()?;
        let channel = self.connection.create_channel().await.map_err(transport_error)?;
        self.declare(&channel, exchange, kind).await?;

        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(transport_error)?;
        let routing_key = if kind == ExchangeType::Topic { "#" } else { "" };
        channel
            .queue_bind(
                queue.name().as_str(),
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(transport_error)?;

        let mut deliveries = channel
            .basic_consume(
                queue.name().as_str(),
                consumer,
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(transport_error)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let exchange = exchange.to_string();
        let consumer = consumer.to_string();
        tokio::spawn(async move {
            while let Some(next) = deliveries.next().await {
                match next {
                    Ok(message) => {
                        let delivery = Delivery {
                            exchange: exchange.clone(),
                            consumer: consumer.clone(),
                            delivery_tag: message.delivery_tag,
                            body: message.data,
                        };
                        if tx.send(delivery).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(exchange = %exchange, error = %e, "AMQP consumer stopped");
                        break;
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn close(&self) -> Result<(), MessagingError> {
        if !self.is_open() {
            return Ok(());
        }
        self.connection
            .close(200, "shutting down")
            .await
            .map_err(transport_error)?;
        tracing::debug!("AMQP connection closed");
        Ok(())
    }
}
