use std::sync::Arc;

use async_trait::async_trait;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties,
    options::{BasicPublishOptions, ConfirmSelectOptions},
    types::{AMQPValue, FieldTable, ShortString},
};
use tower::BoxError;

use crate::{
    envelope::Envelope,
    transport::{Connector, Sender},
};

const PERSISTENT: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

/// Opens RabbitMQ connections with publisher confirms enabled.
///
/// Every connection publishes to a single exchange; the envelope destination
/// is the routing key.
#[derive(Debug, Clone)]
pub struct RabbitMqConnector {
    exchange: String,
}

impl RabbitMqConnector {
    /// Publish to `exchange`. The empty string selects the default exchange,
    /// which routes straight to the queue named by the destination.
    pub fn new(exchange: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
        }
    }
}

#[async_trait]
impl Connector for RabbitMqConnector {
    type Sender = RabbitMq;
    type Error = lapin::Error;

    #[tracing::instrument(skip(self), fields(exchange = %self.exchange))]
    async fn connect(&self, address: &str) -> Result<Self::Sender, Self::Error> {
        let connection = Connection::connect(address, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        tracing::info!("Connected to RabbitMQ");

        Ok(RabbitMq {
            connection: Arc::new(connection),
            channel,
            exchange: self.exchange.clone(),
        })
    }
}

/// RabbitMQ transport sender.
///
/// ## Mapping
///
/// - `Envelope.destination` → routing key
/// - `Envelope.id` → `message-id`
/// - `Envelope.correlation_id` → `correlation-id`
/// - `Envelope.kind` → `type`
/// - `Envelope.created_at` → `timestamp`
/// - `Envelope.attempt_count` → `x-aorta-attempt` header
/// - `Envelope.payload` → message body
///
/// Messages are published persistent, and the send resolves only once the
/// broker confirms it. A negative confirmation is a send failure.
#[derive(Clone)]
pub struct RabbitMq {
    connection: Arc<Connection>,
    channel: Channel,
    exchange: String,
}

#[async_trait]
impl Sender for RabbitMq {
    type Error = BoxError;

    async fn send(&mut self, envelope: Envelope) -> Result<(), Self::Error> {
        let mut headers = FieldTable::default();
        headers.insert(
            ShortString::from("x-aorta-attempt"),
            AMQPValue::LongUInt(envelope.attempt_count()),
        );

        let properties = BasicProperties::default()
            .with_message_id(ShortString::from(envelope.id().to_string()))
            .with_correlation_id(ShortString::from(envelope.correlation_id().to_string()))
            .with_kind(ShortString::from(envelope.kind().as_str()))
            .with_timestamp(u64::try_from(envelope.created_at().timestamp()).unwrap_or_default())
            .with_delivery_mode(PERSISTENT)
            .with_headers(headers);

        let confirmation = self
            .channel
            .basic_publish(
                &self.exchange,
                envelope.destination(),
                BasicPublishOptions::default(),
                envelope.payload(),
                properties,
            )
            .await?
            .await?;

        if confirmation.is_nack() {
            return Err(format!("broker nacked envelope {}", envelope.id()).into());
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        if self.channel.status().connected() {
            self.channel.close(REPLY_SUCCESS, "closing").await?;
        }
        if self.connection.status().connected() {
            self.connection.close(REPLY_SUCCESS, "closing").await?;
        }
        Ok(())
    }
}
