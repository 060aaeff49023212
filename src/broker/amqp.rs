//! RabbitMQ over AMQP 0-9-1.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::debug;

use crate::domain::BrokerBinding;

use super::{Broker, BrokerChannel, BrokerError, Delivery, DeliveryStream};

pub struct AmqpBroker {
    url: String,
}

impl AmqpBroker {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    fn kind(&self) -> &'static str {
        "amqp"
    }

    async fn open_channel(&self, url: Option<&str>) -> Result<Box<dyn BrokerChannel>, BrokerError> {
        let url = url.unwrap_or(&self.url);
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|err| BrokerError::Connection(err.to_string()))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|err| BrokerError::operation("channel.open", err))?;
        debug!(channel_id = channel.id(), "AMQP channel opened");

        Ok(Box::new(AmqpChannel {
            _connection: connection,
            channel,
        }))
    }
}

/// A channel plus the connection that owns it; dropping both closes them.
struct AmqpChannel {
    _connection: Connection,
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exclusive_queue(&self, name: &str) -> Result<(), BrokerError> {
        let options = QueueDeclareOptions {
            exclusive: true,
            auto_delete: true,
            ..QueueDeclareOptions::default()
        };
        self.channel
            .queue_declare(name, options, FieldTable::default())
            .await
            .map(|_| ())
            .map_err(|err| BrokerError::operation("queue.declare", err))
    }

    async fn bind(&self, queue: &str, binding: &BrokerBinding) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                queue,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| BrokerError::operation("queue.bind", err))
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                queue,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| BrokerError::operation("basic.consume", err))?;

        Ok(consumer
            .map(|item| {
                item.map(|delivery| Delivery {
                    payload: Bytes::from(delivery.data),
                    tag: delivery.delivery_tag,
                })
                .map_err(|err| BrokerError::operation("basic.deliver", err))
            })
            .boxed())
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(delivery.tag, BasicAckOptions::default())
            .await
            .map_err(|err| BrokerError::operation("basic.ack", err))
    }

    async fn publish(&self, binding: &BrokerBinding, payload: Bytes) -> Result<(), BrokerError> {
        self.channel
            .basic_publish(
                &binding.exchange,
                &binding.routing_key,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default().with_content_type("application/json".into()),
            )
            .await
            .map(|_| ())
            .map_err(|err| BrokerError::operation("basic.publish", err))
    }
}
