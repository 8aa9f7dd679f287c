//! RabbitMQ topic-exchange backend.
//!
//! Messages are persistent, published with confirms on a durable topic
//! exchange, and carry `message_id`, UTC timestamp, JSON content type and
//! an `EventType` header. Consumers ack on success and nack-with-requeue
//! on handler failure; malformed payloads are logged and dropped since no
//! redelivery can repair them.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::events::{DedupStore, EventEnvelope};
use crate::message_queue::{MessageHandler, MessageQueue, MessageQueueError};

const PERSISTENT_DELIVERY_MODE: u8 = 2;

pub struct RabbitMqQueue {
    connection: Connection,
    channel: Channel,
    exchange: String,
    publish_timeout: Duration,
    dedup_window: Duration,
}

impl RabbitMqQueue {
    /// Connects, opens a confirmed channel, and declares the durable topic
    /// exchange.
    pub async fn connect(
        broker: &BrokerConfig,
        publish_timeout: Duration,
        dedup_window: Duration,
    ) -> Result<Self, MessageQueueError> {
        info!(broker = %broker.addr(), exchange = %broker.exchange, "Connecting to broker");

        let connection =
            Connection::connect(&broker.amqp_uri(), ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        channel
            .exchange_declare(
                &broker.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        Ok(Self {
            connection,
            channel,
            exchange: broker.exchange.clone(),
            publish_timeout,
            dedup_window,
        })
    }

    pub async fn close(&self) -> Result<(), MessageQueueError> {
        self.connection.close(200, "shutdown").await?;
        Ok(())
    }

    fn properties_for(envelope: &EventEnvelope) -> BasicProperties {
        let mut headers = FieldTable::default();
        headers.insert(
            ShortString::from("EventType"),
            AMQPValue::LongString(envelope.event_type().into()),
        );

        BasicProperties::default()
            .with_message_id(envelope.event_id.to_string().into())
            .with_timestamp(envelope.timestamp.timestamp() as u64)
            .with_content_type("application/json".into())
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_headers(headers)
    }

    async fn handle_delivery(
        consumer_name: &str,
        delivery: Delivery,
        handler: &Arc<dyn MessageHandler>,
        dedup: &DedupStore,
    ) {
        let envelope: EventEnvelope = match serde_json::from_slice(&delivery.data) {
            Ok(envelope) => envelope,
            Err(e) => {
                // A payload that does not parse will never parse; requeueing
                // it would loop forever.
                error!(
                    consumer = consumer_name,
                    error = %e,
                    "Dropping malformed message payload"
                );
                if let Err(ack_err) = delivery.ack(BasicAckOptions::default()).await {
                    error!(consumer = consumer_name, error = %ack_err, "Failed to ack malformed message");
                }
                return;
            }
        };

        if dedup.is_duplicate(envelope.event_id, envelope.order_id, chrono::Utc::now()) {
            debug!(
                consumer = consumer_name,
                message_id = %envelope.event_id,
                "Duplicate delivery short-circuited"
            );
            if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                error!(consumer = consumer_name, error = %e, "Failed to ack duplicate");
            }
            return;
        }

        match handler.handle(&envelope).await {
            Ok(()) => {
                dedup.record(envelope.event_id, envelope.order_id, chrono::Utc::now());
                if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                    error!(consumer = consumer_name, error = %e, "Failed to ack delivery");
                }
            }
            Err(e) => {
                warn!(
                    consumer = consumer_name,
                    message_id = %envelope.event_id,
                    routing_key = envelope.routing_key(),
                    error = %e,
                    "Handler failed, nacking for redelivery"
                );
                if let Err(nack_err) = delivery
                    .nack(BasicNackOptions {
                        requeue: true,
                        ..Default::default()
                    })
                    .await
                {
                    error!(consumer = consumer_name, error = %nack_err, "Failed to nack delivery");
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl MessageQueue for RabbitMqQueue {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), MessageQueueError> {
        let payload = serde_json::to_vec(envelope)?;
        let routing_key = envelope.routing_key();

        let publish = async {
            let confirm = self
                .channel
                .basic_publish(
                    &self.exchange,
                    routing_key,
                    BasicPublishOptions::default(),
                    &payload,
                    Self::properties_for(envelope),
                )
                .await?
                .await?;
            Ok::<Confirmation, MessageQueueError>(confirm)
        };

        let confirm = tokio::time::timeout(self.publish_timeout, publish)
            .await
            .map_err(|_| MessageQueueError::PublishTimeout(self.publish_timeout))??;

        if let Confirmation::Nack(_) = confirm {
            return Err(MessageQueueError::Rejected(format!(
                "nack for routing key {}",
                routing_key
            )));
        }

        debug!(
            routing_key = routing_key,
            message_id = %envelope.event_id,
            "Published event"
        );
        Ok(())
    }

    async fn subscribe(
        &self,
        pattern: &str,
        consumer_name: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), MessageQueueError> {
        let queue_name = format!("{}.{}", self.exchange, consumer_name);

        self.channel
            .queue_declare(
                &queue_name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        self.channel
            .queue_bind(
                &queue_name,
                &self.exchange,
                pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let mut consumer = self
            .channel
            .basic_consume(
                &queue_name,
                consumer_name,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!(
            pattern = pattern,
            queue = %queue_name,
            "Consumer registered"
        );

        let name = consumer_name.to_string();
        let dedup = DedupStore::new(self.dedup_window);
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        Self::handle_delivery(&name, delivery, &handler, &dedup).await;
                    }
                    Err(e) => {
                        error!(consumer = %name, error = %e, "Consumer stream error");
                    }
                }
            }
            warn!(consumer = %name, "Consumer stream ended");
        });

        Ok(())
    }
}
