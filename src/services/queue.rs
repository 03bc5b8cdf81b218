//! Conversion task queue.
//!
//! Publishing side: `enqueue` is fire-and-forget and durable. Consuming side:
//! a subscription hands out one delivery at a time (prefetch 1), each of which
//! must be acknowledged explicitly once its task has a terminal outcome.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    BasicQosOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, Consumer};
use tokio::sync::Mutex;

use crate::config::QueueConfig;
use crate::models::ConversionTask;

const PERSISTENT: u8 = 2;

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: &ConversionTask) -> Result<()>;

    /// Parks a payload that will never be processed, with the reason attached.
    async fn dead_letter(&self, payload: &[u8], reason: &str) -> Result<()>;

    /// `true` only when the broker reports no pending messages. Any failure
    /// to inspect the queue reads as "not empty".
    async fn is_empty(&self) -> bool;
}

#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self) -> Result<()>;

    /// Hands the message back to the broker for redelivery.
    async fn requeue(&self) -> Result<()>;
}

/// A message handed to the worker, not yet acknowledged.
pub struct TaskDelivery {
    pub payload: Vec<u8>,
    acker: Box<dyn DeliveryAcker>,
}

impl TaskDelivery {
    pub fn new(payload: Vec<u8>, acker: Box<dyn DeliveryAcker>) -> Self {
        Self { payload, acker }
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn requeue(self) -> Result<()> {
        self.acker.requeue().await
    }
}

#[async_trait]
pub trait TaskSubscription: Send {
    /// Next delivery, or `None` once the subscription has ended.
    async fn next_delivery(&mut self) -> Option<Result<TaskDelivery>>;
}

pub struct AmqpTaskQueue {
    connection: Connection,
    publish: Channel,
    inspect: Mutex<Channel>,
    queue: String,
    dead_letter_queue: String,
}

impl AmqpTaskQueue {
    pub async fn connect(config: &QueueConfig) -> Result<Self> {
        let connection =
            Connection::connect(&config.amqp_uri(), lapin::ConnectionProperties::default())
                .await?;

        let publish = connection.create_channel().await?;
        for name in [&config.converter_queue, &config.dead_letter_queue()] {
            publish
                .queue_declare(
                    name,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await?;
        }

        let inspect = connection.create_channel().await?;

        Ok(Self {
            connection,
            publish,
            inspect: Mutex::new(inspect),
            queue: config.converter_queue.clone(),
            dead_letter_queue: config.dead_letter_queue(),
        })
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    /// Opens a consumer on its own channel with prefetch 1 and manual acks.
    pub async fn subscribe(&self, consumer_tag: &str) -> Result<AmqpSubscription> {
        let channel = self.connection.create_channel().await?;
        channel.basic_qos(1, BasicQosOptions::default()).await?;

        let consumer = channel
            .basic_consume(
                &self.queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        tracing::info!(
            "📬 Consuming '{}' as '{}' (prefetch 1)",
            self.queue,
            consumer_tag
        );

        Ok(AmqpSubscription {
            _channel: channel,
            consumer,
        })
    }

    async fn publish_to(
        &self,
        queue: &str,
        payload: &[u8],
        headers: Option<FieldTable>,
    ) -> Result<()> {
        let mut properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_content_type("application/json".into());
        if let Some(headers) = headers {
            properties = properties.with_headers(headers);
        }

        self.publish
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for AmqpTaskQueue {
    async fn enqueue(&self, task: &ConversionTask) -> Result<()> {
        tracing::debug!("Enqueue '{}' (attempt {})", task.s3key, task.attempt);
        self.publish_to(&self.queue, &task.encode(), None).await
    }

    async fn dead_letter(&self, payload: &[u8], reason: &str) -> Result<()> {
        let mut headers = FieldTable::default();
        headers.insert(
            "x-failure-reason".into(),
            AMQPValue::LongString(reason.into()),
        );
        self.publish_to(&self.dead_letter_queue, payload, Some(headers))
            .await
    }

    async fn is_empty(&self) -> bool {
        let mut channel = self.inspect.lock().await;

        // A failed passive declare closes the channel, so reopen on demand.
        if !channel.status().connected() {
            match self.connection.create_channel().await {
                Ok(fresh) => *channel = fresh,
                Err(e) => {
                    tracing::warn!("Queue inspection channel unavailable: {}", e);
                    return false;
                }
            }
        }

        let declared = channel
            .queue_declare(
                &self.queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await;

        match declared {
            Ok(queue) => {
                tracing::debug!(
                    "Queue '{}' messages: {}",
                    self.queue,
                    queue.message_count()
                );
                queue.message_count() == 0
            }
            Err(e) => {
                tracing::warn!("Failed to inspect queue '{}': {}", self.queue, e);
                false
            }
        }
    }
}

pub struct AmqpSubscription {
    _channel: Channel,
    consumer: Consumer,
}

struct AmqpAcker(lapin::acker::Acker);

#[async_trait]
impl DeliveryAcker for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| anyhow!("ack failed: {}", e))?;
        Ok(())
    }

    async fn requeue(&self) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                requeue: true,
                ..Default::default()
            })
            .await
            .map_err(|e| anyhow!("nack failed: {}", e))?;
        Ok(())
    }
}

#[async_trait]
impl TaskSubscription for AmqpSubscription {
    async fn next_delivery(&mut self) -> Option<Result<TaskDelivery>> {
        let delivery = self.consumer.next().await?;
        Some(
            delivery
                .map(|d| TaskDelivery::new(d.data, Box::new(AmqpAcker(d.acker))))
                .map_err(Into::into),
        )
    }
}
