//! AMQP (RabbitMQ) pub/sub component.
//!
//! Publishes to a durable topic exchange with the topic as routing key.
//! Each subscription consumes a durable queue named `{consumer_group}.{topic}`
//! bound to that routing key. Handler success acks the delivery, failure
//! nacks it with requeue so RabbitMQ redelivers it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::BackoffBuilder;
use deadpool_lapin::{Manager, Pool, PoolError};
use futures::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, ExchangeKind,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    AmqpBusConfig, BusError, MessageHandler, NewMessage, PubSub, PublishRequest, Result,
    SubscribeRequest,
};
use crate::utils::retry::{redelivery_backoff, reconnect_backoff};

/// Attempts per publish before giving up.
const MAX_PUBLISH_RETRIES: usize = 5;

/// Configuration for AMQP connection.
#[derive(Clone, Debug)]
pub struct AmqpConfig {
    /// AMQP connection URL (e.g., amqp://localhost:5672).
    pub url: String,
    /// Topic exchange to publish to and bind from.
    pub exchange: String,
    /// Prefix of every queue this component declares.
    pub consumer_group: String,
    /// How long a delivery may run before its token is cancelled.
    pub ack_deadline: Duration,
}

impl From<&AmqpBusConfig> for AmqpConfig {
    fn from(config: &AmqpBusConfig) -> Self {
        Self {
            url: config.url.clone(),
            exchange: config.exchange.clone(),
            consumer_group: config.consumer_group.clone(),
            ack_deadline: Duration::from_millis(config.ack_deadline_ms),
        }
    }
}

impl AmqpConfig {
    fn queue_name(&self, topic: &str) -> String {
        format!("{}.{}", self.consumer_group, topic)
    }
}

/// AMQP pub/sub component using RabbitMQ.
pub struct AmqpPubSub {
    pool: Pool,
    config: AmqpConfig,
    shutdown: CancellationToken,
}

impl AmqpPubSub {
    /// Connect and declare the exchange.
    pub async fn new(config: AmqpConfig) -> Result<Self> {
        let manager = Manager::new(config.url.clone(), Default::default());
        let pool = Pool::builder(manager)
            .max_size(10)
            .build()
            .map_err(|e| BusError::Connection(format!("Failed to create pool: {}", e)))?;

        let channel = get_channel(&pool).await?;
        channel
            .exchange_declare(
                &config.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Connection(format!("Failed to declare exchange: {}", e)))?;

        info!(
            exchange = %config.exchange,
            url = %config.url,
            "Connected to AMQP"
        );

        Ok(Self {
            pool,
            config,
            shutdown: CancellationToken::new(),
        })
    }
}

async fn get_channel(pool: &Pool) -> Result<Channel> {
    let conn = pool.get().await.map_err(|e: PoolError| {
        BusError::Connection(format!("Failed to get connection from pool: {}", e))
    })?;

    conn.create_channel()
        .await
        .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))
}

fn to_headers(metadata: &HashMap<String, String>) -> FieldTable {
    let mut headers = FieldTable::default();
    for (key, value) in metadata {
        headers.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }
    headers
}

fn from_headers(properties: &BasicProperties) -> HashMap<String, String> {
    let Some(headers) = properties.headers() else {
        return HashMap::new();
    };
    headers
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            value.as_long_string().map(|value| {
                (
                    key.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
        })
        .collect()
}

/// One queue consumer feeding a handler.
struct Consumer {
    pool: Pool,
    config: AmqpConfig,
    topic: String,
    dead_letter_topic: Option<String>,
    handler: Arc<dyn MessageHandler>,
    shutdown: CancellationToken,
}

impl Consumer {
    fn queue(&self) -> String {
        self.config.queue_name(&self.topic)
    }

    /// Consumer loop with automatic reconnection and exponential backoff with jitter.
    async fn run(self) {
        let queue = self.queue();
        let mut backoff = reconnect_backoff().build();

        loop {
            let consumer = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                consumer = self.setup() => consumer,
            };

            match consumer {
                Ok(mut consumer) => {
                    info!(queue = %queue, topic = %self.topic, "Consumer connected, processing messages");
                    backoff = reconnect_backoff().build();

                    loop {
                        let delivery = tokio::select! {
                            _ = self.shutdown.cancelled() => break,
                            delivery = consumer.next() => delivery,
                        };
                        match delivery {
                            Some(Ok(delivery)) => self.process(delivery).await,
                            Some(Err(e)) => {
                                error!(error = %e, "Consumer delivery error, will reconnect");
                                break;
                            }
                            None => break,
                        }
                    }

                    if self.shutdown.is_cancelled() {
                        break;
                    }
                    info!(queue = %queue, "Consumer stream ended, reconnecting...");
                }
                Err(e) => {
                    error!(
                        error = %e,
                        queue = %queue,
                        "Failed to set up consumer, retrying after backoff"
                    );
                }
            }

            let delay = backoff.next().unwrap_or(Duration::from_secs(30));
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!(queue = %queue, "Consumer stopped");
    }

    /// Declare queue, bind to exchange, and start consuming.
    async fn setup(&self) -> Result<lapin::Consumer> {
        let channel = get_channel(&self.pool).await?;
        let queue = self.queue();

        let mut arguments = FieldTable::default();
        if let Some(dead_letter_topic) = &self.dead_letter_topic {
            arguments.insert(
                ShortString::from("x-dead-letter-exchange"),
                AMQPValue::LongString(LongString::from(self.config.exchange.clone())),
            );
            arguments.insert(
                ShortString::from("x-dead-letter-routing-key"),
                AMQPValue::LongString(LongString::from(dead_letter_topic.clone())),
            );
        }

        channel
            .queue_declare(
                &queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to declare queue: {}", e)))?;

        channel
            .queue_bind(
                &queue,
                &self.config.exchange,
                &self.topic,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to bind queue: {}", e)))?;

        info!(queue = %queue, topic = %self.topic, "Bound queue to exchange");

        channel
            .basic_consume(
                &queue,
                &format!("courier-{}", uuid::Uuid::new_v4()),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to start consumer: {}", e)))
    }

    /// Hand one delivery to the handler and settle it with the broker.
    async fn process(&self, delivery: Delivery) {
        debug!(routing_key = %delivery.routing_key, "Received message");

        let message = NewMessage {
            data: delivery.data.clone(),
            topic: self.topic.clone(),
            metadata: from_headers(&delivery.properties),
        };

        let cancel = self.shutdown.child_token();
        let mut handled = self.handler.handle(message, cancel.clone());
        let finished = tokio::select! {
            result = &mut handled => Some(result),
            _ = tokio::time::sleep(self.config.ack_deadline) => {
                warn!(topic = %self.topic, "Delivery exceeded ack deadline, cancelling");
                cancel.cancel();
                None
            }
        };
        let result = match finished {
            Some(result) => result,
            None => handled.await,
        };

        match result {
            Ok(()) => {
                if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                    error!(error = %e, "Failed to ack message");
                }
            }
            Err(err) => {
                // A redelivered failure goes to the dead-letter exchange when one is set.
                let requeue = !(delivery.redelivered && self.dead_letter_topic.is_some());
                debug!(
                    topic = %self.topic,
                    error = %err,
                    requeue,
                    "Handler failed, nacking message"
                );
                if let Err(e) = delivery
                    .nack(BasicNackOptions {
                        requeue,
                        ..Default::default()
                    })
                    .await
                {
                    error!(error = %e, "Failed to nack message");
                }
            }
        }
    }
}

#[async_trait]
impl PubSub for AmqpPubSub {
    #[tracing::instrument(name = "bus.publish", skip_all, fields(topic = %request.topic))]
    async fn publish(&self, request: PublishRequest) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(BusError::Closed);
        }

        let backoff = redelivery_backoff(
            Duration::from_millis(100),
            Duration::from_secs(5),
            MAX_PUBLISH_RETRIES,
        )
        .build();

        let mut last_error = None;

        for (attempt, delay) in std::iter::once(Duration::ZERO).chain(backoff).enumerate() {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }

            // Fresh channel per attempt so a dropped connection is replaced.
            let channel = match get_channel(&self.pool).await {
                Ok(channel) => channel,
                Err(e) => {
                    error!(
                        attempt = attempt + 1,
                        max_retries = MAX_PUBLISH_RETRIES,
                        error = %e,
                        "Failed to get channel, retrying..."
                    );
                    last_error = Some(e);
                    continue;
                }
            };

            let properties = BasicProperties::default()
                .with_content_type("application/cloudevents+json".into())
                .with_delivery_mode(2)
                .with_headers(to_headers(&request.metadata));

            match channel
                .basic_publish(
                    &self.config.exchange,
                    &request.topic,
                    BasicPublishOptions::default(),
                    &request.data,
                    properties,
                )
                .await
            {
                Ok(confirm) => match confirm.await {
                    Ok(_) => {
                        debug!(
                            exchange = %self.config.exchange,
                            topic = %request.topic,
                            "Published message"
                        );
                        return Ok(());
                    }
                    Err(e) => {
                        error!(
                            attempt = attempt + 1,
                            max_retries = MAX_PUBLISH_RETRIES,
                            error = %e,
                            "Publish confirmation failed, retrying..."
                        );
                        last_error = Some(BusError::Publish(format!(
                            "Publish confirmation failed: {}",
                            e
                        )));
                    }
                },
                Err(e) => {
                    error!(
                        attempt = attempt + 1,
                        max_retries = MAX_PUBLISH_RETRIES,
                        error = %e,
                        "Publish failed, retrying..."
                    );
                    last_error = Some(BusError::Publish(format!("Failed to publish: {}", e)));
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| BusError::Publish("Publish failed after retries".to_string())))
    }

    async fn subscribe(
        &self,
        request: SubscribeRequest,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(BusError::Closed);
        }

        let consumer = Consumer {
            pool: self.pool.clone(),
            config: self.config.clone(),
            topic: request.topic,
            dead_letter_topic: request.dead_letter_topic.filter(|t| !t.is_empty()),
            handler,
            shutdown: self.shutdown.clone(),
        };
        info!(
            queue = %consumer.queue(),
            topic = %consumer.topic,
            "AMQP subscription started"
        );
        tokio::spawn(consumer.run());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        self.pool.close();
        Ok(())
    }
}
