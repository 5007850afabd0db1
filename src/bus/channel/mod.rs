//! In-memory channel-based pub/sub component.
//!
//! Uses one tokio broadcast channel per topic. Ideal for local development
//! and testing without external dependencies.
//!
//! Unlike an external broker this component owns redelivery itself: a
//! failed delivery is retried with exponential backoff, and once retries
//! are exhausted the message goes to the subscription's dead-letter topic
//! (or is dropped when none is set).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::BackoffBuilder;
use tokio::sync::{broadcast, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    BusError, ChannelBusConfig, MessageHandler, NewMessage, PubSub, PublishRequest, Result,
    SubscribeRequest,
};
use crate::delivery::DeliveryError;
use crate::utils::retry::redelivery_backoff;

/// Configuration for the channel component.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Broadcast buffer per topic.
    pub capacity: usize,
    /// Redelivery attempts after the first failed delivery.
    pub max_redeliveries: usize,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    /// How long a delivery may run before its token is cancelled.
    pub ack_deadline: Duration,
    /// Concurrent deliveries per subscription. 1 preserves publish order.
    pub max_in_flight: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::from(&ChannelBusConfig::default())
    }
}

impl From<&ChannelBusConfig> for ChannelConfig {
    fn from(config: &ChannelBusConfig) -> Self {
        Self {
            capacity: config.capacity.max(1),
            max_redeliveries: config.max_redeliveries,
            min_backoff: Duration::from_millis(config.min_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            ack_deadline: Duration::from_millis(config.ack_deadline_ms),
            max_in_flight: config.max_in_flight.max(1),
        }
    }
}

/// Broadcast senders keyed by topic.
struct Topics {
    capacity: usize,
    senders: RwLock<HashMap<String, broadcast::Sender<Arc<NewMessage>>>>,
}

impl Topics {
    async fn receiver(&self, topic: &str) -> broadcast::Receiver<Arc<NewMessage>> {
        self.senders
            .write()
            .await
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Returns the number of subscriptions that received the message.
    async fn publish(&self, message: NewMessage) -> usize {
        let senders = self.senders.read().await;
        match senders.get(&message.topic) {
            Some(sender) => sender.send(Arc::new(message)).unwrap_or(0),
            None => 0,
        }
    }

    async fn clear(&self) {
        self.senders.write().await.clear();
    }
}

/// In-memory pub/sub component using tokio broadcast channels.
///
/// Every subscription receives every message published to its topic.
pub struct ChannelPubSub {
    config: ChannelConfig,
    topics: Arc<Topics>,
    shutdown: CancellationToken,
}

impl ChannelPubSub {
    /// Create a new channel component.
    pub fn new(config: ChannelConfig) -> Self {
        info!(
            capacity = config.capacity,
            max_redeliveries = config.max_redeliveries,
            max_in_flight = config.max_in_flight,
            "Channel pub/sub initialized"
        );

        Self {
            topics: Arc::new(Topics {
                capacity: config.capacity,
                senders: RwLock::new(HashMap::new()),
            }),
            config,
            shutdown: CancellationToken::new(),
        }
    }
}

impl Default for ChannelPubSub {
    fn default() -> Self {
        Self::new(ChannelConfig::default())
    }
}

#[async_trait]
impl PubSub for ChannelPubSub {
    #[tracing::instrument(name = "bus.publish", skip_all, fields(topic = %request.topic))]
    async fn publish(&self, request: PublishRequest) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(BusError::Closed);
        }

        let topic = request.topic.clone();
        let receivers = self
            .topics
            .publish(NewMessage {
                data: request.data,
                topic: request.topic,
                metadata: request.metadata,
            })
            .await;

        if receivers == 0 {
            debug!(topic = %topic, "Published message (no receivers)");
        } else {
            debug!(topic = %topic, receivers, "Published message to channel");
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        request: SubscribeRequest,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(BusError::Closed);
        }

        let mut receiver = self.topics.receiver(&request.topic).await;
        let subscription = Arc::new(Subscription {
            topic: request.topic,
            dead_letter_topic: request.dead_letter_topic.filter(|t| !t.is_empty()),
            handler,
            config: self.config.clone(),
            topics: Arc::clone(&self.topics),
            shutdown: self.shutdown.clone(),
        });
        let in_flight = Arc::new(Semaphore::new(self.config.max_in_flight));
        let shutdown = self.shutdown.clone();

        info!(
            topic = %subscription.topic,
            dead_letter_topic = ?subscription.dead_letter_topic,
            "Channel subscription started"
        );

        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = receiver.recv() => match received {
                        Ok(message) => message,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            error!(
                                topic = %subscription.topic,
                                skipped = n,
                                "Channel consumer lagged, skipped messages"
                            );
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };

                let permit = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    permit = Arc::clone(&in_flight).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                let subscription = Arc::clone(&subscription);
                tokio::spawn(async move {
                    subscription.deliver(message).await;
                    drop(permit);
                });
            }
            info!(topic = %subscription.topic, "Channel consumer stopped");
        });

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        self.topics.clear().await;
        Ok(())
    }
}

/// One topic subscription and its redelivery policy.
struct Subscription {
    topic: String,
    dead_letter_topic: Option<String>,
    handler: Arc<dyn MessageHandler>,
    config: ChannelConfig,
    topics: Arc<Topics>,
    shutdown: CancellationToken,
}

impl Subscription {
    async fn deliver(&self, message: Arc<NewMessage>) {
        let backoff = redelivery_backoff(
            self.config.min_backoff,
            self.config.max_backoff,
            self.config.max_redeliveries,
        )
        .build();

        let mut last_error = None;
        for (attempt, delay) in std::iter::once(Duration::ZERO)
            .chain(backoff)
            .enumerate()
        {
            if !delay.is_zero() {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            match self.attempt(&message).await {
                Ok(()) => return,
                Err(e) => {
                    debug!(
                        topic = %self.topic,
                        attempt = attempt + 1,
                        error = %e,
                        "Delivery failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        self.give_up(&message, last_error).await;
    }

    /// One delivery attempt, cancelled once the ack deadline passes.
    async fn attempt(&self, message: &NewMessage) -> std::result::Result<(), DeliveryError> {
        let cancel = self.shutdown.child_token();
        let mut handled = self.handler.handle(message.clone(), cancel.clone());

        tokio::select! {
            result = &mut handled => return result,
            _ = tokio::time::sleep(self.config.ack_deadline) => {
                warn!(topic = %self.topic, "Delivery exceeded ack deadline, cancelling");
                cancel.cancel();
            }
        }
        handled.await
    }

    async fn give_up(&self, message: &NewMessage, last_error: Option<DeliveryError>) {
        let error = last_error.map(|e| e.to_string()).unwrap_or_default();
        match &self.dead_letter_topic {
            Some(dead_letter_topic) => {
                let receivers = self
                    .topics
                    .publish(NewMessage {
                        data: message.data.clone(),
                        topic: dead_letter_topic.clone(),
                        metadata: message.metadata.clone(),
                    })
                    .await;
                warn!(
                    topic = %self.topic,
                    dead_letter_topic = %dead_letter_topic,
                    receivers,
                    error = %error,
                    "Redeliveries exhausted, message moved to dead-letter topic"
                );
            }
            None => error!(
                topic = %self.topic,
                error = %error,
                "Redeliveries exhausted, dropping message"
            ),
        }
    }
}
