//! Pub/sub broker components.
//!
//! This module contains:
//! - `PubSub` trait: the capability a broker component exposes
//! - `MessageHandler` trait: receives each delivered message
//! - Component configuration types and the by-name factory
//! - Implementations: Channel (in-process), AMQP (RabbitMQ), Mock

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::delivery::DeliveryError;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
#[cfg(feature = "channel")]
pub mod channel;
pub mod mock;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::{AmqpConfig, AmqpPubSub};
#[cfg(feature = "channel")]
pub use channel::{ChannelConfig, ChannelPubSub};
pub use mock::MockPubSub;

/// Metadata key under which the originating component name travels with a message.
pub const PUBSUB_NAME_METADATA_KEY: &str = "pubsubName";

// ============================================================================
// Traits
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Component is closed")]
    Closed,
}

/// A message as delivered by a broker component.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewMessage {
    /// Raw payload, normally a JSON CloudEvent.
    pub data: Vec<u8>,
    /// Topic the message was delivered on.
    pub topic: String,
    /// Broker and routing metadata.
    pub metadata: HashMap<String, String>,
}

/// Request to subscribe a handler to one topic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub topic: String,
    pub metadata: HashMap<String, String>,
    /// Where the component parks messages it gives up redelivering.
    pub dead_letter_topic: Option<String>,
}

/// Request to publish one payload to a topic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishRequest {
    pub pubsub_name: String,
    pub topic: String,
    pub data: Vec<u8>,
    pub metadata: HashMap<String, String>,
}

/// Optional capabilities a component may implement natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    /// The component expires messages itself; the runtime must not stamp
    /// an `expiration` on the envelope.
    MessageTtl,
}

/// Handler for messages delivered by a component.
///
/// `Ok` acknowledges the message. `Err` asks the component to redeliver it
/// according to its own retry policy. The token is cancelled when the
/// component stops waiting for this delivery.
pub trait MessageHandler: Send + Sync {
    fn handle(
        &self,
        message: NewMessage,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, std::result::Result<(), DeliveryError>>;
}

/// Capability exposed by a pub/sub broker component.
///
/// Implementations:
/// - `ChannelPubSub`: in-process broadcast channels
/// - `AmqpPubSub`: RabbitMQ via AMQP
/// - `MockPubSub`: in-memory double for testing
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Capabilities this component implements natively.
    fn features(&self) -> &[Feature] {
        &[]
    }

    /// Publish one payload.
    async fn publish(&self, request: PublishRequest) -> Result<()>;

    /// Subscribe a handler to a topic.
    ///
    /// The handler is invoked once per delivered message from the
    /// component's own tasks. There is no unsubscribe; a subscription lives
    /// until the component is closed.
    async fn subscribe(
        &self,
        request: SubscribeRequest,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()>;

    /// Stop delivering and release broker resources.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Component type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PubSubType {
    /// In-process broadcast channels.
    #[default]
    Channel,
    /// AMQP/RabbitMQ.
    Amqp,
}

/// Configuration for one named pub/sub component (discriminated union).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PubSubConfig {
    /// Name applications use to address this component.
    pub name: String,
    /// Component type discriminator.
    #[serde(rename = "type")]
    pub pubsub_type: PubSubType,
    /// Channel-specific configuration.
    pub channel: ChannelBusConfig,
    /// AMQP-specific configuration.
    pub amqp: AmqpBusConfig,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            name: "pubsub".to_string(),
            pubsub_type: PubSubType::Channel,
            channel: ChannelBusConfig::default(),
            amqp: AmqpBusConfig::default(),
        }
    }
}

/// Channel-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelBusConfig {
    /// Broadcast buffer per topic.
    pub capacity: usize,
    /// Redelivery attempts after the first failed delivery.
    pub max_redeliveries: usize,
    /// Initial redelivery backoff in milliseconds.
    pub min_backoff_ms: u64,
    /// Redelivery backoff cap in milliseconds.
    pub max_backoff_ms: u64,
    /// Milliseconds before an unacknowledged delivery is cancelled.
    pub ack_deadline_ms: u64,
    /// Concurrent deliveries per subscription. 1 preserves order.
    pub max_in_flight: usize,
}

impl Default for ChannelBusConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            max_redeliveries: 3,
            min_backoff_ms: 100,
            max_backoff_ms: 5_000,
            ack_deadline_ms: 30_000,
            max_in_flight: 16,
        }
    }
}

/// AMQP-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AmqpBusConfig {
    /// AMQP connection URL.
    pub url: String,
    /// Topic exchange to publish to and bind from.
    pub exchange: String,
    /// Consumer group; queues are named `{group}.{topic}`.
    pub consumer_group: String,
    /// Milliseconds before an unacknowledged delivery is cancelled.
    pub ack_deadline_ms: u64,
}

impl Default for AmqpBusConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            exchange: "courier.events".to_string(),
            consumer_group: "courier".to_string(),
            ack_deadline_ms: 30_000,
        }
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize one component based on its configuration.
///
/// Requires the corresponding feature to be enabled:
/// - Channel: `--features channel` (included in default)
/// - AMQP: `--features amqp`
pub async fn init_pubsub(
    config: &PubSubConfig,
) -> std::result::Result<Arc<dyn PubSub>, Box<dyn std::error::Error + Send + Sync>> {
    match config.pubsub_type {
        PubSubType::Channel => {
            #[cfg(feature = "channel")]
            {
                let bus = ChannelPubSub::new(ChannelConfig::from(&config.channel));
                info!(pubsub = %config.name, pubsub_type = "channel", "Pub/sub component initialized");
                Ok(Arc::new(bus))
            }

            #[cfg(not(feature = "channel"))]
            {
                Err("Channel support requires the 'channel' feature. Rebuild with --features channel".into())
            }
        }
        PubSubType::Amqp => {
            #[cfg(feature = "amqp")]
            {
                let bus = AmqpPubSub::new(AmqpConfig::from(&config.amqp)).await?;
                info!(pubsub = %config.name, pubsub_type = "amqp", "Pub/sub component initialized");
                Ok(Arc::new(bus))
            }

            #[cfg(not(feature = "amqp"))]
            {
                Err("AMQP support requires the 'amqp' feature. Rebuild with --features amqp".into())
            }
        }
    }
}

/// Initialize every configured component, keyed by name.
pub async fn init_pubsubs(
    configs: &[PubSubConfig],
) -> std::result::Result<HashMap<String, Arc<dyn PubSub>>, Box<dyn std::error::Error + Send + Sync>>
{
    let mut pubsubs = HashMap::with_capacity(configs.len());
    for config in configs {
        if pubsubs.contains_key(&config.name) {
            return Err(format!("duplicate pub/sub component name '{}'", config.name).into());
        }
        let pubsub = init_pubsub(config).await?;
        pubsubs.insert(config.name.clone(), pubsub);
    }
    Ok(pubsubs)
}
