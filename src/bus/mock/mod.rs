//! Mock pub/sub component for testing.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::{
    BusError, Feature, MessageHandler, NewMessage, PubSub, PublishRequest, Result,
    SubscribeRequest,
};
use crate::delivery::DeliveryError;

/// Mock pub/sub component for testing.
///
/// Records publishes and subscriptions. Tests drive deliveries directly
/// with [`MockPubSub::deliver`].
#[derive(Default)]
pub struct MockPubSub {
    features: Vec<Feature>,
    published: RwLock<Vec<PublishRequest>>,
    subscriptions: RwLock<Vec<SubscribeRequest>>,
    handlers: RwLock<HashMap<String, Vec<Arc<dyn MessageHandler>>>>,
    fail_on_publish: RwLock<bool>,
    fail_on_subscribe: RwLock<bool>,
}

impl MockPubSub {
    pub fn new() -> Self {
        Self::default()
    }

    /// A component that advertises `features`.
    pub fn with_features(features: Vec<Feature>) -> Self {
        Self {
            features,
            ..Self::default()
        }
    }

    pub async fn set_fail_on_publish(&self, fail: bool) {
        *self.fail_on_publish.write().await = fail;
    }

    pub async fn set_fail_on_subscribe(&self, fail: bool) {
        *self.fail_on_subscribe.write().await = fail;
    }

    pub async fn published(&self) -> Vec<PublishRequest> {
        self.published.read().await.clone()
    }

    pub async fn published_count(&self) -> usize {
        self.published.read().await.len()
    }

    pub async fn subscriptions(&self) -> Vec<SubscribeRequest> {
        self.subscriptions.read().await.clone()
    }

    /// Hand `data` to every handler subscribed to `topic`.
    ///
    /// Returns the first handler error, i.e. what a broker would treat as
    /// a redelivery request.
    pub async fn deliver(
        &self,
        topic: &str,
        data: Vec<u8>,
    ) -> std::result::Result<(), DeliveryError> {
        self.deliver_with_cancel(topic, data, CancellationToken::new())
            .await
    }

    pub async fn deliver_with_cancel(
        &self,
        topic: &str,
        data: Vec<u8>,
        cancel: CancellationToken,
    ) -> std::result::Result<(), DeliveryError> {
        let handlers = self
            .handlers
            .read()
            .await
            .get(topic)
            .cloned()
            .unwrap_or_default();
        for handler in handlers {
            let message = NewMessage {
                data: data.clone(),
                topic: topic.to_string(),
                metadata: HashMap::new(),
            };
            handler.handle(message, cancel.clone()).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl PubSub for MockPubSub {
    fn features(&self) -> &[Feature] {
        &self.features
    }

    async fn publish(&self, request: PublishRequest) -> Result<()> {
        if *self.fail_on_publish.read().await {
            return Err(BusError::Publish("Mock publish failure".to_string()));
        }
        self.published.write().await.push(request);
        Ok(())
    }

    async fn subscribe(
        &self,
        request: SubscribeRequest,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        if *self.fail_on_subscribe.read().await {
            return Err(BusError::Subscribe("Mock subscribe failure".to_string()));
        }
        self.handlers
            .write()
            .await
            .entry(request.topic.clone())
            .or_default()
            .push(handler);
        self.subscriptions.write().await.push(request);
        Ok(())
    }
}
