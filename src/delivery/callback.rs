//! Callback-push delivery: one `OnTopicEvent` call per message.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use super::{open, resolve, DeliveryError};
use crate::bus::{MessageHandler, NewMessage, PUBSUB_NAME_METADATA_KEY};
use crate::clients::AppClient;
use crate::envelope::Envelope;
use crate::proto::TopicEventRequest;

/// Pushes envelopes to the application's callback service.
pub struct CallbackDelivery {
    app: Arc<dyn AppClient>,
}

impl CallbackDelivery {
    pub fn new(app: Arc<dyn AppClient>) -> Self {
        Self { app }
    }

    /// Deliver one envelope and resolve the application's reply.
    ///
    /// Returns `Cancelled` if `cancel` fires before the application answers.
    #[tracing::instrument(
        name = "delivery.push",
        skip_all,
        fields(id = %envelope.id, pubsub = %envelope.pubsub_name, topic = %envelope.topic)
    )]
    pub async fn deliver(
        &self,
        envelope: Envelope,
        cancel: &CancellationToken,
    ) -> Result<(), DeliveryError> {
        let id = envelope.id.clone();
        let request = TopicEventRequest::from(envelope);

        let reply = tokio::select! {
            _ = cancel.cancelled() => return Err(DeliveryError::Cancelled { id }),
            reply = self.app.on_topic_event(request) => reply,
        };

        resolve(&id, reply.map(|response| response.status)).into_result()
    }
}

/// Broker handler for topics the application declared through discovery.
pub struct CallbackHandler {
    pubsub_name: String,
    delivery: Arc<CallbackDelivery>,
}

impl CallbackHandler {
    pub fn new(pubsub_name: impl Into<String>, delivery: Arc<CallbackDelivery>) -> Self {
        Self {
            pubsub_name: pubsub_name.into(),
            delivery,
        }
    }
}

impl MessageHandler for CallbackHandler {
    fn handle(
        &self,
        mut message: NewMessage,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<(), DeliveryError>> {
        message
            .metadata
            .insert(PUBSUB_NAME_METADATA_KEY.to_string(), self.pubsub_name.clone());
        let delivery = Arc::clone(&self.delivery);
        Box::pin(async move {
            let Some(envelope) = open(&message) else {
                return Ok(());
            };
            delivery.deliver(envelope, &cancel).await
        })
    }
}
