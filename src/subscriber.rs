//! Broker subscriptions for both delivery paths.
//!
//! - Push: at startup every topic the application declared is subscribed
//!   with a handler that calls `OnTopicEvent`.
//! - Streaming: each attached stream subscribes its topic on first attach
//!   and feeds the broker's deliveries into the stream.

use std::sync::Arc;

use futures::Stream;
use tonic::Status;
use tracing::{error, info, warn};

use crate::bus::{BusError, SubscribeRequest};
use crate::delivery::stream::Outbound;
use crate::delivery::{CallbackDelivery, CallbackHandler, StreamHandler};
use crate::proto::{
    subscribe_topic_events_response, SubscribeTopicEventsRequest,
    SubscribeTopicEventsRequestInitial, SubscribeTopicEventsResponse,
    SubscribeTopicEventsResponseInitial,
};
use crate::registry::Details;
use crate::state::RuntimeState;

/// Errors raised while subscribing at startup.
#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    #[error("failed to subscribe to topic {topic} on pubsub {pubsub}: {source}")]
    Subscribe {
        pubsub: String,
        topic: String,
        #[source]
        source: BusError,
    },
}

/// Wires broker components to the delivery paths.
#[derive(Clone)]
pub struct Subscriber {
    state: Arc<RuntimeState>,
}

impl Subscriber {
    pub fn new(state: Arc<RuntimeState>) -> Self {
        Self { state }
    }

    /// Subscribe every topic the application declared for push delivery.
    ///
    /// Topics of components that are not configured are skipped.
    #[tracing::instrument(name = "subscriber.start", skip_all)]
    pub async fn start_subscribing(&self) -> Result<(), SubscribeError> {
        if self.state.pubsubs().is_empty() {
            return Ok(());
        }
        let Some(app) = self.state.app() else {
            return Ok(());
        };

        let delivery = Arc::new(CallbackDelivery::new(Arc::clone(app)));
        let interested = self.state.registry().interested_topics().await;

        for (pubsub_name, topics) in interested {
            let Some(pubsub) = self.state.pubsub(&pubsub_name) else {
                warn!(
                    pubsub = %pubsub_name,
                    "App subscribed to topics of a pub/sub component that is not configured"
                );
                continue;
            };
            let handler = Arc::new(CallbackHandler::new(
                pubsub_name.clone(),
                Arc::clone(&delivery),
            ));

            for (topic, details) in topics {
                let request = SubscribeRequest {
                    topic: topic.clone(),
                    metadata: details.metadata,
                    dead_letter_topic: details.dead_letter_topic,
                };
                pubsub
                    .subscribe(request, handler.clone())
                    .await
                    .map_err(|source| SubscribeError::Subscribe {
                        pubsub: pubsub_name.clone(),
                        topic: topic.clone(),
                        source,
                    })?;
                info!(pubsub = %pubsub_name, topic = %topic, "Subscribed for push delivery");
            }
        }
        Ok(())
    }

    /// Attach a client stream after its initial request.
    ///
    /// On success the initial response has been queued on `outbound` and a
    /// receive loop owns `inbound` until the client goes away.
    #[tracing::instrument(
        name = "subscriber.attach_stream",
        skip_all,
        fields(pubsub = %initial.pubsub_name, topic = %initial.topic)
    )]
    pub async fn attach_stream<S>(
        &self,
        initial: SubscribeTopicEventsRequestInitial,
        inbound: S,
        outbound: Outbound,
    ) -> Result<(), Status>
    where
        S: Stream<Item = Result<SubscribeTopicEventsRequest, Status>> + Unpin + Send + 'static,
    {
        let SubscribeTopicEventsRequestInitial {
            pubsub_name,
            topic,
            metadata,
            dead_letter_topic,
        } = initial;

        if pubsub_name.is_empty() {
            return Err(Status::invalid_argument("pubsubName is required"));
        }
        if topic.is_empty() {
            return Err(Status::invalid_argument("topic is required"));
        }
        let Some(pubsub) = self.state.pubsub(&pubsub_name).cloned() else {
            return Err(Status::failed_precondition(format!(
                "pubsub {pubsub_name} is not initialized"
            )));
        };

        let streamer = Arc::clone(self.state.streamer());
        let connection = streamer
            .attach(&pubsub_name, &topic, outbound)
            .await
            .map_err(|e| Status::already_exists(e.to_string()))?;

        let dead_letter_topic = dead_letter_topic.filter(|topic| !topic.is_empty());
        self.state
            .registry()
            .register_topic(
                &pubsub_name,
                &topic,
                Details {
                    metadata: metadata.clone(),
                    dead_letter_topic: dead_letter_topic.clone(),
                },
            )
            .await;

        let initial_response = SubscribeTopicEventsResponse {
            kind: Some(subscribe_topic_events_response::Kind::InitialResponse(
                SubscribeTopicEventsResponseInitial {},
            )),
        };
        if !connection.send(initial_response).await {
            streamer.detach(&connection).await;
            return Err(Status::cancelled("client stream closed before attach completed"));
        }

        if streamer.claim_broker_subscription(&pubsub_name, &topic) {
            let request = SubscribeRequest {
                topic: topic.clone(),
                metadata,
                dead_letter_topic,
            };
            let handler = Arc::new(StreamHandler::new(
                pubsub_name.clone(),
                Arc::clone(&streamer),
            ));
            if let Err(e) = pubsub.subscribe(request, handler).await {
                error!(error = %e, "Failed to subscribe streaming topic");
                streamer.release_broker_subscription(&pubsub_name, &topic);
                streamer.detach(&connection).await;
                return Err(Status::internal(format!(
                    "failed to subscribe to topic {topic}: {e}"
                )));
            }
        }

        tokio::spawn(async move {
            if let Err(status) = streamer.receive(connection, inbound).await {
                warn!(
                    pubsub = %pubsub_name,
                    topic = %topic,
                    error = %status,
                    "Streaming subscription ended with error"
                );
            }
        });
        Ok(())
    }
}
