//! `courier.v1.Runtime`: publishing and streaming subscriptions.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::error;

use crate::bus::PublishRequest;
use crate::envelope::{
    apply_metadata, encode, from_cloud_event, is_cloud_event_content_type, new_cloud_event,
};
use crate::proto::runtime_server::{Runtime, RuntimeServer};
use crate::proto::{
    subscribe_topic_events_request, PublishEventRequest, PublishEventResponse,
    SubscribeTopicEventsRequest, SubscribeTopicEventsResponse,
};
use crate::state::RuntimeState;
use crate::subscriber::Subscriber;

/// Runtime service implementation.
pub struct RuntimeService {
    state: Arc<RuntimeState>,
    subscriber: Subscriber,
}

impl RuntimeService {
    pub fn new(state: Arc<RuntimeState>) -> Self {
        Self {
            subscriber: Subscriber::new(Arc::clone(&state)),
            state,
        }
    }

    pub fn into_server(self) -> RuntimeServer<Self> {
        RuntimeServer::new(self)
    }
}

#[tonic::async_trait]
impl Runtime for RuntimeService {
    #[tracing::instrument(
        name = "runtime.publish_event",
        skip_all,
        fields(pubsub = %request.get_ref().pubsub_name, topic = %request.get_ref().topic)
    )]
    async fn publish_event(
        &self,
        request: Request<PublishEventRequest>,
    ) -> Result<Response<PublishEventResponse>, Status> {
        let PublishEventRequest {
            pubsub_name,
            topic,
            data,
            data_content_type,
            metadata,
        } = request.into_inner();

        if pubsub_name.is_empty() {
            return Err(Status::invalid_argument("pubsub name is empty"));
        }
        if topic.is_empty() {
            return Err(Status::invalid_argument(format!(
                "topic is empty in pubsub {pubsub_name}"
            )));
        }
        let pubsub = self
            .state
            .pubsub(&pubsub_name)
            .ok_or_else(|| Status::invalid_argument(format!("pubsub {pubsub_name} not found")))?;

        let event = if is_cloud_event_content_type(&data_content_type) {
            from_cloud_event(&data, &topic, &pubsub_name)
        } else {
            new_cloud_event(&data, &data_content_type, &topic, &pubsub_name)
        };
        let mut event = event.map_err(|e| {
            Status::invalid_argument(format!("cannot create cloudevent: {e}"))
        })?;
        apply_metadata(&mut event, pubsub.features(), &metadata);

        let data = encode(event).map_err(|e| {
            Status::invalid_argument(format!(
                "error when marshal cloud event envelope for topic {topic} pubsub {pubsub_name}: {e}"
            ))
        })?;

        pubsub
            .publish(PublishRequest {
                pubsub_name: pubsub_name.clone(),
                topic: topic.clone(),
                data,
                metadata,
            })
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to publish event");
                Status::internal(format!(
                    "error when publish to topic {topic} in pubsub {pubsub_name}: {e}"
                ))
            })?;

        Ok(Response::new(PublishEventResponse {}))
    }

    type SubscribeTopicEventsStream = ReceiverStream<Result<SubscribeTopicEventsResponse, Status>>;

    async fn subscribe_topic_events(
        &self,
        request: Request<Streaming<SubscribeTopicEventsRequest>>,
    ) -> Result<Response<Self::SubscribeTopicEventsStream>, Status> {
        let mut inbound = request.into_inner();

        let initial = match inbound.message().await?.and_then(|request| request.kind) {
            Some(subscribe_topic_events_request::Kind::InitialRequest(initial)) => initial,
            _ => {
                return Err(Status::invalid_argument(
                    "initial request is required to subscribe to topic events",
                ))
            }
        };

        let (tx, rx) = mpsc::channel(self.state.stream_buffer());
        self.subscriber.attach_stream(initial, inbound, tx).await?;

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}
