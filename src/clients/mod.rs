//! Clients for the application's callback service.
//!
//! The runtime calls the application through the `AppClient` trait so
//! delivery code can run against a real gRPC channel or an in-memory mock.

pub mod mock;

use async_trait::async_trait;
use tonic::transport::Channel;
use tonic::Status;

use crate::proto::app_callback_client::AppCallbackClient;
use crate::proto::{
    ListTopicSubscriptionsRequest, TopicEventRequest, TopicEventResponse, TopicSubscription,
};

pub use mock::MockAppClient;

/// Calls the runtime makes against the application.
#[async_trait]
pub trait AppClient: Send + Sync {
    /// Push one event to the application.
    async fn on_topic_event(
        &self,
        request: TopicEventRequest,
    ) -> Result<TopicEventResponse, Status>;

    /// Ask the application which topics it wants pushed to it.
    async fn list_topic_subscriptions(&self) -> Result<Vec<TopicSubscription>, Status>;
}

/// `AppClient` over a tonic channel.
#[derive(Clone)]
pub struct GrpcAppClient {
    client: AppCallbackClient<Channel>,
}

impl GrpcAppClient {
    pub fn new(channel: Channel) -> Self {
        Self {
            client: AppCallbackClient::new(channel),
        }
    }
}

#[async_trait]
impl AppClient for GrpcAppClient {
    async fn on_topic_event(
        &self,
        request: TopicEventRequest,
    ) -> Result<TopicEventResponse, Status> {
        let mut client = self.client.clone();
        let response = client.on_topic_event(request).await?;
        Ok(response.into_inner())
    }

    async fn list_topic_subscriptions(&self) -> Result<Vec<TopicSubscription>, Status> {
        let mut client = self.client.clone();
        let response = client
            .list_topic_subscriptions(ListTopicSubscriptionsRequest {})
            .await?;
        Ok(response.into_inner().subscriptions)
    }
}
