//! Mock application client for testing.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tonic::Status;

use super::AppClient;
use crate::proto::{TopicEventRequest, TopicEventResponse, TopicEventStatus, TopicSubscription};

/// Scripted reply to one `on_topic_event` call.
#[derive(Debug, Clone)]
pub enum MockReply {
    Status(i32),
    Error(Status),
}

impl From<TopicEventStatus> for MockReply {
    fn from(status: TopicEventStatus) -> Self {
        MockReply::Status(status as i32)
    }
}

/// Mock application for testing.
///
/// Replies are consumed in order; once the script is exhausted every call
/// answers `SUCCESS`.
pub struct MockAppClient {
    subscriptions: Mutex<Result<Vec<TopicSubscription>, Status>>,
    replies: Mutex<VecDeque<MockReply>>,
    received: Mutex<Vec<TopicEventRequest>>,
    discovery_calls: Mutex<usize>,
    delay: Mutex<Option<Duration>>,
}

impl MockAppClient {
    pub fn new() -> Self {
        Self {
            subscriptions: Mutex::new(Ok(Vec::new())),
            replies: Mutex::new(VecDeque::new()),
            received: Mutex::new(Vec::new()),
            discovery_calls: Mutex::new(0),
            delay: Mutex::new(None),
        }
    }

    /// Declare the subscriptions returned by discovery.
    pub fn with_subscriptions(self, subscriptions: Vec<TopicSubscription>) -> Self {
        *lock(&self.subscriptions) = Ok(subscriptions);
        self
    }

    /// Make discovery fail with `status`.
    pub fn with_discovery_error(self, status: Status) -> Self {
        *lock(&self.subscriptions) = Err(status);
        self
    }

    /// Delay every `on_topic_event` reply.
    pub fn with_delay(self, delay: Duration) -> Self {
        *lock(&self.delay) = Some(delay);
        self
    }

    pub fn push_reply(&self, reply: impl Into<MockReply>) {
        lock(&self.replies).push_back(reply.into());
    }

    pub fn received(&self) -> Vec<TopicEventRequest> {
        lock(&self.received).clone()
    }

    pub fn received_count(&self) -> usize {
        lock(&self.received).len()
    }

    pub fn discovery_calls(&self) -> usize {
        *lock(&self.discovery_calls)
    }
}

impl Default for MockAppClient {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[async_trait]
impl AppClient for MockAppClient {
    async fn on_topic_event(
        &self,
        request: TopicEventRequest,
    ) -> Result<TopicEventResponse, Status> {
        lock(&self.received).push(request);
        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let reply = lock(&self.replies)
            .pop_front()
            .unwrap_or(MockReply::Status(TopicEventStatus::Success as i32));
        match reply {
            MockReply::Status(status) => Ok(TopicEventResponse { status }),
            MockReply::Error(status) => Err(status),
        }
    }

    async fn list_topic_subscriptions(&self) -> Result<Vec<TopicSubscription>, Status> {
        *lock(&self.discovery_calls) += 1;
        lock(&self.subscriptions).clone()
    }
}
