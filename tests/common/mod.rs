//! Shared harness for runtime integration tests.
//!
//! Serves the runtime (and optionally an application callback server) on
//! ephemeral loopback ports and hands back connected clients.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::transport::{Channel, Server};
use tonic::{Request, Response, Status, Streaming};

use courier::bus::{ChannelConfig, ChannelPubSub, PubSub};
use courier::clients::{AppClient, GrpcAppClient};
use courier::proto::app_callback_server::{AppCallback, AppCallbackServer};
use courier::proto::runtime_client::RuntimeClient;
use courier::proto::{
    subscribe_topic_events_request, subscribe_topic_events_response,
    ListTopicSubscriptionsRequest, ListTopicSubscriptionsResponse, PublishEventRequest,
    SubscribeTopicEventsRequest, SubscribeTopicEventsRequestInitial,
    SubscribeTopicEventsRequestProcessed, SubscribeTopicEventsResponse, TopicEventRequest,
    TopicEventResponse, TopicEventStatus, TopicSubscription,
};
use courier::services::RuntimeService;
use courier::state::RuntimeState;
use courier::subscriber::Subscriber;
use courier::transport::connect_to_address;

/// Name of the single pub/sub component every harness runtime carries.
pub const PUBSUB: &str = "pubsub";

/// How long tests wait for an expected frame or callback.
pub const WAIT: Duration = Duration::from_secs(5);

/// Channel component tuned for fast redelivery.
pub fn fast_channel() -> ChannelPubSub {
    ChannelPubSub::new(ChannelConfig {
        capacity: 64,
        max_redeliveries: 2,
        min_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(50),
        ack_deadline: Duration::from_secs(5),
        max_in_flight: 1,
    })
}

/// A runtime served on a loopback port.
pub struct TestRuntime {
    pub addr: SocketAddr,
    pub state: Arc<RuntimeState>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestRuntime {
    /// Start a runtime with one channel component and an optional app.
    ///
    /// Push subscriptions are established before the server accepts calls.
    pub async fn start(app: Option<Arc<dyn AppClient>>) -> Self {
        let mut pubsubs: HashMap<String, Arc<dyn PubSub>> = HashMap::new();
        pubsubs.insert(PUBSUB.to_string(), Arc::new(fast_channel()));
        let state = Arc::new(RuntimeState::new(pubsubs, app));

        Subscriber::new(Arc::clone(&state))
            .start_subscribing()
            .await
            .expect("push subscriptions should start");

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind runtime listener");
        let addr = listener.local_addr().expect("listener has an address");
        let (shutdown, signal) = oneshot::channel::<()>();

        let service = RuntimeService::new(Arc::clone(&state)).into_server();
        tokio::spawn(async move {
            Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
                    let _ = signal.await;
                })
                .await
                .expect("runtime server failed");
        });

        Self {
            addr,
            state,
            shutdown: Some(shutdown),
        }
    }

    pub async fn client(&self) -> RuntimeClient<Channel> {
        RuntimeClient::connect(format!("http://{}", self.addr))
            .await
            .expect("Failed to connect to runtime")
    }
}

impl Drop for TestRuntime {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

pub fn publish_request(topic: &str, data: &[u8]) -> PublishEventRequest {
    PublishEventRequest {
        pubsub_name: PUBSUB.to_string(),
        topic: topic.to_string(),
        data: data.to_vec(),
        data_content_type: "text/plain".to_string(),
        metadata: HashMap::new(),
    }
}

pub fn initial_request(pubsub: &str, topic: &str) -> SubscribeTopicEventsRequest {
    SubscribeTopicEventsRequest {
        kind: Some(subscribe_topic_events_request::Kind::InitialRequest(
            SubscribeTopicEventsRequestInitial {
                pubsub_name: pubsub.to_string(),
                topic: topic.to_string(),
                metadata: HashMap::new(),
                dead_letter_topic: None,
            },
        )),
    }
}

pub fn ack(id: &str, status: TopicEventStatus) -> SubscribeTopicEventsRequest {
    SubscribeTopicEventsRequest {
        kind: Some(subscribe_topic_events_request::Kind::EventProcessed(
            SubscribeTopicEventsRequestProcessed {
                id: id.to_string(),
                status: status as i32,
            },
        )),
    }
}

/// Client half of an attached `SubscribeTopicEvents` stream.
pub struct TopicStream {
    pub requests: mpsc::Sender<SubscribeTopicEventsRequest>,
    pub responses: Streaming<SubscribeTopicEventsResponse>,
}

impl TopicStream {
    /// Open a stream whose first frame is `first`.
    pub async fn open(
        client: &mut RuntimeClient<Channel>,
        first: SubscribeTopicEventsRequest,
    ) -> Result<Self, Status> {
        let (requests, rx) = mpsc::channel(16);
        requests
            .send(first)
            .await
            .expect("request channel open");
        let responses = client
            .subscribe_topic_events(ReceiverStream::new(rx))
            .await?
            .into_inner();
        Ok(Self {
            requests,
            responses,
        })
    }

    /// Open a stream and consume the initial response.
    pub async fn attach(client: &mut RuntimeClient<Channel>, topic: &str) -> Self {
        let mut stream = Self::open(client, initial_request(PUBSUB, topic))
            .await
            .expect("attach should succeed");
        let first = stream.next().await;
        assert!(
            matches!(
                first.kind,
                Some(subscribe_topic_events_response::Kind::InitialResponse(_))
            ),
            "first frame must be the initial response, got {first:?}"
        );
        stream
    }

    pub async fn next(&mut self) -> SubscribeTopicEventsResponse {
        tokio::time::timeout(WAIT, self.responses.message())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream failed")
            .expect("stream ended")
    }

    pub async fn next_event(&mut self) -> TopicEventRequest {
        match self.next().await.kind {
            Some(subscribe_topic_events_response::Kind::EventMessage(event)) => event,
            other => panic!("expected an event frame, got {other:?}"),
        }
    }

    pub async fn ack(&self, id: &str, status: TopicEventStatus) {
        self.requests
            .send(ack(id, status))
            .await
            .expect("request channel open");
    }
}

/// Application callback server recording every pushed event.
#[derive(Clone, Default)]
pub struct CallbackApp {
    subscriptions: Vec<TopicSubscription>,
    statuses: Arc<Mutex<HashMap<String, TopicEventStatus>>>,
    received: Arc<Mutex<Vec<TopicEventRequest>>>,
}

impl CallbackApp {
    pub fn new(subscriptions: Vec<TopicSubscription>) -> Self {
        Self {
            subscriptions,
            ..Default::default()
        }
    }

    /// Reply with `status` for every event on `topic`. Others get SUCCESS.
    pub fn reply_for(&self, topic: &str, status: TopicEventStatus) {
        self.statuses
            .lock()
            .unwrap()
            .insert(topic.to_string(), status);
    }

    pub fn received(&self) -> Vec<TopicEventRequest> {
        self.received.lock().unwrap().clone()
    }

    /// Wait until at least `count` events arrived on `topic`.
    pub async fn wait_for(&self, topic: &str, count: usize) -> Vec<TopicEventRequest> {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let matching: Vec<_> = self
                .received()
                .into_iter()
                .filter(|event| event.topic == topic)
                .collect();
            if matching.len() >= count {
                return matching;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {count} events on {topic}, got {}",
                matching.len()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Serve on a loopback port and return a connected `AppClient`.
    pub async fn serve(self) -> Arc<dyn AppClient> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind callback listener");
        let addr = listener.local_addr().expect("listener has an address");

        tokio::spawn(async move {
            Server::builder()
                .add_service(AppCallbackServer::new(self))
                .serve_with_incoming(TcpListenerStream::new(listener))
                .await
                .expect("callback server failed");
        });

        let channel = connect_to_address(&addr.to_string())
            .await
            .expect("Failed to connect to callback server");
        Arc::new(GrpcAppClient::new(channel))
    }
}

#[tonic::async_trait]
impl AppCallback for CallbackApp {
    async fn on_topic_event(
        &self,
        request: Request<TopicEventRequest>,
    ) -> Result<Response<TopicEventResponse>, Status> {
        let event = request.into_inner();
        let status = self
            .statuses
            .lock()
            .unwrap()
            .get(&event.topic)
            .copied()
            .unwrap_or(TopicEventStatus::Success);
        self.received.lock().unwrap().push(event);
        Ok(Response::new(TopicEventResponse {
            status: status as i32,
        }))
    }

    async fn list_topic_subscriptions(
        &self,
        _request: Request<ListTopicSubscriptionsRequest>,
    ) -> Result<Response<ListTopicSubscriptionsResponse>, Status> {
        Ok(Response::new(ListTopicSubscriptionsResponse {
            subscriptions: self.subscriptions.clone(),
        }))
    }
}

pub fn subscription(topic: &str, dead_letter_topic: Option<&str>) -> TopicSubscription {
    TopicSubscription {
        pubsub_name: PUBSUB.to_string(),
        topic: topic.to_string(),
        metadata: HashMap::new(),
        dead_letter_topic: dead_letter_topic.map(str::to_string),
    }
}
