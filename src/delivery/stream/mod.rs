//! Streaming delivery.
//!
//! An application attaches at most one bidirectional stream per
//! `(pubsub, topic)`. Events are written to it as `EventMessage` frames and
//! each broker delivery is resolved when the matching `EventProcessed{id}`
//! frame comes back on the same stream.
//!
//! Connection lifecycle: `attach` (registry claim) -> `receive` loop ->
//! close outbound side and `detach`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{error, info, warn};

use super::{open, resolve, DeliveryError};
use crate::bus::{MessageHandler, NewMessage, PUBSUB_NAME_METADATA_KEY};
use crate::envelope::Envelope;
use crate::proto::{
    subscribe_topic_events_request, subscribe_topic_events_response,
    SubscribeTopicEventsRequest, SubscribeTopicEventsResponse,
};
use crate::utils::retry::is_normal_stream_end;

/// One server-to-client frame.
pub type Frame = Result<SubscribeTopicEventsResponse, Status>;

/// Sending half of a client's response stream.
pub type Outbound = mpsc::Sender<Frame>;

/// Registry key for a `(pubsub, topic)` pair.
pub fn streamer_key(pubsub_name: &str, topic: &str) -> String {
    format!("{pubsub_name}||{topic}")
}

/// A stream is already attached for this `(pubsub, topic)`.
#[derive(Debug, thiserror::Error)]
#[error("already subscribed to pubsub {pubsub:?} topic {topic:?}")]
pub struct AlreadySubscribed {
    pub pubsub: String,
    pub topic: String,
}

// ============================================================================
// Pending acknowledgements
// ============================================================================

#[derive(Default)]
struct Slots {
    next_generation: u64,
    by_id: HashMap<String, (u64, oneshot::Sender<i32>)>,
}

/// Envelope id to the publisher waiting for its `EventProcessed` frame.
///
/// A duplicate in-flight id replaces the earlier slot; the earlier
/// publisher sees its slot closed and asks for redelivery.
#[derive(Default)]
struct PendingAcks {
    slots: StdMutex<Slots>,
}

impl PendingAcks {
    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(self: &Arc<Self>, id: &str) -> (oneshot::Receiver<i32>, PendingAck) {
        let (tx, rx) = oneshot::channel();
        let mut slots = self.lock();
        slots.next_generation += 1;
        let generation = slots.next_generation;
        if slots
            .by_id
            .insert(id.to_string(), (generation, tx))
            .is_some()
        {
            warn!(id = %id, "Duplicate in-flight pub/sub event id replaced an earlier delivery");
        }
        let guard = PendingAck {
            acks: Arc::clone(self),
            id: id.to_string(),
            generation,
        };
        (rx, guard)
    }

    /// Hand `status` to the publisher waiting on `id`.
    fn resolve(&self, id: &str, status: i32) -> bool {
        match self.lock().by_id.remove(id) {
            Some((_, tx)) => tx.send(status).is_ok(),
            None => false,
        }
    }

    fn remove(&self, id: &str, generation: u64) {
        let mut slots = self.lock();
        if slots
            .by_id
            .get(id)
            .is_some_and(|(current, _)| *current == generation)
        {
            slots.by_id.remove(id);
        }
    }

    fn len(&self) -> usize {
        self.lock().by_id.len()
    }
}

/// Removes its slot when the publisher stops waiting.
struct PendingAck {
    acks: Arc<PendingAcks>,
    id: String,
    generation: u64,
}

impl Drop for PendingAck {
    fn drop(&mut self) {
        self.acks.remove(&self.id, self.generation);
    }
}

// ============================================================================
// Connection
// ============================================================================

/// One attached client stream.
pub struct StreamConnection {
    pubsub_name: String,
    topic: String,
    /// Send lock; `None` once the connection is closed.
    outbound: Mutex<Option<Outbound>>,
    pending: Arc<PendingAcks>,
}

impl StreamConnection {
    fn new(pubsub_name: &str, topic: &str, outbound: Outbound) -> Self {
        Self {
            pubsub_name: pubsub_name.to_string(),
            topic: topic.to_string(),
            outbound: Mutex::new(Some(outbound)),
            pending: Arc::new(PendingAcks::default()),
        }
    }

    pub fn pubsub_name(&self) -> &str {
        &self.pubsub_name
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publishers currently waiting for an acknowledgement.
    pub fn pending_acks(&self) -> usize {
        self.pending.len()
    }

    /// Write one frame under the send lock. Returns false once the client is gone.
    pub async fn send(&self, frame: SubscribeTopicEventsResponse) -> bool {
        let outbound = self.outbound.lock().await;
        match outbound.as_ref() {
            Some(tx) => tx.send(Ok(frame)).await.is_ok(),
            None => false,
        }
    }

    /// Close the outbound side, optionally telling the client why.
    async fn close(&self, error: Option<Status>) {
        let mut outbound = self.outbound.lock().await;
        if let (Some(tx), Some(status)) = (outbound.as_ref(), error) {
            let _ = tx.try_send(Err(status));
        }
        outbound.take();
    }

    pub async fn is_closed(&self) -> bool {
        self.outbound
            .lock()
            .await
            .as_ref()
            .map_or(true, |tx| tx.is_closed())
    }
}

// ============================================================================
// Streamer
// ============================================================================

/// Registry of attached streams and the publish path into them.
#[derive(Default)]
pub struct Streamer {
    subscribers: RwLock<HashMap<String, Arc<StreamConnection>>>,
    /// Keys that already hold a broker subscription. Brokers have no
    /// unsubscribe, so later attachments reuse it.
    broker_subscriptions: StdMutex<HashSet<String>>,
}

impl Streamer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the key for a new connection.
    ///
    /// Fails without touching the existing connection if the key is taken.
    pub async fn attach(
        &self,
        pubsub_name: &str,
        topic: &str,
        outbound: Outbound,
    ) -> Result<Arc<StreamConnection>, AlreadySubscribed> {
        let key = streamer_key(pubsub_name, topic);
        let mut subscribers = self.subscribers.write().await;
        if subscribers.contains_key(&key) {
            return Err(AlreadySubscribed {
                pubsub: pubsub_name.to_string(),
                topic: topic.to_string(),
            });
        }
        let connection = Arc::new(StreamConnection::new(pubsub_name, topic, outbound));
        subscribers.insert(key, Arc::clone(&connection));
        info!(pubsub = %pubsub_name, topic = %topic, "Streaming subscriber attached");
        Ok(connection)
    }

    /// Remove `connection` from the registry if it still owns its key.
    pub async fn detach(&self, connection: &Arc<StreamConnection>) -> bool {
        let key = streamer_key(&connection.pubsub_name, &connection.topic);
        let mut subscribers = self.subscribers.write().await;
        match subscribers.get(&key) {
            Some(current) if Arc::ptr_eq(current, connection) => {
                subscribers.remove(&key);
                info!(
                    pubsub = %connection.pubsub_name,
                    topic = %connection.topic,
                    "Streaming subscriber detached"
                );
                true
            }
            _ => false,
        }
    }

    pub async fn connection(&self, pubsub_name: &str, topic: &str) -> Option<Arc<StreamConnection>> {
        self.subscribers
            .read()
            .await
            .get(&streamer_key(pubsub_name, topic))
            .cloned()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// True exactly once per key, for the attachment that must subscribe
    /// to the broker.
    pub fn claim_broker_subscription(&self, pubsub_name: &str, topic: &str) -> bool {
        self.lock_broker_subscriptions()
            .insert(streamer_key(pubsub_name, topic))
    }

    /// Undo a claim whose broker subscribe call failed.
    pub fn release_broker_subscription(&self, pubsub_name: &str, topic: &str) {
        self.lock_broker_subscriptions()
            .remove(&streamer_key(pubsub_name, topic));
    }

    fn lock_broker_subscriptions(&self) -> MutexGuard<'_, HashSet<String>> {
        self.broker_subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish path for broker deliveries.
    ///
    /// Fails with `NoStreamer` before decoding when nothing is attached.
    pub async fn publish_message(
        &self,
        message: &NewMessage,
        cancel: &CancellationToken,
    ) -> Result<(), DeliveryError> {
        let pubsub_name = message
            .metadata
            .get(PUBSUB_NAME_METADATA_KEY)
            .map(String::as_str)
            .unwrap_or_default();
        let connection = self
            .connection(pubsub_name, &message.topic)
            .await
            .ok_or_else(|| DeliveryError::NoStreamer {
                pubsub: pubsub_name.to_string(),
                topic: message.topic.clone(),
            })?;
        let Some(envelope) = open(message) else {
            return Ok(());
        };
        publish_on(&connection, envelope, cancel).await
    }

    /// Push one envelope to the stream attached for its `(pubsub, topic)`
    /// and wait for the application's acknowledgement.
    pub async fn publish(
        &self,
        envelope: Envelope,
        cancel: &CancellationToken,
    ) -> Result<(), DeliveryError> {
        let connection = self
            .connection(&envelope.pubsub_name, &envelope.topic)
            .await
            .ok_or_else(|| DeliveryError::NoStreamer {
                pubsub: envelope.pubsub_name.clone(),
                topic: envelope.topic.clone(),
            })?;
        publish_on(&connection, envelope, cancel).await
    }

    /// Read client frames until the stream ends, then close and detach.
    ///
    /// EOF and a `Cancelled` status are normal exits. Any other receive
    /// error or protocol violation is returned and sent to the client.
    #[tracing::instrument(
        name = "delivery.stream.receive",
        skip_all,
        fields(pubsub = %connection.pubsub_name, topic = %connection.topic)
    )]
    pub async fn receive<S>(
        &self,
        connection: Arc<StreamConnection>,
        mut inbound: S,
    ) -> Result<(), Status>
    where
        S: Stream<Item = Result<SubscribeTopicEventsRequest, Status>> + Unpin + Send,
    {
        use subscribe_topic_events_request::Kind;

        let result = loop {
            let request = match inbound.next().await {
                None => break Ok(()),
                Some(Err(status)) if is_normal_stream_end(&status) => break Ok(()),
                Some(Err(status)) => {
                    error!(error = %status, "Error receiving from client stream");
                    break Err(status);
                }
                Some(Ok(request)) => request,
            };

            match request.kind {
                Some(Kind::EventProcessed(processed)) => {
                    if !connection.pending.resolve(&processed.id, processed.status) {
                        error!(
                            id = %processed.id,
                            "No client stream expecting publish response for id"
                        );
                    }
                }
                Some(Kind::InitialRequest(_)) => {
                    error!("Received a second initial request on an established stream");
                    break Err(Status::invalid_argument(
                        "initial request already received on this stream",
                    ));
                }
                None => warn!("Ignoring client frame without a request kind"),
            }
        };

        connection.close(result.as_ref().err().cloned()).await;
        self.detach(&connection).await;
        result
    }
}

#[tracing::instrument(
    name = "delivery.stream.publish",
    skip_all,
    fields(id = %envelope.id, pubsub = %envelope.pubsub_name, topic = %envelope.topic)
)]
async fn publish_on(
    connection: &StreamConnection,
    envelope: Envelope,
    cancel: &CancellationToken,
) -> Result<(), DeliveryError> {
    let id = envelope.id.clone();
    let (ack, _slot) = connection.pending.register(&id);

    let frame = SubscribeTopicEventsResponse {
        kind: Some(subscribe_topic_events_response::Kind::EventMessage(
            envelope.into(),
        )),
    };
    let sent = tokio::select! {
        _ = cancel.cancelled() => return Err(DeliveryError::Cancelled { id }),
        sent = connection.send(frame) => sent,
    };
    if !sent {
        error!(id = %id, "Error sending pub/sub event to client stream");
        return Err(DeliveryError::StreamClosed { id });
    }

    tokio::select! {
        _ = cancel.cancelled() => Err(DeliveryError::Cancelled { id }),
        status = ack => match status {
            Ok(status) => resolve(&id, Ok(status)).into_result(),
            Err(_) => Err(DeliveryError::AckLost { id }),
        },
    }
}

/// Broker handler for topics subscribed through a stream.
pub struct StreamHandler {
    pubsub_name: String,
    streamer: Arc<Streamer>,
}

impl StreamHandler {
    pub fn new(pubsub_name: impl Into<String>, streamer: Arc<Streamer>) -> Self {
        Self {
            pubsub_name: pubsub_name.into(),
            streamer,
        }
    }
}

impl MessageHandler for StreamHandler {
    fn handle(
        &self,
        mut message: NewMessage,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<(), DeliveryError>> {
        message
            .metadata
            .insert(PUBSUB_NAME_METADATA_KEY.to_string(), self.pubsub_name.clone());
        let streamer = Arc::clone(&self.streamer);
        Box::pin(async move { streamer.publish_message(&message, &cancel).await })
    }
}
