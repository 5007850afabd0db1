//! Delivery of broker messages to the application.
//!
//! Two paths share one decision table:
//! - `callback`: one `OnTopicEvent` call per message
//! - `stream`: events pushed over a long-lived bidirectional stream and
//!   acknowledged by envelope id
//!
//! Both report back to the broker component through `MessageHandler`:
//! `Ok` acks the message, `Err` asks for redelivery.

pub mod callback;
pub mod stream;

use tonic::Status;
use tracing::{debug, warn};

use crate::bus::{NewMessage, PUBSUB_NAME_METADATA_KEY};
use crate::envelope::{self, Decoded, Envelope};
use crate::proto::TopicEventStatus;
use crate::utils::retry::is_permanent_rejection;

pub use callback::{CallbackDelivery, CallbackHandler};
pub use stream::{StreamConnection, StreamHandler, Streamer};

/// Reasons a message must be redelivered.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("error returned from app while processing pub/sub event {id}: {status}")]
    Transport { id: String, status: Box<Status> },

    #[error("RETRY status returned from app while processing pub/sub event {id}")]
    Retry { id: String },

    #[error("unknown status {status} returned from app while processing pub/sub event {id}")]
    UnknownStatus { id: String, status: i32 },

    #[error("no streamer subscribed to pubsub {pubsub:?} topic {topic:?}")]
    NoStreamer { pubsub: String, topic: String },

    #[error("error sending pub/sub event {id} to client stream")]
    StreamClosed { id: String },

    #[error("acknowledgement for pub/sub event {id} was lost")]
    AckLost { id: String },

    #[error("delivery of pub/sub event {id} was cancelled")]
    Cancelled { id: String },
}

/// What the broker should do with a delivered message.
#[derive(Debug)]
pub enum Disposition {
    /// Processed successfully.
    Ack,
    /// The application refused the message for good. Acked, never redelivered.
    Drop,
    Redeliver(DeliveryError),
}

impl Disposition {
    pub fn is_ack(&self) -> bool {
        !matches!(self, Disposition::Redeliver(_))
    }

    /// Handler result reported to the broker component.
    pub fn into_result(self) -> Result<(), DeliveryError> {
        match self {
            Disposition::Ack | Disposition::Drop => Ok(()),
            Disposition::Redeliver(err) => Err(err),
        }
    }
}

/// Decide the fate of a message from the application's reply.
///
/// | reply                      | outcome   |
/// |----------------------------|-----------|
/// | `Unimplemented` error      | drop      |
/// | any other error            | redeliver |
/// | `SUCCESS`                  | ack       |
/// | `RETRY`                    | redeliver |
/// | `DROP`                     | drop      |
/// | unknown status             | redeliver |
pub fn resolve(event_id: &str, reply: Result<i32, Status>) -> Disposition {
    let status = match reply {
        Ok(status) => status,
        Err(status) if is_permanent_rejection(&status) => {
            warn!(
                id = %event_id,
                error = %status,
                "Non-retriable error returned from app while processing pub/sub event"
            );
            return Disposition::Drop;
        }
        Err(status) => {
            let err = DeliveryError::Transport {
                id: event_id.to_string(),
                status: Box::new(status),
            };
            debug!(error = %err, "Redelivering pub/sub event");
            return Disposition::Redeliver(err);
        }
    };

    match TopicEventStatus::try_from(status) {
        Ok(TopicEventStatus::Success) => Disposition::Ack,
        Ok(TopicEventStatus::Retry) => {
            debug!(id = %event_id, "RETRY status returned from app");
            Disposition::Redeliver(DeliveryError::Retry {
                id: event_id.to_string(),
            })
        }
        Ok(TopicEventStatus::Drop) => {
            warn!(id = %event_id, "DROP status returned from app while processing pub/sub event");
            Disposition::Drop
        }
        Err(_) => {
            let err = DeliveryError::UnknownStatus {
                id: event_id.to_string(),
                status,
            };
            warn!(error = %err, "Unknown status returned from app");
            Disposition::Redeliver(err)
        }
    }
}

/// Decode a broker message into an envelope ready for delivery.
///
/// `None` means the message must be acked without reaching the
/// application: it expired or could not be decoded.
pub(crate) fn open(message: &NewMessage) -> Option<Envelope> {
    let pubsub_name = message
        .metadata
        .get(PUBSUB_NAME_METADATA_KEY)
        .map(String::as_str)
        .unwrap_or_default();

    match envelope::decode(&message.data, &message.topic, pubsub_name) {
        Ok(Decoded::Event(envelope)) => Some(envelope.with_metadata(message.metadata.clone())),
        Ok(Decoded::Expired { id, expired_at }) => {
            warn!(
                id = %id,
                pubsub = %pubsub_name,
                topic = %message.topic,
                expiration = %expired_at,
                "Dropping expired pub/sub event"
            );
            None
        }
        Err(e) => {
            warn!(
                pubsub = %pubsub_name,
                topic = %message.topic,
                error = %e,
                "Dropping malformed pub/sub event"
            );
            None
        }
    }
}
