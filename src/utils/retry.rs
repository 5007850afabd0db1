//! Retry utilities: backoff builders and status classification.
//!
//! Uses `backon` for exponential backoff with jitter. Redelivery itself is
//! a broker concern; these builders are what the in-process broker and the
//! startup connection loop use.

use std::time::Duration;

use backon::ExponentialBuilder;
use tonic::{Code, Status};

/// Backoff between redeliveries of one message.
///
/// Yields `max_redeliveries` delays, so a message is attempted at most
/// `max_redeliveries + 1` times.
pub fn redelivery_backoff(
    min_delay: Duration,
    max_delay: Duration,
    max_redeliveries: usize,
) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(min_delay)
        .with_max_delay(max_delay)
        .with_max_times(max_redeliveries)
        .with_jitter()
}

/// Backoff for gRPC connection retries at startup.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 30
/// - Jitter enabled
pub fn connection_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(30)
        .with_jitter()
}

/// Backoff for consumer reconnects after a broker connection drops.
pub fn reconnect_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(30))
        .with_jitter()
}

/// Whether the application permanently rejected the call.
///
/// An application that does not implement the callback will never accept
/// the event, so redelivering it is pointless.
pub fn is_permanent_rejection(status: &Status) -> bool {
    matches!(status.code(), Code::Unimplemented)
}

/// Whether a stream ended because the peer went away on purpose.
pub fn is_normal_stream_end(status: &Status) -> bool {
    matches!(status.code(), Code::Cancelled)
}
