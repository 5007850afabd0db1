//! Courier - sidecar pub/sub runtime
//!
//! Exposes a uniform gRPC surface to application processes and delegates
//! message transport to pluggable broker components. Messages arriving
//! from a broker are delivered to the application either by callback push
//! (one `OnTopicEvent` call per message) or over a long-lived
//! bidirectional stream acknowledged by event id.

pub mod bus;
pub mod clients;
pub mod config;
pub mod delivery;
pub mod envelope;
pub mod registry;
pub mod services;
pub mod state;
pub mod subscriber;
pub mod transport;
pub mod utils;

pub mod proto {
    tonic::include_proto!("courier.v1");
}
