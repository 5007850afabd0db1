//! Process-wide runtime state, passed explicitly to every component.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{error, info};

use crate::bus::PubSub;
use crate::clients::AppClient;
use crate::delivery::Streamer;
use crate::registry::TopicRegistry;

/// Frames buffered per attached stream before publishers wait.
pub const DEFAULT_STREAM_BUFFER: usize = 64;

/// Shared state of one runtime instance.
pub struct RuntimeState {
    pubsubs: HashMap<String, Arc<dyn PubSub>>,
    app: Option<Arc<dyn AppClient>>,
    registry: TopicRegistry,
    streamer: Arc<Streamer>,
    stream_buffer: usize,
}

impl RuntimeState {
    pub fn new(
        pubsubs: HashMap<String, Arc<dyn PubSub>>,
        app: Option<Arc<dyn AppClient>>,
    ) -> Self {
        Self {
            registry: TopicRegistry::new(app.clone()),
            pubsubs,
            app,
            streamer: Arc::new(Streamer::new()),
            stream_buffer: DEFAULT_STREAM_BUFFER,
        }
    }

    pub fn with_stream_buffer(mut self, stream_buffer: usize) -> Self {
        self.stream_buffer = stream_buffer.max(1);
        self
    }

    pub fn pubsub(&self, name: &str) -> Option<&Arc<dyn PubSub>> {
        self.pubsubs.get(name)
    }

    pub fn pubsubs(&self) -> &HashMap<String, Arc<dyn PubSub>> {
        &self.pubsubs
    }

    pub fn app(&self) -> Option<&Arc<dyn AppClient>> {
        self.app.as_ref()
    }

    pub fn registry(&self) -> &TopicRegistry {
        &self.registry
    }

    pub fn streamer(&self) -> &Arc<Streamer> {
        &self.streamer
    }

    pub fn stream_buffer(&self) -> usize {
        self.stream_buffer
    }

    /// Close every component, logging failures.
    pub async fn close(&self) {
        for (name, pubsub) in &self.pubsubs {
            match pubsub.close().await {
                Ok(()) => info!(pubsub = %name, "Pub/sub component closed"),
                Err(e) => error!(pubsub = %name, error = %e, "Failed to close pub/sub component"),
            }
        }
    }
}
