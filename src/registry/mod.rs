//! Topic registry.
//!
//! Records which topics of which component the application wants delivered.
//! Entries come from the application's `ListTopicSubscriptions` declaration
//! or from streaming subscriptions. The discovery result is cached for the
//! life of the process and never refreshed.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::clients::AppClient;

/// Per-topic subscription details.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Details {
    pub metadata: HashMap<String, String>,
    pub dead_letter_topic: Option<String>,
}

/// Topics of one component, keyed by topic name.
pub type TopicSubscriptions = HashMap<String, Details>;

/// Component name to its topic subscriptions.
pub type InterestedTopics = HashMap<String, TopicSubscriptions>;

/// Process-wide cache of `component -> topic -> Details`.
pub struct TopicRegistry {
    app: Option<Arc<dyn AppClient>>,
    cache: RwLock<Option<InterestedTopics>>,
}

impl TopicRegistry {
    pub fn new(app: Option<Arc<dyn AppClient>>) -> Self {
        Self {
            app,
            cache: RwLock::new(None),
        }
    }

    /// Topics the application is interested in, discovering them on first use.
    ///
    /// A failed discovery call is logged and cached as an empty declaration.
    /// Without an application channel the result is empty and not cached.
    pub async fn interested_topics(&self) -> InterestedTopics {
        if let Some(cached) = self.cache.read().await.as_ref() {
            return cached.clone();
        }

        let Some(app) = &self.app else {
            return InterestedTopics::new();
        };

        let mut cache = self.cache.write().await;
        if let Some(cached) = cache.as_ref() {
            return cached.clone();
        }

        let topics = match app.list_topic_subscriptions().await {
            Ok(subscriptions) => {
                let mut topics = InterestedTopics::new();
                for subscription in subscriptions {
                    info!(
                        pubsub = %subscription.pubsub_name,
                        topic = %subscription.topic,
                        "App is subscribed to topic"
                    );
                    topics.entry(subscription.pubsub_name).or_default().insert(
                        subscription.topic,
                        Details {
                            metadata: subscription.metadata,
                            dead_letter_topic: subscription
                                .dead_letter_topic
                                .filter(|topic| !topic.is_empty()),
                        },
                    );
                }
                topics
            }
            Err(status) => {
                warn!(
                    error = %status,
                    "Failed to list topic subscriptions from app; assuming none"
                );
                InterestedTopics::new()
            }
        };

        *cache = Some(topics.clone());
        topics
    }

    /// Record a subscription if none exists yet for `(pubsub_name, topic)`.
    ///
    /// Returns whether it was inserted.
    pub async fn register_topic(&self, pubsub_name: &str, topic: &str, details: Details) -> bool {
        let mut cache = self.cache.write().await;
        let topics = cache
            .get_or_insert_with(InterestedTopics::new)
            .entry(pubsub_name.to_string())
            .or_default();
        if topics.contains_key(topic) {
            return false;
        }
        topics.insert(topic.to_string(), details);
        info!(pubsub = %pubsub_name, topic = %topic, "App is subscribed to topic");
        true
    }

    /// Details recorded for `(pubsub_name, topic)`, if any.
    pub async fn details(&self, pubsub_name: &str, topic: &str) -> Option<Details> {
        self.cache
            .read()
            .await
            .as_ref()
            .and_then(|topics| topics.get(pubsub_name))
            .and_then(|topics| topics.get(topic))
            .cloned()
    }
}
