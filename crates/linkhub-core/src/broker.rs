//! In-process message broker.
//!
//! The broker is the default [`Bus`]: every topic is a broadcast channel and
//! subscribers register by id, so a subscriber can be torn down in one call.

use crate::bus::Bus;
use crate::message::Publication;
use crate::topic::validate_topic;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

/// Broker errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Invalid topic name.
    #[error("Invalid topic: {0}")]
    InvalidTopic(&'static str),

    /// Not subscribed to topic.
    #[error("Not subscribed to topic: {0}")]
    NotSubscribed(String),

    /// Already subscribed to topic.
    #[error("Already subscribed to topic: {0}")]
    AlreadySubscribed(String),

    /// Maximum subscriptions reached.
    #[error("Maximum subscriptions reached")]
    MaxSubscriptionsReached,
}

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Broadcast capacity of each topic.
    pub topic_capacity: usize,
    /// Maximum subscriptions per subscriber.
    pub max_subscriptions_per_subscriber: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            topic_capacity: 1024,
            max_subscriptions_per_subscriber: 100,
        }
    }
}

struct TopicEntry {
    sender: broadcast::Sender<Arc<Publication>>,
    subscribers: HashSet<String>,
}

impl TopicEntry {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            subscribers: HashSet::new(),
        }
    }
}

/// Topic-based pub/sub broker.
pub struct Broker {
    /// Topics indexed by name.
    topics: DashMap<String, TopicEntry>,
    /// Subscriber subscriptions (subscriber id -> set of topics).
    subscriptions: DashMap<String, DashSet<String>>,
    config: BrokerConfig,
}

impl Broker {
    /// Create a new broker with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(BrokerConfig::default())
    }

    /// Create a new broker with custom configuration.
    #[must_use]
    pub fn with_config(config: BrokerConfig) -> Self {
        info!("Creating broker with config: {:?}", config);
        Self {
            topics: DashMap::new(),
            subscriptions: DashMap::new(),
            config,
        }
    }

    /// Get broker statistics.
    #[must_use]
    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            topic_count: self.topics.len(),
            subscriber_count: self.subscriptions.len(),
            total_subscriptions: self.subscriptions.iter().map(|s| s.len()).sum(),
        }
    }

    /// Subscribe to a topic.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic is invalid or limits are exceeded.
    pub fn subscribe(
        &self,
        subscriber_id: &str,
        topic: &str,
    ) -> Result<broadcast::Receiver<Arc<Publication>>, BrokerError> {
        validate_topic(topic).map_err(BrokerError::InvalidTopic)?;

        let subs = self
            .subscriptions
            .entry(subscriber_id.to_string())
            .or_default();

        if subs.len() >= self.config.max_subscriptions_per_subscriber {
            return Err(BrokerError::MaxSubscriptionsReached);
        }
        if subs.contains(topic) {
            return Err(BrokerError::AlreadySubscribed(topic.to_string()));
        }

        let mut entry = self.topics.entry(topic.to_string()).or_insert_with(|| {
            debug!(topic = %topic, "Creating topic");
            TopicEntry::new(self.config.topic_capacity)
        });

        entry.subscribers.insert(subscriber_id.to_string());
        subs.insert(topic.to_string());

        debug!(
            topic = %topic,
            subscriber = %subscriber_id,
            subscribers = entry.subscribers.len(),
            "Subscribed"
        );

        Ok(entry.sender.subscribe())
    }

    /// Unsubscribe from a topic.
    ///
    /// # Errors
    ///
    /// Returns an error if not subscribed.
    pub fn unsubscribe(&self, subscriber_id: &str, topic: &str) -> Result<(), BrokerError> {
        let removed = self
            .subscriptions
            .get(subscriber_id)
            .and_then(|subs| subs.remove(topic));
        if removed.is_none() {
            return Err(BrokerError::NotSubscribed(topic.to_string()));
        }

        self.leave_topic(subscriber_id, topic);
        Ok(())
    }

    /// Unsubscribe from all topics.
    pub fn unsubscribe_all(&self, subscriber_id: &str) {
        if let Some((_, topics)) = self.subscriptions.remove(subscriber_id) {
            for topic in topics.iter() {
                self.leave_topic(subscriber_id, topic.as_str());
            }
        }

        debug!(subscriber = %subscriber_id, "Unsubscribed from all topics");
    }

    fn leave_topic(&self, subscriber_id: &str, topic: &str) {
        let Some(mut entry) = self.topics.get_mut(topic) else {
            return;
        };
        entry.subscribers.remove(subscriber_id);
        debug!(topic = %topic, subscriber = %subscriber_id, "Unsubscribed");

        if entry.subscribers.is_empty() {
            drop(entry);
            // A subscriber may have joined since the guard was released
            if self
                .topics
                .remove_if(topic, |_, entry| entry.subscribers.is_empty())
                .is_some()
            {
                debug!(topic = %topic, "Deleted empty topic");
            }
        }
    }

    /// Publish to a topic.
    ///
    /// Returns the number of receivers that got the publication.
    pub fn publish(&self, publication: Publication) -> usize {
        match self.topics.get(&publication.topic) {
            Some(entry) => {
                let topic = publication.topic.clone();
                let count = entry.sender.send(Arc::new(publication)).unwrap_or_default();
                trace!(topic = %topic, recipients = count, "Published");
                count
            }
            None => {
                trace!(topic = %publication.topic, "No subscribers for topic");
                0
            }
        }
    }

    /// Publish a raw payload to a topic.
    pub fn publish_to(&self, topic: &str, payload: impl Into<Bytes>) -> usize {
        self.publish(Publication::new(topic, payload))
    }

    /// Check if a topic exists.
    #[must_use]
    pub fn topic_exists(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    /// Get the subscriber count of a topic.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|e| e.subscribers.len())
            .unwrap_or(0)
    }

    /// Get all topic names.
    #[must_use]
    pub fn topic_names(&self) -> Vec<String> {
        self.topics.iter().map(|e| e.key().clone()).collect()
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus for Broker {
    fn publish(&self, topic: &str, payload: Bytes) {
        self.publish_to(topic, payload);
    }
}

/// Broker statistics.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerStats {
    /// Number of topics with at least one subscriber.
    pub topic_count: usize,
    /// Number of distinct subscribers.
    pub subscriber_count: usize,
    /// Total number of subscriptions.
    pub total_subscriptions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_subscribe_unsubscribe() {
        let broker = Broker::new();

        let rx = broker.subscribe("sub-1", "/link/1/1/recv").unwrap();
        assert!(broker.topic_exists("/link/1/1/recv"));
        assert_eq!(broker.subscriber_count("/link/1/1/recv"), 1);
        drop(rx);

        broker.unsubscribe("sub-1", "/link/1/1/recv").unwrap();
        assert!(!broker.topic_exists("/link/1/1/recv"));
        assert!(matches!(
            broker.unsubscribe("sub-1", "/link/1/1/recv"),
            Err(BrokerError::NotSubscribed(_))
        ));
    }

    #[test]
    fn test_broker_publish() {
        let broker = Broker::new();

        let mut rx1 = broker.subscribe("sub-1", "/t").unwrap();
        let mut rx2 = broker.subscribe("sub-2", "/t").unwrap();

        assert_eq!(broker.publish_to("/t", b"hello".to_vec()), 2);

        assert_eq!(&rx1.try_recv().unwrap().payload[..], b"hello");
        assert_eq!(&rx2.try_recv().unwrap().payload[..], b"hello");
    }

    #[test]
    fn test_broker_publish_without_subscribers() {
        let broker = Broker::new();
        assert_eq!(broker.publish_to("/nobody", b"x".to_vec()), 0);
        assert!(!broker.topic_exists("/nobody"));
    }

    #[test]
    fn test_broker_as_bus() {
        let broker = Broker::new();
        let mut rx = broker.subscribe("sub-1", "/link/2/5/event").unwrap();

        let bus: &dyn Bus = &broker;
        bus.publish("/link/2/5/event", Bytes::from_static(b"close"));

        let publication = rx.try_recv().unwrap();
        assert_eq!(publication.topic, "/link/2/5/event");
        assert_eq!(&publication.payload[..], b"close");
    }

    #[test]
    fn test_broker_invalid_topic() {
        let broker = Broker::new();
        assert!(matches!(
            broker.subscribe("sub-1", ""),
            Err(BrokerError::InvalidTopic(_))
        ));
        assert!(broker.subscribe("sub-1", "no-slash").is_err());
    }

    #[test]
    fn test_broker_already_subscribed() {
        let broker = Broker::new();

        let _rx = broker.subscribe("sub-1", "/t").unwrap();
        assert!(matches!(
            broker.subscribe("sub-1", "/t"),
            Err(BrokerError::AlreadySubscribed(_))
        ));
    }

    #[test]
    fn test_broker_subscription_limit() {
        let broker = Broker::with_config(BrokerConfig {
            max_subscriptions_per_subscriber: 1,
            ..Default::default()
        });

        let _rx = broker.subscribe("sub-1", "/a").unwrap();
        assert!(matches!(
            broker.subscribe("sub-1", "/b"),
            Err(BrokerError::MaxSubscriptionsReached)
        ));
    }

    #[test]
    fn test_broker_unsubscribe_all_and_stats() {
        let broker = Broker::new();

        let _rx1 = broker.subscribe("sub-1", "/a").unwrap();
        let _rx2 = broker.subscribe("sub-1", "/b").unwrap();
        let _rx3 = broker.subscribe("sub-2", "/a").unwrap();

        let stats = broker.stats();
        assert_eq!(stats.topic_count, 2);
        assert_eq!(stats.subscriber_count, 2);
        assert_eq!(stats.total_subscriptions, 3);

        broker.unsubscribe_all("sub-1");
        assert!(broker.topic_exists("/a"));
        assert!(!broker.topic_exists("/b"));
        assert_eq!(broker.subscriber_count("/a"), 1);
    }
}
