//! Topic-based pub/sub fanning backend events out to stream subscribers.
//!
//! Topics are implicit: publishing to a topic nobody listens on is a no-op,
//! and subscribing creates the channel on demand. Delivery is at-most-once
//! per subscriber with no persistence or replay; within one topic a
//! subscriber sees publishes in the order the bus received them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use hyper::body::Bytes;
use tokio::sync::broadcast;

use crate::entity::{GroupId, PartyId, QueueKind, UserId};
use crate::payloads::EventMsg;

/// Buffered payloads per subscriber before a slow reader starts lagging.
const TOPIC_BUFFER: usize = 64;

/// A namespaced bus topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    User(UserId),
    Group(GroupId),
    Party(PartyId),
}

impl Topic {
    #[must_use]
    pub fn kind(&self) -> QueueKind {
        match self {
            Topic::User(_) => QueueKind::User,
            Topic::Group(_) => QueueKind::Group,
            Topic::Party(_) => QueueKind::Party,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::User(id) => write!(f, "user:{id}"),
            Topic::Group(id) => write!(f, "group:{id}"),
            Topic::Party(id) => write!(f, "party:{id}"),
        }
    }
}

/// The process-wide message bus.
pub struct MessageBus {
    topics: Mutex<HashMap<String, broadcast::Sender<Bytes>>>,
}

impl MessageBus {
    #[must_use]
    pub fn new() -> Self {
        MessageBus {
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// Publish one event to every current subscriber of `topic`. Non-blocking;
    /// nothing is stored for future subscribers.
    pub fn send(&self, topic: &Topic, event: &EventMsg) {
        let payload = Bytes::from(event.to_json());
        let mut topics = self.topics.lock().unwrap();
        let key = topic.to_string();
        if let Some(sender) = topics.get(&key) {
            if sender.send(payload).is_err() {
                // Last subscriber is gone; drop the channel.
                topics.remove(&key);
            }
        }
    }

    /// Subscribe to `topic`, creating it on first use. The receiver sees only
    /// payloads published after this call. Dropping it releases the
    /// subscription.
    #[must_use]
    pub fn subscribe(&self, topic: &Topic) -> broadcast::Receiver<Bytes> {
        let mut topics = self.topics.lock().unwrap();
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_BUFFER).0)
            .subscribe()
    }

    /// Number of live topics, for tests and diagnostics.
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.topics.lock().unwrap().len()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_topic_names() {
        let id = Uuid::nil();
        assert_eq!(Topic::User(id).to_string(), format!("user:{id}"));
        assert_eq!(Topic::Group(id).to_string(), format!("group:{id}"));
        assert_eq!(Topic::Party(id).kind(), QueueKind::Party);
    }

    #[tokio::test]
    async fn test_send_without_subscribers_is_a_noop() {
        let bus = MessageBus::new();
        bus.send(&Topic::User(Uuid::new_v4()), &EventMsg::Heartbeat);
        assert_eq!(bus.topic_count(), 0);
    }

    #[tokio::test]
    async fn test_all_subscribers_receive_in_order() {
        let bus = MessageBus::new();
        let topic = Topic::Group(Uuid::new_v4());
        let mut first = bus.subscribe(&topic);
        let mut second = bus.subscribe(&topic);

        bus.send(&topic, &EventMsg::QueueJoined);
        bus.send(&topic, &EventMsg::GameOver);

        for rx in [&mut first, &mut second] {
            let a = rx.recv().await.unwrap();
            let b = rx.recv().await.unwrap();
            assert_eq!(a, Bytes::from(EventMsg::QueueJoined.to_json()));
            assert_eq!(b, Bytes::from(EventMsg::GameOver.to_json()));
        }
    }

    #[tokio::test]
    async fn test_subscriber_only_sees_later_publishes() {
        let bus = MessageBus::new();
        let topic = Topic::User(Uuid::new_v4());
        let mut early = bus.subscribe(&topic);
        bus.send(&topic, &EventMsg::Heartbeat);

        let mut late = bus.subscribe(&topic);
        bus.send(&topic, &EventMsg::GameOver);

        assert_eq!(early.recv().await.unwrap(), Bytes::from(EventMsg::Heartbeat.to_json()));
        assert_eq!(early.recv().await.unwrap(), Bytes::from(EventMsg::GameOver.to_json()));
        assert_eq!(late.recv().await.unwrap(), Bytes::from(EventMsg::GameOver.to_json()));
    }

    #[tokio::test]
    async fn test_topic_dropped_after_last_subscriber() {
        let bus = MessageBus::new();
        let topic = Topic::Party(Uuid::new_v4());
        let rx = bus.subscribe(&topic);
        assert_eq!(bus.topic_count(), 1);

        drop(rx);
        // The next publish notices the empty channel and collects it.
        bus.send(&topic, &EventMsg::GameOver);
        assert_eq!(bus.topic_count(), 0);
    }
}
