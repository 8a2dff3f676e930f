use std::sync::Arc;

use dashmap::DashMap;
use futures::{Stream, StreamExt};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, warn};

const DEFAULT_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    topics: Arc<DashMap<String, broadcast::Sender<Value>>>,
    capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn publish<T: Serialize>(&self, topic: &str, event: &T) -> usize {
        let value = match serde_json::to_value(event) {
            Ok(v) => v,
            Err(e) => {
                warn!(topic, error = %e, "dropping unserializable event");
                return 0;
            }
        };

        let sent = match self.topics.get(topic) {
            Some(sender) => sender.send(value),
            None => return 0,
        };
        match sent {
            Ok(received) => received,
            Err(_) => {
                // Every receiver is gone; forget the topic until someone subscribes again.
                self.topics.remove_if(topic, |_, sender| sender.receiver_count() == 0);
                debug!(topic, "dropped topic without subscribers");
                0
            }
        }
    }

    pub fn subscribe<T>(&self, topic: &str) -> impl Stream<Item = T> + Send + 'static
    where
        T: DeserializeOwned + Send + 'static,
    {
        let receiver = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        let topic = topic.to_string();

        BroadcastStream::new(receiver).filter_map(move |item| {
            let decoded = match item {
                Ok(value) => match serde_json::from_value(value) {
                    Ok(event) => Some(event),
                    Err(e) => {
                        warn!(topic = %topic, error = %e, "event does not match subscriber type");
                        None
                    }
                },
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    debug!(topic = %topic, skipped, "subscriber lagged");
                    None
                }
            };
            futures::future::ready(decoded)
        })
    }

}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::EventBus;

    #[tokio::test]
    async fn delivers_to_every_subscriber_in_order() {
        let bus = EventBus::new(8);
        let mut a = Box::pin(bus.subscribe::<String>("randomHash"));
        let mut b = Box::pin(bus.subscribe::<String>("randomHash"));

        assert_eq!(bus.publish("randomHash", &"one"), 2);
        assert_eq!(bus.publish("randomHash", &"two"), 2);

        assert_eq!(a.next().await.as_deref(), Some("one"));
        assert_eq!(a.next().await.as_deref(), Some("two"));
        assert_eq!(b.next().await.as_deref(), Some("one"));
    }

    #[test]
    fn publish_without_subscribers_reaches_nobody() {
        let bus = EventBus::default();
        assert_eq!(bus.publish("nobody", &1), 0);
    }

    #[tokio::test]
    async fn abandoned_topic_is_dropped_on_publish() {
        let bus = EventBus::default();
        let stream = bus.subscribe::<u32>("topic");
        assert!(bus.topics.contains_key("topic"));

        drop(stream);
        assert_eq!(bus.publish("topic", &1), 0);
        assert!(!bus.topics.contains_key("topic"));

        let mut again = Box::pin(bus.subscribe::<u32>("topic"));
        assert_eq!(bus.publish("topic", &2), 1);
        assert_eq!(again.next().await, Some(2));
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = EventBus::default();
        let mut hashes = Box::pin(bus.subscribe::<String>("randomHash"));
        let _other = bus.subscribe::<String>("other");

        bus.publish("other", &"ignored");
        bus.publish("randomHash", &"abc");

        assert_eq!(hashes.next().await.as_deref(), Some("abc"));
    }
}
