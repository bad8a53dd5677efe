use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use wire::RouterError;

use crate::store::{KvStore, KvSubscription, SetMode};

struct Entry {
    value: Bytes,
    expires_at: Option<Instant>,
}

/// A single-process fake of the K/V store: an in-memory map plus a
/// broadcast channel per topic. Used by `testutil` and by `hub_server`
/// when no `kv-endpoint` is configured. In that mode the "distributed"
/// lock guarantee degrades to single-process, since there is only one
/// process sharing this map.
pub struct InMemoryKvStore {
    entries: Mutex<HashMap<String, Entry>>,
    topics: Mutex<HashMap<String, broadcast::Sender<(String, Bytes)>>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        InMemoryKvStore {
            entries: Mutex::new(HashMap::new()),
            topics: Mutex::new(HashMap::new()),
        }
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<(String, Bytes)> {
        let mut topics = self.topics.lock();
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(1024).0)
            .clone()
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, RouterError> {
        let mut entries = self.entries.lock();
        let expired = matches!(entries.get(key), Some(e) if e.expires_at.is_some_and(|at| at <= Instant::now()));
        if expired {
            entries.remove(key);
        }
        Ok(entries.get(key).map(|e| e.value.clone()))
    }

    async fn set(
        &self,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
        mode: SetMode,
    ) -> Result<bool, RouterError> {
        let mut entries = self.entries.lock();
        let occupied = match entries.get(key) {
            Some(e) => e.expires_at.is_none_or(|at| at > Instant::now()),
            None => false,
        };
        if mode == SetMode::IfAbsent && occupied {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, RouterError> {
        Ok(self.entries.lock().remove(key).is_some())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), RouterError> {
        // No subscribers is not an error: publishing into the void is normal
        // when a session has no other replica currently watching its topic.
        let _ = self.sender_for(topic).send((topic.to_string(), payload));
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<KvSubscription, RouterError> {
        let receiver = self.sender_for(topic).subscribe();
        let stream = BroadcastStream::new(receiver).filter_map(|item| async move { item.ok() });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn if_absent_set_fails_when_occupied() {
        let store = InMemoryKvStore::new();
        assert!(store
            .set("k", Bytes::from_static(b"v1"), None, SetMode::IfAbsent)
            .await
            .unwrap());
        assert!(!store
            .set("k", Bytes::from_static(b"v2"), None, SetMode::IfAbsent)
            .await
            .unwrap());
        assert_eq!(store.get("k").await.unwrap().unwrap(), Bytes::from_static(b"v1"));
    }

    #[tokio::test]
    async fn ttl_expires_entries() {
        let store = InMemoryKvStore::new();
        store
            .set("k", Bytes::from_static(b"v"), Some(Duration::from_millis(10)), SetMode::Always)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let store = InMemoryKvStore::new();
        let mut sub = store.subscribe("topic-a").await.unwrap();
        store.publish("topic-a", Bytes::from_static(b"hi")).await.unwrap();
        let (topic, payload) = sub.next().await.unwrap();
        assert_eq!(topic, "topic-a");
        assert_eq!(payload, Bytes::from_static(b"hi"));
    }
}
