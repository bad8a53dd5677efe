//! Fans session events out across replicas over the K/V store's pub/sub,
//! one topic per puzzle session. Each envelope carries its origin replica
//! and connection id so a subscriber can recognize (and a caller can
//! skip re-delivering to) the connection that caused it.
//!
//! Ordering is per-publisher FIFO only: two replicas publishing to the
//! same topic concurrently are not given a total order relative to each
//! other, only relative to themselves, since each uses its own K/V
//! connection to publish.

use std::sync::Arc;

use futures::StreamExt;
use kv_store::KvStore;
use serde::{Deserialize, Serialize};
use task_executor::Executor;
use tokio::sync::oneshot;
use wire::RouterError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub origin_replica_id: String,
    pub origin_connection_id: String,
    pub sequence: u64,
    pub payload: serde_json::Value,
}

/// Keeps the consumer task for one subscription alive; dropping it stops
/// the task and lets the underlying K/V subscription go with it.
pub struct SubscriptionHandle {
    _stop: oneshot::Sender<()>,
}

pub struct Backplane {
    kv: Arc<dyn KvStore>,
    channel_prefix: String,
    replica_id: String,
}

impl Backplane {
    pub fn new(kv: Arc<dyn KvStore>, channel_prefix: String, replica_id: String) -> Self {
        Backplane {
            kv,
            channel_prefix,
            replica_id,
        }
    }

    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }

    fn topic(&self, session_id: &str) -> String {
        format!("{}:puzzle-{}", self.channel_prefix, session_id)
    }

    pub async fn publish(
        &self,
        session_id: &str,
        origin_connection_id: &str,
        sequence: u64,
        payload: serde_json::Value,
    ) -> Result<(), RouterError> {
        let envelope = Envelope {
            origin_replica_id: self.replica_id.clone(),
            origin_connection_id: origin_connection_id.to_string(),
            sequence,
            payload,
        };
        let bytes = serde_json::to_vec(&envelope).map_err(|e| RouterError::Internal {
            detail: e.to_string(),
        })?;
        self.kv.publish(&self.topic(session_id), bytes.into()).await
    }

    /// Subscribes to a session's topic and spawns the single consumer
    /// task that dispatches each decoded envelope to `on_message`, in the
    /// order the underlying stream yields them. Malformed payloads (which
    /// should never happen between cooperating replicas) are logged and
    /// skipped rather than killing the consumer.
    pub fn subscribe<F>(&self, executor: &Executor, session_id: &str, mut on_message: F) -> SubscriptionHandle
    where
        F: FnMut(Envelope) + Send + 'static,
    {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let kv = self.kv.clone();
        let topic = self.topic(session_id);
        executor.spawn(async move {
            let mut stream = match kv.subscribe(&topic).await {
                Ok(stream) => stream,
                Err(err) => {
                    log::error!("failed to subscribe to {topic}: {err}");
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = &mut stop_rx => return,
                    item = stream.next() => {
                        match item {
                            Some((_, payload)) => match serde_json::from_slice::<Envelope>(&payload) {
                                Ok(envelope) => on_message(envelope),
                                Err(err) => log::warn!("dropping malformed envelope on {topic}: {err}"),
                            },
                            None => return,
                        }
                    }
                }
            }
        });
        SubscriptionHandle { _stop: stop_tx }
    }
}

impl Clone for Backplane {
    fn clone(&self) -> Self {
        Backplane {
            kv: self.kv.clone(),
            channel_prefix: self.channel_prefix.clone(),
            replica_id: self.replica_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kv_store::InMemoryKvStore;
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn published_envelope_is_delivered_to_subscriber() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let backplane = Backplane::new(kv, "puzzle-hub".to_string(), "replica-1".to_string());
        let executor = Executor::borrowed();

        let received = Arc::new(Mutex::new(Vec::new()));
        let received_clone = received.clone();
        let _handle = backplane.subscribe(&executor, "s1", move |envelope| {
            received_clone.lock().unwrap().push(envelope);
        });

        // Give the subscriber task a chance to establish its subscription.
        tokio::time::sleep(Duration::from_millis(20)).await;

        backplane
            .publish("s1", "conn-a", 1, serde_json::json!({"kind": "piece-moved"}))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let seen = received.lock().unwrap().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].origin_connection_id, "conn-a");
        assert_eq!(seen[0].origin_replica_id, "replica-1");
    }

    #[tokio::test]
    async fn topic_is_scoped_by_channel_prefix_and_session() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let backplane = Backplane::new(kv, "puzzle-hub".to_string(), "replica-1".to_string());
        assert_eq!(backplane.topic("abc"), "puzzle-hub:puzzle-abc");
    }
}
