use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use wire::RouterError;

/// Write mode for `KvStore::set`, mirroring the two modes every caller in
/// this system needs: an unconditional write, or a write that only takes
/// effect if the key does not already hold a value (the primitive a lock
/// acquisition is built from).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetMode {
    Always,
    IfAbsent,
}

/// A live subscription to a topic. Polling `next()` yields `(topic,
/// payload)` pairs as they arrive; dropping the subscription unsubscribes.
pub type KvSubscription = Pin<Box<dyn Stream<Item = (String, Bytes)> + Send>>;

/// The contract the rest of the system holds the K/V store to. Every
/// method maps transport loss to `RouterError::StoreUnavailable` rather
/// than panicking or hanging; callers treat that as a transient
/// infrastructure error per the error taxonomy.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, RouterError>;

    /// Writes `value` under `key`. When `ttl` is `Some`, the key expires
    /// after that duration. Returns `true` if the write took effect:
    /// always true for `SetMode::Always`, and true for `SetMode::IfAbsent`
    /// only when the key had no prior value.
    async fn set(
        &self,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
        mode: SetMode,
    ) -> Result<bool, RouterError>;

    async fn delete(&self, key: &str) -> Result<bool, RouterError>;

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), RouterError>;

    /// Subscribes to `topic`. The returned stream survives a transport
    /// reconnect: the implementation re-subscribes transparently.
    async fn subscribe(&self, topic: &str) -> Result<KvSubscription, RouterError>;
}
