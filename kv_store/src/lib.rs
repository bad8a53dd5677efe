//! The K/V store adapter: a narrow trait covering everything the lock
//! coordinator, connection registry, and backplane need from a shared
//! key/value store with pub/sub, plus two implementations.

mod in_memory;
mod redis;
mod store;

pub use in_memory::InMemoryKvStore;
pub use redis::RedisKvStore;
pub use store::{KvStore, KvSubscription, SetMode};
