//! Tracks live connections under three indices — by connection id, by
//! user id, and by session id — sharded so that lookups and updates from
//! different connections rarely contend on the same lock. Ephemeral
//! records also live in the K/V store as `connection:<id>:session` and
//! `user:<id>:session`, each holding a session id with a 30 minute TTL
//! refreshed on activity, so another replica can discover which session a
//! connection or user is attached to without asking this one.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use kv_store::{KvStore, SetMode};
use parking_lot::{Mutex, RwLock};
use wire::RouterError;

const ACTIVITY_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub connection_id: String,
    pub user_id: String,
    pub session_id: Option<String>,
    pub last_active: Instant,
}

fn shard_index(key: &str, shard_count: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % shard_count
}

fn connection_session_key(connection_id: &str) -> String {
    format!("connection:{connection_id}:session")
}

fn user_session_key(user_id: &str) -> String {
    format!("user:{user_id}:session")
}

/// A sharded registry of live connections. `shard_count` should scale
/// with the number of worker threads (the teacher's convention is
/// `worker_threads * 4`) so that concurrent connections spread across
/// shards instead of queueing on one lock.
pub struct ConnectionRegistry {
    connections: Vec<RwLock<HashMap<String, ConnectionInfo>>>,
    by_user: Vec<Mutex<HashMap<String, HashSet<String>>>>,
    by_session: Vec<Mutex<HashMap<String, HashSet<String>>>>,
    shard_count: usize,
    kv: Arc<dyn KvStore>,
}

impl ConnectionRegistry {
    pub fn new(shard_count: usize, kv: Arc<dyn KvStore>) -> Self {
        let shard_count = shard_count.max(1);
        ConnectionRegistry {
            connections: (0..shard_count).map(|_| RwLock::new(HashMap::new())).collect(),
            by_user: (0..shard_count).map(|_| Mutex::new(HashMap::new())).collect(),
            by_session: (0..shard_count).map(|_| Mutex::new(HashMap::new())).collect(),
            shard_count,
            kv,
        }
    }

    fn conn_shard(&self, connection_id: &str) -> &RwLock<HashMap<String, ConnectionInfo>> {
        &self.connections[shard_index(connection_id, self.shard_count)]
    }

    fn user_shard(&self, user_id: &str) -> &Mutex<HashMap<String, HashSet<String>>> {
        &self.by_user[shard_index(user_id, self.shard_count)]
    }

    fn session_shard(&self, session_id: &str) -> &Mutex<HashMap<String, HashSet<String>>> {
        &self.by_session[shard_index(session_id, self.shard_count)]
    }

    /// Writes (or refreshes) the `connection:<id>:session` and
    /// `user:<id>:session` records for a connection currently attached to
    /// `session_id`, each with a fresh 30 minute TTL.
    async fn publish_session_keys(&self, connection_id: &str, user_id: &str, session_id: &str) -> Result<(), RouterError> {
        let value = Bytes::from(session_id.to_string());
        self.kv
            .set(&connection_session_key(connection_id), value.clone(), Some(ACTIVITY_TTL), SetMode::Always)
            .await?;
        self.kv
            .set(&user_session_key(user_id), value, Some(ACTIVITY_TTL), SetMode::Always)
            .await?;
        Ok(())
    }

    /// Removes the `connection:<id>:session` and `user:<id>:session`
    /// records. Best-effort: a key that already expired or was never
    /// written is not an error here.
    async fn clear_session_keys(&self, connection_id: &str, user_id: &str) -> Result<(), RouterError> {
        self.kv.delete(&connection_session_key(connection_id)).await?;
        self.kv.delete(&user_session_key(user_id)).await?;
        Ok(())
    }

    pub async fn register(&self, connection_id: &str, user_id: &str) -> Result<(), RouterError> {
        self.conn_shard(connection_id).write().insert(
            connection_id.to_string(),
            ConnectionInfo {
                connection_id: connection_id.to_string(),
                user_id: user_id.to_string(),
                session_id: None,
                last_active: Instant::now(),
            },
        );
        self.user_shard(user_id)
            .lock()
            .entry(user_id.to_string())
            .or_default()
            .insert(connection_id.to_string());
        // Nothing to publish yet: both K/V records name a session, and
        // this connection has none until it attaches to one.
        Ok(())
    }

    pub async fn attach_to_session(&self, connection_id: &str, session_id: &str) -> Result<(), RouterError> {
        let user_id = {
            let mut shard = self.conn_shard(connection_id).write();
            let info = shard
                .get_mut(connection_id)
                .ok_or(RouterError::Internal {
                    detail: "attach_to_session called on unregistered connection".to_string(),
                })?;
            info.session_id = Some(session_id.to_string());
            info.last_active = Instant::now();
            info.user_id.clone()
        };
        self.session_shard(session_id)
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .insert(connection_id.to_string());
        self.publish_session_keys(connection_id, &user_id, session_id).await
    }

    /// Removes a connection from its session without forgetting the
    /// connection itself (the user may still be connected, just not
    /// attached to any puzzle).
    pub async fn detach_from_session(&self, connection_id: &str) -> Result<(), RouterError> {
        let (user_id, session_id) = {
            let mut shard = self.conn_shard(connection_id).write();
            match shard.get_mut(connection_id) {
                Some(info) => {
                    let session_id = info.session_id.take();
                    (info.user_id.clone(), session_id)
                }
                None => return Ok(()),
            }
        };
        if let Some(session_id) = &session_id {
            if let Some(members) = self.session_shard(session_id).lock().get_mut(session_id) {
                members.remove(connection_id);
            }
        }
        self.clear_session_keys(connection_id, &user_id).await
    }

    /// Fully removes a connection: from the session index (if attached),
    /// the user index, the primary map, and its K/V session records. This
    /// is the single path both explicit disconnects and the liveness
    /// sweeper use, so stale connections are cleaned up identically to
    /// ones that hang up politely.
    pub async fn deregister(&self, connection_id: &str) -> Result<(), RouterError> {
        let info = self.conn_shard(connection_id).write().remove(connection_id);
        let Some(info) = info else { return Ok(()) };
        if let Some(users) = self.by_user[shard_index(&info.user_id, self.shard_count)]
            .lock()
            .get_mut(&info.user_id)
        {
            users.remove(connection_id);
        }
        if let Some(session_id) = &info.session_id {
            if let Some(members) = self.session_shard(session_id).lock().get_mut(session_id) {
                members.remove(connection_id);
            }
        }
        self.clear_session_keys(connection_id, &info.user_id).await
    }

    pub async fn touch(&self, connection_id: &str) -> Result<(), RouterError> {
        let (user_id, session_id) = {
            let mut shard = self.conn_shard(connection_id).write();
            match shard.get_mut(connection_id) {
                Some(info) => {
                    info.last_active = Instant::now();
                    (info.user_id.clone(), info.session_id.clone())
                }
                None => return Ok(()),
            }
        };
        match session_id {
            Some(session_id) => self.publish_session_keys(connection_id, &user_id, &session_id).await,
            None => Ok(()),
        }
    }

    pub fn lookup_by_connection(&self, connection_id: &str) -> Option<ConnectionInfo> {
        self.conn_shard(connection_id).read().get(connection_id).cloned()
    }

    pub fn lookup_by_user(&self, user_id: &str) -> Vec<String> {
        self.user_shard(user_id)
            .lock()
            .get(user_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn lookup_by_session(&self, session_id: &str) -> Vec<String> {
        self.session_shard(session_id)
            .lock()
            .get(session_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the connection ids whose in-memory `last_active` is older
    /// than `idle_timeout`, without removing them: the caller decides the
    /// eviction order and runs any per-connection cleanup (released
    /// locks, a `user-left` event) before calling `deregister`.
    pub fn find_stale(&self, idle_timeout: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut stale = Vec::new();
        for shard in &self.connections {
            for info in shard.read().values() {
                if now.duration_since(info.last_active) > idle_timeout {
                    stale.push(info.connection_id.clone());
                }
            }
        }
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kv_store::InMemoryKvStore;

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(4, Arc::new(InMemoryKvStore::new()))
    }

    fn registry_with_kv() -> (ConnectionRegistry, Arc<InMemoryKvStore>) {
        let kv = Arc::new(InMemoryKvStore::new());
        (ConnectionRegistry::new(4, kv.clone()), kv)
    }

    #[tokio::test]
    async fn register_then_lookup_by_all_indices() {
        let registry = registry();
        registry.register("c1", "u1").await.unwrap();
        registry.attach_to_session("c1", "s1").await.unwrap();

        assert!(registry.lookup_by_connection("c1").is_some());
        assert_eq!(registry.lookup_by_user("u1"), vec!["c1".to_string()]);
        assert_eq!(registry.lookup_by_session("s1"), vec!["c1".to_string()]);
    }

    #[tokio::test]
    async fn detach_from_session_clears_session_index_only() {
        let registry = registry();
        registry.register("c1", "u1").await.unwrap();
        registry.attach_to_session("c1", "s1").await.unwrap();
        registry.detach_from_session("c1").await.unwrap();

        assert!(registry.lookup_by_connection("c1").is_some());
        assert!(registry.lookup_by_session("s1").is_empty());
    }

    #[tokio::test]
    async fn deregister_clears_every_index() {
        let registry = registry();
        registry.register("c1", "u1").await.unwrap();
        registry.attach_to_session("c1", "s1").await.unwrap();
        registry.deregister("c1").await.unwrap();

        assert!(registry.lookup_by_connection("c1").is_none());
        assert!(registry.lookup_by_user("u1").is_empty());
        assert!(registry.lookup_by_session("s1").is_empty());
    }

    #[tokio::test]
    async fn attach_publishes_connection_and_user_session_keys() {
        let (registry, kv) = registry_with_kv();
        registry.register("c1", "u1").await.unwrap();
        assert!(kv.get(&connection_session_key("c1")).await.unwrap().is_none());
        assert!(kv.get(&user_session_key("u1")).await.unwrap().is_none());

        registry.attach_to_session("c1", "s1").await.unwrap();
        assert_eq!(
            kv.get(&connection_session_key("c1")).await.unwrap(),
            Some(Bytes::from("s1"))
        );
        assert_eq!(kv.get(&user_session_key("u1")).await.unwrap(), Some(Bytes::from("s1")));

        registry.detach_from_session("c1").await.unwrap();
        assert!(kv.get(&connection_session_key("c1")).await.unwrap().is_none());
        assert!(kv.get(&user_session_key("u1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn find_stale_reports_connections_past_idle_timeout() {
        let registry = registry();
        registry.register("c1", "u1").await.unwrap();
        assert!(registry.find_stale(Duration::from_secs(0)).contains(&"c1".to_string()));
        assert!(registry.find_stale(Duration::from_secs(3600)).is_empty());
    }
}
