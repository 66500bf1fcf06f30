//! Typed key-value interface. Keys are strictly namespaced
//! `agent:{id}:<suffix>`; shared leaderboards use `leaderboard:<kind>`.

use std::time::Duration;

use async_trait::async_trait;

/// Per-key time-to-live policy.
pub mod ttl {
    use std::time::Duration;

    pub const HEARTBEAT: Duration = Duration::from_secs(60);
    pub const REWARD_HISTORY: Duration = Duration::from_secs(60 * 60);
    pub const STUCK_STATE: Duration = Duration::from_secs(5 * 60);
    pub const AGENT_STATE: Duration = Duration::from_secs(24 * 60 * 60);
}

pub fn agent_key(agent_id: &str, suffix: &str) -> String {
    format!("agent:{agent_id}:{suffix}")
}

pub fn leaderboard_key(kind: &str) -> String {
    format!("leaderboard:{kind}")
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum KvError {
    /// The key holds a value of another kind (string vs list vs set...).
    #[error("wrong value kind for key {key}: expected {expected}")]
    WrongKind {
        key: String,
        expected: &'static str,
    },
    #[error("kv backend error: {0}")]
    Backend(String),
}

pub type KvResult<T> = Result<T, KvError>;

/// The operations the core needs from a KV backend. The in-memory
/// fallback implements the same semantics (TTL expiry included) so tests
/// and local runs exercise identical behavior.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> KvResult<Option<String>>;
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> KvResult<()>;
    async fn del(&self, key: &str) -> KvResult<bool>;
    /// Deletes every key starting with `prefix`; returns how many went.
    async fn del_prefix(&self, prefix: &str) -> KvResult<u64>;

    /// Appends to the right of a list, creating it if absent.
    async fn rpush(&self, key: &str, value: String) -> KvResult<u64>;
    /// Inclusive range, negative indices count from the tail.
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> KvResult<Vec<String>>;
    /// Trims the list to the inclusive range.
    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> KvResult<()>;
    async fn llen(&self, key: &str) -> KvResult<u64>;

    /// Adds to a set; returns true when the member was new.
    async fn sadd(&self, key: &str, member: String) -> KvResult<bool>;
    async fn smembers(&self, key: &str) -> KvResult<Vec<String>>;

    /// Idempotent sorted-set upsert (member keyed, score replaced).
    async fn zadd(&self, key: &str, member: String, score: f64) -> KvResult<()>;
    /// Members with scores, highest score first.
    async fn ztop(&self, key: &str, count: usize) -> KvResult<Vec<(String, f64)>>;

    async fn incr_by(&self, key: &str, delta: i64) -> KvResult<i64>;
    async fn incr_by_float(&self, key: &str, delta: f64) -> KvResult<f64>;

    /// (Re)sets the TTL on an existing key; false when the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<bool>;
}
