//! In-memory KV fallback with the same semantics as a hosted backend,
//! used when no backend is configured (tests, local runs).

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::time::Instant;

use super::kv::{KvError, KvResult, KvStore};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    List(Vec<String>),
    Set(Vec<String>),
    ZSet(BTreeMap<String, f64>),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Set(_) => "set",
            Value::ZSet(_) => "zset",
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

/// Process-local KV store. TTLs are enforced lazily on access against
/// `tokio::time::Instant`, so paused-clock tests can drive expiry.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn purge_expired(&self, key: &str) {
        let now = Instant::now();
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get(key) {
            if entry.expires_at.is_some_and(|at| at <= now) {
                entries.remove(key);
            }
        }
    }

    fn with_entry<T>(
        &self,
        key: &str,
        expected: &'static str,
        f: impl FnOnce(Option<&Value>) -> KvResult<T>,
    ) -> KvResult<T> {
        self.purge_expired(key);
        let entries = self.entries.read();
        match entries.get(key) {
            Some(entry) => f(Some(&entry.value)),
            None => f(None),
        }
        .map_err(|e| match e {
            KvError::WrongKind { key, .. } => KvError::WrongKind { key, expected },
            other => other,
        })
    }

    fn with_entry_mut<T>(
        &self,
        key: &str,
        default: impl FnOnce() -> Value,
        expected: &'static str,
        f: impl FnOnce(&mut Value) -> KvResult<T>,
    ) -> KvResult<T> {
        self.purge_expired(key);
        let mut entries = self.entries.write();
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: default(),
            expires_at: None,
        });
        if entry.value.kind() != expected {
            return Err(KvError::WrongKind {
                key: key.to_string(),
                expected,
            });
        }
        f(&mut entry.value)
    }
}

fn wrong_kind(key: &str) -> KvError {
    KvError::WrongKind {
        key: key.to_string(),
        expected: "",
    }
}

/// Resolves an inclusive redis-style range against a list length.
fn resolve_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let mut start = if start < 0 { len + start } else { start };
    let mut stop = if stop < 0 { len + stop } else { stop };
    start = start.max(0);
    stop = stop.min(len - 1);
    if len == 0 || start > stop {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        self.with_entry(key, "string", |v| match v {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_kind(key)),
        })
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> KvResult<()> {
        let mut entries = self.entries.write();
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> KvResult<bool> {
        self.purge_expired(key);
        Ok(self.entries.write().remove(key).is_some())
    }

    async fn del_prefix(&self, prefix: &str) -> KvResult<u64> {
        let mut entries = self.entries.write();
        let keys: Vec<String> = entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        let n = keys.len() as u64;
        for k in keys {
            entries.remove(&k);
        }
        Ok(n)
    }

    async fn rpush(&self, key: &str, value: String) -> KvResult<u64> {
        self.with_entry_mut(key, || Value::List(Vec::new()), "list", |v| {
            let Value::List(list) = v else {
                return Err(wrong_kind(key));
            };
            list.push(value);
            Ok(list.len() as u64)
        })
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> KvResult<Vec<String>> {
        self.with_entry(key, "list", |v| match v {
            None => Ok(Vec::new()),
            Some(Value::List(list)) => Ok(match resolve_range(list.len(), start, stop) {
                Some((a, b)) => list[a..=b].to_vec(),
                None => Vec::new(),
            }),
            Some(_) => Err(wrong_kind(key)),
        })
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> KvResult<()> {
        self.with_entry_mut(key, || Value::List(Vec::new()), "list", |v| {
            let Value::List(list) = v else {
                return Err(wrong_kind(key));
            };
            match resolve_range(list.len(), start, stop) {
                Some((a, b)) => {
                    *list = list[a..=b].to_vec();
                }
                None => list.clear(),
            }
            Ok(())
        })
    }

    async fn llen(&self, key: &str) -> KvResult<u64> {
        self.with_entry(key, "list", |v| match v {
            None => Ok(0),
            Some(Value::List(list)) => Ok(list.len() as u64),
            Some(_) => Err(wrong_kind(key)),
        })
    }

    async fn sadd(&self, key: &str, member: String) -> KvResult<bool> {
        self.with_entry_mut(key, || Value::Set(Vec::new()), "set", |v| {
            let Value::Set(set) = v else {
                return Err(wrong_kind(key));
            };
            if set.iter().any(|m| *m == member) {
                return Ok(false);
            }
            set.push(member);
            Ok(true)
        })
    }

    async fn smembers(&self, key: &str) -> KvResult<Vec<String>> {
        self.with_entry(key, "set", |v| match v {
            None => Ok(Vec::new()),
            Some(Value::Set(set)) => Ok(set.clone()),
            Some(_) => Err(wrong_kind(key)),
        })
    }

    async fn zadd(&self, key: &str, member: String, score: f64) -> KvResult<()> {
        self.with_entry_mut(key, || Value::ZSet(BTreeMap::new()), "zset", |v| {
            let Value::ZSet(zset) = v else {
                return Err(wrong_kind(key));
            };
            zset.insert(member, score);
            Ok(())
        })
    }

    async fn ztop(&self, key: &str, count: usize) -> KvResult<Vec<(String, f64)>> {
        self.with_entry(key, "zset", |v| match v {
            None => Ok(Vec::new()),
            Some(Value::ZSet(zset)) => {
                let mut pairs: Vec<(String, f64)> =
                    zset.iter().map(|(m, s)| (m.clone(), *s)).collect();
                pairs.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
                pairs.truncate(count);
                Ok(pairs)
            }
            Some(_) => Err(wrong_kind(key)),
        })
    }

    async fn incr_by(&self, key: &str, delta: i64) -> KvResult<i64> {
        self.with_entry_mut(key, || Value::Str("0".to_string()), "string", |v| {
            let Value::Str(s) = v else {
                return Err(wrong_kind(key));
            };
            let current: i64 = s
                .parse()
                .map_err(|_| KvError::Backend(format!("value at {key} is not an integer")))?;
            let next = current + delta;
            *s = next.to_string();
            Ok(next)
        })
    }

    async fn incr_by_float(&self, key: &str, delta: f64) -> KvResult<f64> {
        self.with_entry_mut(key, || Value::Str("0".to_string()), "string", |v| {
            let Value::Str(s) = v else {
                return Err(wrong_kind(key));
            };
            let current: f64 = s
                .parse()
                .map_err(|_| KvError::Backend(format!("value at {key} is not a float")))?;
            let next = current + delta;
            *s = next.to_string();
            Ok(next)
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<bool> {
        self.purge_expired(key);
        let mut entries = self.entries.write();
        match entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_del_round_trip() {
        let kv = MemoryKv::new();
        kv.set("k", "v".to_string(), None).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v"));
        assert!(kv.del("k").await.unwrap());
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expires_lazily() {
        let kv = MemoryKv::new();
        kv.set("k", "v".to_string(), Some(Duration::from_secs(60)))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(kv.get("k").await.unwrap().is_some());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_push_range_trim() {
        let kv = MemoryKv::new();
        for i in 0..6 {
            kv.rpush("l", i.to_string()).await.unwrap();
        }
        assert_eq!(kv.llen("l").await.unwrap(), 6);
        assert_eq!(
            kv.lrange("l", -2, -1).await.unwrap(),
            vec!["4".to_string(), "5".to_string()]
        );
        kv.ltrim("l", -3, -1).await.unwrap();
        assert_eq!(
            kv.lrange("l", 0, -1).await.unwrap(),
            vec!["3".to_string(), "4".to_string(), "5".to_string()]
        );
    }

    #[tokio::test]
    async fn sets_preserve_insertion_order_and_dedupe() {
        let kv = MemoryKv::new();
        assert!(kv.sadd("s", "b".to_string()).await.unwrap());
        assert!(kv.sadd("s", "a".to_string()).await.unwrap());
        assert!(!kv.sadd("s", "b".to_string()).await.unwrap());
        assert_eq!(
            kv.smembers("s").await.unwrap(),
            vec!["b".to_string(), "a".to_string()]
        );
    }

    #[tokio::test]
    async fn zset_upsert_is_idempotent_per_member() {
        let kv = MemoryKv::new();
        kv.zadd("z", "a1".to_string(), 1.0).await.unwrap();
        kv.zadd("z", "a2".to_string(), 5.0).await.unwrap();
        kv.zadd("z", "a1".to_string(), 3.0).await.unwrap();
        assert_eq!(
            kv.ztop("z", 10).await.unwrap(),
            vec![("a2".to_string(), 5.0), ("a1".to_string(), 3.0)]
        );
    }

    #[tokio::test]
    async fn wrong_kind_is_an_error() {
        let kv = MemoryKv::new();
        kv.set("k", "v".to_string(), None).await.unwrap();
        assert!(matches!(
            kv.rpush("k", "x".to_string()).await,
            Err(KvError::WrongKind { .. })
        ));
    }

    #[tokio::test]
    async fn del_prefix_scopes_to_namespace() {
        let kv = MemoryKv::new();
        kv.set("agent:a1:state", "x".to_string(), None).await.unwrap();
        kv.set("agent:a1:notes", "y".to_string(), None).await.unwrap();
        kv.set("agent:a2:state", "z".to_string(), None).await.unwrap();
        assert_eq!(kv.del_prefix("agent:a1:").await.unwrap(), 2);
        assert!(kv.get("agent:a2:state").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn counters_increment() {
        let kv = MemoryKv::new();
        assert_eq!(kv.incr_by("n", 2).await.unwrap(), 2);
        assert_eq!(kv.incr_by("n", 3).await.unwrap(), 5);
        let f = kv.incr_by_float("f", 0.5).await.unwrap();
        assert!((f - 0.5).abs() < 1e-9);
    }
}
