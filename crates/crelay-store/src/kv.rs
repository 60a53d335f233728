use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crelay_common::{RelayError, RelayResult};

pub type SharedStore = Arc<dyn KvStore>;

/// Minimal typed surface over the shared KV backend. Every durable piece of
/// relay state (accounts, sticky sessions, refresh locks, key records) lives
/// behind this trait; failures surface as `KvUnavailable`, never silently.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> RelayResult<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> RelayResult<()>;
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> RelayResult<()>;
    async fn del(&self, key: &str) -> RelayResult<()>;
    async fn hget_all(&self, key: &str) -> RelayResult<HashMap<String, String>>;
    async fn hset_all(&self, key: &str, fields: &[(String, String)]) -> RelayResult<()>;
    async fn hdel(&self, key: &str, fields: &[String]) -> RelayResult<()>;
    async fn expire(&self, key: &str, ttl: Duration) -> RelayResult<()>;
    async fn keys(&self, pattern: &str) -> RelayResult<Vec<String>>;

    /// SET-IF-ABSENT with TTL. Returns true when this caller now holds the
    /// lock.
    async fn acquire(&self, key: &str, holder: &str, ttl: Duration) -> RelayResult<bool>;

    /// Deletes the lock only when the stored value still equals `holder`.
    /// Returns true when this caller released it.
    async fn release(&self, key: &str, holder: &str) -> RelayResult<bool>;
}

const RELEASE_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

pub struct RedisStore {
    conn: ConnectionManager,
    release: redis::Script,
}

impl RedisStore {
    pub async fn connect(url: &str) -> RelayResult<Self> {
        let client = redis::Client::open(url).map_err(map_redis_err)?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(map_redis_err)?;
        Ok(Self {
            conn,
            release: redis::Script::new(RELEASE_SCRIPT),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> RelayResult<Option<String>> {
        self.conn().get(key).await.map_err(map_redis_err)
    }

    async fn set(&self, key: &str, value: &str) -> RelayResult<()> {
        self.conn().set(key, value).await.map_err(map_redis_err)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> RelayResult<()> {
        self.conn()
            .set_ex(key, value, ttl.as_secs().max(1))
            .await
            .map_err(map_redis_err)
    }

    async fn del(&self, key: &str) -> RelayResult<()> {
        let _: i64 = self.conn().del(key).await.map_err(map_redis_err)?;
        Ok(())
    }

    async fn hget_all(&self, key: &str) -> RelayResult<HashMap<String, String>> {
        self.conn().hgetall(key).await.map_err(map_redis_err)
    }

    async fn hset_all(&self, key: &str, fields: &[(String, String)]) -> RelayResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        self.conn()
            .hset_multiple(key, fields)
            .await
            .map_err(map_redis_err)
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> RelayResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let _: i64 = self
            .conn()
            .hdel(key, fields)
            .await
            .map_err(map_redis_err)?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> RelayResult<()> {
        let _: bool = self
            .conn()
            .expire(key, ttl.as_secs().max(1) as i64)
            .await
            .map_err(map_redis_err)?;
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> RelayResult<Vec<String>> {
        redis::cmd("KEYS")
            .arg(pattern)
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_err)
    }

    async fn acquire(&self, key: &str, holder: &str, ttl: Duration) -> RelayResult<bool> {
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(holder)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_err)?;
        Ok(reply.is_some())
    }

    async fn release(&self, key: &str, holder: &str) -> RelayResult<bool> {
        let removed: i64 = self
            .release
            .key(key)
            .arg(holder)
            .invoke_async(&mut self.conn())
            .await
            .map_err(map_redis_err)?;
        Ok(removed == 1)
    }
}

fn map_redis_err(err: redis::RedisError) -> RelayError {
    RelayError::KvUnavailable(err.to_string())
}

#[derive(Debug, Clone)]
enum Stored {
    Str(String),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Stored,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.map(|at| at > Instant::now()).unwrap_or(true)
    }
}

/// In-memory stand-in used by tests and single-node operation.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn purge(map: &mut HashMap<String, Entry>, key: &str) {
    if map.get(key).map(|entry| !entry.live()).unwrap_or(false) {
        map.remove(key);
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> RelayResult<Option<String>> {
        let mut map = self.inner.lock().await;
        purge(&mut map, key);
        match map.get(key) {
            Some(Entry {
                value: Stored::Str(value),
                ..
            }) => Ok(Some(value.clone())),
            _ => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> RelayResult<()> {
        self.inner.lock().await.insert(
            key.to_string(),
            Entry {
                value: Stored::Str(value.to_string()),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> RelayResult<()> {
        self.inner.lock().await.insert(
            key.to_string(),
            Entry {
                value: Stored::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> RelayResult<()> {
        self.inner.lock().await.remove(key);
        Ok(())
    }

    async fn hget_all(&self, key: &str) -> RelayResult<HashMap<String, String>> {
        let mut map = self.inner.lock().await;
        purge(&mut map, key);
        match map.get(key) {
            Some(Entry {
                value: Stored::Hash(fields),
                ..
            }) => Ok(fields.clone()),
            _ => Ok(HashMap::new()),
        }
    }

    async fn hset_all(&self, key: &str, fields: &[(String, String)]) -> RelayResult<()> {
        let mut map = self.inner.lock().await;
        purge(&mut map, key);
        let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
            value: Stored::Hash(HashMap::new()),
            expires_at: None,
        });
        if !matches!(entry.value, Stored::Hash(_)) {
            entry.value = Stored::Hash(HashMap::new());
        }
        if let Stored::Hash(existing) = &mut entry.value {
            for (field, value) in fields {
                existing.insert(field.clone(), value.clone());
            }
        }
        Ok(())
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> RelayResult<()> {
        let mut map = self.inner.lock().await;
        if let Some(Entry {
            value: Stored::Hash(existing),
            ..
        }) = map.get_mut(key)
        {
            for field in fields {
                existing.remove(field);
            }
        }
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> RelayResult<()> {
        let mut map = self.inner.lock().await;
        if let Some(entry) = map.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> RelayResult<Vec<String>> {
        let prefix = pattern.trim_end_matches('*');
        let mut map = self.inner.lock().await;
        map.retain(|_, entry| entry.live());
        Ok(map
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn acquire(&self, key: &str, holder: &str, ttl: Duration) -> RelayResult<bool> {
        let mut map = self.inner.lock().await;
        purge(&mut map, key);
        if map.contains_key(key) {
            return Ok(false);
        }
        map.insert(
            key.to_string(),
            Entry {
                value: Stored::Str(holder.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn release(&self, key: &str, holder: &str) -> RelayResult<bool> {
        let mut map = self.inner.lock().await;
        purge(&mut map, key);
        let held = matches!(
            map.get(key),
            Some(Entry {
                value: Stored::Str(value),
                ..
            }) if value.as_str() == holder
        );
        if held {
            map.remove(key);
        }
        Ok(held)
    }
}
