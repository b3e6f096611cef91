use crate::retry::{retry_with_backoff, RetryConfig};
use crate::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::time::{Duration, Instant};

/// Raw key/value backend behind the resilient client. Implementations report
/// failures as errors; the client above turns them into breaker feedback and
/// non-throwing replies.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn ping(&self) -> Result<()>;
}

/// In-process backend with lazy TTL eviction. Default when no Redis URL is
/// configured; also the test backend.
#[derive(Default)]
pub struct MemoryBackend {
    data: DashMap<String, (String, Option<Instant>)>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        if let Some(entry) = self.data.get(key) {
            let (value, deadline) = entry.value().clone();
            drop(entry);
            if deadline.map(|at| at <= Instant::now()).unwrap_or(false) {
                self.data.remove(key);
                return Ok(None);
            }
            return Ok(Some(value));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let deadline = ttl.map(|t| Instant::now() + t);
        self.data.insert(key.to_string(), (value.to_string(), deadline));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.data.remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Redis backend. `ConnectionManager` multiplexes a reconnecting connection,
/// so a dropped link heals without the caller noticing beyond breaker
/// feedback.
pub struct RedisBackend {
    conn: ConnectionManager,
}

impl RedisBackend {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let url = redis_url.to_string();
        let conn = retry_with_backoff(&RetryConfig::backend_connect(), "redis-connect", || {
            let url = url.clone();
            async move {
                let client = Client::open(url.as_str())?;
                Ok(ConnectionManager::new(client).await?)
            }
        })
        .await?;

        Ok(Self { conn })
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => {
                let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
            }
            None => {
                let _: () = conn.set(key, value).await?;
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
