use crate::cache::{CacheReply, CacheWrite, ResilientClient};
use crate::metrics::Metrics;
use crate::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Per-data-class caching policy.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    pub ttl_secs: u64,
    pub stale_while_revalidate_secs: u64,
    pub background_refresh: bool,
}

impl CachePolicy {
    fn backend_ttl(&self) -> Duration {
        // The backend keeps the value through the stale window so stale
        // reads stay serveable.
        Duration::from_secs(self.ttl_secs + self.stale_while_revalidate_secs)
    }
}

/// Envelope stored around every cached payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedValue {
    pub value: serde_json::Value,
    pub written_at: DateTime<Utc>,
    pub ttl_seconds: u64,
    #[serde(default)]
    pub compressed: bool,
}

impl CachedValue {
    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        now.signed_duration_since(self.written_at).num_seconds()
    }
}

/// Read-through cache with stale-while-revalidate semantics on top of the
/// resilient client. Never blocks a caller on a cache write.
#[derive(Clone)]
pub struct CacheManager {
    client: ResilientClient,
    refreshing: Arc<DashMap<String, ()>>,
    metrics: Arc<Metrics>,
}

impl CacheManager {
    pub fn new(client: ResilientClient, metrics: Arc<Metrics>) -> Self {
        Self {
            client,
            refreshing: Arc::new(DashMap::new()),
            metrics,
        }
    }

    pub fn client(&self) -> &ResilientClient {
        &self.client
    }

    /// Read `key` through the cache. Fresh hits return the cached value;
    /// stale hits (within the revalidate window) return the cached value and
    /// schedule at most one background refresh; everything else falls back
    /// to a synchronous `fetch` with a fire-and-forget write-back.
    pub async fn get_with<T, F, Fut>(&self, key: &str, policy: CachePolicy, fetch: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send,
    {
        let now = Utc::now();

        if let CacheReply::Value(raw) = self.client.get(key).await {
            match serde_json::from_str::<CachedValue>(&raw) {
                Ok(envelope) if envelope.compressed => {
                    warn!("cache key {} holds a compressed payload, refetching", key);
                }
                Ok(envelope) => {
                    let age = envelope.age_secs(now);
                    let ttl = policy.ttl_secs as i64;
                    let stale_until = ttl + policy.stale_while_revalidate_secs as i64;

                    if age <= ttl {
                        if let Ok(value) = serde_json::from_value::<T>(envelope.value) {
                            self.metrics.cache_hits.inc();
                            return Ok(value);
                        }
                        warn!("cache key {} holds an undecodable value, refetching", key);
                    } else if policy.background_refresh && age <= stale_until {
                        if let Ok(value) = serde_json::from_value::<T>(envelope.value) {
                            self.metrics.cache_stale_hits.inc();
                            self.spawn_refresh(key, policy, fetch);
                            return Ok(value);
                        }
                        warn!("cache key {} holds an undecodable value, refetching", key);
                    }
                }
                Err(e) => {
                    warn!("cache key {} holds an undecodable envelope ({}), refetching", key, e);
                }
            }
        }

        // Miss, beyond the stale window, or the backend could not answer.
        self.metrics.cache_misses.inc();
        let value = fetch().await?;
        self.write_back(key, &value, &policy);
        Ok(value)
    }

    /// Delete `key`; subsequent reads refetch.
    pub async fn invalidate(&self, key: &str) {
        if self.client.delete(key).await == CacheWrite::Unavailable {
            debug!("cache invalidation of {} skipped: backend unavailable", key);
        }
    }

    /// Pre-populate a critical key at startup.
    pub async fn warm_up<T, F, Fut>(&self, key: &str, policy: CachePolicy, fetch: F)
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send,
    {
        if let Err(e) = self.get_with(key, policy, fetch).await {
            warn!("cache warm-up of {} failed: {}", key, e);
        }
    }

    fn spawn_refresh<T, F, Fut>(&self, key: &str, policy: CachePolicy, fetch: F)
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send,
    {
        // One in-flight refresh per key.
        if self.refreshing.insert(key.to_string(), ()).is_some() {
            return;
        }

        let client = self.client.clone();
        let refreshing = Arc::clone(&self.refreshing);
        let key = key.to_string();

        tokio::spawn(async move {
            match fetch().await {
                Ok(value) => match envelope_json(&value, &policy) {
                    Ok(raw) => {
                        if client.set(&key, &raw, Some(policy.backend_ttl())).await
                            == CacheWrite::Unavailable
                        {
                            warn!("background refresh of {} could not be written back", key);
                        }
                    }
                    Err(e) => warn!("background refresh of {} failed to serialize: {}", key, e),
                },
                Err(e) => warn!("background refresh of {} failed: {}", key, e),
            }
            refreshing.remove(&key);
        });
    }

    fn write_back<T: Serialize>(&self, key: &str, value: &T, policy: &CachePolicy) {
        let raw = match envelope_json(value, policy) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("cache write-back of {} failed to serialize: {}", key, e);
                return;
            }
        };

        let client = self.client.clone();
        let key = key.to_string();
        let ttl = policy.backend_ttl();
        tokio::spawn(async move {
            if client.set(&key, &raw, Some(ttl)).await == CacheWrite::Unavailable {
                debug!("cache write-back of {} skipped: backend unavailable", key);
            }
        });
    }
}

fn envelope_json<T: Serialize>(value: &T, policy: &CachePolicy) -> Result<String> {
    let envelope = CachedValue {
        value: serde_json::to_value(value)?,
        written_at: Utc::now(),
        ttl_seconds: policy.ttl_secs,
        compressed: false,
    };
    Ok(serde_json::to_string(&envelope)?)
}
