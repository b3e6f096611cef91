use crate::breaker::{BreakerSnapshot, CircuitBreaker};
use crate::cache::CacheBackend;
use crate::config::BreakerConfig;
use crate::metrics::Metrics;
use crate::Result;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Reply to a cache read. Never an error: upstream code falls back to the
/// source of truth when the backend cannot answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheReply {
    Value(String),
    Missing,
    Unavailable,
}

/// Outcome of a cache write or delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheWrite {
    Done,
    Unavailable,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientHealth {
    pub backend: &'static str,
    pub reachable: bool,
    pub breaker: BreakerSnapshot,
}

/// Cache client wrapping a backend with a circuit breaker and a per-call
/// timeout. A timeout counts as a breaker failure but surfaces as
/// `Unavailable`, never as an error.
#[derive(Clone)]
pub struct ResilientClient {
    backend: Arc<dyn CacheBackend>,
    breaker: Arc<CircuitBreaker>,
    call_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl ResilientClient {
    pub fn new(backend: Arc<dyn CacheBackend>, config: &BreakerConfig, metrics: Arc<Metrics>) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(
            config.failure_threshold,
            config.reset_timeout(),
        ));
        Self {
            backend,
            breaker,
            call_timeout: config.call_timeout(),
            metrics,
        }
    }

    async fn guarded<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T>>,
    ) -> Option<T> {
        if !self.breaker.allows_call() {
            debug!("circuit open, short-circuiting cache {}", op);
            self.metrics.cache_unavailable.inc();
            return None;
        }

        let outcome = match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(Ok(value)) => {
                self.breaker.on_success();
                Some(value)
            }
            Ok(Err(e)) => {
                warn!("cache {} failed: {}", op, e);
                self.breaker.on_failure();
                self.metrics.cache_unavailable.inc();
                None
            }
            Err(_) => {
                warn!("cache {} timed out after {:?}", op, self.call_timeout);
                self.breaker.on_failure();
                self.metrics.cache_unavailable.inc();
                None
            }
        };

        self.metrics.set_breaker_open(self.breaker.is_open());
        outcome
    }

    pub async fn get(&self, key: &str) -> CacheReply {
        match self.guarded("get", self.backend.get(key)).await {
            Some(Some(value)) => CacheReply::Value(value),
            Some(None) => CacheReply::Missing,
            None => CacheReply::Unavailable,
        }
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheWrite {
        match self.guarded("set", self.backend.set(key, value, ttl)).await {
            Some(()) => CacheWrite::Done,
            None => CacheWrite::Unavailable,
        }
    }

    pub async fn delete(&self, key: &str) -> CacheWrite {
        match self.guarded("delete", self.backend.delete(key)).await {
            Some(()) => CacheWrite::Done,
            None => CacheWrite::Unavailable,
        }
    }

    pub async fn ping(&self) -> bool {
        self.guarded("ping", self.backend.ping()).await.is_some()
    }

    pub fn breaker_snapshot(&self) -> BreakerSnapshot {
        self.breaker.snapshot()
    }

    pub async fn health(&self) -> ClientHealth {
        let reachable = self.ping().await;
        ClientHealth {
            backend: self.backend.name(),
            reachable,
            breaker: self.breaker.snapshot(),
        }
    }
}
