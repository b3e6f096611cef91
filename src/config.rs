use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Service configuration. Defaults are overridden by an optional TOML file,
/// which is in turn overridden by `LOBBY__`-prefixed environment variables
/// (e.g. `LOBBY__OFFER__TTL_SECS=300`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LobbyConfig {
    pub offer: OfferConfig,
    pub breaker: BreakerConfig,
    pub cache: CacheConfig,
    pub queue: QueueConfig,
    pub store: StoreConfig,
}

impl Default for LobbyConfig {
    fn default() -> Self {
        Self {
            offer: OfferConfig::default(),
            breaker: BreakerConfig::default(),
            cache: CacheConfig::default(),
            queue: QueueConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl LobbyConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&LobbyConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path.to_path_buf()));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("LOBBY")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferConfig {
    /// How long a promoted entry holds its purchase offer.
    pub ttl_secs: u64,
    /// Fail-safe sweep cadence for offers whose timers were lost.
    pub sweep_interval_secs: u64,
}

impl Default for OfferConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 600,
            sweep_interval_secs: 60,
        }
    }
}

impl OfferConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.ttl_secs as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    /// Per-call timeout applied to every backend operation.
    pub call_timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
            call_timeout_ms: 500,
        }
    }
}

impl BreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Redis connection URL; the in-process memory backend is used when unset.
    pub redis_url: Option<String>,
    pub event_ttl_secs: u64,
    pub stale_while_revalidate_secs: u64,
    pub background_refresh: bool,
    /// Event ids whose records are pre-fetched into the cache at startup.
    pub warm_event_ids: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            event_ttl_secs: 60,
            stale_while_revalidate_secs: 300,
            background_refresh: true,
            warm_event_ids: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Worker tasks per queue.
    pub workers: usize,
    /// Submissions are refused beyond this many pending jobs.
    pub max_pending: usize,
    /// Delay before the redundant backup submission becomes runnable.
    pub backup_delay_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_pending: 10_000,
            backup_delay_ms: 5_000,
        }
    }
}

impl QueueConfig {
    pub fn backup_delay(&self) -> Duration {
        Duration::from_millis(self.backup_delay_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Memory,
    Rocksdb,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// State directory for the rocksdb backend.
    pub state_dir: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            state_dir: "/tmp/ticket-lobby".to_string(),
        }
    }
}
