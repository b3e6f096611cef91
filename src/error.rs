use thiserror::Error;

#[derive(Error, Debug)]
pub enum LobbyError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("capacity exceeded for event {event_id}: {committed} committed tickets against a total of {total}")]
    CapacityExceeded {
        event_id: String,
        committed: i64,
        total: i64,
    },

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("job failed: {0}")]
    JobFailed(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("storage error: {0}")]
    Storage(#[from] rocksdb::Error),

    #[error("cache error: {0}")]
    Cache(#[from] redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

impl LobbyError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }
}

pub type Result<T> = std::result::Result<T, LobbyError>;
