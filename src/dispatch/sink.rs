use crate::cache::CacheManager;
use crate::domain::{CacheKeys, ReservationRequest};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

/// Side effects that must run exactly once when a reservation settles,
/// regardless of which path finished it.
#[async_trait]
pub trait CompletionSink: Send + Sync {
    async fn reservation_completed(&self, request: &ReservationRequest);
}

/// Default sink: drops the event's cached record so readers see the new
/// queue state, and emits the notification hook. Notification delivery
/// itself is an external collaborator; the log line is its trigger.
pub struct ReservationCompletionSink {
    cache: CacheManager,
}

impl ReservationCompletionSink {
    pub fn new(cache: CacheManager) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl CompletionSink for ReservationCompletionSink {
    async fn reservation_completed(&self, request: &ReservationRequest) {
        self.cache
            .invalidate(&CacheKeys::event(&request.event_id))
            .await;
        info!(
            "reservation settled for user {} on event {}, notifying user",
            request.user_id, request.event_id
        );
    }
}

/// Runs completion side effects exactly once per dedupe key, no matter how
/// many paths report completion.
pub struct CompletionTracker {
    sink: Arc<dyn CompletionSink>,
    done: DashMap<String, ()>,
}

impl CompletionTracker {
    pub fn new(sink: Arc<dyn CompletionSink>) -> Self {
        Self {
            sink,
            done: DashMap::new(),
        }
    }

    pub fn is_complete(&self, dedupe_key: &str) -> bool {
        self.done.contains_key(dedupe_key)
    }

    /// First caller per key wins and runs the side effects; everyone else
    /// is a no-op. Returns whether this call ran them.
    pub async fn complete(&self, dedupe_key: &str, request: &ReservationRequest) -> bool {
        if self.done.insert(dedupe_key.to_string(), ()).is_some() {
            return false;
        }
        self.sink.reservation_completed(request).await;
        true
    }
}
