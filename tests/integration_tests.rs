use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use ticket_lobby::*;
use tokio::time::sleep;

fn test_metrics() -> Arc<Metrics> {
    Arc::new(Metrics::new().unwrap())
}

fn request(event_id: &str, user_id: &str) -> ReservationRequest {
    ReservationRequest {
        event_id: event_id.to_string(),
        user_id: user_id.to_string(),
        ticket_type_id: "general".to_string(),
        quantity: 1,
    }
}

// ---------------------------------------------------------------------------
// Waiting list state machine
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_two_tickets_three_users_scenario() {
    let store: Arc<dyn WaitlistStore> = Arc::new(MemoryStore::new());
    let config = LobbyConfig::default();
    let service = WaitlistService::start(store.clone(), &config, test_metrics());

    service
        .register_event(Event::new("concert", "Arena Night", Some(2)))
        .unwrap();

    let u1 = service.join_waitlist("concert", "u1", "general", 1).await.unwrap();
    let u2 = service.join_waitlist("concert", "u2", "general", 1).await.unwrap();
    let u3 = service.join_waitlist("concert", "u3", "general", 1).await.unwrap();

    assert_eq!(u1.status, EntryStatus::Offered);
    assert_eq!(u2.status, EntryStatus::Offered);
    assert_eq!(u3.status, EntryStatus::Waiting);
    assert!(u1.offer_expires_at.is_some());
    assert!(u3.offer_expires_at.is_none());

    let position = service.queue_position("concert", "u3").unwrap().unwrap();
    assert_eq!(position.position, 1);
    assert_eq!(position.entry.entry_id, u3.entry_id);

    assert_eq!(
        service.available_capacity("concert").unwrap(),
        Capacity::Bounded(0)
    );

    // U1 walks away; the freed capacity must cascade to U3.
    service
        .release_reservation("concert", &u1.entry_id)
        .await
        .unwrap();

    let u1_after = store.entry("concert", &u1.entry_id).unwrap().unwrap();
    let u3_after = store.entry("concert", &u3.entry_id).unwrap().unwrap();
    assert_eq!(u1_after.status, EntryStatus::Expired);
    assert_eq!(u3_after.status, EntryStatus::Offered);

    service.stop();
}

#[tokio::test]
async fn test_fifo_promotion_order() {
    let store: Arc<dyn WaitlistStore> = Arc::new(MemoryStore::new());
    let config = LobbyConfig::default();
    let service = WaitlistService::start(store.clone(), &config, test_metrics());

    // No capacity yet: everyone queues up.
    service
        .register_event(Event::new("drop", "Limited Drop", Some(0)))
        .unwrap();

    let first = service.join_waitlist("drop", "first", "general", 1).await.unwrap();
    let second = service.join_waitlist("drop", "second", "general", 1).await.unwrap();
    let third = service.join_waitlist("drop", "third", "general", 1).await.unwrap();
    assert_eq!(first.status, EntryStatus::Waiting);

    // Capacity appears; promotion must follow arrival order.
    service
        .register_event(Event::new("drop", "Limited Drop", Some(2)))
        .unwrap();
    service.process_queue("drop").await.unwrap();

    let statuses: Vec<EntryStatus> = [&first, &second, &third]
        .iter()
        .map(|e| store.entry("drop", &e.entry_id).unwrap().unwrap().status)
        .collect();
    assert_eq!(
        statuses,
        vec![EntryStatus::Offered, EntryStatus::Offered, EntryStatus::Waiting]
    );

    service.stop();
}

#[tokio::test]
async fn test_offer_expiry_cascades_to_next_waiting_entry() {
    let store: Arc<dyn WaitlistStore> = Arc::new(MemoryStore::new());
    let mut config = LobbyConfig::default();
    config.offer.ttl_secs = 1;
    let service = WaitlistService::start(store.clone(), &config, test_metrics());

    service
        .register_event(Event::new("gig", "Small Gig", Some(1)))
        .unwrap();

    let u1 = service.join_waitlist("gig", "u1", "general", 1).await.unwrap();
    let u2 = service.join_waitlist("gig", "u2", "general", 1).await.unwrap();
    assert_eq!(u1.status, EntryStatus::Offered);
    assert_eq!(u2.status, EntryStatus::Waiting);

    // Let the armed timer fire and the cascade run.
    sleep(Duration::from_millis(1700)).await;

    let u1_after = store.entry("gig", &u1.entry_id).unwrap().unwrap();
    let u2_after = store.entry("gig", &u2.entry_id).unwrap().unwrap();
    assert_eq!(u1_after.status, EntryStatus::Expired);
    assert_eq!(u1_after.offer_expires_at, None);
    assert_eq!(u2_after.status, EntryStatus::Offered);

    service.stop();
}

#[tokio::test]
async fn test_duplicate_join_returns_existing_entry() {
    let store: Arc<dyn WaitlistStore> = Arc::new(MemoryStore::new());
    let config = LobbyConfig::default();
    let service = WaitlistService::start(store, &config, test_metrics());

    service
        .register_event(Event::new("show", "Show", Some(10)))
        .unwrap();

    let first = service.join_waitlist("show", "u1", "general", 2).await.unwrap();
    let second = service.join_waitlist("show", "u1", "general", 4).await.unwrap();
    assert_eq!(first.entry_id, second.entry_id);
    // The original request is preserved, not overwritten.
    assert_eq!(second.quantity, 2);

    service.stop();
}

#[tokio::test]
async fn test_purchase_converts_offer_into_committed_tickets() {
    let store: Arc<dyn WaitlistStore> = Arc::new(MemoryStore::new());
    let config = LobbyConfig::default();
    let service = WaitlistService::start(store.clone(), &config, test_metrics());

    service
        .register_event(Event::new("fest", "Festival", Some(2)))
        .unwrap();

    let entry = service.join_waitlist("fest", "u1", "general", 2).await.unwrap();
    assert_eq!(entry.status, EntryStatus::Offered);

    let purchased = service.complete_purchase("fest", &entry.entry_id).await.unwrap();
    assert_eq!(purchased.status, EntryStatus::Purchased);
    assert_eq!(store.committed_ticket_count("fest").unwrap(), 2);
    assert_eq!(store.active_offer_quantity("fest", Utc::now()).unwrap(), 0);
    assert_eq!(
        service.available_capacity("fest").unwrap(),
        Capacity::Bounded(0)
    );

    // A settled entry cannot be purchased twice.
    let err = service.complete_purchase("fest", &entry.entry_id).await;
    assert!(matches!(err, Err(LobbyError::InvalidArgument(_))));

    service.stop();
}

#[tokio::test]
async fn test_lapsed_offer_is_not_counted_as_active() {
    let store = MemoryStore::new();
    store.put_event(Event::new("ev", "Event", Some(5))).unwrap();

    let mut lapsed = WaitingListEntry::new("ev", "u1", "general", 3);
    lapsed.status = EntryStatus::Offered;
    lapsed.offer_expires_at = Some(Utc::now() - chrono::Duration::seconds(30));
    store.insert_entry(lapsed).unwrap();

    let accountant = CapacityAccountant::new(Arc::new(store));
    assert_eq!(
        accountant.available_capacity("ev").unwrap(),
        Capacity::Bounded(5)
    );
}

#[tokio::test]
async fn test_capacity_accountant_flags_oversold_event() {
    let store = MemoryStore::new();
    store.put_event(Event::new("ev", "Event", Some(1))).unwrap();
    store.put_ticket(Ticket::issue("ev", "general")).unwrap();
    store.put_ticket(Ticket::issue("ev", "general")).unwrap();

    let accountant = CapacityAccountant::new(Arc::new(store));
    let err = accountant.available_capacity("ev");
    assert!(matches!(err, Err(LobbyError::CapacityExceeded { .. })));

    let missing = accountant.available_capacity("nope");
    assert!(matches!(missing, Err(LobbyError::NotFound(_))));
}

#[tokio::test]
async fn test_unbounded_event_promotes_every_waiting_entry() {
    let store: Arc<dyn WaitlistStore> = Arc::new(MemoryStore::new());
    let config = LobbyConfig::default();
    let service = WaitlistService::start(store.clone(), &config, test_metrics());

    service
        .register_event(Event::new("stream", "Livestream", None))
        .unwrap();
    assert_eq!(
        service.available_capacity("stream").unwrap(),
        Capacity::Unbounded
    );

    for user in ["u1", "u2", "u3", "u4", "u5"] {
        let entry = service.join_waitlist("stream", user, "general", 2).await.unwrap();
        assert_eq!(entry.status, EntryStatus::Offered);
    }

    service.stop();
}

#[tokio::test]
async fn test_sweep_settles_offers_with_lost_timers() {
    let store: Arc<dyn WaitlistStore> = Arc::new(MemoryStore::new());
    let config = LobbyConfig::default();
    let metrics = test_metrics();

    store.put_event(Event::new("ev", "Event", Some(1))).unwrap();

    // An overdue offer whose timer died with a previous process.
    let mut orphaned = WaitingListEntry::new("ev", "u1", "general", 1);
    orphaned.status = EntryStatus::Offered;
    orphaned.offer_expires_at = Some(Utc::now() - chrono::Duration::seconds(120));
    store.insert_entry(orphaned.clone()).unwrap();

    let waiting = WaitingListEntry::new("ev", "u2", "general", 1);
    store.insert_entry(waiting.clone()).unwrap();

    let (expiry_tx, _expiry_rx) = tokio::sync::mpsc::unbounded_channel();
    let scheduler = Arc::new(OfferScheduler::new(
        store.clone(),
        &config.offer,
        expiry_tx,
        metrics.clone(),
    ));
    let handler = ExpiryHandler::new(
        store.clone(),
        scheduler,
        Duration::from_secs(60),
        metrics,
    );

    let settled = handler.cleanup_expired_offers().await.unwrap();
    assert_eq!(settled, 1);

    let orphaned_after = store.entry("ev", &orphaned.entry_id).unwrap().unwrap();
    let waiting_after = store.entry("ev", &waiting.entry_id).unwrap().unwrap();
    assert_eq!(orphaned_after.status, EntryStatus::Expired);
    assert_eq!(waiting_after.status, EntryStatus::Offered);

    // Re-sweeping is a no-op.
    assert_eq!(handler.cleanup_expired_offers().await.unwrap(), 0);
}

#[tokio::test]
async fn test_concurrent_process_queue_never_oversells() {
    let store: Arc<dyn WaitlistStore> = Arc::new(MemoryStore::new());
    let config = LobbyConfig::default();
    let service = WaitlistService::start(store.clone(), &config, test_metrics());

    store.put_event(Event::new("rush", "Rush Sale", Some(3))).unwrap();
    for i in 0..6 {
        store
            .insert_entry(WaitingListEntry::new("rush", format!("u{}", i), "general", 1))
            .unwrap();
        // Distinct creation instants keep the expected order unambiguous.
        sleep(Duration::from_millis(2)).await;
    }

    let (a, b, c) = tokio::join!(
        service.process_queue("rush"),
        service.process_queue("rush"),
        service.process_queue("rush"),
    );
    a.unwrap();
    b.unwrap();
    c.unwrap();

    let offered: i64 = store
        .entries_for_event("rush")
        .unwrap()
        .iter()
        .filter(|e| e.status == EntryStatus::Offered)
        .map(|e| e.quantity as i64)
        .sum();
    assert_eq!(offered, 3);
    assert_eq!(
        service.available_capacity("rush").unwrap(),
        Capacity::Bounded(0)
    );

    service.stop();
}

#[tokio::test]
async fn test_quantity_larger_than_remaining_blocks_queue() {
    let store: Arc<dyn WaitlistStore> = Arc::new(MemoryStore::new());
    let config = LobbyConfig::default();
    let service = WaitlistService::start(store.clone(), &config, test_metrics());

    service
        .register_event(Event::new("ev", "Event", Some(3)))
        .unwrap();

    let big = service.join_waitlist("ev", "u1", "general", 2).await.unwrap();
    assert_eq!(big.status, EntryStatus::Offered);

    // Two remaining tickets cannot satisfy a request for three; the smaller
    // request behind it must not jump the line either.
    let blocked = service.join_waitlist("ev", "u2", "general", 3).await.unwrap();
    let small = service.join_waitlist("ev", "u3", "general", 1).await.unwrap();
    assert_eq!(blocked.status, EntryStatus::Waiting);
    assert_eq!(small.status, EntryStatus::Waiting);

    // u1 (offered) is still ahead of u2 in the queue ordering.
    let blocked_position = service.queue_position("ev", "u2").unwrap().unwrap();
    assert_eq!(blocked_position.position, 2);
    let small_position = service.queue_position("ev", "u3").unwrap().unwrap();
    assert_eq!(small_position.position, 3);

    service.stop();
}

// ---------------------------------------------------------------------------
// Circuit breaker and resilient client
// ---------------------------------------------------------------------------

struct FlakyBackend {
    healthy: AtomicBool,
    calls: AtomicUsize,
    data: dashmap::DashMap<String, String>,
}

impl FlakyBackend {
    fn new(healthy: bool) -> Self {
        Self {
            healthy: AtomicBool::new(healthy),
            calls: AtomicUsize::new(0),
            data: dashmap::DashMap::new(),
        }
    }

    fn check(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LobbyError::BackendUnavailable("injected failure".to_string()))
        }
    }
}

#[async_trait]
impl CacheBackend for FlakyBackend {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        Ok(self.data.get(key).map(|v| v.clone()))
    }

    async fn set(&self, key: &str, value: &str, _ttl: Option<Duration>) -> Result<()> {
        self.check()?;
        self.data.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check()?;
        self.data.remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.check()
    }
}

struct SlowBackend;

#[async_trait]
impl CacheBackend for SlowBackend {
    fn name(&self) -> &'static str {
        "slow"
    }

    async fn get(&self, _key: &str) -> Result<Option<String>> {
        sleep(Duration::from_millis(500)).await;
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> Result<()> {
        sleep(Duration::from_millis(500)).await;
        Ok(())
    }

    async fn delete(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

fn breaker_config() -> BreakerConfig {
    BreakerConfig {
        failure_threshold: 3,
        reset_timeout_ms: 100,
        call_timeout_ms: 200,
    }
}

#[tokio::test]
async fn test_breaker_opens_and_short_circuits() {
    let backend = Arc::new(FlakyBackend::new(false));
    let client = ResilientClient::new(backend.clone(), &breaker_config(), test_metrics());

    for _ in 0..3 {
        assert_eq!(client.get("k").await, CacheReply::Unavailable);
    }
    assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    assert!(client.breaker_snapshot().is_open);

    // Open breaker: no backend attempt.
    assert_eq!(client.get("k").await, CacheReply::Unavailable);
    assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_breaker_recovers_through_trial_call() {
    let backend = Arc::new(FlakyBackend::new(false));
    let client = ResilientClient::new(backend.clone(), &breaker_config(), test_metrics());

    for _ in 0..3 {
        client.get("k").await;
    }
    assert!(client.breaker_snapshot().is_open);

    sleep(Duration::from_millis(150)).await;
    backend.healthy.store(true, Ordering::SeqCst);

    // The reset timeout elapsed: exactly one trial goes through and closes
    // the breaker.
    assert_eq!(client.get("k").await, CacheReply::Missing);
    assert_eq!(backend.calls.load(Ordering::SeqCst), 4);
    let snapshot = client.breaker_snapshot();
    assert!(!snapshot.is_open);
    assert_eq!(snapshot.failure_count, 0);

    assert_eq!(client.set("k", "v", None).await, CacheWrite::Done);
    assert_eq!(client.get("k").await, CacheReply::Value("v".to_string()));
}

#[tokio::test]
async fn test_breaker_failed_trial_reopens() {
    let backend = Arc::new(FlakyBackend::new(false));
    let client = ResilientClient::new(backend.clone(), &breaker_config(), test_metrics());

    for _ in 0..3 {
        client.get("k").await;
    }
    sleep(Duration::from_millis(150)).await;

    // Trial fails: breaker re-opens and the next call short-circuits.
    assert_eq!(client.get("k").await, CacheReply::Unavailable);
    assert_eq!(backend.calls.load(Ordering::SeqCst), 4);
    assert_eq!(client.get("k").await, CacheReply::Unavailable);
    assert_eq!(backend.calls.load(Ordering::SeqCst), 4);
    assert!(client.breaker_snapshot().is_open);
}

#[tokio::test]
async fn test_call_timeout_counts_as_breaker_failure() {
    let config = BreakerConfig {
        failure_threshold: 3,
        reset_timeout_ms: 1000,
        call_timeout_ms: 50,
    };
    let client = ResilientClient::new(Arc::new(SlowBackend), &config, test_metrics());

    // Times out, but does not error.
    assert_eq!(client.get("k").await, CacheReply::Unavailable);
    assert_eq!(client.breaker_snapshot().failure_count, 1);
}

// ---------------------------------------------------------------------------
// Layered cache manager
// ---------------------------------------------------------------------------

fn cache_policy() -> CachePolicy {
    CachePolicy {
        ttl_secs: 60,
        stale_while_revalidate_secs: 300,
        background_refresh: true,
    }
}

fn seed_envelope(age_secs: i64, value: &str) -> String {
    serde_json::to_string(&CachedValue {
        value: serde_json::json!(value),
        written_at: Utc::now() - chrono::Duration::seconds(age_secs),
        ttl_seconds: 60,
        compressed: false,
    })
    .unwrap()
}

struct CountingFetcher {
    count: Arc<AtomicUsize>,
    value: String,
    delay: Duration,
}

impl CountingFetcher {
    fn new(value: &str) -> Self {
        Self {
            count: Arc::new(AtomicUsize::new(0)),
            value: value.to_string(),
            delay: Duration::ZERO,
        }
    }

    fn with_delay(value: &str, delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new(value)
        }
    }

    fn fetch(&self) -> impl Fn() -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<String>> + Send>> + Send + Sync + 'static {
        let count = self.count.clone();
        let value = self.value.clone();
        let delay = self.delay;
        move || {
            let count = count.clone();
            let value = value.clone();
            Box::pin(async move {
                if delay > Duration::ZERO {
                    sleep(delay).await;
                }
                count.fetch_add(1, Ordering::SeqCst);
                Ok(value)
            })
        }
    }
}

#[tokio::test]
async fn test_cache_fresh_hit_skips_fetch() {
    let backend = Arc::new(FlakyBackend::new(true));
    let client = ResilientClient::new(backend.clone(), &breaker_config(), test_metrics());
    let manager = CacheManager::new(client, test_metrics());

    backend.data.insert("k".to_string(), seed_envelope(10, "cached"));

    let fetcher = CountingFetcher::new("fetched");
    let value: String = manager.get_with("k", cache_policy(), fetcher.fetch()).await.unwrap();
    assert_eq!(value, "cached");
    assert_eq!(fetcher.count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cache_stale_hit_serves_stale_and_refreshes_once() {
    let backend = Arc::new(FlakyBackend::new(true));
    let client = ResilientClient::new(backend.clone(), &breaker_config(), test_metrics());
    let manager = CacheManager::new(client, test_metrics());

    // Age 120s: past the 60s ttl, inside the 300s stale window.
    backend.data.insert("k".to_string(), seed_envelope(120, "stale"));

    // The refresh is slow enough that both reads see the stale value.
    let fetcher = CountingFetcher::with_delay("fresh", Duration::from_millis(100));
    let first: String = manager.get_with("k", cache_policy(), fetcher.fetch()).await.unwrap();
    let second: String = manager.get_with("k", cache_policy(), fetcher.fetch()).await.unwrap();
    assert_eq!(first, "stale");
    assert_eq!(second, "stale");

    sleep(Duration::from_millis(300)).await;
    // Two stale reads, exactly one background refetch.
    assert_eq!(fetcher.count.load(Ordering::SeqCst), 1);

    let after: String = manager.get_with("k", cache_policy(), fetcher.fetch()).await.unwrap();
    assert_eq!(after, "fresh");
}

#[tokio::test]
async fn test_cache_beyond_stale_window_fetches_synchronously() {
    let backend = Arc::new(FlakyBackend::new(true));
    let client = ResilientClient::new(backend.clone(), &breaker_config(), test_metrics());
    let manager = CacheManager::new(client, test_metrics());

    // Age 400s: past ttl + stale window.
    backend.data.insert("k".to_string(), seed_envelope(400, "ancient"));

    let fetcher = CountingFetcher::new("fresh");
    let value: String = manager.get_with("k", cache_policy(), fetcher.fetch()).await.unwrap();
    assert_eq!(value, "fresh");
    assert_eq!(fetcher.count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cache_miss_populates_backend() {
    let backend = Arc::new(FlakyBackend::new(true));
    let client = ResilientClient::new(backend.clone(), &breaker_config(), test_metrics());
    let manager = CacheManager::new(client, test_metrics());

    let fetcher = CountingFetcher::new("fetched");
    let value: String = manager.get_with("k", cache_policy(), fetcher.fetch()).await.unwrap();
    assert_eq!(value, "fetched");
    assert_eq!(fetcher.count.load(Ordering::SeqCst), 1);

    sleep(Duration::from_millis(100)).await;
    let raw = backend.data.get("k").map(|v| v.clone()).unwrap();
    let envelope: CachedValue = serde_json::from_str(&raw).unwrap();
    assert_eq!(envelope.value, serde_json::json!("fetched"));
    assert!(!envelope.compressed);
}

#[tokio::test]
async fn test_cache_unavailable_backend_falls_back_to_fetch() {
    let backend = Arc::new(FlakyBackend::new(false));
    let client = ResilientClient::new(backend.clone(), &breaker_config(), test_metrics());
    let manager = CacheManager::new(client, test_metrics());

    let fetcher = CountingFetcher::new("direct");
    let value: String = manager.get_with("k", cache_policy(), fetcher.fetch()).await.unwrap();
    assert_eq!(value, "direct");
    assert_eq!(fetcher.count.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// Dual-path job dispatch
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CountingProcessor {
    runs: AtomicUsize,
}

#[async_trait]
impl ReservationProcessor for CountingProcessor {
    async fn process(&self, request: &ReservationRequest) -> Result<serde_json::Value> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(serde_json::json!({ "user_id": request.user_id }))
    }
}

struct HangingProcessor;

#[async_trait]
impl ReservationProcessor for HangingProcessor {
    async fn process(&self, _request: &ReservationRequest) -> Result<serde_json::Value> {
        std::future::pending::<()>().await;
        unreachable!()
    }
}

#[derive(Default)]
struct CountingSink {
    completions: AtomicUsize,
}

#[async_trait]
impl CompletionSink for CountingSink {
    async fn reservation_completed(&self, _request: &ReservationRequest) {
        self.completions.fetch_add(1, Ordering::SeqCst);
    }
}

fn queue_config(backup_delay_ms: u64) -> QueueConfig {
    QueueConfig {
        workers: 1,
        max_pending: 100,
        backup_delay_ms,
    }
}

#[tokio::test]
async fn test_dual_path_primary_completes_and_backup_dedupes() {
    let processor = Arc::new(CountingProcessor::default());
    let sink = Arc::new(CountingSink::default());
    let tracker = Arc::new(CompletionTracker::new(sink.clone()));
    let metrics = test_metrics();
    let config = queue_config(50);

    let primary = JobQueue::start(
        QueueKind::Primary,
        &config,
        processor.clone(),
        tracker.clone(),
        metrics.clone(),
    );
    let backup = JobQueue::start(
        QueueKind::Backup,
        &config,
        processor.clone(),
        tracker.clone(),
        metrics,
    );
    let dispatcher = ReservationDispatcher::new(primary, backup, &config, tracker);

    let receipt = dispatcher.reserve(request("ev", "u1")).unwrap();
    assert_eq!(receipt.processing_path, ProcessingPath::Both);
    let primary_id = receipt.primary_job_id.clone().unwrap();
    let backup_id = receipt.backup_job_id.clone().unwrap();

    sleep(Duration::from_millis(200)).await;

    let primary_status = dispatcher.job_status(&primary_id, QueueKind::Primary).await.unwrap();
    assert_eq!(
        primary_status.state,
        JobState::Completed {
            via: ProcessingPath::Primary
        }
    );

    let backup_status = dispatcher.job_status(&backup_id, QueueKind::Backup).await.unwrap();
    assert_eq!(backup_status.state, JobState::Deduped);

    // The reservation ran once and its side effects ran once.
    assert_eq!(processor.runs.load(Ordering::SeqCst), 1);
    assert_eq!(sink.completions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_backup_completion_is_folded_into_primary_status() {
    let sink = Arc::new(CountingSink::default());
    let tracker = Arc::new(CompletionTracker::new(sink.clone()));
    let metrics = test_metrics();
    let config = queue_config(10);

    // The primary path is wedged; only the backup makes progress.
    let primary = JobQueue::start(
        QueueKind::Primary,
        &config,
        Arc::new(HangingProcessor),
        tracker.clone(),
        metrics.clone(),
    );
    let backup_processor = Arc::new(CountingProcessor::default());
    let backup = JobQueue::start(
        QueueKind::Backup,
        &config,
        backup_processor.clone(),
        tracker.clone(),
        metrics,
    );
    let dispatcher = ReservationDispatcher::new(primary, backup, &config, tracker);

    let receipt = dispatcher.reserve(request("ev", "u1")).unwrap();
    let primary_id = receipt.primary_job_id.clone().unwrap();

    sleep(Duration::from_millis(150)).await;

    let status = dispatcher.job_status(&primary_id, QueueKind::Primary).await.unwrap();
    assert_eq!(
        status.state,
        JobState::Completed {
            via: ProcessingPath::Backup
        }
    );
    assert_eq!(sink.completions.load(Ordering::SeqCst), 1);

    // Polling again must not re-run the side effects.
    let again = dispatcher.job_status(&primary_id, QueueKind::Primary).await.unwrap();
    assert_eq!(
        again.state,
        JobState::Completed {
            via: ProcessingPath::Backup
        }
    );
    assert_eq!(sink.completions.load(Ordering::SeqCst), 1);
    assert_eq!(backup_processor.runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_primary_refusal_degrades_to_backup_path() {
    let processor = Arc::new(CountingProcessor::default());
    let sink = Arc::new(CountingSink::default());
    let tracker = Arc::new(CompletionTracker::new(sink));
    let metrics = test_metrics();
    let config = queue_config(10);

    let primary = JobQueue::start(
        QueueKind::Primary,
        &config,
        processor.clone(),
        tracker.clone(),
        metrics.clone(),
    );
    let backup = JobQueue::start(
        QueueKind::Backup,
        &config,
        processor.clone(),
        tracker.clone(),
        metrics,
    );
    primary.close();

    let dispatcher = ReservationDispatcher::new(primary, backup, &config, tracker);
    let receipt = dispatcher.reserve(request("ev", "u1")).unwrap();
    assert_eq!(receipt.processing_path, ProcessingPath::Backup);
    assert!(receipt.primary_job_id.is_none());
    let backup_id = receipt.backup_job_id.unwrap();

    sleep(Duration::from_millis(100)).await;
    let status = dispatcher.job_status(&backup_id, QueueKind::Backup).await.unwrap();
    assert_eq!(
        status.state,
        JobState::Completed {
            via: ProcessingPath::Backup
        }
    );
}

#[tokio::test]
async fn test_both_paths_refusing_fails_the_dispatch() {
    let processor = Arc::new(CountingProcessor::default());
    let sink = Arc::new(CountingSink::default());
    let tracker = Arc::new(CompletionTracker::new(sink));
    let metrics = test_metrics();
    let config = queue_config(10);

    let primary = JobQueue::start(
        QueueKind::Primary,
        &config,
        processor.clone(),
        tracker.clone(),
        metrics.clone(),
    );
    let backup = JobQueue::start(
        QueueKind::Backup,
        &config,
        processor,
        tracker.clone(),
        metrics,
    );
    let dispatcher = ReservationDispatcher::new(primary, backup, &config, tracker);
    dispatcher.close();

    let err = dispatcher.reserve(request("ev", "u1"));
    assert!(matches!(err, Err(LobbyError::JobFailed(_))));
}

#[tokio::test]
async fn test_backup_reserve_honors_external_dedupe_key() {
    let processor = Arc::new(CountingProcessor::default());
    let sink = Arc::new(CountingSink::default());
    let tracker = Arc::new(CompletionTracker::new(sink.clone()));
    let metrics = test_metrics();
    let config = queue_config(10);

    let primary = JobQueue::start(
        QueueKind::Primary,
        &config,
        processor.clone(),
        tracker.clone(),
        metrics.clone(),
    );
    let backup = JobQueue::start(
        QueueKind::Backup,
        &config,
        processor.clone(),
        tracker.clone(),
        metrics,
    );
    let dispatcher = ReservationDispatcher::new(primary, backup, &config, tracker.clone());

    // The key was already settled elsewhere: the backup job must dedupe.
    tracker.complete("settled-key", &request("ev", "u1")).await;
    let job_id = dispatcher
        .backup_reserve(request("ev", "u1"), "settled-key".to_string())
        .unwrap();

    sleep(Duration::from_millis(100)).await;
    let status = dispatcher.job_status(&job_id, QueueKind::Backup).await.unwrap();
    assert_eq!(status.state, JobState::Deduped);
    assert_eq!(processor.runs.load(Ordering::SeqCst), 0);
    assert_eq!(sink.completions.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// Stores, config, retry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_rocks_store_round_trip_and_transitions() {
    let dir = tempdir().unwrap();
    let store = RocksStore::open(dir.path().join("state")).unwrap();

    store.put_event(Event::new("ev", "Event", Some(10))).unwrap();
    assert_eq!(store.event("ev").unwrap().unwrap().total_tickets, Some(10));

    let entry = WaitingListEntry::new("ev", "u1", "general", 2);
    store.insert_entry(entry.clone()).unwrap();
    let later = WaitingListEntry::new("ev", "u2", "general", 1);
    store.insert_entry(later.clone()).unwrap();

    let entries = store.entries_for_event("ev").unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].entry_id, entry.entry_id);

    let expires = Utc::now() + chrono::Duration::minutes(10);
    assert!(store
        .transition_entry("ev", &entry.entry_id, EntryStatus::Waiting, EntryStatus::Offered, Some(expires))
        .unwrap());
    // A lost race is a no-op, not an error.
    assert!(!store
        .transition_entry("ev", &entry.entry_id, EntryStatus::Waiting, EntryStatus::Offered, Some(expires))
        .unwrap());

    assert_eq!(store.active_offer_quantity("ev", Utc::now()).unwrap(), 2);
    assert_eq!(
        store
            .active_entry_for_user("ev", "u1")
            .unwrap()
            .unwrap()
            .entry_id,
        entry.entry_id
    );

    store.put_ticket(Ticket::issue("ev", "general")).unwrap();
    let mut refunded = Ticket::issue("ev", "general");
    refunded.status = TicketStatus::Refunded;
    store.put_ticket(refunded).unwrap();
    assert_eq!(store.committed_ticket_count("ev").unwrap(), 1);

    let missing = store.transition_entry("ev", "nope", EntryStatus::Waiting, EntryStatus::Offered, None);
    assert!(matches!(missing, Err(LobbyError::NotFound(_))));
}

#[tokio::test]
async fn test_rocks_store_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state");

    let entry_id = {
        let store = RocksStore::open(&path).unwrap();
        store.put_event(Event::new("ev", "Event", Some(1))).unwrap();
        let mut entry = WaitingListEntry::new("ev", "u1", "general", 1);
        entry.status = EntryStatus::Offered;
        entry.offer_expires_at = Some(Utc::now() - chrono::Duration::seconds(5));
        store.insert_entry(entry.clone()).unwrap();
        store.flush().unwrap();
        entry.entry_id
    };

    // A new process finds the overdue offer through the sweep query.
    let store = RocksStore::open(&path).unwrap();
    let overdue = store.overdue_offers(Utc::now()).unwrap();
    assert_eq!(overdue.len(), 1);
    assert_eq!(overdue[0].entry_id, entry_id);
}

#[test]
fn test_config_defaults_and_file_overrides() {
    let defaults = LobbyConfig::default();
    assert_eq!(defaults.offer.ttl_secs, 600);
    assert_eq!(defaults.breaker.failure_threshold, 5);
    assert_eq!(defaults.store.backend, StoreBackend::Memory);

    let dir = tempdir().unwrap();
    let path = dir.path().join("lobby.toml");
    std::fs::write(
        &path,
        r#"
[offer]
ttl_secs = 120

[breaker]
failure_threshold = 7
reset_timeout_ms = 1000

[cache]
event_ttl_secs = 10
warm_event_ids = ["main-arena"]

[store]
backend = "rocksdb"
state_dir = "/var/lib/lobby"
"#,
    )
    .unwrap();

    let config = LobbyConfig::load(Some(path.as_path())).unwrap();
    assert_eq!(config.offer.ttl_secs, 120);
    // Untouched keys keep their defaults.
    assert_eq!(config.offer.sweep_interval_secs, 60);
    assert_eq!(config.breaker.failure_threshold, 7);
    assert_eq!(config.breaker.reset_timeout_ms, 1000);
    assert_eq!(config.cache.event_ttl_secs, 10);
    assert_eq!(config.cache.warm_event_ids, vec!["main-arena".to_string()]);
    assert_eq!(config.store.backend, StoreBackend::Rocksdb);
    assert_eq!(config.store.state_dir, "/var/lib/lobby");
}

#[tokio::test]
async fn test_retry_recovers_after_transient_failures() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let config = RetryConfig {
        max_attempts: 4,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        backoff_multiplier: 2.0,
        jitter: false,
    };

    let counter = attempts.clone();
    let value = retry_with_backoff(&config, "flaky-op", || {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(LobbyError::BackendUnavailable("transient".to_string()))
            } else {
                Ok(42)
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(value, 42);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}
