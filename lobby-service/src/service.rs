use std::sync::Arc;
use std::time::Instant;
use ticket_lobby::{
    CacheBackend, CacheKeys, CacheManager, CachePolicy, CompletionTracker, JobQueue,
    JobQueueShutdown, LobbyConfig, MemoryBackend, MemoryStore, Metrics, QueueKind, RedisBackend,
    ReservationCompletionSink, ReservationDispatcher, ReservationProcessor, ResilientClient,
    Result, RocksStore, ShutdownCoordinator, StoreBackend, StoreFlushShutdown, WaitlistService,
    WaitlistShutdown, WaitlistStore,
};
use tracing::info;

/// Fully wired application state shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub waitlist: Arc<WaitlistService>,
    pub dispatcher: Arc<ReservationDispatcher>,
    pub cache: CacheManager,
    pub metrics: Arc<Metrics>,
    pub event_policy: CachePolicy,
    pub started_at: Instant,
}

pub async fn build(config: LobbyConfig, coordinator: &ShutdownCoordinator) -> Result<AppState> {
    let metrics = Arc::new(Metrics::new()?);

    let store: Arc<dyn WaitlistStore> = match config.store.backend {
        StoreBackend::Memory => {
            info!("using in-memory state store");
            Arc::new(MemoryStore::new())
        }
        StoreBackend::Rocksdb => {
            info!("using rocksdb state store at {}", config.store.state_dir);
            let rocks = Arc::new(RocksStore::open(&config.store.state_dir)?);
            coordinator
                .register_component(Box::new(StoreFlushShutdown::new(rocks.clone())))
                .await;
            rocks
        }
    };

    let backend: Arc<dyn CacheBackend> = match &config.cache.redis_url {
        Some(url) => {
            info!("connecting cache backend at {}", url);
            Arc::new(RedisBackend::connect(url).await?)
        }
        None => {
            info!("using in-process cache backend");
            Arc::new(MemoryBackend::new())
        }
    };
    let client = ResilientClient::new(backend, &config.breaker, metrics.clone());
    let cache = CacheManager::new(client, metrics.clone());

    let waitlist = WaitlistService::start(store, &config, metrics.clone());
    coordinator
        .register_component(Box::new(WaitlistShutdown::new(waitlist.clone())))
        .await;

    let sink = Arc::new(ReservationCompletionSink::new(cache.clone()));
    let tracker = Arc::new(CompletionTracker::new(sink));
    let processor: Arc<dyn ReservationProcessor> = waitlist.clone();

    let primary = JobQueue::start(
        QueueKind::Primary,
        &config.queue,
        processor.clone(),
        tracker.clone(),
        metrics.clone(),
    );
    let backup = JobQueue::start(
        QueueKind::Backup,
        &config.queue,
        processor,
        tracker.clone(),
        metrics.clone(),
    );
    coordinator
        .register_component(Box::new(JobQueueShutdown::new("primary-queue", primary.clone())))
        .await;
    coordinator
        .register_component(Box::new(JobQueueShutdown::new("backup-queue", backup.clone())))
        .await;

    let dispatcher = Arc::new(ReservationDispatcher::new(
        primary,
        backup,
        &config.queue,
        tracker,
    ));

    let event_policy = CachePolicy {
        ttl_secs: config.cache.event_ttl_secs,
        stale_while_revalidate_secs: config.cache.stale_while_revalidate_secs,
        background_refresh: config.cache.background_refresh,
    };

    let state = AppState {
        waitlist,
        dispatcher,
        cache,
        metrics,
        event_policy,
        started_at: Instant::now(),
    };

    warm_up_events(&state, &config).await;
    spawn_uptime_gauge(&state, coordinator);

    Ok(state)
}

/// Pre-fetch the records of configured hot events so the first rush of
/// readers hits warm keys.
async fn warm_up_events(state: &AppState, config: &LobbyConfig) {
    for event_id in &config.cache.warm_event_ids {
        let waitlist = state.waitlist.clone();
        let id = event_id.clone();
        state
            .cache
            .warm_up(&CacheKeys::event(event_id), state.event_policy.clone(), move || {
                let waitlist = waitlist.clone();
                let id = id.clone();
                async move { waitlist.event(&id) }
            })
            .await;
    }
    if !config.cache.warm_event_ids.is_empty() {
        info!("warmed {} event cache keys", config.cache.warm_event_ids.len());
    }
}

fn spawn_uptime_gauge(state: &AppState, coordinator: &ShutdownCoordinator) {
    let metrics = state.metrics.clone();
    let started_at = state.started_at;
    let mut shutdown = coordinator.subscribe();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(10));
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tick.tick() => metrics.update_uptime(started_at.elapsed()),
            }
        }
    });
}
