use crate::Result;
use axum::extract::State;
use axum::middleware::Next;
use axum::response::Response;
use prometheus::{
    register_counter_with_registry, register_gauge_with_registry,
    register_histogram_with_registry, Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts,
    Registry, TextEncoder,
};
use std::sync::Arc;

/// Metrics collector for the lobby system
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Waiting list metrics
    pub entries_joined: Counter,
    pub offers_extended: Counter,
    pub offers_expired: Counter,
    pub offers_released: Counter,
    pub purchases_completed: Counter,

    // Cache metrics
    pub cache_hits: Counter,
    pub cache_stale_hits: Counter,
    pub cache_misses: Counter,
    pub cache_unavailable: Counter,
    pub breaker_open: Gauge,

    // Job dispatch metrics
    pub jobs_submitted: Counter,
    pub jobs_completed: Counter,
    pub jobs_failed: Counter,
    pub jobs_deduped: Counter,
    pub queue_pending: Gauge,

    // Service metrics
    pub service_uptime: Gauge,
    pub request_duration: Histogram,
    pub error_rate: Counter,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let entries_joined = register_counter_with_registry!(
            Opts::new("entries_joined_total", "Waiting list entries created"),
            registry
        )?;

        let offers_extended = register_counter_with_registry!(
            Opts::new("offers_extended_total", "Entries promoted to a purchase offer"),
            registry
        )?;

        let offers_expired = register_counter_with_registry!(
            Opts::new("offers_expired_total", "Offers that lapsed without purchase"),
            registry
        )?;

        let offers_released = register_counter_with_registry!(
            Opts::new("offers_released_total", "Entries released by the buyer"),
            registry
        )?;

        let purchases_completed = register_counter_with_registry!(
            Opts::new("purchases_completed_total", "Offers converted into tickets"),
            registry
        )?;

        let cache_hits = register_counter_with_registry!(
            Opts::new("cache_hits_total", "Fresh cache hits"),
            registry
        )?;

        let cache_stale_hits = register_counter_with_registry!(
            Opts::new("cache_stale_hits_total", "Stale values served while revalidating"),
            registry
        )?;

        let cache_misses = register_counter_with_registry!(
            Opts::new("cache_misses_total", "Cache misses resolved by a synchronous fetch"),
            registry
        )?;

        let cache_unavailable = register_counter_with_registry!(
            Opts::new(
                "cache_unavailable_total",
                "Cache operations skipped or failed against the backend"
            ),
            registry
        )?;

        let breaker_open = register_gauge_with_registry!(
            Opts::new("breaker_open", "1 while the cache circuit breaker is open"),
            registry
        )?;

        let jobs_submitted = register_counter_with_registry!(
            Opts::new("jobs_submitted_total", "Reservation jobs accepted by a queue"),
            registry
        )?;

        let jobs_completed = register_counter_with_registry!(
            Opts::new("jobs_completed_total", "Reservation jobs completed"),
            registry
        )?;

        let jobs_failed = register_counter_with_registry!(
            Opts::new("jobs_failed_total", "Reservation jobs that failed"),
            registry
        )?;

        let jobs_deduped = register_counter_with_registry!(
            Opts::new(
                "jobs_deduped_total",
                "Jobs skipped because the other path already completed them"
            ),
            registry
        )?;

        let queue_pending = register_gauge_with_registry!(
            Opts::new("queue_pending", "Jobs waiting or running across queues"),
            registry
        )?;

        let service_uptime = register_gauge_with_registry!(
            Opts::new("service_uptime_seconds", "Service uptime in seconds"),
            registry
        )?;

        let request_duration = register_histogram_with_registry!(
            HistogramOpts::new("request_duration_seconds", "Time spent processing requests")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
            registry
        )?;

        let error_rate = register_counter_with_registry!(
            Opts::new("errors_total", "Total number of errors"),
            registry
        )?;

        Ok(Self {
            registry,
            entries_joined,
            offers_extended,
            offers_expired,
            offers_released,
            purchases_completed,
            cache_hits,
            cache_stale_hits,
            cache_misses,
            cache_unavailable,
            breaker_open,
            jobs_submitted,
            jobs_completed,
            jobs_failed,
            jobs_deduped,
            queue_pending,
            service_uptime,
            request_duration,
            error_rate,
        })
    }

    /// Export metrics in Prometheus format
    pub fn export(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    pub fn record_request(&self, duration: std::time::Duration, success: bool) {
        self.request_duration.observe(duration.as_secs_f64());
        if !success {
            self.error_rate.inc();
        }
    }

    pub fn set_breaker_open(&self, open: bool) {
        self.breaker_open.set(if open { 1.0 } else { 0.0 });
    }

    pub fn update_uptime(&self, uptime: std::time::Duration) {
        self.service_uptime.set(uptime.as_secs_f64());
    }
}

/// Request-duration middleware; attach with `middleware::from_fn_with_state`.
pub async fn track_requests(
    State(metrics): State<Arc<Metrics>>,
    req: axum::extract::Request,
    next: Next,
) -> Response {
    let start = std::time::Instant::now();
    let response = next.run(req).await;
    metrics.record_request(start.elapsed(), !response.status().is_server_error());
    response
}

/// Metrics endpoint for Prometheus scraping
pub async fn metrics_endpoint(
    State(metrics): State<Arc<Metrics>>,
) -> axum::response::Result<String> {
    match metrics.export() {
        Ok(metrics_data) => Ok(metrics_data),
        Err(e) => {
            tracing::error!("Failed to export metrics: {}", e);
            Err(axum::response::ErrorResponse::from("Failed to export metrics"))
        }
    }
}
