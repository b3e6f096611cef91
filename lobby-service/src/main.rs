use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    middleware,
    response::Json,
    routing::{get, post},
    Router,
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, path::PathBuf};
use ticket_lobby::{
    metrics_endpoint, track_requests, CacheKeys, DispatchReceipt, Event, JobStatus, LobbyConfig,
    QueueKind, QueuePosition, ReservationRequest, WaitingListEntry,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

mod service;

use service::AppState;

#[derive(Parser, Debug)]
#[command(name = "lobby-service")]
#[command(about = "Waiting list and reservation dispatch service")]
struct Args {
    /// Port to listen on
    #[arg(short = 'p', long = "port", default_value = "8080")]
    port: u16,

    /// Config file path (TOML); environment variables override it
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Override the state directory for the rocksdb store
    #[arg(long = "state-dir")]
    state_dir: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CreateEventRequest {
    event_id: Option<String>,
    name: String,
    /// Omit for an unbounded event.
    total_tickets: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct JoinRequest {
    user_id: String,
    ticket_type_id: String,
    quantity: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryRef {
    entry_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ReserveRequest {
    event_id: String,
    user_id: String,
    ticket_type_id: String,
    quantity: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct BackupReserveRequest {
    dedupe_key: String,
    event_id: String,
    user_id: String,
    ticket_type_id: String,
    quantity: u32,
}

#[derive(Debug, Deserialize)]
struct JobStatusQuery {
    id: String,
    queue: Option<String>,
}

#[derive(Debug, Serialize)]
struct AvailabilityResponse {
    event_id: String,
    name: String,
    available: ticket_lobby::Capacity,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    info!("Starting Lobby Service on port {}", args.port);

    let mut config =
        LobbyConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    if let Some(state_dir) = args.state_dir {
        config.store.state_dir = state_dir.to_string_lossy().to_string();
    }

    let coordinator = ticket_lobby::ShutdownCoordinator::with_default_timeout();
    ticket_lobby::setup_signal_handlers(coordinator.clone()).await;

    let state = service::build(config, &coordinator)
        .await
        .context("failed to wire the service")?;

    let metrics_routes = Router::new()
        .route("/metrics", get(metrics_endpoint))
        .with_state(state.metrics.clone());

    let app = Router::new()
        .route("/events", post(create_event))
        .route("/events/:event_id/availability", get(availability))
        .route("/events/:event_id/join", post(join_waitlist))
        .route("/events/:event_id/process-queue", post(process_queue))
        .route("/events/:event_id/position/:user_id", get(queue_position))
        .route("/events/:event_id/release", post(release_reservation))
        .route("/events/:event_id/purchase", post(complete_purchase))
        .route("/queue/reserve", post(reserve))
        .route("/queue/backup-reserve", post(backup_reserve))
        .route("/queue/job-status", get(job_status))
        .route("/health", get(health))
        .with_state(state.clone())
        .merge(metrics_routes)
        .layer(middleware::from_fn_with_state(
            state.metrics.clone(),
            track_requests,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    info!("Lobby Service listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let shutdown = coordinator.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.wait_for_shutdown().await })
        .await?;

    info!("Lobby Service stopped");
    Ok(())
}

async fn create_event(
    State(state): State<AppState>,
    Json(request): Json<CreateEventRequest>,
) -> Json<ApiResponse<Event>> {
    let event_id = request
        .event_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let event = Event::new(event_id, request.name, request.total_tickets);

    match state.waitlist.register_event(event) {
        Ok(event) => {
            // A replaced record must not serve stale totals.
            state.cache.invalidate(&CacheKeys::event(&event.event_id)).await;
            Json(ApiResponse::success(event))
        }
        Err(e) => {
            error!("Error registering event: {}", e);
            Json(ApiResponse::error(e.to_string()))
        }
    }
}

async fn availability(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> Json<ApiResponse<AvailabilityResponse>> {
    // The event record read goes through the cache; the capacity counts are
    // always computed fresh.
    let waitlist = state.waitlist.clone();
    let fetch_id = event_id.clone();
    let event = state
        .cache
        .get_with(
            &CacheKeys::event(&event_id),
            state.event_policy.clone(),
            move || {
                let waitlist = waitlist.clone();
                let fetch_id = fetch_id.clone();
                async move { waitlist.event(&fetch_id) }
            },
        )
        .await;

    let event = match event {
        Ok(event) => event,
        Err(e) => {
            error!("Error loading event {}: {}", event_id, e);
            return Json(ApiResponse::error(e.to_string()));
        }
    };

    match state.waitlist.available_capacity(&event_id) {
        Ok(available) => Json(ApiResponse::success(AvailabilityResponse {
            event_id,
            name: event.name,
            available,
        })),
        Err(e) => {
            error!("Error computing availability for {}: {}", event_id, e);
            Json(ApiResponse::error(e.to_string()))
        }
    }
}

async fn join_waitlist(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
    Json(request): Json<JoinRequest>,
) -> Json<ApiResponse<WaitingListEntry>> {
    match state
        .waitlist
        .join_waitlist(
            &event_id,
            &request.user_id,
            &request.ticket_type_id,
            request.quantity,
        )
        .await
    {
        Ok(entry) => Json(ApiResponse::success(entry)),
        Err(e) => {
            error!("Error joining waiting list: {}", e);
            Json(ApiResponse::error(e.to_string()))
        }
    }
}

async fn process_queue(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> Json<ApiResponse<String>> {
    match state.waitlist.process_queue(&event_id).await {
        Ok(()) => Json(ApiResponse::success("processed".to_string())),
        Err(e) => {
            error!("Error processing queue for {}: {}", event_id, e);
            Json(ApiResponse::error(e.to_string()))
        }
    }
}

async fn queue_position(
    State(state): State<AppState>,
    Path((event_id, user_id)): Path<(String, String)>,
) -> Json<ApiResponse<Option<QueuePosition>>> {
    match state.waitlist.queue_position(&event_id, &user_id) {
        Ok(position) => Json(ApiResponse::success(position)),
        Err(e) => {
            error!("Error computing queue position: {}", e);
            Json(ApiResponse::error(e.to_string()))
        }
    }
}

async fn release_reservation(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
    Json(request): Json<EntryRef>,
) -> Json<ApiResponse<WaitingListEntry>> {
    match state
        .waitlist
        .release_reservation(&event_id, &request.entry_id)
        .await
    {
        Ok(entry) => Json(ApiResponse::success(entry)),
        Err(e) => {
            error!("Error releasing reservation: {}", e);
            Json(ApiResponse::error(e.to_string()))
        }
    }
}

async fn complete_purchase(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
    Json(request): Json<EntryRef>,
) -> Json<ApiResponse<WaitingListEntry>> {
    match state
        .waitlist
        .complete_purchase(&event_id, &request.entry_id)
        .await
    {
        Ok(entry) => Json(ApiResponse::success(entry)),
        Err(e) => {
            error!("Error completing purchase: {}", e);
            Json(ApiResponse::error(e.to_string()))
        }
    }
}

async fn reserve(
    State(state): State<AppState>,
    Json(request): Json<ReserveRequest>,
) -> Json<ApiResponse<DispatchReceipt>> {
    let request = ReservationRequest {
        event_id: request.event_id,
        user_id: request.user_id,
        ticket_type_id: request.ticket_type_id,
        quantity: request.quantity,
    };

    match state.dispatcher.reserve(request) {
        Ok(receipt) => Json(ApiResponse::success(receipt)),
        Err(e) => {
            error!("Error dispatching reservation: {}", e);
            Json(ApiResponse::error(e.to_string()))
        }
    }
}

async fn backup_reserve(
    State(state): State<AppState>,
    Json(request): Json<BackupReserveRequest>,
) -> Json<ApiResponse<serde_json::Value>> {
    let payload = ReservationRequest {
        event_id: request.event_id,
        user_id: request.user_id,
        ticket_type_id: request.ticket_type_id,
        quantity: request.quantity,
    };

    match state.dispatcher.backup_reserve(payload, request.dedupe_key) {
        Ok(job_id) => Json(ApiResponse::success(serde_json::json!({ "job_id": job_id }))),
        Err(e) => {
            error!("Error dispatching backup reservation: {}", e);
            Json(ApiResponse::error(e.to_string()))
        }
    }
}

async fn job_status(
    State(state): State<AppState>,
    Query(query): Query<JobStatusQuery>,
) -> Json<ApiResponse<JobStatus>> {
    let queue = match query.queue.as_deref() {
        None | Some("primary") => QueueKind::Primary,
        Some("backup") => QueueKind::Backup,
        Some(other) => {
            return Json(ApiResponse::error(format!("unknown queue: {}", other)));
        }
    };

    match state.dispatcher.job_status(&query.id, queue).await {
        Ok(status) => Json(ApiResponse::success(status)),
        Err(e) => {
            error!("Error fetching job status: {}", e);
            Json(ApiResponse::error(e.to_string()))
        }
    }
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let cache_health = state.cache.client().health().await;
    Json(serde_json::json!({
        "status": "healthy",
        "service": "lobby-service",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "cache": cache_health,
    }))
}
