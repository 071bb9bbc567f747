use crate::engine::EngineCommand;
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use futures_util::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use statesync_core::{
    ConnectionState, DomainRecord, HealthStatus, OverallHealth, Snapshot, SourceHealth, SyncView,
};
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

const DEFAULT_ALERT_LIMIT: usize = 20;

#[derive(Deserialize)]
struct AlertQuery {
    limit: Option<usize>,
}

#[derive(Serialize)]
struct HealthResponse {
    #[serde(flatten)]
    health: OverallHealth,
    version: u64,
    uptime_secs: u64,
    polling: bool,
}

#[derive(Serialize)]
struct SnapshotResponse {
    version: u64,
    connection: ConnectionState,
    snapshot: Snapshot,
}

#[derive(Serialize)]
struct DomainResponse<'a> {
    domain: String,
    version: u64,
    fields: &'a DomainRecord,
}

#[derive(Serialize)]
struct SourcesResponse {
    running: bool,
    generation: u64,
    sources: Vec<SourceHealth>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/snapshot", get(snapshot_handler))
        .route("/snapshot/:domain", get(domain_handler))
        .route("/alerts", get(alerts_handler))
        .route("/sources", get(sources_handler))
        .route("/events", get(events_handler))
        .route("/reconnect", post(reconnect_handler))
        .route("/reset", post(reset_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let view = state.store.view();
    let health = view.health();
    let code = if health.status == HealthStatus::Fail {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (
        code,
        Json(HealthResponse {
            health,
            version: view.version,
            uptime_secs: state.uptime_secs(),
            polling: state.scheduler.is_running(),
        }),
    )
}

async fn snapshot_handler(State(state): State<AppState>) -> impl IntoResponse {
    let view = state.store.view();
    Json(SnapshotResponse {
        version: view.version,
        connection: view.connection,
        snapshot: view.snapshot.clone(),
    })
}

async fn domain_handler(
    State(state): State<AppState>,
    Path(domain): Path<String>,
) -> Response {
    let view = state.store.view();
    match view.snapshot.domain(&domain) {
        Some(fields) => Json(DomainResponse {
            domain,
            version: view.version,
            fields,
        })
        .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("Unknown domain: {}", domain) })),
        )
            .into_response(),
    }
}

async fn alerts_handler(
    State(state): State<AppState>,
    Query(params): Query<AlertQuery>,
) -> impl IntoResponse {
    let limit = params.limit.unwrap_or(DEFAULT_ALERT_LIMIT);
    Json(state.store.view().recent_alerts(limit))
}

async fn sources_handler(State(state): State<AppState>) -> impl IntoResponse {
    let view = state.store.view();
    Json(SourcesResponse {
        running: state.scheduler.is_running(),
        generation: state.scheduler.generation(),
        sources: view.sources.values().cloned().collect(),
    })
}

/// One `view` event with the current state, then one per store notification.
async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let initial = state.store.view();
    let updates = stream::unfold(state.subscribe_views(), |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(view) => return Some((view_event(&view), rx)),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("SSE client lagging, skipped {} views", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    let mut shutdown = state.shutdown.clone();
    let stopped = async move {
        while shutdown.changed().await.is_ok() {
            let stop = *shutdown.borrow();
            if stop {
                break;
            }
        }
    };

    let events = stream::once(async move { view_event(&initial) })
        .chain(updates)
        .take_until(stopped);
    Sse::new(events).keep_alive(KeepAlive::default())
}

fn view_event(view: &SyncView) -> Result<Event, axum::Error> {
    Event::default()
        .event("view")
        .id(view.version.to_string())
        .json_data(view)
}

async fn reconnect_handler(State(state): State<AppState>) -> Response {
    match state.channel.reconnect() {
        Ok(()) => {
            info!("Reconnect requested over HTTP");
            (
                StatusCode::ACCEPTED,
                Json(json!({ "connection": state.channel.state() })),
            )
                .into_response()
        }
        Err(e) => (
            StatusCode::CONFLICT,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn reset_handler(State(state): State<AppState>) -> Response {
    match state.commands.send(EngineCommand::Reset) {
        Ok(()) => {
            info!("Session reset requested over HTTP");
            (
                StatusCode::ACCEPTED,
                Json(json!({ "version": state.store.view().version })),
            )
                .into_response()
        }
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "sync engine is not running" })),
        )
            .into_response(),
    }
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}
