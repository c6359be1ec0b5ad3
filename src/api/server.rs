use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Serialize;

use crate::annotate;
use crate::pipeline::{FeedOrchestrator, LatestFrames};
use crate::store::{CounterStore, FeedDocument, FeedId, FeedKind, FeedStatus};

#[derive(Clone)]
pub struct AppState {
    pub store: CounterStore,
    pub orchestrator: Arc<FeedOrchestrator>,
    pub frames: LatestFrames,
}

impl AppState {
    pub fn new(store: CounterStore, orchestrator: Arc<FeedOrchestrator>, frames: LatestFrames) -> Self {
        Self {
            store,
            orchestrator,
            frames,
        }
    }
}

#[derive(Serialize)]
struct FeedItem {
    id: FeedId,
    name: String,
    #[serde(rename = "type")]
    kind: FeedKind,
    status: FeedStatus,
    running: bool,
    count: i64,
    #[serde(rename = "totalSlots")]
    total_slots: u32,
    #[serde(rename = "availableSlots")]
    available_slots: u32,
}

#[derive(Serialize)]
struct SummaryResponse {
    global_car_count: i64,
    total_slots: u32,
    available_slots: u32,
    active_feeds: usize,
    degraded: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/feeds", get(feeds_handler))
        .route("/api/summary", get(summary_handler))
        .route("/api/feeds/{id}/frame", get(frame_handler))
        .with_state(state)
}

pub async fn start_server(state: AppState, port: u16) -> Result<(), std::io::Error> {
    let app = router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("starting HTTP server on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

fn snapshot(state: &AppState) -> Result<FeedDocument, Response> {
    state.store.snapshot().map_err(|e| {
        tracing::error!(error = %e, "failed to read feed document");
        (StatusCode::INTERNAL_SERVER_ERROR, "feed document unavailable").into_response()
    })
}

async fn feeds_handler(State(state): State<AppState>) -> Response {
    let document = match snapshot(&state) {
        Ok(d) => d,
        Err(resp) => return resp,
    };
    let running = state.orchestrator.active_feeds();

    let feeds: Vec<FeedItem> = document
        .feeds
        .into_iter()
        .map(|f| FeedItem {
            id: f.id,
            name: f.display_name(),
            kind: f.kind,
            status: f.status,
            running: running.iter().any(|a| a.id == f.id),
            count: f.count,
            total_slots: f.total_slots,
            available_slots: f.available_slots,
        })
        .collect();

    axum::Json(feeds).into_response()
}

async fn summary_handler(State(state): State<AppState>) -> Response {
    let document = match snapshot(&state) {
        Ok(d) => d,
        Err(resp) => return resp,
    };

    let (total_slots, available_slots) = document
        .active_feeds()
        .filter(|f| f.kind == FeedKind::Multicam)
        .fold((0u32, 0u32), |(t, a), f| {
            (t.saturating_add(f.total_slots), a.saturating_add(f.available_slots))
        });

    let response = SummaryResponse {
        global_car_count: document.global_car_count,
        total_slots,
        available_slots,
        active_feeds: state.orchestrator.active_feeds().len(),
        degraded: state.store.is_degraded(),
    };

    axum::Json(response).into_response()
}

async fn frame_handler(State(state): State<AppState>, Path(id): Path<FeedId>) -> Response {
    let Some(frame) = state.frames.get(id) else {
        return (StatusCode::NOT_FOUND, "no frame for feed").into_response();
    };

    match annotate::encode_jpeg(&frame.image) {
        Ok(jpeg) => ([(header::CONTENT_TYPE, "image/jpeg")], jpeg).into_response(),
        Err(e) => {
            tracing::error!(feed = id, error = %e, "failed to encode frame");
            (StatusCode::INTERNAL_SERVER_ERROR, "encode error").into_response()
        }
    }
}
