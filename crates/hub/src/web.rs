use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::db::Db;
use crate::events::{Command, DispatchEvent};
use crate::state::SharedState;

/// Sessions listed under `history` in the status response.
const HISTORY_LIMIT: i64 = 20;

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub db: Db,
    pub commands: mpsc::Sender<DispatchEvent>,
}

#[derive(Debug, Deserialize)]
struct WaterParams {
    seconds: Option<u64>,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/water", post(api_water))
        .route("/api/skip", post(api_skip))
        .route("/api/stop", post(api_stop))
        .with_state(state)
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let history = match state.db.recent_sessions(HISTORY_LIMIT).await {
        Ok(rows) => rows,
        Err(e) => {
            warn!("status: history unavailable: {e:#}");
            Vec::new()
        }
    };
    let st = state.shared.read().await;
    Json(st.to_status(history))
}

async fn api_water(
    State(state): State<AppState>,
    Query(params): Query<WaterParams>,
) -> Response {
    let duration = match params.seconds {
        None => None,
        Some(0) => {
            return (StatusCode::BAD_REQUEST, "seconds must be greater than zero").into_response()
        }
        Some(secs) => Some(Duration::from_secs(secs)),
    };
    enqueue(&state, Command::WaterNow { duration }).await
}

async fn api_skip(State(state): State<AppState>) -> Response {
    enqueue(&state, Command::SkipNext).await
}

async fn api_stop(State(state): State<AppState>) -> Response {
    enqueue(&state, Command::StopWatering).await
}

/// Commands join the same ordered queue as MQTT commands and ticks; the
/// outcome is reported through status events, not this response.
async fn enqueue(state: &AppState, command: Command) -> Response {
    state.shared.write().await.record_command("http", &command);
    match state.commands.send(DispatchEvent::Command(command)).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "dispatcher is not running").into_response(),
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("web api listening on http://{addr}");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
