use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(root))
        .route("/live", get(live))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    store: &'static str,
    database: &'static str,
    timestamp: String,
    started_at: String,
    uptime: u64,
    version: String,
}

#[derive(Serialize)]
struct LivenessResponse {
    status: &'static str,
    timestamp: String,
    uptime: u64,
}

async fn root(State(state): State<AppState>) -> Response {
    let database = match state.db_proxy() {
        None => "not_configured",
        Some(proxy) if proxy.ping().await => "connected",
        Some(_) => "disconnected",
    };
    let ok = database != "disconnected";

    let response = HealthResponse {
        status: if ok { "ok" } else { "degraded" },
        store: state.store().backend_name(),
        database,
        timestamp: now_iso(),
        started_at: DateTime::<Utc>::from(state.started_at_system())
            .to_rfc3339_opts(SecondsFormat::Millis, true),
        uptime: state.uptime_seconds(),
        version: app_version(),
    };

    let status_code = if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(response)).into_response()
}

async fn live(State(state): State<AppState>) -> Response {
    Json(LivenessResponse {
        status: "healthy",
        timestamp: now_iso(),
        uptime: state.uptime_seconds(),
    })
    .into_response()
}

fn app_version() -> String {
    std::env::var("APP_VERSION")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string())
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
