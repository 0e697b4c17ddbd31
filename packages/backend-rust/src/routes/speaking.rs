use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use serde::Deserialize;

use crate::auth::{authenticate, Capability};
use crate::response::{accepted, created, ok, AppError};
use crate::services::speaking::{self, AttemptView, SubmitAttemptRequest};
use crate::state::AppState;

use super::{parse_body, require_language};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/attempts", post(start_attempt))
        .route("/attempts/:id", get(get_attempt))
        .route("/attempts/:id/submit", post(submit_attempt))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartAttemptRequest {
    #[serde(default)]
    language_id: Option<String>,
    task_id: String,
}

async fn start_attempt(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let user = authenticate(&headers, Capability::SpeakingAttempt)?;
    let payload: StartAttemptRequest = parse_body(&body)?;
    let language_id = require_language(payload.language_id)?;

    let attempt = speaking::start_attempt(
        state.store(),
        &user.id,
        &language_id,
        payload.task_id.trim(),
        state.config().ai.default_strictness,
        Utc::now(),
    )
    .await?;
    Ok(created(AttemptView::from(&attempt)))
}

async fn submit_attempt(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(attempt_id): Path<String>,
    body: Bytes,
) -> Result<Response, AppError> {
    let user = authenticate(&headers, Capability::SpeakingAttempt)?;
    let request: SubmitAttemptRequest = parse_body(&body)?;

    let attempt = speaking::submit_attempt(
        state.store(),
        state.queue(),
        &user.id,
        &attempt_id,
        request,
        Utc::now(),
    )
    .await?;
    Ok(accepted(AttemptView::from(&attempt)))
}

async fn get_attempt(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(attempt_id): Path<String>,
) -> Result<Response, AppError> {
    let user = authenticate(&headers, Capability::SpeakingAttempt)?;
    let attempt = speaking::get_attempt(state.store(), &user.id, &attempt_id).await?;
    Ok(ok(AttemptView::from(&attempt)))
}
