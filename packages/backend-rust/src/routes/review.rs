use axum::body::Bytes;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use serde::Deserialize;

use crate::auth::{authenticate, Capability};
use crate::response::{ok, AppError};
use crate::services::review_session::{
    self, RatingInput, SessionSubmission, SettingsUpdate,
};
use crate::state::AppState;
use crate::store::{Domain, ReviewMode};

use super::{parse_body, require_language};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/settings", get(get_settings).put(update_settings))
        .route("/sessions", post(create_session))
        .route("/sessions/:session_id/submit", post(submit_session))
        .route("/ratings", post(submit_ratings))
        .route("/stats", get(stats))
}

fn default_domain() -> Domain {
    Domain::Vocabulary
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReviewQuery {
    #[serde(default)]
    language_id: Option<String>,
    #[serde(default = "default_domain")]
    domain: Domain,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettingsBody {
    #[serde(default)]
    language_id: Option<String>,
    #[serde(flatten)]
    update: SettingsUpdate,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionRequest {
    #[serde(default)]
    language_id: Option<String>,
    #[serde(default = "default_domain")]
    domain: Domain,
    #[serde(default)]
    mode: Option<ReviewMode>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RatingsRequest {
    #[serde(default)]
    language_id: Option<String>,
    #[serde(default = "default_domain")]
    domain: Domain,
    ratings: Vec<RatingInput>,
}

fn query_or_reject(query: Result<Query<ReviewQuery>, QueryRejection>) -> Result<ReviewQuery, AppError> {
    query
        .map(|Query(q)| q)
        .map_err(|err| AppError::validation(err.body_text()))
}

async fn get_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<ReviewQuery>, QueryRejection>,
) -> Result<Response, AppError> {
    let user = authenticate(&headers, Capability::Review)?;
    let language_id = require_language(query_or_reject(query)?.language_id)?;

    let settings =
        review_session::get_or_create_settings(state.store(), &user.id, &language_id, Utc::now()).await?;
    Ok(ok(settings))
}

async fn update_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let user = authenticate(&headers, Capability::Review)?;
    let payload: SettingsBody = parse_body(&body)?;
    let language_id = require_language(payload.language_id)?;

    let settings = review_session::update_settings(
        state.store(),
        &user.id,
        &language_id,
        payload.update,
        Utc::now(),
    )
    .await?;
    Ok(ok(settings))
}

async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let user = authenticate(&headers, Capability::Review)?;
    let payload: SessionRequest = parse_body(&body)?;
    let language_id = require_language(payload.language_id)?;
    if payload.limit == Some(0) {
        return Err(AppError::validation("limit must be positive"));
    }

    let session = review_session::build_session(
        state.store(),
        &user.id,
        &language_id,
        payload.domain,
        payload.mode,
        payload.limit,
        Utc::now(),
    )
    .await?;
    Ok(ok(session))
}

async fn submit_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    body: Bytes,
) -> Result<Response, AppError> {
    let user = authenticate(&headers, Capability::Review)?;
    let submission: SessionSubmission = parse_body(&body)?;
    if submission.language_id.trim().is_empty() {
        return Err(AppError::validation("languageId is required"));
    }

    let results = review_session::submit_session(
        state.store(),
        state.queue(),
        &user.id,
        &session_id,
        submission,
        state.config().ai.default_strictness,
        Utc::now(),
    )
    .await?;
    Ok(ok(results))
}

async fn submit_ratings(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let user = authenticate(&headers, Capability::Review)?;
    let payload: RatingsRequest = parse_body(&body)?;
    let language_id = require_language(payload.language_id)?;

    let rated = review_session::submit_reviews(
        state.store(),
        &user.id,
        &language_id,
        payload.domain,
        payload.ratings,
        Utc::now(),
    )
    .await?;
    Ok(ok(rated))
}

async fn stats(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<ReviewQuery>, QueryRejection>,
) -> Result<Response, AppError> {
    let user = authenticate(&headers, Capability::Review)?;
    let query = query_or_reject(query)?;
    let language_id = require_language(query.language_id)?;

    let stats =
        review_session::stats(state.store(), &user.id, &language_id, query.domain, Utc::now()).await?;
    Ok(ok(stats))
}
