use axum::body::Bytes;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use serde::Deserialize;

use crate::auth::{authenticate, Capability};
use crate::response::{ok, AppError};
use crate::services::weak_words;
use crate::state::AppState;
use crate::store::{WordErrorSource, WordErrorType, WordFeedback};

use super::{parse_body, require_language};

const MAX_INGEST_WORDS: usize = 500;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list))
        .route("/ingest", post(ingest))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    #[serde(default)]
    language_id: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IngestRequest {
    #[serde(default)]
    language_id: Option<String>,
    #[serde(default)]
    source: Option<WordErrorSource>,
    #[serde(default)]
    error_type: Option<WordErrorType>,
    words: Vec<WordFeedback>,
}

async fn ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let user = authenticate(&headers, Capability::WeakWords)?;
    let payload: IngestRequest = parse_body(&body)?;
    let language_id = require_language(payload.language_id)?;
    if payload.words.len() > MAX_INGEST_WORDS {
        return Err(AppError::validation(format!(
            "words must contain at most {MAX_INGEST_WORDS} entries"
        )));
    }

    let summary = weak_words::ingest_word_feedback(
        state.store(),
        &user.id,
        &language_id,
        &payload.words,
        payload.source.unwrap_or(WordErrorSource::Quiz),
        payload.error_type.unwrap_or(WordErrorType::Pronunciation),
        Utc::now(),
    )
    .await?;
    Ok(ok(summary))
}

async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Response, AppError> {
    let user = authenticate(&headers, Capability::WeakWords)?;
    let Query(query) = query.map_err(|err| AppError::validation(err.body_text()))?;
    let language_id = require_language(query.language_id)?;

    let words = weak_words::list_weak_words(state.store(), &user.id, &language_id, query.limit).await?;
    Ok(ok(words))
}
