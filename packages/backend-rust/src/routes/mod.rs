mod health;
mod review;
mod speaking;
mod weak_words;

use axum::body::Bytes;
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::Router;
use serde::de::DeserializeOwned;

use crate::middleware::rate_limit::api_rate_limit_middleware;
use crate::response::{json_error, AppError};
use crate::services::review_session::ReviewError;
use crate::services::speaking::SpeakingError;
use crate::services::weak_words::WeakWordError;
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    let healthcheck_endpoint = normalize_healthcheck_endpoint(
        std::env::var("HEALTHCHECK_ENDPOINT")
            .ok()
            .as_deref()
            .unwrap_or("/health"),
    );

    let mut app = Router::new()
        .nest("/api/review", review::router())
        .nest("/api/speaking", speaking::router())
        .nest("/api/weak-words", weak_words::router())
        .nest("/health", health::router());

    if healthcheck_endpoint != "/health" && healthcheck_endpoint != "/" {
        app = app.nest(healthcheck_endpoint.as_str(), health::router());
    }

    app.layer(middleware::from_fn(api_rate_limit_middleware))
        .fallback(fallback_handler)
        .with_state(state)
}

fn normalize_healthcheck_endpoint(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "/health".to_string();
    }

    let with_slash = if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    };

    if with_slash != "/" {
        with_slash.trim_end_matches('/').to_string()
    } else {
        "/".to_string()
    }
}

async fn fallback_handler() -> Response {
    json_error(StatusCode::NOT_FOUND, "NOT_FOUND", "route not found").into_response()
}

/// Decodes a JSON body, reporting malformed or mistyped input as
/// `VALIDATION_ERROR`.
fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, AppError> {
    serde_json::from_slice(body).map_err(|err| AppError::validation(format!("invalid request body: {err}")))
}

fn require_language(language_id: Option<String>) -> Result<String, AppError> {
    language_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AppError::validation("languageId is required"))
}

impl From<ReviewError> for AppError {
    fn from(err: ReviewError) -> Self {
        match err {
            ReviewError::InvalidRating(e) => AppError::bad_request(e.to_string()).with_code("INVALID_RATING"),
            ReviewError::UnknownItem(_) => AppError::bad_request(err.to_string()).with_code("UNKNOWN_ITEM"),
            ReviewError::UnsupportedMode { .. } => {
                AppError::bad_request(err.to_string()).with_code("UNSUPPORTED_MODE")
            }
            ReviewError::Validation(message) => AppError::validation(message),
            ReviewError::Store(e) => AppError::internal(e.to_string()),
        }
    }
}

impl From<SpeakingError> for AppError {
    fn from(err: SpeakingError) -> Self {
        match err {
            SpeakingError::TaskNotFound(_) => AppError::not_found(err.to_string()).with_code("TASK_NOT_FOUND"),
            SpeakingError::AttemptNotFound => AppError::not_found(err.to_string()).with_code("ATTEMPT_NOT_FOUND"),
            SpeakingError::AttemptNotActive(_) => {
                AppError::bad_request(err.to_string()).with_code("ATTEMPT_NOT_ACTIVE")
            }
            SpeakingError::UnknownItem(_) => AppError::bad_request(err.to_string()).with_code("UNKNOWN_ITEM"),
            SpeakingError::MissingAudio(_) => AppError::bad_request(err.to_string()).with_code("MISSING_AUDIO"),
            SpeakingError::Validation(message) => AppError::validation(message),
            SpeakingError::Queue(e) => {
                tracing::error!(error = %e, "scoring queue unavailable");
                AppError::unavailable("scoring queue unavailable")
            }
            SpeakingError::Store(e) => AppError::internal(e.to_string()),
        }
    }
}

impl From<WeakWordError> for AppError {
    fn from(err: WeakWordError) -> Self {
        match err {
            WeakWordError::Validation(message) => AppError::validation(message),
            WeakWordError::Store(e) => AppError::internal(e.to_string()),
        }
    }
}
