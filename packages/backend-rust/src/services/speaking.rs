use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::core::{AiJob, AiJobItem, CoordinationError, JobQueue};
use crate::store::{
    AiResult, AttemptCompletion, AttemptError, AttemptOrigin, AttemptStatus, ReviewStore,
    SpeakingAttempt, SpeakingAttemptItem, SpeakingTaskType, StoreError,
};

pub const DEFAULT_AUDIO_MIME: &str = "audio/wav";
const MAX_STRICTNESS: u8 = 100;

#[derive(Debug, Error)]
pub enum SpeakingError {
    #[error("speaking task not found: {0}")]
    TaskNotFound(String),
    #[error("attempt not found")]
    AttemptNotFound,
    #[error("attempt is {0}, expected STARTED")]
    AttemptNotActive(&'static str),
    #[error("unknown attempt item: {0}")]
    UnknownItem(String),
    #[error("missing audio for item {0}")]
    MissingAudio(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("scoring queue unavailable: {0}")]
    Queue(#[from] CoordinationError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmittedAudio {
    pub item_id: String,
    #[serde(default)]
    pub audio_base64: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitAttemptRequest {
    pub items: Vec<SubmittedAudio>,
    #[serde(default)]
    pub strictness: Option<u8>,
    #[serde(default)]
    pub duration_sec: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptItemView {
    pub id: String,
    pub prompt_text: Option<String>,
    pub reference_text: Option<String>,
    pub has_audio: bool,
    pub duration_ms: Option<i64>,
}

/// Client-facing projection of an attempt. Audio never leaves the server.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptView {
    pub id: String,
    pub language_id: String,
    pub task_type: SpeakingTaskType,
    pub origin: AttemptOrigin,
    pub status: AttemptStatus,
    pub strictness: u8,
    pub duration_sec: Option<i32>,
    pub items: Vec<AttemptItemView>,
    pub score_percent: Option<u8>,
    pub ai_result: Option<AiResult>,
    pub error: Option<AttemptError>,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl From<&SpeakingAttempt> for AttemptView {
    fn from(attempt: &SpeakingAttempt) -> Self {
        Self {
            id: attempt.id.clone(),
            language_id: attempt.language_id.clone(),
            task_type: attempt.task_type,
            origin: attempt.origin.clone(),
            status: attempt.status,
            strictness: attempt.strictness,
            duration_sec: attempt.duration_sec,
            items: attempt
                .items
                .iter()
                .map(|item| AttemptItemView {
                    id: item.id.clone(),
                    prompt_text: item.prompt_text.clone(),
                    reference_text: item.reference_text.clone(),
                    has_audio: item.audio_base64.is_some(),
                    duration_ms: item.duration_ms,
                })
                .collect(),
            score_percent: attempt.score_percent,
            ai_result: attempt.ai_result.clone(),
            error: attempt.error.clone(),
            created_at: attempt.created_at,
            submitted_at: attempt.submitted_at,
            updated_at: attempt.updated_at,
        }
    }
}

/// Rejects empty or undecodable audio before it reaches the queue.
pub fn validate_audio(item_id: &str, audio_base64: Option<&str>) -> Result<String, SpeakingError> {
    let encoded = audio_base64
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| SpeakingError::MissingAudio(item_id.to_string()))?;
    match BASE64.decode(encoded) {
        Ok(bytes) if !bytes.is_empty() => Ok(encoded.to_string()),
        Ok(_) => Err(SpeakingError::MissingAudio(item_id.to_string())),
        Err(_) => Err(SpeakingError::Validation(format!(
            "audio for item {item_id} is not valid base64"
        ))),
    }
}

/// Builds the self-contained queue payload for an attempt's recorded items.
pub fn job_for(attempt: &SpeakingAttempt) -> AiJob {
    let items = attempt
        .items
        .iter()
        .map(|item| AiJobItem {
            item_id: item.id.clone(),
            audio_base64: item.audio_base64.clone(),
            mime_type: item.audio_mime.clone(),
            language_hint: Some(attempt.language_id.clone()),
            reference_text: item.reference_text.clone(),
        })
        .collect();
    AiJob::new(
        &attempt.id,
        &attempt.user_id,
        &attempt.language_id,
        attempt.task_type,
        attempt.strictness,
        items,
    )
}

pub async fn start_attempt(
    store: &ReviewStore,
    user_id: &str,
    language_id: &str,
    task_id: &str,
    default_strictness: u8,
    now: DateTime<Utc>,
) -> Result<SpeakingAttempt, SpeakingError> {
    let task = store
        .get_speaking_task(task_id)
        .await?
        .filter(|task| task.active && task.language_id == language_id)
        .ok_or_else(|| SpeakingError::TaskNotFound(task_id.to_string()))?;

    if task.items.is_empty() {
        return Err(SpeakingError::Validation(format!(
            "speaking task {task_id} has no items"
        )));
    }

    let attempt = SpeakingAttempt {
        id: Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        language_id: task.language_id.clone(),
        task_type: task.task_type,
        origin: AttemptOrigin::Task {
            task_id: task.id.clone(),
        },
        status: AttemptStatus::Started,
        strictness: default_strictness,
        duration_sec: None,
        items: task
            .items
            .iter()
            .map(|item| SpeakingAttemptItem {
                id: item.id.clone(),
                prompt_text: item.prompt_text.clone(),
                reference_text: item.reference_text.clone(),
                audio_base64: None,
                audio_mime: None,
                duration_ms: None,
            })
            .collect(),
        score_percent: None,
        ai_result: None,
        error: None,
        created_at: now,
        submitted_at: None,
        updated_at: now,
    };
    store.insert_speaking_attempt(&attempt).await?;

    tracing::info!(
        attempt_id = %attempt.id,
        user_id,
        task_id,
        task_type = attempt.task_type.as_str(),
        "speaking attempt started"
    );
    Ok(attempt)
}

pub async fn get_attempt(
    store: &ReviewStore,
    user_id: &str,
    attempt_id: &str,
) -> Result<SpeakingAttempt, SpeakingError> {
    store
        .get_speaking_attempt(attempt_id)
        .await?
        .filter(|attempt| attempt.user_id == user_id)
        .ok_or(SpeakingError::AttemptNotFound)
}

/// STARTED -> SUBMITTED -> (enqueue) -> PENDING_AI. If the enqueue fails the
/// attempt stays SUBMITTED and the stale sweeper picks it up.
pub async fn submit_attempt(
    store: &ReviewStore,
    queue: &JobQueue,
    user_id: &str,
    attempt_id: &str,
    request: SubmitAttemptRequest,
    now: DateTime<Utc>,
) -> Result<SpeakingAttempt, SpeakingError> {
    let mut attempt = get_attempt(store, user_id, attempt_id).await?;
    if attempt.status != AttemptStatus::Started {
        return Err(SpeakingError::AttemptNotActive(attempt.status.as_str()));
    }
    if let Some(strictness) = request.strictness {
        if strictness > MAX_STRICTNESS {
            return Err(SpeakingError::Validation(format!(
                "strictness must be between 0 and {MAX_STRICTNESS}"
            )));
        }
        attempt.strictness = strictness;
    }
    if let Some(duration) = request.duration_sec {
        if duration < 0 {
            return Err(SpeakingError::Validation(
                "durationSec must not be negative".to_string(),
            ));
        }
        attempt.duration_sec = Some(duration);
    }

    for submitted in &request.items {
        let item = attempt
            .items
            .iter_mut()
            .find(|item| item.id == submitted.item_id)
            .ok_or_else(|| SpeakingError::UnknownItem(submitted.item_id.clone()))?;
        item.audio_base64 = Some(validate_audio(&submitted.item_id, submitted.audio_base64.as_deref())?);
        item.audio_mime = Some(
            submitted
                .mime_type
                .clone()
                .unwrap_or_else(|| DEFAULT_AUDIO_MIME.to_string()),
        );
        item.duration_ms = submitted.duration_ms;
    }
    if let Some(missing) = attempt.items.iter().find(|item| item.audio_base64.is_none()) {
        return Err(SpeakingError::MissingAudio(missing.id.clone()));
    }

    attempt.status = AttemptStatus::Submitted;
    attempt.submitted_at = Some(now);
    attempt.updated_at = now;
    if !store.update_attempt_if(&attempt, AttemptStatus::Started).await? {
        return Err(SpeakingError::AttemptNotActive("already submitted"));
    }

    queue.enqueue(&job_for(&attempt)).await?;

    attempt.status = AttemptStatus::PendingAi;
    if !store.update_attempt_if(&attempt, AttemptStatus::Submitted).await? {
        // A fast worker already finalized it.
        return get_attempt(store, user_id, attempt_id).await;
    }

    tracing::info!(attempt_id, user_id, items = attempt.items.len(), "speaking attempt queued for scoring");
    Ok(attempt)
}

/// Records the scored result. `None` when the attempt was already terminal,
/// which makes repeated finalization a no-op.
pub async fn finalize_scored(
    store: &ReviewStore,
    attempt_id: &str,
    score_percent: u8,
    ai_result: AiResult,
    now: DateTime<Utc>,
) -> Result<Option<SpeakingAttempt>, StoreError> {
    let completion = AttemptCompletion::Scored {
        score_percent,
        ai_result,
    };
    let finalized = store.complete_attempt(attempt_id, &completion, now).await?;
    if finalized.is_none() {
        tracing::info!(attempt_id, "attempt already finalized, result discarded");
    }
    Ok(finalized)
}

pub async fn mark_failed(
    store: &ReviewStore,
    attempt_id: &str,
    error: AttemptError,
    now: DateTime<Utc>,
) -> Result<Option<SpeakingAttempt>, StoreError> {
    tracing::warn!(
        attempt_id,
        code = %error.code,
        retryable = error.retryable,
        tries = error.tries,
        "speaking attempt failed"
    );
    store
        .complete_attempt(attempt_id, &AttemptCompletion::Failed { error }, now)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{SpeakingTask, SpeakingTaskItem};

    fn task() -> SpeakingTask {
        SpeakingTask {
            id: "task-1".to_string(),
            language_id: "en".to_string(),
            task_type: SpeakingTaskType::ReadAloud,
            title: "Weather".to_string(),
            active: true,
            items: vec![SpeakingTaskItem {
                id: "ti-1".to_string(),
                prompt_text: Some("Read the sentence".to_string()),
                reference_text: Some("It is raining today".to_string()),
                picture_url: None,
                prompt_audio_url: None,
            }],
        }
    }

    fn audio() -> SubmittedAudio {
        SubmittedAudio {
            item_id: "ti-1".to_string(),
            audio_base64: Some(BASE64.encode(b"RIFF fake wav")),
            mime_type: None,
            duration_ms: Some(1800),
        }
    }

    #[test]
    fn test_validate_audio() {
        assert!(matches!(validate_audio("i", None), Err(SpeakingError::MissingAudio(_))));
        assert!(matches!(validate_audio("i", Some("  ")), Err(SpeakingError::MissingAudio(_))));
        assert!(matches!(validate_audio("i", Some("%%%")), Err(SpeakingError::Validation(_))));
        assert!(validate_audio("i", Some("UklGRg==")).is_ok());
    }

    #[tokio::test]
    async fn test_start_rejects_task_from_other_language() {
        let (store, memory) = ReviewStore::memory();
        memory.insert_speaking_task(task());
        let err = start_attempt(&store, "u1", "fr", "task-1", 75, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, SpeakingError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn test_submit_moves_attempt_to_pending_and_enqueues() {
        let (store, memory) = ReviewStore::memory();
        memory.insert_speaking_task(task());
        let (queue, pending) = JobQueue::memory();
        let now = Utc::now();

        let attempt = start_attempt(&store, "u1", "en", "task-1", 75, now).await.unwrap();
        assert_eq!(attempt.status, AttemptStatus::Started);

        let request = SubmitAttemptRequest {
            items: vec![audio()],
            strictness: Some(60),
            duration_sec: Some(2),
        };
        let submitted = submit_attempt(&store, &queue, "u1", &attempt.id, request, now)
            .await
            .unwrap();
        assert_eq!(submitted.status, AttemptStatus::PendingAi);
        assert_eq!(submitted.strictness, 60);

        let jobs = pending.drain_ready();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].attempt_id, attempt.id);
        assert_eq!(jobs[0].items[0].mime_type.as_deref(), Some(DEFAULT_AUDIO_MIME));
        assert_eq!(jobs[0].items[0].reference_text.as_deref(), Some("It is raining today"));

        let view = AttemptView::from(&submitted);
        assert!(view.items[0].has_audio);
        let json = serde_json::to_value(&view).unwrap();
        assert!(json["items"][0].get("audioBase64").is_none());
    }

    #[tokio::test]
    async fn test_submit_twice_is_rejected() {
        let (store, memory) = ReviewStore::memory();
        memory.insert_speaking_task(task());
        let (queue, _) = JobQueue::memory();
        let now = Utc::now();
        let attempt = start_attempt(&store, "u1", "en", "task-1", 75, now).await.unwrap();

        let request = SubmitAttemptRequest {
            items: vec![audio()],
            strictness: None,
            duration_sec: None,
        };
        submit_attempt(&store, &queue, "u1", &attempt.id, request.clone(), now)
            .await
            .unwrap();
        let err = submit_attempt(&store, &queue, "u1", &attempt.id, request, now)
            .await
            .unwrap_err();
        assert!(matches!(err, SpeakingError::AttemptNotActive("PENDING_AI")));
    }

    #[tokio::test]
    async fn test_other_users_cannot_see_attempt() {
        let (store, memory) = ReviewStore::memory();
        memory.insert_speaking_task(task());
        let attempt = start_attempt(&store, "u1", "en", "task-1", 75, Utc::now())
            .await
            .unwrap();
        assert!(matches!(
            get_attempt(&store, "u2", &attempt.id).await,
            Err(SpeakingError::AttemptNotFound)
        ));
    }

    #[tokio::test]
    async fn test_submit_without_audio_fails() {
        let (store, memory) = ReviewStore::memory();
        memory.insert_speaking_task(task());
        let (queue, pending) = JobQueue::memory();
        let attempt = start_attempt(&store, "u1", "en", "task-1", 75, Utc::now())
            .await
            .unwrap();
        let request = SubmitAttemptRequest {
            items: Vec::new(),
            strictness: None,
            duration_sec: None,
        };
        let err = submit_attempt(&store, &queue, "u1", &attempt.id, request, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, SpeakingError::MissingAudio(_)));
        assert_eq!(pending.ready_len(), 0);
    }
}
