use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use thiserror::Error;
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, error, info, warn};

use crate::cache::keys;
use crate::config::AiConfig;
use crate::core::{AiJob, AiJobItem, AiRateLimiter, ClaimStore, Delivery, JobQueue};
use crate::services::evaluator::{clamp_score, fuse_speech_scores, ScoringMode, SpeechDimensions};
use crate::services::review_session::apply_speech_outcome;
use crate::services::scoring_provider::{ProviderError, ScoreRequest, ScoringProvider};
use crate::services::speaking::{finalize_scored, mark_failed, DEFAULT_AUDIO_MIME};
use crate::services::weak_words::ingest_word_feedback;
use crate::store::{
    AiResult, AttemptError, AttemptOrigin, ItemScore, ReviewStore, WordErrorSource, WordErrorType,
    WordFeedback,
};

const RESERVE_WAIT: Duration = Duration::from_secs(5);
const BACKOFF_BASE: Duration = Duration::from_secs(5);
const BACKOFF_CAP: Duration = Duration::from_secs(300);
const BACKOFF_JITTER_MS: u64 = 1_000;

/// Everything a scoring job touches. Cheap to clone.
#[derive(Clone)]
pub struct ScoringContext {
    pub store: ReviewStore,
    pub queue: JobQueue,
    pub claims: ClaimStore,
    pub limiter: AiRateLimiter,
    pub provider: ScoringProvider,
    pub config: AiConfig,
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("AI rate limit exhausted")]
    RateLimited,
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("{code}: {message}")]
    Fatal { code: &'static str, message: String },
}

impl JobError {
    fn fatal(code: &'static str, message: impl Into<String>) -> Self {
        JobError::Fatal {
            code,
            message: message.into(),
        }
    }

    fn code(&self) -> &'static str {
        match self {
            JobError::RateLimited => "RATE_LIMITED",
            JobError::Transient(_) => "TRANSIENT",
            JobError::Fatal { code, .. } => code,
        }
    }
}

impl From<ProviderError> for JobError {
    fn from(err: ProviderError) -> Self {
        if err.is_transient() {
            JobError::Transient(err.to_string())
        } else {
            JobError::fatal("PROVIDER_REJECTED", err.to_string())
        }
    }
}

impl From<crate::store::StoreError> for JobError {
    fn from(err: crate::store::StoreError) -> Self {
        JobError::Transient(err.to_string())
    }
}

impl From<crate::core::CoordinationError> for JobError {
    fn from(err: crate::core::CoordinationError) -> Self {
        JobError::Transient(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Scored,
    /// Duplicate delivery or an attempt that is already terminal.
    Skipped,
    /// Rate limited, re-queued without counting as a failure of the attempt.
    Deferred,
    /// Transient failure, re-queued with backoff.
    Retrying,
    Failed,
}

/// Exponential backoff from 5s, capped at five minutes, with jitter.
pub fn retry_delay(tries: u32) -> Duration {
    let exponent = tries.saturating_sub(1).min(16);
    let base = BACKOFF_BASE
        .saturating_mul(1u32 << exponent)
        .min(BACKOFF_CAP);
    let jitter = rand::rng().random_range(0..=BACKOFF_JITTER_MS);
    base + Duration::from_millis(jitter)
}

/// Handles one delivery end to end and always acks it. Retries go back on
/// the queue as new deliveries.
pub async fn process_delivery(ctx: &ScoringContext, delivery: Delivery) -> JobOutcome {
    let outcome = process_job(ctx, delivery.job.clone()).await;
    if let Err(err) = ctx.queue.ack(&delivery).await {
        warn!(job_id = %delivery.job.job_id, error = %err, "failed to ack scoring job");
    }
    outcome
}

pub async fn process_job(ctx: &ScoringContext, mut job: AiJob) -> JobOutcome {
    let claim_key = keys::attempt_claim_key(&job.attempt_id);
    match ctx.claims.try_claim(&claim_key, ctx.config.dedup_ttl).await {
        Ok(true) => {}
        Ok(false) => {
            debug!(attempt_id = %job.attempt_id, "attempt already claimed, skipping delivery");
            return JobOutcome::Skipped;
        }
        Err(err) => {
            warn!(attempt_id = %job.attempt_id, error = %err, "claim store unavailable");
            return reschedule(ctx, &mut job, JobError::from(err)).await;
        }
    }

    let result = match tokio::time::timeout(ctx.config.job_timeout, score_job(ctx, &job)).await {
        Ok(result) => result,
        Err(_) => Err(JobError::Transient(format!(
            "scoring timed out after {}s",
            ctx.config.job_timeout.as_secs()
        ))),
    };

    match result {
        Ok(outcome) => outcome,
        Err(err @ JobError::Fatal { .. }) => {
            let error = AttemptError {
                code: err.code().to_string(),
                message: err.to_string(),
                retryable: false,
                tries: job.tries + 1,
            };
            if let Err(store_err) = mark_failed(&ctx.store, &job.attempt_id, error, Utc::now()).await {
                error!(attempt_id = %job.attempt_id, error = %store_err, "failed to record fatal scoring error");
            }
            JobOutcome::Failed
        }
        Err(err) => {
            release_claim(ctx, &claim_key).await;
            reschedule(ctx, &mut job, err).await
        }
    }
}

async fn release_claim(ctx: &ScoringContext, claim_key: &str) {
    if let Err(err) = ctx.claims.release(claim_key).await {
        warn!(claim_key, error = %err, "failed to release attempt claim");
    }
}

/// Re-queues a retryable failure, or fails the attempt for good once the
/// retry budget is spent.
async fn reschedule(ctx: &ScoringContext, job: &mut AiJob, err: JobError) -> JobOutcome {
    job.tries += 1;
    let exhausted = job.tries >= ctx.config.max_tries;
    let rate_limited = matches!(err, JobError::RateLimited);

    // A transient failure is visible to pollers right away; the retry can
    // still overwrite it.
    if !rate_limited || exhausted {
        let error = AttemptError {
            code: err.code().to_string(),
            message: err.to_string(),
            retryable: !exhausted,
            tries: job.tries,
        };
        if let Err(store_err) = mark_failed(&ctx.store, &job.attempt_id, error, Utc::now()).await {
            error!(attempt_id = %job.attempt_id, error = %store_err, "failed to record scoring error");
        }
    }

    if exhausted {
        warn!(attempt_id = %job.attempt_id, tries = job.tries, error = %err, "scoring retries exhausted");
        return JobOutcome::Failed;
    }

    let delay = if rate_limited {
        ctx.config.rate_limit_defer
    } else {
        retry_delay(job.tries)
    };
    match ctx.queue.defer(job, delay).await {
        Ok(()) => {
            info!(
                attempt_id = %job.attempt_id,
                tries = job.tries,
                delay_ms = delay.as_millis() as u64,
                reason = err.code(),
                "scoring job re-queued"
            );
            if rate_limited {
                JobOutcome::Deferred
            } else {
                JobOutcome::Retrying
            }
        }
        Err(queue_err) => {
            // The attempt keeps its retryable error; the stale sweeper re-queues
            // it or fails it for good once the retry budget has passed.
            error!(attempt_id = %job.attempt_id, error = %queue_err, "failed to re-queue scoring job");
            JobOutcome::Retrying
        }
    }
}

fn validate_items(job: &AiJob, mode: ScoringMode) -> Result<(), JobError> {
    if job.items.is_empty() {
        return Err(JobError::fatal("NO_ITEMS", "job carries no items"));
    }
    for item in &job.items {
        if item.audio_base64.as_deref().map_or(true, |a| a.trim().is_empty()) {
            return Err(JobError::fatal(
                "MISSING_AUDIO",
                format!("item {} has no audio", item.item_id),
            ));
        }
        let has_reference = item
            .reference_text
            .as_deref()
            .is_some_and(|r| !r.trim().is_empty());
        if mode == ScoringMode::ReferenceBased && !has_reference {
            return Err(JobError::fatal(
                "MISSING_REFERENCE",
                format!("item {} has no reference text", item.item_id),
            ));
        }
    }
    Ok(())
}

async fn score_item(
    provider: &ScoringProvider,
    job: &AiJob,
    item: &AiJobItem,
    mode: ScoringMode,
) -> Result<ItemScore, JobError> {
    let audio = item.audio_base64.as_deref().unwrap_or_default();
    let mime = item.mime_type.as_deref().unwrap_or(DEFAULT_AUDIO_MIME);
    let hint = item.language_hint.as_deref();

    // Free speech has no ground truth, so the transcript stands in as the
    // reference and accuracy is dropped at fusion.
    let (reference, asr_transcript) = match mode {
        ScoringMode::FreeSpeech => {
            let transcript = provider.transcribe(audio, mime, hint).await?;
            (transcript.text.clone(), Some(transcript.text))
        }
        ScoringMode::ReferenceBased => (item.reference_text.clone().unwrap_or_default(), None),
    };

    let score = provider
        .score(ScoreRequest {
            audio_base64: audio,
            mime_type: mime,
            reference_text: &reference,
            language_hint: hint,
            strictness: job.strictness,
        })
        .await?;

    let dims = SpeechDimensions {
        pronunciation: clamp_score(score.pronunciation),
        fluency: clamp_score(score.fluency),
        accuracy: match mode {
            ScoringMode::FreeSpeech => None,
            ScoringMode::ReferenceBased => score.accuracy.map(clamp_score),
        },
    };

    Ok(ItemScore {
        item_id: item.item_id.clone(),
        pronunciation: dims.pronunciation,
        fluency: dims.fluency,
        accuracy: dims.accuracy,
        composite: fuse_speech_scores(mode, dims),
        transcript: score.transcript.or(asr_transcript),
        synthetic_reference: mode == ScoringMode::FreeSpeech,
        tips: score.tips,
        words: score.words.into_iter().map(WordFeedback::from).collect(),
    })
}

/// Attempt score is the rounded mean of the item composites.
pub fn attempt_score(items: &[ItemScore]) -> u8 {
    if items.is_empty() {
        return 0;
    }
    let total: f64 = items.iter().map(|item| f64::from(item.composite)).sum();
    clamp_score(total / items.len() as f64)
}

async fn score_job(ctx: &ScoringContext, job: &AiJob) -> Result<JobOutcome, JobError> {
    let Some(attempt) = ctx.store.get_speaking_attempt(&job.attempt_id).await? else {
        return Err(JobError::fatal(
            "ATTEMPT_NOT_FOUND",
            format!("attempt {} does not exist", job.attempt_id),
        ));
    };
    if !attempt.accepts_result() {
        debug!(attempt_id = %attempt.id, status = attempt.status.as_str(), "attempt not awaiting a score");
        return Ok(JobOutcome::Skipped);
    }

    let mode = job.task_type.scoring_mode();
    validate_items(job, mode)?;

    if !ctx.limiter.acquire(&job.user_id).await? {
        return Err(JobError::RateLimited);
    }

    let mut items = Vec::with_capacity(job.items.len());
    for item in &job.items {
        items.push(score_item(&ctx.provider, job, item, mode).await?);
    }
    let score_percent = attempt_score(&items);
    let ai_result = AiResult {
        task_type: job.task_type,
        scoring_mode: mode,
        items,
        summary: None,
    };
    let feedback: Vec<WordFeedback> = ai_result.word_feedback().cloned().collect();

    let now = Utc::now();
    let Some(scored) = finalize_scored(&ctx.store, &attempt.id, score_percent, ai_result, now).await? else {
        return Ok(JobOutcome::Skipped);
    };
    info!(
        attempt_id = %scored.id,
        user_id = %scored.user_id,
        score_percent,
        tries = job.tries,
        "speaking attempt scored"
    );

    let source = match scored.origin {
        AttemptOrigin::ReviewItem { .. } => {
            if let Err(err) = apply_speech_outcome(&ctx.store, &scored, now).await {
                error!(attempt_id = %scored.id, error = %err, "failed to apply speech score to review state");
            }
            WordErrorSource::Review
        }
        AttemptOrigin::Task { .. } => WordErrorSource::Speaking,
    };

    if !feedback.is_empty() {
        match ingest_word_feedback(
            &ctx.store,
            &scored.user_id,
            &scored.language_id,
            &feedback,
            source,
            WordErrorType::Pronunciation,
            now,
        )
        .await
        {
            Ok(summary) => debug!(attempt_id = %scored.id, matched = summary.matched, skipped = summary.skipped, "weak words ingested"),
            Err(err) => warn!(attempt_id = %scored.id, error = %err, "weak word ingestion failed"),
        }
    }

    Ok(JobOutcome::Scored)
}

/// Pulls jobs until shutdown, running at most `max_jobs` at once.
pub async fn run_pool(ctx: ScoringContext, mut shutdown: broadcast::Receiver<()>) {
    let permits = Arc::new(Semaphore::new(ctx.config.max_jobs as usize));
    info!(max_jobs = ctx.config.max_jobs, "AI scoring pool started");

    loop {
        let permit = tokio::select! {
            _ = shutdown.recv() => break,
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let delivery = tokio::select! {
            _ = shutdown.recv() => break,
            reserved = ctx.queue.reserve(RESERVE_WAIT) => reserved,
        };

        match delivery {
            Ok(Some(delivery)) => {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    let attempt_id = delivery.job.attempt_id.clone();
                    let outcome = process_delivery(&ctx, delivery).await;
                    debug!(attempt_id = %attempt_id, ?outcome, "scoring job finished");
                    drop(permit);
                });
            }
            Ok(None) => {}
            Err(err) => {
                error!(error = %err, "failed to reserve scoring job");
                tokio::time::sleep(RESERVE_WAIT).await;
            }
        }
    }

    // Wait for in-flight jobs to finish.
    let _ = permits.acquire_many(ctx.config.max_jobs).await;
    info!("AI scoring pool stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_grows_and_caps() {
        let first = retry_delay(1);
        assert!(first >= Duration::from_secs(5) && first <= Duration::from_secs(6));
        let third = retry_delay(3);
        assert!(third >= Duration::from_secs(20) && third <= Duration::from_secs(21));
        let late = retry_delay(30);
        assert!(late >= BACKOFF_CAP && late <= BACKOFF_CAP + Duration::from_secs(1));
    }

    #[test]
    fn test_attempt_score_is_mean_of_composites() {
        let item = |composite| ItemScore {
            item_id: "i".to_string(),
            pronunciation: 0,
            fluency: 0,
            accuracy: None,
            composite,
            transcript: None,
            synthetic_reference: false,
            tips: Vec::new(),
            words: Vec::new(),
        };
        assert_eq!(attempt_score(&[item(73), item(80)]), 76);
        assert_eq!(attempt_score(&[]), 0);
    }

    #[test]
    fn test_validate_items_requires_reference_for_read_aloud() {
        let job = AiJob::new(
            "a1",
            "u1",
            "en",
            crate::store::SpeakingTaskType::ReadAloud,
            75,
            vec![AiJobItem {
                item_id: "i1".to_string(),
                audio_base64: Some("UklGRg==".to_string()),
                mime_type: None,
                language_hint: None,
                reference_text: None,
            }],
        );
        let err = validate_items(&job, ScoringMode::ReferenceBased).unwrap_err();
        assert_eq!(err.code(), "MISSING_REFERENCE");
        assert!(validate_items(&job, ScoringMode::FreeSpeech).is_ok());
    }
}
