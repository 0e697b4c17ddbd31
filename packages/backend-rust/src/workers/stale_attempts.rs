use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::core::JobQueue;
use crate::services::speaking::{job_for, mark_failed};
use crate::store::{AttemptError, AttemptStatus, ReviewStore, SpeakingAttempt};

use super::WorkerError;

const SWEEP_BATCH: usize = 100;
pub const STALE_ERROR_CODE: &str = "STALE_PENDING";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub requeued: usize,
    pub failed: usize,
}

/// An attempt gets one sweep per stale window; after `max_tries` windows
/// since submission it is given up on.
fn over_budget(attempt: &SpeakingAttempt, stale_after: Duration, max_tries: u32, now: DateTime<Utc>) -> bool {
    let Some(submitted_at) = attempt.submitted_at else {
        return true;
    };
    let budget = stale_after.saturating_mul(max_tries.max(1));
    match chrono::Duration::from_std(budget) {
        Ok(budget) => now - submitted_at >= budget,
        Err(_) => false,
    }
}

fn missing_audio(attempt: &SpeakingAttempt) -> bool {
    attempt.items.is_empty() || attempt.items.iter().any(|item| item.audio_base64.is_none())
}

/// Re-queues attempts stuck in SUBMITTED, PENDING_AI or a retryable FAILED
/// state (lost jobs) and fails the ones that can no longer be scored.
pub async fn sweep_stale_attempts(
    store: &ReviewStore,
    queue: &JobQueue,
    stale_after: Duration,
    max_tries: u32,
    now: DateTime<Utc>,
) -> Result<SweepStats, WorkerError> {
    let start = Instant::now();
    let cutoff = chrono::Duration::from_std(stale_after)
        .ok()
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(now);
    let stale = store.list_stale_attempts(cutoff, SWEEP_BATCH).await?;
    let mut stats = SweepStats::default();

    for mut attempt in stale {
        if missing_audio(&attempt) || over_budget(&attempt, stale_after, max_tries, now) {
            let error = AttemptError {
                code: STALE_ERROR_CODE.to_string(),
                message: "attempt was not scored in time".to_string(),
                retryable: false,
                tries: max_tries,
            };
            if mark_failed(store, &attempt.id, error, now).await?.is_some() {
                stats.failed += 1;
            }
            continue;
        }

        let expected = attempt.status;
        attempt.status = AttemptStatus::PendingAi;
        attempt.updated_at = now;
        if !store.update_attempt_if(&attempt, expected).await? {
            debug!(attempt_id = %attempt.id, "attempt moved during sweep, skipping");
            continue;
        }
        match queue.enqueue(&job_for(&attempt)).await {
            Ok(()) => stats.requeued += 1,
            Err(err) => warn!(attempt_id = %attempt.id, error = %err, "failed to re-queue stale attempt"),
        }
    }

    if stats.requeued > 0 || stats.failed > 0 {
        info!(
            requeued = stats.requeued,
            failed = stats.failed,
            duration_secs = format!("{:.2}", start.elapsed().as_secs_f64()),
            "Stale attempt sweep completed"
        );
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AttemptOrigin, SpeakingAttemptItem, SpeakingTaskType};
    use chrono::TimeZone;

    fn attempt(id: &str, submitted_at: DateTime<Utc>, audio: Option<&str>) -> SpeakingAttempt {
        SpeakingAttempt {
            id: id.to_string(),
            user_id: "u1".to_string(),
            language_id: "en".to_string(),
            task_type: SpeakingTaskType::ReadAloud,
            origin: AttemptOrigin::Task {
                task_id: "t1".to_string(),
            },
            status: AttemptStatus::PendingAi,
            strictness: 75,
            duration_sec: None,
            items: vec![SpeakingAttemptItem {
                id: "i1".to_string(),
                prompt_text: None,
                reference_text: Some("hello there".to_string()),
                audio_base64: audio.map(str::to_string),
                audio_mime: Some("audio/wav".to_string()),
                duration_ms: None,
            }],
            score_percent: None,
            ai_result: None,
            error: None,
            created_at: submitted_at,
            submitted_at: Some(submitted_at),
            updated_at: submitted_at,
        }
    }

    #[tokio::test]
    async fn test_sweep_requeues_and_fails() {
        let (store, _) = ReviewStore::memory();
        let (queue, pending) = JobQueue::memory();
        let now = Utc.with_ymd_and_hms(2026, 4, 2, 12, 0, 0).unwrap();
        let stale_after = Duration::from_secs(900);

        store
            .insert_speaking_attempt(&attempt("recent", now - chrono::Duration::minutes(5), Some("UklGRg==")))
            .await
            .unwrap();
        store
            .insert_speaking_attempt(&attempt("lost", now - chrono::Duration::minutes(20), Some("UklGRg==")))
            .await
            .unwrap();
        store
            .insert_speaking_attempt(&attempt("ancient", now - chrono::Duration::hours(3), Some("UklGRg==")))
            .await
            .unwrap();
        store
            .insert_speaking_attempt(&attempt("silent", now - chrono::Duration::minutes(20), None))
            .await
            .unwrap();

        let stats = sweep_stale_attempts(&store, &queue, stale_after, 6, now).await.unwrap();
        assert_eq!(stats, SweepStats { requeued: 1, failed: 2 });

        let jobs = pending.drain_ready();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].attempt_id, "lost");

        let lost = store.get_speaking_attempt("lost").await.unwrap().unwrap();
        assert_eq!(lost.updated_at, now);
        let ancient = store.get_speaking_attempt("ancient").await.unwrap().unwrap();
        assert_eq!(ancient.status, AttemptStatus::Failed);
        assert_eq!(ancient.error.unwrap().code, STALE_ERROR_CODE);
        let recent = store.get_speaking_attempt("recent").await.unwrap().unwrap();
        assert_eq!(recent.status, AttemptStatus::PendingAi);
    }
}
