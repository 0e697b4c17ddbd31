pub mod memory;
pub mod models;
pub mod postgres;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

pub use memory::MemoryStore;
pub use models::*;
pub use postgres::PostgresStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sql(#[from] sqlx::Error),
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Persistence for review state, attempt logs, weak-word errors and speaking
/// attempts. Content rows are read-only from here.
#[derive(Clone)]
pub enum ReviewStore {
    Postgres(PostgresStore),
    Memory(Arc<MemoryStore>),
}

impl ReviewStore {
    pub fn memory() -> (Self, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (ReviewStore::Memory(Arc::clone(&store)), store)
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            ReviewStore::Postgres(_) => "postgres",
            ReviewStore::Memory(_) => "memory",
        }
    }

    pub async fn get_settings(
        &self,
        user_id: &str,
        language_id: &str,
    ) -> Result<Option<ReviewSettings>, StoreError> {
        match self {
            ReviewStore::Postgres(pg) => pg.get_settings(user_id, language_id).await,
            ReviewStore::Memory(mem) => Ok(mem.get_settings(user_id, language_id)),
        }
    }

    pub async fn upsert_settings(&self, settings: &ReviewSettings) -> Result<ReviewSettings, StoreError> {
        match self {
            ReviewStore::Postgres(pg) => pg.upsert_settings(settings).await,
            ReviewStore::Memory(mem) => Ok(mem.upsert_settings(settings)),
        }
    }

    pub async fn get_item(&self, domain: Domain, item_id: &str) -> Result<Option<ReviewableItem>, StoreError> {
        match self {
            ReviewStore::Postgres(pg) => pg.get_item(domain, item_id).await,
            ReviewStore::Memory(mem) => Ok(mem.get_item(domain, item_id)),
        }
    }

    pub async fn get_items(&self, domain: Domain, ids: &[String]) -> Result<Vec<ReviewableItem>, StoreError> {
        match self {
            ReviewStore::Postgres(pg) => pg.get_items(domain, ids).await,
            ReviewStore::Memory(mem) => Ok(mem.get_items(domain, ids)),
        }
    }

    /// Active items the user has never had scheduled, easiest first.
    pub async fn list_new_items(
        &self,
        user_id: &str,
        language_id: &str,
        domain: Domain,
        limit: usize,
    ) -> Result<Vec<ReviewableItem>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        match self {
            ReviewStore::Postgres(pg) => pg.list_new_items(user_id, language_id, domain, limit).await,
            ReviewStore::Memory(mem) => Ok(mem.list_new_items(user_id, language_id, domain, limit)),
        }
    }

    pub async fn find_lexeme_by_lemma(
        &self,
        language_id: &str,
        lemma: &str,
    ) -> Result<Option<ReviewableItem>, StoreError> {
        match self {
            ReviewStore::Postgres(pg) => pg.find_lexeme_by_lemma(language_id, lemma).await,
            ReviewStore::Memory(mem) => Ok(mem.find_lexeme_by_lemma(language_id, lemma)),
        }
    }

    /// Due states ordered by due date, then by last update.
    pub async fn list_due_states(
        &self,
        user_id: &str,
        language_id: &str,
        domain: Domain,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StateRecord>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        match self {
            ReviewStore::Postgres(pg) => pg.list_due_states(user_id, language_id, domain, now, limit).await,
            ReviewStore::Memory(mem) => Ok(mem.list_due_states(user_id, language_id, domain, now, limit)),
        }
    }

    pub async fn get_state(
        &self,
        user_id: &str,
        domain: Domain,
        item_id: &str,
    ) -> Result<Option<StateRecord>, StoreError> {
        match self {
            ReviewStore::Postgres(pg) => pg.get_state(user_id, domain, item_id).await,
            ReviewStore::Memory(mem) => Ok(mem.get_state(user_id, domain, item_id)),
        }
    }

    /// Returns the stored row when one already exists for the same
    /// (user, domain, item).
    pub async fn insert_state_if_absent(&self, record: StateRecord) -> Result<StateRecord, StoreError> {
        match self {
            ReviewStore::Postgres(pg) => pg.insert_state_if_absent(record).await,
            ReviewStore::Memory(mem) => Ok(mem.insert_state_if_absent(record)),
        }
    }

    pub async fn get_or_create_state(
        &self,
        user_id: &str,
        domain: Domain,
        item_id: &str,
        now: DateTime<Utc>,
    ) -> Result<StateRecord, StoreError> {
        if let Some(existing) = self.get_state(user_id, domain, item_id).await? {
            return Ok(existing);
        }
        self.insert_state_if_absent(StateRecord::fresh(user_id, domain, item_id, now))
            .await
    }

    pub async fn save_state(&self, record: &StateRecord) -> Result<(), StoreError> {
        match self {
            ReviewStore::Postgres(pg) => pg.save_state(record).await,
            ReviewStore::Memory(mem) => {
                mem.save_state(record);
                Ok(())
            }
        }
    }

    /// Persists a graded answer: the attempt row and, when given, the new
    /// schedule, as one unit.
    pub async fn record_review(
        &self,
        state: Option<&StateRecord>,
        attempt: &ReviewAttempt,
    ) -> Result<(), StoreError> {
        match self {
            ReviewStore::Postgres(pg) => pg.record_review(state, attempt).await,
            ReviewStore::Memory(mem) => {
                mem.record_review(state, attempt);
                Ok(())
            }
        }
    }

    pub async fn review_stats(
        &self,
        user_id: &str,
        language_id: &str,
        domain: Domain,
        now: DateTime<Utc>,
    ) -> Result<ReviewStats, StoreError> {
        match self {
            ReviewStore::Postgres(pg) => pg.review_stats(user_id, language_id, domain, now).await,
            ReviewStore::Memory(mem) => Ok(mem.review_stats(user_id, language_id, domain, now)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_word_error(
        &self,
        user_id: &str,
        lexeme_id: &str,
        error_type: WordErrorType,
        source: WordErrorSource,
        severity: Severity,
        evidence: Value,
        now: DateTime<Utc>,
    ) -> Result<UserWordError, StoreError> {
        match self {
            ReviewStore::Postgres(pg) => {
                pg.upsert_word_error(user_id, lexeme_id, error_type, source, severity, evidence, now)
                    .await
            }
            ReviewStore::Memory(mem) => Ok(mem.upsert_word_error(
                user_id, lexeme_id, error_type, source, severity, evidence, now,
            )),
        }
    }

    pub async fn list_weak_words(
        &self,
        user_id: &str,
        language_id: &str,
        limit: usize,
    ) -> Result<Vec<WeakWord>, StoreError> {
        match self {
            ReviewStore::Postgres(pg) => pg.list_weak_words(user_id, language_id, limit).await,
            ReviewStore::Memory(mem) => Ok(mem.list_weak_words(user_id, language_id, limit)),
        }
    }

    /// Most recent first.
    pub async fn word_errors_for(
        &self,
        user_id: &str,
        lexeme_ids: &[String],
    ) -> Result<Vec<UserWordError>, StoreError> {
        match self {
            ReviewStore::Postgres(pg) => pg.word_errors_for(user_id, lexeme_ids).await,
            ReviewStore::Memory(mem) => Ok(mem.word_errors_for(user_id, lexeme_ids)),
        }
    }

    pub async fn get_speaking_task(&self, task_id: &str) -> Result<Option<SpeakingTask>, StoreError> {
        match self {
            ReviewStore::Postgres(pg) => pg.get_speaking_task(task_id).await,
            ReviewStore::Memory(mem) => Ok(mem.get_speaking_task(task_id)),
        }
    }

    /// Returns false when an attempt with the same id already exists.
    pub async fn insert_speaking_attempt(&self, attempt: &SpeakingAttempt) -> Result<bool, StoreError> {
        match self {
            ReviewStore::Postgres(pg) => pg.insert_speaking_attempt(attempt).await,
            ReviewStore::Memory(mem) => Ok(mem.insert_speaking_attempt(attempt)),
        }
    }

    pub async fn get_speaking_attempt(&self, attempt_id: &str) -> Result<Option<SpeakingAttempt>, StoreError> {
        match self {
            ReviewStore::Postgres(pg) => pg.get_speaking_attempt(attempt_id).await,
            ReviewStore::Memory(mem) => Ok(mem.get_speaking_attempt(attempt_id)),
        }
    }

    /// Compare-and-set on status. Returns false when another writer moved the
    /// attempt first.
    pub async fn update_attempt_if(
        &self,
        attempt: &SpeakingAttempt,
        expected: AttemptStatus,
    ) -> Result<bool, StoreError> {
        match self {
            ReviewStore::Postgres(pg) => pg.update_attempt_if(attempt, expected).await,
            ReviewStore::Memory(mem) => Ok(mem.update_attempt_if(attempt, expected)),
        }
    }

    /// Terminal transition. `None` means the attempt was already finalized
    /// (or never submitted) and nothing changed.
    pub async fn complete_attempt(
        &self,
        attempt_id: &str,
        completion: &AttemptCompletion,
        now: DateTime<Utc>,
    ) -> Result<Option<SpeakingAttempt>, StoreError> {
        match self {
            ReviewStore::Postgres(pg) => pg.complete_attempt(attempt_id, completion, now).await,
            ReviewStore::Memory(mem) => Ok(mem.complete_attempt(attempt_id, completion, now)),
        }
    }

    pub async fn list_stale_attempts(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SpeakingAttempt>, StoreError> {
        match self {
            ReviewStore::Postgres(pg) => pg.list_stale_attempts(cutoff, limit).await,
            ReviewStore::Memory(mem) => Ok(mem.list_stale_attempts(cutoff, limit)),
        }
    }
}
