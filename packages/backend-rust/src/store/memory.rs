use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde_json::Value;

use super::models::*;
use crate::services::srs::Mastery;
use crate::services::weak_words::normalize_word;

type StateKey = (String, Domain, String);
type WordErrorKey = (String, String, WordErrorType);

#[derive(Default)]
struct Tables {
    items: HashMap<String, ReviewableItem>,
    states: HashMap<StateKey, StateRecord>,
    attempts: Vec<ReviewAttempt>,
    settings: HashMap<(String, String), ReviewSettings>,
    word_errors: HashMap<WordErrorKey, UserWordError>,
    tasks: HashMap<String, SpeakingTask>,
    speaking: HashMap<String, SpeakingAttempt>,
}

/// Process-local store used when no database is configured and by tests.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_item(&self, item: ReviewableItem) {
        self.tables.write().items.insert(item.id.clone(), item);
    }

    pub fn insert_speaking_task(&self, task: SpeakingTask) {
        self.tables.write().tasks.insert(task.id.clone(), task);
    }

    pub fn review_attempts(&self, user_id: &str) -> Vec<ReviewAttempt> {
        self.tables
            .read()
            .attempts
            .iter()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect()
    }

    pub(super) fn get_settings(&self, user_id: &str, language_id: &str) -> Option<ReviewSettings> {
        self.tables
            .read()
            .settings
            .get(&(user_id.to_string(), language_id.to_string()))
            .cloned()
    }

    pub(super) fn upsert_settings(&self, settings: &ReviewSettings) -> ReviewSettings {
        let key = (settings.user_id.clone(), settings.language_id.clone());
        self.tables.write().settings.insert(key, settings.clone());
        settings.clone()
    }

    pub(super) fn get_item(&self, domain: Domain, item_id: &str) -> Option<ReviewableItem> {
        self.tables
            .read()
            .items
            .get(item_id)
            .filter(|item| item.domain == domain)
            .cloned()
    }

    pub(super) fn get_items(&self, domain: Domain, ids: &[String]) -> Vec<ReviewableItem> {
        let tables = self.tables.read();
        ids.iter()
            .filter_map(|id| tables.items.get(id))
            .filter(|item| item.domain == domain)
            .cloned()
            .collect()
    }

    pub(super) fn list_new_items(
        &self,
        user_id: &str,
        language_id: &str,
        domain: Domain,
        limit: usize,
    ) -> Vec<ReviewableItem> {
        let tables = self.tables.read();
        let mut fresh: Vec<&ReviewableItem> = tables
            .items
            .values()
            .filter(|item| item.active && item.domain == domain && item.language_id == language_id)
            .filter(|item| {
                tables
                    .states
                    .get(&(user_id.to_string(), domain, item.id.clone()))
                    .map_or(true, |record| record.state.is_unscheduled())
            })
            .collect();
        fresh.sort_by(|a, b| {
            a.difficulty
                .cmp(&b.difficulty)
                .then_with(|| a.natural_key.cmp(&b.natural_key))
        });
        fresh.into_iter().take(limit).cloned().collect()
    }

    pub(super) fn find_lexeme_by_lemma(&self, language_id: &str, lemma: &str) -> Option<ReviewableItem> {
        let wanted = normalize_word(lemma);
        let tables = self.tables.read();
        let mut matches: Vec<&ReviewableItem> = tables
            .items
            .values()
            .filter(|item| {
                item.active
                    && item.domain == Domain::Vocabulary
                    && item.language_id == language_id
                    && normalize_word(&item.natural_key) == wanted
            })
            .collect();
        matches.sort_by(|a, b| a.id.cmp(&b.id));
        matches.first().map(|item| (*item).clone())
    }

    pub(super) fn list_due_states(
        &self,
        user_id: &str,
        language_id: &str,
        domain: Domain,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Vec<StateRecord> {
        let tables = self.tables.read();
        let mut due: Vec<&StateRecord> = tables
            .states
            .values()
            .filter(|s| s.user_id == user_id && s.domain == domain && s.state.is_due(now))
            .filter(|s| {
                tables
                    .items
                    .get(&s.item_id)
                    .is_some_and(|item| item.active && item.language_id == language_id)
            })
            .collect();
        due.sort_by(|a, b| {
            a.state
                .next_review_at
                .cmp(&b.state.next_review_at)
                .then_with(|| a.updated_at.cmp(&b.updated_at))
        });
        due.into_iter().take(limit).cloned().collect()
    }

    pub(super) fn get_state(&self, user_id: &str, domain: Domain, item_id: &str) -> Option<StateRecord> {
        self.tables
            .read()
            .states
            .get(&(user_id.to_string(), domain, item_id.to_string()))
            .cloned()
    }

    pub(super) fn insert_state_if_absent(&self, record: StateRecord) -> StateRecord {
        let key = (record.user_id.clone(), record.domain, record.item_id.clone());
        self.tables
            .write()
            .states
            .entry(key)
            .or_insert(record)
            .clone()
    }

    pub(super) fn save_state(&self, record: &StateRecord) {
        let key = (record.user_id.clone(), record.domain, record.item_id.clone());
        self.tables.write().states.insert(key, record.clone());
    }

    pub(super) fn record_review(&self, state: Option<&StateRecord>, attempt: &ReviewAttempt) {
        let mut tables = self.tables.write();
        if let Some(record) = state {
            let key = (record.user_id.clone(), record.domain, record.item_id.clone());
            tables.states.insert(key, record.clone());
        }
        tables.attempts.push(attempt.clone());
    }

    pub(super) fn review_stats(
        &self,
        user_id: &str,
        language_id: &str,
        domain: Domain,
        now: DateTime<Utc>,
    ) -> ReviewStats {
        let tables = self.tables.read();
        let mut stats = ReviewStats::default();
        let mut familiarity_sum = 0i64;
        let mut count = 0i64;

        for record in tables.states.values() {
            if record.user_id != user_id || record.domain != domain {
                continue;
            }
            let in_language = tables
                .items
                .get(&record.item_id)
                .is_some_and(|item| item.language_id == language_id);
            if !in_language {
                continue;
            }
            count += 1;
            familiarity_sum += i64::from(record.state.familiarity);
            if record.state.is_due(now) {
                stats.due_now += 1;
            }
            if record.state.next_review_at.is_some() {
                stats.scheduled_total += 1;
            }
            match record.state.mastery {
                Mastery::Mastered => stats.mastered += 1,
                Mastery::Learning => stats.learning += 1,
                _ => {}
            }
        }

        if count > 0 {
            stats.avg_familiarity = familiarity_sum as f64 / count as f64;
        }

        let since = now - Duration::days(7);
        stats.reviewed_7d = tables
            .attempts
            .iter()
            .filter(|a| {
                a.user_id == user_id
                    && a.language_id == language_id
                    && a.domain == domain
                    && a.created_at >= since
            })
            .count() as i64;

        stats
    }

    #[allow(clippy::too_many_arguments)]
    pub(super) fn upsert_word_error(
        &self,
        user_id: &str,
        lexeme_id: &str,
        error_type: WordErrorType,
        source: WordErrorSource,
        severity: Severity,
        evidence: Value,
        now: DateTime<Utc>,
    ) -> UserWordError {
        let key = (user_id.to_string(), lexeme_id.to_string(), error_type);
        let mut tables = self.tables.write();
        let entry = tables
            .word_errors
            .entry(key)
            .and_modify(|existing| {
                existing.occur_count += 1;
                existing.source = source;
                existing.severity = severity;
                existing.last_occurred_at = now;
                existing.evidence = evidence.clone();
            })
            .or_insert_with(|| UserWordError {
                id: uuid::Uuid::new_v4().to_string(),
                user_id: user_id.to_string(),
                lexeme_id: lexeme_id.to_string(),
                error_type,
                source,
                severity,
                occur_count: 1,
                last_occurred_at: now,
                evidence: evidence.clone(),
            });
        entry.clone()
    }

    pub(super) fn list_weak_words(&self, user_id: &str, language_id: &str, limit: usize) -> Vec<WeakWord> {
        let tables = self.tables.read();
        let mut rows: Vec<WeakWord> = tables
            .word_errors
            .values()
            .filter(|e| e.user_id == user_id)
            .filter_map(|e| {
                let item = tables.items.get(&e.lexeme_id)?;
                if item.language_id != language_id {
                    return None;
                }
                Some(WeakWord {
                    lexeme_id: e.lexeme_id.clone(),
                    lemma: item.natural_key.clone(),
                    error_type: e.error_type,
                    severity: e.severity,
                    occur_count: e.occur_count,
                    last_occurred_at: e.last_occurred_at,
                    evidence: e.evidence.clone(),
                })
            })
            .collect();
        rows.sort_by(|a, b| {
            b.last_occurred_at
                .cmp(&a.last_occurred_at)
                .then_with(|| b.occur_count.cmp(&a.occur_count))
        });
        rows.truncate(limit);
        rows
    }

    pub(super) fn word_errors_for(&self, user_id: &str, lexeme_ids: &[String]) -> Vec<UserWordError> {
        let tables = self.tables.read();
        let mut rows: Vec<UserWordError> = tables
            .word_errors
            .values()
            .filter(|e| e.user_id == user_id && lexeme_ids.contains(&e.lexeme_id))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.last_occurred_at.cmp(&a.last_occurred_at));
        rows
    }

    pub(super) fn get_speaking_task(&self, task_id: &str) -> Option<SpeakingTask> {
        self.tables.read().tasks.get(task_id).cloned()
    }

    pub(super) fn insert_speaking_attempt(&self, attempt: &SpeakingAttempt) -> bool {
        let mut tables = self.tables.write();
        if tables.speaking.contains_key(&attempt.id) {
            return false;
        }
        tables.speaking.insert(attempt.id.clone(), attempt.clone());
        true
    }

    pub(super) fn get_speaking_attempt(&self, attempt_id: &str) -> Option<SpeakingAttempt> {
        self.tables.read().speaking.get(attempt_id).cloned()
    }

    pub(super) fn update_attempt_if(&self, attempt: &SpeakingAttempt, expected: AttemptStatus) -> bool {
        let mut tables = self.tables.write();
        match tables.speaking.get_mut(&attempt.id) {
            Some(current) if current.status == expected => {
                *current = attempt.clone();
                true
            }
            _ => false,
        }
    }

    pub(super) fn complete_attempt(
        &self,
        attempt_id: &str,
        completion: &AttemptCompletion,
        now: DateTime<Utc>,
    ) -> Option<SpeakingAttempt> {
        let mut tables = self.tables.write();
        let current = tables.speaking.get_mut(attempt_id)?;
        match completion {
            AttemptCompletion::Scored {
                score_percent,
                ai_result,
            } => {
                if !current.accepts_result() {
                    return None;
                }
                current.status = AttemptStatus::Scored;
                current.score_percent = Some(*score_percent);
                current.ai_result = Some(ai_result.clone());
                current.error = None;
            }
            AttemptCompletion::Failed { error } => {
                if matches!(current.status, AttemptStatus::Scored | AttemptStatus::Started) {
                    return None;
                }
                current.status = AttemptStatus::Failed;
                current.error = Some(error.clone());
            }
        }
        current.updated_at = now;
        Some(current.clone())
    }

    pub(super) fn list_stale_attempts(&self, cutoff: DateTime<Utc>, limit: usize) -> Vec<SpeakingAttempt> {
        let tables = self.tables.read();
        let mut stale: Vec<&SpeakingAttempt> = tables
            .speaking
            .values()
            .filter(|a| {
                let awaiting = match a.status {
                    AttemptStatus::Submitted | AttemptStatus::PendingAi => true,
                    AttemptStatus::Failed => a.error.as_ref().is_some_and(|e| e.retryable),
                    AttemptStatus::Started | AttemptStatus::Scored => false,
                };
                awaiting && a.updated_at < cutoff
            })
            .collect();
        stale.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        stale.into_iter().take(limit).cloned().collect()
    }
}
