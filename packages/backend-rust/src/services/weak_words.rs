use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use crate::services::srs::apply_weak_spot_penalty;
use crate::store::{
    Domain, ReviewStore, Severity, StoreError, WeakWord, WordErrorSource, WordErrorType,
    WordFeedback,
};

pub const DEFAULT_LIST_LIMIT: usize = 50;
pub const MAX_LIST_LIMIT: usize = 200;

#[derive(Debug, Error)]
pub enum WeakWordError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestSummary {
    /// BAD words matched to a lexeme and recorded.
    pub matched: usize,
    /// BAD words with no matching lexeme.
    pub skipped: usize,
    /// Words below the ingestion threshold.
    pub ignored: usize,
}

fn word_filter() -> &'static Regex {
    static FILTER: OnceLock<Regex> = OnceLock::new();
    FILTER.get_or_init(|| {
        Regex::new(r"[^\p{L}\p{N}'\u{2019}\-\u{2010}\u{2011}\u{2013}\u{2014}]+")
            .expect("valid word filter regex")
    })
}

/// Reduces a provider-reported token to the form lemmas are matched on.
pub fn normalize_word(raw: &str) -> String {
    let cleaned = word_filter().replace_all(raw, "");
    cleaned
        .to_lowercase()
        .chars()
        .map(|c| match c {
            '\u{2019}' => '\'',
            '\u{2010}' | '\u{2011}' | '\u{2013}' | '\u{2014}' => '-',
            other => other,
        })
        .collect::<String>()
        .trim_matches(|c| c == '\'' || c == '-')
        .to_string()
}

pub async fn ingest_word_feedback(
    store: &ReviewStore,
    user_id: &str,
    language_id: &str,
    feedback: &[WordFeedback],
    source: WordErrorSource,
    error_type: WordErrorType,
    now: DateTime<Utc>,
) -> Result<IngestSummary, WeakWordError> {
    let mut summary = IngestSummary::default();

    for entry in feedback {
        if Severity::parse_lenient(&entry.severity) != Severity::Bad {
            summary.ignored += 1;
            continue;
        }

        let lemma = normalize_word(&entry.word);
        if lemma.is_empty() {
            summary.skipped += 1;
            continue;
        }

        let Some(lexeme) = store.find_lexeme_by_lemma(language_id, &lemma).await? else {
            tracing::debug!(word = %entry.word, language_id, "no lexeme for flagged word");
            summary.skipped += 1;
            continue;
        };

        let evidence = json!({
            "word": entry.word,
            "startMs": entry.start_ms,
            "endMs": entry.end_ms,
            "issue": entry.issue,
            "suggestion": entry.suggestion,
        });
        store
            .upsert_word_error(
                user_id,
                &lexeme.id,
                error_type,
                source,
                Severity::Bad,
                evidence,
                now,
            )
            .await?;

        let mut record = store
            .get_or_create_state(user_id, Domain::Vocabulary, &lexeme.id, now)
            .await?;
        record.state = apply_weak_spot_penalty(&record.state, now);
        record.last_source = Some(source.as_str().to_string());
        record.updated_at = now;
        store.save_state(&record).await?;

        summary.matched += 1;
    }

    Ok(summary)
}

pub async fn list_weak_words(
    store: &ReviewStore,
    user_id: &str,
    language_id: &str,
    limit: Option<usize>,
) -> Result<Vec<WeakWord>, WeakWordError> {
    let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT);
    if limit == 0 || limit > MAX_LIST_LIMIT {
        return Err(WeakWordError::Validation(format!(
            "limit must be between 1 and {MAX_LIST_LIMIT}"
        )));
    }
    Ok(store.list_weak_words(user_id, language_id, limit).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::srs::Mastery;
    use crate::store::{ItemContent, LexemeContent, ReviewableItem};
    use chrono::{Duration, TimeZone};

    fn lexeme(id: &str, lemma: &str) -> ReviewableItem {
        ReviewableItem {
            id: id.to_string(),
            domain: Domain::Vocabulary,
            language_id: "en".to_string(),
            natural_key: lemma.to_string(),
            difficulty: 1,
            active: true,
            content: ItemContent::Lexeme(LexemeContent {
                lemma: lemma.to_string(),
                definition: None,
                translations: Vec::new(),
                part_of_speech: None,
                examples: Vec::new(),
                audio_url: None,
                phonetic: None,
            }),
        }
    }

    fn feedback(word: &str, severity: &str) -> WordFeedback {
        WordFeedback {
            word: word.to_string(),
            severity: severity.to_string(),
            start_ms: Some(100),
            end_ms: Some(400),
            issue: Some("vowel".to_string()),
            suggestion: None,
        }
    }

    #[test]
    fn test_normalize_word() {
        assert_eq!(normalize_word("Hello,"), "hello");
        assert_eq!(normalize_word("Don\u{2019}t!"), "don't");
        assert_eq!(normalize_word("well\u{2013}known"), "well-known");
        assert_eq!(normalize_word("Café"), "café");
        assert_eq!(normalize_word("\"...\""), "");
    }

    #[tokio::test]
    async fn test_ingest_penalises_matched_bad_words_only() {
        let (store, memory) = ReviewStore::memory();
        memory.insert_item(lexeme("lx-receive", "receive"));
        memory.insert_item(lexeme("lx-table", "table"));
        let now = Utc.with_ymd_and_hms(2026, 5, 1, 8, 0, 0).unwrap();

        let words = vec![
            feedback("Receive.", "BAD"),
            feedback("recieve", "BAD"),
            feedback("table", "OK"),
            feedback("table", "meh"),
        ];
        let summary = ingest_word_feedback(
            &store,
            "u1",
            "en",
            &words,
            WordErrorSource::Speaking,
            WordErrorType::Pronunciation,
            now,
        )
        .await
        .unwrap();

        assert_eq!(summary, IngestSummary { matched: 1, skipped: 1, ignored: 2 });

        let state = store
            .get_state("u1", Domain::Vocabulary, "lx-receive")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.state.mastery, Mastery::Learning);
        assert_eq!(state.state.familiarity, 0);
        assert_eq!(state.state.next_review_at, Some(now + Duration::hours(12)));
        assert_eq!(state.last_source.as_deref(), Some("SPEAKING"));

        assert!(store
            .get_state("u1", Domain::Vocabulary, "lx-table")
            .await
            .unwrap()
            .is_none());

        let listed = list_weak_words(&store, "u1", "en", None).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].lemma, "receive");
        assert_eq!(listed[0].occur_count, 1);
        assert_eq!(listed[0].evidence["word"], "Receive.");
    }

    #[tokio::test]
    async fn test_repeat_ingest_increments_occurrences() {
        let (store, memory) = ReviewStore::memory();
        memory.insert_item(lexeme("lx-1", "through"));
        let now = Utc::now();

        for _ in 0..2 {
            ingest_word_feedback(
                &store,
                "u1",
                "en",
                &[feedback("through", "bad")],
                WordErrorSource::Speaking,
                WordErrorType::Pronunciation,
                now,
            )
            .await
            .unwrap();
        }

        let listed = list_weak_words(&store, "u1", "en", Some(10)).await.unwrap();
        assert_eq!(listed[0].occur_count, 2);
    }

    #[tokio::test]
    async fn test_typographic_lemma_matches_plain_word() {
        let (store, memory) = ReviewStore::memory();
        memory.insert_item(lexeme("lx-dont", "Don\u{2019}t"));
        memory.insert_item(lexeme("lx-known", "well\u{2013}known"));

        let summary = ingest_word_feedback(
            &store,
            "u1",
            "en",
            &[feedback("don't", "BAD"), feedback("Well-known,", "BAD")],
            WordErrorSource::Speaking,
            WordErrorType::Pronunciation,
            Utc::now(),
        )
        .await
        .unwrap();

        assert_eq!(summary, IngestSummary { matched: 2, skipped: 0, ignored: 0 });
    }

    #[tokio::test]
    async fn test_list_limit_is_bounded() {
        let (store, _) = ReviewStore::memory();
        assert!(list_weak_words(&store, "u1", "en", Some(201)).await.is_err());
        assert!(list_weak_words(&store, "u1", "en", Some(0)).await.is_err());
        assert!(list_weak_words(&store, "u1", "en", Some(200)).await.is_ok());
    }
}
