use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::cache::keys;
use crate::core::JobQueue;
use crate::services::evaluator::{
    evaluate, missing_audio_evaluation, Answer, Evaluation, EvaluationMeta, Expected, MatchPair,
};
use crate::services::speaking::{job_for, validate_audio, SpeakingError, DEFAULT_AUDIO_MIME};
use crate::services::srs::{review, Rating, ReviewState, SchedulerError};
use crate::store::{
    AttemptOrigin, AttemptStatus, ChoiceOption, Domain, GrammarExerciseKind, ItemContent,
    LessonExercise, ReviewAttempt, ReviewMode, ReviewSettings, ReviewStats, ReviewStore,
    ReviewableItem, Severity, SpeakingAttempt, SpeakingAttemptItem, SpeakingTaskType,
    StateRecord, StoreError, WordErrorSource, WordErrorType, MAX_DAILY_LIMIT,
};

pub const MAX_SUBMIT_BATCH: usize = 200;
const MAX_WEAK_NOTES: usize = 3;
const SESSION_SOURCE: &str = "REVIEW";
const SPEECH_SOURCE: &str = "AI";
const DEFAULT_RATING_SOURCE: &str = "RATING";
const LISTENING_QUESTION: &str = "Type what you hear";

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error(transparent)]
    InvalidRating(#[from] SchedulerError),
    #[error("unknown item: {0}")]
    UnknownItem(String),
    #[error("mode {mode} is not available for {domain}")]
    UnsupportedMode { domain: &'static str, mode: &'static str },
    #[error("validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsUpdate {
    #[serde(default)]
    pub daily_new_limit: Option<i32>,
    #[serde(default)]
    pub daily_review_limit: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChoiceView {
    pub key: String,
    pub text: String,
}

impl From<&ChoiceOption> for ChoiceView {
    fn from(option: &ChoiceOption) -> Self {
        Self {
            key: option.key.clone(),
            text: option.text.clone(),
        }
    }
}

fn choice_views(options: &[ChoiceOption]) -> Vec<ChoiceView> {
    options.iter().map(ChoiceView::from).collect()
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LessonPrompt {
    Mcq {
        choices: Vec<ChoiceView>,
    },
    #[serde(rename_all = "camelCase")]
    Listen {
        audio_url: Option<String>,
        choices: Vec<ChoiceView>,
    },
    Cloze {
        sentence: String,
    },
    Reorder {
        tokens: Vec<String>,
    },
    /// Right-hand sides are sorted so their order says nothing about the
    /// pairing.
    Match {
        left: Vec<String>,
        right: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Speak {
        reference_text: String,
    },
}

/// What the client may see for an item. Never carries the answer key.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Prompt {
    #[serde(rename_all = "camelCase")]
    Flashcard {
        front: String,
        definition: Option<String>,
        translations: Vec<String>,
        example: Option<String>,
        phonetic: Option<String>,
        audio_url: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Typing {
        definition: Option<String>,
        translations: Vec<String>,
        part_of_speech: Option<String>,
        letter_count: usize,
        audio_url: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Listening {
        audio_url: Option<String>,
        question: String,
        definition: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Shadowing {
        reference_text: String,
        audio_url: Option<String>,
    },
    Exercise {
        title: String,
        explanation: Option<String>,
        kind: GrammarExerciseKind,
        prompt: String,
        choices: Vec<ChoiceView>,
        tokens: Vec<String>,
    },
    ReadOnly {
        title: String,
        explanation: Option<String>,
        examples: Vec<String>,
    },
    Lesson {
        prompt: Option<String>,
        exercise: LessonPrompt,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeakNote {
    pub error_type: WordErrorType,
    pub source: WordErrorSource,
    pub severity: Severity,
    pub occur_count: i32,
    pub last_occurred_at: DateTime<Utc>,
    pub evidence: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionItem {
    pub item_id: String,
    pub domain: Domain,
    pub mode: ReviewMode,
    pub state: ReviewState,
    pub prompt: Prompt,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub weak_notes: Vec<WeakNote>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewSession {
    pub session_id: String,
    pub language_id: String,
    pub domain: Domain,
    pub mode: ReviewMode,
    pub due_count: usize,
    pub new_count: usize,
    pub items: Vec<SessionItem>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAnswer {
    pub item_id: String,
    #[serde(default)]
    pub answer: Option<Answer>,
    #[serde(default)]
    pub audio_base64: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSubmission {
    pub language_id: String,
    pub domain: Domain,
    #[serde(default)]
    pub mode: Option<ReviewMode>,
    pub answers: Vec<SessionAnswer>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemResult {
    pub item_id: String,
    pub mode: ReviewMode,
    pub is_correct: bool,
    pub score_percent: u8,
    pub rating: u8,
    /// True while an AI score is outstanding. The state shown is the one
    /// before scoring.
    pub pending: bool,
    pub meta: EvaluationMeta,
    pub state: Option<ReviewState>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RatingInput {
    pub item_id: String,
    pub rating: i64,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RatedItem {
    pub item_id: String,
    pub rating: u8,
    pub state: ReviewState,
}

/// How an item is graded in a given mode.
#[derive(Debug, Clone, PartialEq)]
enum Grading {
    Inline(Expected),
    Speech {
        reference_text: String,
        task_type: SpeakingTaskType,
    },
}

fn resolve_mode(domain: Domain, mode: Option<ReviewMode>) -> Result<ReviewMode, ReviewError> {
    let mode = mode.unwrap_or_else(|| domain.default_mode());
    if !domain.supports(mode) {
        return Err(ReviewError::UnsupportedMode {
            domain: domain.as_str(),
            mode: mode.as_str(),
        });
    }
    Ok(mode)
}

fn mismatched(item: &ReviewableItem, mode: ReviewMode) -> ReviewError {
    ReviewError::Validation(format!(
        "item {} cannot be reviewed in {} mode",
        item.id,
        mode.as_str()
    ))
}

fn correct_keys(options: &[ChoiceOption]) -> BTreeSet<String> {
    options
        .iter()
        .filter(|option| option.is_correct)
        .map(|option| option.key.clone())
        .collect()
}

fn string_sequence(value: &Value) -> Option<Vec<String>> {
    value
        .as_array()?
        .iter()
        .map(|token| token.as_str().map(str::to_string))
        .collect()
}

/// Builds the answer key from stored content only.
fn grading_for(item: &ReviewableItem, mode: ReviewMode) -> Result<Grading, ReviewError> {
    let grading = match (&item.content, mode) {
        (ItemContent::Lexeme(_), ReviewMode::Flashcard) => Grading::Inline(Expected::Flashcard),
        (ItemContent::Lexeme(lexeme), ReviewMode::Typing) => Grading::Inline(Expected::Typing {
            target: lexeme.lemma.clone(),
        }),
        (ItemContent::Lexeme(lexeme), ReviewMode::Listening) => {
            Grading::Inline(Expected::Listening {
                target: lexeme.lemma.clone(),
            })
        }
        (ItemContent::Lexeme(lexeme), ReviewMode::Shadowing) => Grading::Speech {
            reference_text: lexeme.lemma.clone(),
            task_type: SpeakingTaskType::Repeat,
        },
        (ItemContent::Grammar(grammar), ReviewMode::Exercise) => {
            let Some(exercise) = &grammar.exercise else {
                return Ok(Grading::Inline(Expected::ReadOnly));
            };
            match (exercise.kind, &exercise.answer) {
                (GrammarExerciseKind::Mcq, _) => Grading::Inline(Expected::Choice {
                    correct_keys: correct_keys(&exercise.choices),
                }),
                (GrammarExerciseKind::Reorder, Some(answer)) => match string_sequence(answer) {
                    Some(sequence) => Grading::Inline(Expected::Reorder { sequence }),
                    None => Grading::Inline(Expected::Structured {
                        value: answer.clone(),
                    }),
                },
                (_, Some(answer)) => Grading::Inline(Expected::Structured {
                    value: answer.clone(),
                }),
                (_, None) => Grading::Inline(Expected::ReadOnly),
            }
        }
        (ItemContent::Lesson(lesson), ReviewMode::Lesson) => match &lesson.exercise {
            LessonExercise::Mcq { choices } | LessonExercise::Listen { choices, .. } => {
                Grading::Inline(Expected::Choice {
                    correct_keys: correct_keys(choices),
                })
            }
            LessonExercise::Cloze { answers, .. } => Grading::Inline(Expected::Cloze {
                accepted: answers.clone(),
            }),
            LessonExercise::Reorder { answer, .. } => Grading::Inline(Expected::Reorder {
                sequence: answer.clone(),
            }),
            LessonExercise::Match { pairs } => Grading::Inline(Expected::Match {
                pairs: pairs.clone(),
            }),
            LessonExercise::Speak { reference_text } => Grading::Speech {
                reference_text: reference_text.clone(),
                task_type: SpeakingTaskType::ReadAloud,
            },
        },
        _ => return Err(mismatched(item, mode)),
    };
    Ok(grading)
}

fn lesson_prompt(exercise: &LessonExercise) -> LessonPrompt {
    match exercise {
        LessonExercise::Mcq { choices } => LessonPrompt::Mcq {
            choices: choice_views(choices),
        },
        LessonExercise::Listen { audio_url, choices } => LessonPrompt::Listen {
            audio_url: audio_url.clone(),
            choices: choice_views(choices),
        },
        LessonExercise::Cloze { sentence, .. } => LessonPrompt::Cloze {
            sentence: sentence.clone(),
        },
        LessonExercise::Reorder { tokens, .. } => LessonPrompt::Reorder {
            tokens: tokens.clone(),
        },
        LessonExercise::Match { pairs } => {
            let mut right: Vec<String> = pairs.iter().map(|p: &MatchPair| p.right.clone()).collect();
            right.sort();
            LessonPrompt::Match {
                left: pairs.iter().map(|p| p.left.clone()).collect(),
                right,
            }
        }
        LessonExercise::Speak { reference_text } => LessonPrompt::Speak {
            reference_text: reference_text.clone(),
        },
    }
}

fn prompt_for(item: &ReviewableItem, mode: ReviewMode) -> Result<Prompt, ReviewError> {
    let prompt = match (&item.content, mode) {
        (ItemContent::Lexeme(lexeme), ReviewMode::Flashcard) => Prompt::Flashcard {
            front: lexeme.lemma.clone(),
            definition: lexeme.definition.clone(),
            translations: lexeme.translations.clone(),
            example: lexeme.examples.first().cloned(),
            phonetic: lexeme.phonetic.clone(),
            audio_url: lexeme.audio_url.clone(),
        },
        (ItemContent::Lexeme(lexeme), ReviewMode::Typing) => Prompt::Typing {
            definition: lexeme.definition.clone(),
            translations: lexeme.translations.clone(),
            part_of_speech: lexeme.part_of_speech.clone(),
            letter_count: lexeme.lemma.chars().count(),
            audio_url: lexeme.audio_url.clone(),
        },
        (ItemContent::Lexeme(lexeme), ReviewMode::Listening) => Prompt::Listening {
            audio_url: lexeme.audio_url.clone(),
            question: LISTENING_QUESTION.to_string(),
            definition: lexeme.definition.clone(),
        },
        (ItemContent::Lexeme(lexeme), ReviewMode::Shadowing) => Prompt::Shadowing {
            reference_text: lexeme.lemma.clone(),
            audio_url: lexeme.audio_url.clone(),
        },
        (ItemContent::Grammar(grammar), ReviewMode::Exercise) => match &grammar.exercise {
            Some(exercise) => Prompt::Exercise {
                title: grammar.title.clone(),
                explanation: grammar.explanation.clone(),
                kind: exercise.kind,
                prompt: exercise.prompt.clone(),
                choices: choice_views(&exercise.choices),
                tokens: exercise.tokens.clone(),
            },
            None => Prompt::ReadOnly {
                title: grammar.title.clone(),
                explanation: grammar.explanation.clone(),
                examples: grammar.examples.clone(),
            },
        },
        (ItemContent::Lesson(lesson), ReviewMode::Lesson) => Prompt::Lesson {
            prompt: lesson.prompt.clone(),
            exercise: lesson_prompt(&lesson.exercise),
        },
        _ => return Err(mismatched(item, mode)),
    };
    Ok(prompt)
}

pub async fn get_or_create_settings(
    store: &ReviewStore,
    user_id: &str,
    language_id: &str,
    now: DateTime<Utc>,
) -> Result<ReviewSettings, ReviewError> {
    if let Some(settings) = store.get_settings(user_id, language_id).await? {
        return Ok(settings);
    }
    let defaults = ReviewSettings::defaults(user_id, language_id, now);
    Ok(store.upsert_settings(&defaults).await?)
}

fn check_limit(name: &str, value: i32) -> Result<i32, ReviewError> {
    if !(0..=MAX_DAILY_LIMIT).contains(&value) {
        return Err(ReviewError::Validation(format!(
            "{name} must be between 0 and {MAX_DAILY_LIMIT}"
        )));
    }
    Ok(value)
}

pub async fn update_settings(
    store: &ReviewStore,
    user_id: &str,
    language_id: &str,
    update: SettingsUpdate,
    now: DateTime<Utc>,
) -> Result<ReviewSettings, ReviewError> {
    let mut settings = get_or_create_settings(store, user_id, language_id, now).await?;
    if let Some(value) = update.daily_new_limit {
        settings.daily_new_limit = check_limit("dailyNewLimit", value)?;
    }
    if let Some(value) = update.daily_review_limit {
        settings.daily_review_limit = check_limit("dailyReviewLimit", value)?;
    }
    settings.updated_at = now;
    Ok(store.upsert_settings(&settings).await?)
}

async fn weak_notes_by_lexeme(
    store: &ReviewStore,
    user_id: &str,
    lexeme_ids: &[String],
) -> Result<HashMap<String, Vec<WeakNote>>, ReviewError> {
    let mut notes: HashMap<String, Vec<WeakNote>> = HashMap::new();
    if lexeme_ids.is_empty() {
        return Ok(notes);
    }
    for error in store.word_errors_for(user_id, lexeme_ids).await? {
        let entry = notes.entry(error.lexeme_id.clone()).or_default();
        if entry.len() < MAX_WEAK_NOTES {
            entry.push(WeakNote {
                error_type: error.error_type,
                source: error.source,
                severity: error.severity,
                occur_count: error.occur_count,
                last_occurred_at: error.last_occurred_at,
                evidence: error.evidence,
            });
        }
    }
    Ok(notes)
}

/// Due items first, then never-seen items up to the daily new limit. New
/// items get their state row created here so an abandoned session still
/// leaves consistent state behind.
pub async fn build_session(
    store: &ReviewStore,
    user_id: &str,
    language_id: &str,
    domain: Domain,
    mode: Option<ReviewMode>,
    limit: Option<usize>,
    now: DateTime<Utc>,
) -> Result<ReviewSession, ReviewError> {
    let mode = resolve_mode(domain, mode)?;
    let settings = get_or_create_settings(store, user_id, language_id, now).await?;
    let review_limit = settings.daily_review_limit.max(0) as usize;
    let new_limit = settings.daily_new_limit.max(0) as usize;

    let cap = match limit {
        Some(0) => return Err(ReviewError::Validation("limit must be positive".to_string())),
        Some(value) => value.min(MAX_DAILY_LIMIT as usize),
        None => review_limit,
    };

    let due = store
        .list_due_states(user_id, language_id, domain, now, cap.min(review_limit))
        .await?;
    let due_ids: Vec<String> = due.iter().map(|record| record.item_id.clone()).collect();
    let due_items: HashMap<String, ReviewableItem> = store
        .get_items(domain, &due_ids)
        .await?
        .into_iter()
        .map(|item| (item.id.clone(), item))
        .collect();

    let mut selected: Vec<(ReviewableItem, StateRecord)> = due
        .into_iter()
        .filter_map(|record| {
            let item = due_items.get(&record.item_id)?.clone();
            Some((item, record))
        })
        .collect();
    let due_count = selected.len();

    let room = cap.saturating_sub(due_count).min(new_limit);
    for item in store.list_new_items(user_id, language_id, domain, room).await? {
        let record = store
            .insert_state_if_absent(StateRecord::fresh(user_id, domain, &item.id, now))
            .await?;
        selected.push((item, record));
    }
    let new_count = selected.len() - due_count;

    let mut notes = if domain == Domain::Vocabulary {
        let ids: Vec<String> = selected.iter().map(|(item, _)| item.id.clone()).collect();
        weak_notes_by_lexeme(store, user_id, &ids).await?
    } else {
        HashMap::new()
    };

    let mut items = Vec::with_capacity(selected.len());
    for (item, record) in selected {
        let prompt = match prompt_for(&item, mode) {
            Ok(prompt) => prompt,
            Err(err) => {
                tracing::warn!(item_id = %item.id, error = %err, "item skipped from session");
                continue;
            }
        };
        items.push(SessionItem {
            weak_notes: notes.remove(&item.id).unwrap_or_default(),
            item_id: item.id,
            domain,
            mode,
            state: record.state,
            prompt,
        });
    }

    let session = ReviewSession {
        session_id: Uuid::new_v4().to_string(),
        language_id: language_id.to_string(),
        domain,
        mode,
        due_count,
        new_count,
        items,
    };
    tracing::debug!(
        session_id = %session.session_id,
        user_id,
        domain = domain.as_str(),
        due_count,
        new_count,
        "review session built"
    );
    Ok(session)
}

/// Loads the submitted items, rejecting anything outside the user's
/// language and domain before a single write happens.
async fn load_items(
    store: &ReviewStore,
    language_id: &str,
    domain: Domain,
    item_ids: &[String],
) -> Result<HashMap<String, ReviewableItem>, ReviewError> {
    if item_ids.is_empty() {
        return Err(ReviewError::Validation("no items submitted".to_string()));
    }
    if item_ids.len() > MAX_SUBMIT_BATCH {
        return Err(ReviewError::Validation(format!(
            "at most {MAX_SUBMIT_BATCH} items per submission"
        )));
    }
    let mut seen = HashSet::new();
    if let Some(duplicate) = item_ids.iter().find(|id| !seen.insert(id.as_str())) {
        return Err(ReviewError::Validation(format!(
            "item {duplicate} submitted more than once"
        )));
    }

    let items: HashMap<String, ReviewableItem> = store
        .get_items(domain, item_ids)
        .await?
        .into_iter()
        .filter(|item| item.active && item.language_id == language_id)
        .map(|item| (item.id.clone(), item))
        .collect();
    if let Some(missing) = item_ids.iter().find(|id| !items.contains_key(*id)) {
        return Err(ReviewError::UnknownItem(missing.clone()));
    }
    Ok(items)
}

struct Outcome<'a> {
    language_id: &'a str,
    session_id: Option<&'a str>,
    mode: ReviewMode,
    source: &'a str,
    user_answer: Option<Value>,
    expected: Option<String>,
}

/// Schedules one graded answer and logs it with the new state.
async fn apply_evaluation(
    store: &ReviewStore,
    user_id: &str,
    domain: Domain,
    item_id: &str,
    evaluation: &Evaluation,
    outcome: Outcome<'_>,
    now: DateTime<Utc>,
) -> Result<StateRecord, ReviewError> {
    let mut record = store.get_or_create_state(user_id, domain, item_id, now).await?;
    review(&mut record, evaluation.rating, now);
    record.last_source = Some(outcome.source.to_string());
    record.updated_at = now;

    let attempt = ReviewAttempt {
        id: Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        language_id: outcome.language_id.to_string(),
        domain,
        item_id: item_id.to_string(),
        session_id: outcome.session_id.map(str::to_string),
        mode: outcome.mode,
        is_correct: evaluation.is_correct,
        score_percent: evaluation.score_percent,
        rating: evaluation.rating.value(),
        user_answer: outcome.user_answer,
        expected: outcome.expected,
        meta: serde_json::to_value(&evaluation.meta).map_err(StoreError::from)?,
        created_at: now,
    };
    store.record_review(Some(&record), &attempt).await?;
    Ok(record)
}

/// Creates (once) the review-origin speaking attempt and queues it. A queue
/// failure leaves the attempt SUBMITTED for the stale sweeper.
#[allow(clippy::too_many_arguments)]
async fn queue_speech_answer(
    store: &ReviewStore,
    queue: &JobQueue,
    user_id: &str,
    language_id: &str,
    session_id: &str,
    item: &ReviewableItem,
    mode: ReviewMode,
    reference_text: &str,
    task_type: SpeakingTaskType,
    audio_base64: String,
    mime_type: Option<String>,
    strictness: u8,
    now: DateTime<Utc>,
) -> Result<String, ReviewError> {
    let attempt = SpeakingAttempt {
        id: keys::review_speech_attempt_id(session_id, &item.id),
        user_id: user_id.to_string(),
        language_id: language_id.to_string(),
        task_type,
        origin: AttemptOrigin::ReviewItem {
            domain: item.domain,
            item_id: item.id.clone(),
            session_id: session_id.to_string(),
            mode,
        },
        status: AttemptStatus::Submitted,
        strictness,
        duration_sec: None,
        items: vec![SpeakingAttemptItem {
            id: item.id.clone(),
            prompt_text: None,
            reference_text: Some(reference_text.to_string()),
            audio_base64: Some(audio_base64),
            audio_mime: Some(mime_type.unwrap_or_else(|| DEFAULT_AUDIO_MIME.to_string())),
            duration_ms: None,
        }],
        score_percent: None,
        ai_result: None,
        error: None,
        created_at: now,
        submitted_at: Some(now),
        updated_at: now,
    };

    if !store.insert_speaking_attempt(&attempt).await? {
        tracing::debug!(attempt_id = %attempt.id, "speech answer already submitted");
        return Ok(attempt.id);
    }

    match queue.enqueue(&job_for(&attempt)).await {
        Ok(()) => {
            let mut pending = attempt.clone();
            pending.status = AttemptStatus::PendingAi;
            store.update_attempt_if(&pending, AttemptStatus::Submitted).await?;
        }
        Err(err) => {
            tracing::warn!(attempt_id = %attempt.id, error = %err, "speech answer not queued, left for sweeper");
        }
    }
    Ok(attempt.id)
}

fn audio_from(answer: &SessionAnswer) -> Result<Option<String>, ReviewError> {
    let Some(raw) = answer.audio_base64.as_deref().filter(|a| !a.trim().is_empty()) else {
        return Ok(None);
    };
    match validate_audio(&answer.item_id, Some(raw)) {
        Ok(encoded) => Ok(Some(encoded)),
        Err(SpeakingError::MissingAudio(_)) => Ok(None),
        Err(err) => Err(ReviewError::Validation(err.to_string())),
    }
}

/// Grades a session's answers against stored content. Speech answers are
/// handed to the AI pipeline and come back as pending placeholders.
pub async fn submit_session(
    store: &ReviewStore,
    queue: &JobQueue,
    user_id: &str,
    session_id: &str,
    submission: SessionSubmission,
    strictness: u8,
    now: DateTime<Utc>,
) -> Result<Vec<ItemResult>, ReviewError> {
    let domain = submission.domain;
    let language_id = submission.language_id.as_str();
    let mode = resolve_mode(domain, submission.mode)?;
    let ids: Vec<String> = submission
        .answers
        .iter()
        .map(|answer| answer.item_id.clone())
        .collect();
    let items = load_items(store, language_id, domain, &ids).await?;

    let mut planned = Vec::with_capacity(submission.answers.len());
    for answer in &submission.answers {
        let item = &items[&answer.item_id];
        let grading = grading_for(item, mode)?;
        let audio = match grading {
            Grading::Speech { .. } => audio_from(answer)?,
            Grading::Inline(_) => None,
        };
        planned.push((answer, item, grading, audio));
    }

    let mut results = Vec::with_capacity(planned.len());
    for (answer, item, grading, audio) in planned {
        let outcome = Outcome {
            language_id,
            session_id: Some(session_id),
            mode,
            source: SESSION_SOURCE,
            user_answer: answer
                .answer
                .as_ref()
                .and_then(|a| serde_json::to_value(a).ok()),
            expected: None,
        };

        let (evaluation, outcome) = match grading {
            Grading::Inline(expected) => {
                let evaluation = evaluate(&expected, answer.answer.as_ref());
                let outcome = Outcome {
                    expected: expected.display(),
                    ..outcome
                };
                (evaluation, outcome)
            }
            Grading::Speech {
                reference_text,
                task_type,
            } => match audio {
                Some(audio_base64) => {
                    let attempt_id = queue_speech_answer(
                        store,
                        queue,
                        user_id,
                        language_id,
                        session_id,
                        item,
                        mode,
                        &reference_text,
                        task_type,
                        audio_base64,
                        answer.mime_type.clone(),
                        strictness,
                        now,
                    )
                    .await?;
                    let current = store.get_state(user_id, domain, &item.id).await?;
                    results.push(ItemResult {
                        item_id: item.id.clone(),
                        mode,
                        is_correct: false,
                        score_percent: 0,
                        rating: 0,
                        pending: true,
                        meta: EvaluationMeta::PendingAi { attempt_id },
                        state: current.map(|record| record.state),
                    });
                    continue;
                }
                None => {
                    let outcome = Outcome {
                        expected: Some(reference_text),
                        ..outcome
                    };
                    (missing_audio_evaluation(), outcome)
                }
            },
        };

        let record = apply_evaluation(store, user_id, domain, &item.id, &evaluation, outcome, now).await?;
        results.push(ItemResult {
            item_id: item.id.clone(),
            mode,
            is_correct: evaluation.is_correct,
            score_percent: evaluation.score_percent,
            rating: evaluation.rating.value(),
            pending: false,
            meta: evaluation.meta,
            state: Some(record.state),
        });
    }

    tracing::info!(
        session_id,
        user_id,
        domain = domain.as_str(),
        submitted = results.len(),
        pending = results.iter().filter(|r| r.pending).count(),
        "review session submitted"
    );
    Ok(results)
}

/// Explicit 0..=5 ratings. One bad rating or unknown item rejects the whole
/// batch.
pub async fn submit_reviews(
    store: &ReviewStore,
    user_id: &str,
    language_id: &str,
    domain: Domain,
    inputs: Vec<RatingInput>,
    now: DateTime<Utc>,
) -> Result<Vec<RatedItem>, ReviewError> {
    let ratings = inputs
        .iter()
        .map(|input| Rating::new(input.rating))
        .collect::<Result<Vec<_>, _>>()?;
    let ids: Vec<String> = inputs.iter().map(|input| input.item_id.clone()).collect();
    load_items(store, language_id, domain, &ids).await?;

    let mut rated = Vec::with_capacity(inputs.len());
    for (input, rating) in inputs.iter().zip(ratings) {
        let evaluation = Evaluation {
            is_correct: rating.is_pass(),
            score_percent: rating.value() * 20,
            rating,
            meta: EvaluationMeta::SelfReport {
                know: rating.is_pass(),
            },
        };
        let source = input.source.as_deref().unwrap_or(DEFAULT_RATING_SOURCE);
        let outcome = Outcome {
            language_id,
            session_id: None,
            mode: ReviewMode::Rating,
            source,
            user_answer: Some(json!({ "rating": input.rating })),
            expected: None,
        };
        let record =
            apply_evaluation(store, user_id, domain, &input.item_id, &evaluation, outcome, now).await?;
        rated.push(RatedItem {
            item_id: input.item_id.clone(),
            rating: rating.value(),
            state: record.state,
        });
    }
    Ok(rated)
}

/// Feeds a scored review-origin speech attempt back into its item's
/// schedule. Attempts from standalone speaking tasks are ignored.
pub async fn apply_speech_outcome(
    store: &ReviewStore,
    attempt: &SpeakingAttempt,
    now: DateTime<Utc>,
) -> Result<Option<StateRecord>, ReviewError> {
    let AttemptOrigin::ReviewItem {
        domain,
        item_id,
        session_id,
        mode,
    } = &attempt.origin
    else {
        return Ok(None);
    };
    let (Some(score_percent), Some(result)) = (attempt.score_percent, &attempt.ai_result) else {
        return Ok(None);
    };

    let rating = Rating::from_score(score_percent);
    let scored_item = result.items.iter().find(|item| &item.item_id == item_id);
    let evaluation = Evaluation {
        is_correct: rating.is_pass(),
        score_percent,
        rating,
        meta: EvaluationMeta::Speech {
            scoring_mode: result.scoring_mode,
            pronunciation: scored_item.map_or(0, |item| item.pronunciation),
            fluency: scored_item.map_or(0, |item| item.fluency),
            accuracy: scored_item.and_then(|item| item.accuracy),
            attempt_id: attempt.id.clone(),
        },
    };
    let outcome = Outcome {
        language_id: &attempt.language_id,
        session_id: Some(session_id),
        mode: *mode,
        source: SPEECH_SOURCE,
        user_answer: scored_item
            .and_then(|item| item.transcript.as_ref())
            .map(|text| json!({ "transcript": text })),
        expected: attempt.items.first().and_then(|item| item.reference_text.clone()),
    };
    let record = apply_evaluation(store, &attempt.user_id, *domain, item_id, &evaluation, outcome, now).await?;
    Ok(Some(record))
}

pub async fn stats(
    store: &ReviewStore,
    user_id: &str,
    language_id: &str,
    domain: Domain,
    now: DateTime<Utc>,
) -> Result<ReviewStats, ReviewError> {
    Ok(store.review_stats(user_id, language_id, domain, now).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::srs::Mastery;
    use crate::store::{GrammarContent, GrammarExercise, LessonContent, LexemeContent, MemoryStore};
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, hour, 0, 0).unwrap()
    }

    fn lexeme(id: &str, lemma: &str, difficulty: i32) -> ReviewableItem {
        ReviewableItem {
            id: id.to_string(),
            domain: Domain::Vocabulary,
            language_id: "en".to_string(),
            natural_key: lemma.to_string(),
            difficulty,
            active: true,
            content: ItemContent::Lexeme(LexemeContent {
                lemma: lemma.to_string(),
                definition: Some(format!("meaning of {lemma}")),
                translations: Vec::new(),
                part_of_speech: Some("verb".to_string()),
                examples: Vec::new(),
                audio_url: None,
                phonetic: None,
            }),
        }
    }

    fn seeded() -> (ReviewStore, Arc<MemoryStore>) {
        let (store, memory) = ReviewStore::memory();
        memory.insert_item(lexeme("lx-c", "catch", 2));
        memory.insert_item(lexeme("lx-a", "apple", 1));
        memory.insert_item(lexeme("lx-b", "borrow", 1));
        (store, memory)
    }

    fn typed(item_id: &str, text: &str) -> SessionAnswer {
        SessionAnswer {
            item_id: item_id.to_string(),
            answer: Some(Answer::Text {
                text: text.to_string(),
            }),
            audio_base64: None,
            mime_type: None,
        }
    }

    #[tokio::test]
    async fn test_new_user_session_creates_states() {
        let (store, _) = seeded();
        let session = build_session(&store, "u1", "en", Domain::Vocabulary, None, None, at(9))
            .await
            .unwrap();

        assert_eq!(session.items.len(), 3);
        assert_eq!(session.new_count, 3);
        let order: Vec<&str> = session.items.iter().map(|i| i.item_id.as_str()).collect();
        assert_eq!(order, vec!["lx-a", "lx-b", "lx-c"]);
        for item in &session.items {
            assert_eq!(item.state.mastery, Mastery::New);
            assert_eq!(item.state.next_review_at, None);
            let stored = store.get_state("u1", Domain::Vocabulary, &item.item_id).await.unwrap();
            assert!(stored.is_some());
        }
    }

    #[tokio::test]
    async fn test_abandoned_session_items_are_offered_again() {
        let (store, _) = seeded();
        let first = build_session(&store, "u1", "en", Domain::Vocabulary, None, None, at(9))
            .await
            .unwrap();
        assert_eq!(first.items.len(), 3);

        let later = at(9) + Duration::days(1);
        let second = build_session(&store, "u1", "en", Domain::Vocabulary, None, None, later)
            .await
            .unwrap();
        let order: Vec<&str> = second.items.iter().map(|i| i.item_id.as_str()).collect();
        assert_eq!(order, vec!["lx-a", "lx-b", "lx-c"]);
        assert_eq!(second.new_count, 3);
        assert_eq!(second.due_count, 0);
    }

    #[tokio::test]
    async fn test_due_items_come_first_and_limits_apply() {
        let (store, _) = seeded();
        update_settings(
            &store,
            "u1",
            "en",
            SettingsUpdate {
                daily_new_limit: Some(1),
                daily_review_limit: Some(5),
            },
            at(8),
        )
        .await
        .unwrap();

        let mut record = store
            .get_or_create_state("u1", Domain::Vocabulary, "lx-c", at(8))
            .await
            .unwrap();
        record.state.next_review_at = Some(at(8));
        record.state.repetition = 1;
        store.save_state(&record).await.unwrap();

        let session = build_session(&store, "u1", "en", Domain::Vocabulary, None, None, at(9))
            .await
            .unwrap();
        let order: Vec<&str> = session.items.iter().map(|i| i.item_id.as_str()).collect();
        assert_eq!(order, vec!["lx-c", "lx-a"]);
        assert_eq!(session.due_count, 1);
        assert_eq!(session.new_count, 1);
    }

    #[tokio::test]
    async fn test_typing_prompt_hides_lemma() {
        let (store, _) = seeded();
        let session = build_session(
            &store,
            "u1",
            "en",
            Domain::Vocabulary,
            Some(ReviewMode::Typing),
            Some(1),
            at(9),
        )
        .await
        .unwrap();
        let json = serde_json::to_string(&session.items[0].prompt).unwrap();
        assert!(!json.contains("\"apple\""));
        assert!(json.contains("letterCount"));
    }

    #[tokio::test]
    async fn test_unsupported_mode_is_rejected() {
        let (store, _) = seeded();
        let err = build_session(
            &store,
            "u1",
            "en",
            Domain::Grammar,
            Some(ReviewMode::Typing),
            None,
            at(9),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ReviewError::UnsupportedMode { .. }));
    }

    #[tokio::test]
    async fn test_submit_typing_schedules_and_logs() {
        let (store, memory) = seeded();
        let (queue, _) = JobQueue::memory();
        let submission = SessionSubmission {
            language_id: "en".to_string(),
            domain: Domain::Vocabulary,
            mode: Some(ReviewMode::Typing),
            answers: vec![typed("lx-a", "Apple "), typed("lx-b", "xyz")],
        };
        let results = submit_session(&store, &queue, "u1", "s1", submission, 75, at(9))
            .await
            .unwrap();

        assert_eq!(results[0].score_percent, 100);
        assert_eq!(results[0].rating, 5);
        let state = results[0].state.as_ref().unwrap();
        assert_eq!(state.repetition, 1);
        assert_eq!(state.interval_days, 1);
        assert_eq!(state.familiarity, 11);
        assert_eq!(state.next_review_at, Some(at(9) + Duration::days(1)));

        assert!(!results[1].is_correct);
        assert_eq!(results[1].state.as_ref().unwrap().lapse_count, 1);

        let logged = memory.review_attempts("u1");
        assert_eq!(logged.len(), 2);
        assert_eq!(logged[0].expected.as_deref(), Some("apple"));
        assert_eq!(logged[0].session_id.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn test_unknown_item_rejects_before_writes() {
        let (store, memory) = seeded();
        let (queue, _) = JobQueue::memory();
        let submission = SessionSubmission {
            language_id: "en".to_string(),
            domain: Domain::Vocabulary,
            mode: Some(ReviewMode::Typing),
            answers: vec![typed("lx-a", "apple"), typed("lx-missing", "x")],
        };
        let err = submit_session(&store, &queue, "u1", "s1", submission, 75, at(9))
            .await
            .unwrap_err();
        assert!(matches!(err, ReviewError::UnknownItem(id) if id == "lx-missing"));
        assert!(memory.review_attempts("u1").is_empty());
    }

    #[tokio::test]
    async fn test_shadowing_defers_to_ai_and_missing_audio_scores_zero() {
        let (store, _) = seeded();
        let (queue, pending) = JobQueue::memory();
        let submission = SessionSubmission {
            language_id: "en".to_string(),
            domain: Domain::Vocabulary,
            mode: Some(ReviewMode::Shadowing),
            answers: vec![
                SessionAnswer {
                    item_id: "lx-a".to_string(),
                    answer: None,
                    audio_base64: Some("UklGRg==".to_string()),
                    mime_type: Some("audio/webm".to_string()),
                },
                SessionAnswer {
                    item_id: "lx-b".to_string(),
                    answer: None,
                    audio_base64: None,
                    mime_type: None,
                },
            ],
        };
        let results = submit_session(&store, &queue, "u1", "s9", submission, 75, at(9))
            .await
            .unwrap();

        assert!(results[0].pending);
        assert_eq!(
            results[0].meta,
            EvaluationMeta::PendingAi {
                attempt_id: "review:s9:lx-a".to_string()
            }
        );
        assert!(store.get_state("u1", Domain::Vocabulary, "lx-a").await.unwrap().is_none());

        assert!(!results[1].pending);
        assert_eq!(results[1].score_percent, 0);
        assert_eq!(results[1].meta, EvaluationMeta::NoAudio);

        let jobs = pending.drain_ready();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].task_type, SpeakingTaskType::Repeat);
        assert_eq!(jobs[0].items[0].reference_text.as_deref(), Some("apple"));
        let attempt = store.get_speaking_attempt("review:s9:lx-a").await.unwrap().unwrap();
        assert_eq!(attempt.status, AttemptStatus::PendingAi);
    }

    #[tokio::test]
    async fn test_invalid_rating_rejects_whole_batch() {
        let (store, memory) = seeded();
        let inputs = vec![
            RatingInput {
                item_id: "lx-a".to_string(),
                rating: 4,
                source: None,
            },
            RatingInput {
                item_id: "lx-b".to_string(),
                rating: 6,
                source: None,
            },
        ];
        let err = submit_reviews(&store, "u1", "en", Domain::Vocabulary, inputs, at(9))
            .await
            .unwrap_err();
        assert!(matches!(err, ReviewError::InvalidRating(SchedulerError::InvalidRating(6))));
        assert!(memory.review_attempts("u1").is_empty());
    }

    #[tokio::test]
    async fn test_explicit_rating_records_source() {
        let (store, _) = seeded();
        let rated = submit_reviews(
            &store,
            "u1",
            "en",
            Domain::Vocabulary,
            vec![RatingInput {
                item_id: "lx-a".to_string(),
                rating: 5,
                source: Some("WIDGET".to_string()),
            }],
            at(9),
        )
        .await
        .unwrap();
        assert_eq!(rated[0].state.repetition, 1);
        let record = store.get_state("u1", Domain::Vocabulary, "lx-a").await.unwrap().unwrap();
        assert_eq!(record.last_source.as_deref(), Some("WIDGET"));
    }

    #[tokio::test]
    async fn test_grammar_mcq_uses_stored_flags() {
        let (store, memory) = ReviewStore::memory();
        memory.insert_item(ReviewableItem {
            id: "gp-1".to_string(),
            domain: Domain::Grammar,
            language_id: "en".to_string(),
            natural_key: "past-simple".to_string(),
            difficulty: 1,
            active: true,
            content: ItemContent::Grammar(GrammarContent {
                title: "Past simple".to_string(),
                explanation: None,
                examples: Vec::new(),
                exercise: Some(GrammarExercise {
                    kind: GrammarExerciseKind::Mcq,
                    prompt: "Yesterday I ___ home.".to_string(),
                    choices: vec![
                        ChoiceOption {
                            key: "a".to_string(),
                            text: "go".to_string(),
                            is_correct: false,
                        },
                        ChoiceOption {
                            key: "b".to_string(),
                            text: "went".to_string(),
                            is_correct: true,
                        },
                    ],
                    tokens: Vec::new(),
                    answer: None,
                }),
            }),
        });
        let (queue, _) = JobQueue::memory();

        let session = build_session(&store, "u1", "en", Domain::Grammar, None, None, at(9))
            .await
            .unwrap();
        let prompt = serde_json::to_string(&session.items[0].prompt).unwrap();
        assert!(!prompt.contains("isCorrect"));

        let submission = SessionSubmission {
            language_id: "en".to_string(),
            domain: Domain::Grammar,
            mode: None,
            answers: vec![SessionAnswer {
                item_id: "gp-1".to_string(),
                answer: Some(Answer::Choice {
                    key: "b".to_string(),
                }),
                audio_base64: None,
                mime_type: None,
            }],
        };
        let results = submit_session(&store, &queue, "u1", "s1", submission, 75, at(9))
            .await
            .unwrap();
        assert!(results[0].is_correct);
        assert_eq!(results[0].score_percent, 100);
    }

    #[test]
    fn test_match_prompt_does_not_reveal_pairing() {
        let prompt = lesson_prompt(&LessonExercise::Match {
            pairs: vec![
                MatchPair {
                    left: "dog".to_string(),
                    right: "perro".to_string(),
                },
                MatchPair {
                    left: "cat".to_string(),
                    right: "gato".to_string(),
                },
            ],
        });
        let LessonPrompt::Match { left, right } = prompt else {
            panic!("expected match prompt");
        };
        assert_eq!(left, vec!["dog", "cat"]);
        assert_eq!(right, vec!["gato", "perro"]);
    }

    #[test]
    fn test_lesson_speak_grades_through_ai() {
        let item = ReviewableItem {
            id: "li-1".to_string(),
            domain: Domain::Lesson,
            language_id: "en".to_string(),
            natural_key: "li-1".to_string(),
            difficulty: 1,
            active: true,
            content: ItemContent::Lesson(LessonContent {
                prompt: None,
                exercise: LessonExercise::Speak {
                    reference_text: "good morning".to_string(),
                },
            }),
        };
        assert_eq!(
            grading_for(&item, ReviewMode::Lesson).unwrap(),
            Grading::Speech {
                reference_text: "good morning".to_string(),
                task_type: SpeakingTaskType::ReadAloud,
            }
        );
        assert!(grading_for(&item, ReviewMode::Typing).is_err());
    }
}
