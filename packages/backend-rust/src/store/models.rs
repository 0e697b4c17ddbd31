use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::services::evaluator::{MatchPair, ScoringMode};
use crate::services::srs::{ReviewState, Schedulable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Domain {
    Vocabulary,
    Grammar,
    Lesson,
}

impl Domain {
    pub fn as_str(self) -> &'static str {
        match self {
            Domain::Vocabulary => "VOCABULARY",
            Domain::Grammar => "GRAMMAR",
            Domain::Lesson => "LESSON",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "VOCABULARY" => Some(Domain::Vocabulary),
            "GRAMMAR" => Some(Domain::Grammar),
            "LESSON" => Some(Domain::Lesson),
            _ => None,
        }
    }

    pub fn default_mode(self) -> ReviewMode {
        match self {
            Domain::Vocabulary => ReviewMode::Flashcard,
            Domain::Grammar => ReviewMode::Exercise,
            Domain::Lesson => ReviewMode::Lesson,
        }
    }

    pub fn supports(self, mode: ReviewMode) -> bool {
        match self {
            Domain::Vocabulary => matches!(
                mode,
                ReviewMode::Flashcard
                    | ReviewMode::Typing
                    | ReviewMode::Listening
                    | ReviewMode::Shadowing
            ),
            Domain::Grammar => mode == ReviewMode::Exercise,
            Domain::Lesson => mode == ReviewMode::Lesson,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewMode {
    Flashcard,
    Typing,
    Listening,
    Shadowing,
    Exercise,
    Lesson,
    /// Explicit self-rating outside a session.
    Rating,
}

impl ReviewMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ReviewMode::Flashcard => "FLASHCARD",
            ReviewMode::Typing => "TYPING",
            ReviewMode::Listening => "LISTENING",
            ReviewMode::Shadowing => "SHADOWING",
            ReviewMode::Exercise => "EXERCISE",
            ReviewMode::Lesson => "LESSON",
            ReviewMode::Rating => "RATING",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        serde_json::from_value(Value::String(value.to_string())).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChoiceOption {
    pub key: String,
    pub text: String,
    #[serde(default)]
    pub is_correct: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LexemeContent {
    pub lemma: String,
    #[serde(default)]
    pub definition: Option<String>,
    #[serde(default)]
    pub translations: Vec<String>,
    #[serde(default)]
    pub part_of_speech: Option<String>,
    #[serde(default)]
    pub examples: Vec<String>,
    #[serde(default)]
    pub audio_url: Option<String>,
    #[serde(default)]
    pub phonetic: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GrammarExerciseKind {
    Mcq,
    FillBlank,
    Reorder,
    ErrorCorrection,
    Transform,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrammarExercise {
    pub kind: GrammarExerciseKind,
    pub prompt: String,
    #[serde(default)]
    pub choices: Vec<ChoiceOption>,
    #[serde(default)]
    pub tokens: Vec<String>,
    #[serde(default)]
    pub answer: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrammarContent {
    pub title: String,
    #[serde(default)]
    pub explanation: Option<String>,
    #[serde(default)]
    pub examples: Vec<String>,
    #[serde(default)]
    pub exercise: Option<GrammarExercise>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LessonExercise {
    Mcq {
        choices: Vec<ChoiceOption>,
    },
    #[serde(rename_all = "camelCase")]
    Listen {
        audio_url: Option<String>,
        choices: Vec<ChoiceOption>,
    },
    Cloze {
        sentence: String,
        answers: Vec<String>,
    },
    Reorder {
        tokens: Vec<String>,
        answer: Vec<String>,
    },
    Match {
        pairs: Vec<MatchPair>,
    },
    #[serde(rename_all = "camelCase")]
    Speak {
        reference_text: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LessonContent {
    #[serde(default)]
    pub prompt: Option<String>,
    pub exercise: LessonExercise,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemContent {
    Lexeme(LexemeContent),
    Grammar(GrammarContent),
    Lesson(LessonContent),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewableItem {
    pub id: String,
    pub domain: Domain,
    pub language_id: String,
    /// Lemma for lexemes, title for grammar patterns, a stable slug for lesson items.
    pub natural_key: String,
    pub difficulty: i32,
    pub active: bool,
    pub content: ItemContent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateRecord {
    pub id: String,
    pub user_id: String,
    pub domain: Domain,
    pub item_id: String,
    #[serde(flatten)]
    pub state: ReviewState,
    pub last_source: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StateRecord {
    pub fn fresh(user_id: &str, domain: Domain, item_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            domain,
            item_id: item_id.to_string(),
            state: ReviewState::default(),
            last_source: None,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Schedulable for StateRecord {
    fn review_state(&self) -> &ReviewState {
        &self.state
    }

    fn review_state_mut(&mut self) -> &mut ReviewState {
        &mut self.state
    }
}

/// Append-only log row; one per graded answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewAttempt {
    pub id: String,
    pub user_id: String,
    pub language_id: String,
    pub domain: Domain,
    pub item_id: String,
    pub session_id: Option<String>,
    pub mode: ReviewMode,
    pub is_correct: bool,
    pub score_percent: u8,
    pub rating: u8,
    pub user_answer: Option<Value>,
    pub expected: Option<String>,
    pub meta: Value,
    pub created_at: DateTime<Utc>,
}

pub const DEFAULT_DAILY_NEW_LIMIT: i32 = 10;
pub const DEFAULT_DAILY_REVIEW_LIMIT: i32 = 50;
pub const MAX_DAILY_LIMIT: i32 = 500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewSettings {
    pub user_id: String,
    pub language_id: String,
    pub daily_new_limit: i32,
    pub daily_review_limit: i32,
    pub updated_at: DateTime<Utc>,
}

impl ReviewSettings {
    pub fn defaults(user_id: &str, language_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            language_id: language_id.to_string(),
            daily_new_limit: DEFAULT_DAILY_NEW_LIMIT,
            daily_review_limit: DEFAULT_DAILY_REVIEW_LIMIT,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewStats {
    pub due_now: i64,
    pub scheduled_total: i64,
    pub mastered: i64,
    pub learning: i64,
    pub avg_familiarity: f64,
    pub reviewed_7d: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Good,
    Ok,
    Bad,
}

impl Severity {
    /// Unknown labels fall back to `Ok` so they are never ingested as errors.
    pub fn parse_lenient(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "BAD" => Severity::Bad,
            "GOOD" => Severity::Good,
            _ => Severity::Ok,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Good => "GOOD",
            Severity::Ok => "OK",
            Severity::Bad => "BAD",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WordErrorType {
    Pronunciation,
    Spelling,
    Meaning,
    Usage,
}

impl WordErrorType {
    pub fn as_str(self) -> &'static str {
        match self {
            WordErrorType::Pronunciation => "PRONUNCIATION",
            WordErrorType::Spelling => "SPELLING",
            WordErrorType::Meaning => "MEANING",
            WordErrorType::Usage => "USAGE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WordErrorSource {
    Quiz,
    Speaking,
    Review,
}

impl WordErrorSource {
    pub fn as_str(self) -> &'static str {
        match self {
            WordErrorSource::Quiz => "QUIZ",
            WordErrorSource::Speaking => "SPEAKING",
            WordErrorSource::Review => "REVIEW",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserWordError {
    pub id: String,
    pub user_id: String,
    pub lexeme_id: String,
    pub error_type: WordErrorType,
    pub source: WordErrorSource,
    pub severity: Severity,
    pub occur_count: i32,
    pub last_occurred_at: DateTime<Utc>,
    pub evidence: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeakWord {
    pub lexeme_id: String,
    pub lemma: String,
    pub error_type: WordErrorType,
    pub severity: Severity,
    pub occur_count: i32,
    pub last_occurred_at: DateTime<Utc>,
    pub evidence: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpeakingTaskType {
    ReadAloud,
    Repeat,
    Qna,
    PictureDesc,
}

impl SpeakingTaskType {
    pub fn scoring_mode(self) -> ScoringMode {
        match self {
            SpeakingTaskType::Qna | SpeakingTaskType::PictureDesc => ScoringMode::FreeSpeech,
            SpeakingTaskType::ReadAloud | SpeakingTaskType::Repeat => ScoringMode::ReferenceBased,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SpeakingTaskType::ReadAloud => "READ_ALOUD",
            SpeakingTaskType::Repeat => "REPEAT",
            SpeakingTaskType::Qna => "QNA",
            SpeakingTaskType::PictureDesc => "PICTURE_DESC",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        serde_json::from_value(Value::String(value.to_string())).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeakingTaskItem {
    pub id: String,
    #[serde(default)]
    pub prompt_text: Option<String>,
    #[serde(default)]
    pub reference_text: Option<String>,
    #[serde(default)]
    pub picture_url: Option<String>,
    #[serde(default)]
    pub prompt_audio_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeakingTask {
    pub id: String,
    pub language_id: String,
    pub task_type: SpeakingTaskType,
    pub title: String,
    pub active: bool,
    pub items: Vec<SpeakingTaskItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStatus {
    Started,
    Submitted,
    PendingAi,
    Scored,
    Failed,
}

impl AttemptStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptStatus::Started => "STARTED",
            AttemptStatus::Submitted => "SUBMITTED",
            AttemptStatus::PendingAi => "PENDING_AI",
            AttemptStatus::Scored => "SCORED",
            AttemptStatus::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        serde_json::from_value(Value::String(value.to_string())).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptOrigin {
    #[serde(rename_all = "camelCase")]
    Task { task_id: String },
    /// Speech answer given inside a review session; its score feeds back
    /// into that item's schedule.
    #[serde(rename_all = "camelCase")]
    ReviewItem {
        domain: Domain,
        item_id: String,
        session_id: String,
        mode: ReviewMode,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeakingAttemptItem {
    pub id: String,
    #[serde(default)]
    pub prompt_text: Option<String>,
    #[serde(default)]
    pub reference_text: Option<String>,
    #[serde(default)]
    pub audio_base64: Option<String>,
    #[serde(default)]
    pub audio_mime: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WordFeedback {
    pub word: String,
    pub severity: String,
    #[serde(default)]
    pub start_ms: Option<i64>,
    #[serde(default)]
    pub end_ms: Option<i64>,
    #[serde(default)]
    pub issue: Option<String>,
    #[serde(default)]
    pub suggestion: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemScore {
    pub item_id: String,
    pub pronunciation: u8,
    pub fluency: u8,
    pub accuracy: Option<u8>,
    pub composite: u8,
    pub transcript: Option<String>,
    /// Set when the transcript stood in for a missing reference text.
    pub synthetic_reference: bool,
    #[serde(default)]
    pub tips: Vec<String>,
    #[serde(default)]
    pub words: Vec<WordFeedback>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiResult {
    pub task_type: SpeakingTaskType,
    pub scoring_mode: ScoringMode,
    pub items: Vec<ItemScore>,
    #[serde(default)]
    pub summary: Option<String>,
}

impl AiResult {
    pub fn word_feedback(&self) -> impl Iterator<Item = &WordFeedback> {
        self.items.iter().flat_map(|item| item.words.iter())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    pub tries: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeakingAttempt {
    pub id: String,
    pub user_id: String,
    pub language_id: String,
    pub task_type: SpeakingTaskType,
    pub origin: AttemptOrigin,
    pub status: AttemptStatus,
    pub strictness: u8,
    pub duration_sec: Option<i32>,
    pub items: Vec<SpeakingAttemptItem>,
    pub score_percent: Option<u8>,
    pub ai_result: Option<AiResult>,
    pub error: Option<AttemptError>,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl SpeakingAttempt {
    /// Only a pending attempt, or one whose last failure is still retryable,
    /// may be finalized.
    pub fn accepts_result(&self) -> bool {
        match self.status {
            AttemptStatus::PendingAi | AttemptStatus::Submitted => true,
            AttemptStatus::Failed => self.error.as_ref().is_some_and(|e| e.retryable),
            AttemptStatus::Started | AttemptStatus::Scored => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttemptCompletion {
    Scored {
        score_percent: u8,
        ai_result: AiResult,
    },
    Failed {
        error: AttemptError,
    },
}
