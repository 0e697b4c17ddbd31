use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::time::sleep;
use tracing::warn;

use crate::config::{env_bool, env_string, env_u64};
use crate::store::WordFeedback;

const DEFAULT_MODEL: &str = "gemini-2.0-flash";
const DEFAULT_API_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_TIMEOUT_MS: u64 = 45_000;
const MAX_RETRIES: usize = 2;
const BASE_BACKOFF_MS: u64 = 250;

const SCORE_SYSTEM: &str = "You are a pronunciation coach. Score pronunciation, fluency and \
accuracy from 0 to 100. Return JSON only and follow the schema exactly. Base every judgement on \
what was actually spoken and never invent words.";

const TRANSCRIBE_SYSTEM: &str = "You are a speech-to-text engine. Return JSON only with the \
verbatim transcript of the audio.";

#[derive(Debug, Clone)]
pub struct ScoringConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub asr_model: String,
    pub api_endpoint: String,
    pub timeout: Duration,
}

impl ScoringConfig {
    pub fn from_env() -> Self {
        let model = env_string("SCORING_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string());
        Self {
            api_key: env_string("SCORING_API_KEY"),
            asr_model: env_string("SCORING_ASR_MODEL").unwrap_or_else(|| model.clone()),
            model,
            api_endpoint: env_string("SCORING_API_ENDPOINT")
                .unwrap_or_else(|| DEFAULT_API_ENDPOINT.to_string())
                .trim_end_matches('/')
                .to_string(),
            timeout: Duration::from_millis(env_u64("SCORING_TIMEOUT_MS").unwrap_or(DEFAULT_TIMEOUT_MS)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ScoreRequest<'a> {
    pub audio_base64: &'a str,
    pub mime_type: &'a str,
    pub reference_text: &'a str,
    pub language_hint: Option<&'a str>,
    pub strictness: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderScore {
    #[serde(default)]
    pub transcript: Option<String>,
    pub pronunciation: f64,
    pub fluency: f64,
    #[serde(default)]
    pub accuracy: Option<f64>,
    /// Reported by the provider but never used for grading.
    #[serde(default)]
    pub overall: Option<f64>,
    #[serde(default, alias = "word_feedback")]
    pub words: Vec<ProviderWord>,
    #[serde(default)]
    pub tips: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderWord {
    pub word: String,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub start_ms: Option<i64>,
    #[serde(default)]
    pub end_ms: Option<i64>,
    #[serde(default)]
    pub issue: Option<String>,
    #[serde(default)]
    pub suggestion: Option<String>,
}

impl From<ProviderWord> for WordFeedback {
    fn from(word: ProviderWord) -> Self {
        WordFeedback {
            word: word.word,
            severity: word.severity.unwrap_or_else(|| "OK".to_string()),
            start_ms: word.start_ms,
            end_ms: word.end_ms,
            issue: word.issue,
            suggestion: word.suggestion,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Transcript {
    pub text: String,
    #[serde(default)]
    pub detected_language: Option<String>,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("scoring provider not configured: {0}")]
    NotConfigured(&'static str),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("HTTP {status}: {body}")]
    HttpStatus { status: reqwest::StatusCode, body: String },
    #[error("JSON decode failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("empty response")]
    EmptyResponse,
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("provider rejected input: {0}")]
    Rejected(String),
}

impl ProviderError {
    /// Whether a later retry of the same request can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Request(_) | ProviderError::Unavailable(_) | ProviderError::EmptyResponse => true,
            ProviderError::HttpStatus { status, .. } => is_retryable(*status),
            ProviderError::Json(_) => true,
            ProviderError::NotConfigured(_) | ProviderError::Rejected(_) => false,
        }
    }
}

#[derive(Clone)]
pub struct HttpScoringProvider {
    config: ScoringConfig,
    client: reqwest::Client,
}

impl HttpScoringProvider {
    pub fn new(config: ScoringConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { config, client }
    }

    pub fn is_available(&self) -> bool {
        self.config.api_key.as_deref().is_some_and(|v| !v.trim().is_empty())
    }

    async fn score(&self, request: ScoreRequest<'_>) -> Result<ProviderScore, ProviderError> {
        let prompt = format!(
            "Reference text:\n{}\n\nTranscribe the audio, then score accuracy (closeness to the \
             reference), fluency (pace, pauses, rhythm) and pronunciation (clarity, stress, \
             intonation). List problematic words with start_ms, end_ms, severity (GOOD, OK or BAD), \
             issue and suggestion. Give short actionable tips.\n\nStrictness={}\nlanguage_hint={}",
            request.reference_text,
            request.strictness,
            request.language_hint.unwrap_or("auto"),
        );
        let text = self
            .generate(&self.config.model, SCORE_SYSTEM, &prompt, request.audio_base64, request.mime_type)
            .await?;
        Ok(serde_json::from_str(strip_code_fence(&text))?)
    }

    async fn transcribe(
        &self,
        audio_base64: &str,
        mime_type: &str,
        language_hint: Option<&str>,
    ) -> Result<Transcript, ProviderError> {
        let prompt = format!(
            "Transcribe the audio as {{\"text\": ..., \"detected_language\": ...}}.\nlanguage_hint={}",
            language_hint.unwrap_or("auto")
        );
        let text = self
            .generate(&self.config.asr_model, TRANSCRIBE_SYSTEM, &prompt, audio_base64, mime_type)
            .await?;
        Ok(serde_json::from_str(strip_code_fence(&text))?)
    }

    async fn generate(
        &self,
        model: &str,
        system: &str,
        prompt: &str,
        audio_base64: &str,
        mime_type: &str,
    ) -> Result<String, ProviderError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .filter(|v| !v.trim().is_empty())
            .ok_or(ProviderError::NotConfigured("SCORING_API_KEY"))?;

        let url = format!("{}/models/{}:generateContent", self.config.api_endpoint, model);
        let payload = json!({
            "contents": [{
                "role": "user",
                "parts": [
                    {"text": system},
                    {"text": prompt},
                    {"inline_data": {"mime_type": mime_type, "data": audio_base64}}
                ]
            }],
            "generationConfig": {
                "temperature": 0,
                "responseMimeType": "application/json"
            }
        });

        let response = self.post_with_retry(&url, api_key, &payload).await?;
        response
            .pointer("/candidates/0/content/parts")
            .and_then(|parts| parts.as_array())
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                    .collect::<String>()
            })
            .filter(|text| !text.trim().is_empty())
            .ok_or(ProviderError::EmptyResponse)
    }

    async fn post_with_retry(
        &self,
        url: &str,
        api_key: &str,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, ProviderError> {
        let mut last_error: Option<ProviderError> = None;

        for retry in 0..=MAX_RETRIES {
            let sent = self
                .client
                .post(url)
                .header("x-goog-api-key", api_key)
                .json(payload)
                .send()
                .await;

            let err = match sent {
                Ok(resp) if resp.status().is_success() => {
                    let bytes = resp.bytes().await?;
                    return serde_json::from_slice(&bytes).map_err(ProviderError::Json);
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    let err = ProviderError::HttpStatus { status, body };
                    if !is_retryable(status) {
                        return Err(err);
                    }
                    err
                }
                Err(e) => ProviderError::Request(e),
            };

            if retry < MAX_RETRIES {
                let backoff = Duration::from_millis(BASE_BACKOFF_MS * (1 << retry));
                warn!(retry, error = %err, "scoring request failed, retrying");
                sleep(backoff).await;
            }
            last_error = Some(err);
        }
        Err(last_error.unwrap_or(ProviderError::EmptyResponse))
    }
}

#[derive(Debug, Clone)]
pub enum MockFailure {
    Transient(String),
    Permanent(String),
}

/// Deterministic stand-in used when `SCORING_MOCK` is set and by tests.
/// Queued replies are consumed first, then the fallback applies.
pub struct MockScoringProvider {
    scores: Mutex<VecDeque<Result<ProviderScore, MockFailure>>>,
    transcripts: Mutex<VecDeque<Result<String, MockFailure>>>,
    fallback: ProviderScore,
    score_calls: AtomicUsize,
    transcribe_calls: AtomicUsize,
}

impl Default for MockScoringProvider {
    fn default() -> Self {
        Self::with_fallback(ProviderScore {
            transcript: Some("mock transcript".to_string()),
            pronunciation: 80.0,
            fluency: 75.0,
            accuracy: Some(85.0),
            overall: None,
            words: Vec::new(),
            tips: vec!["Keep a steady pace.".to_string()],
        })
    }
}

impl MockScoringProvider {
    pub fn with_fallback(fallback: ProviderScore) -> Self {
        Self {
            scores: Mutex::new(VecDeque::new()),
            transcripts: Mutex::new(VecDeque::new()),
            fallback,
            score_calls: AtomicUsize::new(0),
            transcribe_calls: AtomicUsize::new(0),
        }
    }

    pub fn push_score(&self, reply: Result<ProviderScore, MockFailure>) {
        self.scores.lock().push_back(reply);
    }

    pub fn push_transcript(&self, reply: Result<String, MockFailure>) {
        self.transcripts.lock().push_back(reply);
    }

    pub fn score_calls(&self) -> usize {
        self.score_calls.load(Ordering::SeqCst)
    }

    pub fn transcribe_calls(&self) -> usize {
        self.transcribe_calls.load(Ordering::SeqCst)
    }

    fn score(&self) -> Result<ProviderScore, ProviderError> {
        self.score_calls.fetch_add(1, Ordering::SeqCst);
        match self.scores.lock().pop_front() {
            Some(reply) => reply.map_err(MockFailure::into_error),
            None => Ok(self.fallback.clone()),
        }
    }

    fn transcribe(&self) -> Result<Transcript, ProviderError> {
        self.transcribe_calls.fetch_add(1, Ordering::SeqCst);
        let text = match self.transcripts.lock().pop_front() {
            Some(reply) => reply.map_err(MockFailure::into_error)?,
            None => self
                .fallback
                .transcript
                .clone()
                .unwrap_or_else(|| "mock transcript".to_string()),
        };
        Ok(Transcript {
            text,
            detected_language: None,
        })
    }
}

impl MockFailure {
    fn into_error(self) -> ProviderError {
        match self {
            MockFailure::Transient(msg) => ProviderError::Unavailable(msg),
            MockFailure::Permanent(msg) => ProviderError::Rejected(msg),
        }
    }
}

#[derive(Clone)]
pub enum ScoringProvider {
    Http(HttpScoringProvider),
    Mock(Arc<MockScoringProvider>),
}

impl ScoringProvider {
    pub fn from_env() -> Self {
        if env_bool("SCORING_MOCK") {
            tracing::info!("using mock speech scoring provider");
            return ScoringProvider::Mock(Arc::new(MockScoringProvider::default()));
        }
        let provider = HttpScoringProvider::new(ScoringConfig::from_env());
        if !provider.is_available() {
            warn!("SCORING_API_KEY not set; speech scoring jobs will fail");
        }
        ScoringProvider::Http(provider)
    }

    pub async fn score(&self, request: ScoreRequest<'_>) -> Result<ProviderScore, ProviderError> {
        match self {
            ScoringProvider::Http(http) => http.score(request).await,
            ScoringProvider::Mock(mock) => mock.score(),
        }
    }

    pub async fn transcribe(
        &self,
        audio_base64: &str,
        mime_type: &str,
        language_hint: Option<&str>,
    ) -> Result<Transcript, ProviderError> {
        match self {
            ScoringProvider::Http(http) => http.transcribe(audio_base64, mime_type, language_hint).await,
            ScoringProvider::Mock(mock) => mock.transcribe(),
        }
    }
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

fn is_retryable(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}
