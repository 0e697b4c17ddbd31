use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use similar::TextDiff;

use crate::services::srs::Rating;

const FLASHCARD_KNOWN_SCORE: u8 = 90;
const FLASHCARD_UNKNOWN_SCORE: u8 = 20;
const READ_ONLY_SCORE: u8 = 80;
const STRUCTURED_WRONG_SCORE: u8 = 20;

/// Typing answers are graded on a stricter curve than dictation.
const TYPING_CURVE: [(f64, u8); 3] = [(0.98, 100), (0.88, 85), (0.70, 60)];
const TYPING_FLOOR: u8 = 20;
const LISTENING_CURVE: [(f64, u8); 3] = [(0.98, 100), (0.85, 80), (0.70, 50)];
const LISTENING_FLOOR: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScoringMode {
    FreeSpeech,
    ReferenceBased,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MatchPair {
    pub left: String,
    pub right: String,
}

/// Server-side answer key. Built from stored content, never from anything
/// the client sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Expected {
    Choice { correct_keys: BTreeSet<String> },
    Typing { target: String },
    Listening { target: String },
    Flashcard,
    Cloze { accepted: Vec<String> },
    Reorder { sequence: Vec<String> },
    Match { pairs: Vec<MatchPair> },
    Structured { value: Value },
    ReadOnly,
}

impl Expected {
    pub fn display(&self) -> Option<String> {
        match self {
            Expected::Typing { target } | Expected::Listening { target } => Some(target.clone()),
            Expected::Cloze { accepted } => accepted.first().cloned(),
            Expected::Reorder { sequence } => Some(sequence.join(" ")),
            Expected::Structured { value } => Some(match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Answer {
    Choice { key: String },
    Text { text: String },
    Sequence { items: Vec<String> },
    Pairs { pairs: Vec<MatchPair> },
    Structured { value: Value },
    SelfReport { know: bool },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvaluationMeta {
    Choice {
        selected: Option<String>,
        correct_keys: Vec<String>,
    },
    Similarity {
        similarity: f64,
        answer: String,
        expected: String,
    },
    SelfReport {
        know: bool,
    },
    Structural {
        answer: Option<Value>,
    },
    ReadOnly,
    PendingAi {
        attempt_id: String,
    },
    Speech {
        scoring_mode: ScoringMode,
        pronunciation: u8,
        fluency: u8,
        accuracy: Option<u8>,
        attempt_id: String,
    },
    NoAudio,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    pub is_correct: bool,
    pub score_percent: u8,
    pub rating: Rating,
    pub meta: EvaluationMeta,
}

impl Evaluation {
    fn from_score(score_percent: u8, is_correct: bool, meta: EvaluationMeta) -> Self {
        Self {
            is_correct,
            score_percent,
            rating: Rating::from_score(score_percent),
            meta,
        }
    }

    fn graded(score_percent: u8, meta: EvaluationMeta) -> Self {
        let rating = Rating::from_score(score_percent);
        Self {
            is_correct: rating.is_pass(),
            score_percent,
            rating,
            meta,
        }
    }
}

pub fn clamp_score(value: f64) -> u8 {
    if value.is_nan() {
        return 0;
    }
    value.round_ties_even().clamp(0.0, 100.0) as u8
}

/// Lowercases, trims and folds the typographic apostrophe.
pub fn normalize_text(value: &str) -> String {
    value.trim().to_lowercase().replace('\u{2019}', "'")
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// Matching-characters ratio `2*M / (len(a) + len(b))` over a char diff.
/// The grading curves are tuned against this ratio, not edit distance.
pub fn similarity(answer: &str, expected: &str) -> f64 {
    let answer = normalize_text(answer);
    let expected = normalize_text(expected);
    if answer.is_empty() && expected.is_empty() {
        return 1.0;
    }
    f64::from(TextDiff::from_chars(answer.as_str(), expected.as_str()).ratio())
}

fn curve_score(similarity: f64, curve: &[(f64, u8)], floor: u8) -> u8 {
    curve
        .iter()
        .find(|(threshold, _)| similarity >= *threshold)
        .map(|(_, score)| *score)
        .unwrap_or(floor)
}

fn answer_text(answer: Option<&Answer>) -> String {
    match answer {
        Some(Answer::Text { text }) => text.clone(),
        Some(Answer::Choice { key }) => key.clone(),
        Some(Answer::Sequence { items }) => items.join(" "),
        Some(Answer::Structured { value }) => value
            .get("text")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_default(),
        _ => String::new(),
    }
}

fn answer_value(answer: Option<&Answer>) -> Option<Value> {
    answer.and_then(|a| serde_json::to_value(a).ok())
}

pub fn evaluate(expected: &Expected, answer: Option<&Answer>) -> Evaluation {
    match expected {
        Expected::Choice { correct_keys } => {
            let selected = match answer {
                Some(Answer::Choice { key }) => Some(key.clone()),
                Some(Answer::Text { text }) => Some(text.trim().to_string()),
                _ => None,
            };
            let correct = selected
                .as_ref()
                .is_some_and(|key| correct_keys.contains(key));
            Evaluation::from_score(
                if correct { 100 } else { 0 },
                correct,
                EvaluationMeta::Choice {
                    selected,
                    correct_keys: correct_keys.iter().cloned().collect(),
                },
            )
        }
        Expected::Typing { target } | Expected::Listening { target } => {
            let typed = answer_text(answer);
            let ratio = similarity(&typed, target);
            let score = if matches!(expected, Expected::Typing { .. }) {
                curve_score(ratio, &TYPING_CURVE, TYPING_FLOOR)
            } else {
                curve_score(ratio, &LISTENING_CURVE, LISTENING_FLOOR)
            };
            Evaluation::graded(
                score,
                EvaluationMeta::Similarity {
                    similarity: ratio,
                    answer: typed,
                    expected: target.clone(),
                },
            )
        }
        Expected::Flashcard => {
            let know = matches!(answer, Some(Answer::SelfReport { know: true }));
            let score = if know {
                FLASHCARD_KNOWN_SCORE
            } else {
                FLASHCARD_UNKNOWN_SCORE
            };
            Evaluation::graded(score, EvaluationMeta::SelfReport { know })
        }
        Expected::Cloze { accepted } => {
            let typed = collapse_whitespace(&answer_text(answer));
            let correct = !typed.is_empty()
                && accepted.iter().any(|option| collapse_whitespace(option) == typed);
            structural(correct, 0, answer)
        }
        Expected::Reorder { sequence } => {
            let correct = match answer {
                Some(Answer::Sequence { items }) => items == sequence,
                _ => false,
            };
            structural(correct, 0, answer)
        }
        Expected::Match { pairs } => {
            let correct = match answer {
                Some(Answer::Pairs { pairs: given }) => {
                    let want: BTreeSet<&MatchPair> = pairs.iter().collect();
                    let got: BTreeSet<&MatchPair> = given.iter().collect();
                    given.len() == pairs.len() && want == got
                }
                _ => false,
            };
            structural(correct, 0, answer)
        }
        Expected::Structured { value } => {
            let correct = match answer {
                Some(Answer::Structured { value: given }) => {
                    given == value || text_field_matches(given, value)
                }
                Some(Answer::Text { text }) => {
                    let wanted = value
                        .as_str()
                        .or_else(|| value.get("text").and_then(Value::as_str));
                    wanted.is_some_and(|w| normalize_text(w) == normalize_text(text))
                }
                _ => false,
            };
            structural(correct, STRUCTURED_WRONG_SCORE, answer)
        }
        Expected::ReadOnly => Evaluation::graded(READ_ONLY_SCORE, EvaluationMeta::ReadOnly),
    }
}

fn text_field_matches(given: &Value, expected: &Value) -> bool {
    match (
        given.get("text").and_then(Value::as_str),
        expected.get("text").and_then(Value::as_str),
    ) {
        (Some(a), Some(b)) => normalize_text(a) == normalize_text(b),
        _ => false,
    }
}

fn structural(correct: bool, wrong_score: u8, answer: Option<&Answer>) -> Evaluation {
    Evaluation::from_score(
        if correct { 100 } else { wrong_score },
        correct,
        EvaluationMeta::Structural {
            answer: answer_value(answer),
        },
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechDimensions {
    pub pronunciation: u8,
    pub fluency: u8,
    pub accuracy: Option<u8>,
}

/// Weighted composite of AI speech dimensions. The provider's own overall
/// score is never used.
pub fn fuse_speech_scores(mode: ScoringMode, dims: SpeechDimensions) -> u8 {
    let p = f64::from(dims.pronunciation.min(100));
    let f = f64::from(dims.fluency.min(100));
    match mode {
        ScoringMode::FreeSpeech => clamp_score(0.65 * p + 0.35 * f),
        ScoringMode::ReferenceBased => {
            let a = f64::from(dims.accuracy.unwrap_or(dims.pronunciation).min(100));
            clamp_score(0.45 * p + 0.20 * f + 0.35 * a)
        }
    }
}

pub fn speech_evaluation(mode: ScoringMode, dims: SpeechDimensions, attempt_id: &str) -> Evaluation {
    let score = fuse_speech_scores(mode, dims);
    Evaluation::graded(
        score,
        EvaluationMeta::Speech {
            scoring_mode: mode,
            pronunciation: dims.pronunciation,
            fluency: dims.fluency,
            accuracy: dims.accuracy,
            attempt_id: attempt_id.to_string(),
        },
    )
}

pub fn missing_audio_evaluation() -> Evaluation {
    Evaluation::from_score(0, false, EvaluationMeta::NoAudio)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text(value: &str) -> Answer {
        Answer::Text { text: value.to_string() }
    }

    #[test]
    fn test_choice_uses_stored_keys() {
        let expected = Expected::Choice {
            correct_keys: ["b".to_string()].into_iter().collect(),
        };
        let right = evaluate(&expected, Some(&Answer::Choice { key: "b".into() }));
        assert!(right.is_correct);
        assert_eq!(right.score_percent, 100);
        assert_eq!(right.rating.value(), 5);

        let wrong = evaluate(&expected, Some(&Answer::Choice { key: "a".into() }));
        assert!(!wrong.is_correct);
        assert_eq!(wrong.rating.value(), 0);

        let missing = evaluate(&expected, None);
        assert!(!missing.is_correct);
    }

    #[test]
    fn test_typing_curve() {
        let expected = Expected::Typing { target: "receive".into() };
        assert_eq!(evaluate(&expected, Some(&text("Receive "))).score_percent, 100);
        // 12/14 matching chars sits below the 0.88 typing band.
        assert_eq!(evaluate(&expected, Some(&text("recieve"))).score_percent, 60);
        assert_eq!(evaluate(&expected, Some(&text("receiv"))).score_percent, 85);
        assert_eq!(evaluate(&expected, Some(&text("table"))).score_percent, 20);
        assert_eq!(evaluate(&expected, None).score_percent, 20);
    }

    #[test]
    fn test_typing_normalizes_apostrophe() {
        let expected = Expected::Typing { target: "don't".into() };
        let eval = evaluate(&expected, Some(&text("DON\u{2019}T")));
        assert_eq!(eval.score_percent, 100);
        assert!(eval.is_correct);
    }

    #[test]
    fn test_listening_curve_is_looser_at_the_bottom() {
        let expected = Expected::Listening { target: "receive".into() };
        let swapped = evaluate(&expected, Some(&text("recieve")));
        assert_eq!(swapped.score_percent, 80);
        assert_eq!(swapped.rating.value(), 3);
        assert!(swapped.rating.is_pass());
        assert_eq!(evaluate(&expected, Some(&text("reseeve"))).score_percent, 50);
        assert_eq!(evaluate(&expected, Some(&text("zzz"))).score_percent, 10);
    }

    #[test]
    fn test_flashcard_self_report() {
        let known = evaluate(&Expected::Flashcard, Some(&Answer::SelfReport { know: true }));
        assert_eq!(known.score_percent, 90);
        assert_eq!(known.rating.value(), 4);
        let unknown = evaluate(&Expected::Flashcard, None);
        assert_eq!(unknown.score_percent, 20);
        assert_eq!(unknown.rating.value(), 0);
    }

    #[test]
    fn test_cloze_collapses_whitespace() {
        let expected = Expected::Cloze {
            accepted: vec!["has been".into(), "'s been".into()],
        };
        assert!(evaluate(&expected, Some(&text("  has   been "))).is_correct);
        assert!(!evaluate(&expected, Some(&text("was"))).is_correct);
        assert!(!evaluate(&expected, Some(&text("   "))).is_correct);
    }

    #[test]
    fn test_reorder_and_match() {
        let reorder = Expected::Reorder {
            sequence: vec!["I".into(), "am".into(), "here".into()],
        };
        let ok = Answer::Sequence { items: vec!["I".into(), "am".into(), "here".into()] };
        let bad = Answer::Sequence { items: vec!["am".into(), "I".into(), "here".into()] };
        assert_eq!(evaluate(&reorder, Some(&ok)).score_percent, 100);
        assert_eq!(evaluate(&reorder, Some(&bad)).score_percent, 0);

        let pair = |l: &str, r: &str| MatchPair { left: l.into(), right: r.into() };
        let matching = Expected::Match { pairs: vec![pair("dog", "chien"), pair("cat", "chat")] };
        let shuffled = Answer::Pairs { pairs: vec![pair("cat", "chat"), pair("dog", "chien")] };
        assert!(evaluate(&matching, Some(&shuffled)).is_correct);
        let partial = Answer::Pairs { pairs: vec![pair("cat", "chat")] };
        assert!(!evaluate(&matching, Some(&partial)).is_correct);
    }

    #[test]
    fn test_structured_grammar_answers() {
        let expected = Expected::Structured { value: json!({"text": "She has gone"}) };
        let same_text = Answer::Structured { value: json!({"text": "she has gone "}) };
        assert_eq!(evaluate(&expected, Some(&same_text)).score_percent, 100);
        assert_eq!(evaluate(&expected, Some(&text("She has gone"))).score_percent, 100);

        let wrong = evaluate(&expected, Some(&text("She have gone")));
        assert_eq!(wrong.score_percent, 20);
        assert_eq!(wrong.rating.value(), 0);
    }

    #[test]
    fn test_read_only_card() {
        let eval = evaluate(&Expected::ReadOnly, None);
        assert_eq!(eval.score_percent, 80);
        assert_eq!(eval.rating.value(), 3);
        assert_eq!(eval.meta, EvaluationMeta::ReadOnly);
    }

    #[test]
    fn test_speech_fusion_weights() {
        let dims = SpeechDimensions { pronunciation: 80, fluency: 60, accuracy: Some(95) };
        assert_eq!(fuse_speech_scores(ScoringMode::FreeSpeech, dims), 73);
        assert_eq!(fuse_speech_scores(ScoringMode::ReferenceBased, dims), 81);

        let perfect = SpeechDimensions { pronunciation: 100, fluency: 100, accuracy: Some(100) };
        assert_eq!(fuse_speech_scores(ScoringMode::ReferenceBased, perfect), 100);

        let eval = speech_evaluation(ScoringMode::FreeSpeech, dims, "a-1");
        assert_eq!(eval.rating.value(), 3);
    }

    #[test]
    fn test_missing_audio_scores_zero() {
        let eval = missing_audio_evaluation();
        assert_eq!(eval.score_percent, 0);
        assert_eq!(eval.rating.value(), 0);
        assert_eq!(serde_json::to_value(&eval.meta).unwrap(), json!({"type": "NO_AUDIO"}));
    }
}
