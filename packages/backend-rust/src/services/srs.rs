use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_EASE_FACTOR: f64 = 2.5;
pub const MIN_EASE_FACTOR: f64 = 1.3;
pub const MAX_EASE_FACTOR: f64 = 2.8;
pub const FAMILIARITY_PENALTY: i32 = 10;
pub const WEAK_SPOT_REVIEW_DELAY_HOURS: i64 = 12;

const MASTERED_THRESHOLD: i32 = 85;
const KNOWN_THRESHOLD: i32 = 60;
const MAX_FAMILIARITY: i32 = 100;
const PASS_RATING: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mastery {
    New,
    Learning,
    Known,
    Mastered,
}

impl Mastery {
    pub fn as_str(self) -> &'static str {
        match self {
            Mastery::New => "NEW",
            Mastery::Learning => "LEARNING",
            Mastery::Known => "KNOWN",
            Mastery::Mastered => "MASTERED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "NEW" => Some(Mastery::New),
            "LEARNING" => Some(Mastery::Learning),
            "KNOWN" => Some(Mastery::Known),
            "MASTERED" => Some(Mastery::Mastered),
            _ => None,
        }
    }

    pub fn from_familiarity(familiarity: i32) -> Self {
        if familiarity >= MASTERED_THRESHOLD {
            Mastery::Mastered
        } else if familiarity >= KNOWN_THRESHOLD {
            Mastery::Known
        } else {
            Mastery::Learning
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("rating must be an integer between 0 and 5, got {0}")]
    InvalidRating(i64),
}

/// Review quality on the SM-2 0..=5 scale. Out-of-range values are rejected
/// rather than clamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u8")]
pub struct Rating(u8);

impl Rating {
    pub const MAX: u8 = 5;

    pub fn new(value: i64) -> Result<Self, SchedulerError> {
        if (0..=i64::from(Self::MAX)).contains(&value) {
            Ok(Self(value as u8))
        } else {
            Err(SchedulerError::InvalidRating(value))
        }
    }

    /// Fixed breakpoints shared by every evaluator and the AI pipeline.
    pub fn from_score(score_percent: u8) -> Self {
        let rating = match score_percent {
            95.. => 5,
            85..=94 => 4,
            70..=84 => 3,
            50..=69 => 2,
            30..=49 => 1,
            _ => 0,
        };
        Self(rating)
    }

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn is_pass(self) -> bool {
        self.0 >= PASS_RATING
    }
}

impl TryFrom<i64> for Rating {
    type Error = SchedulerError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Rating> for u8 {
    fn from(rating: Rating) -> Self {
        rating.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewState {
    pub mastery: Mastery,
    pub familiarity: i32,
    pub ease_factor: f64,
    pub repetition: i32,
    pub interval_days: i32,
    pub lapse_count: i32,
    pub last_reviewed_at: Option<DateTime<Utc>>,
    pub next_review_at: Option<DateTime<Utc>>,
}

impl Default for ReviewState {
    fn default() -> Self {
        Self {
            mastery: Mastery::New,
            familiarity: 0,
            ease_factor: DEFAULT_EASE_FACTOR,
            repetition: 0,
            interval_days: 0,
            lapse_count: 0,
            last_reviewed_at: None,
            next_review_at: None,
        }
    }
}

impl ReviewState {
    pub fn is_new(&self) -> bool {
        self.last_reviewed_at.is_none()
    }

    /// Never reviewed and never pulled forward. Such items are still
    /// offered as new, even after a session created their state.
    pub fn is_unscheduled(&self) -> bool {
        self.last_reviewed_at.is_none() && self.next_review_at.is_none()
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_review_at.is_some_and(|due| due <= now)
    }
}

/// Anything that embeds a [`ReviewState`]: lexeme, grammar pattern and lesson
/// item progress records all schedule through the same update.
pub trait Schedulable {
    fn review_state(&self) -> &ReviewState;
    fn review_state_mut(&mut self) -> &mut ReviewState;
}

impl Schedulable for ReviewState {
    fn review_state(&self) -> &ReviewState {
        self
    }

    fn review_state_mut(&mut self) -> &mut ReviewState {
        self
    }
}

pub fn apply_review(state: &ReviewState, rating: Rating, now: DateTime<Utc>) -> ReviewState {
    let mut next = state.clone();
    let mut ease_factor = state.ease_factor;

    if !rating.is_pass() {
        next.repetition = 0;
        next.interval_days = 1;
        next.lapse_count = state.lapse_count.saturating_add(1);
        next.mastery = Mastery::Learning;
        next.familiarity = (state.familiarity - FAMILIARITY_PENALTY).max(0);
    } else {
        next.repetition = state.repetition.saturating_add(1);
        next.interval_days = match next.repetition {
            1 => 1,
            2 => 3,
            _ => {
                let grown = (f64::from(state.interval_days) * ease_factor).round_ties_even();
                (grown as i32).max(1)
            }
        };

        let q = f64::from(Rating::MAX - rating.value());
        ease_factor += 0.1 - q * (0.08 + q * 0.02);

        next.familiarity = (state.familiarity + 6 + i32::from(rating.value())).min(MAX_FAMILIARITY);
        next.mastery = Mastery::from_familiarity(next.familiarity);
    }

    next.ease_factor = ease_factor.clamp(MIN_EASE_FACTOR, MAX_EASE_FACTOR);
    next.last_reviewed_at = Some(now);
    next.next_review_at = Some(now + Duration::days(i64::from(next.interval_days)));
    next
}

pub fn review<S: Schedulable>(target: &mut S, rating: Rating, now: DateTime<Utc>) {
    let updated = apply_review(target.review_state(), rating, now);
    *target.review_state_mut() = updated;
}

/// Penalty applied when AI feedback flags an item outside a formal review.
/// The due date only ever moves earlier.
pub fn apply_weak_spot_penalty(state: &ReviewState, now: DateTime<Utc>) -> ReviewState {
    let mut next = state.clone();
    next.familiarity = (state.familiarity - FAMILIARITY_PENALTY).max(0);
    next.mastery = Mastery::Learning;

    let forced = now + Duration::hours(WEAK_SPOT_REVIEW_DELAY_HOURS);
    next.next_review_at = match state.next_review_at {
        Some(existing) if existing <= forced => Some(existing),
        _ => Some(forced),
    };
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn rating(v: i64) -> Rating {
        Rating::new(v).unwrap()
    }

    #[test]
    fn first_perfect_review_schedules_one_day() {
        let state = ReviewState::default();
        let next = apply_review(&state, rating(5), now());

        assert_eq!(next.repetition, 1);
        assert_eq!(next.interval_days, 1);
        assert_eq!(next.familiarity, 11);
        assert_eq!(next.mastery, Mastery::Learning);
        assert!((next.ease_factor - 2.6).abs() < 1e-9);
        assert_eq!(next.next_review_at, Some(now() + Duration::days(1)));
    }

    #[test]
    fn second_and_third_successes_follow_schedule() {
        let s1 = apply_review(&ReviewState::default(), rating(4), now());
        let s2 = apply_review(&s1, rating(4), now());
        assert_eq!(s2.interval_days, 3);

        let s3 = apply_review(&s2, rating(4), now());
        assert_eq!(s3.repetition, 3);
        assert_eq!(s3.interval_days, (3.0 * s2.ease_factor).round() as i32);
    }

    #[test]
    fn failure_resets_and_penalises() {
        let state = ReviewState {
            mastery: Mastery::Known,
            familiarity: 64,
            ease_factor: 2.2,
            repetition: 4,
            interval_days: 20,
            lapse_count: 1,
            last_reviewed_at: Some(now()),
            next_review_at: Some(now()),
        };
        let next = apply_review(&state, rating(2), now());

        assert_eq!(next.repetition, 0);
        assert_eq!(next.interval_days, 1);
        assert_eq!(next.lapse_count, 2);
        assert_eq!(next.familiarity, 54);
        assert_eq!(next.mastery, Mastery::Learning);
        assert!((next.ease_factor - 2.2).abs() < 1e-9);
    }

    #[test]
    fn familiarity_is_floored_and_capped() {
        let low = ReviewState { familiarity: 4, ..Default::default() };
        assert_eq!(apply_review(&low, rating(0), now()).familiarity, 0);

        let high = ReviewState { familiarity: 97, ..Default::default() };
        let next = apply_review(&high, rating(5), now());
        assert_eq!(next.familiarity, 100);
        assert_eq!(next.mastery, Mastery::Mastered);
    }

    #[test]
    fn ease_factor_never_leaves_bounds() {
        let mut state = ReviewState::default();
        for _ in 0..20 {
            state = apply_review(&state, rating(3), now());
        }
        assert!((state.ease_factor - MIN_EASE_FACTOR).abs() < 1e-9);

        for _ in 0..20 {
            state = apply_review(&state, rating(5), now());
        }
        assert!((state.ease_factor - MAX_EASE_FACTOR).abs() < 1e-9);
    }

    #[test]
    fn out_of_range_ratings_are_rejected() {
        assert_eq!(Rating::new(6), Err(SchedulerError::InvalidRating(6)));
        assert_eq!(Rating::new(-1), Err(SchedulerError::InvalidRating(-1)));
        assert!(serde_json::from_str::<Rating>("7").is_err());
        assert_eq!(serde_json::from_str::<Rating>("4").unwrap().value(), 4);
    }

    #[test]
    fn score_breakpoints() {
        let cases = [(100, 5), (95, 5), (94, 4), (85, 4), (84, 3), (70, 3), (69, 2), (50, 2), (49, 1), (30, 1), (29, 0), (0, 0)];
        for (score, expected) in cases {
            assert_eq!(Rating::from_score(score).value(), expected, "score {score}");
        }
    }

    #[test]
    fn weak_spot_penalty_only_pulls_due_date_forward() {
        let far = ReviewState {
            familiarity: 50,
            mastery: Mastery::Known,
            next_review_at: Some(now() + Duration::days(10)),
            ..Default::default()
        };
        let penalised = apply_weak_spot_penalty(&far, now());
        assert_eq!(penalised.familiarity, 40);
        assert_eq!(penalised.mastery, Mastery::Learning);
        assert_eq!(penalised.next_review_at, Some(now() + Duration::hours(12)));

        let soon = ReviewState {
            next_review_at: Some(now() + Duration::hours(2)),
            ..Default::default()
        };
        let kept = apply_weak_spot_penalty(&soon, now());
        assert_eq!(kept.next_review_at, Some(now() + Duration::hours(2)));

        let unscheduled = apply_weak_spot_penalty(&ReviewState::default(), now());
        assert_eq!(unscheduled.next_review_at, Some(now() + Duration::hours(12)));
    }

    #[test]
    fn generic_review_updates_embedded_state() {
        struct GrammarProgress {
            state: ReviewState,
        }
        impl Schedulable for GrammarProgress {
            fn review_state(&self) -> &ReviewState {
                &self.state
            }
            fn review_state_mut(&mut self) -> &mut ReviewState {
                &mut self.state
            }
        }

        let mut progress = GrammarProgress { state: ReviewState::default() };
        review(&mut progress, rating(3), now());
        assert_eq!(progress.state, apply_review(&ReviewState::default(), rating(3), now()));
    }
}
