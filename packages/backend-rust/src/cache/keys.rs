pub const AI_QUEUE_READY_KEY: &str = "ai:queue:ready";
pub const AI_QUEUE_DELAYED_KEY: &str = "ai:queue:delayed";
pub const AI_QUEUE_PROCESSING_KEY: &str = "ai:queue:processing";

pub fn global_ai_rate_key() -> &'static str {
    "rl:ai:global"
}

pub fn user_ai_rate_key(user_id: &str) -> String {
    format!("rl:ai:user:{}", user_id)
}

pub fn http_rate_key(client: &str) -> String {
    format!("rl:http:{}", client)
}

pub fn attempt_claim_key(attempt_id: &str) -> String {
    format!("ai:claim:{}", attempt_id)
}

/// Attempt ids for speech answered inside a review session.
pub fn review_speech_attempt_id(session_id: &str, item_id: &str) -> String {
    format!("review:{}:{}", session_id, item_id)
}
