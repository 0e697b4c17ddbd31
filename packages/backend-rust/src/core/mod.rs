pub mod claims;
pub mod job_queue;
pub mod token_bucket;

use thiserror::Error;

pub use claims::ClaimStore;
pub use job_queue::{AiJob, AiJobItem, Delivery, JobQueue};
pub use token_bucket::{AiRateLimiter, BucketConfig, BucketDecision, TokenBuckets};

/// Failure talking to the shared coordination backend (Redis).
#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("payload encoding failed: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("job queue is closed")]
    Closed,
}
