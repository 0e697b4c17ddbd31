use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;

use super::CoordinationError;
use crate::cache::keys::{AI_QUEUE_DELAYED_KEY, AI_QUEUE_PROCESSING_KEY, AI_QUEUE_READY_KEY};
use crate::cache::RedisCache;
use crate::store::SpeakingTaskType;

const PROMOTE_BATCH: usize = 100;

/// Moves due jobs from the delayed set onto the ready list.
const PROMOTE_DUE_LUA: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
for _, raw in ipairs(due) do
  redis.call('ZREM', KEYS[1], raw)
  redis.call('LPUSH', KEYS[2], raw)
end
return #due
"#;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiJobItem {
    pub item_id: String,
    #[serde(default)]
    pub audio_base64: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub language_hint: Option<String>,
    #[serde(default)]
    pub reference_text: Option<String>,
}

/// Self-contained scoring request. Everything the worker needs to call the
/// provider travels with the job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiJob {
    pub job_id: String,
    pub attempt_id: String,
    pub user_id: String,
    pub language_id: String,
    pub task_type: SpeakingTaskType,
    pub strictness: u8,
    pub items: Vec<AiJobItem>,
    #[serde(default)]
    pub tries: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl AiJob {
    pub fn new(
        attempt_id: &str,
        user_id: &str,
        language_id: &str,
        task_type: SpeakingTaskType,
        strictness: u8,
        items: Vec<AiJobItem>,
    ) -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            attempt_id: attempt_id.to_string(),
            user_id: user_id.to_string(),
            language_id: language_id.to_string(),
            task_type,
            strictness,
            items,
            tries: 0,
            enqueued_at: Utc::now(),
        }
    }
}

/// A reserved job. Must be acked once handled, whatever the outcome.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub job: AiJob,
    raw: String,
}

#[derive(Clone)]
pub struct RedisJobQueue {
    commands: RedisCache,
    /// Dedicated connection for blocking pops so they never stall other commands.
    blocking: RedisCache,
}

impl RedisJobQueue {
    pub async fn connect(redis_url: &str) -> Result<Self, CoordinationError> {
        Ok(Self {
            commands: RedisCache::connect(redis_url).await?,
            blocking: RedisCache::connect(redis_url).await?,
        })
    }

    async fn enqueue(&self, job: &AiJob) -> Result<(), CoordinationError> {
        let raw = serde_json::to_string(job)?;
        let mut conn = self.commands.connection();
        let _: i64 = redis::cmd("LPUSH")
            .arg(AI_QUEUE_READY_KEY)
            .arg(raw)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn defer(&self, job: &AiJob, delay: Duration) -> Result<(), CoordinationError> {
        let raw = serde_json::to_string(job)?;
        let due_ms = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        let mut conn = self.commands.connection();
        let _: i64 = redis::cmd("ZADD")
            .arg(AI_QUEUE_DELAYED_KEY)
            .arg(due_ms)
            .arg(raw)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn promote_due(&self) -> Result<usize, CoordinationError> {
        let mut conn = self.commands.connection();
        let moved: i64 = redis::Script::new(PROMOTE_DUE_LUA)
            .key(AI_QUEUE_DELAYED_KEY)
            .key(AI_QUEUE_READY_KEY)
            .arg(Utc::now().timestamp_millis())
            .arg(PROMOTE_BATCH)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved.max(0) as usize)
    }

    async fn reserve(&self, wait: Duration) -> Result<Option<Delivery>, CoordinationError> {
        self.promote_due().await?;
        let mut conn = self.blocking.connection();
        let raw: Option<String> = redis::cmd("BLMOVE")
            .arg(AI_QUEUE_READY_KEY)
            .arg(AI_QUEUE_PROCESSING_KEY)
            .arg("RIGHT")
            .arg("LEFT")
            .arg(wait.as_secs_f64().max(0.1))
            .query_async(&mut conn)
            .await?;

        let Some(raw) = raw else {
            return Ok(None);
        };
        match serde_json::from_str::<AiJob>(&raw) {
            Ok(job) => Ok(Some(Delivery { job, raw })),
            Err(err) => {
                tracing::error!(error = %err, "dropping undecodable AI job");
                let _: i64 = redis::cmd("LREM")
                    .arg(AI_QUEUE_PROCESSING_KEY)
                    .arg(1)
                    .arg(&raw)
                    .query_async(&mut conn)
                    .await?;
                Ok(None)
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), CoordinationError> {
        let mut conn = self.commands.connection();
        let _: i64 = redis::cmd("LREM")
            .arg(AI_QUEUE_PROCESSING_KEY)
            .arg(1)
            .arg(&delivery.raw)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn recover_in_flight(&self) -> Result<usize, CoordinationError> {
        let mut conn = self.commands.connection();
        let mut moved = 0;
        loop {
            let raw: Option<String> = redis::cmd("LMOVE")
                .arg(AI_QUEUE_PROCESSING_KEY)
                .arg(AI_QUEUE_READY_KEY)
                .arg("RIGHT")
                .arg("LEFT")
                .query_async(&mut conn)
                .await?;
            if raw.is_none() {
                break;
            }
            moved += 1;
        }
        Ok(moved)
    }
}

#[derive(Default)]
struct MemoryLanes {
    ready: VecDeque<AiJob>,
    delayed: Vec<(Instant, AiJob)>,
    /// Reserved but not yet acked.
    in_flight: Vec<AiJob>,
    closed: bool,
}

#[derive(Default)]
pub struct MemoryJobQueue {
    lanes: Mutex<MemoryLanes>,
    notify: Notify,
}

impl MemoryJobQueue {
    pub fn ready_len(&self) -> usize {
        self.lanes.lock().ready.len()
    }

    pub fn delayed_len(&self) -> usize {
        self.lanes.lock().delayed.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.lanes.lock().in_flight.len()
    }

    pub fn drain_ready(&self) -> Vec<AiJob> {
        self.lanes.lock().ready.drain(..).collect()
    }

    /// Rejects every later enqueue and defer. Jobs already queued stay.
    pub fn close(&self) {
        self.lanes.lock().closed = true;
        self.notify.notify_waiters();
    }

    fn push(&self, job: AiJob) -> Result<(), CoordinationError> {
        let mut lanes = self.lanes.lock();
        if lanes.closed {
            return Err(CoordinationError::Closed);
        }
        lanes.ready.push_back(job);
        drop(lanes);
        self.notify.notify_one();
        Ok(())
    }

    fn push_delayed(&self, job: AiJob, delay: Duration) -> Result<(), CoordinationError> {
        let mut lanes = self.lanes.lock();
        if lanes.closed {
            return Err(CoordinationError::Closed);
        }
        lanes.delayed.push((Instant::now() + delay, job));
        drop(lanes);
        self.notify.notify_one();
        Ok(())
    }

    /// Pops the next ready job, promoting due delayed jobs first. Returns the
    /// instant the next delayed job becomes due when nothing is ready.
    fn pop(&self) -> (Option<AiJob>, Option<Instant>) {
        let now = Instant::now();
        let mut lanes = self.lanes.lock();
        let mut pending = Vec::with_capacity(lanes.delayed.len());
        for (due, job) in std::mem::take(&mut lanes.delayed) {
            if due <= now {
                lanes.ready.push_back(job);
            } else {
                pending.push((due, job));
            }
        }
        lanes.delayed = pending;
        let next_due = lanes.delayed.iter().map(|(due, _)| *due).min();
        let job = lanes.ready.pop_front();
        if let Some(job) = &job {
            lanes.in_flight.push(job.clone());
        }
        (job, next_due)
    }

    fn ack(&self, job_id: &str) {
        self.lanes.lock().in_flight.retain(|job| job.job_id != job_id);
    }

    fn recover(&self) -> usize {
        let mut lanes = self.lanes.lock();
        let recovered = std::mem::take(&mut lanes.in_flight);
        let moved = recovered.len();
        for job in recovered.into_iter().rev() {
            lanes.ready.push_front(job);
        }
        drop(lanes);
        if moved > 0 {
            self.notify.notify_one();
        }
        moved
    }

    async fn reserve(&self, wait: Duration) -> Option<AiJob> {
        let deadline = Instant::now() + wait;
        loop {
            let (job, next_due) = self.pop();
            if job.is_some() {
                return job;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let wake_at = next_due.map_or(deadline, |due| due.min(deadline));
            let _ = tokio::time::timeout_at(wake_at, self.notify.notified()).await;
        }
    }
}

/// At-least-once delivery queue for AI scoring jobs.
#[derive(Clone)]
pub enum JobQueue {
    Redis(RedisJobQueue),
    Memory(Arc<MemoryJobQueue>),
}

impl JobQueue {
    pub fn memory() -> (Self, Arc<MemoryJobQueue>) {
        let queue = Arc::new(MemoryJobQueue::default());
        (JobQueue::Memory(Arc::clone(&queue)), queue)
    }

    pub async fn enqueue(&self, job: &AiJob) -> Result<(), CoordinationError> {
        match self {
            JobQueue::Redis(queue) => queue.enqueue(job).await,
            JobQueue::Memory(queue) => queue.push(job.clone()),
        }
    }

    pub async fn defer(&self, job: &AiJob, delay: Duration) -> Result<(), CoordinationError> {
        match self {
            JobQueue::Redis(queue) => queue.defer(job, delay).await,
            JobQueue::Memory(queue) => queue.push_delayed(job.clone(), delay),
        }
    }

    pub async fn reserve(&self, wait: Duration) -> Result<Option<Delivery>, CoordinationError> {
        match self {
            JobQueue::Redis(queue) => queue.reserve(wait).await,
            JobQueue::Memory(queue) => Ok(queue.reserve(wait).await.map(|job| Delivery {
                job,
                raw: String::new(),
            })),
        }
    }

    pub async fn ack(&self, delivery: &Delivery) -> Result<(), CoordinationError> {
        match self {
            JobQueue::Redis(queue) => queue.ack(delivery).await,
            JobQueue::Memory(queue) => {
                queue.ack(&delivery.job.job_id);
                Ok(())
            }
        }
    }

    /// Returns jobs left in the processing list by a crashed worker to the
    /// ready list. Run once at worker startup.
    pub async fn recover_in_flight(&self) -> Result<usize, CoordinationError> {
        match self {
            JobQueue::Redis(queue) => queue.recover_in_flight().await,
            JobQueue::Memory(queue) => Ok(queue.recover()),
        }
    }
}
