pub mod ai_scoring;
pub mod stale_attempts;

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::config::SweeperConfig;
use crate::core::{CoordinationError, JobQueue};
use crate::store::StoreError;

pub use ai_scoring::{process_delivery, process_job, JobOutcome, ScoringContext};

static WORKER_LEADER: AtomicBool = AtomicBool::new(false);

pub fn is_worker_leader() -> bool {
    WORKER_LEADER.load(Ordering::Relaxed)
}

fn set_worker_leader(val: bool) {
    WORKER_LEADER.store(val, Ordering::Relaxed);
}

/// Owns the scoring pool and the cron-driven maintenance jobs of one worker
/// process.
pub struct WorkerManager {
    scheduler: Mutex<JobScheduler>,
    shutdown_tx: broadcast::Sender<()>,
    pool: Mutex<Option<JoinHandle<()>>>,
    ctx: ScoringContext,
    sweeper: SweeperConfig,
}

impl WorkerManager {
    pub async fn new(ctx: ScoringContext, sweeper: SweeperConfig) -> Result<Self, WorkerError> {
        let scheduler = JobScheduler::new().await.map_err(WorkerError::Scheduler)?;
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            shutdown_tx,
            pool: Mutex::new(None),
            ctx,
            sweeper,
        })
    }

    pub async fn start(&self) -> Result<(), WorkerError> {
        // Only one process should recover and sweep; every process may score.
        let leader = leader_from_env();
        recover_in_flight_jobs(&self.ctx.queue, leader).await;

        let pool = tokio::spawn(ai_scoring::run_pool(
            self.ctx.clone(),
            self.shutdown_tx.subscribe(),
        ));
        *self.pool.lock().await = Some(pool);

        if !leader || !self.sweeper.enabled {
            info!("Stale attempt sweeper disabled for this process");
            return Ok(());
        }
        set_worker_leader(true);

        let scheduler = self.scheduler.lock().await;
        let store = self.ctx.store.clone();
        let queue = self.ctx.queue.clone();
        let stale_after = self.sweeper.stale_after;
        let max_tries = self.ctx.config.max_tries;
        let shutdown_rx = self.shutdown_tx.subscribe();
        let job = Job::new_async(self.sweeper.schedule.as_str(), move |_uuid, _lock| {
            let store = store.clone();
            let queue = queue.clone();
            let mut rx = shutdown_rx.resubscribe();
            Box::pin(async move {
                tokio::select! {
                    _ = rx.recv() => {},
                    result = stale_attempts::sweep_stale_attempts(&store, &queue, stale_after, max_tries, Utc::now()) => {
                        if let Err(e) = result {
                            error!(error = %e, "Stale attempt sweeper error");
                        }
                    }
                }
            })
        })
        .map_err(WorkerError::Scheduler)?;
        scheduler.add(job).await.map_err(WorkerError::Scheduler)?;
        scheduler.start().await.map_err(WorkerError::Scheduler)?;
        info!(schedule = %self.sweeper.schedule, "Stale attempt sweeper scheduled");

        Ok(())
    }

    pub async fn stop(&self) {
        info!("Stopping workers...");
        let _ = self.shutdown_tx.send(());

        if let Some(pool) = self.pool.lock().await.take() {
            if let Err(e) = pool.await {
                warn!(error = %e, "Scoring pool task ended abnormally");
            }
        }

        if is_worker_leader() {
            let mut scheduler = self.scheduler.lock().await;
            if let Err(e) = scheduler.shutdown().await {
                warn!(error = %e, "Error shutting down scheduler");
            }
            set_worker_leader(false);
        }
        info!("Workers stopped");
    }
}

fn leader_from_env() -> bool {
    std::env::var("WORKER_LEADER")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(true)
}

/// Moves jobs orphaned by a crashed worker back to the ready list. A
/// non-leader skips this, since the processing list also holds jobs that
/// live workers are still scoring.
async fn recover_in_flight_jobs(queue: &JobQueue, leader: bool) -> usize {
    if !leader {
        return 0;
    }
    match queue.recover_in_flight().await {
        Ok(0) => 0,
        Ok(recovered) => {
            info!(recovered, "Recovered in-flight scoring jobs");
            recovered
        }
        Err(e) => {
            warn!(error = %e, "Failed to recover in-flight scoring jobs");
            0
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] tokio_cron_scheduler::JobSchedulerError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Queue error: {0}")]
    Queue(#[from] CoordinationError),
}
