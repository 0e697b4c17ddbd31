use std::sync::Arc;
use std::time::{Instant, SystemTime};

use crate::config::Config;
use crate::core::JobQueue;
use crate::db::DatabaseProxy;
use crate::store::ReviewStore;

#[derive(Clone)]
pub struct AppState {
    store: ReviewStore,
    queue: JobQueue,
    config: Arc<Config>,
    db_proxy: Option<Arc<DatabaseProxy>>,
    started_at: Instant,
    started_at_system: SystemTime,
}

impl AppState {
    pub fn new(
        store: ReviewStore,
        queue: JobQueue,
        config: Config,
        db_proxy: Option<Arc<DatabaseProxy>>,
    ) -> Self {
        Self {
            store,
            queue,
            config: Arc::new(config),
            db_proxy,
            started_at: Instant::now(),
            started_at_system: SystemTime::now(),
        }
    }

    pub fn store(&self) -> &ReviewStore {
        &self.store
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn db_proxy(&self) -> Option<Arc<DatabaseProxy>> {
        self.db_proxy.clone()
    }

    pub fn started_at_system(&self) -> SystemTime {
        self.started_at_system
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
