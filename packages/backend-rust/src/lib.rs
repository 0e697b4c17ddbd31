pub mod auth;
pub mod cache;
pub mod config;
pub mod core;
pub mod db;
pub mod logging;
pub mod middleware;
pub mod response;
pub mod routes;
pub mod services;
pub mod state;
pub mod store;
pub mod workers;

use std::sync::Arc;

use thiserror::Error;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::cache::RedisCache;
use crate::config::Config;
use crate::core::job_queue::RedisJobQueue;
use crate::core::{AiRateLimiter, ClaimStore, CoordinationError, JobQueue, TokenBuckets};
use crate::db::{DatabaseProxy, DbInitError};
use crate::services::scoring_provider::ScoringProvider;
use crate::state::AppState;
use crate::store::{PostgresStore, ReviewStore};
use crate::workers::ScoringContext;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("database init failed: {0}")]
    Database(#[from] DbInitError),
    #[error("redis connection failed: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("job queue init failed: {0}")]
    Queue(#[from] CoordinationError),
}

/// Storage and coordination handles shared by the API server and the worker.
#[derive(Clone)]
pub struct Backends {
    pub store: ReviewStore,
    pub queue: JobQueue,
    pub claims: ClaimStore,
    pub buckets: TokenBuckets,
    pub db_proxy: Option<Arc<DatabaseProxy>>,
}

impl Backends {
    pub fn memory() -> Self {
        let (store, _) = ReviewStore::memory();
        let (queue, _) = JobQueue::memory();
        Self {
            store,
            queue,
            claims: ClaimStore::memory(),
            buckets: TokenBuckets::memory(),
            db_proxy: None,
        }
    }

    /// Queue, claims and buckets only coordinate across processes when they
    /// live in Redis.
    pub fn is_distributed(&self) -> bool {
        matches!(self.queue, JobQueue::Redis(_))
    }

    pub async fn connect(config: &Config) -> Result<Self, StartupError> {
        let mut backends = Self::memory();

        match config.database_url.as_deref() {
            Some(url) => {
                let proxy = DatabaseProxy::connect(url).await?;
                backends.store = ReviewStore::Postgres(PostgresStore::new(Arc::clone(&proxy)));
                backends.db_proxy = Some(proxy);
                tracing::info!("review store: postgres");
            }
            None => tracing::warn!("DATABASE_URL not set; using in-memory review store"),
        }

        match config.redis_url.as_deref() {
            Some(url) => {
                let cache = RedisCache::connect(url).await?;
                backends.queue = JobQueue::Redis(RedisJobQueue::connect(url).await?);
                backends.claims = ClaimStore::Redis(cache.clone());
                backends.buckets = TokenBuckets::Redis(cache);
                tracing::info!("scoring coordination: redis");
            }
            None => tracing::warn!("REDIS_URL not set; scoring queue is process-local"),
        }

        Ok(backends)
    }

    pub fn app_state(&self, config: Config) -> AppState {
        AppState::new(self.store.clone(), self.queue.clone(), config, self.db_proxy.clone())
    }

    pub fn scoring_context(&self, config: &Config, provider: ScoringProvider) -> ScoringContext {
        ScoringContext {
            store: self.store.clone(),
            queue: self.queue.clone(),
            claims: self.claims.clone(),
            limiter: AiRateLimiter::new(self.buckets.clone(), &config.ai),
            provider,
            config: config.ai.clone(),
        }
    }
}

/// App over in-memory backends.
pub async fn create_app() -> axum::Router {
    let backends = Backends::memory();
    create_app_with(backends.app_state(Config::from_env()))
}

pub fn create_app_with(state: AppState) -> axum::Router {
    routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
