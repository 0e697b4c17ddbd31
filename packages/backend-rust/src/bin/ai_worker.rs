use lingo_review_backend::config::Config;
use lingo_review_backend::services::scoring_provider::ScoringProvider;
use lingo_review_backend::workers::WorkerManager;
use lingo_review_backend::{logging, shutdown_signal, Backends};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let config = Config::from_env();
    let _log_guard = logging::init_tracing(&config.log_level, "ai-worker");

    let backends = match Backends::connect(&config).await {
        Ok(backends) => backends,
        Err(err) => {
            tracing::error!(error = %err, "startup failed");
            std::process::exit(1);
        }
    };
    if !backends.is_distributed() {
        tracing::warn!("REDIS_URL not set; this worker only sees jobs queued in its own process");
    }

    let ctx = backends.scoring_context(&config, ScoringProvider::from_env());
    let manager = match WorkerManager::new(ctx, config.sweeper.clone()).await {
        Ok(manager) => manager,
        Err(err) => {
            tracing::error!(error = %err, "worker manager not initialized");
            std::process::exit(1);
        }
    };
    if let Err(err) = manager.start().await {
        tracing::error!(error = %err, "failed to start workers");
        std::process::exit(1);
    }

    tracing::info!(
        max_jobs = config.ai.max_jobs,
        store = backends.store.backend_name(),
        "AI worker running"
    );
    shutdown_signal().await;
    manager.stop().await;
}
