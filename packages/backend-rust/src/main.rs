use std::net::SocketAddr;
use std::sync::Arc;

use lingo_review_backend::config::Config;
use lingo_review_backend::services::scoring_provider::ScoringProvider;
use lingo_review_backend::workers::WorkerManager;
use lingo_review_backend::{create_app_with, logging, shutdown_signal, Backends};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let config = Config::from_env();
    let _log_guard = logging::init_tracing(&config.log_level, "review-backend");

    let backends = match Backends::connect(&config).await {
        Ok(backends) => backends,
        Err(err) => {
            tracing::error!(error = %err, "startup failed");
            std::process::exit(1);
        }
    };

    // Without Redis nothing outside this process can drain the queue.
    let worker_manager = if config.embedded_worker || !backends.is_distributed() {
        let ctx = backends.scoring_context(&config, ScoringProvider::from_env());
        match WorkerManager::new(ctx, config.sweeper.clone()).await {
            Ok(manager) => {
                if let Err(e) = manager.start().await {
                    tracing::error!(error = %e, "failed to start workers");
                }
                Some(Arc::new(manager))
            }
            Err(e) => {
                tracing::warn!(error = %e, "worker manager not initialized");
                None
            }
        }
    } else {
        None
    };

    let app = create_app_with(backends.app_state(config.clone()));

    let addr = config.bind_addr();
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(%addr, error = %err, "bind listener failed");
            std::process::exit(1);
        }
    };
    tracing::info!(%addr, store = backends.store.backend_name(), "review backend listening");

    let server = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal());

    if let Err(e) = server.await {
        tracing::error!(error = %e, "server error");
    }

    tracing::info!("HTTP server stopped, initiating graceful shutdown sequence");

    if let Some(ref manager) = worker_manager {
        manager.stop().await;
    }

    tracing::info!("Graceful shutdown complete");
}
