pub mod migrate;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;

use crate::config::env_u64;

const DEFAULT_MAX_CONNECTIONS: u32 = 10;
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(15);
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(3);

pub struct DatabaseProxy {
    pool: PgPool,
    healthy: AtomicBool,
}

impl DatabaseProxy {
    pub async fn connect(url: &str) -> Result<Arc<Self>, DbInitError> {
        let max_connections = env_u64("DATABASE_MAX_CONNECTIONS")
            .map(|v| v as u32)
            .unwrap_or(DEFAULT_MAX_CONNECTIONS);

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await?;

        migrate::run_migrations(&pool).await?;

        let proxy = Arc::new(Self {
            pool,
            healthy: AtomicBool::new(true),
        });
        proxy.start_health_monitor();
        Ok(proxy)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub async fn ping(&self) -> bool {
        matches!(
            tokio::time::timeout(HEALTH_CHECK_TIMEOUT, sqlx::query("SELECT 1").execute(&self.pool)).await,
            Ok(Ok(_))
        )
    }

    fn start_health_monitor(self: &Arc<Self>) {
        let proxy = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(HEALTH_CHECK_INTERVAL).await;
                let Some(proxy) = proxy.upgrade() else {
                    break;
                };
                let healthy = proxy.ping().await;
                let was_healthy = proxy.healthy.swap(healthy, Ordering::Relaxed);
                if was_healthy != healthy {
                    if healthy {
                        tracing::info!("database connection recovered");
                    } else {
                        tracing::warn!("database health check failing");
                    }
                }
            }
        });
    }
}

#[derive(Debug, Error)]
pub enum DbInitError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Migration(#[from] migrate::MigrationError),
}
