use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::core::BucketConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub log_level: String,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    /// Run the scoring pool inside the API process as well.
    pub embedded_worker: bool,
    pub ai: AiConfig,
    pub sweeper: SweeperConfig,
}

impl Config {
    pub fn from_env() -> Self {
        let port = std::env::var("PORT")
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(3000);

        let host = std::env::var("HOST")
            .ok()
            .and_then(|value| value.parse::<IpAddr>().ok())
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));

        let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

        Self {
            host,
            port,
            log_level,
            database_url: env_string("DATABASE_URL"),
            redis_url: env_string("REDIS_URL"),
            embedded_worker: env_bool("AI_WORKER_EMBEDDED"),
            ai: AiConfig::from_env(),
            sweeper: SweeperConfig::from_env(),
        }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// Throughput and retry knobs for the asynchronous speech scoring pipeline.
#[derive(Debug, Clone)]
pub struct AiConfig {
    pub global_per_min: u32,
    pub user_per_min: u32,
    /// Per-user bucket capacity: how many calls one user may make back to back.
    pub burst: u32,
    /// Global bucket capacity.
    pub global_burst: u32,
    pub window: Duration,
    pub job_timeout: Duration,
    pub max_tries: u32,
    pub max_jobs: u32,
    pub rate_limit_defer: Duration,
    pub dedup_ttl: Duration,
    pub default_strictness: u8,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            global_per_min: 60,
            user_per_min: 10,
            burst: 5,
            global_burst: 60,
            window: Duration::from_secs(60),
            job_timeout: Duration::from_secs(60),
            max_tries: 6,
            max_jobs: 200,
            rate_limit_defer: Duration::from_secs(5),
            dedup_ttl: Duration::from_secs(120),
            default_strictness: 75,
        }
    }
}

impl AiConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            global_per_min: env_u32("AI_RATE_GLOBAL_PER_MIN").unwrap_or(defaults.global_per_min),
            user_per_min: env_u32("AI_RATE_USER_PER_MIN").unwrap_or(defaults.user_per_min),
            burst: env_u32("AI_RATE_BURST")
                .filter(|v| *v > 0)
                .unwrap_or(defaults.burst),
            global_burst: env_u32("AI_RATE_GLOBAL_BURST")
                .filter(|v| *v > 0)
                .unwrap_or(defaults.global_burst),
            window: env_u64("AI_RATE_WINDOW_SECS")
                .filter(|v| *v > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.window),
            job_timeout: env_u64("AI_JOB_TIMEOUT_SECS")
                .filter(|v| *v > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.job_timeout),
            max_tries: env_u32("AI_JOB_MAX_TRIES")
                .filter(|v| *v > 0)
                .unwrap_or(defaults.max_tries),
            max_jobs: env_u32("AI_MAX_JOBS")
                .filter(|v| *v > 0)
                .unwrap_or(defaults.max_jobs),
            rate_limit_defer: env_u64("AI_RATE_LIMIT_DEFER_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.rate_limit_defer),
            dedup_ttl: env_u64("AI_DEDUP_TTL_SECS")
                .filter(|v| *v > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.dedup_ttl),
            default_strictness: env_u64("AI_DEFAULT_STRICTNESS")
                .map(|v| v.min(100) as u8)
                .unwrap_or(defaults.default_strictness),
        }
    }

    pub fn global_bucket(&self) -> BucketConfig {
        BucketConfig::new(self.global_per_min, self.window, self.global_burst)
    }

    pub fn user_bucket(&self) -> BucketConfig {
        BucketConfig::new(self.user_per_min, self.window, self.burst)
    }
}

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub enabled: bool,
    pub schedule: String,
    pub stale_after: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            schedule: "0 */5 * * * *".to_string(),
            stale_after: Duration::from_secs(900),
        }
    }
}

impl SweeperConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: env_string("STALE_SWEEPER_ENABLED")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(defaults.enabled),
            schedule: env_string("STALE_ATTEMPT_SCHEDULE").unwrap_or(defaults.schedule),
            stale_after: env_u64("STALE_ATTEMPT_AFTER_SECS")
                .filter(|v| *v > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.stale_after),
        }
    }
}

pub(crate) fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

pub(crate) fn env_u64(key: &str) -> Option<u64> {
    env_string(key)?.trim().parse().ok()
}

/// Out-of-range values fall back to the caller's default instead of wrapping.
pub(crate) fn env_u32(key: &str) -> Option<u32> {
    env_u64(key).and_then(|v| u32::try_from(v).ok())
}

pub(crate) fn env_bool(key: &str) -> bool {
    env_string(key)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}
