use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::OnceLock;
use std::time::Duration;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{header::RETRY_AFTER, HeaderName, HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tokio::time::Instant;

use crate::cache::keys;
use crate::config::{env_string, env_u64};
use crate::core::token_bucket::{BucketConfig, BucketDecision, MemoryBuckets};
use crate::response::json_error;

const RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("ratelimit-limit");
const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("ratelimit-remaining");
const RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("ratelimit-reset");

const DEFAULT_API_WINDOW_MS: u64 = 900_000;
const DEFAULT_API_MAX: u64 = 500;

static API_LIMITER: OnceLock<HttpRateLimiter> = OnceLock::new();

/// Per-client token bucket for the public API.
pub struct HttpRateLimiter {
    buckets: MemoryBuckets,
    config: BucketConfig,
    max: u32,
}

impl HttpRateLimiter {
    pub fn new(window: Duration, max: u32) -> Self {
        let max = max.max(1);
        Self {
            buckets: MemoryBuckets::new(),
            config: BucketConfig::new(max, window, max),
            max,
        }
    }

    fn from_env() -> Self {
        let window_ms = env_u64("RATE_LIMIT_WINDOW_MS")
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_API_WINDOW_MS);
        let max = env_u64("RATE_LIMIT_MAX").unwrap_or(DEFAULT_API_MAX);
        Self::new(Duration::from_millis(window_ms), max.min(u64::from(u32::MAX)) as u32)
    }

    pub fn check_at(&self, ip: IpAddr, now: Instant) -> BucketDecision {
        if self.buckets.len() > 10_000 {
            self.buckets.prune(self.config.window);
        }
        self.buckets
            .try_consume_at(&keys::http_rate_key(&ip.to_string()), self.config, 1.0, now)
    }

    fn window_secs(&self) -> u64 {
        self.config.window.as_secs().max(1)
    }
}

pub async fn api_rate_limit_middleware(req: Request<Body>, next: Next) -> Response {
    let path = req.uri().path();
    if !matches_api_prefix(path) || is_test_env() || is_loopback_request(&req) {
        return next.run(req).await;
    }

    let limiter = API_LIMITER.get_or_init(HttpRateLimiter::from_env);
    let ip = extract_client_ip(&req).unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    let decision = limiter.check_at(ip, Instant::now());

    if !decision.allowed {
        tracing::debug!(%ip, "API rate limit exceeded");
        let mut res = json_error(
            StatusCode::TOO_MANY_REQUESTS,
            "TOO_MANY_REQUESTS",
            "too many requests, please retry later",
        )
        .into_response();
        apply_rate_limit_headers(&mut res, limiter, decision);
        return res;
    }

    let mut res = next.run(req).await;
    apply_rate_limit_headers(&mut res, limiter, decision);
    res
}

fn apply_rate_limit_headers(res: &mut Response, limiter: &HttpRateLimiter, decision: BucketDecision) {
    let headers = res.headers_mut();
    headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(limiter.max));
    headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(decision.remaining));

    let reset_secs = if decision.allowed {
        limiter.window_secs()
    } else {
        decision.retry_after.as_millis().div_ceil(1000).max(1) as u64
    };
    headers.insert(RATE_LIMIT_RESET, HeaderValue::from(reset_secs));
    if !decision.allowed {
        headers.insert(RETRY_AFTER, HeaderValue::from(reset_secs));
    }
}

fn matches_api_prefix(path: &str) -> bool {
    path == "/api" || path.starts_with("/api/")
}

fn is_test_env() -> bool {
    matches!(env_string("NODE_ENV").as_deref(), Some("test"))
        || matches!(env_string("APP_ENV").as_deref(), Some("test"))
}

fn is_loopback_request(req: &Request<Body>) -> bool {
    extract_client_ip(req)
        .map(|ip| ip.is_loopback())
        .unwrap_or(false)
}

fn extract_client_ip(req: &Request<Body>) -> Option<IpAddr> {
    if trust_proxy_enabled() {
        if let Some(ip) = extract_x_forwarded_for(req) {
            return Some(ip);
        }
    }

    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

fn trust_proxy_enabled() -> bool {
    let Some(value) = env_string("TRUST_PROXY") else {
        return false;
    };
    !matches!(value.trim().to_ascii_lowercase().as_str(), "0" | "false")
}

fn extract_x_forwarded_for(req: &Request<Body>) -> Option<IpAddr> {
    let raw = req
        .headers()
        .get(HeaderName::from_static("x-forwarded-for"))?
        .to_str()
        .ok()?;
    let first = raw.split(',').next()?.trim();
    first.parse::<IpAddr>().ok()
}
