/*!
 * # Rate Limiting
 *
 * Token-bucket rate limiting at the HTTP edge. Each key owns a bucket with
 * a burst capacity and a steady refill rate; a request spends one token.
 * A rejection costs one map or script operation; no durable writes.
 *
 * Backends: an in-process DashMap store, and a Redis bucket script so
 * multiple API instances share limits. Redis failures fall back to the
 * local store rather than failing requests.
 */

use axum::{
    extract::Request,
    http::{Response, StatusCode},
};
use dashmap::DashMap;
use redis::Script;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::auth::AuthUser;

/// Helper to build numeric header values.
fn num_to_header_value<T: ToString>(n: T) -> http::HeaderValue {
    http::HeaderValue::from_str(&n.to_string())
        .expect("numeric strings are always valid header values")
}

/// Bucket parameters: `burst` capacity refilled at `rate_per_sec`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketConfig {
    pub rate_per_sec: u32,
    pub burst: u32,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            rate_per_sec: 100,
            burst: 200,
        }
    }
}

#[derive(Debug, Clone)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl BucketState {
    fn new(burst: u32) -> Self {
        Self {
            tokens: burst as f64,
            last_refill: Instant::now(),
        }
    }

    /// Refill then try to spend one token.
    fn try_take(&mut self, config: &BucketConfig) -> BucketDecision {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens =
            (self.tokens + elapsed * config.rate_per_sec as f64).min(config.burst as f64);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            BucketDecision {
                allowed: true,
                remaining: self.tokens as u32,
                retry_after_secs: 0,
            }
        } else {
            let deficit = 1.0 - self.tokens;
            let retry = (deficit / config.rate_per_sec.max(1) as f64).ceil() as u64;
            BucketDecision {
                allowed: false,
                remaining: 0,
                retry_after_secs: retry.max(1),
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BucketDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub retry_after_secs: u64,
}

#[derive(Clone)]
pub enum RateLimitBackend {
    InMemory,
    Redis {
        client: Arc<redis::Client>,
        namespace: String,
    },
}

impl Default for RateLimitBackend {
    fn default() -> Self {
        Self::InMemory
    }
}

/// KEYS[1] bucket hash. ARGV: rate, burst, now_ms.
/// Refill-then-spend in one atomic unit, mirroring the in-memory bucket.
const BUCKET_SCRIPT: &str = r#"
local rate = tonumber(ARGV[1])
local burst = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local bucket = redis.call('HMGET', KEYS[1], 'tokens', 'ts')
local tokens = tonumber(bucket[1])
local ts = tonumber(bucket[2])
if not tokens then
  tokens = burst
  ts = now
end
local elapsed = math.max(0, now - ts) / 1000.0
tokens = math.min(burst, tokens + elapsed * rate)
local allowed = 0
if tokens >= 1 then
  tokens = tokens - 1
  allowed = 1
end
redis.call('HMSET', KEYS[1], 'tokens', tokens, 'ts', now)
redis.call('EXPIRE', KEYS[1], math.ceil(burst / math.max(rate, 1)) * 2 + 60)
local retry = 0
if allowed == 0 then
  retry = math.ceil((1 - tokens) / math.max(rate, 1))
end
return {allowed, math.floor(tokens), retry}
"#;

#[derive(Clone)]
enum RateLimitStore {
    InMemory {
        buckets: Arc<DashMap<String, BucketState>>,
    },
    Redis {
        client: Arc<redis::Client>,
        namespace: String,
        script: Arc<Script>,
        fallback: Arc<DashMap<String, BucketState>>,
    },
}

#[derive(Clone)]
pub struct RateLimiter {
    store: RateLimitStore,
    config: BucketConfig,
}

impl RateLimiter {
    pub fn new(config: BucketConfig, backend: RateLimitBackend) -> Self {
        let store = match backend {
            RateLimitBackend::InMemory => RateLimitStore::InMemory {
                buckets: Arc::new(DashMap::new()),
            },
            RateLimitBackend::Redis { client, namespace } => RateLimitStore::Redis {
                client,
                namespace,
                script: Arc::new(Script::new(BUCKET_SCRIPT)),
                fallback: Arc::new(DashMap::new()),
            },
        };
        Self { store, config }
    }

    pub fn in_memory(config: BucketConfig) -> Self {
        Self::new(config, RateLimitBackend::InMemory)
    }

    /// Same store, different bucket parameters (per-path overrides).
    pub fn with_config(&self, config: BucketConfig) -> Self {
        Self {
            store: self.store.clone(),
            config,
        }
    }

    pub async fn check(&self, key: &str) -> BucketDecision {
        match &self.store {
            RateLimitStore::InMemory { buckets } => Self::check_local(buckets, key, &self.config),
            RateLimitStore::Redis {
                client,
                namespace,
                script,
                fallback,
            } => match Self::check_redis(client, namespace, script, key, &self.config).await {
                Ok(decision) => decision,
                Err(err) => {
                    warn!(error = %err, "redis rate limit check failed; using local fallback");
                    Self::check_local(fallback, key, &self.config)
                }
            },
        }
    }

    fn check_local(
        buckets: &DashMap<String, BucketState>,
        key: &str,
        config: &BucketConfig,
    ) -> BucketDecision {
        let mut bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| BucketState::new(config.burst));
        bucket.try_take(config)
    }

    async fn check_redis(
        client: &redis::Client,
        namespace: &str,
        script: &Script,
        key: &str,
        config: &BucketConfig,
    ) -> Result<BucketDecision, redis::RedisError> {
        let mut conn = client.get_async_connection().await?;
        let now_ms = chrono::Utc::now().timestamp_millis();
        let reply: Vec<i64> = script
            .key(format!("{}:{}", namespace, key))
            .arg(config.rate_per_sec)
            .arg(config.burst)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await?;

        let allowed = reply.first().copied().unwrap_or(1) == 1;
        Ok(BucketDecision {
            allowed,
            remaining: reply.get(1).copied().unwrap_or(0).max(0) as u32,
            retry_after_secs: reply.get(2).copied().unwrap_or(1).max(0) as u64,
        })
    }

    /// Drops buckets that are back at full capacity.
    pub fn cleanup_idle(&self) {
        let full = self.config.burst as f64;
        let store = match &self.store {
            RateLimitStore::InMemory { buckets } => buckets,
            RateLimitStore::Redis { fallback, .. } => fallback,
        };
        let config = self.config;
        store.retain(|_, bucket| {
            let elapsed = bucket.last_refill.elapsed().as_secs_f64();
            (bucket.tokens + elapsed * config.rate_per_sec as f64) < full
        });
    }
}

/// Per-path bucket override.
#[derive(Clone, Debug)]
pub struct PathPolicy {
    pub prefix: String,
    pub config: BucketConfig,
}

// Key extraction: prefer an authenticated user id, fall back to client IP.

pub fn extract_ip_key(request: &Request) -> String {
    if let Some(forwarded) = request.headers().get("x-forwarded-for") {
        if let Ok(forwarded_str) = forwarded.to_str() {
            if let Some(ip) = forwarded_str.split(',').next() {
                return format!("ip:{}", ip.trim());
            }
        }
    }
    if let Some(real_ip) = request.headers().get("x-real-ip") {
        if let Ok(ip_str) = real_ip.to_str() {
            return format!("ip:{}", ip_str);
        }
    }
    "ip:unknown".to_string()
}

/// Extracts the rate-limit key for an authenticated caller.
///
/// Priority:
/// 1. `AuthUser` from request extensions (set by the auth middleware after
///    bearer validation) — a client cannot forge this.
/// 2. `x-user-id` header, for internal service-to-service calls only.
pub fn extract_user_key(request: &Request) -> Option<String> {
    if let Some(auth_user) = request.extensions().get::<AuthUser>() {
        return Some(format!("user:{}", auth_user.user_id));
    }

    if let Some(user_id) = request.headers().get("x-user-id") {
        if let Ok(user_str) = user_id.to_str() {
            return Some(format!("user:{}", user_str));
        }
    }
    None
}

// Layer implementation for tower

#[derive(Clone)]
pub struct RateLimitLayer {
    rate_limiter: RateLimiter,
    path_policies: Arc<Vec<PathPolicy>>,
}

impl RateLimitLayer {
    pub fn new(config: BucketConfig, backend: RateLimitBackend) -> Self {
        Self {
            rate_limiter: RateLimiter::new(config, backend),
            path_policies: Arc::new(Vec::new()),
        }
    }

    pub fn with_policies(mut self, policies: Vec<PathPolicy>) -> Self {
        self.path_policies = Arc::new(policies);
        self
    }
}

impl<S> tower::Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            rate_limiter: self.rate_limiter.clone(),
            path_policies: self.path_policies.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    rate_limiter: RateLimiter,
    path_policies: Arc<Vec<PathPolicy>>,
}

impl<S> tower::Service<Request> for RateLimitService<S>
where
    S: tower::Service<Request, Response = Response<axum::body::Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response<axum::body::Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let rate_limiter = self.rate_limiter.clone();
        let mut inner = self.inner.clone();
        let policies = self.path_policies.clone();

        Box::pin(async move {
            let path = request.uri().path().to_string();
            if path.starts_with("/health") {
                return inner.call(request).await;
            }

            let key = extract_user_key(&request).unwrap_or_else(|| extract_ip_key(&request));

            let mut effective = rate_limiter.config;
            for policy in policies.iter() {
                if path.starts_with(&policy.prefix) {
                    effective = policy.config;
                    break;
                }
            }
            let limiter = if effective != rate_limiter.config {
                rate_limiter.with_config(effective)
            } else {
                rate_limiter.clone()
            };

            let decision = limiter.check(&format!("{}:{}", key, path)).await;
            if !decision.allowed {
                debug!(key = %key, path = %path, "rate limit exceeded");
                let mut response = Response::new(axum::body::Body::from(
                    r#"{"success":false,"error":{"code":"RATE_LIMITED","message":"rate limit exceeded"}}"#,
                ));
                *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
                let headers = response.headers_mut();
                headers.insert(
                    http::header::CONTENT_TYPE,
                    http::HeaderValue::from_static("application/json"),
                );
                headers.insert("X-RateLimit-Limit", num_to_header_value(effective.burst));
                headers.insert("X-RateLimit-Remaining", num_to_header_value(0));
                headers.insert(
                    "X-RateLimit-Reset",
                    num_to_header_value(decision.retry_after_secs),
                );
                headers.insert("Retry-After", num_to_header_value(decision.retry_after_secs));
                return Ok(response);
            }

            let mut response = inner.call(request).await?;
            let headers = response.headers_mut();
            headers.insert("X-RateLimit-Limit", num_to_header_value(effective.burst));
            headers.insert(
                "X-RateLimit-Remaining",
                num_to_header_value(decision.remaining),
            );
            Ok(response)
        })
    }
}

/// Background cleanup for idle local buckets.
pub async fn start_cleanup_task(
    rate_limiter: RateLimiter,
    period: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                rate_limiter.cleanup_idle();
                debug!("rate limiter cleanup completed");
            }
        }
    }
}

/// Builds the per-path policy table from configuration.
pub fn default_policies(reserve: BucketConfig) -> Vec<PathPolicy> {
    vec![PathPolicy {
        prefix: "/bookings/reserve".to_string(),
        config: reserve,
    }]
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn user_key_prefers_the_verified_identity_over_headers() {
        let mut request = Request::new(axum::body::Body::empty());
        request
            .headers_mut()
            .insert("x-user-id", "someone-else".parse().unwrap());
        let user_id = Uuid::new_v4();
        request.extensions_mut().insert(AuthUser {
            user_id,
            tenant_id: None,
        });

        assert_eq!(
            extract_user_key(&request),
            Some(format!("user:{}", user_id))
        );
    }

    #[test]
    fn user_key_falls_back_to_internal_header() {
        let mut request = Request::new(axum::body::Body::empty());
        request
            .headers_mut()
            .insert("x-user-id", "service-42".parse().unwrap());
        assert_eq!(
            extract_user_key(&request),
            Some("user:service-42".to_string())
        );
    }

    #[tokio::test]
    async fn bucket_allows_burst_then_rejects() {
        let limiter = RateLimiter::in_memory(BucketConfig {
            rate_per_sec: 1,
            burst: 2,
        });

        assert!(limiter.check("user:a").await.allowed);
        assert!(limiter.check("user:a").await.allowed);
        let denied = limiter.check("user:a").await;
        assert!(!denied.allowed);
        assert!(denied.retry_after_secs >= 1);
    }

    #[tokio::test]
    async fn buckets_are_per_key() {
        let limiter = RateLimiter::in_memory(BucketConfig {
            rate_per_sec: 1,
            burst: 1,
        });

        assert!(limiter.check("user:a").await.allowed);
        assert!(limiter.check("user:b").await.allowed);
        assert!(!limiter.check("user:a").await.allowed);
        assert!(!limiter.check("user:b").await.allowed);
    }

    #[tokio::test]
    async fn bucket_refills_over_time() {
        let limiter = RateLimiter::in_memory(BucketConfig {
            rate_per_sec: 1000,
            burst: 1,
        });

        assert!(limiter.check("user:a").await.allowed);
        assert!(!limiter.check("user:a").await.allowed);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(limiter.check("user:a").await.allowed);
    }

    #[tokio::test]
    async fn overrides_share_the_store() {
        let base = RateLimiter::in_memory(BucketConfig {
            rate_per_sec: 1,
            burst: 2,
        });
        let strict = base.with_config(BucketConfig {
            rate_per_sec: 1,
            burst: 1,
        });

        assert!(base.check("user:shared").await.allowed);
        // The override sees the same bucket, already down one token.
        assert!(strict.check("user:shared").await.allowed);
        assert!(!strict.check("user:shared").await.allowed);
    }
}
