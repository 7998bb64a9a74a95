use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::config::AppConfig;
use crate::error::AppError;

/// Per-user fixed-window limiter for the mutating sync endpoints.
///
/// Counts reset wholesale when a window elapses rather than sliding;
/// callers see the same 429 plus `Retry-After` contract either way.
#[derive(Clone)]
pub struct EndpointRateLimiter {
    state: Arc<Mutex<HashMap<String, RateWindow>>>,
    window: Duration,
    push_limit: u32,
    resolve_limit: u32,
    metrics: Arc<RateLimitMetrics>,
}

#[derive(Clone, Copy)]
pub enum ProtectedEndpoint {
    SyncPush,
    ResolveConflict,
}

#[derive(Default)]
struct RateLimitMetrics {
    push_allowed: AtomicU64,
    push_limited: AtomicU64,
    resolve_allowed: AtomicU64,
    resolve_limited: AtomicU64,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct RateLimitMetricsSnapshot {
    pub push_allowed: u64,
    pub push_limited: u64,
    pub resolve_allowed: u64,
    pub resolve_limited: u64,
}

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    started_at: Instant,
    count: u32,
}

impl EndpointRateLimiter {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(HashMap::new())),
            window: config.rate_limit_window,
            push_limit: config.sync_push_rate_limit_per_window,
            resolve_limit: config.resolve_rate_limit_per_window,
            metrics: Arc::new(RateLimitMetrics::default()),
        }
    }

    pub async fn check(&self, endpoint: ProtectedEndpoint, user_id: &str) -> Result<(), AppError> {
        let limit = match endpoint {
            ProtectedEndpoint::SyncPush => self.push_limit,
            ProtectedEndpoint::ResolveConflict => self.resolve_limit,
        };

        let key = format!("{}:{user_id}", endpoint.label());
        let now = Instant::now();
        let mut guard = self.state.lock().await;
        let entry = guard.entry(key).or_insert(RateWindow {
            started_at: now,
            count: 0,
        });

        if now.duration_since(entry.started_at) >= self.window {
            entry.started_at = now;
            entry.count = 0;
        }

        if entry.count >= limit {
            let retry_after_secs = self
                .window
                .saturating_sub(now.duration_since(entry.started_at))
                .as_secs();
            self.mark_limited(endpoint);
            tracing::warn!(
                endpoint = endpoint.label(),
                user = user_fingerprint(user_id),
                retry_after_secs,
                "Rate limit exceeded"
            );
            return Err(AppError::too_many_requests(
                "Rate limit exceeded for protected endpoint",
                retry_after_secs,
            ));
        }

        entry.count += 1;
        self.mark_allowed(endpoint);
        Ok(())
    }

    pub fn metrics_snapshot(&self) -> RateLimitMetricsSnapshot {
        RateLimitMetricsSnapshot {
            push_allowed: self.metrics.push_allowed.load(Ordering::Relaxed),
            push_limited: self.metrics.push_limited.load(Ordering::Relaxed),
            resolve_allowed: self.metrics.resolve_allowed.load(Ordering::Relaxed),
            resolve_limited: self.metrics.resolve_limited.load(Ordering::Relaxed),
        }
    }

    fn mark_allowed(&self, endpoint: ProtectedEndpoint) {
        match endpoint {
            ProtectedEndpoint::SyncPush => {
                self.metrics.push_allowed.fetch_add(1, Ordering::Relaxed);
            }
            ProtectedEndpoint::ResolveConflict => {
                self.metrics.resolve_allowed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn mark_limited(&self, endpoint: ProtectedEndpoint) {
        match endpoint {
            ProtectedEndpoint::SyncPush => {
                self.metrics.push_limited.fetch_add(1, Ordering::Relaxed);
            }
            ProtectedEndpoint::ResolveConflict => {
                self.metrics.resolve_limited.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl ProtectedEndpoint {
    pub const fn label(self) -> &'static str {
        match self {
            Self::SyncPush => "sync_push",
            Self::ResolveConflict => "resolve_conflict",
        }
    }
}

pub fn user_fingerprint(user_id: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    user_id.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(push_limit: u32) -> EndpointRateLimiter {
        EndpointRateLimiter {
            state: Arc::new(Mutex::new(HashMap::new())),
            window: Duration::from_secs(60),
            push_limit,
            resolve_limit: push_limit,
            metrics: Arc::new(RateLimitMetrics::default()),
        }
    }

    #[tokio::test]
    async fn rate_limiter_blocks_after_limit() {
        let limiter = limiter(2);

        limiter
            .check(ProtectedEndpoint::SyncPush, "user-a")
            .await
            .unwrap();
        limiter
            .check(ProtectedEndpoint::SyncPush, "user-a")
            .await
            .unwrap();

        let err = limiter
            .check(ProtectedEndpoint::SyncPush, "user-a")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::TooManyRequests(_, _)));

        let metrics = limiter.metrics_snapshot();
        assert_eq!(metrics.push_allowed, 2);
        assert_eq!(metrics.push_limited, 1);
    }

    #[tokio::test]
    async fn rate_limiter_isolates_users_and_endpoints() {
        let limiter = limiter(1);

        limiter
            .check(ProtectedEndpoint::SyncPush, "user-a")
            .await
            .unwrap();
        // Different user, same endpoint
        limiter
            .check(ProtectedEndpoint::SyncPush, "user-b")
            .await
            .unwrap();
        // Same user, different endpoint
        limiter
            .check(ProtectedEndpoint::ResolveConflict, "user-a")
            .await
            .unwrap();

        assert!(limiter
            .check(ProtectedEndpoint::SyncPush, "user-a")
            .await
            .is_err());
    }
}
