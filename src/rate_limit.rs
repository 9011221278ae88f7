//! Per-caller fixed-window rate limiting for tenant creation.
//!
//! Callers are keyed by peer address. `X-Forwarded-For` / `X-Real-IP` are
//! only honoured when the limiter trusts a fronting proxy, since any client
//! can set them. The window table is an LRU so memory stays bounded no matter
//! how many distinct callers show up.

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{Extensions, HeaderMap};
use axum::middleware::Next;
use axum::response::Response;
use lru::LruCache;
use metrics::counter;
use tokio::sync::Mutex;

use crate::error::{ApiError, rate_limited};

const ANONYMOUS_CALLER: &str = "anonymous";

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    /// Rejected; retry after this many seconds
    Limited { retry_after_secs: u64 },
}

/// Fixed-window limiter: `limit` requests per `window` per caller.
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    trust_proxy: bool,
    windows: Mutex<LruCache<String, Window>>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration, max_callers: usize) -> Self {
        let capacity = NonZeroUsize::new(max_callers).unwrap_or(NonZeroUsize::MIN);
        Self {
            limit,
            window,
            trust_proxy: false,
            windows: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Key callers by forwarded headers set by a trusted reverse proxy.
    pub fn with_trust_proxy(mut self, trust_proxy: bool) -> Self {
        self.trust_proxy = trust_proxy;
        self
    }

    /// Count one request for `caller`.
    pub async fn check(&self, caller: &str) -> RateDecision {
        self.check_at(caller, Instant::now()).await
    }

    async fn check_at(&self, caller: &str, now: Instant) -> RateDecision {
        let mut windows = self.windows.lock().await;

        let expired = windows
            .peek(caller)
            .is_none_or(|window| now.duration_since(window.started) >= self.window);

        if expired {
            windows.put(
                caller.to_string(),
                Window {
                    started: now,
                    count: 0,
                },
            );
        }

        let Some(window) = windows.get_mut(caller) else {
            return RateDecision::Allowed {
                remaining: self.limit,
            };
        };

        if window.count >= self.limit {
            let elapsed = now.duration_since(window.started);
            let remaining = self.window.saturating_sub(elapsed);
            // Round up so callers never retry inside the window.
            let retry_after_secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
            return RateDecision::Limited {
                retry_after_secs: retry_after_secs.max(1),
            };
        }

        window.count += 1;
        RateDecision::Allowed {
            remaining: self.limit - window.count,
        }
    }
}

/// Identify the caller of a request by peer address, or by forwarded address
/// when `trust_proxy` is set.
pub fn caller_key(headers: &HeaderMap, extensions: &Extensions, trust_proxy: bool) -> String {
    if trust_proxy && let Some(forwarded) = forwarded_for(headers) {
        return forwarded;
    }

    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| ANONYMOUS_CALLER.to_string())
}

fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    let from_forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());

    let from_real_ip = || {
        headers
            .get("x-real-ip")
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };

    from_forwarded.or_else(from_real_ip).map(str::to_string)
}

/// Middleware rejecting callers over their window with 429 and `Retry-After`.
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let caller = caller_key(request.headers(), request.extensions(), limiter.trust_proxy);

    match limiter.check(&caller).await {
        RateDecision::Allowed { .. } => Ok(next.run(request).await),
        RateDecision::Limited { retry_after_secs } => {
            counter!("tenant_create_rate_limited_total").increment(1);
            tracing::warn!(caller = %caller, retry_after_secs, "Tenant create rate limit exceeded");
            Err(rate_limited(retry_after_secs))
        }
    }
}
