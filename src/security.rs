use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode, header::HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashMap, convert::Infallible, env, sync::Arc, time::Instant};
use tokio::sync::Mutex;
use tracing::warn;

pub const ADMIN_KEY_HEADER: &str = "X-Admin-Key";

/// Guards the settings and resync routes. Without a configured key every
/// admin request is refused.
#[derive(Clone)]
pub struct AdminAuth {
    key: Option<Arc<str>>,
}

impl AdminAuth {
    pub fn new(key: Option<String>) -> Self {
        let key = key
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .map(Arc::from);
        if key.is_none() {
            warn!(target = "mautic_sync.api", "ADMIN_API_KEY not set; admin routes are disabled");
        }
        Self { key }
    }

    fn accepts(&self, presented: &str) -> bool {
        self.key
            .as_deref()
            .is_some_and(|expected| constant_time_eq(expected.as_bytes(), presented.as_bytes()))
    }
}

pub async fn require_admin(
    State(auth): State<AdminAuth>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    if auth.key.is_none() {
        return Ok(error_response(
            StatusCode::FORBIDDEN,
            "admin_disabled",
            "Set ADMIN_API_KEY to enable admin routes",
        ));
    }
    let Some(presented) = presented_key(request.headers()) else {
        return Ok(error_response(
            StatusCode::UNAUTHORIZED,
            "missing_admin_key",
            "Provide X-Admin-Key or Bearer token",
        ));
    };
    if !auth.accepts(&presented) {
        return Ok(error_response(
            StatusCode::UNAUTHORIZED,
            "invalid_admin_key",
            "Key not recognized",
        ));
    }
    Ok(next.run(request).await)
}

fn presented_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string());
    }
    headers
        .get(ADMIN_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (status, Json(payload)).into_response()
}

/// Clients tracked before idle buckets are swept.
const MAX_TRACKED_CLIENTS: usize = 10_000;
/// Shared bucket for new clients while the table is full of active ones.
const OVERFLOW_CLIENT: &str = "overflow";

/// Per-client token buckets for the unauthenticated lead endpoints.
#[derive(Clone)]
pub struct RateLimiter {
    rate_per_sec: f64,
    capacity: f64,
    max_clients: usize,
    buckets: Arc<Mutex<HashMap<String, Bucket>>>,
}

struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

impl Bucket {
    fn level(&self, now: Instant, rate_per_sec: f64, capacity: f64) -> f64 {
        let elapsed = now.duration_since(self.refilled_at).as_secs_f64();
        (self.tokens + elapsed * rate_per_sec).min(capacity)
    }
}

enum Verdict {
    Allowed { remaining: f64 },
    Limited { retry_after: f64 },
}

impl RateLimiter {
    pub fn new(rate_per_sec: f64, capacity: f64) -> Self {
        Self {
            rate_per_sec: rate_per_sec.max(f64::MIN_POSITIVE),
            capacity: capacity.max(1.0),
            max_clients: MAX_TRACKED_CLIENTS,
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    #[cfg(test)]
    fn with_max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients.max(1);
        self
    }

    pub fn from_env() -> Self {
        let read = |name: &str, default: f64| {
            env::var(name)
                .ok()
                .and_then(|value| value.parse::<f64>().ok())
                .filter(|value| *value > 0.0)
                .unwrap_or(default)
        };
        Self::new(read("RATE_LIMIT_PER_SEC", 2.0), read("RATE_LIMIT_CAPACITY", 10.0))
    }

    async fn take(&self, client: &str) -> Verdict {
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();
        let mut key = client;
        if !buckets.contains_key(key) && buckets.len() >= self.max_clients {
            // A refilled bucket is indistinguishable from a fresh one.
            let (rate, capacity) = (self.rate_per_sec, self.capacity);
            buckets.retain(|_, bucket| bucket.level(now, rate, capacity) < capacity);
            if buckets.len() >= self.max_clients {
                key = OVERFLOW_CLIENT;
            }
        }
        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: self.capacity,
            refilled_at: now,
        });
        bucket.tokens = bucket.level(now, self.rate_per_sec, self.capacity);
        bucket.refilled_at = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Verdict::Allowed {
                remaining: bucket.tokens,
            }
        } else {
            Verdict::Limited {
                retry_after: (1.0 - bucket.tokens) / self.rate_per_sec,
            }
        }
    }

    fn limit_headers(&self, headers: &mut http::HeaderMap, remaining: f64) {
        headers.insert("X-RateLimit-Limit", header_number(self.capacity as u64));
        headers.insert(
            "X-RateLimit-Remaining",
            header_number(remaining.max(0.0).floor() as u64),
        );
    }
}

fn header_number(value: u64) -> HeaderValue {
    HeaderValue::from_str(&value.to_string()).unwrap_or_else(|_| HeaderValue::from_static("0"))
}

pub async fn rate_limit(
    State(limiter): State<RateLimiter>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let client = client_key(request.headers());
    match limiter.take(&client).await {
        Verdict::Allowed { remaining } => {
            let mut response = next.run(request).await;
            limiter.limit_headers(response.headers_mut(), remaining);
            Ok(response)
        }
        Verdict::Limited { retry_after } => {
            warn!(target = "mautic_sync.api", client = %client, "lead submission rate limited");
            let mut response = error_response(
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                "Too many requests",
            );
            limiter.limit_headers(response.headers_mut(), 0.0);
            response.headers_mut().insert(
                http::header::RETRY_AFTER,
                header_number(retry_after.ceil().max(1.0) as u64),
            );
            Ok(response)
        }
    }
}

/// First hop of `X-Forwarded-For`, else a shared bucket.
fn client_key(headers: &http::HeaderMap) -> String {
    headers
        .get("X-Forwarded-For")
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .unwrap_or("anonymous")
        .to_string()
}
