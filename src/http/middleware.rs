//! Rate limiting middleware for the HTTP request pipeline.
//!
//! Wraps a [`RateLimiter`] instance as an axum middleware: derives a key from
//! the request, asks the limiter for a decision, annotates the response with
//! the quota headers, and either forwards the request or short-circuits with
//! a 429 response.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::ratelimit::{Decision, Quota, RateLimiter};

/// Quota ceiling header, always present on limited routes.
pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
/// Remaining-requests header, always present on limited routes.
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
/// Seconds-until-reset header, always present on limited routes.
pub const HEADER_RESET: &str = "x-ratelimit-reset";

/// Key reported when no client address header is present.
const UNKNOWN_CLIENT: &str = "unknown";

/// Maps a request to the key its quota is tracked under.
pub type KeyExtractor = Arc<dyn Fn(&Request) -> String + Send + Sync>;

/// Decides whether the limiter should ignore a request entirely.
pub type SkipPredicate = Arc<dyn Fn(&Request) -> bool + Send + Sync>;

/// State handed to the [`rate_limit`] middleware: one limiter instance plus
/// the injected key-derivation and skip strategies.
#[derive(Clone)]
pub struct RateLimitState {
    limiter: Arc<RateLimiter>,
    key_extractor: KeyExtractor,
    skip: SkipPredicate,
}

impl RateLimitState {
    /// Create middleware state with the default key extractor and no skip.
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self {
            limiter,
            key_extractor: Arc::new(default_key_extractor),
            skip: Arc::new(|_: &Request| false),
        }
    }

    /// Replace the key extractor.
    pub fn with_key_extractor<F>(mut self, f: F) -> Self
    where
        F: Fn(&Request) -> String + Send + Sync + 'static,
    {
        self.key_extractor = Arc::new(f);
        self
    }

    /// Set a skip predicate. Skipped requests proceed unmodified: no quota
    /// headers, no store mutation.
    pub fn with_skip<F>(mut self, f: F) -> Self
    where
        F: Fn(&Request) -> bool + Send + Sync + 'static,
    {
        self.skip = Arc::new(f);
        self
    }

    /// The limiter instance behind this state.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }
}

/// Body of the 429 response.
#[derive(Debug, Serialize, Deserialize)]
pub struct RateLimitRejection {
    /// The configured rejection message
    pub error: String,
    /// Seconds the client should wait before retrying
    #[serde(rename = "retryAfter")]
    pub retry_after: u64,
}

/// Axum middleware enforcing one rate limit policy.
///
/// Use with `axum::middleware::from_fn_with_state` and a [`RateLimitState`].
pub async fn rate_limit(
    State(state): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Response {
    if (state.skip)(&request) {
        return next.run(request).await;
    }

    let key = (state.key_extractor)(&request);

    match state.limiter.check(&key) {
        Decision::Allow { quota } => {
            let mut response = next.run(request).await;
            apply_quota_headers(response.headers_mut(), &quota);
            response
        }
        Decision::Reject {
            quota,
            retry_after_secs,
            message,
        } => {
            warn!(
                key = %key,
                retry_after_secs,
                "Request rejected by rate limiter"
            );

            let body = RateLimitRejection {
                error: message,
                retry_after: retry_after_secs,
            };
            let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
            apply_quota_headers(response.headers_mut(), &quota);
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(retry_after_secs));
            response
        }
    }
}

/// Derive the client key from forwarded-address headers.
///
/// Takes the first hop of `x-forwarded-for`, then `x-real-ip`, and falls back
/// to the constant `"unknown"` when neither is usable.
pub fn default_key_extractor(request: &Request) -> String {
    let headers = request.headers();

    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first_hop) = forwarded.split(',').next() {
            let first_hop = first_hop.trim();
            if !first_hop.is_empty() {
                return first_hop.to_string();
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }

    UNKNOWN_CLIENT.to_string()
}

fn apply_quota_headers(headers: &mut HeaderMap, quota: &Quota) {
    headers.insert(HeaderName::from_static(HEADER_LIMIT), HeaderValue::from(quota.limit));
    headers.insert(
        HeaderName::from_static(HEADER_REMAINING),
        HeaderValue::from(quota.remaining),
    );
    headers.insert(
        HeaderName::from_static(HEADER_RESET),
        HeaderValue::from(quota.reset_secs),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::RateLimiterOptions;
    use axum::body::{to_bytes, Body};
    use axum::http;
    use axum::middleware::from_fn_with_state;
    use axum::routing::get;
    use axum::Router;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_limiter(max: u64) -> Arc<RateLimiter> {
        let options = RateLimiterOptions::default()
            .max(max)
            .window(Duration::from_secs(60))
            .message("limited");
        Arc::new(RateLimiter::new(options))
    }

    fn app(state: RateLimitState) -> Router {
        Router::new()
            .route("/test", get(|| async { "ok" }))
            .layer(from_fn_with_state(state, rate_limit))
    }

    fn get_request(client: &str) -> http::Request<Body> {
        http::Request::builder()
            .uri("/test")
            .header("x-forwarded-for", client)
            .body(Body::empty())
            .unwrap()
    }

    fn header_u64(response: &Response, name: &str) -> u64 {
        response
            .headers()
            .get(name)
            .expect(name)
            .to_str()
            .unwrap()
            .parse()
            .unwrap()
    }

    #[tokio::test]
    async fn test_allowed_response_carries_quota_headers() {
        let app = app(RateLimitState::new(test_limiter(5)));

        let response = app.oneshot(get_request("1.2.3.4")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header_u64(&response, HEADER_LIMIT), 5);
        assert_eq!(header_u64(&response, HEADER_REMAINING), 4);
        assert!(header_u64(&response, HEADER_RESET) >= 1);
    }

    #[tokio::test]
    async fn test_over_limit_returns_429_with_body_and_headers() {
        let app = app(RateLimitState::new(test_limiter(2)));

        for _ in 0..2 {
            let response = app.clone().oneshot(get_request("1.2.3.4")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app.oneshot(get_request("1.2.3.4")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(header_u64(&response, HEADER_LIMIT), 2);
        assert_eq!(header_u64(&response, HEADER_REMAINING), 0);

        let retry_after = header_u64(&response, "retry-after");
        assert!(retry_after > 0);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: RateLimitRejection = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body.error, "limited");
        assert_eq!(body.retry_after, retry_after);
    }

    #[tokio::test]
    async fn test_skipped_request_is_untouched() {
        let limiter = test_limiter(1);
        let state = RateLimitState::new(limiter.clone())
            .with_skip(|request: &Request| request.headers().contains_key("x-health-probe"));
        let app = app(state);

        let request = http::Request::builder()
            .uri("/test")
            .header("x-health-probe", "1")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        // No quota headers and no window created
        assert!(response.headers().get(HEADER_LIMIT).is_none());
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[tokio::test]
    async fn test_clients_are_limited_independently() {
        let app = app(RateLimitState::new(test_limiter(1)));

        let response = app.clone().oneshot(get_request("1.1.1.1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.clone().oneshot(get_request("1.1.1.1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        // A different client still has its full quota
        let response = app.oneshot(get_request("2.2.2.2")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_custom_key_extractor() {
        let state = RateLimitState::new(test_limiter(1)).with_key_extractor(|request: &Request| {
            request
                .headers()
                .get("x-api-key")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("anonymous")
                .to_string()
        });
        let app = app(state);

        let keyed = |key: &str| {
            http::Request::builder()
                .uri("/test")
                .header("x-api-key", key)
                .body(Body::empty())
                .unwrap()
        };

        assert_eq!(
            app.clone().oneshot(keyed("alpha")).await.unwrap().status(),
            StatusCode::OK
        );
        assert_eq!(
            app.clone().oneshot(keyed("alpha")).await.unwrap().status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            app.oneshot(keyed("beta")).await.unwrap().status(),
            StatusCode::OK
        );
    }

    #[test]
    fn test_default_key_extractor_prefers_forwarded_for() {
        let request = http::Request::builder()
            .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
            .header("x-real-ip", "198.51.100.2")
            .body(Body::empty())
            .unwrap();

        assert_eq!(default_key_extractor(&request), "203.0.113.7");
    }

    #[test]
    fn test_default_key_extractor_trims_hops() {
        let request = http::Request::builder()
            .header("x-forwarded-for", "  203.0.113.7 , 10.0.0.1")
            .body(Body::empty())
            .unwrap();

        assert_eq!(default_key_extractor(&request), "203.0.113.7");
    }

    #[test]
    fn test_default_key_extractor_falls_back_to_real_ip() {
        let request = http::Request::builder()
            .header("x-real-ip", "198.51.100.2")
            .body(Body::empty())
            .unwrap();

        assert_eq!(default_key_extractor(&request), "198.51.100.2");
    }

    #[test]
    fn test_default_key_extractor_unknown_without_headers() {
        let request = http::Request::builder().body(Body::empty()).unwrap();

        assert_eq!(default_key_extractor(&request), "unknown");
    }

    #[test]
    fn test_default_key_extractor_ignores_empty_forwarded_for() {
        let request = http::Request::builder()
            .header("x-forwarded-for", "")
            .body(Body::empty())
            .unwrap();

        assert_eq!(default_key_extractor(&request), "unknown");
    }
}
