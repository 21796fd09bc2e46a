//! HTTP server hosting the rate limited API routes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::middleware::from_fn_with_state;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::{error, info};

use super::middleware::{rate_limit, RateLimitState};
use crate::config::{PolicyConfig, RateLimitingConfig};
use crate::error::{FloodgateError, Result};
use crate::ratelimit::{RateLimiter, RateLimiterOptions};

/// The preconfigured limiter instances: one strict policy for authentication
/// endpoints, one for general API traffic, one for expensive operations.
///
/// Three independent instances of the same component; each owns its own
/// window store and sweep task.
pub struct AppLimiters {
    /// Authentication endpoints (long window, low ceiling)
    pub auth: Arc<RateLimiter>,
    /// General API traffic (short window, high ceiling)
    pub api: Arc<RateLimiter>,
    /// Expensive operations (short window, low ceiling)
    pub expensive: Arc<RateLimiter>,
}

impl AppLimiters {
    /// Build the limiter instances from configuration.
    pub fn from_config(config: &RateLimitingConfig) -> Self {
        Self {
            auth: Arc::new(RateLimiter::new(policy_options(&config.auth))),
            api: Arc::new(RateLimiter::new(policy_options(&config.api))),
            expensive: Arc::new(RateLimiter::new(policy_options(&config.expensive))),
        }
    }

    /// Start the background sweep task of every limiter.
    pub fn start_sweepers(&self, every: Duration) {
        RateLimiter::start_sweeper(&self.auth, every);
        RateLimiter::start_sweeper(&self.api, every);
        RateLimiter::start_sweeper(&self.expensive, every);
    }

    /// Stop all sweep tasks.
    pub fn stop_sweepers(&self) {
        self.auth.stop_sweeper();
        self.api.stop_sweeper();
        self.expensive.stop_sweeper();
    }
}

fn policy_options(policy: &PolicyConfig) -> RateLimiterOptions {
    RateLimiterOptions::default()
        .window(Duration::from_millis(policy.window_ms))
        .max(policy.max)
        .message(policy.message.clone())
}

/// HTTP server for the rate limited API.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The limiter instances wired into the router
    limiters: AppLimiters,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, limiters: AppLimiters) -> Self {
        Self { addr, limiters }
    }

    /// Assemble the router: a liveness endpoint outside every policy, and one
    /// route group per limiter policy.
    pub fn router(limiters: &AppLimiters) -> Router {
        let auth_routes = Router::new()
            .route("/auth/token", post(issue_token))
            .layer(from_fn_with_state(
                RateLimitState::new(limiters.auth.clone()),
                rate_limit,
            ));

        let api_routes = Router::new()
            .route("/api/status", get(api_status))
            .layer(from_fn_with_state(
                RateLimitState::new(limiters.api.clone()),
                rate_limit,
            ));

        let report_routes = Router::new()
            .route("/api/reports", post(generate_report))
            .layer(from_fn_with_state(
                RateLimitState::new(limiters.expensive.clone()),
                rate_limit,
            ));

        Router::new()
            .route("/health", get(health))
            .merge(auth_routes)
            .merge(api_routes)
            .merge(report_routes)
    }

    /// Start the HTTP server.
    ///
    /// This method will block until the server is shut down.
    pub async fn serve(self) -> Result<()> {
        let app = Self::router(&self.limiters);

        info!(addr = %self.addr, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        axum::serve(listener, app).await.map_err(|e| {
            error!(error = %e, "HTTP server failed");
            FloodgateError::Io(e)
        })
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let app = Self::router(&self.limiters);

        info!(addr = %self.addr, "Starting HTTP server with graceful shutdown");

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                FloodgateError::Io(e)
            })
    }
}

/// Liveness endpoint, deliberately outside every rate limit policy.
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

// The handlers below stand in for the protected application logic; each route
// group exists to exercise its limiter policy.

async fn issue_token() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn api_status() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn generate_report() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "queued" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::middleware::HEADER_LIMIT;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use tower::ServiceExt;

    fn request(method: Method, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("x-forwarded-for", "203.0.113.7")
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn test_server_creation() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let limiters = AppLimiters::from_config(&RateLimitingConfig::default());
        let _server = HttpServer::new(addr, limiters);
    }

    #[tokio::test]
    async fn test_health_is_not_rate_limited() {
        let limiters = AppLimiters::from_config(&RateLimitingConfig::default());
        let app = HttpServer::router(&limiters);

        let response = app
            .oneshot(request(Method::GET, "/health"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(HEADER_LIMIT).is_none());
    }

    #[tokio::test]
    async fn test_each_route_group_uses_its_own_policy() {
        let mut config = RateLimitingConfig::default();
        config.expensive.max = 1;
        let limiters = AppLimiters::from_config(&config);
        let app = HttpServer::router(&limiters);

        let response = app
            .clone()
            .oneshot(request(Method::POST, "/api/reports"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // The expensive policy is exhausted for this client
        let response = app
            .clone()
            .oneshot(request(Method::POST, "/api/reports"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        // The general API policy for the same client is unaffected
        let response = app
            .oneshot(request(Method::GET, "/api/status"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_auth_route_carries_quota_headers() {
        let limiters = AppLimiters::from_config(&RateLimitingConfig::default());
        let app = HttpServer::router(&limiters);

        let response = app
            .oneshot(request(Method::POST, "/auth/token"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let limit: u64 = response
            .headers()
            .get(HEADER_LIMIT)
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(limit, 10);
    }
}
