//! Middleware applied around the gateway router

use axum::{
    body::Body,
    http::{HeaderValue, Request},
    middleware::{self, Next},
    response::Response,
    Router,
};
use std::time::{Duration, Instant};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

/// Middleware configuration
#[derive(Debug, Clone)]
pub struct MiddlewareConfig {
    /// Enable CORS (default: true)
    pub cors_enabled: bool,
    /// CORS allowed origins (None = any)
    pub cors_origins: Option<Vec<String>>,
    /// Enable request tracing spans (default: true)
    pub tracing_enabled: bool,
    /// Compress response bodies (default: false; streamed frames should
    /// reach the client as they are written)
    pub compression_enabled: bool,
    /// Time allowed until response headers (default: 30s, None = no limit)
    pub timeout: Option<Duration>,
    /// Add security headers (default: true)
    pub security_headers: bool,
    /// Log one line per request (default: true)
    pub request_logging: bool,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            cors_enabled: true,
            cors_origins: None,
            tracing_enabled: true,
            compression_enabled: false,
            timeout: Some(Duration::from_secs(30)),
            security_headers: true,
            request_logging: true,
        }
    }
}

impl MiddlewareConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cors(mut self, enabled: bool) -> Self {
        self.cors_enabled = enabled;
        self
    }

    pub fn cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = Some(origins);
        self
    }

    pub fn tracing(mut self, enabled: bool) -> Self {
        self.tracing_enabled = enabled;
        self
    }

    pub fn compression(mut self, enabled: bool) -> Self {
        self.compression_enabled = enabled;
        self
    }

    pub fn timeout(mut self, duration: Option<Duration>) -> Self {
        self.timeout = duration;
        self
    }

    pub fn security_headers(mut self, enabled: bool) -> Self {
        self.security_headers = enabled;
        self
    }

    pub fn request_logging(mut self, enabled: bool) -> Self {
        self.request_logging = enabled;
        self
    }
}

/// Wrap `router` in the configured layers. The innermost layer is added first.
pub fn apply_middleware(router: Router, config: &MiddlewareConfig) -> Router {
    let mut router = router;

    if config.security_headers {
        router = router.layer(middleware::from_fn(security_headers));
    }

    if config.request_logging {
        router = router.layer(middleware::from_fn(request_logging));
    }

    if let Some(timeout) = config.timeout {
        router = router.layer(TimeoutLayer::new(timeout));
    }

    if config.compression_enabled {
        router = router.layer(CompressionLayer::new());
    }

    if config.tracing_enabled {
        router = router.layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        );
    }

    // Outermost, so preflight requests never reach the gateway
    if config.cors_enabled {
        let cors = match &config.cors_origins {
            Some(origins) => {
                let origins: Vec<HeaderValue> =
                    origins.iter().filter_map(|o| o.parse().ok()).collect();
                CorsLayer::new().allow_origin(origins)
            }
            None => CorsLayer::new().allow_origin(Any),
        }
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any);
        router = router.layer(cors);
    }

    router
}

async fn security_headers(request: Request<Body>, next: Next) -> Response {
    let mut response = next.run(request).await;

    let headers = response.headers_mut();
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert("referrer-policy", HeaderValue::from_static("no-referrer"));

    response
}

/// One line per request; level follows the response status
async fn request_logging(request: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let uri = request.uri().clone();

    let response = next.run(request).await;

    let millis = start.elapsed().as_millis() as u64;
    let status = response.status().as_u16();

    if response.status().is_server_error() {
        tracing::error!(%method, %uri, status, millis, "gateway request failed");
    } else if response.status().is_client_error() {
        tracing::warn!(%method, %uri, status, millis, "gateway request rejected");
    } else {
        tracing::info!(%method, %uri, status, millis, "gateway request");
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_security_headers_added() {
        let router = apply_middleware(
            Router::new().route("/", get(|| async { "ok" })),
            &MiddlewareConfig::default(),
        );
        let response = router
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        assert_eq!(response.headers()["x-content-type-options"], "nosniff");
        assert_eq!(response.headers()["x-frame-options"], "DENY");
    }
}
