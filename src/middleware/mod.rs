pub mod circuit_breaker;
pub mod tracing;

pub use circuit_breaker::*;
pub use self::tracing::request_context_middleware;

use crate::observability::metrics::record_http_request;
use axum::{
    extract::{MatchedPath, Request},
    middleware::Next,
    response::Response,
};
use std::time::Instant;

/// Middleware to record HTTP request metrics
///
/// Labels use the matched route template, never the raw URI.
pub async fn metrics_middleware(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(req).await;
    record_http_request(&method, &route, response.status().as_u16(), start.elapsed());

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        Router,
        body::Body,
        http::{Request, StatusCode},
        middleware::from_fn,
        routing::get,
    };
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_metrics_middleware_passes_response_through() {
        let app = Router::new()
            .route("/items/{id}", get(|| async { "item" }))
            .layer(from_fn(metrics_middleware));

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/items/42").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::builder().uri("/missing").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
