//! Route table for the public API.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use super::middleware::AdmissionLayer;
use super::response::json_error;

/// The API router. Bot routes sit behind `admission`; the health check
/// does not.
pub fn app(admission: AdmissionLayer) -> Router {
    let bots = Router::new()
        .route("/bot/:id", get(not_implemented))
        .route("/bot/:id/widget", get(not_implemented))
        .route("/bot/:id/stats", post(not_implemented))
        .route_layer(admission);

    Router::new().route("/health", get(health)).merge(bots)
}

async fn health() -> Response {
    Json(json!({ "status": 200, "error": false })).into_response()
}

// Handler bodies live with the entity layer, not here.
async fn not_implemented() -> Response {
    json_error(StatusCode::NOT_IMPLEMENTED, "Not Implemented")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::caller::BotPathResolver;
    use crate::http::middleware::AdmissionPolicy;
    use crate::ratelimit::{MemoryStore, RatelimiterRegistry};
    use crate::config::LimitersConfig;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn router() -> Router {
        let registry = RatelimiterRegistry::new(
            LimitersConfig::default().registry_options(),
            Arc::new(MemoryStore::new()),
        )
        .unwrap();
        app(AdmissionLayer::new(
            Arc::new(registry),
            Arc::new(BotPathResolver::default()),
            AdmissionPolicy::default(),
        ))
    }

    async fn status(router: &Router, method: &str, uri: &str) -> StatusCode {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        router.clone().oneshot(request).await.unwrap().status()
    }

    #[tokio::test]
    async fn test_health_is_not_rate_limited() {
        let router = router();
        for _ in 0..20 {
            assert_eq!(status(&router, "GET", "/health").await, StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn test_bot_routes_are_admitted_then_limited() {
        let router = router();

        for _ in 0..10 {
            assert_eq!(
                status(&router, "GET", "/bot/568254611354419211").await,
                StatusCode::NOT_IMPLEMENTED
            );
        }
        // Widget and stats share the bot's window.
        assert_eq!(
            status(&router, "POST", "/bot/568254611354419211/stats").await,
            StatusCode::TOO_MANY_REQUESTS
        );
    }
}
