// Keel Control Plane Library
// Decision: Shared library for binaries (API server, OpenAPI export) and tests

use std::sync::Arc;

use axum::http::{header, HeaderValue, Method};
use axum::{routing::get, Json, Router};
use keel_durable::ControlApi;
use serde::Serialize;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

// API routes and types (shared for OpenAPI generation)
pub mod api;

// Environment configuration
pub mod config;

// OpenAPI spec generation
pub mod openapi;

pub use config::ServerConfig;

/// Every API route lives under this path
pub const API_BASE: &str = "/api/v1/workflows";

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Build the complete HTTP application
pub fn app(control: Arc<ControlApi>, config: &ServerConfig) -> Router {
    let api_routes = Router::new()
        .merge(api::workflows::routes(api::workflows::AppState::new(
            control.clone(),
        )))
        .merge(api::schedules::routes(api::schedules::AppState::new(
            control,
        )));
    let api_routes = Router::new().nest(API_BASE, api_routes);

    let app = Router::new()
        .route("/health", get(health))
        .route(
            "/api-doc/openapi.json",
            get(|| async { Json(openapi::ApiDoc::openapi()) }),
        )
        .merge(build_router_with_prefix(api_routes, &config.api_prefix));

    let app = match cors_layer(&config.cors_allowed_origins) {
        Some(cors) => app.layer(cors),
        None => app,
    };

    app.layer(TraceLayer::new_for_http())
}

/// Build router with optional API prefix
fn build_router_with_prefix<S: Clone + Send + Sync + 'static>(
    api_routes: Router<S>,
    api_prefix: &str,
) -> Router<S> {
    if api_prefix.is_empty() {
        api_routes
    } else {
        Router::new().nest(api_prefix, api_routes)
    }
}

/// CORS layer for the configured origins; None when no valid origin is configured
fn cors_layer(origins: &[String]) -> Option<CorsLayer> {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(%origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    if origins.is_empty() {
        return None;
    }

    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::ACCEPT, header::ORIGIN]),
    )
}
