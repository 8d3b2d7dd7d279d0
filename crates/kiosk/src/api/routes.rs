//! API route definitions.

use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::handlers;
use super::state::AppState;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/api/instances",
            get(handlers::list_instances).post(handlers::create_instance),
        )
        .route(
            "/api/instances/{id}",
            get(handlers::get_instance).delete(handlers::delete_instance),
        )
        .route("/api/instances/{id}/logs", get(handlers::get_instance_logs))
        .layer(trace_layer)
        .layer(CorsLayer::permissive())
        .with_state(state)
}
