//! HTTP handlers for the engine API.

pub mod definitions;
pub mod flows;
pub mod health;
pub mod runs;

pub use health::{api_health, health_check};

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the application router with all routes.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let definition_routes = Router::new()
        .route("/api/validate", post(definitions::validate))
        .route("/api/definitions/{kind}", get(definitions::list))
        .route(
            "/api/definitions/{kind}/{id}",
            get(definitions::get)
                .put(definitions::put)
                .delete(definitions::delete),
        )
        .route(
            "/api/mappings/{id}/effective-rules",
            get(definitions::effective_rules),
        );

    let flow_routes = Router::new()
        .route("/api/flows", get(flows::list))
        .route("/api/flows/{id}/plan", get(flows::plan))
        .route("/api/flows/{id}/last-fired", get(flows::last_fired))
        .route("/api/flows/{id}/arrivals", get(flows::arrivals))
        .route("/api/flows/{id}/runs", post(runs::request_run))
        .route("/api/flows/{id}/executions", get(runs::list_for_flow));

    let execution_routes = Router::new()
        .route("/api/executions/active", get(runs::list_active))
        .route("/api/executions/{id}", get(runs::get))
        .route("/api/executions/{id}/cancel", post(runs::cancel));

    Router::new()
        .route("/health", get(health_check))
        .route("/api/health", get(api_health))
        .merge(definition_routes)
        .merge(flow_routes)
        .merge(execution_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
