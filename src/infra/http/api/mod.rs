pub mod error;
pub mod handlers;
pub mod middleware;
pub mod rate_limit;
pub mod state;

pub use state::ApiState;

use axum::{Router, middleware as axum_middleware, routing::get};

use crate::infra::http::middleware::{log_responses, set_request_context};

/// Timestamp API plus the unthrottled health probe.
pub fn build_router(state: ApiState) -> Router {
    let rate_state = state.clone();

    Router::new()
        .route(
            "/timestamps",
            get(handlers::list_timestamps).post(handlers::create_timestamp),
        )
        .route(
            "/timestamps/{id}",
            get(handlers::get_timestamp).delete(handlers::delete_timestamp),
        )
        .route_layer(axum_middleware::from_fn_with_state(
            rate_state,
            middleware::api_rate_limit,
        ))
        .route("/health", get(handlers::health))
        .with_state(state)
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_context))
}
