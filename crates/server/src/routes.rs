//! Route configuration.

use crate::handlers;
use crate::metrics::metrics_handler;
use crate::state::AppState;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use tower_http::trace::TraceLayer;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let cache_routes = Router::new()
        .route(
            "/ac/{id}",
            get(handlers::get_action_result).put(handlers::put_action_result),
        )
        .route(
            "/cas/{id}",
            get(handlers::get_blob).put(handlers::put_blob),
        )
        // Request bodies are streamed to storage, so no size cap applies.
        .layer(DefaultBodyLimit::disable());

    let mut router = Router::new().merge(cache_routes);

    if state.config.server.metrics_enabled {
        let metrics_routes = Router::new().route("/metrics", get(metrics_handler));
        router = router.merge(metrics_routes);
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}
