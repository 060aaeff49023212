//! HTTP surface generated from queue mapping blocks.

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod state;
pub mod surface;

use std::sync::Arc;

use axum::routing::get;
use axum::{Extension, Router, middleware as axum_middleware};
use tracing::info;

pub use error::ApiError;
pub use state::ApiState;
pub use surface::{ArgKind, RouteDescriptor, SurfaceError, WriteRoute, build_routes};

use surface::{
    HEALTH_PATH, LIST_CATEGORIES_PATH, LIST_ENTRIES_PATH, LIST_ROUTES_PATH, RAW_ENTRY_PATH,
};

/// Assemble the router: generated routes and raw endpoints behind the auth
/// layer, `/healthz` in front of it.
pub fn build_router(state: ApiState, routes: &[RouteDescriptor]) -> Router {
    let mut protected = Router::new()
        .route(LIST_CATEGORIES_PATH, get(handlers::list_categories))
        .route(LIST_ENTRIES_PATH, get(handlers::list_entries))
        .route(RAW_ENTRY_PATH, get(handlers::raw_entry))
        .route(
            LIST_ROUTES_PATH,
            get(handlers::list_routes).layer(Extension(Arc::new(routes.to_vec()))),
        );

    for route in routes {
        let mut method = get(handlers::read_mapped);
        if route.write.is_some() {
            method = method.post(handlers::write_mapped);
        }
        protected = protected.route(&route.path, method.layer(Extension(Arc::new(route.clone()))));
        info!(
            path = %route.path,
            queue = %route.queue_id,
            entry = %route.entry_key,
            writable = route.write.is_some(),
            "Route registered"
        );
    }

    let protected = protected.layer(axum_middleware::from_fn_with_state(
        state.clone(),
        middleware::api_auth,
    ));

    Router::new()
        .route(HEALTH_PATH, get(handlers::healthz))
        .merge(protected)
        .fallback(|| async { ApiError::not_found("No such endpoint") })
        .with_state(state)
        .layer(axum_middleware::from_fn(middleware::set_request_context))
        .layer(axum_middleware::from_fn(middleware::log_responses))
}
