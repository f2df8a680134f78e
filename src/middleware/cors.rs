// Cross-origin and request tracing layers for the run API

use axum::http::Method;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Browsers may read run state from any origin; only the verbs the API serves are allowed.
pub fn apply_cors(router: Router) -> Router {
    router.layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(Any),
    )
}

pub fn apply_tracing(router: Router) -> Router {
    router.layer(TraceLayer::new_for_http())
}
