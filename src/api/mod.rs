//! API layer -- axum routes, handlers, and middleware.

mod accounting;
mod routes;
pub mod state;

use self::state::AppState;
use axum::{middleware, Router};
use tower_http::trace::TraceLayer;

/// Build the application router with all API routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/status/api", routes::api_routes())
        .fallback(fallback)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            accounting::count_bytes,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn fallback() -> (axum::http::StatusCode, &'static str) {
    (axum::http::StatusCode::NOT_FOUND, "not found")
}
