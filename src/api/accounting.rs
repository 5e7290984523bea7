//! Byte accounting for dashboard traffic.

use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::warn;

use super::state::AppState;

/// Request bodies above this are rejected before reaching a handler.
const MAX_REQUEST_BODY: usize = 1024 * 1024;

/// Buffer both bodies so their exact sizes can be credited to the monitor.
/// API payloads are small JSON documents, so buffering is bounded.
pub async fn count_bytes(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let (parts, body) = req.into_parts();
    let body = match to_bytes(body, MAX_REQUEST_BODY).await {
        Ok(b) => b,
        Err(e) => {
            warn!(error = %e, "Rejected request body");
            return StatusCode::PAYLOAD_TOO_LARGE.into_response();
        }
    };
    state.monitor.add_inbound(body.len() as u64);

    let resp = next.run(Request::from_parts(parts, Body::from(body))).await;

    let (parts, body) = resp.into_parts();
    match to_bytes(body, usize::MAX).await {
        Ok(b) => {
            state.monitor.add_outbound(b.len() as u64);
            Response::from_parts(parts, Body::from(b))
        }
        Err(e) => {
            warn!(error = %e, "Failed to buffer response body");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
