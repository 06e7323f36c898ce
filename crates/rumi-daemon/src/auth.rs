// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bearer-token authentication middleware.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::state::AppState;

/// Require `Authorization: Bearer <token>` with a constant-time compare.
pub async fn require_bearer(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let expected = format!("Bearer {}", state.api_token);
    let supplied = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let matches: bool = supplied.as_bytes().ct_eq(expected.as_bytes()).into();
    if !matches {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "success": false, "error": "Unauthorized" })),
        )
            .into_response();
    }
    next.run(req).await
}
