// SPDX-License-Identifier: MIT OR Apache-2.0
//! Wire error envelope and status-code mapping.
//!
//! Every failure crosses the wire as `{"success": false, "error": "..."}`.
//! Policy denials carry the generic `"Permission denied"`; unexpected
//! internal faults are logged and replaced with the constant
//! `"Internal server error"`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use rumi_core::{ErrorKind, KernelError};
use serde_json::json;

/// An API-facing error: status code plus wire message.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    /// Internal faults never leak detail onto the wire.
    pub fn internal() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
    }
}

impl From<KernelError> for ApiError {
    fn from(err: KernelError) -> Self {
        let status = status_for(err.kind);
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(kind = %err.kind, message = %err.message, "internal error");
            return Self::internal();
        }
        Self::new(status, err.public_message().to_string())
    }
}

/// Map a stable error kind onto its HTTP status.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidRequest
        | ErrorKind::UnknownKind
        | ErrorKind::MissingEntrypoint
        | ErrorKind::ModeNotAllowed
        | ErrorKind::ModeNotImplemented
        | ErrorKind::PathTraversal
        | ErrorKind::ZipSlipDetected => StatusCode::BAD_REQUEST,

        ErrorKind::HandlerNotFound
        | ErrorKind::TrustDenied
        | ErrorKind::GrantDenied
        | ErrorKind::ApprovalDenied
        | ErrorKind::SecurityViolation
        | ErrorKind::ToctouMismatch => StatusCode::FORBIDDEN,

        ErrorKind::StoreNotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict | ErrorKind::StoreAlreadyExists => StatusCode::CONFLICT,
        ErrorKind::Timeout => StatusCode::REQUEST_TIMEOUT,
        ErrorKind::PayloadTooLarge | ErrorKind::ResponseTooLarge | ErrorKind::FileTooLarge => {
            StatusCode::PAYLOAD_TOO_LARGE
        }
        ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::InitializationError => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::HandlerError | ErrorKind::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "success": false, "error": self.message })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_kinds_map_to_403_with_generic_message() {
        let err = KernelError::new(ErrorKind::GrantDenied, "no fs.write for acme");
        let api: ApiError = err.into();
        assert_eq!(api.status, StatusCode::FORBIDDEN);
        assert_eq!(api.message, "Permission denied");
    }

    #[test]
    fn internal_kind_is_masked() {
        let err = KernelError::internal("db exploded at row 7");
        let api: ApiError = err.into();
        assert_eq!(api.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(api.message, "Internal server error");
    }

    #[test]
    fn status_mapping_spot_checks() {
        assert_eq!(status_for(ErrorKind::Conflict), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorKind::StoreNotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorKind::PayloadTooLarge), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(status_for(ErrorKind::RateLimited), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(status_for(ErrorKind::Timeout), StatusCode::REQUEST_TIMEOUT);
        assert_eq!(status_for(ErrorKind::InitializationError), StatusCode::SERVICE_UNAVAILABLE);
    }
}
