// SPDX-License-Identifier: MIT OR Apache-2.0
//! Stable error taxonomy for the kernel.
//!
//! Every denial or failure that crosses a component boundary carries an
//! [`ErrorKind`]: a machine-readable snake_case tag that is guaranteed not
//! to change across releases. Callers dispatch on the kind; the free-text
//! message is for humans and may change.

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// Machine-readable, stable error kind.
///
/// Serialises to the exact snake_case identifier (e.g. `"trust_denied"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The request body is missing required fields or malformed.
    InvalidRequest,
    /// A subsystem failed to initialise and stays down until repaired.
    InitializationError,
    /// No handler is registered for the requested permission.
    HandlerNotFound,
    /// The code's on-disk hash is not in the trust allowlist.
    TrustDenied,
    /// The principal does not hold the required grant.
    GrantDenied,
    /// A sliding-window rate limit rejected the request.
    RateLimited,
    /// The originating pack is not approved (or its content hash drifted).
    ApprovalDenied,
    /// The execution mode is not allowed for this unit.
    ModeNotAllowed,
    /// The execution mode is reserved but not implemented.
    ModeNotImplemented,
    /// The unit kind is outside the whitelist.
    UnknownKind,
    /// An executable unit has no entrypoint.
    MissingEntrypoint,
    /// A path escaped its containment root.
    PathTraversal,
    /// Entrypoint bytes changed between trust check and execution.
    ToctouMismatch,
    /// A filesystem security property was violated (e.g. setuid bits).
    SecurityViolation,
    /// The operation exceeded its wall-clock budget.
    Timeout,
    /// Subprocess output exceeded the response cap.
    ResponseTooLarge,
    /// The handler subprocess exited non-zero.
    HandlerError,
    /// Unexpected internal failure.
    InternalError,
    /// Compare-and-swap pre-image mismatch.
    Conflict,
    /// A value exceeded its size cap.
    PayloadTooLarge,
    /// The referenced store does not exist.
    StoreNotFound,
    /// The store id is already taken.
    StoreAlreadyExists,
    /// An archive entry tried to escape the extraction root.
    ZipSlipDetected,
    /// A single file exceeded the import size cap.
    FileTooLarge,
}

impl ErrorKind {
    /// Stable `&'static str` identifier (e.g. `"grant_denied"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::InitializationError => "initialization_error",
            Self::HandlerNotFound => "handler_not_found",
            Self::TrustDenied => "trust_denied",
            Self::GrantDenied => "grant_denied",
            Self::RateLimited => "rate_limited",
            Self::ApprovalDenied => "approval_denied",
            Self::ModeNotAllowed => "mode_not_allowed",
            Self::ModeNotImplemented => "mode_not_implemented",
            Self::UnknownKind => "unknown_kind",
            Self::MissingEntrypoint => "missing_entrypoint",
            Self::PathTraversal => "path_traversal",
            Self::ToctouMismatch => "toctou_mismatch",
            Self::SecurityViolation => "security_violation",
            Self::Timeout => "timeout",
            Self::ResponseTooLarge => "response_too_large",
            Self::HandlerError => "handler_error",
            Self::InternalError => "internal_error",
            Self::Conflict => "conflict",
            Self::PayloadTooLarge => "payload_too_large",
            Self::StoreNotFound => "store_not_found",
            Self::StoreAlreadyExists => "store_already_exists",
            Self::ZipSlipDetected => "zip_slip_detected",
            Self::FileTooLarge => "file_too_large",
        }
    }

    /// Whether this kind represents a policy denial that must be collapsed
    /// to the generic `"Permission denied"` message on the wire, with the
    /// full reason recorded only in audit.
    pub fn is_policy_denial(&self) -> bool {
        matches!(
            self,
            Self::HandlerNotFound
                | Self::TrustDenied
                | Self::GrantDenied
                | Self::ApprovalDenied
                | Self::SecurityViolation
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// KernelError
// ---------------------------------------------------------------------------

/// Kernel error: a stable kind plus a human-readable message.
#[derive(Debug, Clone, thiserror::Error)]
#[error("[{kind}] {message}")]
pub struct KernelError {
    /// Machine-readable kind.
    pub kind: ErrorKind,
    /// Human-readable description. Policy denials keep the detail here for
    /// audit; the wire surface replaces it with a generic message.
    pub message: String,
}

impl KernelError {
    /// Create a new error with the given kind and message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for [`ErrorKind::InvalidRequest`].
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    /// Shorthand for [`ErrorKind::InternalError`].
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }

    /// The message callers are allowed to see. Policy denials collapse to
    /// `"Permission denied"`; everything else passes through.
    pub fn public_message(&self) -> &str {
        if self.kind.is_policy_denial() {
            "Permission denied"
        } else {
            &self.message
        }
    }
}

impl From<std::io::Error> for KernelError {
    fn from(err: std::io::Error) -> Self {
        Self::new(ErrorKind::InternalError, err.to_string())
    }
}

impl From<serde_json::Error> for KernelError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorKind::InvalidRequest, err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const ALL_KINDS: &[ErrorKind] = &[
        ErrorKind::InvalidRequest,
        ErrorKind::InitializationError,
        ErrorKind::HandlerNotFound,
        ErrorKind::TrustDenied,
        ErrorKind::GrantDenied,
        ErrorKind::RateLimited,
        ErrorKind::ApprovalDenied,
        ErrorKind::ModeNotAllowed,
        ErrorKind::ModeNotImplemented,
        ErrorKind::UnknownKind,
        ErrorKind::MissingEntrypoint,
        ErrorKind::PathTraversal,
        ErrorKind::ToctouMismatch,
        ErrorKind::SecurityViolation,
        ErrorKind::Timeout,
        ErrorKind::ResponseTooLarge,
        ErrorKind::HandlerError,
        ErrorKind::InternalError,
        ErrorKind::Conflict,
        ErrorKind::PayloadTooLarge,
        ErrorKind::StoreNotFound,
        ErrorKind::StoreAlreadyExists,
        ErrorKind::ZipSlipDetected,
        ErrorKind::FileTooLarge,
    ];

    #[test]
    fn all_kinds_have_unique_identifiers() {
        let mut seen = HashSet::new();
        for kind in ALL_KINDS {
            assert!(seen.insert(kind.as_str()), "duplicate: {kind}");
        }
        assert_eq!(seen.len(), ALL_KINDS.len());
    }

    #[test]
    fn serde_matches_as_str() {
        for kind in ALL_KINDS {
            let json = serde_json::to_string(kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
            let back: ErrorKind = serde_json::from_str(&json).unwrap();
            assert_eq!(back, *kind);
        }
    }

    #[test]
    fn policy_denials_collapse_on_the_wire() {
        let err = KernelError::new(ErrorKind::TrustDenied, "sha256 mismatch for handler fs.write");
        assert_eq!(err.public_message(), "Permission denied");

        let err = KernelError::new(ErrorKind::Timeout, "timed out after 30s");
        assert_eq!(err.public_message(), "timed out after 30s");
    }

    #[test]
    fn display_includes_kind_and_message() {
        let err = KernelError::new(ErrorKind::Conflict, "value mismatch");
        assert_eq!(err.to_string(), "[conflict] value mismatch");
    }
}
