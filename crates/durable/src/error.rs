//! Error categories shared by every component
//!
//! Each module keeps its own `thiserror` enum. [`ErrorCategory`] is the
//! common classification callers use to decide whether to retry, report a
//! client mistake, or surface an internal fault.

use serde::{Deserialize, Serialize};

/// Classification of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    /// Malformed or unsupported request. Never retried.
    Validation,
    /// The referenced run, schedule or item does not exist (or no longer does).
    NotFound,
    /// The request collides with current state (terminal run, duplicate id).
    Conflict,
    /// Backend temporarily unavailable. Retried internally with backoff.
    Transient,
    /// Anything else.
    Internal,
}

impl ErrorCategory {
    /// Whether the caller is at fault
    pub fn is_client_error(&self) -> bool {
        matches!(self, ErrorCategory::Validation)
    }

    /// Whether retrying the same call may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCategory::Transient)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::Conflict => "conflict",
            ErrorCategory::Transient => "transient",
            ErrorCategory::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Text of a caught panic payload
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_validation_is_client_error() {
        assert!(ErrorCategory::Validation.is_client_error());
        assert!(!ErrorCategory::NotFound.is_client_error());
        assert!(!ErrorCategory::Internal.is_client_error());
    }

    #[test]
    fn test_serialization() {
        let json = serde_json::to_string(&ErrorCategory::NotFound).unwrap();
        assert_eq!(json, "\"NOT_FOUND\"");
    }
}
