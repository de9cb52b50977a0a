//! Error types for the manual search core.

use thiserror::Error;

/// Result type alias for manual search operations.
pub type SearchResult<T> = std::result::Result<T, SearchCoreError>;

/// Machine-readable disambiguation attached to some error variants.
///
/// Kept deliberately small and closed: it exists only for cases where a single
/// error code covers two distinct situations a caller needs to tell apart
/// (`not_found` covers both an unknown manual and an expired trace).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotFoundReason {
    UnknownManual,
    ExpiredTrace,
    UnknownTrace,
}

/// Flat, non-hierarchical error catalogue. Every variant maps to exactly one of
/// the eight public error codes; none of them are derived from one another.
#[derive(Debug, Error)]
pub enum SearchCoreError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("out of scope: {0}")]
    OutOfScope(String),

    #[error("needs narrower scope: {0}")]
    NeedsNarrowScope(String),

    #[error("not found: {reason:?}: {detail}")]
    NotFound {
        reason: NotFoundReason,
        detail: String,
    },

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid scope: {0}")]
    InvalidScope(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SearchCoreError {
    /// The stable string code returned to callers (see SPEC_FULL.md §6).
    ///
    /// `Io` and `Serialization` are infrastructure failure modes, not part of
    /// the public catalogue: they fold onto `invalid_path`/`invalid_parameter`
    /// here rather than leaking a ninth code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidParameter(_) => "invalid_parameter",
            Self::InvalidPath(_) | Self::Io(_) => "invalid_path",
            Self::OutOfScope(_) => "out_of_scope",
            Self::NeedsNarrowScope(_) => "needs_narrow_scope",
            Self::NotFound { .. } => "not_found",
            Self::Forbidden(_) => "forbidden",
            Self::InvalidScope(_) => "invalid_scope",
            Self::Conflict(_) => "conflict",
            Self::Serialization(_) => "invalid_parameter",
        }
    }

    /// Whether retrying the same request could plausibly succeed without the
    /// caller changing anything. None of the validation-shaped errors are
    /// retryable; only the infrastructure ones might be (a transient I/O hiccup).
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_))
    }

    #[must_use]
    pub fn not_found_unknown_manual(manual_id: impl Into<String>) -> Self {
        Self::NotFound {
            reason: NotFoundReason::UnknownManual,
            detail: manual_id.into(),
        }
    }

    #[must_use]
    pub fn not_found_expired_trace(trace_id: impl Into<String>) -> Self {
        Self::NotFound {
            reason: NotFoundReason::ExpiredTrace,
            detail: trace_id.into(),
        }
    }

    #[must_use]
    pub fn not_found_unknown_trace(trace_id: impl Into<String>) -> Self {
        Self::NotFound {
            reason: NotFoundReason::UnknownTrace,
            detail: trace_id.into(),
        }
    }
}
