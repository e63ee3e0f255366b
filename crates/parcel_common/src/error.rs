use thiserror::Error;

/// Convenience alias for `Result<T, ParcelError>`.
pub type ParcelResult<T> = Result<T, ParcelError>;

/// Error classification for retry/escalation decisions.
///
/// - `UserError`: bad input, unknown/claimed/expired code (4xx equivalent)
/// - `Transient`: admission gate closed or backing store unavailable;
///   caller MAY retry after back-off
/// - `InternalBug`: should never happen; logged at error level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    Transient,
    InternalBug,
}

/// Top-level error type returned by the redemption core.
#[derive(Error, Debug)]
pub enum ParcelError {
    /// Malformed or missing input. Reported, never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown pickup code (or one that has already been swept).
    #[error("Pickup code not found: {code}")]
    NotFound { code: String },

    /// The item behind this code has already been claimed.
    #[error("Pickup code already claimed: {code}")]
    Conflict { code: String },

    /// The item behind this code expired before it was claimed.
    #[error("Pickup code expired: {code}")]
    Gone { code: String },

    /// Admission gate closed under memory pressure.
    #[error("Resource exhausted: {reason} (retry after {retry_after_ms}ms)")]
    ResourceExhausted { reason: String, retry_after_ms: u64 },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised by an item repository backend.
#[derive(Error, Debug)]
pub enum StorageError {
    /// A live record already holds this pickup code.
    #[error("Duplicate pickup code: {0}")]
    DuplicateCode(String),

    /// The backing store cannot serve requests right now.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// True for faults of the backing store itself (as opposed to a
    /// well-formed rejection like `DuplicateCode`).
    pub fn is_unavailable(&self) -> bool {
        !matches!(self, StorageError::DuplicateCode(_))
    }
}

impl ParcelError {
    /// Classify this error for retry/escalation decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ParcelError::Validation(_)
            | ParcelError::NotFound { .. }
            | ParcelError::Conflict { .. }
            | ParcelError::Gone { .. } => ErrorKind::UserError,
            ParcelError::ResourceExhausted { .. } => ErrorKind::Transient,
            ParcelError::Storage(StorageError::DuplicateCode(_)) => ErrorKind::InternalBug,
            ParcelError::Storage(_) => ErrorKind::Transient,
            ParcelError::Internal(_) => ErrorKind::InternalBug,
        }
    }

    /// Returns true if this is a user/input error (4xx equivalent).
    pub fn is_user_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::UserError)
    }

    /// Returns true if the caller may retry after back-off.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }

    /// Returns true if the backing store failed. Such errors must never be
    /// reported to a caller as "not found".
    pub fn is_storage_unavailable(&self) -> bool {
        matches!(self, ParcelError::Storage(e) if e.is_unavailable())
    }

    /// Suggested retry delay in milliseconds (0 = do not retry).
    pub fn retry_after_ms(&self) -> u64 {
        match self {
            ParcelError::ResourceExhausted { retry_after_ms, .. } => *retry_after_ms,
            ParcelError::Storage(e) if e.is_unavailable() => 1000,
            _ => 0,
        }
    }

    /// Stable HTTP-style status for the external request layer.
    pub fn status_code(&self) -> u16 {
        match self {
            ParcelError::Validation(_) => 400,
            ParcelError::NotFound { .. } => 404,
            ParcelError::Conflict { .. } => 409,
            ParcelError::Gone { .. } => 410,
            ParcelError::ResourceExhausted { .. } => 503,
            ParcelError::Storage(e) if e.is_unavailable() => 503,
            ParcelError::Storage(_) | ParcelError::Internal(_) => 500,
        }
    }

    /// Construct a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        ParcelError::Validation(msg.into())
    }

    /// Construct a backpressure rejection.
    pub fn resource_exhausted(reason: impl Into<String>, retry_after_ms: u64) -> Self {
        ParcelError::ResourceExhausted {
            reason: reason.into(),
            retry_after_ms,
        }
    }

    /// Add context string to an error, preserving its classification.
    pub fn with_context(self, ctx: impl Into<String>) -> Self {
        let ctx = ctx.into();
        match self {
            ParcelError::Validation(msg) => ParcelError::Validation(format!("{ctx}: {msg}")),
            ParcelError::Internal(msg) => ParcelError::Internal(format!("{ctx}: {msg}")),
            ParcelError::ResourceExhausted {
                reason,
                retry_after_ms,
            } => ParcelError::ResourceExhausted {
                reason: format!("{ctx}: {reason}"),
                retry_after_ms,
            },
            ParcelError::Storage(StorageError::Unavailable(msg)) => {
                ParcelError::Storage(StorageError::Unavailable(format!("{ctx}: {msg}")))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_errors_classified() {
        let errs = [
            ParcelError::validation("quantity must be >= 1"),
            ParcelError::NotFound { code: "123456".into() },
            ParcelError::Conflict { code: "123456".into() },
            ParcelError::Gone { code: "123456".into() },
        ];
        for e in &errs {
            assert!(e.is_user_error(), "{e} should be a user error");
            assert_eq!(e.retry_after_ms(), 0);
        }
    }

    #[test]
    fn test_status_codes_are_stable() {
        assert_eq!(ParcelError::validation("x").status_code(), 400);
        assert_eq!(ParcelError::NotFound { code: "1".into() }.status_code(), 404);
        assert_eq!(ParcelError::Conflict { code: "1".into() }.status_code(), 409);
        assert_eq!(ParcelError::Gone { code: "1".into() }.status_code(), 410);
        assert_eq!(ParcelError::resource_exhausted("mem", 50).status_code(), 503);
        assert_eq!(
            ParcelError::from(StorageError::Unavailable("disk".into())).status_code(),
            503
        );
        assert_eq!(ParcelError::Internal("bug".into()).status_code(), 500);
    }

    #[test]
    fn test_storage_fault_is_not_user_error() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = ParcelError::from(StorageError::from(io));
        assert!(err.is_storage_unavailable());
        assert!(err.is_transient());
        assert!(!err.is_user_error());
        assert!(err.retry_after_ms() > 0);
    }

    #[test]
    fn test_duplicate_code_is_not_unavailable() {
        let err = ParcelError::from(StorageError::DuplicateCode("654321".into()));
        assert!(!err.is_storage_unavailable());
        assert_eq!(err.status_code(), 500);
    }

    #[test]
    fn test_resource_exhausted_retry_hint() {
        let err = ParcelError::resource_exhausted("memory 85%", 5000);
        assert!(err.is_transient());
        assert_eq!(err.retry_after_ms(), 5000);
    }

    #[test]
    fn test_with_context_preserves_kind() {
        let err = ParcelError::resource_exhausted("gate closed", 100).with_context("share");
        assert!(err.is_transient());
        assert!(err.to_string().contains("share: gate closed"));

        let err = ParcelError::Gone { code: "1".into() }.with_context("claim");
        assert!(matches!(err, ParcelError::Gone { .. }));
    }
}
