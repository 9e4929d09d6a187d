//! Engine status sum type and failure classification.
//!
//! Every asynchronous completion in the engine carries one of these statuses.
//! Kernel-level I/O errors are classified at the call site that observed them,
//! so callers only ever see the engine's own vocabulary.

use std::io;

use thiserror::Error;

/// Outcome of an engine operation that did not succeed.
#[derive(Debug, Error)]
pub enum EngineError {
    /// User- or shutdown-initiated abort. Not a fault.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// The operation ran past its wall-clock deadline.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// A name lookup produced no usable answer.
    #[error("not found: {0}")]
    NotFound(String),

    /// The peer actively refused or reset the connection.
    #[error("unreachable: {0}")]
    Unreachable(String),

    /// A memory quota refused an allocation.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Unexpected kernel or runtime failure, surfaced without masking.
    #[error("internal: {0}")]
    Internal(String),

    /// The operation is not supported by this backend.
    #[error("unimplemented: {0}")]
    Unimplemented(String),
}

impl EngineError {
    /// Builds a `Cancelled` status.
    pub fn cancelled(reason: impl Into<String>) -> Self {
        EngineError::Cancelled(reason.into())
    }

    /// Builds a `DeadlineExceeded` status.
    pub fn deadline_exceeded(reason: impl Into<String>) -> Self {
        EngineError::DeadlineExceeded(reason.into())
    }

    /// Builds an `Internal` status.
    pub fn internal(reason: impl Into<String>) -> Self {
        EngineError::Internal(reason.into())
    }

    /// Classifies an I/O error observed during `context`.
    ///
    /// Refused, reset, and aborted connections become `Unreachable`; kernel
    /// timeouts become `DeadlineExceeded`; everything else is `Internal`.
    pub fn from_io(context: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => {
                EngineError::Unreachable(format!("{context}: {err}"))
            }
            io::ErrorKind::TimedOut => EngineError::DeadlineExceeded(format!("{context}: {err}")),
            _ => EngineError::Internal(format!("{context}: {err}")),
        }
    }

    /// Returns true for `Cancelled`.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled(_))
    }

    /// Returns true for `DeadlineExceeded`.
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, EngineError::DeadlineExceeded(_))
    }

    /// Returns true for `Unreachable`.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, EngineError::Unreachable(_))
    }

    /// Returns true for `ResourceExhausted`.
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, EngineError::ResourceExhausted(_))
    }
}

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Terminates the process after an API-contract violation.
///
/// Overlapping reads or writes on one endpoint are programmer errors the
/// engine cannot recover from; continuing would corrupt buffer accounting.
pub(crate) fn invalid_usage(msg: &str) -> ! {
    tracing::error!(violation = msg, "invalid engine usage, aborting");
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_classification_refused() {
        let err = EngineError::from_io(
            "connect",
            io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        );
        assert!(err.is_unreachable());
    }

    #[test]
    fn test_io_classification_reset() {
        let err = EngineError::from_io(
            "read",
            io::Error::new(io::ErrorKind::ConnectionReset, "reset"),
        );
        assert!(err.is_unreachable());
    }

    #[test]
    fn test_io_classification_timeout() {
        let err = EngineError::from_io(
            "connect",
            io::Error::new(io::ErrorKind::TimedOut, "timed out"),
        );
        assert!(err.is_deadline_exceeded());
    }

    #[test]
    fn test_io_classification_other() {
        let err = EngineError::from_io(
            "write",
            io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"),
        );
        assert!(matches!(err, EngineError::Internal(_)));
    }

    #[test]
    fn test_display_carries_reason() {
        let err = EngineError::cancelled("listener shutdown");
        assert_eq!(err.to_string(), "cancelled: listener shutdown");
    }
}
