//! CSI error types.
//!
//! Every failure that crosses the plugin RPC boundary is a [`CsiError`].  The
//! variants follow the standardized CSI status codes so the orchestrator can
//! decide whether to retry.  Lower layers ([`CloudError`], [`MountError`])
//! convert into this taxonomy; their raw detail is logged at the point of
//! failure and only a short classification travels to the caller.
//!
//! [`CloudError`]: crate::cloud::CloudError
//! [`MountError`]: crate::mount::MountError

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Standardized status code attached to every [`CsiError`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Code {
    NotFound,
    AlreadyExists,
    FailedPrecondition,
    Aborted,
    Unavailable,
    DeadlineExceeded,
    InvalidArgument,
    OutOfRange,
    Unimplemented,
    Internal,
}

/// Unified error type for CSI operations.
#[derive(Debug, Error, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum CsiError {
    /// The referenced volume or node does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A resource with the same identity exists but is incompatible with the
    /// request (e.g. same name, different size).
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The current state does not permit the requested transition.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// A conflicting operation is in progress on the cloud side.
    #[error("aborted: {0}")]
    Aborted(String),

    /// Transient failure; the caller may retry.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The operation did not finish before its deadline.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// The caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The requested capacity cannot be satisfied.
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// The plugin does not implement the requested call.
    #[error("unimplemented: {0}")]
    Unimplemented(String),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CsiError {
    /// Create a [`CsiError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// Create a [`CsiError::InvalidArgument`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn invalid<E: std::fmt::Display>(e: E) -> Self {
        Self::InvalidArgument(e.to_string())
    }

    /// Create a [`CsiError::Unavailable`] from a transport-level failure.
    pub fn transport<E: std::fmt::Display>(e: E) -> Self {
        Self::Unavailable(format!("transport: {e}"))
    }

    /// The standardized status code of this error.
    pub fn code(&self) -> Code {
        match self {
            Self::NotFound(_) => Code::NotFound,
            Self::AlreadyExists(_) => Code::AlreadyExists,
            Self::FailedPrecondition(_) => Code::FailedPrecondition,
            Self::Aborted(_) => Code::Aborted,
            Self::Unavailable(_) => Code::Unavailable,
            Self::DeadlineExceeded(_) => Code::DeadlineExceeded,
            Self::InvalidArgument(_) => Code::InvalidArgument,
            Self::OutOfRange(_) => Code::OutOfRange,
            Self::Unimplemented(_) => Code::Unimplemented,
            Self::Internal(_) => Code::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CsiError::NotFound("volume 123".into());
        assert_eq!(err.to_string(), "not found: volume 123");
    }

    #[test]
    fn error_codes() {
        assert_eq!(
            CsiError::FailedPrecondition("x".into()).code(),
            Code::FailedPrecondition
        );
        assert_eq!(CsiError::transport("reset").code(), Code::Unavailable);
        assert_eq!(CsiError::internal("boom").code(), Code::Internal);
    }

    #[test]
    fn error_serde_roundtrip() {
        let err = CsiError::DeadlineExceeded("waiting for action 7".into());
        let json = serde_json::to_string(&err).expect("serialize");
        let de: CsiError = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(err, de);
    }
}
