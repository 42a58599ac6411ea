//! The gateway error taxonomy.
//!
//! Components keep their own error types internally and convert into
//! [GatewayError] at their public boundary. The outermost boundary strips
//! internal detail for untrusted callers; the precise reason only goes to
//! logs and audit events.

use serde::{Deserialize, Serialize};

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    /// Malformed request, never retried
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    /// Surfaced with a generic user-safe message. The internal reason must
    /// never travel inside this variant.
    #[error("access denied")]
    AccessDenied,

    /// Transient network failure, retried with jittered backoff
    #[error("connection problem: {0}")]
    ConnectionProblem(String),

    /// Configuration-level error, fatal at startup
    #[error("bad parameter: {0}")]
    BadParameter(String),

    /// A matching lock prevents the operation
    #[error("lock targeting {0} is in force")]
    Locked(String),

    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("operation canceled")]
    Canceled,

    #[error("deadline exceeded")]
    DeadlineExceeded,
}

#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Debug)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    AccessDenied,
    ConnectionProblem,
    BadParameter,
    Locked,
    LimitExceeded,
    Canceled,
    DeadlineExceeded,
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::AccessDenied => ErrorKind::AccessDenied,
            Self::ConnectionProblem(_) => ErrorKind::ConnectionProblem,
            Self::BadParameter(_) => ErrorKind::BadParameter,
            Self::Locked(_) => ErrorKind::Locked,
            Self::LimitExceeded(_) => ErrorKind::LimitExceeded,
            Self::Canceled => ErrorKind::Canceled,
            Self::DeadlineExceeded => ErrorKind::DeadlineExceeded,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ConnectionProblem | ErrorKind::LimitExceeded
        )
    }

    /// The message rendered to untrusted callers
    pub fn user_message(&self) -> String {
        match self {
            Self::AccessDenied => "access denied".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::ConnectionProblem(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_denied_carries_no_detail() {
        let err = GatewayError::AccessDenied;
        assert_eq!("access denied", err.user_message());
    }

    #[test]
    fn retry_classification() {
        assert!(GatewayError::ConnectionProblem("reset".into()).is_retryable());
        assert!(GatewayError::LimitExceeded("10 rps".into()).is_retryable());
        assert!(!GatewayError::InvalidArgument("bad route".into()).is_retryable());
        assert!(!GatewayError::Locked("user:alice".into()).is_retryable());
    }
}
