//! Error taxonomy shared by every request-processing component.

use crate::status::ResponseStatusCode;

/// Result alias used throughout the engine.
pub type CseResult<T> = Result<T, CseError>;

/// Errors raised while processing a request.
///
/// Every variant maps to exactly one [`ResponseStatusCode`]; the Method Domain
/// is the single place that turns them into a response.
#[derive(Debug, thiserror::Error)]
pub enum CseError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("contents unacceptable: {0}")]
    ContentsUnacceptable(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("impersonation: {0}")]
    Impersonation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("target not reachable: {0}")]
    TargetNotReachable(String),
    #[error("operation not allowed: {0}")]
    OperationNotAllowed(String),
    #[error("not implemented: {0}")]
    NotImplemented(String),
    #[error("target not subscribable: {0}")]
    TargetNotSubscribable(String),
    #[error("invalid child resource type: {0}")]
    InvalidChildResourceType(String),
    /// A protocol error received verbatim from another node.
    #[error("remote error {status}: {message}")]
    Remote {
        status: ResponseStatusCode,
        message: String,
    },
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CseError {
    /// Status code reported to the originator.
    #[must_use]
    pub fn status_code(&self) -> ResponseStatusCode {
        match self {
            Self::BadRequest(_) => ResponseStatusCode::BadRequest,
            Self::ContentsUnacceptable(_) => ResponseStatusCode::ContentsUnacceptable,
            Self::PermissionDenied(_) => ResponseStatusCode::OriginatorHasNoPrivilege,
            Self::Impersonation(_) => ResponseStatusCode::SecurityAssociationRequired,
            Self::NotFound(_) => ResponseStatusCode::NotFound,
            Self::Conflict(_) => ResponseStatusCode::Conflict,
            Self::AlreadyExists(_) => ResponseStatusCode::AlreadyExists,
            Self::TargetNotReachable(_) => ResponseStatusCode::TargetNotReachable,
            Self::OperationNotAllowed(_) => ResponseStatusCode::OperationNotAllowed,
            Self::NotImplemented(_) => ResponseStatusCode::NotImplemented,
            Self::TargetNotSubscribable(_) => ResponseStatusCode::TargetNotSubscribable,
            Self::InvalidChildResourceType(_) => ResponseStatusCode::InvalidChildResourceType,
            Self::Remote { status, .. } => *status,
            Self::Internal(_) => ResponseStatusCode::InternalServerError,
        }
    }

    /// Shorthand for a `NotFound` naming the missing target.
    pub fn not_found(target: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("resource {target} does not exist"))
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.status_code() == ResponseStatusCode::NotFound
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_errors_degrade_to_5000() {
        let err: CseError = anyhow::anyhow!("disk on fire").into();
        assert_eq!(err.status_code(), ResponseStatusCode::InternalServerError);
    }

    #[test]
    fn remote_errors_keep_their_status() {
        let err = CseError::Remote {
            status: ResponseStatusCode::Conflict,
            message: "name taken".into(),
        };
        assert_eq!(err.status_code(), ResponseStatusCode::Conflict);
        assert!(!err.is_not_found());
        assert!(CseError::not_found("x").is_not_found());
    }
}
