//! Error types for coordination service operations.

use thiserror::Error;

/// Result type alias for catalog operations.
pub type CatalogResult<T> = Result<T, CatalogError>;

/// Errors returned by a `CoordinationClient`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("coordination service unreachable: {0}")]
    Unreachable(String),

    #[error("request rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("check not found: {0}")]
    CheckNotFound(String),

    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("malformed response: {0}")]
    Decode(String),

    #[error("invalid definition: {0}")]
    Invalid(String),
}

impl CatalogError {
    /// Whether retrying the same call may succeed.
    ///
    /// Transport failures and server-side (5xx) errors are transient.
    /// Rejections of the request itself and unknown checks are not.
    pub fn is_transient(&self) -> bool {
        match self {
            CatalogError::Unreachable(_) => true,
            CatalogError::Rejected { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_transient() {
        assert!(CatalogError::Unreachable("connection refused".into()).is_transient());
        assert!(
            CatalogError::Rejected {
                status: 503,
                body: "no leader".into()
            }
            .is_transient()
        );
    }

    #[test]
    fn rejections_are_permanent() {
        assert!(
            !CatalogError::Rejected {
                status: 400,
                body: "bad check".into()
            }
            .is_transient()
        );
        assert!(!CatalogError::CheckNotFound("service:svc_1".into()).is_transient());
        assert!(!CatalogError::Decode("eof".into()).is_transient());
    }
}
