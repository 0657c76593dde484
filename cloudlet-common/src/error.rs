use thiserror::Error;

/// Failure classes of a handoff (and of the capture operations that share its plumbing).
///
/// The class tells the caller what was left behind:
/// - `Validation`: rejected before any side effect.
/// - `Resolution`: destination has no compatible base image or flavor; source untouched.
/// - `Authentication`: destination rejected the credentials; never retried automatically.
/// - `Transfer`: failed after the destination was provisioned; the placeholder is NOT cleaned up.
/// - `Termination`: transfer succeeded but the source could not be deleted; source is put in ERROR.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandoffError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Resolution(String),
    #[error("authentication with handoff destination failed: {0}")]
    Authentication(String),
    #[error("handoff transfer failed: {0}")]
    Transfer(String),
    #[error("failed to terminate source instance: {0}")]
    Termination(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
}

impl HandoffError {
    /// HTTP status the controller layer reports for this class.
    pub fn status_code(&self) -> u16 {
        match self {
            HandoffError::Validation(_) => 400,
            HandoffError::Authentication(_) => 401,
            HandoffError::NotFound(_) => 404,
            HandoffError::Conflict(_) => 409,
            HandoffError::Resolution(_) => 422,
            HandoffError::Transfer(_) => 502,
            HandoffError::Termination(_) => 500,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            HandoffError::Validation(_) => "validation_error",
            HandoffError::Resolution(_) => "resolution_error",
            HandoffError::Authentication(_) => "authentication_error",
            HandoffError::Transfer(_) => "transfer_error",
            HandoffError::Termination(_) => "termination_error",
            HandoffError::NotFound(_) => "not_found",
            HandoffError::Conflict(_) => "conflict",
        }
    }

    /// True when nothing was mutated on either side before the error surfaced.
    pub fn is_side_effect_free(&self) -> bool {
        matches!(
            self,
            HandoffError::Validation(_)
                | HandoffError::Resolution(_)
                | HandoffError::Authentication(_)
                | HandoffError::NotFound(_)
                | HandoffError::Conflict(_)
        )
    }
}

pub type HandoffResult<T> = std::result::Result<T, HandoffError>;
