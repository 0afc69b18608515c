use thiserror::Error;

use crate::store::StoreError;

/// Faults raised by the gate. Policy denials are returned as `Verdict`s, not errors.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("authorization code mismatch")]
    AuthMismatch,

    #[error("invalid auth code: {0}")]
    InvalidAuthCode(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
}

impl GateError {
    pub fn code(&self) -> &'static str {
        match self {
            GateError::InvalidInput(_) => "validation_error",
            GateError::NotFound(_) => "not_found",
            GateError::AuthMismatch => "auth_mismatch",
            GateError::InvalidAuthCode(_) => "invalid_auth_code",
            GateError::StorageUnavailable(_) => "storage_unavailable",
        }
    }
}

impl From<StoreError> for GateError {
    fn from(err: StoreError) -> Self {
        GateError::StorageUnavailable(err.to_string())
    }
}

pub(crate) fn require_non_empty(field: &str, value: &str) -> Result<(), GateError> {
    if value.trim().is_empty() {
        return Err(GateError::InvalidInput(format!("{field} is required")));
    }
    Ok(())
}
