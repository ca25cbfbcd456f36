//! Caller-input validation errors.

use thiserror::Error;

/// Result type for argument validation.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// A caller passed an argument the engine refuses to act on.
///
/// Always raised before any transaction is opened, so a validation failure
/// never touches storage.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A required identifier or name was empty (or only whitespace).
    #[error("{0} must not be empty")]
    Empty(&'static str),

    /// A numeric argument was NaN or infinite.
    #[error("{0} must be a finite number")]
    NotFinite(&'static str),
}

impl ValidationError {
    pub fn empty(field: &'static str) -> Self {
        Self::Empty(field)
    }
}

/// Reject NaN and infinities.
pub fn require_finite(field: &'static str, value: f64) -> ValidationResult<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(ValidationError::NotFinite(field))
    }
}

/// Reject an empty or whitespace-only required argument.
pub fn require_non_empty<'a>(field: &'static str, value: &'a str) -> ValidationResult<&'a str> {
    if value.trim().is_empty() {
        Err(ValidationError::empty(field))
    } else {
        Ok(value)
    }
}
