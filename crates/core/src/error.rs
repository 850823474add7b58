//! Domain error model.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// Rejection of malformed domain input. Never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// Neither digest nor plaintext hash is known, so the attachment slot
    /// cannot be addressed.
    #[error("attachment has no digest or plaintext hash")]
    MissingSignature,
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
