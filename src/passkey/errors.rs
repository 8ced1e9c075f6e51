//! Passkey service errors
//!
//! Maps ceremony and storage failures onto HTTP-style status codes and the
//! `{status: "error", message}` envelope.

use thiserror::Error;

use super::types::ErrorResponse;
use crate::webauthn::{ErrorKind, RepositoryError, WebAuthnError};

/// Errors returned by the passkey service
#[derive(Debug, Error)]
pub enum PasskeyError {
    /// Request data is missing or unreadable
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Ceremony failure
    #[error(transparent)]
    WebAuthn(#[from] WebAuthnError),

    /// Persisting a user or credential failed
    #[error("Storage error: {0}")]
    Storage(#[from] RepositoryError),
}

impl PasskeyError {
    /// HTTP status code for this error
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            PasskeyError::InvalidRequest(_) => 400,
            PasskeyError::Storage(_) => 500,
            PasskeyError::WebAuthn(err) => match err.kind() {
                ErrorKind::DuplicateUser | ErrorKind::CredentialAlreadyRegistered => 409,
                ErrorKind::UserNotFound => 404,
                ErrorKind::AssertionFailed | ErrorKind::UnknownCredential => 401,
                ErrorKind::Configuration | ErrorKind::Repository | ErrorKind::Internal => 500,
                _ => 400,
            },
        }
    }

    /// Message safe to return to the client
    #[must_use]
    pub fn safe_message(&self) -> String {
        match self {
            PasskeyError::InvalidRequest(msg) => msg.clone(),
            PasskeyError::WebAuthn(err) => err.safe_message(),
            PasskeyError::Storage(_) => "Failed to save credential".to_string(),
        }
    }

    /// Error envelope for the client
    #[must_use]
    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse::new(self.safe_message())
    }
}
