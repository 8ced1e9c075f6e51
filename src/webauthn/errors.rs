//! `WebAuthn` error types
//!
//! Every ceremony failure is reported as a typed [`WebAuthnError`]. Messages
//! carried by the variants are produced by this crate and never contain key
//! material; transport layers should still prefer [`WebAuthnError::safe_message`].

use std::fmt;

use thiserror::Error;

/// Reason codes for a failed assertion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssertionFailure {
    /// The signature did not verify with the stored public key
    SignatureMismatch,
    /// The presented counter did not advance past the stored counter
    CounterRegression { stored: u32, presented: u32 },
    /// The user-present flag was not set
    UserNotPresent,
    /// User verification was required but not performed
    UserNotVerified,
    /// Authenticator data was produced for another relying party
    RpIdMismatch,
    /// The returned user handle does not own the credential
    UserHandleMismatch,
    /// The credential is not allowed for the named user
    CredentialNotAllowed,
}

impl AssertionFailure {
    /// Stable reason code
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            AssertionFailure::SignatureMismatch => "signature_mismatch",
            AssertionFailure::CounterRegression { .. } => "counter_regression",
            AssertionFailure::UserNotPresent => "user_not_present",
            AssertionFailure::UserNotVerified => "user_not_verified",
            AssertionFailure::RpIdMismatch => "rp_id_mismatch",
            AssertionFailure::UserHandleMismatch => "user_handle_mismatch",
            AssertionFailure::CredentialNotAllowed => "credential_not_allowed",
        }
    }
}

impl fmt::Display for AssertionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssertionFailure::CounterRegression { stored, presented } => write!(
                f,
                "counter_regression (stored {stored}, presented {presented})"
            ),
            other => f.write_str(other.code()),
        }
    }
}

/// `WebAuthn` errors that can occur during ceremonies
#[derive(Debug, Error)]
pub enum WebAuthnError {
    #[error("Duplicate user: {0}")]
    DuplicateUser(String),

    #[error("Challenge not found or expired")]
    ChallengeNotFound,

    #[error("Challenge invalid or already used")]
    ChallengeInvalid,

    #[error("Origin mismatch: {0}")]
    OriginMismatch(String),

    #[error("Malformed client data: {0}")]
    MalformedClientData(String),

    #[error("Malformed attestation: {0}")]
    MalformedAttestation(String),

    #[error("Malformed authenticator data: {0}")]
    MalformedAuthenticatorData(String),

    #[error("Unsupported key type: {0}")]
    UnsupportedKeyType(String),

    #[error("Attestation verification failed: {0}")]
    AttestationVerificationFailed(String),

    #[error("Assertion failed: {0}")]
    AssertionFailed(AssertionFailure),

    #[error("Unknown credential")]
    UnknownCredential,

    #[error("Credential already registered")]
    CredentialAlreadyRegistered,

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error kind exposed to transport layers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    DuplicateUser,
    ChallengeNotFound,
    ChallengeInvalid,
    OriginMismatch,
    MalformedClientData,
    MalformedAttestation,
    MalformedAuthenticatorData,
    UnsupportedKeyType,
    AttestationVerificationFailed,
    AssertionFailed,
    UnknownCredential,
    CredentialAlreadyRegistered,
    UserNotFound,
    Configuration,
    Repository,
    Internal,
}

impl ErrorKind {
    /// Stable snake-case code
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::DuplicateUser => "duplicate_user",
            ErrorKind::ChallengeNotFound => "challenge_not_found",
            ErrorKind::ChallengeInvalid => "challenge_invalid",
            ErrorKind::OriginMismatch => "origin_mismatch",
            ErrorKind::MalformedClientData => "malformed_client_data",
            ErrorKind::MalformedAttestation => "malformed_attestation",
            ErrorKind::MalformedAuthenticatorData => "malformed_authenticator_data",
            ErrorKind::UnsupportedKeyType => "unsupported_key_type",
            ErrorKind::AttestationVerificationFailed => "attestation_verification_failed",
            ErrorKind::AssertionFailed => "assertion_failed",
            ErrorKind::UnknownCredential => "unknown_credential",
            ErrorKind::CredentialAlreadyRegistered => "credential_already_registered",
            ErrorKind::UserNotFound => "user_not_found",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Repository => "repository",
            ErrorKind::Internal => "internal",
        }
    }
}

impl WebAuthnError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            WebAuthnError::DuplicateUser(_) => ErrorKind::DuplicateUser,
            WebAuthnError::ChallengeNotFound => ErrorKind::ChallengeNotFound,
            WebAuthnError::ChallengeInvalid => ErrorKind::ChallengeInvalid,
            WebAuthnError::OriginMismatch(_) => ErrorKind::OriginMismatch,
            WebAuthnError::MalformedClientData(_) => ErrorKind::MalformedClientData,
            WebAuthnError::MalformedAttestation(_) => ErrorKind::MalformedAttestation,
            WebAuthnError::MalformedAuthenticatorData(_) => ErrorKind::MalformedAuthenticatorData,
            WebAuthnError::UnsupportedKeyType(_) => ErrorKind::UnsupportedKeyType,
            WebAuthnError::AttestationVerificationFailed(_) => {
                ErrorKind::AttestationVerificationFailed
            }
            WebAuthnError::AssertionFailed(_) => ErrorKind::AssertionFailed,
            WebAuthnError::UnknownCredential => ErrorKind::UnknownCredential,
            WebAuthnError::CredentialAlreadyRegistered => ErrorKind::CredentialAlreadyRegistered,
            WebAuthnError::UserNotFound(_) => ErrorKind::UserNotFound,
            WebAuthnError::Configuration(_) => ErrorKind::Configuration,
            WebAuthnError::Repository(_) => ErrorKind::Repository,
            WebAuthnError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Reason code for assertion failures
    #[must_use]
    pub fn assertion_failure(&self) -> Option<AssertionFailure> {
        match self {
            WebAuthnError::AssertionFailed(reason) => Some(*reason),
            _ => None,
        }
    }

    /// Message that is safe to hand to a remote client
    ///
    /// Verification details stay in the logs; the client only learns which
    /// step of the ceremony failed.
    #[must_use]
    pub fn safe_message(&self) -> String {
        match self {
            WebAuthnError::DuplicateUser(name) => {
                format!("Username {name} already exists. Choose a new name.")
            }
            WebAuthnError::ChallengeNotFound => {
                "No pending ceremony found. Start again.".to_string()
            }
            WebAuthnError::ChallengeInvalid => "Challenge is invalid or already used".to_string(),
            WebAuthnError::OriginMismatch(_) => "Client data does not match this site".to_string(),
            WebAuthnError::MalformedClientData(_)
            | WebAuthnError::MalformedAttestation(_)
            | WebAuthnError::MalformedAuthenticatorData(_) => {
                "Credential response is malformed".to_string()
            }
            WebAuthnError::UnsupportedKeyType(_) => "Unsupported credential key type".to_string(),
            WebAuthnError::AttestationVerificationFailed(_) => {
                "Attestation verification failed".to_string()
            }
            WebAuthnError::AssertionFailed(reason) => {
                format!("Authentication failed ({})", reason.code())
            }
            WebAuthnError::UnknownCredential => "Unknown credential".to_string(),
            WebAuthnError::CredentialAlreadyRegistered => {
                "Credential is already registered".to_string()
            }
            WebAuthnError::UserNotFound(_) => "User not found".to_string(),
            WebAuthnError::Configuration(_)
            | WebAuthnError::Repository(_)
            | WebAuthnError::Internal(_) => "Internal server error".to_string(),
        }
    }
}
