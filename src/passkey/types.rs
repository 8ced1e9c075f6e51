//! Passkey request and response envelopes
//!
//! This module defines the JSON bodies exchanged by the registration and
//! login endpoints of an application.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::webauthn::{
    AttestationType, AuthenticatorTransport, Credential, PublicKeyCredentialCreationOptions,
    PublicKeyCredentialRequestOptions,
};

pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_ERROR: &str = "error";

/// Registration request from client
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RegisterRequest {
    pub username: String,
    #[serde(alias = "display", default)]
    pub display_name: String,
}

/// Finish-registration request (`credential` is `RegistrationResponseJSON` as a string)
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FinishRegistrationRequest {
    pub credential: String,
    pub username: String,
    #[serde(default)]
    pub credname: Option<String>, // User-friendly credential name
}

/// Login request; no username starts a discoverable login
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct LoginRequest {
    #[serde(default)]
    pub username: Option<String>,
}

/// Finish-login request (`credential` is `AuthenticationResponseJSON` as a string)
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FinishLoginRequest {
    pub credential: String,
    #[serde(default)]
    pub username: Option<String>,
}

/// Registration start response
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationStartResponse {
    pub status: String,
    pub message: String,
    pub public_key_credential_creation_options: PublicKeyCredentialCreationOptions,
}

/// Login start response
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct LoginStartResponse {
    pub status: String,
    pub message: String,
    pub assertion_request: PublicKeyCredentialRequestOptions,
}

/// Successful login
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub status: String,
    pub message: String,
    pub username: String,
    pub display_name: String,
    /// Set when the authenticator's counter did not advance
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub counter_warning: bool,
}

/// Plain status envelope
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct StatusResponse {
    pub status: String,
    pub message: String,
}

impl StatusResponse {
    #[must_use]
    pub fn success(message: &str) -> Self {
        Self {
            status: STATUS_SUCCESS.to_string(),
            message: message.to_string(),
        }
    }
}

/// Error envelope
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ErrorResponse {
    pub status: String,
    pub message: String,
}

impl ErrorResponse {
    #[must_use]
    pub fn new(message: String) -> Self {
        Self {
            status: STATUS_ERROR.to_string(),
            message,
        }
    }
}

/// Registered credential as listed to its owner
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CredentialSummary {
    pub credential_id: String, // Base64URL-encoded credential ID
    pub label: Option<String>,
    pub aaguid: Uuid,
    pub attestation_format: String,
    pub attestation_type: AttestationType,
    pub transports: Vec<AuthenticatorTransport>,
    pub backup_eligible: bool,
    pub backup_state: bool,
    pub created_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
}

impl From<&Credential> for CredentialSummary {
    fn from(credential: &Credential) -> Self {
        Self {
            credential_id: credential.credential_id.encode(),
            label: credential.label.clone(),
            aaguid: credential.aaguid,
            attestation_format: credential.attestation_format.clone(),
            attestation_type: credential.attestation_type,
            transports: credential.transports.clone(),
            backup_eligible: credential.backup_eligible,
            backup_state: credential.backup_state,
            created_at: credential.created_at,
            last_used: credential.last_used,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_field_names() {
        let request: RegisterRequest =
            serde_json::from_str(r#"{"username": "alice", "display": "Alice A"}"#).unwrap();
        assert_eq!(request.display_name, "Alice A");

        let request: FinishRegistrationRequest =
            serde_json::from_str(r#"{"credential": "{}", "username": "alice"}"#).unwrap();
        assert!(request.credname.is_none());

        let request: LoginRequest = serde_json::from_str("{}").unwrap();
        assert!(request.username.is_none());
    }

    #[test]
    fn test_login_response_omits_counter_warning() {
        let response = LoginResponse {
            status: STATUS_SUCCESS.to_string(),
            message: "Authentication successful".to_string(),
            username: "alice".to_string(),
            display_name: "Alice A".to_string(),
            counter_warning: false,
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["displayName"], "Alice A");
        assert!(json.get("counterWarning").is_none());
    }
}
