//! `WebAuthn` core types
//!
//! This module defines the relying-party data model and the `WebAuthn`
//! Level 2 JSON shapes exchanged with the browser. Binary fields travel as
//! unpadded base64url strings.

use std::fmt;

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Client data type for registration ceremonies
pub const CLIENT_DATA_TYPE_CREATE: &str = "webauthn.create";
/// Client data type for assertion ceremonies
pub const CLIENT_DATA_TYPE_GET: &str = "webauthn.get";
/// Credential type for every public key credential
pub const PUBLIC_KEY_CREDENTIAL_TYPE: &str = "public-key";

/// Base64url engine that emits no padding and accepts either form
const BASE64URL: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Binary data carried as a base64url string on the wire
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Base64Url(Vec<u8>);

impl Base64Url {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Decode a base64url string (padding optional)
    ///
    /// # Errors
    /// Returns the decoder error when the input is not base64url
    pub fn decode(encoded: &str) -> Result<Self, base64::DecodeError> {
        BASE64URL.decode(encoded).map(Self)
    }

    /// Encode as unpadded base64url
    #[must_use]
    pub fn encode(&self) -> String {
        BASE64URL.encode(&self.0)
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Base64Url {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Base64Url {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl AsRef<[u8]> for Base64Url {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Base64Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl fmt::Debug for Base64Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Base64Url({})", self.encode())
    }
}

impl Serialize for Base64Url {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for Base64Url {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct Base64UrlVisitor;

        impl Visitor<'_> for Base64UrlVisitor {
            type Value = Base64Url;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a base64url encoded string")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                Base64Url::decode(v).map_err(|e| E::custom(format!("invalid base64url: {e}")))
            }
        }

        deserializer.deserialize_str(Base64UrlVisitor)
    }
}

/// User verification requirement
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum UserVerificationRequirement {
    Required,
    #[default]
    Preferred,
    Discouraged,
}

/// Authenticator attachment modality
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AuthenticatorAttachment {
    Platform,
    CrossPlatform,
}

/// Resident (discoverable) key requirement
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResidentKeyRequirement {
    Discouraged,
    #[default]
    Preferred,
    Required,
}

/// Attestation conveyance preference
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AttestationConveyancePreference {
    #[default]
    None,
    Indirect,
    Direct,
    Enterprise,
}

/// Transport hint reported by the authenticator
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AuthenticatorTransport {
    Usb,
    Nfc,
    Ble,
    SmartCard,
    Hybrid,
    Internal,
    #[serde(other)]
    Unknown,
}

/// How much trust the attestation statement established
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttestationType {
    /// Format "none"
    None,
    /// Signed by the credential key itself
    SelfAttestation,
    /// Certificate-backed, chain not checked against a trust anchor
    Basic,
    /// Certificate chain ends at a configured trust anchor
    Trusted,
}

/// User account as seen by the relying party
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct UserIdentity {
    pub id: Base64Url, // Random user handle
    pub name: String,
    pub display_name: String,
}

/// Registered credential
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Credential {
    pub credential_id: Base64Url,
    pub user_handle: Base64Url,
    pub public_key: Vec<u8>, // COSE-encoded public key
    pub counter: u32,        // Signature counter
    pub transports: Vec<AuthenticatorTransport>,
    pub aaguid: Uuid,
    pub attestation_format: String,
    pub attestation_type: AttestationType,
    pub user_verified: bool,
    pub backup_eligible: bool,
    pub backup_state: bool,
    pub created_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
    pub label: Option<String>, // User-friendly credential name
}

/// Outcome of a successful assertion ceremony
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AssertionOutcome {
    pub credential_id: Base64Url,
    pub user_handle: Base64Url,
    /// Counter the caller should persist
    pub counter: u32,
    /// Stored counter the assertion was checked against
    pub previous_counter: u32,
    /// Set when the counter did not advance and policy let the assertion through
    pub counter_regressed: bool,
    pub user_verified: bool,
    pub backup_state: bool,
    pub authenticated_at: DateTime<Utc>,
}

/// `WebAuthn` relying party information
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RelyingPartyEntity {
    pub id: String,
    pub name: String,
}

/// `WebAuthn` user entity
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct UserEntity {
    pub id: Base64Url,
    pub name: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
}

/// Public key credential parameters
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PublicKeyCredentialParameters {
    #[serde(rename = "type")]
    pub r#type: String, // Always "public-key"
    pub alg: i64,       // COSE algorithm identifier
}

/// Public key credential descriptor
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PublicKeyCredentialDescriptor {
    #[serde(rename = "type")]
    pub r#type: String, // Always "public-key"
    pub id: Base64Url,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transports: Option<Vec<AuthenticatorTransport>>,
}

impl PublicKeyCredentialDescriptor {
    #[must_use]
    pub fn for_credential(credential: &Credential) -> Self {
        Self {
            r#type: PUBLIC_KEY_CREDENTIAL_TYPE.to_string(),
            id: credential.credential_id.clone(),
            transports: if credential.transports.is_empty() {
                None
            } else {
                Some(credential.transports.clone())
            },
        }
    }
}

/// Authenticator selection criteria
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatorSelectionCriteria {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authenticator_attachment: Option<AuthenticatorAttachment>,
    pub resident_key: ResidentKeyRequirement,
    pub require_resident_key: bool,
    pub user_verification: UserVerificationRequirement,
}

/// `PublicKeyCredentialCreationOptions` sent to the browser
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyCredentialCreationOptions {
    pub rp: RelyingPartyEntity,
    pub user: UserEntity,
    pub challenge: Base64Url,
    pub pub_key_cred_params: Vec<PublicKeyCredentialParameters>,
    pub timeout: u32, // Milliseconds
    pub exclude_credentials: Vec<PublicKeyCredentialDescriptor>,
    pub authenticator_selection: AuthenticatorSelectionCriteria,
    pub attestation: AttestationConveyancePreference,
}

/// `PublicKeyCredentialRequestOptions` sent to the browser
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyCredentialRequestOptions {
    pub challenge: Base64Url,
    pub timeout: u32, // Milliseconds
    pub rp_id: String,
    pub allow_credentials: Vec<PublicKeyCredentialDescriptor>,
    pub user_verification: UserVerificationRequirement,
}

/// Registration response from the browser (`RegistrationResponseJSON`)
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationResponse {
    pub id: String,
    pub raw_id: Base64Url,
    pub response: AuthenticatorAttestationResponse,
    #[serde(rename = "type")]
    pub r#type: String,
    #[serde(default)]
    pub client_extension_results: Option<serde_json::Value>,
    #[serde(default)]
    pub authenticator_attachment: Option<String>,
}

/// Authenticator attestation response during registration
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatorAttestationResponse {
    #[serde(rename = "clientDataJSON")]
    pub client_data_json: Base64Url,
    pub attestation_object: Base64Url,
    #[serde(default)]
    pub transports: Option<Vec<AuthenticatorTransport>>,
}

/// Authentication response from the browser (`AuthenticationResponseJSON`)
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationResponse {
    pub id: String,
    pub raw_id: Base64Url,
    pub response: AuthenticatorAssertionResponse,
    #[serde(rename = "type")]
    pub r#type: String,
    #[serde(default)]
    pub client_extension_results: Option<serde_json::Value>,
    #[serde(default)]
    pub authenticator_attachment: Option<String>,
}

/// Authenticator assertion response during authentication
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatorAssertionResponse {
    #[serde(rename = "clientDataJSON")]
    pub client_data_json: Base64Url,
    pub authenticator_data: Base64Url,
    pub signature: Base64Url,
    #[serde(default)]
    pub user_handle: Option<Base64Url>,
}

impl AuthenticatorAssertionResponse {
    /// User handle, treating an empty value as absent
    #[must_use]
    pub fn user_handle(&self) -> Option<&Base64Url> {
        self.user_handle.as_ref().filter(|h| !h.is_empty())
    }
}

/// Client data collected by the browser (`CollectedClientData`)
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CollectedClientData {
    #[serde(rename = "type")]
    pub r#type: String,
    pub challenge: String, // Base64URL-encoded challenge
    pub origin: String,
    #[serde(default)]
    pub cross_origin: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base64url_accepts_padded_and_unpadded() {
        let unpadded = Base64Url::decode("AQID").expect("unpadded");
        let padded = Base64Url::decode("AQIDBA==").expect("padded");
        assert_eq!(unpadded.as_slice(), &[1, 2, 3]);
        assert_eq!(padded.as_slice(), &[1, 2, 3, 4]);
        assert_eq!(padded.encode(), "AQIDBA");
    }

    #[test]
    fn test_creation_options_use_webauthn_field_names() {
        let options = PublicKeyCredentialCreationOptions {
            rp: RelyingPartyEntity {
                id: "example.com".to_string(),
                name: "Example".to_string(),
            },
            user: UserEntity {
                id: Base64Url::new(vec![0xff; 4]),
                name: "alice".to_string(),
                display_name: "Alice A".to_string(),
            },
            challenge: Base64Url::new(vec![0xfb; 16]),
            pub_key_cred_params: vec![PublicKeyCredentialParameters {
                r#type: PUBLIC_KEY_CREDENTIAL_TYPE.to_string(),
                alg: -7,
            }],
            timeout: 300_000,
            exclude_credentials: Vec::new(),
            authenticator_selection: AuthenticatorSelectionCriteria {
                authenticator_attachment: Some(AuthenticatorAttachment::CrossPlatform),
                resident_key: ResidentKeyRequirement::Preferred,
                require_resident_key: false,
                user_verification: UserVerificationRequirement::Preferred,
            },
            attestation: AttestationConveyancePreference::None,
        };

        let json = serde_json::to_value(&options).expect("serialize");
        assert_eq!(json["user"]["displayName"], "Alice A");
        assert_eq!(json["user"]["id"], "_____w");
        assert_eq!(json["pubKeyCredParams"][0]["type"], "public-key");
        assert_eq!(json["excludeCredentials"], serde_json::json!([]));
        assert_eq!(
            json["authenticatorSelection"]["authenticatorAttachment"],
            "cross-platform"
        );
        assert_eq!(json["authenticatorSelection"]["residentKey"], "preferred");
        assert_eq!(json["attestation"], "none");
        assert!(json["challenge"].as_str().is_some_and(|c| !c.contains('=')));
    }

    #[test]
    fn test_assertion_response_parses_browser_json() {
        let json = r#"{
            "id": "AAEC",
            "rawId": "AAEC",
            "type": "public-key",
            "response": {
                "clientDataJSON": "e30",
                "authenticatorData": "AAAA",
                "signature": "AQ",
                "userHandle": ""
            },
            "clientExtensionResults": {}
        }"#;

        let response: AuthenticationResponse = serde_json::from_str(json).expect("parse");
        assert_eq!(response.raw_id.as_slice(), &[0, 1, 2]);
        assert!(response.response.user_handle().is_none());
        assert_eq!(response.response.client_data_json.as_slice(), b"{}");
    }

    #[test]
    fn test_unknown_transport_is_tolerated() {
        let transports: Vec<AuthenticatorTransport> =
            serde_json::from_str(r#"["usb", "hybrid", "cable"]"#).expect("parse");
        assert_eq!(
            transports,
            vec![
                AuthenticatorTransport::Usb,
                AuthenticatorTransport::Hybrid,
                AuthenticatorTransport::Unknown
            ]
        );
    }
}
