//! Test fixtures providing pre-built test objects
//!
//! Relying parties, users and credentials shared by unit and integration tests.

use chrono::Utc;
use uuid::Uuid;

use super::authenticator::SoftAuthenticator;
use super::constants::{TEST_ORIGIN, TEST_RP_ID, TEST_RP_NAME};
use super::keys::SoftKey;
use crate::webauthn::crypto;
use crate::webauthn::{
    AttestationType, Base64Url, CoseAlgorithm, Credential, RelyingParty, UserIdentity,
    WebAuthnSettings,
};

/// Central fixture provider for all test data
pub struct TestFixtures;

impl TestFixtures {
    pub const RP_ID: &'static str = TEST_RP_ID;
    pub const ORIGIN: &'static str = TEST_ORIGIN;

    /// Relying-party settings for `example.com`
    #[must_use]
    pub fn settings() -> WebAuthnSettings {
        WebAuthnSettings {
            rp_id: TEST_RP_ID.to_string(),
            rp_name: TEST_RP_NAME.to_string(),
            rp_origins: vec![TEST_ORIGIN.to_string()],
            ..WebAuthnSettings::default()
        }
    }

    /// In-memory relying party with default test settings
    ///
    /// # Panics
    /// Panics if the test settings are invalid
    #[must_use]
    pub fn relying_party() -> RelyingParty {
        Self::relying_party_with(Self::settings())
    }

    /// In-memory relying party with custom settings
    ///
    /// # Panics
    /// Panics if the settings are invalid
    #[must_use]
    pub fn relying_party_with(settings: WebAuthnSettings) -> RelyingParty {
        RelyingParty::in_memory(settings).expect("valid test settings")
    }

    /// User with a random 32-byte handle
    ///
    /// # Panics
    /// Panics if the system random source fails
    #[must_use]
    pub fn user(name: &str, display_name: &str) -> UserIdentity {
        UserIdentity {
            id: crypto::generate_user_handle().expect("user handle"),
            name: name.to_string(),
            display_name: display_name.to_string(),
        }
    }

    /// Stored credential for a user, backed by a throwaway ES256 key
    ///
    /// # Panics
    /// Panics if the key cannot be encoded
    #[must_use]
    pub fn credential(user: &UserIdentity, credential_id: &[u8]) -> Credential {
        Credential {
            credential_id: Base64Url::from(credential_id),
            user_handle: user.id.clone(),
            public_key: SoftKey::generate(CoseAlgorithm::ES256)
                .cose_key()
                .to_bytes()
                .expect("COSE key"),
            counter: 0,
            transports: Vec::new(),
            aaguid: Uuid::nil(),
            attestation_format: "none".to_string(),
            attestation_type: AttestationType::None,
            user_verified: true,
            backup_eligible: false,
            backup_state: false,
            created_at: Utc::now(),
            last_used: None,
            label: None,
        }
    }

    /// Run a full registration and persist the user and credential
    ///
    /// # Panics
    /// Panics if any registration step fails
    pub fn register(
        rp: &RelyingParty,
        name: &str,
        authenticator: &mut SoftAuthenticator,
    ) -> (UserIdentity, Credential) {
        let user = Self::user(name, name);
        let options = rp.start_registration(&user).expect("start registration");
        let response = authenticator.make_credential(&options, TEST_ORIGIN);
        let credential = rp
            .finish_registration(&user, &response)
            .expect("finish registration");
        rp.users().save(user.clone()).expect("save user");
        rp.credentials()
            .save(credential.clone())
            .expect("save credential");
        (user, credential)
    }
}
