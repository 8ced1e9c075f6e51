//! Software authenticator
//!
//! Produces registration and assertion responses the way a browser and a
//! FIDO2 authenticator would, so ceremonies can be driven end to end.

use ciborium::value::Value;
use serde_json::json;

use super::certificate::AttestationCa;
use super::constants::SOFT_AAGUID;
use super::keys::SoftKey;
use crate::webauthn::cbor::AuthenticatorFlags;
use crate::webauthn::crypto;
use crate::webauthn::{
    AuthenticationResponse, AuthenticatorAssertionResponse, AuthenticatorAttestationResponse,
    AuthenticatorTransport, Base64Url, CoseAlgorithm, PublicKeyCredentialCreationOptions,
    PublicKeyCredentialRequestOptions, RegistrationResponse, CLIENT_DATA_TYPE_CREATE,
    CLIENT_DATA_TYPE_GET, PUBLIC_KEY_CREDENTIAL_TYPE,
};

/// Attestation statement the authenticator emits
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SoftAttestation {
    /// Format `none`
    None,
    /// Format `packed` signed by the credential key
    PackedSelf,
    /// Format `packed` with an attestation certificate
    PackedFull,
    /// Format `fido-u2f` (ES256 credentials only)
    FidoU2f,
}

/// Authenticator holding a single credential
#[derive(Debug)]
pub struct SoftAuthenticator {
    key: SoftKey,
    credential_id: Vec<u8>,
    aaguid: [u8; 16],
    counter: u32,
    increments_counter: bool,
    user_verification: bool,
    attestation: SoftAttestation,
    forged_attestation: bool,
    certificate_authority: Option<AttestationCa>,
    certificate_aaguid: Option<[u8; 16]>,
    user_handle: Option<Base64Url>,
}

impl SoftAuthenticator {
    /// Create an authenticator with a fresh credential and `none` attestation
    ///
    /// # Panics
    /// Panics if the system random source fails
    #[must_use]
    pub fn new(alg: CoseAlgorithm) -> Self {
        Self {
            key: SoftKey::generate(alg),
            credential_id: crypto::random_bytes(32).expect("credential ID"),
            aaguid: SOFT_AAGUID,
            counter: 0,
            increments_counter: true,
            user_verification: true,
            attestation: SoftAttestation::None,
            forged_attestation: false,
            certificate_authority: None,
            certificate_aaguid: None,
            user_handle: None,
        }
    }

    #[must_use]
    pub fn with_attestation(mut self, attestation: SoftAttestation) -> Self {
        self.attestation = attestation;
        self
    }

    /// Sign the attestation over the wrong data
    #[must_use]
    pub fn with_forged_attestation(mut self) -> Self {
        self.forged_attestation = true;
        self
    }

    /// Issue attestation certificates from this CA instead of a throwaway one
    #[must_use]
    pub fn with_certificate_authority(mut self, ca: AttestationCa) -> Self {
        self.certificate_authority = Some(ca);
        self
    }

    /// Put a different AAGUID into the attestation certificate
    #[must_use]
    pub fn with_certificate_aaguid(mut self, aaguid: [u8; 16]) -> Self {
        self.certificate_aaguid = Some(aaguid);
        self
    }

    #[must_use]
    pub fn with_user_verification(mut self, verified: bool) -> Self {
        self.user_verification = verified;
        self
    }

    #[must_use]
    pub fn with_counter(mut self, counter: u32) -> Self {
        self.counter = counter;
        self
    }

    /// Keep the signature counter at its current value
    #[must_use]
    pub fn with_fixed_counter(mut self) -> Self {
        self.increments_counter = false;
        self
    }

    pub fn set_counter(&mut self, counter: u32) {
        self.counter = counter;
    }

    #[must_use]
    pub fn counter(&self) -> u32 {
        self.counter
    }

    #[must_use]
    pub fn credential_id(&self) -> &[u8] {
        &self.credential_id
    }

    #[must_use]
    pub fn key(&self) -> &SoftKey {
        &self.key
    }

    /// Build clientDataJSON as a browser would
    ///
    /// # Panics
    /// Panics if JSON serialization fails
    #[must_use]
    pub fn client_data_json(client_data_type: &str, challenge: &[u8], origin: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "type": client_data_type,
            "challenge": Base64Url::from(challenge).encode(),
            "origin": origin,
            "crossOrigin": false,
        }))
        .expect("client data JSON")
    }

    /// Answer `navigator.credentials.create()`
    pub fn make_credential(
        &mut self,
        options: &PublicKeyCredentialCreationOptions,
        origin: &str,
    ) -> RegistrationResponse {
        self.user_handle = Some(options.user.id.clone());
        let client_data =
            Self::client_data_json(CLIENT_DATA_TYPE_CREATE, options.challenge.as_slice(), origin);
        let attestation_object =
            self.attestation_object(&options.rp.id, &crypto::sha256(&client_data));

        RegistrationResponse {
            id: Base64Url::from(self.credential_id.as_slice()).encode(),
            raw_id: Base64Url::from(self.credential_id.as_slice()),
            response: AuthenticatorAttestationResponse {
                client_data_json: Base64Url::new(client_data),
                attestation_object: Base64Url::new(attestation_object),
                transports: Some(vec![AuthenticatorTransport::Internal]),
            },
            r#type: PUBLIC_KEY_CREDENTIAL_TYPE.to_string(),
            client_extension_results: None,
            authenticator_attachment: Some("platform".to_string()),
        }
    }

    /// Answer `navigator.credentials.get()`, advancing the counter
    pub fn get_assertion(
        &mut self,
        options: &PublicKeyCredentialRequestOptions,
        origin: &str,
    ) -> AuthenticationResponse {
        self.assertion_with_type(options, origin, CLIENT_DATA_TYPE_GET)
    }

    /// Like [`Self::get_assertion`] with a chosen client data type
    pub fn assertion_with_type(
        &mut self,
        options: &PublicKeyCredentialRequestOptions,
        origin: &str,
        client_data_type: &str,
    ) -> AuthenticationResponse {
        if self.increments_counter {
            self.counter = self.counter.wrapping_add(1);
        }
        let client_data =
            Self::client_data_json(client_data_type, options.challenge.as_slice(), origin);
        let authenticator_data = self.authenticator_data(&options.rp_id, false);

        let mut signed = authenticator_data.clone();
        signed.extend_from_slice(&crypto::sha256(&client_data));
        let signature = self.key.sign(&signed);

        AuthenticationResponse {
            id: Base64Url::from(self.credential_id.as_slice()).encode(),
            raw_id: Base64Url::from(self.credential_id.as_slice()),
            response: AuthenticatorAssertionResponse {
                client_data_json: Base64Url::new(client_data),
                authenticator_data: Base64Url::new(authenticator_data),
                signature: Base64Url::new(signature),
                user_handle: self.user_handle.clone(),
            },
            r#type: PUBLIC_KEY_CREDENTIAL_TYPE.to_string(),
            client_extension_results: None,
            authenticator_attachment: Some("platform".to_string()),
        }
    }

    /// Encode a CBOR attestation object for the credential
    ///
    /// # Panics
    /// Panics if CBOR serialization fails or `fido-u2f` is used with a non-ES256 key
    #[must_use]
    pub fn attestation_object(&self, rp_id: &str, client_data_hash: &[u8; 32]) -> Vec<u8> {
        let auth_data = self.authenticator_data(rp_id, true);
        let mut signed = auth_data.clone();
        signed.extend_from_slice(client_data_hash);
        if self.forged_attestation {
            signed.push(0x00);
        }

        let (format, statement) = match self.attestation {
            SoftAttestation::None => ("none", Vec::new()),
            SoftAttestation::PackedSelf => (
                "packed",
                vec![
                    (text("alg"), integer(self.key.algorithm().identifier())),
                    (text("sig"), Value::Bytes(self.key.sign(&signed))),
                ],
            ),
            SoftAttestation::PackedFull => {
                let attestation_key = SoftKey::generate(CoseAlgorithm::ES256);
                let x5c = self.certificate_chain(
                    &attestation_key,
                    Some(self.certificate_aaguid.unwrap_or(self.aaguid)),
                );
                (
                    "packed",
                    vec![
                        (text("alg"), integer(CoseAlgorithm::ES256.identifier())),
                        (text("sig"), Value::Bytes(attestation_key.sign(&signed))),
                        (text("x5c"), x5c),
                    ],
                )
            }
            SoftAttestation::FidoU2f => {
                let credential_point = self
                    .key
                    .public_point()
                    .expect("fido-u2f requires an ES256 credential");
                let mut verification_data = vec![0x00];
                verification_data.extend_from_slice(&crypto::sha256(rp_id.as_bytes()));
                verification_data.extend_from_slice(client_data_hash);
                verification_data.extend_from_slice(&self.credential_id);
                verification_data.extend_from_slice(&credential_point);
                if self.forged_attestation {
                    verification_data.push(0x00);
                }

                let attestation_key = SoftKey::generate(CoseAlgorithm::ES256);
                let x5c = self.certificate_chain(&attestation_key, None);
                (
                    "fido-u2f",
                    vec![
                        (text("sig"), Value::Bytes(attestation_key.sign(&verification_data))),
                        (text("x5c"), x5c),
                    ],
                )
            }
        };

        let object = Value::Map(vec![
            (text("fmt"), text(format)),
            (text("attStmt"), Value::Map(statement)),
            (text("authData"), Value::Bytes(auth_data)),
        ]);
        let mut encoded = Vec::new();
        ciborium::ser::into_writer(&object, &mut encoded).expect("attestation object CBOR");
        encoded
    }

    /// `x5c` for an attestation key: the leaf, then any intermediates
    fn certificate_chain(&self, attestation_key: &SoftKey, aaguid: Option<[u8; 16]>) -> Value {
        let point = attestation_key
            .public_point()
            .expect("attestation keys are P-256");
        let ca = self
            .certificate_authority
            .clone()
            .unwrap_or_else(AttestationCa::generate);
        let mut chain = vec![Value::Bytes(ca.issue_leaf(&point, aaguid))];
        chain.extend(ca.chain().iter().cloned().map(Value::Bytes));
        Value::Array(chain)
    }

    fn authenticator_data(&self, rp_id: &str, attested: bool) -> Vec<u8> {
        let mut flags = AuthenticatorFlags::USER_PRESENT;
        if self.user_verification {
            flags |= AuthenticatorFlags::USER_VERIFIED;
        }
        if attested {
            flags |= AuthenticatorFlags::ATTESTED_CREDENTIAL_DATA;
        }

        let mut data = crypto::sha256(rp_id.as_bytes()).to_vec();
        data.push(flags);
        data.extend_from_slice(&self.counter.to_be_bytes());

        if attested {
            // U2F authenticators report a zero AAGUID
            if self.attestation == SoftAttestation::FidoU2f {
                data.extend_from_slice(&[0u8; 16]);
            } else {
                data.extend_from_slice(&self.aaguid);
            }
            let id_len = u16::try_from(self.credential_id.len()).expect("credential ID length");
            data.extend_from_slice(&id_len.to_be_bytes());
            data.extend_from_slice(&self.credential_id);
            data.extend_from_slice(&self.key.cose_key().to_bytes().expect("COSE key"));
        }
        data
    }
}

fn text(value: &str) -> Value {
    Value::Text(value.to_string())
}

fn integer(value: i64) -> Value {
    Value::Integer(value.into())
}
