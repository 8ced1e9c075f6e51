//! `WebAuthn` attestation processing
//!
//! This module handles client data checks and attestation statement
//! verification for the `none`, `packed` and `fido-u2f` formats, including the
//! optional certificate chain check against configured trust anchors.

use std::fs;
use std::path::Path;

use ciborium::value::Value;
use ring::signature::{self, UnparsedPublicKey, VerificationAlgorithm};
use x509_parser::certificate::X509Certificate;
use x509_parser::pem::Pem;

use super::cbor::{text_member, AttestationObject, AuthenticatorFlags};
use super::cose::{CoseAlgorithm, CoseKey};
use super::crypto;
use super::errors::WebAuthnError;
use super::types::{AttestationType, CollectedClientData};

const OID_EC_PUBLIC_KEY: &str = "1.2.840.10045.2.1";
const OID_FIDO_GEN_CE_AAGUID: &str = "1.3.6.1.4.1.45724.1.1.4";
const P256_POINT_LEN: usize = 65;

/// Credential data that passed attestation verification
#[derive(Clone, Debug)]
pub struct VerifiedCredential {
    pub credential_id: Vec<u8>,
    pub public_key: CoseKey,
    /// `COSE_Key` bytes as attested, ready for storage
    pub public_key_bytes: Vec<u8>,
    pub aaguid: [u8; 16],
    pub counter: u32,
    pub flags: AuthenticatorFlags,
    pub format: String,
    pub attestation_type: AttestationType,
}

/// Attestation root certificates (DER)
#[derive(Clone, Debug, Default)]
pub struct TrustAnchors {
    certificates: Vec<Vec<u8>>,
}

impl TrustAnchors {
    /// Build from DER certificates, rejecting anything that does not parse
    ///
    /// # Errors
    /// Returns `Configuration` if a certificate cannot be parsed
    pub fn from_der(certificates: Vec<Vec<u8>>) -> Result<Self, WebAuthnError> {
        for der in &certificates {
            x509_parser::parse_x509_certificate(der).map_err(|e| {
                WebAuthnError::Configuration(format!("Invalid trust anchor certificate: {e}"))
            })?;
        }
        Ok(Self { certificates })
    }

    /// Load PEM or DER certificates from files
    ///
    /// A PEM file may hold several certificates.
    ///
    /// # Errors
    /// Returns `Configuration` if a file cannot be read or holds no usable certificate
    pub fn load<P: AsRef<Path>>(paths: &[P]) -> Result<Self, WebAuthnError> {
        let mut certificates = Vec::new();
        for path in paths {
            let path = path.as_ref();
            let data = fs::read(path).map_err(|e| {
                WebAuthnError::Configuration(format!(
                    "Cannot read trust anchor {}: {e}",
                    path.display()
                ))
            })?;

            if data.starts_with(b"-----BEGIN") {
                let before = certificates.len();
                for pem in Pem::iter_from_buffer(&data) {
                    let pem = pem.map_err(|e| {
                        WebAuthnError::Configuration(format!(
                            "Invalid PEM in {}: {e}",
                            path.display()
                        ))
                    })?;
                    if pem.label == "CERTIFICATE" {
                        certificates.push(pem.contents);
                    }
                }
                if certificates.len() == before {
                    return Err(WebAuthnError::Configuration(format!(
                        "No certificate found in {}",
                        path.display()
                    )));
                }
            } else {
                certificates.push(data);
            }
        }
        Self::from_der(certificates)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.certificates.len()
    }
}

/// Policy knobs applied while verifying an attestation
#[derive(Clone, Copy, Debug)]
pub struct AttestationPolicy<'a> {
    pub user_verification_required: bool,
    pub trust_anchors: &'a TrustAnchors,
    pub require_trusted_attestation: bool,
}

/// Parse clientDataJSON
///
/// # Errors
/// Returns `MalformedClientData` if the bytes are not a client data object
pub fn parse_client_data(client_data_json: &[u8]) -> Result<CollectedClientData, WebAuthnError> {
    serde_json::from_slice(client_data_json)
        .map_err(|_| WebAuthnError::MalformedClientData("Invalid client data JSON".to_string()))
}

/// Check the ceremony type and origin of parsed client data
///
/// The challenge is checked by the challenge store, not here.
///
/// # Errors
/// Returns `OriginMismatch` if the type, origin or cross-origin flag is wrong
pub fn check_client_data(
    client_data: &CollectedClientData,
    expected_type: &str,
    allowed_origins: &[String],
) -> Result<(), WebAuthnError> {
    if client_data.r#type != expected_type {
        return Err(WebAuthnError::OriginMismatch(format!(
            "Invalid type, expected {expected_type}"
        )));
    }

    let origin = client_data.origin.trim_end_matches('/');
    if !allowed_origins
        .iter()
        .any(|allowed| allowed.trim_end_matches('/') == origin)
    {
        return Err(WebAuthnError::OriginMismatch(format!(
            "Origin {origin} is not allowed"
        )));
    }

    if client_data.cross_origin == Some(true) {
        return Err(WebAuthnError::OriginMismatch(
            "Cross-origin requests are not allowed".to_string(),
        ));
    }

    Ok(())
}

/// Verify an attestation object for a new credential
///
/// # Errors
/// - `AttestationVerificationFailed` if the RP ID hash, flags, statement or chain do not verify
/// - `MalformedAttestation` if the attestation statement members have the wrong shape
pub fn verify(
    attestation: &AttestationObject,
    client_data_hash: &[u8; 32],
    rp_id_hash: &[u8; 32],
    policy: &AttestationPolicy<'_>,
) -> Result<VerifiedCredential, WebAuthnError> {
    let auth_data = &attestation.auth_data;

    if &auth_data.rp_id_hash != rp_id_hash {
        return Err(WebAuthnError::AttestationVerificationFailed(
            "RP ID hash mismatch".to_string(),
        ));
    }
    if !auth_data.flags.user_present() {
        return Err(WebAuthnError::AttestationVerificationFailed(
            "User presence flag not set".to_string(),
        ));
    }
    if policy.user_verification_required && !auth_data.flags.user_verified() {
        return Err(WebAuthnError::AttestationVerificationFailed(
            "User verification required but not performed".to_string(),
        ));
    }
    let Some(attested) = auth_data.attested_credential.as_ref() else {
        return Err(WebAuthnError::AttestationVerificationFailed(
            "No attested credential data".to_string(),
        ));
    };

    let mut signed_data =
        Vec::with_capacity(attestation.auth_data_bytes.len() + client_data_hash.len());
    signed_data.extend_from_slice(&attestation.auth_data_bytes);
    signed_data.extend_from_slice(client_data_hash);

    let attestation_type = match attestation.format.as_str() {
        "none" => verify_none(&attestation.statement)?,
        "packed" => verify_packed(
            &attestation.statement,
            &signed_data,
            &attested.public_key,
            &attested.aaguid,
            policy.trust_anchors,
        )?,
        "fido-u2f" => {
            let mut verification_data = Vec::new();
            verification_data.push(0x00);
            verification_data.extend_from_slice(rp_id_hash);
            verification_data.extend_from_slice(client_data_hash);
            verification_data.extend_from_slice(&attested.credential_id);
            let Some(point) = attested.public_key.sec1_point() else {
                return Err(WebAuthnError::AttestationVerificationFailed(
                    "fido-u2f requires an EC2 P-256 credential key".to_string(),
                ));
            };
            verification_data.extend_from_slice(&point);
            verify_fido_u2f(&attestation.statement, &verification_data, policy.trust_anchors)?
        }
        other => {
            return Err(WebAuthnError::AttestationVerificationFailed(format!(
                "Unsupported attestation format {other}"
            )))
        }
    };

    if policy.require_trusted_attestation && attestation_type != AttestationType::Trusted {
        return Err(WebAuthnError::AttestationVerificationFailed(
            "Attestation does not chain to a trusted root".to_string(),
        ));
    }

    Ok(VerifiedCredential {
        credential_id: attested.credential_id.clone(),
        public_key: attested.public_key.clone(),
        public_key_bytes: attested.public_key_bytes.clone(),
        aaguid: attested.aaguid,
        counter: auth_data.counter,
        flags: auth_data.flags,
        format: attestation.format.clone(),
        attestation_type,
    })
}

fn verify_none(statement: &[(Value, Value)]) -> Result<AttestationType, WebAuthnError> {
    if statement.is_empty() {
        Ok(AttestationType::None)
    } else {
        Err(WebAuthnError::AttestationVerificationFailed(
            "Format none carries a non-empty statement".to_string(),
        ))
    }
}

fn verify_packed(
    statement: &[(Value, Value)],
    signed_data: &[u8],
    credential_key: &CoseKey,
    aaguid: &[u8; 16],
    trust_anchors: &TrustAnchors,
) -> Result<AttestationType, WebAuthnError> {
    if text_member(statement, "ecdaaKeyId").is_some() {
        return Err(WebAuthnError::AttestationVerificationFailed(
            "ECDAA attestation is not supported".to_string(),
        ));
    }

    let alg = match text_member(statement, "alg") {
        Some(Value::Integer(alg)) => i64::try_from(*alg).ok().and_then(CoseAlgorithm::from_identifier),
        _ => {
            return Err(WebAuthnError::MalformedAttestation(
                "Missing alg in packed statement".to_string(),
            ))
        }
    };
    let Some(alg) = alg else {
        return Err(WebAuthnError::AttestationVerificationFailed(
            "Unsupported packed attestation algorithm".to_string(),
        ));
    };
    let sig = statement_signature(statement)?;

    let Some(x5c) = statement_certificates(statement)? else {
        // Self attestation: signed by the credential key itself
        if alg != credential_key.algorithm() {
            return Err(WebAuthnError::AttestationVerificationFailed(
                "Self attestation algorithm does not match the credential key".to_string(),
            ));
        }
        if !crypto::verify_signature(credential_key, signed_data, sig) {
            return Err(WebAuthnError::AttestationVerificationFailed(
                "Self attestation signature mismatch".to_string(),
            ));
        }
        return Ok(AttestationType::SelfAttestation);
    };

    let leaf = parse_certificate(&x5c[0])?;
    if leaf.is_ca() {
        return Err(WebAuthnError::AttestationVerificationFailed(
            "Attestation certificate must not be a CA".to_string(),
        ));
    }

    if let Some(ext) = leaf
        .extensions()
        .iter()
        .find(|ext| ext.oid.to_id_string() == OID_FIDO_GEN_CE_AAGUID)
    {
        // Extension value is an OCTET STRING wrapping the 16-byte AAGUID
        let value = ext.value;
        if value.len() != 18 || value[0] != 0x04 || value[1] != 0x10 || &value[2..] != aaguid {
            return Err(WebAuthnError::AttestationVerificationFailed(
                "AAGUID in certificate does not match authenticator data".to_string(),
            ));
        }
    }

    if !verify_with_certificate(&leaf, alg, signed_data, sig) {
        return Err(WebAuthnError::AttestationVerificationFailed(
            "Packed attestation signature mismatch".to_string(),
        ));
    }

    chain_attestation_type(&x5c, trust_anchors)
}

fn verify_fido_u2f(
    statement: &[(Value, Value)],
    verification_data: &[u8],
    trust_anchors: &TrustAnchors,
) -> Result<AttestationType, WebAuthnError> {
    let sig = statement_signature(statement)?;
    let Some(x5c) = statement_certificates(statement)? else {
        return Err(WebAuthnError::MalformedAttestation(
            "Missing x5c in fido-u2f statement".to_string(),
        ));
    };
    if x5c.len() != 1 {
        return Err(WebAuthnError::AttestationVerificationFailed(
            "fido-u2f requires exactly one attestation certificate".to_string(),
        ));
    }

    let certificate = parse_certificate(&x5c[0])?;
    let spki = certificate.public_key();
    let key: &[u8] = &spki.subject_public_key.data;
    if spki.algorithm.algorithm.to_id_string() != OID_EC_PUBLIC_KEY || key.len() != P256_POINT_LEN
    {
        return Err(WebAuthnError::AttestationVerificationFailed(
            "fido-u2f certificate key is not P-256".to_string(),
        ));
    }

    if !verify_with_certificate(&certificate, CoseAlgorithm::ES256, verification_data, sig) {
        return Err(WebAuthnError::AttestationVerificationFailed(
            "fido-u2f attestation signature mismatch".to_string(),
        ));
    }

    chain_attestation_type(&x5c, trust_anchors)
}

fn statement_signature(statement: &[(Value, Value)]) -> Result<&[u8], WebAuthnError> {
    match text_member(statement, "sig") {
        Some(Value::Bytes(sig)) => Ok(sig.as_slice()),
        _ => Err(WebAuthnError::MalformedAttestation(
            "Missing sig in attestation statement".to_string(),
        )),
    }
}

fn statement_certificates(
    statement: &[(Value, Value)],
) -> Result<Option<Vec<Vec<u8>>>, WebAuthnError> {
    let Some(value) = text_member(statement, "x5c") else {
        return Ok(None);
    };
    let Value::Array(items) = value else {
        return Err(WebAuthnError::MalformedAttestation(
            "x5c is not an array".to_string(),
        ));
    };
    if items.is_empty() {
        return Err(WebAuthnError::MalformedAttestation(
            "x5c is empty".to_string(),
        ));
    }
    items
        .iter()
        .map(|item| match item {
            Value::Bytes(der) => Ok(der.clone()),
            _ => Err(WebAuthnError::MalformedAttestation(
                "x5c entry is not a byte string".to_string(),
            )),
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

fn parse_certificate(der: &[u8]) -> Result<X509Certificate<'_>, WebAuthnError> {
    x509_parser::parse_x509_certificate(der)
        .map(|(_, certificate)| certificate)
        .map_err(|_| {
            WebAuthnError::AttestationVerificationFailed(
                "Invalid attestation certificate".to_string(),
            )
        })
}

fn verify_with_certificate(
    certificate: &X509Certificate<'_>,
    alg: CoseAlgorithm,
    data: &[u8],
    sig: &[u8],
) -> bool {
    let algorithm: &'static dyn VerificationAlgorithm = match alg {
        CoseAlgorithm::ES256 => &signature::ECDSA_P256_SHA256_ASN1,
        CoseAlgorithm::EdDSA => &signature::ED25519,
        CoseAlgorithm::RS256 => &signature::RSA_PKCS1_2048_8192_SHA256,
    };
    let key: &[u8] = &certificate.public_key().subject_public_key.data;
    UnparsedPublicKey::new(algorithm, key).verify(data, sig).is_ok()
}

/// Basic unless the chain links up to a configured trust anchor
fn chain_attestation_type(
    x5c: &[Vec<u8>],
    trust_anchors: &TrustAnchors,
) -> Result<AttestationType, WebAuthnError> {
    if trust_anchors.is_empty() {
        return Ok(AttestationType::Basic);
    }

    let chain = x5c
        .iter()
        .map(|der| parse_certificate(der))
        .collect::<Result<Vec<_>, _>>()?;

    // Every certificate above the leaf must be a CA
    for link in chain.windows(2) {
        if !link[1].is_ca() {
            log::debug!("Attestation chain issuer is not a CA");
            return Ok(AttestationType::Basic);
        }
        if !link[0].validity().is_valid()
            || link[0].verify_signature(Some(link[1].public_key())).is_err()
        {
            log::debug!("Attestation chain link does not verify");
            return Ok(AttestationType::Basic);
        }
    }

    let Some(last) = chain.last() else {
        return Ok(AttestationType::Basic);
    };
    if !last.validity().is_valid() {
        log::debug!("Attestation certificate is outside its validity period");
        return Ok(AttestationType::Basic);
    }

    let anchored = trust_anchors
        .certificates
        .iter()
        .filter_map(|der| x509_parser::parse_x509_certificate(der).ok())
        .any(|(_, anchor)| {
            anchor.is_ca()
                && anchor.validity().is_valid()
                && last.verify_signature(Some(anchor.public_key())).is_ok()
        });

    Ok(if anchored {
        AttestationType::Trusted
    } else {
        AttestationType::Basic
    })
}
