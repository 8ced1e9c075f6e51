//! `WebAuthn` cryptography operations
//!
//! This module provides the cryptographic operations needed for `WebAuthn`
//! such as challenge generation and assertion signature verification.

use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};
use ring::signature;
use rsa::pkcs1v15::{Signature as RsaSignature, VerifyingKey};
use rsa::signature::Verifier;
use rsa::RsaPublicKey;
use sha2::Sha256;

use super::cose::CoseKey;
use super::errors::WebAuthnError;
use super::types::Base64Url;

/// Challenge length in bytes (256 bits)
pub const CHALLENGE_LEN: usize = 32;
/// Smallest challenge the store will issue
pub const MIN_CHALLENGE_LEN: usize = 16;
/// User handle length in bytes
pub const USER_HANDLE_LEN: usize = 32;

/// Fill a buffer from the system CSPRNG
///
/// # Errors
/// Returns `Internal` if the system random source fails
pub fn random_bytes(len: usize) -> Result<Vec<u8>, WebAuthnError> {
    let mut bytes = vec![0u8; len];
    SystemRandom::new()
        .fill(&mut bytes)
        .map_err(|_| WebAuthnError::Internal("System random source unavailable".to_string()))?;
    Ok(bytes)
}

/// Generate a secure random challenge
///
/// # Errors
/// Returns `Internal` if the system random source fails
pub fn generate_challenge() -> Result<Vec<u8>, WebAuthnError> {
    random_bytes(CHALLENGE_LEN)
}

/// Generate a user handle
///
/// # Errors
/// Returns `Internal` if the system random source fails
pub fn generate_user_handle() -> Result<Base64Url, WebAuthnError> {
    random_bytes(USER_HANDLE_LEN).map(Base64Url::new)
}

/// Hash data using SHA-256
#[must_use]
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(digest::digest(&digest::SHA256, data).as_ref());
    out
}

/// Verify a signature with a credential public key
///
/// The algorithm follows the key type: ECDSA P-256/SHA-256 (ASN.1 signature)
/// for EC2, Ed25519 for OKP and RSASSA-PKCS1-v1_5/SHA-256 for RSA.
/// Returns `false` on any cryptographic mismatch.
#[must_use]
pub fn verify_signature(public_key: &CoseKey, data: &[u8], signature_bytes: &[u8]) -> bool {
    match public_key {
        CoseKey::Ec2 { .. } => {
            let Some(point) = public_key.sec1_point() else {
                return false;
            };
            signature::UnparsedPublicKey::new(&signature::ECDSA_P256_SHA256_ASN1, &point)
                .verify(data, signature_bytes)
                .is_ok()
        }
        CoseKey::Okp { x } => signature::UnparsedPublicKey::new(&signature::ED25519, x)
            .verify(data, signature_bytes)
            .is_ok(),
        CoseKey::Rsa { n, e } => verify_rs256(n, e, data, signature_bytes),
    }
}

/// Verify an assertion signature over `authenticatorData || clientDataHash`
#[must_use]
pub fn verify_assertion(
    authenticator_data: &[u8],
    client_data_hash: &[u8],
    signature_bytes: &[u8],
    public_key: &CoseKey,
) -> bool {
    let mut signed_data = Vec::with_capacity(authenticator_data.len() + client_data_hash.len());
    signed_data.extend_from_slice(authenticator_data);
    signed_data.extend_from_slice(client_data_hash);
    verify_signature(public_key, &signed_data, signature_bytes)
}

fn verify_rs256(n: &[u8], e: &[u8], data: &[u8], signature_bytes: &[u8]) -> bool {
    let Ok(rsa_key) = RsaPublicKey::new(
        rsa::BigUint::from_bytes_be(n),
        rsa::BigUint::from_bytes_be(e),
    ) else {
        return false;
    };
    let Ok(rsa_signature) = RsaSignature::try_from(signature_bytes) else {
        return false;
    };
    VerifyingKey::<Sha256>::new(rsa_key)
        .verify(data, &rsa_signature)
        .is_ok()
}
