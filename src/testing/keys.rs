//! Software credential keys
//!
//! Key pairs for every supported COSE algorithm, able to sign like an
//! authenticator and to describe themselves as a `COSE_Key`.

use ring::rand::SystemRandom;
use ring::signature::{
    EcdsaKeyPair, Ed25519KeyPair, KeyPair, ECDSA_P256_SHA256_ASN1_SIGNING,
};
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{SignatureEncoding, Signer};
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use sha2::Sha256;

use crate::webauthn::{CoseAlgorithm, CoseKey};

/// Fixed 2048-bit key so RS256 tests skip prime generation
const RSA_TEST_KEY_PEM: &str = include_str!("rsa_test_key.pem");

/// Private key held by a software authenticator
pub enum SoftKey {
    Es256(EcdsaKeyPair),
    Ed25519(Ed25519KeyPair),
    Rs256(Box<RsaPrivateKey>),
}

impl SoftKey {
    /// Create a key for the given algorithm
    ///
    /// # Panics
    /// Panics if the system random source fails
    #[must_use]
    pub fn generate(alg: CoseAlgorithm) -> Self {
        let rng = SystemRandom::new();
        match alg {
            CoseAlgorithm::ES256 => {
                let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &rng)
                    .expect("generate P-256 key");
                let key_pair =
                    EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, pkcs8.as_ref(), &rng)
                        .expect("load P-256 key");
                SoftKey::Es256(key_pair)
            }
            CoseAlgorithm::EdDSA => {
                let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).expect("generate Ed25519 key");
                let key_pair =
                    Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).expect("load Ed25519 key");
                SoftKey::Ed25519(key_pair)
            }
            CoseAlgorithm::RS256 => {
                let key =
                    RsaPrivateKey::from_pkcs8_pem(RSA_TEST_KEY_PEM).expect("load RSA test key");
                SoftKey::Rs256(Box::new(key))
            }
        }
    }

    #[must_use]
    pub fn algorithm(&self) -> CoseAlgorithm {
        match self {
            SoftKey::Es256(_) => CoseAlgorithm::ES256,
            SoftKey::Ed25519(_) => CoseAlgorithm::EdDSA,
            SoftKey::Rs256(_) => CoseAlgorithm::RS256,
        }
    }

    /// Public half as a `COSE_Key`
    #[must_use]
    pub fn cose_key(&self) -> CoseKey {
        match self {
            SoftKey::Es256(key_pair) => {
                // Uncompressed point: 0x04 || x || y
                let point = key_pair.public_key().as_ref();
                CoseKey::Ec2 {
                    x: point[1..33].to_vec(),
                    y: point[33..65].to_vec(),
                }
            }
            SoftKey::Ed25519(key_pair) => CoseKey::Okp {
                x: key_pair.public_key().as_ref().to_vec(),
            },
            SoftKey::Rs256(key) => CoseKey::Rsa {
                n: key.n().to_bytes_be(),
                e: key.e().to_bytes_be(),
            },
        }
    }

    /// SEC1 uncompressed point of a P-256 key
    #[must_use]
    pub fn public_point(&self) -> Option<Vec<u8>> {
        match self {
            SoftKey::Es256(key_pair) => Some(key_pair.public_key().as_ref().to_vec()),
            _ => None,
        }
    }

    /// Sign the way an authenticator does (ECDSA signatures are ASN.1 DER)
    ///
    /// # Panics
    /// Panics if the system random source fails
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        match self {
            SoftKey::Es256(key_pair) => key_pair
                .sign(&SystemRandom::new(), message)
                .expect("ECDSA signing")
                .as_ref()
                .to_vec(),
            SoftKey::Ed25519(key_pair) => key_pair.sign(message).as_ref().to_vec(),
            SoftKey::Rs256(key) => SigningKey::<Sha256>::new((**key).clone())
                .sign(message)
                .to_vec(),
        }
    }
}

impl std::fmt::Debug for SoftKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SoftKey").field(&self.algorithm()).finish()
    }
}
