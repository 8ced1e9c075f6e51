//! COSE key handling for `WebAuthn`
//!
//! Decodes the `COSE_Key` structures found in attested credential data into
//! verifiable key material and encodes them back for storage.

use ciborium::value::Value;
use serde::{Deserialize, Serialize};

use super::errors::WebAuthnError;

// COSE_Key common labels
const LABEL_KTY: i64 = 1;
const LABEL_ALG: i64 = 3;
// Key-type specific labels
const LABEL_CRV: i64 = -1;
const LABEL_X: i64 = -2;
const LABEL_Y: i64 = -3;
const LABEL_RSA_N: i64 = -1;
const LABEL_RSA_E: i64 = -2;

// Key types
const KTY_OKP: i64 = 1;
const KTY_EC2: i64 = 2;
const KTY_RSA: i64 = 3;

// Curves
const CRV_P256: i64 = 1;
const CRV_ED25519: i64 = 6;

const P256_COORDINATE_LEN: usize = 32;
const ED25519_KEY_LEN: usize = 32;
const MIN_RSA_MODULUS_LEN: usize = 256; // 2048 bits

/// COSE algorithms accepted for credentials
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CoseAlgorithm {
    /// ECDSA P-256 with SHA-256
    ES256,
    /// Ed25519
    EdDSA,
    /// RSASSA-PKCS1-v1_5 with SHA-256
    RS256,
}

impl CoseAlgorithm {
    #[must_use]
    pub fn identifier(self) -> i64 {
        match self {
            CoseAlgorithm::ES256 => -7,
            CoseAlgorithm::EdDSA => -8,
            CoseAlgorithm::RS256 => -257,
        }
    }

    #[must_use]
    pub fn from_identifier(alg: i64) -> Option<Self> {
        match alg {
            -7 => Some(CoseAlgorithm::ES256),
            -8 => Some(CoseAlgorithm::EdDSA),
            -257 => Some(CoseAlgorithm::RS256),
            _ => None,
        }
    }
}

/// Public key decoded from a `COSE_Key`
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CoseKey {
    /// EC2 key on P-256
    Ec2 { x: Vec<u8>, y: Vec<u8> },
    /// OKP key on Ed25519
    Okp { x: Vec<u8> },
    /// RSA key
    Rsa { n: Vec<u8>, e: Vec<u8> },
}

impl CoseKey {
    /// Algorithm implied by the key type
    #[must_use]
    pub fn algorithm(&self) -> CoseAlgorithm {
        match self {
            CoseKey::Ec2 { .. } => CoseAlgorithm::ES256,
            CoseKey::Okp { .. } => CoseAlgorithm::EdDSA,
            CoseKey::Rsa { .. } => CoseAlgorithm::RS256,
        }
    }

    /// Uncompressed SEC1 point (`0x04 || x || y`) for EC2 keys
    #[must_use]
    pub fn sec1_point(&self) -> Option<Vec<u8>> {
        match self {
            CoseKey::Ec2 { x, y } => {
                let mut point = Vec::with_capacity(1 + x.len() + y.len());
                point.push(0x04);
                point.extend_from_slice(x);
                point.extend_from_slice(y);
                Some(point)
            }
            _ => None,
        }
    }

    /// Build a key from a decoded CBOR map
    ///
    /// # Errors
    /// - `MalformedAttestation` if the value is not a COSE map or a parameter is missing
    /// - `UnsupportedKeyType` if the key type, curve or algorithm is not supported
    pub fn from_cbor_value(value: &Value) -> Result<Self, WebAuthnError> {
        let Value::Map(map) = value else {
            return Err(WebAuthnError::MalformedAttestation(
                "COSE key is not a map".to_string(),
            ));
        };

        let kty = integer_param(map, LABEL_KTY, "kty")?;
        let alg = integer_param(map, LABEL_ALG, "alg")?;
        let algorithm = CoseAlgorithm::from_identifier(alg).ok_or_else(|| {
            WebAuthnError::UnsupportedKeyType(format!("COSE algorithm {alg}"))
        })?;

        let key = match (kty, algorithm) {
            (KTY_EC2, CoseAlgorithm::ES256) => {
                let crv = integer_param(map, LABEL_CRV, "crv")?;
                if crv != CRV_P256 {
                    return Err(WebAuthnError::UnsupportedKeyType(format!(
                        "EC2 curve {crv}"
                    )));
                }
                let x = bytes_param(map, LABEL_X, "x")?;
                let y = bytes_param(map, LABEL_Y, "y")?;
                if x.len() != P256_COORDINATE_LEN || y.len() != P256_COORDINATE_LEN {
                    return Err(WebAuthnError::MalformedAttestation(
                        "Invalid P-256 coordinate length".to_string(),
                    ));
                }
                let key = CoseKey::Ec2 { x, y };
                // Reject points that are not on the curve before they are ever stored
                let point = key.sec1_point().unwrap_or_default();
                p256::PublicKey::from_sec1_bytes(&point).map_err(|_| {
                    WebAuthnError::MalformedAttestation("Invalid P-256 point".to_string())
                })?;
                key
            }
            (KTY_OKP, CoseAlgorithm::EdDSA) => {
                let crv = integer_param(map, LABEL_CRV, "crv")?;
                if crv != CRV_ED25519 {
                    return Err(WebAuthnError::UnsupportedKeyType(format!(
                        "OKP curve {crv}"
                    )));
                }
                let x = bytes_param(map, LABEL_X, "x")?;
                if x.len() != ED25519_KEY_LEN {
                    return Err(WebAuthnError::MalformedAttestation(
                        "Invalid Ed25519 key length".to_string(),
                    ));
                }
                CoseKey::Okp { x }
            }
            (KTY_RSA, CoseAlgorithm::RS256) => {
                let n = bytes_param(map, LABEL_RSA_N, "n")?;
                let e = bytes_param(map, LABEL_RSA_E, "e")?;
                let significant = n.iter().skip_while(|b| **b == 0).count();
                if significant < MIN_RSA_MODULUS_LEN {
                    return Err(WebAuthnError::UnsupportedKeyType(
                        "RSA modulus shorter than 2048 bits".to_string(),
                    ));
                }
                if e.is_empty() {
                    return Err(WebAuthnError::MalformedAttestation(
                        "Empty RSA exponent".to_string(),
                    ));
                }
                CoseKey::Rsa { n, e }
            }
            (kty, algorithm) => {
                return Err(WebAuthnError::UnsupportedKeyType(format!(
                    "key type {kty} with {algorithm:?}"
                )))
            }
        };

        Ok(key)
    }

    /// Encode as a CBOR `COSE_Key`
    ///
    /// # Errors
    /// Returns `Internal` if CBOR serialization fails
    pub fn to_bytes(&self) -> Result<Vec<u8>, WebAuthnError> {
        let alg = Value::Integer(self.algorithm().identifier().into());
        let entries = match self {
            CoseKey::Ec2 { x, y } => vec![
                (Value::Integer(LABEL_KTY.into()), Value::Integer(KTY_EC2.into())),
                (Value::Integer(LABEL_ALG.into()), alg),
                (Value::Integer(LABEL_CRV.into()), Value::Integer(CRV_P256.into())),
                (Value::Integer(LABEL_X.into()), Value::Bytes(x.clone())),
                (Value::Integer(LABEL_Y.into()), Value::Bytes(y.clone())),
            ],
            CoseKey::Okp { x } => vec![
                (Value::Integer(LABEL_KTY.into()), Value::Integer(KTY_OKP.into())),
                (Value::Integer(LABEL_ALG.into()), alg),
                (Value::Integer(LABEL_CRV.into()), Value::Integer(CRV_ED25519.into())),
                (Value::Integer(LABEL_X.into()), Value::Bytes(x.clone())),
            ],
            CoseKey::Rsa { n, e } => vec![
                (Value::Integer(LABEL_KTY.into()), Value::Integer(KTY_RSA.into())),
                (Value::Integer(LABEL_ALG.into()), alg),
                (Value::Integer(LABEL_RSA_N.into()), Value::Bytes(n.clone())),
                (Value::Integer(LABEL_RSA_E.into()), Value::Bytes(e.clone())),
            ],
        };

        let mut buf = Vec::new();
        ciborium::ser::into_writer(&Value::Map(entries), &mut buf)
            .map_err(|e| WebAuthnError::Internal(format!("COSE key encoding failed: {e}")))?;
        Ok(buf)
    }
}

/// Decode a stored or attested `COSE_Key`
///
/// # Errors
/// - `MalformedAttestation` on invalid CBOR, trailing bytes or missing parameters
/// - `UnsupportedKeyType` for key types other than EC2 P-256, OKP Ed25519 and RSA
pub fn decode_cose_key(bytes: &[u8]) -> Result<CoseKey, WebAuthnError> {
    let mut cursor = std::io::Cursor::new(bytes);
    let value: Value = ciborium::de::from_reader(&mut cursor)
        .map_err(|_| WebAuthnError::MalformedAttestation("Invalid COSE key CBOR".to_string()))?;
    if usize::try_from(cursor.position()).unwrap_or(usize::MAX) != bytes.len() {
        return Err(WebAuthnError::MalformedAttestation(
            "Trailing bytes after COSE key".to_string(),
        ));
    }
    CoseKey::from_cbor_value(&value)
}

fn find_param(map: &[(Value, Value)], label: i64) -> Option<&Value> {
    map.iter()
        .find(|(k, _)| matches!(k, Value::Integer(i) if i64::try_from(*i).ok() == Some(label)))
        .map(|(_, v)| v)
}

fn integer_param(map: &[(Value, Value)], label: i64, name: &str) -> Result<i64, WebAuthnError> {
    match find_param(map, label) {
        Some(Value::Integer(i)) => i64::try_from(*i).map_err(|_| {
            WebAuthnError::MalformedAttestation(format!("COSE parameter {name} out of range"))
        }),
        _ => Err(WebAuthnError::MalformedAttestation(format!(
            "Missing or invalid COSE parameter {name}"
        ))),
    }
}

fn bytes_param(map: &[(Value, Value)], label: i64, name: &str) -> Result<Vec<u8>, WebAuthnError> {
    match find_param(map, label) {
        Some(Value::Bytes(bytes)) => Ok(bytes.clone()),
        _ => Err(WebAuthnError::MalformedAttestation(format!(
            "Missing or invalid COSE parameter {name}"
        ))),
    }
}
