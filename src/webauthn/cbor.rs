//! CBOR processing for `WebAuthn`
//!
//! This module handles the CBOR (Concise Binary Object Representation)
//! processing needed for `WebAuthn` attestation objects and authenticator data.

use std::io::Cursor;

use ciborium::de::from_reader;
use ciborium::value::Value;

use super::cose::CoseKey;
use super::errors::WebAuthnError;

/// Fixed prefix: 32 bytes RP ID hash, 1 byte flags, 4 bytes counter
pub const AUTH_DATA_MIN_LEN: usize = 37;
const AAGUID_LEN: usize = 16;
/// Largest credential ID allowed by `WebAuthn` Level 2
const MAX_CREDENTIAL_ID_LEN: usize = 1023;

/// Authenticator data flags
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AuthenticatorFlags(pub u8);

impl AuthenticatorFlags {
    pub const USER_PRESENT: u8 = 0x01;
    pub const USER_VERIFIED: u8 = 0x04;
    pub const BACKUP_ELIGIBLE: u8 = 0x08;
    pub const BACKUP_STATE: u8 = 0x10;
    pub const ATTESTED_CREDENTIAL_DATA: u8 = 0x40;
    pub const EXTENSION_DATA: u8 = 0x80;

    #[must_use]
    pub fn user_present(self) -> bool {
        self.0 & Self::USER_PRESENT != 0
    }

    #[must_use]
    pub fn user_verified(self) -> bool {
        self.0 & Self::USER_VERIFIED != 0
    }

    #[must_use]
    pub fn backup_eligible(self) -> bool {
        self.0 & Self::BACKUP_ELIGIBLE != 0
    }

    #[must_use]
    pub fn backup_state(self) -> bool {
        self.0 & Self::BACKUP_STATE != 0
    }

    #[must_use]
    pub fn attested_credential_data(self) -> bool {
        self.0 & Self::ATTESTED_CREDENTIAL_DATA != 0
    }

    #[must_use]
    pub fn extension_data(self) -> bool {
        self.0 & Self::EXTENSION_DATA != 0
    }
}

/// Attested credential data carried in registration authenticator data
#[derive(Clone, Debug)]
pub struct AttestedCredentialData {
    pub aaguid: [u8; AAGUID_LEN],
    pub credential_id: Vec<u8>,
    pub public_key: CoseKey,
    /// `COSE_Key` bytes exactly as the authenticator produced them
    pub public_key_bytes: Vec<u8>,
}

/// Parsed authenticator data
#[derive(Clone, Debug)]
pub struct AuthenticatorData {
    pub rp_id_hash: [u8; 32],
    pub flags: AuthenticatorFlags,
    pub counter: u32,
    pub attested_credential: Option<AttestedCredentialData>,
    pub extensions: Option<Value>,
}

/// Decoded attestation object
#[derive(Clone, Debug)]
pub struct AttestationObject {
    pub format: String,
    /// Raw authenticator data; attestation signatures cover these bytes
    pub auth_data_bytes: Vec<u8>,
    pub auth_data: AuthenticatorData,
    pub statement: Vec<(Value, Value)>,
}

/// Decode a CBOR attestation object (`fmt`, `authData`, `attStmt`)
///
/// # Errors
/// - `MalformedAttestation` on truncated or invalid CBOR or missing members
/// - Any error from [`parse_authenticator_data`]
pub fn decode_attestation_object(bytes: &[u8]) -> Result<AttestationObject, WebAuthnError> {
    let attestation: Value = from_reader(bytes)
        .map_err(|_| WebAuthnError::MalformedAttestation("Invalid CBOR attestation format".to_string()))?;

    let Some(map) = attestation.as_map() else {
        return Err(WebAuthnError::MalformedAttestation(
            "Attestation object is not a map".to_string(),
        ));
    };

    let Some(format) = text_member(map, "fmt").and_then(Value::as_text) else {
        return Err(WebAuthnError::MalformedAttestation(
            "Missing fmt in attestation".to_string(),
        ));
    };

    let Some(auth_data_bytes) = text_member(map, "authData").and_then(Value::as_bytes) else {
        return Err(WebAuthnError::MalformedAttestation(
            "Missing authData in attestation".to_string(),
        ));
    };

    let Some(statement) = text_member(map, "attStmt").and_then(Value::as_map) else {
        return Err(WebAuthnError::MalformedAttestation(
            "Missing attStmt in attestation".to_string(),
        ));
    };

    let auth_data = parse_authenticator_data(auth_data_bytes)?;

    Ok(AttestationObject {
        format: format.to_string(),
        auth_data_bytes: auth_data_bytes.clone(),
        auth_data,
        statement: statement.clone(),
    })
}

/// Parse binary authenticator data
///
/// The format is:
/// - 32 bytes: RP ID hash
/// - 1 byte: flags
/// - 4 bytes: signature counter (big endian)
/// - variable: attested credential data (only if the AT flag is set)
///   - 16 bytes: AAGUID
///   - 2 bytes: credential ID length (L)
///   - L bytes: credential ID
///   - variable: COSE public key
/// - variable: extensions map (only if the ED flag is set)
///
/// # Errors
/// - `MalformedAuthenticatorData` if a length invariant is violated
/// - `MalformedAttestation`/`UnsupportedKeyType` if the embedded COSE key is unusable
pub fn parse_authenticator_data(auth_data: &[u8]) -> Result<AuthenticatorData, WebAuthnError> {
    if auth_data.len() < AUTH_DATA_MIN_LEN {
        return Err(WebAuthnError::MalformedAuthenticatorData(
            "Auth data too short".to_string(),
        ));
    }

    let mut rp_id_hash = [0u8; 32];
    rp_id_hash.copy_from_slice(&auth_data[..32]);
    let flags = AuthenticatorFlags(auth_data[32]);
    let counter = u32::from_be_bytes([auth_data[33], auth_data[34], auth_data[35], auth_data[36]]);

    let mut pos = AUTH_DATA_MIN_LEN;

    let attested_credential = if flags.attested_credential_data() {
        if auth_data.len() < pos + AAGUID_LEN + 2 {
            return Err(WebAuthnError::MalformedAuthenticatorData(
                "Auth data too short for attested credential data".to_string(),
            ));
        }

        let mut aaguid = [0u8; AAGUID_LEN];
        aaguid.copy_from_slice(&auth_data[pos..pos + AAGUID_LEN]);
        pos += AAGUID_LEN;

        let id_len = usize::from(u16::from_be_bytes([auth_data[pos], auth_data[pos + 1]]));
        pos += 2;

        if id_len == 0 || id_len > MAX_CREDENTIAL_ID_LEN {
            return Err(WebAuthnError::MalformedAuthenticatorData(format!(
                "Invalid credential ID length {id_len}"
            )));
        }
        if auth_data.len() < pos + id_len {
            return Err(WebAuthnError::MalformedAuthenticatorData(
                "Auth data too short for credential ID".to_string(),
            ));
        }
        let credential_id = auth_data[pos..pos + id_len].to_vec();
        pos += id_len;

        if auth_data.len() <= pos {
            return Err(WebAuthnError::MalformedAuthenticatorData(
                "Auth data too short for public key".to_string(),
            ));
        }

        let (key_value, used) = read_cbor_item(&auth_data[pos..])?;
        let public_key = CoseKey::from_cbor_value(&key_value)?;
        let public_key_bytes = auth_data[pos..pos + used].to_vec();
        pos += used;

        Some(AttestedCredentialData {
            aaguid,
            credential_id,
            public_key,
            public_key_bytes,
        })
    } else {
        None
    };

    let extensions = if flags.extension_data() {
        if auth_data.len() <= pos {
            return Err(WebAuthnError::MalformedAuthenticatorData(
                "Extension flag set without extension data".to_string(),
            ));
        }
        let (value, used) = read_cbor_item(&auth_data[pos..])?;
        if value.as_map().is_none() {
            return Err(WebAuthnError::MalformedAuthenticatorData(
                "Extension data is not a map".to_string(),
            ));
        }
        pos += used;
        Some(value)
    } else {
        None
    };

    if pos != auth_data.len() {
        return Err(WebAuthnError::MalformedAuthenticatorData(
            "Trailing bytes in authenticator data".to_string(),
        ));
    }

    Ok(AuthenticatorData {
        rp_id_hash,
        flags,
        counter,
        attested_credential,
        extensions,
    })
}

/// Find a member of a CBOR map by text key
pub(crate) fn text_member<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    map.iter()
        .find(|(k, _)| k.as_text() == Some(key))
        .map(|(_, v)| v)
}

/// Read a single CBOR item and report how many bytes it used
fn read_cbor_item(bytes: &[u8]) -> Result<(Value, usize), WebAuthnError> {
    let mut cursor = Cursor::new(bytes);
    let value: Value = from_reader(&mut cursor).map_err(|_| {
        WebAuthnError::MalformedAuthenticatorData("Invalid CBOR in authenticator data".to_string())
    })?;
    let used = usize::try_from(cursor.position()).map_err(|_| {
        WebAuthnError::MalformedAuthenticatorData("Authenticator data too large".to_string())
    })?;
    Ok((value, used))
}
