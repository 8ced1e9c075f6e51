//! Attestation certificates for tests
//!
//! A throwaway P-256 certificate authority built on the `x509-cert` builder.
//! A root issues subordinate CAs and attestation leaves; [`AttestationCa::chain`]
//! holds what an authenticator sends after its leaf in `x5c`.

use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use p256::ecdsa::{DerSignature, SigningKey};
use p256::pkcs8::{DecodePrivateKey, EncodePublicKey};
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, ECDSA_P256_SHA256_ASN1_SIGNING};
use x509_cert::builder::{Builder, CertificateBuilder, Profile};
use x509_cert::der::asn1::OctetString;
use x509_cert::der::oid::{AssociatedOid, ObjectIdentifier};
use x509_cert::der::pem::LineEnding;
use x509_cert::der::{Encode, EncodePem, Length, Writer};
use x509_cert::ext::{AsExtension, Extension};
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::SubjectPublicKeyInfoOwned;
use x509_cert::time::Validity;

const ROOT_SUBJECT: &str = "CN=Soft Attestation Root,O=webauthn-rp,C=US";
const INTERMEDIATE_SUBJECT: &str = "CN=Soft Attestation Intermediate,O=webauthn-rp,C=US";
const SIGNER_SUBJECT: &str = "CN=Soft Attestation Signer,O=webauthn-rp,C=US";
const LEAF_SUBJECT: &str =
    "CN=Soft Authenticator Attestation,OU=Authenticator Attestation,O=webauthn-rp,C=US";

/// Ten years
const VALIDITY: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

static NEXT_SERIAL: AtomicU32 = AtomicU32::new(1);

/// FIDO `id-fido-gen-ce-aaguid` extension
struct AaguidExtension(OctetString);

impl AssociatedOid for AaguidExtension {
    const OID: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.4.1.45724.1.1.4");
}

impl Encode for AaguidExtension {
    fn encoded_len(&self) -> x509_cert::der::Result<Length> {
        self.0.encoded_len()
    }

    fn encode(&self, encoder: &mut impl Writer) -> x509_cert::der::Result<()> {
        self.0.encode(encoder)
    }
}

impl AsExtension for AaguidExtension {
    fn critical(&self, _subject: &Name, _extensions: &[Extension]) -> bool {
        false
    }
}

/// Certificate authority issuing attestation certificates
///
/// Test support only: every failure panics.
#[derive(Clone)]
pub struct AttestationCa {
    signing_key: SigningKey,
    subject: Name,
    certificate: Vec<u8>,
    /// Certificates between an issued leaf and the root
    chain: Vec<Vec<u8>>,
}

impl AttestationCa {
    /// Create a self-signed root with a fresh P-256 key
    ///
    /// # Panics
    /// Panics if key generation or certificate encoding fails
    #[must_use]
    pub fn generate() -> Self {
        let signing_key = generate_key();
        let subject = parse_name(ROOT_SUBJECT);
        let certificate = build(
            Profile::Root,
            subject.clone(),
            spki(signing_key.verifying_key()),
            &signing_key,
            None,
        );

        Self {
            signing_key,
            subject,
            certificate,
            chain: Vec::new(),
        }
    }

    /// Issue an intermediate CA under this one
    ///
    /// # Panics
    /// Panics if key generation or certificate encoding fails
    #[must_use]
    pub fn subordinate(&self) -> Self {
        let signing_key = generate_key();
        let subject = parse_name(INTERMEDIATE_SUBJECT);
        let certificate = build(
            Profile::SubCA {
                issuer: self.subject.clone(),
                path_len_constraint: None,
            },
            subject.clone(),
            spki(signing_key.verifying_key()),
            &self.signing_key,
            None,
        );
        self.issued(signing_key, subject, certificate)
    }

    /// Certify a fresh key as an end entity and hand back its signer
    ///
    /// Whatever it issues must not be trusted.
    ///
    /// # Panics
    /// Panics if key generation or certificate encoding fails
    #[must_use]
    pub fn non_ca_issuer(&self) -> Self {
        let signing_key = generate_key();
        let subject = parse_name(SIGNER_SUBJECT);
        let certificate = build(
            leaf_profile(&self.subject),
            subject.clone(),
            spki(signing_key.verifying_key()),
            &self.signing_key,
            None,
        );
        self.issued(signing_key, subject, certificate)
    }

    /// This CA's certificate (DER)
    #[must_use]
    pub fn certificate(&self) -> &[u8] {
        &self.certificate
    }

    /// Certificates to send after a leaf issued by this CA, root excluded
    #[must_use]
    pub fn chain(&self) -> &[Vec<u8>] {
        &self.chain
    }

    /// This CA's certificate (PEM)
    ///
    /// # Panics
    /// Panics if the certificate cannot be re-encoded
    #[must_use]
    pub fn pem(&self) -> String {
        use x509_cert::der::Decode;
        x509_cert::Certificate::from_der(&self.certificate)
            .and_then(|certificate| certificate.to_pem(LineEnding::LF))
            .expect("PEM certificate")
    }

    /// Issue an end-entity attestation certificate for a P-256 public point
    ///
    /// With an AAGUID the leaf carries the FIDO AAGUID extension.
    ///
    /// # Panics
    /// Panics if the point is not on P-256 or encoding fails
    #[must_use]
    pub fn issue_leaf(&self, subject_point: &[u8], aaguid: Option<[u8; 16]>) -> Vec<u8> {
        let public_key = p256::PublicKey::from_sec1_bytes(subject_point).expect("P-256 point");
        build(
            leaf_profile(&self.subject),
            parse_name(LEAF_SUBJECT),
            spki(&public_key),
            &self.signing_key,
            aaguid,
        )
    }

    fn issued(&self, signing_key: SigningKey, subject: Name, certificate: Vec<u8>) -> Self {
        let mut chain = vec![certificate.clone()];
        chain.extend(self.chain.iter().cloned());
        Self {
            signing_key,
            subject,
            certificate,
            chain,
        }
    }
}

impl std::fmt::Debug for AttestationCa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttestationCa")
            .field("subject", &self.subject.to_string())
            .field("chain_len", &self.chain.len())
            .finish_non_exhaustive()
    }
}

fn leaf_profile(issuer: &Name) -> Profile {
    Profile::Leaf {
        issuer: issuer.clone(),
        enable_key_agreement: false,
        enable_key_encipherment: false,
    }
}

fn build(
    profile: Profile,
    subject: Name,
    public_key: SubjectPublicKeyInfoOwned,
    issuer_key: &SigningKey,
    aaguid: Option<[u8; 16]>,
) -> Vec<u8> {
    let serial = SerialNumber::from(NEXT_SERIAL.fetch_add(1, Ordering::Relaxed));
    let validity = Validity::from_now(VALIDITY).expect("validity");
    let mut builder =
        CertificateBuilder::new(profile, serial, validity, subject, public_key, issuer_key)
            .expect("certificate builder");
    if let Some(aaguid) = aaguid {
        let extension = AaguidExtension(OctetString::new(aaguid.to_vec()).expect("AAGUID"));
        builder.add_extension(&extension).expect("AAGUID extension");
    }
    let certificate = builder.build::<DerSignature>().expect("signed certificate");
    certificate.to_der().expect("certificate DER")
}

fn generate_key() -> SigningKey {
    let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &SystemRandom::new())
        .expect("generate P-256 key");
    SigningKey::from_pkcs8_der(pkcs8.as_ref()).expect("load P-256 key")
}

fn spki(key: &impl EncodePublicKey) -> SubjectPublicKeyInfoOwned {
    let der = key.to_public_key_der().expect("public key DER");
    SubjectPublicKeyInfoOwned::try_from(der.as_bytes()).expect("subject public key info")
}

fn parse_name(name: &str) -> Name {
    Name::from_str(name).expect("distinguished name")
}
