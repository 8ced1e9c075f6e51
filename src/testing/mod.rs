//! Testing utilities for the relying party
//!
//! Software authenticators, attestation certificates and fixtures that let
//! tests drive real ceremonies without a browser.
//!
//! ## Organization
//!
//! - [`fixtures`] - Pre-built relying parties, users and credentials
//! - [`authenticator`] - Software authenticator producing browser responses
//! - [`keys`] - Credential key pairs for each supported algorithm
//! - [`certificate`] - Attestation certificate authority
//!
//! ## Usage
//!
//! ```rust,ignore
//! use webauthn_rp::testing::{SoftAuthenticator, TestFixtures};
//! use webauthn_rp::webauthn::CoseAlgorithm;
//!
//! let rp = TestFixtures::relying_party();
//! let mut authenticator = SoftAuthenticator::new(CoseAlgorithm::ES256);
//! let (user, _credential) = TestFixtures::register(&rp, "alice", &mut authenticator);
//!
//! let options = rp.start_authentication(Some(&user.name)).unwrap();
//! let response = authenticator.get_assertion(&options, TestFixtures::ORIGIN);
//! assert!(rp.finish_authentication(Some(&user.name), &response).is_ok());
//! ```

pub mod authenticator;
pub mod certificate;
pub mod fixtures;
pub mod keys;

// Re-export commonly used items for convenience
pub use authenticator::{SoftAttestation, SoftAuthenticator};
pub use certificate::AttestationCa;
pub use fixtures::TestFixtures;
pub use keys::SoftKey;

/// Common test constants
pub mod constants {
    /// Relying party ID used by fixtures
    pub const TEST_RP_ID: &str = "example.com";

    /// Origin allowed by fixture settings
    pub const TEST_ORIGIN: &str = "https://example.com";

    pub const TEST_RP_NAME: &str = "Example RP";

    /// AAGUID reported by the software authenticator
    pub const SOFT_AAGUID: [u8; 16] = [
        0x53, 0x6f, 0x66, 0x74, 0x41, 0x75, 0x74, 0x68, 0x6e, 0x2d, 0x54, 0x65, 0x73, 0x74, 0x00,
        0x01,
    ];
}
