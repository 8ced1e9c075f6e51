//! `WebAuthn` relying-party engine
//!
//! This module provides the `WebAuthn` protocol core independent of any
//! transport or persistence: binary decoding, attestation and assertion
//! verification, challenge bookkeeping and the two ceremonies.

pub mod attestation;
pub mod cbor;
pub mod ceremony;
pub mod challenge;
pub mod cose;
pub mod crypto;
mod errors;
pub mod repository;
mod settings;
mod types;

// Re-exports for public use
pub use attestation::{TrustAnchors, VerifiedCredential};
pub use ceremony::RelyingParty;
pub use challenge::{
    CeremonyKind, CeremonyState, Challenge, ChallengeKey, ChallengeStore, InMemoryChallengeStore,
};
pub use cose::{CoseAlgorithm, CoseKey};
pub use errors::{AssertionFailure, ErrorKind, WebAuthnError};
pub use repository::{
    CredentialRepository, InMemoryCredentialRepository, InMemoryUserRepository, RepositoryError,
    UserRepository,
};
pub use settings::{AttestationTrustSettings, CounterPolicy, WebAuthnSettings};
pub use types::*;
