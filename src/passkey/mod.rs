//! Passkey functionality for application integration
//!
//! This module wraps the `WebAuthn` relying party in the register / login
//! flow an application exposes, with JSON status envelopes and persistence
//! through the repositories.

mod errors;
pub use errors::PasskeyError;

// Service layer
mod service;
pub use service::*;

// Request and response envelopes
mod types;
pub use types::*;
