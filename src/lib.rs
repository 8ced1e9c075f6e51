#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

/// Version of the webauthn-rp crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod passkey;
pub mod settings;
pub mod webauthn;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

/// Re-export commonly used items
pub use passkey::{PasskeyAuthenticationService, PasskeyAuthenticationServiceImpl, PasskeyError};
pub use settings::Settings;
pub use webauthn::{RelyingParty, WebAuthnError, WebAuthnSettings};
