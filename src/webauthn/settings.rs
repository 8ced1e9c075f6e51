//! `WebAuthn` settings implementation
//!
//! This module defines relying-party settings independent of how the
//! application loads its configuration.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use url::Url;

use super::cose::CoseAlgorithm;
use super::errors::WebAuthnError;
use super::types::{
    AttestationConveyancePreference, AuthenticatorAttachment, ResidentKeyRequirement,
    UserVerificationRequirement,
};

/// Longest challenge lifetime accepted (1 day)
pub const MAX_CHALLENGE_TIMEOUT_SECONDS: u64 = 86_400;

/// What to do when an assertion counter does not advance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CounterPolicy {
    /// Fail the assertion
    #[default]
    Reject,
    /// Accept the assertion, flag it and keep the stored counter
    Warn,
}

/// Attestation trust configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AttestationTrustSettings {
    /// PEM or DER root certificates
    pub trust_anchor_paths: Vec<String>,
    /// Fail registrations whose attestation does not chain to a trust anchor
    pub require_trusted_attestation: bool,
}

/// `WebAuthn` settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebAuthnSettings {
    /// Relying Party ID (usually the domain)
    pub rp_id: String,
    /// Relying Party name (displayed to user)
    pub rp_name: String,
    /// Allowed origins (e.g., <https://example.com>)
    pub rp_origins: Vec<String>,
    /// Challenge lifetime in seconds
    pub challenge_timeout_seconds: u64,
    pub user_verification: UserVerificationRequirement,
    pub authenticator_attachment: Option<AuthenticatorAttachment>,
    pub resident_key: ResidentKeyRequirement,
    pub attestation: AttestationConveyancePreference,
    /// Accepted credential algorithms, in preference order
    pub algorithms: Vec<CoseAlgorithm>,
    pub counter_policy: CounterPolicy,
    /// Accept authenticators that never increment their counter (always 0)
    pub allow_zero_counter: bool,
    pub attestation_trust: AttestationTrustSettings,
}

impl Default for WebAuthnSettings {
    fn default() -> Self {
        Self {
            rp_id: "localhost".to_string(),
            rp_name: "WebAuthn RP".to_string(),
            rp_origins: vec!["http://localhost:8080".to_string()],
            challenge_timeout_seconds: 300,
            user_verification: UserVerificationRequirement::Preferred,
            authenticator_attachment: None,
            resident_key: ResidentKeyRequirement::Preferred,
            attestation: AttestationConveyancePreference::None,
            algorithms: vec![
                CoseAlgorithm::ES256,
                CoseAlgorithm::EdDSA,
                CoseAlgorithm::RS256,
            ],
            counter_policy: CounterPolicy::Reject,
            allow_zero_counter: true,
            attestation_trust: AttestationTrustSettings::default(),
        }
    }
}

impl WebAuthnSettings {
    /// Validate settings
    ///
    /// # Errors
    /// Returns `Configuration` if the RP ID is empty, an origin is not a secure
    /// origin within the RP ID, no algorithm is configured or the timeout is zero
    pub fn validate(&self) -> Result<(), WebAuthnError> {
        if self.rp_id.trim().is_empty() {
            return Err(WebAuthnError::Configuration(
                "rp_id must not be empty".to_string(),
            ));
        }
        if self.rp_origins.is_empty() {
            return Err(WebAuthnError::Configuration(
                "At least one origin must be configured".to_string(),
            ));
        }
        for origin in &self.rp_origins {
            self.validate_origin(origin)?;
        }
        if self.algorithms.is_empty() {
            return Err(WebAuthnError::Configuration(
                "At least one algorithm must be configured".to_string(),
            ));
        }
        if self.challenge_timeout_seconds == 0
            || self.challenge_timeout_seconds > MAX_CHALLENGE_TIMEOUT_SECONDS
        {
            return Err(WebAuthnError::Configuration(format!(
                "challenge_timeout_seconds must be between 1 and {MAX_CHALLENGE_TIMEOUT_SECONDS}"
            )));
        }
        Ok(())
    }

    fn validate_origin(&self, origin: &str) -> Result<(), WebAuthnError> {
        let url = Url::parse(origin)
            .map_err(|e| WebAuthnError::Configuration(format!("Invalid origin {origin}: {e}")))?;
        let Some(host) = url.host_str() else {
            return Err(WebAuthnError::Configuration(format!(
                "Origin {origin} has no host"
            )));
        };

        match url.scheme() {
            "https" => {}
            "http" if host == "localhost" => {}
            scheme => {
                return Err(WebAuthnError::Configuration(format!(
                    "Origin {origin} uses {scheme}; only https (or http on localhost) is allowed"
                )))
            }
        }

        let rp_id = self.rp_id.as_str();
        if host != rp_id && !host.ends_with(&format!(".{rp_id}")) {
            return Err(WebAuthnError::Configuration(format!(
                "Origin {origin} is not within rp_id {rp_id}"
            )));
        }
        Ok(())
    }

    /// Timeout advertised to the browser, in milliseconds
    #[must_use]
    pub fn timeout_millis(&self) -> u32 {
        u32::try_from(self.challenge_timeout_seconds.saturating_mul(1000)).unwrap_or(u32::MAX)
    }

    /// Challenge lifetime, capped at [`MAX_CHALLENGE_TIMEOUT_SECONDS`]
    #[must_use]
    pub fn challenge_ttl(&self) -> Duration {
        let seconds = self
            .challenge_timeout_seconds
            .min(MAX_CHALLENGE_TIMEOUT_SECONDS);
        Duration::seconds(i64::try_from(seconds).unwrap_or(0))
    }

    #[must_use]
    pub fn user_verification_required(&self) -> bool {
        self.user_verification == UserVerificationRequirement::Required
    }
}
