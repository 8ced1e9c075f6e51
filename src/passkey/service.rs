//! Passkey application service implementation
//!
//! This module provides the service layer an application puts behind its
//! registration and login endpoints: request validation, user creation,
//! the `WebAuthn` ceremonies and persistence of their results.

use std::sync::Arc;

use super::errors::PasskeyError;
use super::types::{
    CredentialSummary, FinishLoginRequest, FinishRegistrationRequest, LoginRequest,
    LoginResponse, LoginStartResponse, RegisterRequest, RegistrationStartResponse,
    StatusResponse, STATUS_SUCCESS,
};
use crate::settings::Settings;
use crate::webauthn::crypto;
use crate::webauthn::{
    AuthenticationResponse, Base64Url, ChallengeKey, CounterPolicy, RegistrationResponse, RelyingParty,
    RepositoryError, UserIdentity, WebAuthnError,
};

/// Longest accepted username or credential label
const MAX_NAME_LEN: usize = 64;

/// Trait for the passkey application service
pub trait PasskeyAuthenticationService {
    /// Start registration of a new account
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The username is empty or too long
    /// - The username already holds credentials (409)
    /// - The user cannot be stored
    fn register(&self, request: &RegisterRequest)
        -> Result<RegistrationStartResponse, PasskeyError>;

    /// Start registration of another authenticator for an existing account
    ///
    /// # Errors
    ///
    /// Returns an error if the user does not exist (404)
    fn register_additional(&self, username: &str)
        -> Result<RegistrationStartResponse, PasskeyError>;

    /// Complete registration and store the credential
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The user does not exist (404)
    /// - The credential JSON cannot be parsed
    /// - The registration ceremony fails
    /// - The credential cannot be stored
    fn finish_registration(
        &self,
        request: &FinishRegistrationRequest,
    ) -> Result<StatusResponse, PasskeyError>;

    /// Start a login, discoverable when no username is given
    ///
    /// # Errors
    ///
    /// Returns an error if the named user does not exist or has no credentials (404)
    fn login(&self, request: &LoginRequest) -> Result<LoginStartResponse, PasskeyError>;

    /// Complete a login and persist the signature counter
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The credential JSON cannot be parsed
    /// - The assertion ceremony fails (401 for assertion failures)
    /// - The counter cannot be stored
    fn finish_login(&self, request: &FinishLoginRequest) -> Result<LoginResponse, PasskeyError>;

    /// List a user's credentials
    ///
    /// # Errors
    ///
    /// Returns an error if the user does not exist (404)
    fn credentials(&self, username: &str) -> Result<Vec<CredentialSummary>, PasskeyError>;

    /// Revoke one of a user's credentials
    ///
    /// # Errors
    ///
    /// Returns an error if the user does not exist or does not own the credential
    fn revoke(&self, username: &str, credential_id: &str)
        -> Result<StatusResponse, PasskeyError>;
}

/// Implementation of `PasskeyAuthenticationService` over a [`RelyingParty`]
pub struct PasskeyAuthenticationServiceImpl {
    relying_party: Arc<RelyingParty>,
}

impl PasskeyAuthenticationServiceImpl {
    /// Create a new passkey service
    #[must_use]
    pub fn new(relying_party: Arc<RelyingParty>) -> Self {
        Self { relying_party }
    }

    /// Create a service backed by in-memory stores
    ///
    /// # Errors
    ///
    /// Returns an error if the `WebAuthn` settings are invalid
    pub fn from_settings(settings: &Settings) -> Result<Self, PasskeyError> {
        let relying_party = RelyingParty::in_memory(settings.webauthn.clone())?;
        Ok(Self::new(Arc::new(relying_party)))
    }

    #[must_use]
    pub fn relying_party(&self) -> &Arc<RelyingParty> {
        &self.relying_party
    }

    fn find_user(&self, username: &str) -> Result<UserIdentity, PasskeyError> {
        self.relying_party
            .users()
            .find_by_username(username)?
            .ok_or_else(|| PasskeyError::WebAuthn(WebAuthnError::UserNotFound(username.to_string())))
    }
}

impl PasskeyAuthenticationService for PasskeyAuthenticationServiceImpl {
    fn register(
        &self,
        request: &RegisterRequest,
    ) -> Result<RegistrationStartResponse, PasskeyError> {
        let username = validate_name(&request.username, "Username")?;
        let display_name = match request.display_name.trim() {
            "" => username.to_string(),
            display => display.to_string(),
        };

        // Accounts whose registration never finished are reused
        let user = match self.relying_party.users().find_by_username(username)? {
            Some(existing) => existing,
            None => {
                let user = UserIdentity {
                    id: crypto::generate_user_handle()?,
                    name: username.to_string(),
                    display_name,
                };
                self.relying_party.users().save(user.clone())?;
                log::info!("Created account {username}");
                user
            }
        };

        let options = self.relying_party.start_registration(&user)?;
        Ok(RegistrationStartResponse {
            status: STATUS_SUCCESS.to_string(),
            message: "Registration initiated".to_string(),
            public_key_credential_creation_options: options,
        })
    }

    fn register_additional(
        &self,
        username: &str,
    ) -> Result<RegistrationStartResponse, PasskeyError> {
        let user = self.find_user(username)?;
        let options = self.relying_party.start_additional_registration(&user)?;
        Ok(RegistrationStartResponse {
            status: STATUS_SUCCESS.to_string(),
            message: "Registration initiated".to_string(),
            public_key_credential_creation_options: options,
        })
    }

    fn finish_registration(
        &self,
        request: &FinishRegistrationRequest,
    ) -> Result<StatusResponse, PasskeyError> {
        let user = self.find_user(&request.username)?;
        let response: RegistrationResponse =
            serde_json::from_str(&request.credential).map_err(|_| {
                self.relying_party
                    .cancel_ceremony(&ChallengeKey::registration(&user.name));
                PasskeyError::InvalidRequest("Invalid credential JSON".to_string())
            })?;

        let mut credential = self.relying_party.finish_registration(&user, &response)?;
        credential.label = match request.credname.as_deref().map(str::trim) {
            Some(label) if !label.is_empty() => {
                Some(label.chars().take(MAX_NAME_LEN).collect())
            }
            _ => None,
        };
        let credential_id = credential.credential_id.clone();
        self.relying_party.credentials().save(credential)?;
        log::info!("Stored credential {credential_id} for {}", user.name);

        Ok(StatusResponse::success("Registration successful"))
    }

    fn login(&self, request: &LoginRequest) -> Result<LoginStartResponse, PasskeyError> {
        let username = request
            .username
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty());
        let options = self.relying_party.start_authentication(username)?;
        Ok(LoginStartResponse {
            status: STATUS_SUCCESS.to_string(),
            message: "Authentication initiated".to_string(),
            assertion_request: options,
        })
    }

    fn finish_login(&self, request: &FinishLoginRequest) -> Result<LoginResponse, PasskeyError> {
        let username = request
            .username
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty());
        // A discoverable ceremony is keyed by its challenge, which an unreadable
        // credential does not reveal; that entry is left to expire
        let response: AuthenticationResponse =
            serde_json::from_str(&request.credential).map_err(|_| {
                if let Some(name) = username {
                    self.relying_party
                        .cancel_ceremony(&ChallengeKey::authentication(name));
                }
                PasskeyError::InvalidRequest("Invalid credential JSON".to_string())
            })?;

        let outcome = self
            .relying_party
            .finish_authentication(username, &response)?;
        // On a tolerated regression the outcome carries the stored counter
        let saved = self.relying_party.credentials().update_counter(
            outcome.credential_id.as_slice(),
            outcome.previous_counter,
            outcome.counter,
            outcome.authenticated_at,
        );
        let counter_warning = match saved {
            Ok(()) => outcome.counter_regressed,
            Err(RepositoryError::CounterConflict { stored, presented })
                if self.relying_party.settings().counter_policy == CounterPolicy::Warn =>
            {
                log::warn!(
                    "Counter of credential {} moved to {stored} during login, kept over {presented}",
                    outcome.credential_id
                );
                true
            }
            Err(err @ RepositoryError::CounterConflict { .. }) => {
                log::warn!("Login rejected for credential {}: {err}", outcome.credential_id);
                return Err(WebAuthnError::from(err).into());
            }
            Err(err) => return Err(err.into()),
        };

        let Some(user) = self
            .relying_party
            .users()
            .find_by_handle(&outcome.user_handle)?
        else {
            return Err(WebAuthnError::UserNotFound(outcome.user_handle.encode()).into());
        };

        Ok(LoginResponse {
            status: STATUS_SUCCESS.to_string(),
            message: "Authentication successful".to_string(),
            username: user.name,
            display_name: user.display_name,
            counter_warning,
        })
    }

    fn credentials(&self, username: &str) -> Result<Vec<CredentialSummary>, PasskeyError> {
        let user = self.find_user(username)?;
        Ok(self
            .relying_party
            .credentials()
            .find_by_user(&user)?
            .iter()
            .map(CredentialSummary::from)
            .collect())
    }

    fn revoke(&self, username: &str, credential_id: &str) -> Result<StatusResponse, PasskeyError> {
        let user = self.find_user(username)?;
        let credential_id = Base64Url::decode(credential_id)
            .map_err(|_| PasskeyError::InvalidRequest("Invalid credential ID".to_string()))?;

        let credentials = self.relying_party.credentials();
        match credentials.find_by_credential_id(credential_id.as_slice())? {
            Some(credential) if credential.user_handle == user.id => {
                credentials.delete(credential_id.as_slice())?;
                log::info!("Revoked credential {credential_id} of {username}");
                Ok(StatusResponse::success("Credential revoked"))
            }
            _ => Err(WebAuthnError::UnknownCredential.into()),
        }
    }
}

fn validate_name<'a>(value: &'a str, field: &str) -> Result<&'a str, PasskeyError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(PasskeyError::InvalidRequest(format!("{field} is required")));
    }
    if value.chars().count() > MAX_NAME_LEN {
        return Err(PasskeyError::InvalidRequest(format!(
            "{field} must be at most {MAX_NAME_LEN} characters"
        )));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{SoftAuthenticator, TestFixtures};
    use crate::webauthn::{CeremonyState, CoseAlgorithm};

    fn service() -> PasskeyAuthenticationServiceImpl {
        PasskeyAuthenticationServiceImpl::new(Arc::new(TestFixtures::relying_party()))
    }

    #[test]
    fn test_register_validates_username() {
        let service = service();
        let err = service
            .register(&RegisterRequest {
                username: "  ".to_string(),
                display_name: "Nobody".to_string(),
            })
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.safe_message(), "Username is required");

        let err = service
            .register(&RegisterRequest {
                username: "a".repeat(MAX_NAME_LEN + 1),
                display_name: String::new(),
            })
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn test_register_reuses_unfinished_account() {
        let service = service();
        let request = RegisterRequest {
            username: "alice".to_string(),
            display_name: String::new(),
        };
        let first = service.register(&request).unwrap();
        let second = service.register(&request).unwrap();

        let options = &first.public_key_credential_creation_options;
        assert_eq!(options.user.display_name, "alice");
        assert_eq!(options.user.id, second.public_key_credential_creation_options.user.id);
        assert_ne!(options.challenge, second.public_key_credential_creation_options.challenge);
    }

    #[test]
    fn test_unknown_user_is_not_found() {
        let service = service();
        let err = service
            .finish_registration(&FinishRegistrationRequest {
                credential: "{}".to_string(),
                username: "ghost".to_string(),
                credname: None,
            })
            .unwrap_err();
        assert_eq!(err.status_code(), 404);
        assert_eq!(service.credentials("ghost").unwrap_err().status_code(), 404);
    }

    #[test]
    fn test_unparseable_credential_json() {
        let service = service();
        service
            .register(&RegisterRequest {
                username: "alice".to_string(),
                display_name: "Alice A".to_string(),
            })
            .unwrap();
        let err = service
            .finish_registration(&FinishRegistrationRequest {
                credential: "not json".to_string(),
                username: "alice".to_string(),
                credname: None,
            })
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.safe_message(), "Invalid credential JSON");
        assert_eq!(
            service
                .relying_party()
                .ceremony_state(&ChallengeKey::registration("alice")),
            CeremonyState::Failed
        );
    }

    #[test]
    fn test_unparseable_assertion_cancels_login() {
        let service = service();
        let mut authenticator = SoftAuthenticator::new(CoseAlgorithm::ES256);
        TestFixtures::register(service.relying_party(), "bob", &mut authenticator);

        let started = service
            .login(&LoginRequest {
                username: Some("bob".to_string()),
            })
            .unwrap();
        let err = service
            .finish_login(&FinishLoginRequest {
                credential: "{\"id\":".to_string(),
                username: Some("bob".to_string()),
            })
            .unwrap_err();
        assert_eq!(err.status_code(), 400);

        let key = ChallengeKey::authentication("bob");
        assert_eq!(
            service.relying_party().ceremony_state(&key),
            CeremonyState::Failed
        );
        // The original challenge cannot be completed afterwards
        let response = authenticator.get_assertion(&started.assertion_request, TestFixtures::ORIGIN);
        let err = service
            .finish_login(&FinishLoginRequest {
                credential: serde_json::to_string(&response).unwrap(),
                username: Some("bob".to_string()),
            })
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }
}
