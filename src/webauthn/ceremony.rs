//! Registration and assertion ceremonies
//!
//! [`RelyingParty`] ties the challenge store, the decoders and the verifiers
//! together. Ceremonies never persist anything themselves: registration
//! returns the credential to store and authentication returns the counter to
//! save. Every finish consumes its challenge, whether it succeeds or fails.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use super::attestation::{self, AttestationPolicy, TrustAnchors};
use super::cbor;
use super::challenge::{
    CeremonyKind, CeremonyState, Challenge, ChallengeKey, ChallengeStore, InMemoryChallengeStore,
};
use super::cose;
use super::crypto;
use super::errors::{AssertionFailure, WebAuthnError};
use super::repository::{
    CredentialRepository, InMemoryCredentialRepository, InMemoryUserRepository, UserRepository,
};
use super::settings::{CounterPolicy, WebAuthnSettings};
use super::types::{
    AssertionOutcome, AuthenticationResponse, AuthenticatorSelectionCriteria,
    AuthenticatorTransport, Base64Url, CollectedClientData, Credential, PublicKeyCredentialCreationOptions,
    PublicKeyCredentialDescriptor, PublicKeyCredentialParameters,
    PublicKeyCredentialRequestOptions, RegistrationResponse, RelyingPartyEntity,
    ResidentKeyRequirement, UserEntity, UserIdentity, CLIENT_DATA_TYPE_CREATE,
    CLIENT_DATA_TYPE_GET, PUBLIC_KEY_CREDENTIAL_TYPE,
};

/// `WebAuthn` relying party
pub struct RelyingParty {
    settings: WebAuthnSettings,
    rp_id_hash: [u8; 32],
    trust_anchors: TrustAnchors,
    challenges: Arc<dyn ChallengeStore>,
    users: Arc<dyn UserRepository>,
    credentials: Arc<dyn CredentialRepository>,
}

impl RelyingParty {
    /// Create a relying party over the given stores
    ///
    /// Trust anchors named in the settings are loaded here.
    ///
    /// # Errors
    /// Returns `Configuration` if the settings are invalid or a trust anchor cannot be loaded
    pub fn new(
        settings: WebAuthnSettings,
        challenges: Arc<dyn ChallengeStore>,
        users: Arc<dyn UserRepository>,
        credentials: Arc<dyn CredentialRepository>,
    ) -> Result<Self, WebAuthnError> {
        settings.validate()?;
        let trust_anchors = TrustAnchors::load(&settings.attestation_trust.trust_anchor_paths)?;
        if !trust_anchors.is_empty() {
            log::info!("Loaded {} attestation trust anchor(s)", trust_anchors.len());
        }

        Ok(Self {
            rp_id_hash: crypto::sha256(settings.rp_id.as_bytes()),
            settings,
            trust_anchors,
            challenges,
            users,
            credentials,
        })
    }

    /// Create a relying party backed entirely by in-memory stores
    ///
    /// # Errors
    /// Returns `Configuration` if the settings are invalid
    pub fn in_memory(settings: WebAuthnSettings) -> Result<Self, WebAuthnError> {
        let challenges = Arc::new(InMemoryChallengeStore::with_ttl(settings.challenge_ttl()));
        Self::new(
            settings,
            challenges,
            Arc::new(InMemoryUserRepository::new()),
            Arc::new(InMemoryCredentialRepository::new()),
        )
    }

    /// Replace the trust anchors loaded from the settings
    #[must_use]
    pub fn with_trust_anchors(mut self, trust_anchors: TrustAnchors) -> Self {
        self.trust_anchors = trust_anchors;
        self
    }

    #[must_use]
    pub fn settings(&self) -> &WebAuthnSettings {
        &self.settings
    }

    #[must_use]
    pub fn users(&self) -> &Arc<dyn UserRepository> {
        &self.users
    }

    #[must_use]
    pub fn credentials(&self) -> &Arc<dyn CredentialRepository> {
        &self.credentials
    }

    /// State of the ceremony under a challenge key
    #[must_use]
    pub fn ceremony_state(&self, key: &ChallengeKey) -> CeremonyState {
        self.challenges.state(key)
    }

    /// Abandon an outstanding ceremony whose response could not be read
    ///
    /// Returns whether a pending challenge was invalidated.
    pub fn cancel_ceremony(&self, key: &ChallengeKey) -> bool {
        let cancelled = self.challenges.invalidate(key);
        if cancelled {
            log::info!("Cancelled ceremony {key}");
        }
        cancelled
    }

    /// Start registering the first credential of a user
    ///
    /// # Errors
    /// - `DuplicateUser` if an account with this username already holds credentials
    /// - `Repository`/`Internal` on storage or random source failures
    pub fn start_registration(
        &self,
        user: &UserIdentity,
    ) -> Result<PublicKeyCredentialCreationOptions, WebAuthnError> {
        if let Some(existing) = self.users.find_by_username(&user.name)? {
            if !self.credentials.find_by_user(&existing)?.is_empty() {
                log::info!("Registration rejected: username {} already registered", user.name);
                return Err(WebAuthnError::DuplicateUser(user.name.clone()));
            }
        }
        self.creation_options(user, Vec::new())
    }

    /// Start registering another authenticator for an existing account
    ///
    /// All of the user's credentials are excluded so an authenticator cannot
    /// be registered twice.
    ///
    /// # Errors
    /// - `Repository`/`Internal` on storage or random source failures
    pub fn start_additional_registration(
        &self,
        user: &UserIdentity,
    ) -> Result<PublicKeyCredentialCreationOptions, WebAuthnError> {
        let exclude = self
            .credentials
            .find_by_user(user)?
            .iter()
            .map(PublicKeyCredentialDescriptor::for_credential)
            .collect();
        self.creation_options(user, exclude)
    }

    fn creation_options(
        &self,
        user: &UserIdentity,
        exclude_credentials: Vec<PublicKeyCredentialDescriptor>,
    ) -> Result<PublicKeyCredentialCreationOptions, WebAuthnError> {
        let (key, challenge) = self.challenges.issue(
            CeremonyKind::Registration,
            Some(&user.name),
            Some(user.id.clone()),
        )?;
        log::debug!("Issued challenge for {key}");

        Ok(PublicKeyCredentialCreationOptions {
            rp: RelyingPartyEntity {
                id: self.settings.rp_id.clone(),
                name: self.settings.rp_name.clone(),
            },
            user: UserEntity {
                id: user.id.clone(),
                name: user.name.clone(),
                display_name: user.display_name.clone(),
            },
            challenge: Base64Url::new(challenge.bytes),
            pub_key_cred_params: self
                .settings
                .algorithms
                .iter()
                .map(|alg| PublicKeyCredentialParameters {
                    r#type: PUBLIC_KEY_CREDENTIAL_TYPE.to_string(),
                    alg: alg.identifier(),
                })
                .collect(),
            timeout: self.settings.timeout_millis(),
            exclude_credentials,
            authenticator_selection: AuthenticatorSelectionCriteria {
                authenticator_attachment: self.settings.authenticator_attachment,
                resident_key: self.settings.resident_key,
                require_resident_key: self.settings.resident_key
                    == ResidentKeyRequirement::Required,
                user_verification: self.settings.user_verification,
            },
            attestation: self.settings.attestation,
        })
    }

    /// Finish a registration ceremony
    ///
    /// Returns the credential for the caller to persist.
    ///
    /// # Errors
    /// - `MalformedClientData` if clientDataJSON cannot be read
    /// - `ChallengeNotFound`/`ChallengeInvalid` if no matching challenge is outstanding
    /// - `OriginMismatch` for a wrong type or origin
    /// - `MalformedAttestation`/`MalformedAuthenticatorData`/`UnsupportedKeyType` for undecodable responses
    /// - `AttestationVerificationFailed` if the attestation does not verify
    /// - `CredentialAlreadyRegistered` if the credential ID is taken
    pub fn finish_registration(
        &self,
        user: &UserIdentity,
        response: &RegistrationResponse,
    ) -> Result<Credential, WebAuthnError> {
        let key = ChallengeKey::registration(&user.name);
        let client_data_json = response.response.client_data_json.as_slice();

        let (client_data, presented) = match read_presented_challenge(client_data_json) {
            Ok(read) => read,
            Err(err) => {
                self.challenges.invalidate(&key);
                log::warn!("Registration failed for {}: {err}", user.name);
                return Err(err);
            }
        };
        let challenge = self.challenges.consume(&key, &presented).map_err(|err| {
            log::warn!("Registration failed for {}: {err}", user.name);
            err
        })?;

        let result = self.verify_registration(user, response, &client_data, &challenge);
        self.settle(&key, "Registration", &user.name, result)
    }

    fn verify_registration(
        &self,
        user: &UserIdentity,
        response: &RegistrationResponse,
        client_data: &CollectedClientData,
        challenge: &Challenge,
    ) -> Result<Credential, WebAuthnError> {
        if challenge.user_handle.as_ref() != Some(&user.id) {
            return Err(WebAuthnError::ChallengeInvalid);
        }
        attestation::check_client_data(client_data, CLIENT_DATA_TYPE_CREATE, &self.settings.rp_origins)?;
        if response.r#type != PUBLIC_KEY_CREDENTIAL_TYPE {
            return Err(WebAuthnError::MalformedAttestation(format!(
                "Unexpected credential type {}",
                response.r#type
            )));
        }
        if !id_matches_raw_id(&response.id, &response.raw_id) {
            return Err(WebAuthnError::MalformedAttestation(
                "id does not match rawId".to_string(),
            ));
        }

        let client_data_hash = crypto::sha256(response.response.client_data_json.as_slice());
        let attestation_object =
            cbor::decode_attestation_object(response.response.attestation_object.as_slice())?;
        let policy = AttestationPolicy {
            user_verification_required: self.settings.user_verification_required(),
            trust_anchors: &self.trust_anchors,
            require_trusted_attestation: self.settings.attestation_trust.require_trusted_attestation,
        };
        let verified =
            attestation::verify(&attestation_object, &client_data_hash, &self.rp_id_hash, &policy)?;

        if response.raw_id.as_slice() != verified.credential_id.as_slice() {
            return Err(WebAuthnError::AttestationVerificationFailed(
                "rawId does not match the attested credential ID".to_string(),
            ));
        }
        let algorithm = verified.public_key.algorithm();
        if !self.settings.algorithms.contains(&algorithm) {
            return Err(WebAuthnError::UnsupportedKeyType(format!(
                "{algorithm:?} is not an accepted algorithm"
            )));
        }
        if self
            .credentials
            .find_by_credential_id(&verified.credential_id)?
            .is_some()
        {
            return Err(WebAuthnError::CredentialAlreadyRegistered);
        }

        let transports = response
            .response
            .transports
            .clone()
            .unwrap_or_default()
            .into_iter()
            .filter(|transport| *transport != AuthenticatorTransport::Unknown)
            .collect();

        Ok(Credential {
            credential_id: Base64Url::new(verified.credential_id),
            user_handle: user.id.clone(),
            public_key: verified.public_key_bytes,
            counter: verified.counter,
            transports,
            aaguid: Uuid::from_bytes(verified.aaguid),
            attestation_format: verified.format,
            attestation_type: verified.attestation_type,
            user_verified: verified.flags.user_verified(),
            backup_eligible: verified.flags.backup_eligible(),
            backup_state: verified.flags.backup_state(),
            created_at: Utc::now(),
            last_used: None,
            label: None,
        })
    }

    /// Start an authentication ceremony
    ///
    /// With a username the allow-list holds that user's credentials; without
    /// one the ceremony is discoverable and keyed by its challenge.
    ///
    /// # Errors
    /// - `UserNotFound` if the named user does not exist or has no credentials
    /// - `Repository`/`Internal` on storage or random source failures
    pub fn start_authentication(
        &self,
        username: Option<&str>,
    ) -> Result<PublicKeyCredentialRequestOptions, WebAuthnError> {
        let (allow_credentials, user_handle) = match username {
            Some(name) => {
                let Some(user) = self.users.find_by_username(name)? else {
                    log::info!("Authentication requested for unknown user {name}");
                    return Err(WebAuthnError::UserNotFound(name.to_string()));
                };
                let credentials = self.credentials.find_by_user(&user)?;
                if credentials.is_empty() {
                    log::info!("Authentication requested for {name} without credentials");
                    return Err(WebAuthnError::UserNotFound(name.to_string()));
                }
                (
                    credentials
                        .iter()
                        .map(PublicKeyCredentialDescriptor::for_credential)
                        .collect(),
                    Some(user.id),
                )
            }
            None => (Vec::new(), None),
        };

        let (key, challenge) =
            self.challenges
                .issue(CeremonyKind::Authentication, username, user_handle)?;
        log::debug!("Issued challenge for {key}");

        Ok(PublicKeyCredentialRequestOptions {
            challenge: Base64Url::new(challenge.bytes),
            timeout: self.settings.timeout_millis(),
            rp_id: self.settings.rp_id.clone(),
            allow_credentials,
            user_verification: self.settings.user_verification,
        })
    }

    /// Finish an authentication ceremony
    ///
    /// Returns the outcome with the counter the caller should persist.
    ///
    /// # Errors
    /// - `MalformedClientData`/`MalformedAuthenticatorData` for undecodable responses
    /// - `ChallengeNotFound`/`ChallengeInvalid` if no matching challenge is outstanding
    /// - `OriginMismatch` for a wrong type or origin
    /// - `UnknownCredential` if the credential is not registered
    /// - `AssertionFailed` with a reason code for signature, flag, owner and counter failures
    pub fn finish_authentication(
        &self,
        username: Option<&str>,
        response: &AuthenticationResponse,
    ) -> Result<AssertionOutcome, WebAuthnError> {
        let client_data_json = response.response.client_data_json.as_slice();
        let subject = username.unwrap_or("discoverable");

        let (client_data, presented) = match read_presented_challenge(client_data_json) {
            Ok(read) => read,
            Err(err) => {
                if let Some(name) = username {
                    self.challenges.invalidate(&ChallengeKey::authentication(name));
                }
                log::warn!("Authentication failed for {subject}: {err}");
                return Err(err);
            }
        };
        let key = match username {
            Some(name) => ChallengeKey::authentication(name),
            None => ChallengeKey::discoverable(&presented),
        };
        let challenge = self.challenges.consume(&key, &presented).map_err(|err| {
            log::warn!("Authentication failed for {subject}: {err}");
            err
        })?;

        let result = self.verify_assertion(response, &client_data, &challenge);
        self.settle(&key, "Authentication", subject, result)
    }

    fn verify_assertion(
        &self,
        response: &AuthenticationResponse,
        client_data: &CollectedClientData,
        challenge: &Challenge,
    ) -> Result<AssertionOutcome, WebAuthnError> {
        attestation::check_client_data(client_data, CLIENT_DATA_TYPE_GET, &self.settings.rp_origins)?;
        if response.r#type != PUBLIC_KEY_CREDENTIAL_TYPE {
            return Err(WebAuthnError::MalformedAuthenticatorData(format!(
                "Unexpected credential type {}",
                response.r#type
            )));
        }
        if !id_matches_raw_id(&response.id, &response.raw_id) {
            return Err(WebAuthnError::MalformedAuthenticatorData(
                "id does not match rawId".to_string(),
            ));
        }

        let Some(credential) = self
            .credentials
            .find_by_credential_id(response.raw_id.as_slice())?
        else {
            return Err(WebAuthnError::UnknownCredential);
        };

        let returned_handle = response.response.user_handle();
        match &challenge.user_handle {
            Some(expected) => {
                if &credential.user_handle != expected {
                    return Err(WebAuthnError::AssertionFailed(
                        AssertionFailure::CredentialNotAllowed,
                    ));
                }
                if returned_handle.is_some_and(|handle| handle != expected) {
                    return Err(WebAuthnError::AssertionFailed(
                        AssertionFailure::UserHandleMismatch,
                    ));
                }
            }
            None => {
                // Discoverable: the authenticator must name the account
                if returned_handle != Some(&credential.user_handle) {
                    return Err(WebAuthnError::AssertionFailed(
                        AssertionFailure::UserHandleMismatch,
                    ));
                }
                if self.users.find_by_handle(&credential.user_handle)?.is_none() {
                    return Err(WebAuthnError::UserNotFound(
                        credential.user_handle.encode(),
                    ));
                }
            }
        }

        let authenticator_data = response.response.authenticator_data.as_slice();
        let auth_data = cbor::parse_authenticator_data(authenticator_data)?;
        if auth_data.rp_id_hash != self.rp_id_hash {
            return Err(WebAuthnError::AssertionFailed(AssertionFailure::RpIdMismatch));
        }
        if !auth_data.flags.user_present() {
            return Err(WebAuthnError::AssertionFailed(AssertionFailure::UserNotPresent));
        }
        if self.settings.user_verification_required() && !auth_data.flags.user_verified() {
            return Err(WebAuthnError::AssertionFailed(AssertionFailure::UserNotVerified));
        }

        let public_key = cose::decode_cose_key(&credential.public_key)?;
        let client_data_hash = crypto::sha256(response.response.client_data_json.as_slice());
        if !crypto::verify_assertion(
            authenticator_data,
            &client_data_hash,
            response.response.signature.as_slice(),
            &public_key,
        ) {
            return Err(WebAuthnError::AssertionFailed(
                AssertionFailure::SignatureMismatch,
            ));
        }

        let stored = credential.counter;
        let presented = auth_data.counter;
        let both_zero = stored == 0 && presented == 0;
        let regressed = presented <= stored && !(both_zero && self.settings.allow_zero_counter);
        let (counter, counter_regressed) = if regressed {
            match self.settings.counter_policy {
                CounterPolicy::Reject => {
                    log::warn!(
                        "Counter regression on credential {} (stored {stored}, presented {presented})",
                        credential.credential_id
                    );
                    return Err(WebAuthnError::AssertionFailed(
                        AssertionFailure::CounterRegression { stored, presented },
                    ));
                }
                CounterPolicy::Warn => {
                    log::warn!(
                        "Counter regression on credential {} accepted by policy (stored {stored}, presented {presented})",
                        credential.credential_id
                    );
                    (stored, true)
                }
            }
        } else {
            (presented, false)
        };

        Ok(AssertionOutcome {
            credential_id: credential.credential_id,
            user_handle: credential.user_handle,
            counter,
            previous_counter: stored,
            counter_regressed,
            user_verified: auth_data.flags.user_verified(),
            backup_state: auth_data.flags.backup_state(),
            authenticated_at: Utc::now(),
        })
    }

    fn settle<T>(
        &self,
        key: &ChallengeKey,
        ceremony: &str,
        subject: &str,
        result: Result<T, WebAuthnError>,
    ) -> Result<T, WebAuthnError> {
        self.challenges.record_outcome(key, result.is_ok());
        match &result {
            Ok(_) => log::info!("{ceremony} completed for {subject}"),
            Err(err) => log::warn!("{ceremony} failed for {subject}: {err}"),
        }
        result
    }
}

impl std::fmt::Debug for RelyingParty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelyingParty")
            .field("rp_id", &self.settings.rp_id)
            .field("origins", &self.settings.rp_origins)
            .field("trust_anchors", &self.trust_anchors.len())
            .finish_non_exhaustive()
    }
}

/// `id` is the base64url form of `rawId`
fn id_matches_raw_id(id: &str, raw_id: &Base64Url) -> bool {
    Base64Url::decode(id).is_ok_and(|decoded| decoded == *raw_id)
}

/// Parse clientDataJSON and decode the challenge it presents
fn read_presented_challenge(
    client_data_json: &[u8],
) -> Result<(CollectedClientData, Vec<u8>), WebAuthnError> {
    let client_data = attestation::parse_client_data(client_data_json)?;
    let presented = Base64Url::decode(&client_data.challenge)
        .map_err(|_| {
            WebAuthnError::MalformedClientData("Challenge is not base64url".to_string())
        })?
        .into_inner();
    Ok((client_data, presented))
}
