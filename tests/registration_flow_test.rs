// Integration tests for the registration ceremony
use std::sync::Arc;

use webauthn_rp::testing::{AttestationCa, SoftAttestation, SoftAuthenticator, TestFixtures};
use webauthn_rp::webauthn::{
    AttestationType, AuthenticatorTransport, Base64Url, CeremonyState, ChallengeKey,
    CoseAlgorithm, ErrorKind, InMemoryChallengeStore, InMemoryCredentialRepository,
    InMemoryUserRepository, RelyingParty, UserVerificationRequirement,
};

#[test]
fn test_creation_options_for_new_user() {
    let rp = TestFixtures::relying_party();
    let user = TestFixtures::user("alice", "Alice A");

    let options = rp.start_registration(&user).expect("Should start registration");

    assert!(options.challenge.as_slice().len() >= 16);
    assert!(options.user.id.as_slice().len() >= 16);
    assert_eq!(options.user.name, "alice");
    assert_eq!(options.user.display_name, "Alice A");
    assert_eq!(options.rp.id, "example.com");
    assert!(options.exclude_credentials.is_empty());

    // Browser-facing JSON uses WebAuthn member names and unpadded base64url
    let json = serde_json::to_value(&options).unwrap();
    assert_eq!(json["user"]["displayName"], "Alice A");
    assert_eq!(json["pubKeyCredParams"][0]["alg"], -7);
    assert!(!json["challenge"].as_str().unwrap().contains('='));
}

#[test]
fn test_register_each_algorithm() {
    for alg in [CoseAlgorithm::ES256, CoseAlgorithm::EdDSA, CoseAlgorithm::RS256] {
        let rp = TestFixtures::relying_party();
        let user = TestFixtures::user("alice", "Alice A");
        let mut authenticator = SoftAuthenticator::new(alg);

        let options = rp.start_registration(&user).unwrap();
        let response = authenticator.make_credential(&options, TestFixtures::ORIGIN);
        let credential = rp
            .finish_registration(&user, &response)
            .unwrap_or_else(|e| panic!("{alg:?} registration failed: {e}"));

        assert_eq!(credential.credential_id.as_slice(), authenticator.credential_id());
        assert_eq!(credential.user_handle, user.id);
        assert_eq!(credential.counter, 0);
        assert_eq!(credential.attestation_format, "none");
        assert_eq!(credential.attestation_type, AttestationType::None);
        assert_eq!(credential.transports, vec![AuthenticatorTransport::Internal]);
        assert!(credential.user_verified);
        assert!(!credential.aaguid.is_nil());
    }
}

#[test]
fn test_challenge_is_single_use() {
    let rp = TestFixtures::relying_party();
    let user = TestFixtures::user("alice", "Alice A");
    let mut authenticator = SoftAuthenticator::new(CoseAlgorithm::ES256);

    let options = rp.start_registration(&user).unwrap();
    let response = authenticator.make_credential(&options, TestFixtures::ORIGIN);

    assert!(rp.finish_registration(&user, &response).is_ok());
    let err = rp.finish_registration(&user, &response).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ChallengeInvalid);
}

#[test]
fn test_finish_without_challenge() {
    let rp = TestFixtures::relying_party();
    let other = TestFixtures::relying_party();
    let user = TestFixtures::user("alice", "Alice A");
    let mut authenticator = SoftAuthenticator::new(CoseAlgorithm::ES256);

    // Options from another relying party were never issued here
    let options = other.start_registration(&user).unwrap();
    let response = authenticator.make_credential(&options, TestFixtures::ORIGIN);

    let err = rp.finish_registration(&user, &response).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ChallengeNotFound);
}

#[test]
fn test_expired_challenge() {
    let rp = RelyingParty::new(
        TestFixtures::settings(),
        Arc::new(InMemoryChallengeStore::with_ttl(chrono::Duration::zero())),
        Arc::new(InMemoryUserRepository::new()),
        Arc::new(InMemoryCredentialRepository::new()),
    )
    .unwrap();
    let user = TestFixtures::user("alice", "Alice A");
    let mut authenticator = SoftAuthenticator::new(CoseAlgorithm::ES256);

    let options = rp.start_registration(&user).unwrap();
    let response = authenticator.make_credential(&options, TestFixtures::ORIGIN);

    let err = rp.finish_registration(&user, &response).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ChallengeNotFound);
}

#[test]
fn test_reissued_challenge_rejects_stale_response() {
    let rp = TestFixtures::relying_party();
    let user = TestFixtures::user("alice", "Alice A");
    let mut authenticator = SoftAuthenticator::new(CoseAlgorithm::ES256);

    let stale = rp.start_registration(&user).unwrap();
    let fresh = rp.start_registration(&user).unwrap();
    assert_ne!(stale.challenge, fresh.challenge);

    let response = authenticator.make_credential(&stale, TestFixtures::ORIGIN);
    let err = rp.finish_registration(&user, &response).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ChallengeInvalid);

    // A mismatch burns the outstanding challenge as well
    let response = authenticator.make_credential(&fresh, TestFixtures::ORIGIN);
    let err = rp.finish_registration(&user, &response).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ChallengeInvalid);
}

#[test]
fn test_forged_attestation_rejected() {
    let rp = TestFixtures::relying_party();
    let user = TestFixtures::user("alice", "Alice A");
    let mut authenticator = SoftAuthenticator::new(CoseAlgorithm::ES256)
        .with_attestation(SoftAttestation::PackedSelf)
        .with_forged_attestation();

    let options = rp.start_registration(&user).unwrap();
    let response = authenticator.make_credential(&options, TestFixtures::ORIGIN);

    let err = rp.finish_registration(&user, &response).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AttestationVerificationFailed);
    assert_eq!(
        rp.ceremony_state(&ChallengeKey::registration("alice")),
        CeremonyState::Failed
    );
    assert!(rp.credentials().find_by_user(&user).unwrap().is_empty());
}

#[test]
fn test_attestation_formats() {
    for (attestation, format, attestation_type) in [
        (SoftAttestation::PackedSelf, "packed", AttestationType::SelfAttestation),
        (SoftAttestation::PackedFull, "packed", AttestationType::Basic),
        (SoftAttestation::FidoU2f, "fido-u2f", AttestationType::Basic),
    ] {
        let rp = TestFixtures::relying_party();
        let user = TestFixtures::user("alice", "Alice A");
        let mut authenticator =
            SoftAuthenticator::new(CoseAlgorithm::ES256).with_attestation(attestation);

        let options = rp.start_registration(&user).unwrap();
        let response = authenticator.make_credential(&options, TestFixtures::ORIGIN);
        let credential = rp.finish_registration(&user, &response).unwrap();

        assert_eq!(credential.attestation_format, format);
        assert_eq!(credential.attestation_type, attestation_type);
    }
}

#[test]
fn test_required_trusted_attestation() {
    let ca = AttestationCa::generate();
    let dir = tempfile::tempdir().unwrap();
    let anchor_path = dir.path().join("root.pem");
    std::fs::write(&anchor_path, ca.pem()).unwrap();

    let mut settings = TestFixtures::settings();
    settings.attestation_trust.trust_anchor_paths = vec![anchor_path.display().to_string()];
    settings.attestation_trust.require_trusted_attestation = true;
    let rp = TestFixtures::relying_party_with(settings);

    let user = TestFixtures::user("alice", "Alice A");
    let mut trusted = SoftAuthenticator::new(CoseAlgorithm::ES256)
        .with_attestation(SoftAttestation::PackedFull)
        .with_certificate_authority(ca);
    let options = rp.start_registration(&user).unwrap();
    let response = trusted.make_credential(&options, TestFixtures::ORIGIN);
    let credential = rp.finish_registration(&user, &response).unwrap();
    assert_eq!(credential.attestation_type, AttestationType::Trusted);

    let bob = TestFixtures::user("bob", "Bob B");
    let mut untrusted =
        SoftAuthenticator::new(CoseAlgorithm::ES256).with_attestation(SoftAttestation::PackedSelf);
    let options = rp.start_registration(&bob).unwrap();
    let response = untrusted.make_credential(&options, TestFixtures::ORIGIN);
    let err = rp.finish_registration(&bob, &response).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AttestationVerificationFailed);
}

#[test]
fn test_wrong_origin_and_type() {
    let rp = TestFixtures::relying_party();
    let user = TestFixtures::user("alice", "Alice A");
    let mut authenticator = SoftAuthenticator::new(CoseAlgorithm::ES256);

    let options = rp.start_registration(&user).unwrap();
    let response = authenticator.make_credential(&options, "https://evil.example.org");
    let err = rp.finish_registration(&user, &response).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OriginMismatch);

    let options = rp.start_registration(&user).unwrap();
    let mut response = authenticator.make_credential(&options, TestFixtures::ORIGIN);
    response.response.client_data_json = Base64Url::new(SoftAuthenticator::client_data_json(
        "webauthn.get",
        options.challenge.as_slice(),
        TestFixtures::ORIGIN,
    ));
    let err = rp.finish_registration(&user, &response).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OriginMismatch);
}

#[test]
fn test_user_verification_required() {
    let mut settings = TestFixtures::settings();
    settings.user_verification = UserVerificationRequirement::Required;
    let rp = TestFixtures::relying_party_with(settings);
    let user = TestFixtures::user("alice", "Alice A");
    let mut authenticator =
        SoftAuthenticator::new(CoseAlgorithm::ES256).with_user_verification(false);

    let options = rp.start_registration(&user).unwrap();
    let response = authenticator.make_credential(&options, TestFixtures::ORIGIN);
    let err = rp.finish_registration(&user, &response).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AttestationVerificationFailed);
}

#[test]
fn test_disallowed_algorithm() {
    let mut settings = TestFixtures::settings();
    settings.algorithms = vec![CoseAlgorithm::ES256];
    let rp = TestFixtures::relying_party_with(settings);
    let user = TestFixtures::user("alice", "Alice A");
    let mut authenticator = SoftAuthenticator::new(CoseAlgorithm::EdDSA);

    let options = rp.start_registration(&user).unwrap();
    assert_eq!(options.pub_key_cred_params.len(), 1);
    let response = authenticator.make_credential(&options, TestFixtures::ORIGIN);
    let err = rp.finish_registration(&user, &response).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedKeyType);
}

#[test]
fn test_raw_id_must_match_attested_credential() {
    let rp = TestFixtures::relying_party();
    let user = TestFixtures::user("alice", "Alice A");
    let mut authenticator = SoftAuthenticator::new(CoseAlgorithm::ES256);

    let options = rp.start_registration(&user).unwrap();
    let mut response = authenticator.make_credential(&options, TestFixtures::ORIGIN);
    response.raw_id = Base64Url::new(vec![0xaa; 16]);
    response.id = response.raw_id.encode();
    let err = rp.finish_registration(&user, &response).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AttestationVerificationFailed);
}

#[test]
fn test_credential_envelope_must_be_consistent() {
    let rp = TestFixtures::relying_party();
    let user = TestFixtures::user("alice", "Alice A");
    let mut authenticator = SoftAuthenticator::new(CoseAlgorithm::ES256);

    let options = rp.start_registration(&user).unwrap();
    let mut response = authenticator.make_credential(&options, TestFixtures::ORIGIN);
    response.id = Base64Url::new(vec![0xbb; 32]).encode();
    let err = rp.finish_registration(&user, &response).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedAttestation);
    assert_eq!(
        rp.ceremony_state(&ChallengeKey::registration("alice")),
        CeremonyState::Failed
    );

    let options = rp.start_registration(&user).unwrap();
    let mut response = authenticator.make_credential(&options, TestFixtures::ORIGIN);
    response.r#type = "password".to_string();
    let err = rp.finish_registration(&user, &response).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedAttestation);

    // Padded id is the same credential
    let options = rp.start_registration(&user).unwrap();
    let mut response = authenticator.make_credential(&options, TestFixtures::ORIGIN);
    response.id.push('=');
    assert!(rp.finish_registration(&user, &response).is_ok());
}

#[test]
fn test_duplicate_user_and_additional_authenticator() {
    let rp = TestFixtures::relying_party();
    let mut first = SoftAuthenticator::new(CoseAlgorithm::ES256);
    let (user, credential) = TestFixtures::register(&rp, "alice", &mut first);

    let err = rp.start_registration(&user).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DuplicateUser);

    // Adding a second authenticator excludes the existing one
    let options = rp.start_additional_registration(&user).unwrap();
    assert_eq!(options.exclude_credentials.len(), 1);
    assert_eq!(options.exclude_credentials[0].id, credential.credential_id);

    let mut second = SoftAuthenticator::new(CoseAlgorithm::EdDSA);
    let response = second.make_credential(&options, TestFixtures::ORIGIN);
    let added = rp.finish_registration(&user, &response).unwrap();
    rp.credentials().save(added).unwrap();
    assert_eq!(rp.credentials().find_by_user(&user).unwrap().len(), 2);

    // The same authenticator cannot be registered twice
    let options = rp.start_additional_registration(&user).unwrap();
    let response = first.make_credential(&options, TestFixtures::ORIGIN);
    let err = rp.finish_registration(&user, &response).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CredentialAlreadyRegistered);
}

#[test]
fn test_concurrent_registrations_for_distinct_users() {
    let rp = Arc::new(TestFixtures::relying_party());

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let rp = Arc::clone(&rp);
            std::thread::spawn(move || {
                let user = TestFixtures::user(&format!("user{i}"), "Concurrent User");
                let mut authenticator = SoftAuthenticator::new(CoseAlgorithm::ES256);
                let options = rp.start_registration(&user).unwrap();
                let response = authenticator.make_credential(&options, TestFixtures::ORIGIN);
                rp.finish_registration(&user, &response).is_ok()
            })
        })
        .collect();

    for handle in handles {
        assert!(handle.join().unwrap());
    }
}
