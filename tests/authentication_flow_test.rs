// Integration tests for the assertion ceremony
use std::sync::Arc;

use webauthn_rp::testing::{SoftAuthenticator, TestFixtures};
use webauthn_rp::webauthn::{
    AssertionFailure, Base64Url, CeremonyState, ChallengeKey, CoseAlgorithm, CounterPolicy,
    ErrorKind, InMemoryChallengeStore, InMemoryCredentialRepository, InMemoryUserRepository,
    RelyingParty, RepositoryError, UserVerificationRequirement, WebAuthnError,
};

#[test]
fn test_login_with_each_algorithm() {
    for alg in [CoseAlgorithm::ES256, CoseAlgorithm::EdDSA, CoseAlgorithm::RS256] {
        let rp = TestFixtures::relying_party();
        let mut authenticator = SoftAuthenticator::new(alg);
        let (user, credential) = TestFixtures::register(&rp, "alice", &mut authenticator);

        let options = rp.start_authentication(Some("alice")).unwrap();
        assert_eq!(options.rp_id, "example.com");
        assert_eq!(options.allow_credentials[0].id, credential.credential_id);

        let response = authenticator.get_assertion(&options, TestFixtures::ORIGIN);
        let outcome = rp
            .finish_authentication(Some("alice"), &response)
            .unwrap_or_else(|e| panic!("{alg:?} login failed: {e}"));

        assert_eq!(outcome.user_handle, user.id);
        assert_eq!(outcome.credential_id, credential.credential_id);
        assert_eq!(outcome.counter, 1);
        assert!(outcome.user_verified);
        assert_eq!(
            rp.ceremony_state(&ChallengeKey::authentication("alice")),
            CeremonyState::Completed
        );
    }
}

#[test]
fn test_assertion_challenge_is_single_use() {
    let rp = TestFixtures::relying_party();
    let mut authenticator = SoftAuthenticator::new(CoseAlgorithm::ES256);
    TestFixtures::register(&rp, "alice", &mut authenticator);

    let options = rp.start_authentication(Some("alice")).unwrap();
    let response = authenticator.get_assertion(&options, TestFixtures::ORIGIN);
    assert!(rp.finish_authentication(Some("alice"), &response).is_ok());

    let err = rp.finish_authentication(Some("alice"), &response).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ChallengeInvalid);
}

#[test]
fn test_create_type_rejected_at_login() {
    let rp = TestFixtures::relying_party();
    let mut authenticator = SoftAuthenticator::new(CoseAlgorithm::ES256);
    TestFixtures::register(&rp, "alice", &mut authenticator);

    let options = rp.start_authentication(Some("alice")).unwrap();
    let response =
        authenticator.assertion_with_type(&options, TestFixtures::ORIGIN, "webauthn.create");

    let err = rp.finish_authentication(Some("alice"), &response).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OriginMismatch);
    assert_eq!(
        rp.ceremony_state(&ChallengeKey::authentication("alice")),
        CeremonyState::Failed
    );
}

#[test]
fn test_counter_regression_rejected() {
    let rp = TestFixtures::relying_party();
    let mut authenticator = SoftAuthenticator::new(CoseAlgorithm::ES256).with_counter(10);
    let (_, credential) = TestFixtures::register(&rp, "alice", &mut authenticator);
    assert_eq!(credential.counter, 10);

    // Cloned authenticator presenting an older counter with a valid signature
    authenticator.set_counter(4);
    let options = rp.start_authentication(Some("alice")).unwrap();
    let response = authenticator.get_assertion(&options, TestFixtures::ORIGIN);

    let err = rp.finish_authentication(Some("alice"), &response).unwrap_err();
    assert_eq!(
        err.assertion_failure(),
        Some(AssertionFailure::CounterRegression {
            stored: 10,
            presented: 5
        })
    );
    let stored = rp
        .credentials()
        .find_by_credential_id(credential.credential_id.as_slice())
        .unwrap()
        .unwrap();
    assert_eq!(stored.counter, 10);
}

#[test]
fn test_counter_regression_warn_policy() {
    let mut settings = TestFixtures::settings();
    settings.counter_policy = CounterPolicy::Warn;
    let rp = TestFixtures::relying_party_with(settings);
    let mut authenticator = SoftAuthenticator::new(CoseAlgorithm::ES256).with_counter(10);
    TestFixtures::register(&rp, "alice", &mut authenticator);

    authenticator.set_counter(2);
    let options = rp.start_authentication(Some("alice")).unwrap();
    let response = authenticator.get_assertion(&options, TestFixtures::ORIGIN);

    let outcome = rp.finish_authentication(Some("alice"), &response).unwrap();
    assert!(outcome.counter_regressed);
    assert_eq!(outcome.counter, 10);
}

#[test]
fn test_zero_counter_authenticators() {
    let rp = TestFixtures::relying_party();
    let mut authenticator = SoftAuthenticator::new(CoseAlgorithm::ES256).with_fixed_counter();
    TestFixtures::register(&rp, "alice", &mut authenticator);

    for _ in 0..2 {
        let options = rp.start_authentication(Some("alice")).unwrap();
        let response = authenticator.get_assertion(&options, TestFixtures::ORIGIN);
        let outcome = rp.finish_authentication(Some("alice"), &response).unwrap();
        assert_eq!(outcome.counter, 0);
        assert!(!outcome.counter_regressed);
    }

    let mut settings = TestFixtures::settings();
    settings.allow_zero_counter = false;
    let strict = TestFixtures::relying_party_with(settings);
    let mut authenticator = SoftAuthenticator::new(CoseAlgorithm::ES256).with_fixed_counter();
    TestFixtures::register(&strict, "bob", &mut authenticator);

    let options = strict.start_authentication(Some("bob")).unwrap();
    let response = authenticator.get_assertion(&options, TestFixtures::ORIGIN);
    let err = strict.finish_authentication(Some("bob"), &response).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AssertionFailed);
}

#[test]
fn test_tampered_signature() {
    let rp = TestFixtures::relying_party();
    let mut authenticator = SoftAuthenticator::new(CoseAlgorithm::EdDSA);
    TestFixtures::register(&rp, "alice", &mut authenticator);

    let options = rp.start_authentication(Some("alice")).unwrap();
    let mut response = authenticator.get_assertion(&options, TestFixtures::ORIGIN);
    let mut signature = response.response.signature.into_inner();
    signature[0] ^= 0xff;
    response.response.signature = Base64Url::new(signature);

    let err = rp.finish_authentication(Some("alice"), &response).unwrap_err();
    assert_eq!(
        err.assertion_failure(),
        Some(AssertionFailure::SignatureMismatch)
    );
}

#[test]
fn test_credential_of_another_user() {
    let rp = TestFixtures::relying_party();
    let mut alice_key = SoftAuthenticator::new(CoseAlgorithm::ES256);
    let mut bob_key = SoftAuthenticator::new(CoseAlgorithm::ES256);
    TestFixtures::register(&rp, "alice", &mut alice_key);
    TestFixtures::register(&rp, "bob", &mut bob_key);

    let options = rp.start_authentication(Some("alice")).unwrap();
    let response = bob_key.get_assertion(&options, TestFixtures::ORIGIN);

    let err = rp.finish_authentication(Some("alice"), &response).unwrap_err();
    assert_eq!(
        err.assertion_failure(),
        Some(AssertionFailure::CredentialNotAllowed)
    );
}

#[test]
fn test_unknown_credential() {
    let rp = TestFixtures::relying_party();
    let mut authenticator = SoftAuthenticator::new(CoseAlgorithm::ES256);
    TestFixtures::register(&rp, "alice", &mut authenticator);

    let options = rp.start_authentication(Some("alice")).unwrap();
    let mut stranger = SoftAuthenticator::new(CoseAlgorithm::ES256);
    let response = stranger.get_assertion(&options, TestFixtures::ORIGIN);

    let err = rp.finish_authentication(Some("alice"), &response).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownCredential);
}

#[test]
fn test_user_verification_required_at_login() {
    let mut settings = TestFixtures::settings();
    settings.user_verification = UserVerificationRequirement::Required;
    let rp = TestFixtures::relying_party_with(settings);
    let mut authenticator = SoftAuthenticator::new(CoseAlgorithm::ES256);
    TestFixtures::register(&rp, "alice", &mut authenticator);

    let mut authenticator = authenticator.with_user_verification(false);
    let options = rp.start_authentication(Some("alice")).unwrap();
    let response = authenticator.get_assertion(&options, TestFixtures::ORIGIN);

    let err = rp.finish_authentication(Some("alice"), &response).unwrap_err();
    assert_eq!(
        err.assertion_failure(),
        Some(AssertionFailure::UserNotVerified)
    );
}

#[test]
fn test_rp_id_mismatch() {
    let rp = TestFixtures::relying_party();
    let mut authenticator = SoftAuthenticator::new(CoseAlgorithm::ES256);
    TestFixtures::register(&rp, "alice", &mut authenticator);

    let mut options = rp.start_authentication(Some("alice")).unwrap();
    options.rp_id = "login.example.com".to_string();
    let response = authenticator.get_assertion(&options, TestFixtures::ORIGIN);

    let err = rp.finish_authentication(Some("alice"), &response).unwrap_err();
    assert_eq!(err.assertion_failure(), Some(AssertionFailure::RpIdMismatch));
}

#[test]
fn test_discoverable_login() {
    let rp = TestFixtures::relying_party();
    let mut authenticator = SoftAuthenticator::new(CoseAlgorithm::ES256);
    let (user, _) = TestFixtures::register(&rp, "alice", &mut authenticator);

    let options = rp.start_authentication(None).unwrap();
    assert!(options.allow_credentials.is_empty());
    let response = authenticator.get_assertion(&options, TestFixtures::ORIGIN);
    let outcome = rp.finish_authentication(None, &response).unwrap();
    assert_eq!(outcome.user_handle, user.id);

    // The user handle is mandatory without a username
    let options = rp.start_authentication(None).unwrap();
    let mut response = authenticator.get_assertion(&options, TestFixtures::ORIGIN);
    response.response.user_handle = None;
    let err = rp.finish_authentication(None, &response).unwrap_err();
    assert_eq!(
        err.assertion_failure(),
        Some(AssertionFailure::UserHandleMismatch)
    );
}

#[test]
fn test_unknown_user_cannot_log_in() {
    let rp = TestFixtures::relying_party();
    let err = rp.start_authentication(Some("mallory")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UserNotFound);
}

#[test]
fn test_concurrent_finishes_single_winner() {
    let rp = Arc::new(TestFixtures::relying_party());
    let mut authenticator = SoftAuthenticator::new(CoseAlgorithm::ES256);
    TestFixtures::register(&rp, "alice", &mut authenticator);

    let options = rp.start_authentication(Some("alice")).unwrap();
    let response = Arc::new(authenticator.get_assertion(&options, TestFixtures::ORIGIN));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let rp = Arc::clone(&rp);
            let response = Arc::clone(&response);
            std::thread::spawn(move || rp.finish_authentication(Some("alice"), &response))
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert_eq!(err.kind(), ErrorKind::ChallengeInvalid);
    }
}

#[test]
fn test_concurrent_logins_for_distinct_users() {
    let rp = Arc::new(TestFixtures::relying_party());
    let mut authenticators = Vec::new();
    for i in 0..8 {
        let mut authenticator = SoftAuthenticator::new(CoseAlgorithm::ES256);
        TestFixtures::register(&rp, &format!("user{i}"), &mut authenticator);
        authenticators.push(authenticator);
    }

    let handles: Vec<_> = authenticators
        .into_iter()
        .enumerate()
        .map(|(i, mut authenticator)| {
            let rp = Arc::clone(&rp);
            std::thread::spawn(move || {
                let name = format!("user{i}");
                let options = rp.start_authentication(Some(&name)).unwrap();
                let response = authenticator.get_assertion(&options, TestFixtures::ORIGIN);
                rp.finish_authentication(Some(&name), &response).is_ok()
            })
        })
        .collect();

    for handle in handles {
        assert!(handle.join().unwrap());
    }
}

#[test]
fn test_interleaved_logins_keep_counter_monotonic() {
    let rp = TestFixtures::relying_party();
    let mut authenticator = SoftAuthenticator::new(CoseAlgorithm::ES256);
    let (_, credential) = TestFixtures::register(&rp, "alice", &mut authenticator);

    let first_options = rp.start_authentication(None).unwrap();
    let second_options = rp.start_authentication(None).unwrap();
    let first = authenticator.get_assertion(&first_options, TestFixtures::ORIGIN);
    let second = authenticator.get_assertion(&second_options, TestFixtures::ORIGIN);

    // Both verify against the same stored counter before either is saved
    let first = rp.finish_authentication(None, &first).unwrap();
    let second = rp.finish_authentication(None, &second).unwrap();
    assert_eq!((first.counter, second.counter), (1, 2));
    assert_eq!((first.previous_counter, second.previous_counter), (0, 0));

    let credentials = rp.credentials();
    credentials
        .update_counter(
            second.credential_id.as_slice(),
            second.previous_counter,
            second.counter,
            second.authenticated_at,
        )
        .unwrap();
    let err = credentials
        .update_counter(
            first.credential_id.as_slice(),
            first.previous_counter,
            first.counter,
            first.authenticated_at,
        )
        .unwrap_err();
    assert!(matches!(
        err,
        RepositoryError::CounterConflict {
            stored: 2,
            presented: 1
        }
    ));
    assert_eq!(
        WebAuthnError::from(err).assertion_failure(),
        Some(AssertionFailure::CounterRegression {
            stored: 2,
            presented: 1
        })
    );

    let stored = credentials
        .find_by_credential_id(credential.credential_id.as_slice())
        .unwrap()
        .unwrap();
    assert_eq!(stored.counter, 2);
}

#[test]
fn test_credential_envelope_checked_at_login() {
    let rp = TestFixtures::relying_party();
    let mut authenticator = SoftAuthenticator::new(CoseAlgorithm::ES256);
    TestFixtures::register(&rp, "alice", &mut authenticator);

    let options = rp.start_authentication(Some("alice")).unwrap();
    let mut response = authenticator.get_assertion(&options, TestFixtures::ORIGIN);
    response.r#type = "password".to_string();
    let err = rp.finish_authentication(Some("alice"), &response).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedAuthenticatorData);
    assert_eq!(
        rp.ceremony_state(&ChallengeKey::authentication("alice")),
        CeremonyState::Failed
    );

    let options = rp.start_authentication(Some("alice")).unwrap();
    let mut response = authenticator.get_assertion(&options, TestFixtures::ORIGIN);
    response.id = Base64Url::new(vec![0xcc; 32]).encode();
    let err = rp.finish_authentication(Some("alice"), &response).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedAuthenticatorData);
}

#[test]
fn test_abandoned_discoverable_logins_are_reclaimed() {
    let challenges = Arc::new(
        InMemoryChallengeStore::with_ttl(chrono::Duration::zero()).with_sweep_threshold(16),
    );
    let rp = RelyingParty::new(
        TestFixtures::settings(),
        challenges.clone(),
        Arc::new(InMemoryUserRepository::new()),
        Arc::new(InMemoryCredentialRepository::new()),
    )
    .unwrap();

    for _ in 0..200 {
        rp.start_authentication(None).unwrap();
    }
    assert!(challenges.len() <= 16);
}
