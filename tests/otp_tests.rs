//! Tests for OTP validation, verification and first-user registration.

mod support;

use safe_controller::otp::{self, OtpError, OtpVerifier, VERIFY_TIMEOUT_MS};
use safe_controller::schema::{LogEvent, Role};
use safe_controller::sync_queue::SyncQueue;
use support::{events, uid, verify_all, FakeStore};

fn code(text: &str) -> otp::OtpCode {
    otp::validate_format(text).unwrap()
}

// ============================================================================
// Tests for validate_format
// ============================================================================

#[test]
fn test_validate_splits_tag_and_payload() {
    let c = code("A1234");
    assert_eq!(c.tag, 'A');
    assert_eq!(c.payload.as_str(), "1234");
}

#[test]
fn test_validate_rejects_wrong_length() {
    assert_eq!(otp::validate_format("A123"), Err(OtpError::Format));
    assert_eq!(otp::validate_format("A12345"), Err(OtpError::Format));
    assert_eq!(otp::validate_format(""), Err(OtpError::Format));
}

#[test]
fn test_validate_rejects_bad_tag() {
    assert_eq!(otp::validate_format("#1234"), Err(OtpError::Format));
    assert_eq!(otp::validate_format(" 1234"), Err(OtpError::Format));
}

#[test]
fn test_validate_custom_length() {
    let c = otp::validate_format_len("Z9", 2).unwrap();
    assert_eq!(c.tag, 'Z');
    assert_eq!(c.payload.as_str(), "9");
    // Below the minimum regardless of the configured length
    assert_eq!(otp::validate_format_len("Z", 1), Err(OtpError::Format));
}

// ============================================================================
// Tests for verify
// ============================================================================

#[test]
fn test_verify_registered_user() {
    let mut store = FakeStore::online()
        .with_user('A', "user-one", "1234")
        .with_registered('A', "user-one");
    let mut log = SyncQueue::new();

    let v = verify_all(&mut store, true, &code("A1234"), 0, &mut log).unwrap();
    assert_eq!(v.user.as_str(), "user-one");
    assert_eq!(v.role, Role::User);
    assert!(!v.first_user);
    assert_eq!(store.roles.get("user-one"), Some(&Role::User));
    assert_eq!(
        events(&log),
        vec![LogEvent::OtpVerified {
            user: uid("user-one"),
            role: Role::User
        }]
    );
}

#[test]
fn test_verify_replay_is_rejected() {
    let mut store = FakeStore::online()
        .with_user('A', "user-one", "1234")
        .with_registered('A', "user-one");
    let mut log = SyncQueue::new();

    assert!(verify_all(&mut store, true, &code("A1234"), 0, &mut log).is_ok());
    assert!(!store.codes.contains_key("user-one"));

    let replay = verify_all(&mut store, true, &code("A1234"), 100, &mut log);
    assert_eq!(replay, Err(OtpError::NotFound));
    assert_eq!(
        events(&log).last(),
        Some(&LogEvent::OtpVerificationFailed { tag: 'A' })
    );
}

#[test]
fn test_verify_stored_code_with_tag_prefix() {
    let mut store = FakeStore::online()
        .with_user('A', "user-one", "A1234")
        .with_registered('A', "user-one");
    let mut log = SyncQueue::new();
    assert!(verify_all(&mut store, true, &code("A1234"), 0, &mut log).is_ok());
}

#[test]
fn test_verify_mismatch_leaves_stored_code() {
    let mut store = FakeStore::online()
        .with_user('A', "user-one", "1234")
        .with_registered('A', "user-one");
    let mut log = SyncQueue::new();

    let result = verify_all(&mut store, true, &code("A9999"), 0, &mut log);
    assert_eq!(result, Err(OtpError::Mismatch));
    assert_eq!(store.codes.get("user-one").map(String::as_str), Some("1234"));
    assert_eq!(events(&log), vec![LogEvent::OtpVerificationFailed { tag: 'A' }]);
}

#[test]
fn test_verify_unknown_tag() {
    let mut store = FakeStore::online();
    let mut log = SyncQueue::new();
    let result = verify_all(&mut store, true, &code("Q1234"), 0, &mut log);
    assert_eq!(result, Err(OtpError::NotFound));
    assert_eq!(events(&log), vec![LogEvent::OtpVerificationFailed { tag: 'Q' }]);
}

#[test]
fn test_first_user_becomes_admin() {
    let mut store = FakeStore::online().with_user('A', "owner", "1234");
    let mut log = SyncQueue::new();

    let v = verify_all(&mut store, true, &code("A1234"), 0, &mut log).unwrap();
    assert!(v.first_user);
    assert_eq!(v.role, Role::Admin);
    assert_eq!(store.registered.get(&'A').map(String::as_str), Some("owner"));
    assert_eq!(store.roles.get("owner"), Some(&Role::Admin));
    assert!(!store.codes.contains_key("owner"));
}

#[test]
fn test_first_user_is_admin_despite_stale_role() {
    let mut store = FakeStore::online().with_user('A', "owner", "1234");
    store.roles.insert("owner".to_string(), Role::User);
    let mut log = SyncQueue::new();

    let v = verify_all(&mut store, true, &code("A1234"), 0, &mut log).unwrap();
    assert!(v.first_user);
    assert_eq!(v.role, Role::Admin);
    assert_eq!(store.roles.get("owner"), Some(&Role::Admin));
}

#[test]
fn test_second_unregistered_tag_is_rejected() {
    let mut store = FakeStore::online()
        .with_user('A', "owner", "1234")
        .with_user('B', "guest", "5678");
    let mut log = SyncQueue::new();

    assert!(verify_all(&mut store, true, &code("A1234"), 0, &mut log).unwrap().first_user);

    let result = verify_all(&mut store, true, &code("B5678"), 10, &mut log);
    assert_eq!(result, Err(OtpError::Unregistered));
    assert!(!store.registered.contains_key(&'B'));
    assert_eq!(store.codes.get("guest").map(String::as_str), Some("5678"));
    assert_eq!(
        events(&log).last(),
        Some(&LogEvent::UnauthorizedUserAttempt {
            tag: 'B',
            user: uid("guest")
        })
    );
}

#[test]
fn test_tag_registered_to_other_user_is_rejected() {
    let mut store = FakeStore::online()
        .with_user('A', "impostor", "1234")
        .with_registered('A', "owner");
    let mut log = SyncQueue::new();
    let result = verify_all(&mut store, true, &code("A1234"), 0, &mut log);
    assert_eq!(result, Err(OtpError::Unregistered));
}

#[test]
fn test_existing_role_is_kept() {
    let mut store = FakeStore::online()
        .with_user('A', "owner", "1234")
        .with_registered('A', "owner");
    store.roles.insert("owner".to_string(), Role::Admin);
    let mut log = SyncQueue::new();

    let v = verify_all(&mut store, true, &code("A1234"), 0, &mut log).unwrap();
    assert_eq!(v.role, Role::Admin);
}

#[test]
fn test_first_user_registration_failure() {
    let mut store = FakeStore::online().with_user('A', "owner", "1234");
    store.fail_register = true;
    let mut log = SyncQueue::new();

    let result = verify_all(&mut store, true, &code("A1234"), 0, &mut log);
    assert!(matches!(result, Err(OtpError::Store(_))));
    assert!(store.codes.contains_key("owner"));
    assert_eq!(
        events(&log)[0],
        LogEvent::FirstUserRegistrationFailed { user: uid("owner") }
    );
}

#[test]
fn test_verify_not_ready() {
    let mut store = FakeStore::online().with_user('A', "owner", "1234");
    let mut log = SyncQueue::new();
    let result = verify_all(&mut store, false, &code("A1234"), 0, &mut log);
    assert_eq!(result, Err(OtpError::Unavailable));
    assert_eq!(events(&log), vec![LogEvent::UserVerificationFailed { tag: 'A' }]);
    assert!(store.codes.contains_key("owner"));
}

// ============================================================================
// Tests for OtpVerifier
// ============================================================================

#[test]
fn test_verifier_one_at_a_time() {
    let mut verifier = OtpVerifier::new();
    assert!(verifier.begin(code("A1234"), 0));
    assert!(verifier.is_busy());
    assert!(!verifier.begin(code("B5678"), 0));
}

#[test]
fn test_verifier_advances_one_call_per_step() {
    let mut store = FakeStore::online()
        .with_user('A', "owner", "1234")
        .with_registered('A', "owner");
    let mut log = SyncQueue::new();
    let mut verifier = OtpVerifier::new();
    verifier.begin(code("A1234"), 0);

    let mut steps = 0;
    let result = loop {
        steps += 1;
        if let Some(r) = verifier.step(steps, &mut store, true, &mut log) {
            break r;
        }
    };
    assert!(result.is_ok());
    // lookup, fetch, registry, consume, role, assign
    assert_eq!(steps, 6);
    assert!(!verifier.is_busy());
}

#[test]
fn test_verifier_times_out() {
    let mut store = FakeStore::online().with_user('A', "owner", "1234");
    let mut log = SyncQueue::new();
    let mut verifier = OtpVerifier::new();
    verifier.begin(code("A1234"), 0);

    assert_eq!(verifier.step(1, &mut store, true, &mut log), None);
    let result = verifier.step(VERIFY_TIMEOUT_MS + 1, &mut store, true, &mut log);
    assert_eq!(result, Some(Err(OtpError::Timeout)));
    assert!(!verifier.is_busy());
}
