mod common;

use common::*;
use krin::auth::{otp, token, LoginStep, MfaInput};
use krin::error::ServerError;

fn expect_session(step: LoginStep) -> (krin::db::UserRecord, String) {
    match step {
        LoginStep::Session { user, token } => (user, token),
        _ => panic!("expected a session"),
    }
}

#[test]
fn login_round_trip_and_logout() {
    let (_dir, db) = test_db();
    let auth = auth_service(db.clone());
    let alice = new_account(&auth, "alice@example.com", "secret");

    let step = auth
        .login_begin("alice@example.com", "secret", &MfaInput::default(), "host")
        .unwrap();
    let (user, tok) = expect_session(step);
    assert_eq!(user.user_id, alice.user_id);

    let checked = auth.check_session(&tok).unwrap();
    assert_eq!(checked.user_id, alice.user_id);

    auth.logout(alice.user_id, &tok).unwrap();
    assert!(matches!(
        auth.check_session(&tok),
        Err(ServerError::InvalidCredentials)
    ));
}

#[test]
fn wrong_password_is_rejected() {
    let (_dir, db) = test_db();
    let auth = auth_service(db.clone());
    new_account(&auth, "alice@example.com", "secret");

    assert!(matches!(
        auth.login_begin("alice@example.com", "wrong", &MfaInput::default(), "host"),
        Err(ServerError::InvalidCredentials)
    ));
    assert!(matches!(
        auth.login_begin("nobody@example.com", "secret", &MfaInput::default(), "host"),
        Err(ServerError::InvalidCredentials)
    ));
}

#[test]
fn pre_login_fakes_unknown_accounts() {
    let (_dir, db) = test_db();
    let auth = auth_service(db.clone());
    new_account(&auth, "alice@example.com", "secret");

    assert_eq!(auth.pre_login("alice@example.com").unwrap(), "0011");

    // Unknown emails get a stable fake salt.
    let fake = auth.pre_login("ghost@example.com").unwrap();
    assert_eq!(fake.len(), 32);
    assert_eq!(auth.pre_login("ghost@example.com").unwrap(), fake);
    assert_ne!(auth.pre_login("other@example.com").unwrap(), fake);
}

// Enable OTP, then log in with `code%email`; a stale code fails.
#[test]
fn otp_login() {
    let (_dir, db) = test_db();
    let auth = auth_service(db.clone());
    let alice = new_account(&auth, "alice@example.com", "secret");

    db.set_time_for_testing(Some(1_700_000_000_000));
    let secret = otp::new_secret();
    let code = otp::totp(&secret, 1_700_000_000).unwrap();
    auth.set_otp(alice.user_id, &secret, &code).unwrap();
    auth.set_require_mfa(alice.user_id, true).unwrap();

    let email = format!("{}%alice@example.com", code);
    let step = auth
        .login_begin(&email, "secret", &MfaInput::default(), "host")
        .unwrap();
    expect_session(step);

    // Ten minutes later the same code is stale.
    db.set_time_for_testing(Some(1_700_000_600_000));
    let err = auth
        .login_begin(&email, "secret", &MfaInput::default(), "host")
        .unwrap_err();
    assert!(matches!(err, ServerError::InvalidCredentials));
}

#[test]
fn set_otp_requires_a_valid_code() {
    let (_dir, db) = test_db();
    let auth = auth_service(db.clone());
    let alice = new_account(&auth, "alice@example.com", "secret");

    db.set_time_for_testing(Some(1_700_000_000_000));
    let secret = otp::new_secret();
    assert!(matches!(
        auth.set_otp(alice.user_id, &secret, "000000"),
        Err(ServerError::InvalidCredentials)
    ));

    let code = otp::totp(&secret, 1_700_000_000).unwrap();
    auth.set_otp(alice.user_id, &secret, &code).unwrap();
    assert_eq!(
        db.user_by_id(alice.user_id).unwrap().unwrap().otp_key,
        secret
    );
}

#[test]
fn mfa_requires_a_registered_factor() {
    let (_dir, db) = test_db();
    let auth = auth_service(db.clone());
    let alice = new_account(&auth, "alice@example.com", "secret");

    assert!(matches!(
        auth.set_require_mfa(alice.user_id, true),
        Err(ServerError::Denied(_))
    ));

    db.set_time_for_testing(Some(1_700_000_000_000));
    let secret = otp::new_secret();
    let code = otp::totp(&secret, 1_700_000_000).unwrap();
    auth.set_otp(alice.user_id, &secret, &code).unwrap();
    auth.set_require_mfa(alice.user_id, true).unwrap();

    // The last factor cannot be removed while MFA is required.
    assert!(matches!(
        auth.set_otp(alice.user_id, "", ""),
        Err(ServerError::Denied(_))
    ));
}

// A password matching a decoy logs into the decoy, not the primary; the
// same applies after a primary MFA failure.
#[test]
fn decoy_logins() {
    let (_dir, db) = test_db();
    let auth = auth_service(db.clone());
    let primary = new_account(&auth, "alice@example.com", "real-pw");
    let shadow = new_account(&auth, "shadow@example.com", "decoy-pw");

    db.mutate_user(shadow.user_id, |u| {
        u.login_disabled = true;
        Ok(())
    })
    .unwrap();
    db.mutate_user(primary.user_id, |u| {
        u.decoys.push(krin::db::Decoy {
            user_id: shadow.user_id,
            encrypted_password: "client-blob".to_string(),
        });
        Ok(())
    })
    .unwrap();

    // Decoy password on the primary's email yields a decoy session.
    let step = auth
        .login_begin("alice@example.com", "decoy-pw", &MfaInput::default(), "host")
        .unwrap();
    let (user, _) = expect_session(step);
    assert_eq!(user.user_id, shadow.user_id);

    // The disabled shadow account cannot be logged into directly.
    assert!(auth
        .login_begin("shadow@example.com", "decoy-pw", &MfaInput::default(), "host")
        .is_err());

    // Primary MFA failure with the decoy's password still lands on the
    // decoy.
    db.set_time_for_testing(Some(1_700_000_000_000));
    let secret = otp::new_secret();
    let code = otp::totp(&secret, 1_700_000_000).unwrap();
    auth.set_otp(primary.user_id, &secret, &code).unwrap();
    auth.set_require_mfa(primary.user_id, true).unwrap();

    let email = "999999%alice@example.com".to_string();
    let err = auth.login_begin(&email, "real-pw", &MfaInput::default(), "host");
    assert!(err.is_err());
    let step = auth
        .login_begin(&email, "decoy-pw", &MfaInput::default(), "host")
        .unwrap();
    let (user, _) = expect_session(step);
    assert_eq!(user.user_id, shadow.user_id);
}

// Change password rotates the token key: the old session dies, the new
// one is the only survivor.
#[test]
fn change_password_collapses_sessions() {
    let (_dir, db) = test_db();
    let auth = auth_service(db.clone());
    let alice = new_account(&auth, "alice@example.com", "old-pw");

    let (_, tok1) = expect_session(
        auth.login_begin("alice@example.com", "old-pw", &MfaInput::default(), "host")
            .unwrap(),
    );
    let (_, tok2) = expect_session(
        auth.login_begin("alice@example.com", "old-pw", &MfaInput::default(), "host")
            .unwrap(),
    );
    assert_eq!(
        db.user_by_id(alice.user_id).unwrap().unwrap().valid_tokens.len(),
        2
    );

    let new_tok = auth
        .change_password(alice.user_id, "new-pw", "salt2", &key_bundle())
        .unwrap();

    assert!(auth.check_session(&tok1).is_err());
    assert!(auth.check_session(&tok2).is_err());
    assert!(auth.check_session(&new_tok).is_ok());
    assert_eq!(
        db.user_by_id(alice.user_id).unwrap().unwrap().valid_tokens.len(),
        1
    );

    expect_session(
        auth.login_begin("alice@example.com", "new-pw", &MfaInput::default(), "host")
            .unwrap(),
    );
}

// checkKey/recoverAccount: decrypting the sealed challenge proves key
// ownership and resets the password.
#[test]
fn account_recovery_round_trip() {
    use krin::crypto::envelope;

    let (_dir, db) = test_db();
    let auth = auth_service(db.clone());

    // The test plays the client: it keeps the secret key of the bundle.
    let client_keys = envelope::KeyPair::generate();
    let bundle = base64::encode(client_keys.public());
    let user = auth
        .create_account(&wire::CreateAccountParams {
            email: "alice@example.com".into(),
            password: "pw".into(),
            salt: "ab".into(),
            key_bundle: bundle.clone().into(),
        })
        .unwrap();

    let challenge = auth.check_key("alice@example.com").unwrap();
    let sealed = base64::decode(&challenge).unwrap();
    let secret = envelope::open(&sealed, &client_keys).unwrap();

    let tok = auth
        .recover_account(
            "alice@example.com",
            &base64::encode(&secret),
            "new-pw",
            "salt2",
            &bundle,
        )
        .unwrap();
    assert_eq!(auth.check_session(&tok).unwrap().user_id, user.user_id);

    // The challenge is single use.
    assert!(auth
        .recover_account(
            "alice@example.com",
            &base64::encode(&secret),
            "other",
            "s",
            &bundle,
        )
        .is_err());
}

#[test]
fn download_tokens_are_scoped() {
    let (_dir, db) = test_db();
    let auth = auth_service(db.clone());
    let alice = new_account(&auth, "alice@example.com", "pw");

    let key = alice.unwrapped_token_key(db.master()).unwrap();
    let now = db.now_ms();
    let dl = token::mint(&key, &token::Token::download(alice.user_id, "0", "f", false, now));

    let (user, tok) = auth.check_download(&dl).unwrap();
    assert_eq!(user.user_id, alice.user_id);
    assert_eq!(tok.file.as_deref(), Some("f"));

    // A download token is not a session.
    assert!(auth.check_session(&dl).is_err());
}
