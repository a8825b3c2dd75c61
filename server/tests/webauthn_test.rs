//! Drives the WebAuthn registration and assertion flows with a software
//! ES256 authenticator built on ring.

mod common;

use ciborium::value::Value;
use common::*;
use krin::auth::{webauthn, LoginStep, MfaInput};
use krin::error::ServerError;
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, ECDSA_P256_SHA256_ASN1_SIGNING};
use sha2::{Digest, Sha256};

const RP_ID: &str = "photos.example.com";

struct SoftAuthenticator {
    key: EcdsaKeyPair,
    rng: SystemRandom,
    credential_id: Vec<u8>,
    sign_count: u32,
}

impl SoftAuthenticator {
    fn new(credential_id: &[u8]) -> SoftAuthenticator {
        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &rng).unwrap();
        let key =
            EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, pkcs8.as_ref(), &rng)
                .unwrap();
        SoftAuthenticator {
            key,
            rng,
            credential_id: credential_id.to_vec(),
            sign_count: 0,
        }
    }

    /// Swaps the private key while keeping the credential id, as a cloned
    /// or reset authenticator would.
    fn rotate_key(&mut self) {
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &self.rng)
            .unwrap();
        self.key =
            EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, pkcs8.as_ref(), &self.rng)
                .unwrap();
    }

    fn cose_public_key(&self) -> Vec<u8> {
        use ring::signature::KeyPair;
        let point = self.key.public_key().as_ref(); // 0x04 || x || y
        let value = Value::Map(vec![
            (Value::Integer(1.into()), Value::Integer(2.into())), // kty: EC2
            (Value::Integer(3.into()), Value::Integer((-7).into())), // alg: ES256
            (Value::Integer((-1).into()), Value::Integer(1.into())), // crv: P-256
            (Value::Integer((-2).into()), Value::Bytes(point[1..33].to_vec())),
            (Value::Integer((-3).into()), Value::Bytes(point[33..65].to_vec())),
        ]);
        let mut out = Vec::new();
        ciborium::ser::into_writer(&value, &mut out).unwrap();
        out
    }

    fn auth_data(&self, flags: u8, attested: bool) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&Sha256::digest(RP_ID.as_bytes()));
        out.push(flags);
        out.extend_from_slice(&self.sign_count.to_be_bytes());
        if attested {
            out.extend_from_slice(&[0u8; 16]); // aaguid
            out.extend_from_slice(&(self.credential_id.len() as u16).to_be_bytes());
            out.extend_from_slice(&self.credential_id);
            out.extend_from_slice(&self.cose_public_key());
        }
        out
    }

    fn register(&self, challenge: &str) -> webauthn::RegistrationParams {
        let client_data = format!(
            r#"{{"type":"webauthn.create","challenge":"{}","origin":"https://{}"}}"#,
            challenge, RP_ID
        );
        let auth_data = self.auth_data(0x41, true); // UP | AT

        let attestation = Value::Map(vec![
            (Value::Text("fmt".into()), Value::Text("none".into())),
            (Value::Text("attStmt".into()), Value::Map(vec![])),
            (Value::Text("authData".into()), Value::Bytes(auth_data)),
        ]);
        let mut attestation_object = Vec::new();
        ciborium::ser::into_writer(&attestation, &mut attestation_object).unwrap();

        webauthn::RegistrationParams {
            attestation_object: base64::encode_config(
                attestation_object,
                base64::URL_SAFE_NO_PAD,
            ),
            client_data_json: base64::encode_config(client_data, base64::URL_SAFE_NO_PAD),
            transports: vec!["usb".to_string()],
            name: "test key".to_string(),
            discoverable: false,
        }
    }

    fn assert(&mut self, challenge: &str) -> webauthn::AssertionParams {
        self.sign_count += 1;
        let client_data = format!(
            r#"{{"type":"webauthn.get","challenge":"{}","origin":"https://{}"}}"#,
            challenge, RP_ID
        );
        let auth_data = self.auth_data(0x01, false); // UP

        let mut message = auth_data.clone();
        message.extend_from_slice(&Sha256::digest(client_data.as_bytes()));
        let signature = self.key.sign(&self.rng, &message).unwrap();

        webauthn::AssertionParams {
            credential_id: base64::encode_config(&self.credential_id, base64::URL_SAFE_NO_PAD),
            authenticator_data: base64::encode_config(auth_data, base64::URL_SAFE_NO_PAD),
            client_data_json: base64::encode_config(client_data, base64::URL_SAFE_NO_PAD),
            signature: base64::encode_config(signature.as_ref(), base64::URL_SAFE_NO_PAD),
            user_handle: String::new(),
        }
    }
}

fn challenge_of(options: &serde_json::Value) -> String {
    options["challenge"].as_str().unwrap().to_string()
}

#[test]
fn register_assert_then_key_rotation_fails() {
    let (_dir, db) = test_db();
    let auth = auth_service(db.clone());
    let alice = new_account(&auth, "alice@example.com", "pw");
    let mut authenticator = SoftAuthenticator::new(b"cred-1");

    db.set_time_for_testing(Some(1_700_000_000_000));

    // Register.
    let options = auth
        .webauthn_register_begin(alice.user_id, RP_ID, false)
        .unwrap();
    let reg = authenticator.register(&challenge_of(&options));
    auth.webauthn_register_finish(alice.user_id, RP_ID, &reg)
        .unwrap();
    auth.set_require_mfa(alice.user_id, true).unwrap();

    // Login presenting a WebAuthn assertion.
    let caps = MfaInput {
        webauthn: None,
        has_mfa_capability: true,
    };
    let step = auth
        .login_begin("alice@example.com", "pw", &caps, RP_ID)
        .unwrap();
    let options = match step {
        LoginStep::MfaChallenge { options } => options,
        _ => panic!("expected an MFA challenge"),
    };

    let assertion = authenticator.assert(&challenge_of(&options));
    let mfa = MfaInput {
        webauthn: Some(assertion),
        has_mfa_capability: true,
    };
    match auth
        .login_begin("alice@example.com", "pw", &mfa, RP_ID)
        .unwrap()
    {
        LoginStep::Session { user, .. } => assert_eq!(user.user_id, alice.user_id),
        _ => panic!("expected a session"),
    }

    let stored = db.user_by_id(alice.user_id).unwrap().unwrap();
    assert_eq!(stored.webauthn.credentials.len(), 1);
    assert_eq!(stored.webauthn.credentials[0].sign_count, 1);

    // Rotate the authenticator's private key; the next assertion fails
    // and the stored sign counter does not advance.
    authenticator.rotate_key();
    let step = auth
        .login_begin("alice@example.com", "pw", &caps, RP_ID)
        .unwrap();
    let options = match step {
        LoginStep::MfaChallenge { options } => options,
        _ => panic!("expected an MFA challenge"),
    };
    let assertion = authenticator.assert(&challenge_of(&options));
    let mfa = MfaInput {
        webauthn: Some(assertion),
        has_mfa_capability: true,
    };
    let err = auth
        .login_begin("alice@example.com", "pw", &mfa, RP_ID)
        .unwrap_err();
    assert!(matches!(err, ServerError::InvalidCredentials));

    let stored = db.user_by_id(alice.user_id).unwrap().unwrap();
    assert_eq!(stored.webauthn.credentials[0].sign_count, 1);
}

#[test]
fn stale_or_reused_challenges_fail() {
    let (_dir, db) = test_db();
    let auth = auth_service(db.clone());
    let alice = new_account(&auth, "alice@example.com", "pw");
    let authenticator = SoftAuthenticator::new(b"cred-2");

    db.set_time_for_testing(Some(1_700_000_000_000));
    let options = auth
        .webauthn_register_begin(alice.user_id, RP_ID, false)
        .unwrap();
    let reg = authenticator.register(&challenge_of(&options));

    // A registration replayed after its challenge was consumed fails.
    auth.webauthn_register_finish(alice.user_id, RP_ID, &reg)
        .unwrap();
    assert!(auth
        .webauthn_register_finish(alice.user_id, RP_ID, &reg)
        .is_err());

    // An expired challenge fails.
    let options = auth
        .webauthn_register_begin(alice.user_id, RP_ID, false)
        .unwrap();
    db.set_time_for_testing(Some(
        1_700_000_000_000 + webauthn::CHALLENGE_TTL_MS + 1,
    ));
    let reg = authenticator.register(&challenge_of(&options));
    assert!(auth
        .webauthn_register_finish(alice.user_id, RP_ID, &reg)
        .is_err());
}

#[test]
fn wrong_rp_id_is_rejected() {
    let (_dir, db) = test_db();
    let auth = auth_service(db.clone());
    let alice = new_account(&auth, "alice@example.com", "pw");
    let authenticator = SoftAuthenticator::new(b"cred-3");

    db.set_time_for_testing(Some(1_700_000_000_000));
    let options = auth
        .webauthn_register_begin(alice.user_id, "evil.example.com", false)
        .unwrap();
    // The authenticator signs for its own RP; the server expected another.
    let reg = authenticator.register(&challenge_of(&options));
    assert!(auth
        .webauthn_register_finish(alice.user_id, "evil.example.com", &reg)
        .is_err());
}

#[test]
fn managing_credentials_respects_the_mfa_invariant() {
    let (_dir, db) = test_db();
    let auth = auth_service(db.clone());
    let alice = new_account(&auth, "alice@example.com", "pw");
    let authenticator = SoftAuthenticator::new(b"cred-4");

    db.set_time_for_testing(Some(1_700_000_000_000));
    let options = auth
        .webauthn_register_begin(alice.user_id, RP_ID, false)
        .unwrap();
    let reg = authenticator.register(&challenge_of(&options));
    auth.webauthn_register_finish(alice.user_id, RP_ID, &reg)
        .unwrap();
    auth.set_require_mfa(alice.user_id, true).unwrap();

    let keys = auth.webauthn_keys(&db.user_by_id(alice.user_id).unwrap().unwrap());
    assert_eq!(keys.len(), 1);
    let id = keys[0]["id"].as_str().unwrap().to_string();

    // Removing the only credential of an MFA-required account fails.
    assert!(auth
        .webauthn_update_keys(alice.user_id, &[id.clone()], &[])
        .is_err());

    auth.webauthn_update_keys(alice.user_id, &[], &[(id.clone(), "renamed".to_string())])
        .unwrap();
    let user = db.user_by_id(alice.user_id).unwrap().unwrap();
    assert_eq!(user.webauthn.credentials[0].name, "renamed");

    auth.set_require_mfa(alice.user_id, false).unwrap();
    auth.webauthn_update_keys(alice.user_id, &[id], &[]).unwrap();
    assert!(db
        .user_by_id(alice.user_id)
        .unwrap()
        .unwrap()
        .webauthn
        .credentials
        .is_empty());
}
