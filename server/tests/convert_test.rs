//! Master-key format conversion over a populated tree: every object must
//! decrypt to the same bytes under the new key, per-user wrapped fields
//! must survive, and previously minted session tokens must still work.

mod common;

use common::*;
use krin::auth::{LoginStep, MfaInput};
use krin::convert::convert_master_key;
use krin::crypto::{Algorithm, MasterKey};
use krin::db::Db;
use std::io::{Read, Write};
use std::sync::Arc;
use wire::Set;

const PASSPHRASE: &str = "correct horse battery staple";

#[test]
fn aes_to_chacha_preserves_everything() {
    let dir = tempfile::tempdir().unwrap();
    let key_path = dir.path().join(krin::MASTER_KEY_FILE);

    let master = Arc::new(
        MasterKey::create_or_open(&key_path, PASSPHRASE, Algorithm::Aes256Gcm).unwrap(),
    );
    assert_eq!(master.algorithm(), Algorithm::Aes256Gcm);

    // Populate: one account, one session, one blob, one gallery record.
    let (user_id, token, server_pk, blob_name, blob_bytes) = {
        let db = Arc::new(Db::open(dir.path(), master, None).unwrap());
        let auth = auth_service(db.clone());
        let user = new_account(&auth, "alice@example.com", "pw");

        let step = auth
            .login_begin("alice@example.com", "pw", &MfaInput::default(), "host")
            .unwrap();
        let token = match step {
            LoginStep::Session { token, .. } => token,
            _ => panic!("expected a session"),
        };

        let blob_bytes: Vec<u8> = (0..200_000u32).map(|i| (i % 241) as u8).collect();
        let blob_name = krin::storage::SecureStore::new_blob_name();
        let (tmp, mut writer) = db.store().blob_writer(&blob_name).unwrap();
        writer.write_all(&blob_bytes).unwrap();
        let (file, size) = writer.finish().unwrap();
        file.sync_all().unwrap();
        db.store().import_blob(&tmp, &blob_name).unwrap();

        let mut spec = file_spec("conv", size as i64);
        spec.store_file = blob_name.clone();
        db.add_file(user.user_id, Set::Gallery, None, "pic", spec)
            .unwrap();

        let server_pk = *user.keypair(db.master()).unwrap().public();
        (user.user_id, token, server_pk, blob_name, blob_bytes)
    };

    convert_master_key(dir.path(), PASSPHRASE, Algorithm::Chacha20Poly1305).unwrap();

    // The key file now opens as the new variant; the old staging file is
    // gone.
    let master = Arc::new(MasterKey::open(&key_path, PASSPHRASE).unwrap());
    assert_eq!(master.algorithm(), Algorithm::Chacha20Poly1305);
    assert!(!dir.path().join("master.key.new").exists());

    let db = Arc::new(Db::open(dir.path(), master, None).unwrap());
    let auth = auth_service(db.clone());

    // Records still read.
    let user = db.user_by_id(user_id).unwrap().unwrap();
    assert_eq!(user.email, "alice@example.com");
    assert_eq!(db.file_updates(user_id, Set::Gallery, 0).unwrap().len(), 1);

    // Wrapped per-user fields decrypt to the same key material.
    assert_eq!(*user.keypair(db.master()).unwrap().public(), server_pk);

    // The pre-conversion session token is still accepted.
    assert_eq!(auth.check_session(&token).unwrap().user_id, user_id);

    // The blob decrypts to the same bytes.
    let mut out = Vec::new();
    db.store()
        .blob_reader(&blob_name)
        .unwrap()
        .read_to_end(&mut out)
        .unwrap();
    assert_eq!(out, blob_bytes);

    // And the login flow still works end to end.
    match auth
        .login_begin("alice@example.com", "pw", &MfaInput::default(), "host")
        .unwrap()
    {
        LoginStep::Session { user, .. } => assert_eq!(user.user_id, user_id),
        _ => panic!("expected a session"),
    }
}

#[test]
fn converting_to_the_same_algorithm_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let key_path = dir.path().join(krin::MASTER_KEY_FILE);
    MasterKey::create_or_open(&key_path, PASSPHRASE, Algorithm::Aes256Gcm).unwrap();

    convert_master_key(dir.path(), PASSPHRASE, Algorithm::Aes256Gcm).unwrap();
    let master = MasterKey::open(&key_path, PASSPHRASE).unwrap();
    assert_eq!(master.algorithm(), Algorithm::Aes256Gcm);
}
