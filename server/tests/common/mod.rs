#![allow(dead_code)]

use krin::auth::AuthService;
use krin::crypto::envelope::KeyPair;
use krin::crypto::{Algorithm, MasterKey};
use krin::db::fileset::FileSpec;
use krin::db::{Db, UserRecord};
use std::sync::Arc;
use wire::Set;

pub fn test_db() -> (tempfile::TempDir, Arc<Db>) {
    let dir = tempfile::tempdir().unwrap();
    let master = Arc::new(MasterKey::random(Algorithm::Aes256Gcm));
    let db = Arc::new(Db::open(dir.path(), master, None).unwrap());
    (dir, db)
}

pub fn auth_service(db: Arc<Db>) -> AuthService {
    AuthService::new(db, true, true)
}

pub fn key_bundle() -> String {
    base64::encode(KeyPair::generate().public())
}

pub fn new_account(auth: &AuthService, email: &str, password: &str) -> UserRecord {
    auth.create_account(&wire::CreateAccountParams {
        email: email.into(),
        password: password.into(),
        salt: "0011".into(),
        key_bundle: key_bundle().into(),
    })
    .unwrap()
}

pub fn file_spec(tag: &str, size: i64) -> FileSpec {
    FileSpec {
        version: "1".to_string(),
        date_created: 1,
        date_modified: 0,
        headers: format!("hdr-{}", tag),
        album_id: None,
        store_file: format!("blob-{}", tag),
        store_file_size: size,
        store_thumb: format!("thumb-{}", tag),
        store_thumb_size: 0,
    }
}

pub fn add_gallery_file(db: &Db, user: u64, name: &str, size: i64) {
    db.add_file(user, Set::Gallery, None, name, file_spec(name, size))
        .unwrap();
}
