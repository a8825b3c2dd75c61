use super::{Db, LockKey, UserIndex, USERS_INDEX};
use crate::crypto::envelope::KeyPair;
use crate::crypto::{MasterKey, SecretBytes};
use crate::error::{ServerError, ServerResult};
use crate::storage::SecureStore;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use wire::Set;

/// A pointer at a disabled shadow account, plus the shadow account's
/// password sealed by the client for its own recovery.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Decoy {
    pub user_id: u64,
    pub encrypted_password: String,
}

#[derive(Serialize, Deserialize, Clone, Default, Debug)]
pub struct PushSubscription {
    pub endpoint: String,
    pub auth: String,
    pub p256dh: String,
    pub date_created: i64,
}

#[derive(Serialize, Deserialize, Clone, Default, Debug)]
pub struct PushConfig {
    pub endpoints: Vec<PushSubscription>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct UserRecord {
    pub user_id: u64,
    pub email: String,
    /// bcrypt, cost 12.
    pub hashed_password: String,
    /// Opaque hex string handed to clients before login.
    pub salt: String,
    /// Client-generated blob: public key, optionally followed by the
    /// client's own encrypted secret key.
    pub key_bundle: String,
    pub public_key: Vec<u8>,
    /// Server half of the per-user key pair, wrapped under the master key.
    pub server_secret_key: Vec<u8>,
    /// Token signing key, wrapped under the master key.
    pub token_key: Vec<u8>,
    /// Hashes of currently valid session tokens.
    pub valid_tokens: HashSet<String>,
    pub home_folder: String,
    pub is_backup: bool,
    pub login_disabled: bool,
    pub need_approval: bool,
    pub admin: bool,
    pub require_mfa: bool,
    /// Base32 TOTP secret; empty when OTP is not enrolled.
    pub otp_key: String,
    pub webauthn: crate::auth::webauthn::WebauthnConfig,
    pub push: PushConfig,
    pub decoys: Vec<Decoy>,
}

impl UserRecord {
    pub fn keypair(&self, master: &MasterKey) -> ServerResult<KeyPair> {
        let secret = master.decrypt(&self.server_secret_key)?;
        KeyPair::from_secret(&secret)
    }

    pub fn unwrapped_token_key(&self, master: &MasterKey) -> ServerResult<SecretBytes> {
        Ok(SecretBytes::new(master.decrypt(&self.token_key)?))
    }

    /// True when at least one MFA factor is registered.
    pub fn has_mfa_factor(&self) -> bool {
        !self.otp_key.is_empty() || !self.webauthn.credentials.is_empty()
    }
}

/// Everything the authentication layer prepares before an account exists.
pub struct NewUser {
    pub email: String,
    pub hashed_password: String,
    pub salt: String,
    pub key_bundle: String,
    pub public_key: Vec<u8>,
    pub is_backup: bool,
    pub need_approval: bool,
}

fn valid_email(email: &str) -> bool {
    let count = email.chars().count();
    count > 0 && count <= 64 && !email.chars().any(|c| c.is_control())
}

impl Db {
    pub fn add_user(&self, new: NewUser) -> ServerResult<UserRecord> {
        if !valid_email(&new.email) {
            return Err(ServerError::BadRequest);
        }

        let _index = self.store().lock(USERS_INDEX);
        let mut index: UserIndex = self.store().snapshot(USERS_INDEX)?.unwrap_or_default();
        if index.emails.contains_key(&new.email) {
            return Err(ServerError::EmailTaken);
        }
        let user_id = index.next_id + 1;

        let keypair = KeyPair::generate();
        let master = self.master();
        let token_key = SecretBytes::random(32);

        let user = UserRecord {
            user_id,
            email: new.email.clone(),
            hashed_password: new.hashed_password,
            salt: new.salt,
            key_bundle: new.key_bundle,
            public_key: new.public_key,
            server_secret_key: master.encrypt(keypair.secret_bytes()),
            token_key: master.encrypt(token_key.as_slice()),
            valid_tokens: HashSet::new(),
            home_folder: SecureStore::hash_string(&format!(
                "home-{}-{}",
                user_id,
                rand::thread_rng().gen::<u64>()
            )),
            is_backup: new.is_backup,
            login_disabled: false,
            need_approval: new.need_approval,
            admin: false,
            require_mfa: false,
            otp_key: String::new(),
            webauthn: Default::default(),
            push: Default::default(),
            decoys: Vec::new(),
        };

        {
            let _lock = self.store().lock(&Db::user_key(user_id));
            self.store().put(&Db::user_key(user_id), &user)?;
        }
        self.store()
            .create_empty::<super::FileSet>(&Db::fileset_key(user_id, Set::Gallery))?;
        self.store()
            .create_empty::<super::FileSet>(&Db::fileset_key(user_id, Set::Trash))?;
        self.store()
            .create_empty::<super::album::AlbumRefs>(&Db::album_refs_key(user_id))?;
        self.store()
            .create_empty::<super::ContactList>(&Db::contacts_key(user_id))?;
        self.store()
            .create_empty::<super::DeleteLog>(&Db::deletes_key(user_id))?;

        // The index write is the commit point; a crash before it leaves
        // unreachable files behind and the registration is retried.
        index.next_id = user_id;
        index.emails.insert(new.email, user_id);
        self.store().put(USERS_INDEX, &index)?;

        Ok(user)
    }

    pub fn user_by_id(&self, id: u64) -> ServerResult<Option<UserRecord>> {
        self.store().snapshot(&Db::user_key(id))
    }

    pub fn user_by_email(&self, email: &str) -> ServerResult<Option<UserRecord>> {
        let index: UserIndex = self.store().snapshot(USERS_INDEX)?.unwrap_or_default();
        match index.emails.get(email) {
            None => Ok(None),
            Some(&id) => self.user_by_id(id),
        }
    }

    pub fn user_ids(&self) -> ServerResult<Vec<u64>> {
        let index: UserIndex = self.store().snapshot(USERS_INDEX)?.unwrap_or_default();
        let mut ids: Vec<u64> = index.emails.values().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// The central mutation primitive: exclusive lock on the user record,
    /// mutate a copy, commit atomically when the closure returns Ok.
    pub fn mutate_user<F>(&self, id: u64, f: F) -> ServerResult<UserRecord>
    where
        F: FnOnce(&mut UserRecord) -> ServerResult<()>,
    {
        let key = Db::user_key(id);
        let _lock = self.store().lock(&key);
        let mut user: UserRecord = self
            .store()
            .snapshot(&key)?
            .ok_or(ServerError::NotFound)?;
        f(&mut user)?;
        self.store().put(&key, &user)?;
        Ok(user)
    }

    /// Replaces the whole record. The record must already exist.
    pub fn update_user(&self, user: &UserRecord) -> ServerResult<()> {
        let key = Db::user_key(user.user_id);
        let _lock = self.store().lock(&key);
        if self.store().snapshot::<UserRecord>(&key)?.is_none() {
            return Err(ServerError::NotFound);
        }
        self.store().put(&key, user)?;
        Ok(())
    }

    pub fn rename_user(&self, id: u64, new_email: &str) -> ServerResult<()> {
        if !valid_email(new_email) {
            return Err(ServerError::BadRequest);
        }

        let _index_lock = self.store().lock(USERS_INDEX);
        let mut index: UserIndex = self.store().snapshot(USERS_INDEX)?.unwrap_or_default();
        if index.emails.contains_key(new_email) {
            return Err(ServerError::EmailTaken);
        }

        let old_email = self
            .user_by_id(id)?
            .ok_or(ServerError::NotFound)?
            .email;
        self.mutate_user(id, |user| {
            user.email = new_email.to_string();
            Ok(())
        })?;

        index.emails.remove(&old_email);
        index.emails.insert(new_email.to_string(), id);
        self.store().put(USERS_INDEX, &index)?;

        // Refresh the cached email in the contact lists that reference it.
        let now = self.now_ms();
        let contacts: super::ContactList = self
            .store()
            .snapshot(&Db::contacts_key(id))?
            .unwrap_or_default();
        for &peer in contacts.contacts.keys() {
            let _ = self.store().update::<super::ContactList, _>(
                &Db::contacts_key(peer),
                |cur| {
                    let mut list = cur.unwrap_or_default();
                    if let Some(c) = list.contacts.get_mut(&id) {
                        c.email = new_email.to_string();
                        c.date_modified = now;
                    }
                    Ok(list)
                },
            );
        }
        Ok(())
    }

    /// Removes the account and everything only it can reach: session
    /// tokens, filesets, owned albums (with tombstones for their members),
    /// memberships, contacts on both sides, and blobs no other fileset
    /// references.
    pub fn delete_user(&self, id: u64) -> ServerResult<()> {
        let user = self.user_by_id(id)?.ok_or(ServerError::NotFound)?;
        let now = self.now_ms();

        let refs: super::album::AlbumRefs = self
            .store()
            .snapshot(&Db::album_refs_key(id))?
            .unwrap_or_default();
        for aref in refs.albums.values() {
            if aref.owner_id == id {
                self.delete_album(id, &aref.album_id)?;
            } else {
                // Leaving quietly: other members keep their view.
                let _ = self.leave_album(id, &aref.album_id);
            }
        }

        // Contact removal tombstones for everyone who had this user.
        let contacts: super::ContactList = self
            .store()
            .snapshot(&Db::contacts_key(id))?
            .unwrap_or_default();
        for &peer in contacts.contacts.keys() {
            let locks = self.lock_all(vec![
                LockKey {
                    user: peer,
                    rank: super::RANK_CONTACTS,
                    key: Db::contacts_key(peer),
                },
                LockKey {
                    user: peer,
                    rank: super::RANK_DELETES,
                    key: Db::deletes_key(peer),
                },
            ]);
            let mut list: super::ContactList = self
                .store()
                .snapshot(&Db::contacts_key(peer))?
                .unwrap_or_default();
            if list.contacts.remove(&id).is_some() {
                self.store().put(&Db::contacts_key(peer), &list)?;
                self.append_tombstone(
                    peer,
                    super::DeleteEntry {
                        file: id.to_string(),
                        album_id: String::new(),
                        kind: wire::delete_type::CONTACT,
                        date: now,
                    },
                )?;
            }
            drop(locks);
        }

        // Blobs that no surviving fileset references.
        let mut own: HashSet<String> = HashSet::new();
        for set in [Set::Gallery, Set::Trash] {
            let fs: super::FileSet = self
                .store()
                .snapshot(&Db::fileset_key(id, set))?
                .unwrap_or_default();
            for spec in fs.files.values() {
                own.insert(spec.store_file.clone());
                if !spec.store_thumb.is_empty() {
                    own.insert(spec.store_thumb.clone());
                }
            }
        }
        let still_referenced = self.referenced_blobs_excluding(id)?;
        for name in own.difference(&still_referenced) {
            let _ = self.store().delete_blob(name);
        }

        self.store().delete(&Db::fileset_key(id, Set::Gallery))?;
        self.store().delete(&Db::fileset_key(id, Set::Trash))?;
        self.store().delete(&Db::album_refs_key(id))?;
        self.store().delete(&Db::contacts_key(id))?;
        self.store().delete(&Db::deletes_key(id))?;
        self.store().delete(&Db::user_key(id))?;

        self.edit_quota(id, None)?;

        let _index_lock = self.store().lock(USERS_INDEX);
        let mut index: UserIndex = self.store().snapshot(USERS_INDEX)?.unwrap_or_default();
        index.emails.remove(&user.email);
        self.store().put(USERS_INDEX, &index)?;
        Ok(())
    }

    /// Blob names referenced by any fileset other than `excluded`'s own
    /// gallery and trash (album filesets of albums owned by `excluded` are
    /// deleted before this runs).
    fn referenced_blobs_excluding(&self, excluded: u64) -> ServerResult<HashSet<String>> {
        let mut referenced = HashSet::new();
        for other in self.user_ids()? {
            if other == excluded {
                continue;
            }
            for (_, spec) in self.all_file_specs(other)? {
                referenced.insert(spec.store_file.clone());
                if !spec.store_thumb.is_empty() {
                    referenced.insert(spec.store_thumb.clone());
                }
            }
        }
        Ok(referenced)
    }
}
