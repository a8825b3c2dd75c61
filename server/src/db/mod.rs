//! The typed state layer. Everything user-domain lives behind `Db`:
//! users, albums, filesets, contacts, deletion logs and quotas, all stored
//! through the encrypted KV.
//!
//! Mutations funnel through `mutate_user` or the operation functions in
//! the submodules, which acquire path locks in one canonical order: global
//! indexes first, then per user in ascending user id, and within a user:
//! the user record, album refs, album records, album filesets, the gallery
//! and trash filesets, contacts, and the deletion log last.

pub mod album;
pub mod contact;
pub mod deletes;
pub mod fileset;
pub mod updates;
pub mod user;

pub use album::Album;
pub use contact::{Contact, ContactList};
pub use deletes::{DeleteEntry, DeleteLog};
pub use fileset::{FileSet, FileSpec};
pub use user::{Decoy, UserRecord};

use crate::crypto::MasterKey;
use crate::error::{ServerError, ServerResult};
use crate::storage::{PathLock, SecureStore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use wire::Set;

pub(crate) const USERS_INDEX: &str = "index/users";
pub(crate) const QUOTAS: &str = "index/quotas";

#[derive(Serialize, Deserialize, Default, Debug)]
pub struct UserIndex {
    pub next_id: u64,
    pub emails: HashMap<String, u64>,
}

#[derive(Serialize, Deserialize, Default, Debug)]
pub struct Quotas {
    pub limits: HashMap<u64, i64>,
}

/// One row of the admin listing.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AdminUser {
    #[serde(rename = "userId")]
    pub user_id: u64,
    pub email: String,
    pub quota: Option<i64>,
    #[serde(rename = "spaceUsed")]
    pub space_used: i64,
    #[serde(rename = "needApproval")]
    pub need_approval: bool,
    pub admin: bool,
    #[serde(rename = "loginDisabled")]
    pub login_disabled: bool,
}

/// Mutation applied through the admin endpoint.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AdminChange {
    #[serde(rename = "userId")]
    pub user_id: u64,
    #[serde(rename = "setApproved", skip_serializing_if = "Option::is_none")]
    pub set_approved: Option<bool>,
    #[serde(rename = "setAdmin", skip_serializing_if = "Option::is_none")]
    pub set_admin: Option<bool>,
    #[serde(rename = "setQuota", skip_serializing_if = "Option::is_none")]
    pub set_quota: Option<i64>,
}

/// Lock-ordering rank of a path within one user's aggregates.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub(crate) struct LockKey {
    pub user: u64,
    pub rank: u8,
    pub key: String,
}

pub(crate) const RANK_ALBUM_REFS: u8 = 2;
pub(crate) const RANK_ALBUM: u8 = 3;
pub(crate) const RANK_ALBUM_FILES: u8 = 4;
pub(crate) const RANK_GALLERY: u8 = 5;
pub(crate) const RANK_TRASH: u8 = 6;
pub(crate) const RANK_CONTACTS: u8 = 7;
pub(crate) const RANK_DELETES: u8 = 8;

pub struct Db {
    store: SecureStore,
    default_quota: Option<i64>,
    test_time: std::sync::Mutex<Option<i64>>,
}

impl Db {
    pub fn open(
        data_dir: impl AsRef<Path>,
        master: Arc<MasterKey>,
        default_quota: Option<i64>,
    ) -> ServerResult<Db> {
        let store = SecureStore::new(data_dir.as_ref(), master)?;
        store.create_empty::<UserIndex>(USERS_INDEX)?;
        store.create_empty::<Quotas>(QUOTAS)?;
        Ok(Db {
            store,
            default_quota,
            test_time: std::sync::Mutex::new(None),
        })
    }

    pub fn store(&self) -> &SecureStore {
        &self.store
    }

    pub fn master(&self) -> &MasterKey {
        self.store.master()
    }

    /// Milliseconds since the epoch; frozen when a test pinned the clock.
    pub fn now_ms(&self) -> i64 {
        if let Some(t) = *self.test_time.lock().unwrap() {
            return t;
        }
        chrono::Utc::now().timestamp_millis()
    }

    /// Pins the clock. Tests only.
    pub fn set_time_for_testing(&self, ms: Option<i64>) {
        *self.test_time.lock().unwrap() = ms;
    }

    // Path layout.

    pub(crate) fn user_key(id: u64) -> String {
        format!("users/{}/user", id)
    }

    pub(crate) fn album_refs_key(id: u64) -> String {
        format!("users/{}/albums", id)
    }

    pub(crate) fn album_key(owner: u64, album_id: &str) -> String {
        format!("albums/{}/{}", owner, album_id)
    }

    pub(crate) fn album_files_key(owner: u64, album_id: &str) -> String {
        format!("albums/{}/{}/files", owner, album_id)
    }

    pub(crate) fn fileset_key(user: u64, set: Set) -> String {
        match set {
            Set::Gallery => format!("users/{}/fileset/gallery", user),
            Set::Trash => format!("users/{}/fileset/trash", user),
            Set::Album => unreachable!("album filesets are keyed by owner and album id"),
        }
    }

    pub(crate) fn contacts_key(id: u64) -> String {
        format!("users/{}/contacts", id)
    }

    pub(crate) fn deletes_key(id: u64) -> String {
        format!("users/{}/deletes", id)
    }

    /// Acquires all locks in canonical order. The input order does not
    /// matter; duplicates collapse.
    pub(crate) fn lock_all(&self, mut keys: Vec<LockKey>) -> Vec<PathLock> {
        keys.sort();
        keys.dedup_by(|a, b| a.key == b.key);
        keys.iter().map(|k| self.store.lock(&k.key)).collect()
    }

    // Quotas.

    pub fn quota(&self, user_id: u64) -> ServerResult<Option<i64>> {
        let quotas: Quotas = self.store.snapshot(QUOTAS)?.unwrap_or_default();
        Ok(quotas.limits.get(&user_id).copied().or(self.default_quota))
    }

    pub fn edit_quota(&self, user_id: u64, limit: Option<i64>) -> ServerResult<()> {
        self.store.update::<Quotas, _>(QUOTAS, |cur| {
            let mut quotas = cur.unwrap_or_default();
            match limit {
                Some(l) => {
                    quotas.limits.insert(user_id, l);
                }
                None => {
                    quotas.limits.remove(&user_id);
                }
            }
            Ok(quotas)
        })?;
        Ok(())
    }

    // Admin.

    pub fn admin_data(&self, change: Option<&AdminChange>) -> ServerResult<Vec<AdminUser>> {
        if let Some(change) = change {
            if let Some(quota) = change.set_quota {
                self.edit_quota(change.user_id, Some(quota))?;
            }
            if change.set_approved.is_some() || change.set_admin.is_some() {
                self.mutate_user(change.user_id, |user| {
                    if let Some(approved) = change.set_approved {
                        user.need_approval = !approved;
                    }
                    if let Some(admin) = change.set_admin {
                        user.admin = admin;
                    }
                    Ok(())
                })?;
            }
        }

        let mut out = Vec::new();
        for id in self.user_ids()? {
            let user = match self.user_by_id(id)? {
                Some(u) => u,
                None => continue,
            };
            out.push(AdminUser {
                user_id: id,
                email: user.email,
                quota: self.quota(id)?,
                space_used: self.space_used(id)?,
                need_approval: user.need_approval,
                admin: user.admin,
                login_disabled: user.login_disabled,
            });
        }
        Ok(out)
    }
}

pub(crate) fn parse_permissions(s: &str) -> ServerResult<wire::Permissions> {
    wire::Permissions::from_wire(s).ok_or(ServerError::BadRequest)
}
