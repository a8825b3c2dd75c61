use super::{
    parse_permissions, Db, DeleteEntry, LockKey, RANK_ALBUM_FILES, RANK_DELETES, RANK_GALLERY,
    RANK_TRASH,
};
use crate::error::{ServerError, ServerResult};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use wire::{delete_type, Set};

/// One file record. The blobs it points at are ciphertext streams the
/// server never looks inside; sizes are ciphertext bytes and feed the
/// quota accounting.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FileSpec {
    pub version: String,
    pub date_created: i64,
    pub date_modified: i64,
    pub headers: String,
    pub album_id: Option<String>,
    pub store_file: String,
    pub store_file_size: i64,
    pub store_thumb: String,
    pub store_thumb_size: i64,
}

#[derive(Serialize, Deserialize, Clone, Default, Debug)]
pub struct FileSet {
    pub files: HashMap<String, FileSpec>,
}

/// A validated move/copy request.
#[derive(Clone, Debug)]
pub struct MoveSpec {
    pub set_from: Set,
    pub album_id_from: Option<String>,
    pub set_to: Set,
    pub album_id_to: Option<String>,
    pub is_moving: bool,
    pub filenames: Vec<String>,
    pub headers: Vec<String>,
}

struct ResolvedSet {
    /// User whose storage holds the fileset: the actor for gallery and
    /// trash, the album owner for album sets.
    owner: u64,
    key: String,
    rank: u8,
    album: Option<super::Album>,
}

impl Db {
    fn resolve_set(
        &self,
        actor: u64,
        set: Set,
        album_id: Option<&str>,
    ) -> ServerResult<ResolvedSet> {
        match set {
            Set::Album => {
                let album_id = album_id.ok_or(ServerError::BadRequest)?;
                let album = self.album(actor, album_id)?;
                Ok(ResolvedSet {
                    owner: album.owner_id,
                    key: Db::album_files_key(album.owner_id, album_id),
                    rank: RANK_ALBUM_FILES,
                    album: Some(album),
                })
            }
            Set::Gallery => Ok(ResolvedSet {
                owner: actor,
                key: Db::fileset_key(actor, Set::Gallery),
                rank: RANK_GALLERY,
                album: None,
            }),
            Set::Trash => Ok(ResolvedSet {
                owner: actor,
                key: Db::fileset_key(actor, Set::Trash),
                rank: RANK_TRASH,
                album: None,
            }),
        }
    }

    /// Inserts a freshly uploaded file record. The quota of the storage
    /// owner (the actor, or the destination album's owner) must cover the
    /// new ciphertext bytes.
    pub fn add_file(
        &self,
        actor: u64,
        set: Set,
        album_id: Option<&str>,
        file_name: &str,
        mut spec: FileSpec,
    ) -> ServerResult<()> {
        let dest = self.resolve_set(actor, set, album_id)?;
        if let Some(ref album) = dest.album {
            let perms = parse_permissions(&album.permissions)?;
            if album.owner_id != actor && !perms.allow_add {
                return Err(ServerError::Denied(
                    "Adding items to this album is not permitted",
                ));
            }
        }

        let now = self.now_ms();
        spec.album_id = dest.album.as_ref().map(|a| a.album_id.clone());
        spec.date_modified = now;

        let locks = self.lock_all(vec![LockKey {
            user: dest.owner,
            rank: dest.rank,
            key: dest.key.clone(),
        }]);

        let added = spec.store_file_size + spec.store_thumb_size;
        self.check_quota(dest.owner, added)?;

        let mut fs: FileSet = self.store().snapshot(&dest.key)?.unwrap_or_default();
        fs.files.insert(file_name.to_string(), spec);
        self.store().put(&dest.key, &fs)?;
        drop(locks);
        Ok(())
    }

    /// Moves or copies records between filesets, enforcing the album
    /// permission matrix and the one-way trash rules. Filenames absent
    /// from the source are skipped so retries are idempotent.
    pub fn move_file(&self, actor: u64, spec: &MoveSpec) -> ServerResult<()> {
        if spec.set_from == spec.set_to && spec.album_id_from == spec.album_id_to {
            return Err(ServerError::BadRequest);
        }
        if spec.set_from == Set::Trash {
            if !spec.is_moving {
                return Err(ServerError::Denied("Can't copy files out of the trash"));
            }
            if spec.set_to != Set::Gallery {
                return Err(ServerError::Denied(
                    "Files in the trash can only be moved to the gallery",
                ));
            }
        }
        if spec.set_to == Set::Trash && !spec.is_moving {
            return Err(ServerError::Denied("Can't copy files to the trash"));
        }

        let src = self.resolve_set(actor, spec.set_from, spec.album_id_from.as_deref())?;
        let dst = self.resolve_set(actor, spec.set_to, spec.album_id_to.as_deref())?;

        if let Some(ref album) = dst.album {
            let perms = parse_permissions(&album.permissions)?;
            if album.owner_id != actor && !perms.allow_add {
                return Err(ServerError::Denied(
                    "Adding items to this album is not permitted",
                ));
            }
        }
        if let Some(ref album) = src.album {
            let perms = parse_permissions(&album.permissions)?;
            if album.owner_id != actor {
                if !perms.allow_copy {
                    return Err(ServerError::Denied(
                        "Copying items from this album is not permitted",
                    ));
                }
                if spec.is_moving {
                    return Err(ServerError::Denied(
                        "Removing items from this album is not permitted",
                    ));
                }
            }
        }

        let crossing = spec.album_id_from != spec.album_id_to;
        if !spec.headers.is_empty() && spec.headers.len() != spec.filenames.len() {
            return Err(ServerError::BadRequest);
        }
        if crossing && spec.headers.len() != spec.filenames.len() {
            return Err(ServerError::BadRequest);
        }

        let now = self.now_ms();

        // Tombstone recipients for the records leaving the source set.
        let tombstone_users: Vec<u64> = match (spec.set_from, &src.album) {
            (Set::Album, Some(album)) => {
                let mut ids: Vec<u64> = album.members.keys().copied().collect();
                if !ids.contains(&album.owner_id) {
                    ids.push(album.owner_id);
                }
                ids
            }
            _ => vec![actor],
        };

        let mut keys = vec![
            LockKey {
                user: src.owner,
                rank: src.rank,
                key: src.key.clone(),
            },
            LockKey {
                user: dst.owner,
                rank: dst.rank,
                key: dst.key.clone(),
            },
        ];
        if spec.is_moving {
            for &u in &tombstone_users {
                keys.push(LockKey {
                    user: u,
                    rank: RANK_DELETES,
                    key: Db::deletes_key(u),
                });
            }
        }
        let locks = self.lock_all(keys);

        let mut src_fs: FileSet = self.store().snapshot(&src.key)?.unwrap_or_default();
        let mut dst_fs: FileSet = self.store().snapshot(&dst.key)?.unwrap_or_default();

        // Records that are actually present; everything else is skipped.
        let mut moved: Vec<(usize, String)> = Vec::new();
        for (i, name) in spec.filenames.iter().enumerate() {
            if src_fs.files.contains_key(name) {
                moved.push((i, name.clone()));
            }
        }

        // New references the destination owner pays for.
        let mut reachable = self.reachable_blob_sizes(dst.owner)?;
        let mut added = 0i64;
        for (_, name) in &moved {
            let f = &src_fs.files[name];
            for (blob, size) in [
                (&f.store_file, f.store_file_size),
                (&f.store_thumb, f.store_thumb_size),
            ] {
                if !blob.is_empty() && !reachable.contains_key(blob) {
                    reachable.insert(blob.clone(), size);
                    added += size;
                }
            }
        }
        self.check_quota(dst.owner, added)?;

        for (i, name) in &moved {
            let mut rec = src_fs.files[name].clone();
            if crossing {
                rec.headers = spec.headers[*i].clone();
            }
            rec.album_id = dst.album.as_ref().map(|a| a.album_id.clone());
            rec.date_modified = now;
            dst_fs.files.insert(name.clone(), rec);
            if spec.is_moving {
                src_fs.files.remove(name);
            }
        }

        self.store().put(&dst.key, &dst_fs)?;
        if spec.is_moving {
            self.store().put(&src.key, &src_fs)?;

            let (kind, album_id) = match (spec.set_from, &src.album) {
                (Set::Trash, _) => (delete_type::TRASH, String::new()),
                (_, Some(album)) => (delete_type::FILE, album.album_id.clone()),
                _ => (delete_type::FILE, String::new()),
            };
            for &u in &tombstone_users {
                for (_, name) in &moved {
                    self.append_tombstone(
                        u,
                        DeleteEntry {
                            file: name.clone(),
                            album_id: album_id.clone(),
                            kind,
                            date: now,
                        },
                    )?;
                }
            }
        }
        drop(locks);
        Ok(())
    }

    /// Removes trash records older than `before_ts`, writing trash
    /// tombstones, and advances the tombstone floor to `before_ts`,
    /// pruning log entries behind it.
    pub fn empty_trash(&self, user: u64, before_ts: i64) -> ServerResult<()> {
        let now = self.now_ms();
        let trash_key = Db::fileset_key(user, Set::Trash);
        let locks = self.lock_all(vec![
            LockKey {
                user,
                rank: RANK_TRASH,
                key: trash_key.clone(),
            },
            LockKey {
                user,
                rank: RANK_DELETES,
                key: Db::deletes_key(user),
            },
        ]);

        let mut trash: FileSet = self.store().snapshot(&trash_key)?.unwrap_or_default();
        let removed: Vec<String> = trash
            .files
            .iter()
            .filter(|(_, spec)| spec.date_modified <= before_ts)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &removed {
            trash.files.remove(name);
        }
        self.store().put(&trash_key, &trash)?;

        for name in &removed {
            self.append_tombstone(
                user,
                DeleteEntry {
                    file: name.clone(),
                    album_id: String::new(),
                    kind: delete_type::TRASH,
                    date: now,
                },
            )?;
        }
        self.advance_delete_floor(user, before_ts)?;
        drop(locks);
        Ok(())
    }

    /// Permanently deletes specific records from the trash.
    pub fn delete_files(&self, user: u64, filenames: &[String]) -> ServerResult<()> {
        let now = self.now_ms();
        let trash_key = Db::fileset_key(user, Set::Trash);
        let locks = self.lock_all(vec![
            LockKey {
                user,
                rank: RANK_TRASH,
                key: trash_key.clone(),
            },
            LockKey {
                user,
                rank: RANK_DELETES,
                key: Db::deletes_key(user),
            },
        ]);

        let mut trash: FileSet = self.store().snapshot(&trash_key)?.unwrap_or_default();
        let mut removed = Vec::new();
        for name in filenames {
            if trash.files.remove(name).is_some() {
                removed.push(name.clone());
            }
        }
        self.store().put(&trash_key, &trash)?;

        for name in removed {
            self.append_tombstone(
                user,
                DeleteEntry {
                    file: name,
                    album_id: String::new(),
                    kind: delete_type::TRASH,
                    date: now,
                },
            )?;
        }
        drop(locks);
        Ok(())
    }

    /// Records with `date_modified > since` for one cursor. For the album
    /// cursor this spans every album the user can reach.
    pub fn file_updates(
        &self,
        user: u64,
        set: Set,
        since: i64,
    ) -> ServerResult<Vec<wire::FileRecord>> {
        let mut out = Vec::new();
        match set {
            Set::Gallery | Set::Trash => {
                let fs: FileSet = self
                    .store()
                    .snapshot(&Db::fileset_key(user, set))?
                    .unwrap_or_default();
                collect_updates(&fs, since, &mut out);
            }
            Set::Album => {
                let refs: super::album::AlbumRefs = self
                    .store()
                    .snapshot(&Db::album_refs_key(user))?
                    .unwrap_or_default();
                for aref in refs.albums.values() {
                    let fs: FileSet = self
                        .store()
                        .snapshot(&Db::album_files_key(aref.owner_id, &aref.album_id))?
                        .unwrap_or_default();
                    collect_updates(&fs, since, &mut out);
                }
            }
        }
        out.sort_by(|a, b| (a.date_modified, &a.file).cmp(&(b.date_modified, &b.file)));
        Ok(out)
    }

    /// Ciphertext bytes attributed to a user: blobs reachable from their
    /// gallery, trash and owned album filesets, each blob counted once.
    pub fn space_used(&self, user: u64) -> ServerResult<i64> {
        Ok(self.reachable_blob_sizes(user)?.values().sum())
    }

    fn check_quota(&self, user: u64, added: i64) -> ServerResult<()> {
        if added <= 0 {
            return Ok(());
        }
        if let Some(limit) = self.quota(user)? {
            if self.space_used(user)? + added > limit {
                return Err(ServerError::QuotaExceeded);
            }
        }
        Ok(())
    }

    pub(crate) fn reachable_blob_sizes(&self, user: u64) -> ServerResult<HashMap<String, i64>> {
        let mut blobs = HashMap::new();
        for (_, spec) in self.all_file_specs(user)? {
            if !spec.store_file.is_empty() {
                blobs.insert(spec.store_file.clone(), spec.store_file_size);
            }
            if !spec.store_thumb.is_empty() {
                blobs.insert(spec.store_thumb.clone(), spec.store_thumb_size);
            }
        }
        Ok(blobs)
    }

    /// Every record in the user's own storage: gallery, trash, and the
    /// filesets of albums the user owns.
    pub(crate) fn all_file_specs(&self, user: u64) -> ServerResult<Vec<(String, FileSpec)>> {
        let mut out = Vec::new();
        for set in [Set::Gallery, Set::Trash] {
            let fs: FileSet = self
                .store()
                .snapshot(&Db::fileset_key(user, set))?
                .unwrap_or_default();
            out.extend(fs.files.into_iter());
        }
        let refs: super::album::AlbumRefs = self
            .store()
            .snapshot(&Db::album_refs_key(user))?
            .unwrap_or_default();
        for aref in refs.albums.values() {
            if aref.owner_id != user {
                continue;
            }
            let fs: FileSet = self
                .store()
                .snapshot(&Db::album_files_key(user, &aref.album_id))?
                .unwrap_or_default();
            out.extend(fs.files.into_iter());
        }
        Ok(out)
    }

    /// Finds a record by server file name in any fileset the user can
    /// read, for download ACL checks.
    pub fn find_file(&self, user: u64, set: Set, album_id: Option<&str>, file_name: &str) -> ServerResult<FileSpec> {
        let resolved = self.resolve_set(user, set, album_id)?;
        let fs: FileSet = self
            .store()
            .snapshot(&resolved.key)?
            .unwrap_or_default();
        fs.files
            .get(file_name)
            .cloned()
            .ok_or(ServerError::NotFound)
    }

    /// Like `find_file`, but for signed downloads whose token names only
    /// the set: album records are searched across every membership.
    pub fn locate_file(&self, user: u64, set: Set, file_name: &str) -> ServerResult<FileSpec> {
        match set {
            Set::Gallery | Set::Trash => self.find_file(user, set, None, file_name),
            Set::Album => {
                let refs: super::album::AlbumRefs = self
                    .store()
                    .snapshot(&Db::album_refs_key(user))?
                    .unwrap_or_default();
                for aref in refs.albums.values() {
                    let fs: FileSet = self
                        .store()
                        .snapshot(&Db::album_files_key(aref.owner_id, &aref.album_id))?
                        .unwrap_or_default();
                    if let Some(spec) = fs.files.get(file_name) {
                        return Ok(spec.clone());
                    }
                }
                Err(ServerError::NotFound)
            }
        }
    }

    /// Blobs no fileset references. The offline collector's workhorse.
    pub fn find_orphan_blobs(&self) -> ServerResult<Vec<PathBuf>> {
        let mut referenced = HashSet::new();
        for user in self.user_ids()? {
            for (_, spec) in self.all_file_specs(user)? {
                if !spec.store_file.is_empty() {
                    referenced.insert(self.store().blob_path(&spec.store_file));
                }
                if !spec.store_thumb.is_empty() {
                    referenced.insert(self.store().blob_path(&spec.store_thumb));
                }
            }
        }
        Ok(self
            .store()
            .walk_blobs()?
            .into_iter()
            .filter(|p| !referenced.contains(p))
            .collect())
    }
}

fn collect_updates(fs: &FileSet, since: i64, out: &mut Vec<wire::FileRecord>) {
    for (name, spec) in &fs.files {
        if spec.date_modified <= since {
            continue;
        }
        out.push(wire::FileRecord {
            file: name.clone(),
            version: spec.version.clone(),
            date_created: spec.date_created,
            date_modified: spec.date_modified,
            headers: spec.headers.clone(),
            album_id: spec.album_id.clone(),
        });
    }
}
