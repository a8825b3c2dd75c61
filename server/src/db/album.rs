use super::{
    parse_permissions, Db, DeleteEntry, LockKey, RANK_ALBUM, RANK_ALBUM_FILES, RANK_ALBUM_REFS,
    RANK_CONTACTS, RANK_DELETES,
};
use crate::error::{ServerError, ServerResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use wire::delete_type;

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Album {
    pub album_id: String,
    pub owner_id: u64,
    pub date_created: i64,
    pub date_modified: i64,
    pub enc_private_key: String,
    pub metadata: String,
    pub public_key: String,
    /// member id → the album key sealed to that member by the sharing
    /// client. The owner's entry is empty; the owner is a member exactly
    /// while the album is shared.
    pub members: BTreeMap<u64, String>,
    pub permissions: String,
    pub is_hidden: bool,
    pub is_locked: bool,
    pub cover: String,
}

impl Album {
    pub fn is_shared(&self) -> bool {
        !self.members.is_empty()
    }

    pub fn is_member(&self, user: u64) -> bool {
        self.owner_id == user || self.members.contains_key(&user)
    }
}

/// One user's pointer at an album, own or shared.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AlbumRef {
    pub album_id: String,
    pub owner_id: u64,
    pub date_modified: i64,
}

#[derive(Serialize, Deserialize, Clone, Default, Debug)]
pub struct AlbumRefs {
    pub albums: HashMap<String, AlbumRef>,
}

impl Db {
    /// Loads an album on behalf of `user`, who must be its owner or a
    /// member.
    pub fn album(&self, user: u64, album_id: &str) -> ServerResult<Album> {
        let refs: AlbumRefs = self
            .store()
            .snapshot(&Db::album_refs_key(user))?
            .unwrap_or_default();
        let aref = refs.albums.get(album_id).ok_or(ServerError::NotFound)?;
        let album: Album = self
            .store()
            .snapshot(&Db::album_key(aref.owner_id, album_id))?
            .ok_or(ServerError::NotFound)?;
        if !album.is_member(user) {
            return Err(ServerError::NotAuthorized);
        }
        Ok(album)
    }

    pub fn add_album(&self, owner: u64, p: &wire::AddAlbumParams) -> ServerResult<Album> {
        if p.album_id.is_empty() || p.album_id.len() > 128 {
            return Err(ServerError::BadRequest);
        }
        let now = self.now_ms();
        let album = Album {
            album_id: p.album_id.clone(),
            owner_id: owner,
            date_created: if p.date_created > 0 { p.date_created } else { now },
            date_modified: now,
            enc_private_key: p.enc_private_key.clone(),
            metadata: p.metadata.clone(),
            public_key: p.public_key.clone(),
            members: BTreeMap::new(),
            permissions: wire::Permissions::default().to_wire(),
            is_hidden: false,
            is_locked: false,
            cover: String::new(),
        };

        let locks = self.lock_all(vec![
            LockKey {
                user: owner,
                rank: RANK_ALBUM_REFS,
                key: Db::album_refs_key(owner),
            },
            LockKey {
                user: owner,
                rank: RANK_ALBUM,
                key: Db::album_key(owner, &p.album_id),
            },
        ]);

        let mut refs: AlbumRefs = self
            .store()
            .snapshot(&Db::album_refs_key(owner))?
            .unwrap_or_default();
        if refs.albums.contains_key(&p.album_id) {
            return Err(ServerError::BadRequest);
        }

        self.store().put(&Db::album_key(owner, &p.album_id), &album)?;
        self.store()
            .create_empty::<super::FileSet>(&Db::album_files_key(owner, &p.album_id))?;
        refs.albums.insert(
            p.album_id.clone(),
            AlbumRef {
                album_id: p.album_id.clone(),
                owner_id: owner,
                date_modified: now,
            },
        );
        self.store().put(&Db::album_refs_key(owner), &refs)?;
        drop(locks);
        Ok(album)
    }

    /// Owner-only. Every member, the owner included, gets an album
    /// tombstone so all their devices drop the album.
    pub fn delete_album(&self, caller: u64, album_id: &str) -> ServerResult<()> {
        let album = self.album(caller, album_id)?;
        if album.owner_id != caller {
            return Err(ServerError::NotAuthorized);
        }
        let now = self.now_ms();

        let mut affected: Vec<u64> = album.members.keys().copied().collect();
        if !affected.contains(&caller) {
            affected.push(caller);
        }

        let mut keys = vec![
            LockKey {
                user: album.owner_id,
                rank: RANK_ALBUM,
                key: Db::album_key(album.owner_id, album_id),
            },
            LockKey {
                user: album.owner_id,
                rank: RANK_ALBUM_FILES,
                key: Db::album_files_key(album.owner_id, album_id),
            },
        ];
        for &u in &affected {
            keys.push(LockKey {
                user: u,
                rank: RANK_ALBUM_REFS,
                key: Db::album_refs_key(u),
            });
            keys.push(LockKey {
                user: u,
                rank: RANK_DELETES,
                key: Db::deletes_key(u),
            });
        }
        let locks = self.lock_all(keys);

        for &u in &affected {
            let mut refs: AlbumRefs = self
                .store()
                .snapshot(&Db::album_refs_key(u))?
                .unwrap_or_default();
            if refs.albums.remove(album_id).is_some() {
                self.store().put(&Db::album_refs_key(u), &refs)?;
            }
            self.append_tombstone(
                u,
                DeleteEntry {
                    file: String::new(),
                    album_id: album_id.to_string(),
                    kind: delete_type::ALBUM,
                    date: now,
                },
            )?;
        }

        self.store()
            .delete_locked(&Db::album_files_key(album.owner_id, album_id))?;
        self.store()
            .delete_locked(&Db::album_key(album.owner_id, album_id))?;
        drop(locks);
        Ok(())
    }

    pub fn change_album_cover(&self, caller: u64, album_id: &str, cover: &str) -> ServerResult<()> {
        self.mutate_album_as_owner(caller, album_id, |album| {
            album.cover = cover.to_string();
            Ok(())
        })
    }

    pub fn change_metadata(&self, caller: u64, album_id: &str, metadata: &str) -> ServerResult<()> {
        self.mutate_album_as_owner(caller, album_id, |album| {
            album.metadata = metadata.to_string();
            Ok(())
        })
    }

    pub fn update_perms(&self, caller: u64, album_id: &str, permissions: &str) -> ServerResult<()> {
        parse_permissions(permissions)?;
        self.mutate_album_as_owner(caller, album_id, |album| {
            album.permissions = permissions.to_string();
            Ok(())
        })
    }

    /// Adds members. Allowed for the owner, and for members holding the
    /// share permission; only the owner may change the permission bits.
    pub fn share_album(&self, caller: u64, p: &wire::ShareAlbumParams) -> ServerResult<()> {
        let album = self.album(caller, &p.album_id)?;
        let perms = parse_permissions(&album.permissions)?;
        if album.owner_id != caller && !perms.allow_share {
            return Err(ServerError::Denied(
                "Sharing this album is not permitted",
            ));
        }
        if album.owner_id != caller && !p.permissions.is_empty() && p.permissions != album.permissions
        {
            return Err(ServerError::NotAuthorized);
        }

        let mut new_members: Vec<&wire::SharingKey> = Vec::new();
        for key in &p.keys {
            if key.user_id == album.owner_id || album.members.contains_key(&key.user_id) {
                continue;
            }
            if self.user_by_id(key.user_id)?.is_none() {
                return Err(ServerError::NotFound);
            }
            new_members.push(key);
        }

        let now = self.now_ms();
        let mut involved: Vec<u64> = album.members.keys().copied().collect();
        involved.push(album.owner_id);
        involved.push(caller);
        involved.extend(new_members.iter().map(|k| k.user_id));
        involved.sort_unstable();
        involved.dedup();

        let mut keys = vec![LockKey {
            user: album.owner_id,
            rank: RANK_ALBUM,
            key: Db::album_key(album.owner_id, &p.album_id),
        }];
        for &u in &involved {
            keys.push(LockKey {
                user: u,
                rank: RANK_ALBUM_REFS,
                key: Db::album_refs_key(u),
            });
            keys.push(LockKey {
                user: u,
                rank: RANK_CONTACTS,
                key: Db::contacts_key(u),
            });
        }
        let locks = self.lock_all(keys);

        // Re-read under the lock; the permission decision above stands.
        let mut album: Album = self
            .store()
            .snapshot(&Db::album_key(album.owner_id, &p.album_id))?
            .ok_or(ServerError::NotFound)?;

        if album.members.is_empty() {
            album.members.insert(album.owner_id, String::new());
        }
        for key in &new_members {
            album
                .members
                .insert(key.user_id, key.enc_album_key.clone());
        }
        if album.owner_id == caller && !p.permissions.is_empty() {
            parse_permissions(&p.permissions)?;
            album.permissions = p.permissions.clone();
        }
        album.date_modified = now;
        self.store()
            .put(&Db::album_key(album.owner_id, &p.album_id), &album)?;

        // Every member's ref bumps so all devices refresh the album.
        let member_ids: Vec<u64> = album.members.keys().copied().collect();
        for &u in &member_ids {
            self.touch_album_ref(u, &album, now)?;
        }

        // New members and the sharer/owner learn about each other.
        for key in &new_members {
            self.link_contacts(key.user_id, album.owner_id, now)?;
            if caller != album.owner_id {
                self.link_contacts(key.user_id, caller, now)?;
            }
        }
        drop(locks);
        Ok(())
    }

    /// Owner removes one member.
    pub fn remove_album_member(&self, caller: u64, album_id: &str, member: u64) -> ServerResult<()> {
        let album = self.album(caller, album_id)?;
        if album.owner_id != caller {
            return Err(ServerError::NotAuthorized);
        }
        if member == album.owner_id {
            return Err(ServerError::BadRequest);
        }
        self.remove_members(&album, &[member])
    }

    /// A member removes itself.
    pub fn leave_album(&self, caller: u64, album_id: &str) -> ServerResult<()> {
        let album = self.album(caller, album_id)?;
        if album.owner_id == caller {
            return Err(ServerError::BadRequest);
        }
        self.remove_members(&album, &[caller])
    }

    /// Owner removes everyone.
    pub fn unshare_album(&self, caller: u64, album_id: &str) -> ServerResult<()> {
        let album = self.album(caller, album_id)?;
        if album.owner_id != caller {
            return Err(ServerError::NotAuthorized);
        }
        let members: Vec<u64> = album
            .members
            .keys()
            .copied()
            .filter(|&u| u != album.owner_id)
            .collect();
        self.remove_members(&album, &members)
    }

    fn remove_members(&self, album: &Album, removed: &[u64]) -> ServerResult<()> {
        let now = self.now_ms();

        let mut keys = vec![LockKey {
            user: album.owner_id,
            rank: RANK_ALBUM,
            key: Db::album_key(album.owner_id, &album.album_id),
        }];
        let mut involved: Vec<u64> = album.members.keys().copied().collect();
        involved.push(album.owner_id);
        involved.sort_unstable();
        involved.dedup();
        for &u in &involved {
            keys.push(LockKey {
                user: u,
                rank: RANK_ALBUM_REFS,
                key: Db::album_refs_key(u),
            });
        }
        for &u in removed {
            keys.push(LockKey {
                user: u,
                rank: RANK_DELETES,
                key: Db::deletes_key(u),
            });
        }
        let locks = self.lock_all(keys);

        let mut album: Album = self
            .store()
            .snapshot(&Db::album_key(album.owner_id, &album.album_id))?
            .ok_or(ServerError::NotFound)?;

        for &u in removed {
            if album.members.remove(&u).is_none() {
                continue;
            }
            let mut refs: AlbumRefs = self
                .store()
                .snapshot(&Db::album_refs_key(u))?
                .unwrap_or_default();
            if refs.albums.remove(&album.album_id).is_some() {
                self.store().put(&Db::album_refs_key(u), &refs)?;
            }
            self.append_tombstone(
                u,
                DeleteEntry {
                    file: String::new(),
                    album_id: album.album_id.clone(),
                    kind: delete_type::UNSHARE,
                    date: now,
                },
            )?;
        }

        // An album whose only remaining member is the owner is no longer
        // shared.
        if album.members.len() == 1 && album.members.contains_key(&album.owner_id) {
            album.members.clear();
        }
        album.date_modified = now;
        self.store()
            .put(&Db::album_key(album.owner_id, &album.album_id), &album)?;

        let remaining: Vec<u64> = if album.members.is_empty() {
            vec![album.owner_id]
        } else {
            album.members.keys().copied().collect()
        };
        for &u in &remaining {
            self.touch_album_ref(u, &album, now)?;
        }
        drop(locks);
        Ok(())
    }

    /// Entries of the user's album refs newer than `since`, resolved into
    /// wire records.
    pub fn album_updates(&self, user: u64, since: i64) -> ServerResult<Vec<wire::AlbumRecord>> {
        let refs: AlbumRefs = self
            .store()
            .snapshot(&Db::album_refs_key(user))?
            .unwrap_or_default();

        let mut out = Vec::new();
        for aref in refs.albums.values() {
            if aref.date_modified <= since {
                continue;
            }
            let album: Album = match self
                .store()
                .snapshot(&Db::album_key(aref.owner_id, &aref.album_id))?
            {
                Some(a) => a,
                None => continue,
            };
            out.push(wire_album(user, &album, aref.date_modified));
        }
        out.sort_by(|a, b| a.date_modified.cmp(&b.date_modified));
        Ok(out)
    }

    fn mutate_album_as_owner<F>(&self, caller: u64, album_id: &str, f: F) -> ServerResult<()>
    where
        F: FnOnce(&mut Album) -> ServerResult<()>,
    {
        let album = self.album(caller, album_id)?;
        if album.owner_id != caller {
            return Err(ServerError::NotAuthorized);
        }
        let now = self.now_ms();

        let mut keys = vec![LockKey {
            user: album.owner_id,
            rank: RANK_ALBUM,
            key: Db::album_key(album.owner_id, album_id),
        }];
        let mut involved: Vec<u64> = album.members.keys().copied().collect();
        involved.push(album.owner_id);
        involved.sort_unstable();
        involved.dedup();
        for &u in &involved {
            keys.push(LockKey {
                user: u,
                rank: RANK_ALBUM_REFS,
                key: Db::album_refs_key(u),
            });
        }
        let locks = self.lock_all(keys);

        let mut album: Album = self
            .store()
            .snapshot(&Db::album_key(album.owner_id, album_id))?
            .ok_or(ServerError::NotFound)?;
        f(&mut album)?;
        album.date_modified = now;
        self.store()
            .put(&Db::album_key(album.owner_id, album_id), &album)?;

        for &u in &involved {
            self.touch_album_ref(u, &album, now)?;
        }
        drop(locks);
        Ok(())
    }

    /// Bumps (or creates) a user's ref for an album. Caller holds the
    /// user's album-refs lock.
    fn touch_album_ref(&self, user: u64, album: &Album, now: i64) -> ServerResult<()> {
        let mut refs: AlbumRefs = self
            .store()
            .snapshot(&Db::album_refs_key(user))?
            .unwrap_or_default();
        refs.albums.insert(
            album.album_id.clone(),
            AlbumRef {
                album_id: album.album_id.clone(),
                owner_id: album.owner_id,
                date_modified: now,
            },
        );
        self.store().put(&Db::album_refs_key(user), &refs)
    }
}

pub(crate) fn wire_album(user: u64, album: &Album, date_modified: i64) -> wire::AlbumRecord {
    let flag = |b: bool| if b { "1" } else { "0" }.to_string();
    let is_owner = album.owner_id == user;
    let enc_private_key = if is_owner {
        album.enc_private_key.clone()
    } else {
        album.members.get(&user).cloned().unwrap_or_default()
    };
    let mut member_ids: Vec<String> = album.members.keys().map(|id| id.to_string()).collect();
    member_ids.sort();

    wire::AlbumRecord {
        album_id: album.album_id.clone(),
        date_created: album.date_created,
        date_modified,
        enc_private_key,
        metadata: album.metadata.clone(),
        public_key: album.public_key.clone(),
        is_shared: flag(album.is_shared()),
        is_hidden: flag(album.is_hidden),
        is_owner: flag(is_owner),
        is_locked: flag(album.is_locked),
        permissions: album.permissions.clone(),
        members: member_ids.join(","),
        cover: album.cover.clone(),
    }
}
