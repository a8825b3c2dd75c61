use super::Db;
use crate::error::ServerResult;
use serde::Serialize;
use wire::{GetUpdatesParams, Set};

/// Everything a device needs to catch up from its six cursors.
#[derive(Serialize, Clone, Debug)]
pub struct Updates {
    pub files: Vec<wire::FileRecord>,
    pub trash: Vec<wire::FileRecord>,
    pub albums: Vec<wire::AlbumRecord>,
    #[serde(rename = "albumFiles")]
    pub album_files: Vec<wire::FileRecord>,
    pub contacts: Vec<wire::ContactRecord>,
    pub deletes: Vec<wire::DeleteRecord>,
    #[serde(rename = "spaceUsed")]
    pub space_used: i64,
    #[serde(rename = "spaceQuota")]
    pub space_quota: i64,
    #[serde(skip)]
    pub out_of_sync: bool,
}

impl Db {
    /// Assembles one incremental sync response. Entries are strictly newer
    /// than their cursor, so a client that reissues with the maximum
    /// `date_modified` it received never sees the same entry twice. A
    /// failure reading any sub-aggregate fails the whole call; a partial
    /// view must not look complete.
    pub fn get_updates(&self, user: u64, cursors: &GetUpdatesParams) -> ServerResult<Updates> {
        let files = self.file_updates(user, Set::Gallery, cursors.files_st)?;
        let trash = self.file_updates(user, Set::Trash, cursors.trash_st)?;
        let albums = self.album_updates(user, cursors.albums_st)?;
        let album_files = self.file_updates(user, Set::Album, cursors.album_files_st)?;
        let contacts = self.contact_updates(user, cursors.cnt_st)?;
        let (deletes, out_of_sync) = self.delete_updates(user, cursors.del_st)?;

        Ok(Updates {
            files,
            trash,
            albums,
            album_files,
            contacts,
            deletes,
            space_used: self.space_used(user)?,
            space_quota: self.quota(user)?.unwrap_or(-1),
            out_of_sync,
        })
    }
}
