use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Cow;

/// Header clients use to advertise optional protocol features.
pub const CAPABILITIES_HEADER: &str = "X-c2FmZQ-capabilities";
pub const CAPABILITY_MFA: &str = "mfa";

pub const SCOPE_SESSION: &str = "session";
pub const SCOPE_DOWNLOAD: &str = "download";

/// Error string appended to a `getUpdates` payload when the client's
/// deletion cursor is older than the tombstone floor.
pub const OUT_OF_SYNC: &str = "out-of-sync";

/// Tombstone types carried in the `deletes` collection.
pub mod delete_type {
    /// File removed from a gallery or album fileset.
    pub const FILE: u8 = 1;
    /// File removed from the trash fileset.
    pub const TRASH: u8 = 2;
    /// Album deleted by its owner.
    pub const ALBUM: u8 = 3;
    /// Album unshared, or a member removed / left.
    pub const UNSHARE: u8 = 4;
    /// Contact removed.
    pub const CONTACT: u8 = 5;
}

pub trait IntoOwned {
    type Owned;
    fn into_owned(self) -> Self::Owned;
}

/// The fileset a file record lives in.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Set {
    Gallery,
    Trash,
    Album,
}

impl Set {
    pub fn from_wire(s: &str) -> Option<Set> {
        match s {
            "0" => Some(Set::Gallery),
            "1" => Some(Set::Trash),
            "2" => Some(Set::Album),
            _ => None,
        }
    }

    pub fn to_wire(self) -> &'static str {
        match self {
            Set::Gallery => "0",
            Set::Trash => "1",
            Set::Album => "2",
        }
    }
}

/// Album permission bits granted to non-owner members.
///
/// The wire format is a four character string of `'0'`/`'1'`: a version
/// character (always `'1'`) followed by the add, share and copy bits. The
/// string round-trips bit for bit for client compatibility.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Permissions {
    pub allow_add: bool,
    pub allow_share: bool,
    pub allow_copy: bool,
}

impl Permissions {
    pub fn from_wire(s: &str) -> Option<Permissions> {
        let b = s.as_bytes();
        if b.len() != 4 || b[0] != b'1' {
            return None;
        }
        let bit = |c: u8| match c {
            b'0' => Some(false),
            b'1' => Some(true),
            _ => None,
        };
        Some(Permissions {
            allow_add: bit(b[1])?,
            allow_share: bit(b[2])?,
            allow_copy: bit(b[3])?,
        })
    }

    pub fn to_wire(self) -> String {
        let bit = |b: bool| if b { '1' } else { '0' };
        [
            '1',
            bit(self.allow_add),
            bit(self.allow_share),
            bit(self.allow_copy),
        ]
        .iter()
        .collect()
    }
}

/// Every endpoint answers with this envelope.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Response {
    pub status: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parts: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub infos: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl Response {
    pub fn ok() -> Response {
        Response {
            status: "ok".to_string(),
            parts: Map::new(),
            infos: vec![],
            errors: vec![],
        }
    }

    pub fn nok() -> Response {
        Response {
            status: "nok".to_string(),
            parts: Map::new(),
            infos: vec![],
            errors: vec![],
        }
    }

    pub fn part<T: Serialize>(mut self, name: &str, value: T) -> Response {
        // Serialization of our own wire types cannot fail.
        let value = serde_json::to_value(value).expect("part serialization");
        self.parts.insert(name.to_string(), value);
        self
    }

    pub fn info(mut self, msg: impl Into<String>) -> Response {
        self.infos.push(msg.into());
        self
    }

    pub fn error(mut self, msg: impl Into<String>) -> Response {
        self.errors.push(msg.into());
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// A file record as it appears in `getUpdates` collections.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FileRecord {
    pub file: String,
    pub version: String,
    #[serde(rename = "dateCreated")]
    pub date_created: i64,
    #[serde(rename = "dateModified")]
    pub date_modified: i64,
    pub headers: String,
    #[serde(rename = "albumId", skip_serializing_if = "Option::is_none")]
    pub album_id: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AlbumRecord {
    #[serde(rename = "albumId")]
    pub album_id: String,
    #[serde(rename = "dateCreated")]
    pub date_created: i64,
    #[serde(rename = "dateModified")]
    pub date_modified: i64,
    #[serde(rename = "encPrivateKey")]
    pub enc_private_key: String,
    pub metadata: String,
    #[serde(rename = "publicKey")]
    pub public_key: String,
    #[serde(rename = "isShared")]
    pub is_shared: String,
    #[serde(rename = "isHidden")]
    pub is_hidden: String,
    #[serde(rename = "isOwner")]
    pub is_owner: String,
    #[serde(rename = "isLocked")]
    pub is_locked: String,
    pub permissions: String,
    /// Comma separated list of member user ids.
    pub members: String,
    pub cover: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ContactRecord {
    #[serde(rename = "userId")]
    pub user_id: String,
    pub email: String,
    #[serde(rename = "publicKey")]
    pub public_key: String,
    #[serde(rename = "dateModified")]
    pub date_modified: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DeleteRecord {
    pub file: String,
    #[serde(rename = "albumId")]
    pub album_id: String,
    #[serde(rename = "type")]
    pub kind: u8,
    pub date: i64,
}

// Request parameter objects. Authenticated endpoints carry these sealed to
// the user's server public key inside the `params` form field; the handful
// of pre-auth endpoints send them as plain form fields.

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CreateAccountParams<'a> {
    #[serde(borrow)]
    pub email: Cow<'a, str>,
    #[serde(borrow)]
    pub password: Cow<'a, str>,
    #[serde(borrow)]
    pub salt: Cow<'a, str>,
    #[serde(borrow, rename = "keyBundle")]
    pub key_bundle: Cow<'a, str>,
}

impl<'a> IntoOwned for CreateAccountParams<'a> {
    type Owned = CreateAccountParams<'static>;

    fn into_owned(self) -> Self::Owned {
        CreateAccountParams {
            email: Cow::Owned(self.email.into_owned()),
            password: Cow::Owned(self.password.into_owned()),
            salt: Cow::Owned(self.salt.into_owned()),
            key_bundle: Cow::Owned(self.key_bundle.into_owned()),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct GetUpdatesParams {
    #[serde(rename = "filesST")]
    pub files_st: i64,
    #[serde(rename = "trashST")]
    pub trash_st: i64,
    #[serde(rename = "albumsST")]
    pub albums_st: i64,
    #[serde(rename = "albumFilesST")]
    pub album_files_st: i64,
    #[serde(rename = "cntST")]
    pub cnt_st: i64,
    #[serde(rename = "delST")]
    pub del_st: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MoveFileParams {
    #[serde(rename = "setFrom")]
    pub set_from: String,
    #[serde(rename = "setTo")]
    pub set_to: String,
    #[serde(rename = "albumIdFrom", default)]
    pub album_id_from: String,
    #[serde(rename = "albumIdTo", default)]
    pub album_id_to: String,
    #[serde(rename = "isMoving")]
    pub is_moving: String,
    pub filenames: Vec<String>,
    #[serde(default)]
    pub headers: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AddAlbumParams {
    #[serde(rename = "albumId")]
    pub album_id: String,
    #[serde(rename = "dateCreated")]
    pub date_created: i64,
    #[serde(rename = "dateModified")]
    pub date_modified: i64,
    #[serde(rename = "encPrivateKey")]
    pub enc_private_key: String,
    pub metadata: String,
    #[serde(rename = "publicKey")]
    pub public_key: String,
}

/// One member's copy of the album key, sealed by the sharing client.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SharingKey {
    #[serde(rename = "userId")]
    pub user_id: u64,
    #[serde(rename = "encAlbumKey")]
    pub enc_album_key: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ShareAlbumParams {
    #[serde(rename = "albumId")]
    pub album_id: String,
    pub permissions: String,
    pub keys: Vec<SharingKey>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DownloadTarget {
    pub filename: String,
    pub set: String,
    #[serde(default)]
    pub thumb: bool,
}
