//! Encrypted, path-keyed storage over a single data directory.
//!
//! Logical keys are path-like strings. Each object lands at
//! `metadata/<h[..2]>/<h>` where `h` is the SHA-1 of the key, so the
//! on-disk tree depends only on logical state, never on user-supplied
//! names. Objects are bincode records wrapped in the `KRIN` stream
//! envelope with the physical path as AEAD context.
//!
//! Updates hold a per-path advisory lock, write a temp file, fsync and
//! rename over the original; on any error before the rename the original
//! is intact and the temp file is removed. Blobs live under `blobs/` in
//! the same envelope and move in from the upload area by rename.

use crate::crypto::stream::{is_decrypt_failure, StreamReader, StreamWriter};
use crate::crypto::MasterKey;
use crate::error::{ServerError, ServerResult};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

const METADATA_DIR: &str = "metadata";
const BLOB_DIR: &str = "blobs";
const UPLOAD_DIR: &str = "uploads";

pub struct SecureStore {
    data_dir: PathBuf,
    master: Arc<MasterKey>,
    locks: std::sync::Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Held for the duration of an exclusive update of one logical key.
pub struct PathLock {
    _guard: OwnedMutexGuard<()>,
}

impl SecureStore {
    pub fn new(data_dir: impl Into<PathBuf>, master: Arc<MasterKey>) -> ServerResult<SecureStore> {
        let data_dir = data_dir.into();
        fs::create_dir_all(data_dir.join(METADATA_DIR))?;
        fs::create_dir_all(data_dir.join(BLOB_DIR))?;
        fs::create_dir_all(data_dir.join(UPLOAD_DIR))?;
        Ok(SecureStore {
            data_dir,
            master,
            locks: std::sync::Mutex::new(HashMap::new()),
        })
    }

    pub fn master(&self) -> &MasterKey {
        &self.master
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Canonical digest used both for key-to-path derivation and as the
    /// stable token-hash primitive.
    pub fn hash_string(s: &str) -> String {
        let digest = Sha1::digest(s.as_bytes());
        let mut out = String::with_capacity(40);
        for b in digest {
            out.push_str(&format!("{:02x}", b));
        }
        out
    }

    fn rel_path(kind: &str, hashed: &str) -> String {
        format!("{}/{}/{}", kind, &hashed[..2], hashed)
    }

    fn object_rel(key: &str) -> String {
        Self::rel_path(METADATA_DIR, &Self::hash_string(key))
    }

    fn context_for(rel: &str) -> [u8; 20] {
        Sha1::digest(rel.as_bytes()).into()
    }

    fn abs(&self, rel: &str) -> PathBuf {
        self.data_dir.join(rel)
    }

    /// Physical location of a logical key, for offline tools that walk
    /// the tree.
    pub fn object_path(&self, key: &str) -> PathBuf {
        self.abs(&Self::object_rel(key))
    }

    /// Acquires the advisory lock for a logical key. Concurrent updates of
    /// the same key block in FIFO order. Callers locking several keys must
    /// acquire them in one canonical order.
    pub fn lock(&self, key: &str) -> PathLock {
        let mutex = {
            let mut locks = self.locks.lock().unwrap();
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        PathLock {
            _guard: mutex.blocking_lock_owned(),
        }
    }

    fn read_object(&self, rel: &str) -> ServerResult<Option<Vec<u8>>> {
        let path = self.abs(rel);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut reader = StreamReader::new(&self.master, Self::context_for(rel), file)?;
        let mut out = Vec::new();
        reader.read_to_end(&mut out).map_err(|e| {
            if is_decrypt_failure(&e) {
                ServerError::DecryptFailed
            } else {
                ServerError::Io(e)
            }
        })?;
        Ok(Some(out))
    }

    fn write_object(&self, rel: &str, data: &[u8]) -> ServerResult<()> {
        let path = self.abs(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension(format!("tmp{}", rand::thread_rng().gen::<u32>()));

        let result = (|| -> ServerResult<()> {
            let file = File::create(&tmp)?;
            let mut writer = StreamWriter::new(&self.master, Self::context_for(rel), file)?;
            writer.write_all(data)?;
            let (file, _) = writer.finish()?;
            file.sync_all()?;
            fs::rename(&tmp, &path)?;
            Ok(())
        })();

        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result
    }

    /// Deserializes the current version of an object; no lock is held once
    /// the read returns.
    pub fn snapshot<T: DeserializeOwned>(&self, key: &str) -> ServerResult<Option<T>> {
        match self.read_object(&Self::object_rel(key))? {
            None => Ok(None),
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
        }
    }

    /// Commits an object. The caller must hold the path's lock when the
    /// write races other writers of the same key.
    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> ServerResult<()> {
        self.write_object(&Self::object_rel(key), &bincode::serialize(value)?)
    }

    /// Lock, read, mutate, commit. The closure sees `None` for an object
    /// that does not exist yet; an error from the closure leaves the
    /// original untouched.
    pub fn update<T, F>(&self, key: &str, f: F) -> ServerResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<T>) -> ServerResult<T>,
    {
        let _lock = self.lock(key);
        let current = self.snapshot(key)?;
        let next = f(current)?;
        self.put(key, &next)?;
        Ok(next)
    }

    /// Idempotent aggregate initialization. Existence is judged by the
    /// file alone; an object that exists but does not decrypt must not be
    /// clobbered with an empty one.
    pub fn create_empty<T>(&self, key: &str) -> ServerResult<()>
    where
        T: Serialize + DeserializeOwned + Default,
    {
        let _lock = self.lock(key);
        if !self.exists(key) {
            self.put(key, &T::default())?;
        }
        Ok(())
    }

    pub fn delete(&self, key: &str) -> ServerResult<()> {
        let _lock = self.lock(key);
        self.delete_locked(key)
    }

    /// Removal for callers that already hold the path's lock; calling
    /// `delete` there would deadlock on the non-reentrant path mutex.
    pub fn delete_locked(&self, key: &str) -> ServerResult<()> {
        match fs::remove_file(self.abs(&Self::object_rel(key))) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn exists(&self, key: &str) -> bool {
        self.abs(&Self::object_rel(key)).exists()
    }

    // Blob handling. Blob names are server-generated random opaque
    // strings, so a blob keeps its name while records move between
    // filesets.

    pub fn new_blob_name() -> String {
        let bytes: Vec<u8> = (0..24).map(|_| rand::thread_rng().gen()).collect();
        base64::encode_config(bytes, base64::URL_SAFE_NO_PAD)
    }

    fn blob_rel(name: &str) -> String {
        Self::rel_path(BLOB_DIR, &Self::hash_string(name))
    }

    pub fn blob_path(&self, name: &str) -> PathBuf {
        self.abs(&Self::blob_rel(name))
    }

    pub fn upload_dir(&self) -> PathBuf {
        self.data_dir.join(UPLOAD_DIR)
    }

    /// Opens a stream writer for a new blob, spooled in the upload area
    /// under its final name's envelope context so the commit is a rename.
    pub fn blob_writer(&self, name: &str) -> ServerResult<(PathBuf, StreamWriter<File>)> {
        let tmp = self
            .upload_dir()
            .join(format!("tmp-{}", Self::hash_string(name)));
        let file = File::create(&tmp)?;
        let writer = StreamWriter::new(&self.master, Self::context_for(&Self::blob_rel(name)), file)?;
        Ok((tmp, writer))
    }

    pub fn import_blob(&self, tmp: &Path, name: &str) -> ServerResult<()> {
        let dest = self.blob_path(name);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(tmp, dest)?;
        Ok(())
    }

    pub fn blob_reader(&self, name: &str) -> ServerResult<StreamReader<File>> {
        let rel = Self::blob_rel(name);
        let file = match File::open(self.abs(&rel)) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ServerError::NotFound)
            }
            Err(e) => return Err(e.into()),
        };
        StreamReader::new(&self.master, Self::context_for(&rel), file)
    }

    /// Bytes a reader of this blob will yield, computed from the envelope
    /// geometry without decrypting anything.
    pub fn blob_plaintext_size(&self, name: &str) -> ServerResult<u64> {
        use crate::crypto::stream::{frame_overhead, FULL_FRAME_LEN};

        let path = self.blob_path(name);
        let meta = match fs::metadata(&path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ServerError::NotFound)
            }
            Err(e) => return Err(e.into()),
        };
        let mut header = [0u8; 7];
        {
            use std::io::Read;
            File::open(&path)?.read_exact(&mut header)?;
        }
        let klen = u16::from_be_bytes([header[5], header[6]]) as u64;
        let body = meta
            .len()
            .checked_sub(7 + klen)
            .ok_or(ServerError::DecryptFailed)?;

        let full_frames = body / FULL_FRAME_LEN;
        let rest = body % FULL_FRAME_LEN;
        if rest < frame_overhead() {
            return Err(ServerError::DecryptFailed);
        }
        Ok(full_frames * crate::crypto::CHUNK_SIZE as u64 + (rest - frame_overhead()))
    }

    pub fn delete_blob(&self, name: &str) -> ServerResult<()> {
        match fs::remove_file(self.blob_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Physical paths of all blobs, for the offline orphan collector.
    pub fn walk_blobs(&self) -> ServerResult<Vec<PathBuf>> {
        walk_files(&self.data_dir.join(BLOB_DIR))
    }

    /// Physical paths of every `KRIN` object except the master key file,
    /// for offline key-format conversion.
    pub fn walk_objects(&self) -> ServerResult<Vec<PathBuf>> {
        let mut out = walk_files(&self.data_dir.join(METADATA_DIR))?;
        out.extend(walk_files(&self.data_dir.join(BLOB_DIR))?);
        Ok(out)
    }

    /// Removes spooled upload files left behind by a crash.
    pub fn clean_uploads(&self) -> ServerResult<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(self.upload_dir())? {
            let entry = entry?;
            if fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Context for a physical path, as used by the conversion tool when it
    /// re-encrypts objects in place.
    pub fn context_for_physical(&self, path: &Path) -> ServerResult<[u8; 20]> {
        let rel = path
            .strip_prefix(&self.data_dir)
            .map_err(|_| ServerError::BadRequest)?;
        let rel = rel.to_str().ok_or(ServerError::BadRequest)?;
        Ok(Self::context_for(rel))
    }
}

fn walk_files(dir: &Path) -> ServerResult<Vec<PathBuf>> {
    let mut out = Vec::new();
    if !dir.exists() {
        return Ok(out);
    }
    let mut stack = vec![dir.to_path_buf()];
    while let Some(d) = stack.pop() {
        for entry in fs::read_dir(&d)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                stack.push(path);
            } else {
                out.push(path);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypto::Algorithm;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Default, PartialEq, Debug, Clone)]
    struct Record {
        count: u64,
        label: String,
    }

    fn store() -> (tempfile::TempDir, SecureStore) {
        let dir = tempfile::tempdir().unwrap();
        let master = Arc::new(MasterKey::random(Algorithm::Aes256Gcm));
        let store = SecureStore::new(dir.path(), master).unwrap();
        (dir, store)
    }

    #[test]
    fn snapshot_of_missing_is_none() {
        let (_dir, store) = store();
        assert_eq!(store.snapshot::<Record>("users/1/user").unwrap(), None);
    }

    #[test]
    fn update_then_snapshot() {
        let (_dir, store) = store();

        store
            .update::<Record, _>("users/1/user", |cur| {
                assert!(cur.is_none());
                Ok(Record {
                    count: 1,
                    label: "a".into(),
                })
            })
            .unwrap();

        let rec: Record = store.snapshot("users/1/user").unwrap().unwrap();
        assert_eq!(rec.count, 1);

        store
            .update::<Record, _>("users/1/user", |cur| {
                let mut rec = cur.unwrap();
                rec.count += 1;
                Ok(rec)
            })
            .unwrap();
        let rec: Record = store.snapshot("users/1/user").unwrap().unwrap();
        assert_eq!(rec.count, 2);
    }

    #[test]
    fn failed_update_leaves_original() {
        let (_dir, store) = store();
        store
            .update::<Record, _>("k", |_| {
                Ok(Record {
                    count: 7,
                    label: "keep".into(),
                })
            })
            .unwrap();

        let err = store.update::<Record, _>("k", |_| Err(ServerError::BadRequest));
        assert!(err.is_err());

        let rec: Record = store.snapshot("k").unwrap().unwrap();
        assert_eq!(rec.count, 7);
    }

    #[test]
    fn create_empty_is_idempotent() {
        let (_dir, store) = store();
        store.create_empty::<Record>("agg").unwrap();
        store
            .update::<Record, _>("agg", |cur| {
                let mut rec = cur.unwrap();
                rec.count = 9;
                Ok(rec)
            })
            .unwrap();
        store.create_empty::<Record>("agg").unwrap();
        let rec: Record = store.snapshot("agg").unwrap().unwrap();
        assert_eq!(rec.count, 9);
    }

    #[test]
    fn object_files_are_enveloped_and_hashed() {
        let (dir, store) = store();
        store
            .update::<Record, _>("secret/name", |_| Ok(Record::default()))
            .unwrap();

        let hashed = SecureStore::hash_string("secret/name");
        let path = dir
            .path()
            .join(METADATA_DIR)
            .join(&hashed[..2])
            .join(&hashed);
        let raw = std::fs::read(path).unwrap();
        assert_eq!(&raw[..4], b"KRIN");
        // Nothing about the logical key is visible on disk.
        assert!(!raw.windows(6).any(|w| w == b"secret"));
    }

    #[test]
    fn blob_round_trip_via_rename() {
        let (_dir, store) = store();
        let name = SecureStore::new_blob_name();

        let (tmp, mut writer) = store.blob_writer(&name).unwrap();
        writer.write_all(b"ciphertext from a client").unwrap();
        let (file, total) = writer.finish().unwrap();
        file.sync_all().unwrap();
        assert!(total > 0);
        store.import_blob(&tmp, &name).unwrap();

        let mut out = Vec::new();
        store
            .blob_reader(&name)
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, b"ciphertext from a client");

        store.delete_blob(&name).unwrap();
        assert!(matches!(
            store.blob_reader(&name),
            Err(ServerError::NotFound)
        ));
    }

    #[test]
    fn hash_string_is_stable_sha1() {
        assert_eq!(
            SecureStore::hash_string("abc"),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }
}
