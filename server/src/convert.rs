//! Offline master-key format conversion: re-encrypts every stored object
//! in place, re-wraps the per-user key material, and swaps the key file
//! last.
//!
//! The new key is staged in `master.key.new` before any object is
//! touched, so an interrupted conversion can be rerun: it picks the
//! staged key back up, skips objects that already read under it, and
//! finishes the swap. Until the final rename the old key file stays
//! authoritative.

use crate::crypto::stream::{StreamReader, StreamWriter};
use crate::crypto::{Algorithm, MasterKey};
use crate::db::{Db, UserRecord};
use crate::error::{ServerError, ServerResult};
use crate::storage::SecureStore;
use crate::MASTER_KEY_FILE;
use rand::Rng;
use std::collections::HashSet;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

const STAGED_KEY_FILE: &str = "master.key.new";

pub fn convert_master_key(
    data_dir: &Path,
    passphrase: &str,
    new_algorithm: Algorithm,
) -> ServerResult<()> {
    let key_path = data_dir.join(MASTER_KEY_FILE);
    let staged_path = data_dir.join(STAGED_KEY_FILE);

    let old = Arc::new(MasterKey::open(&key_path, passphrase)?);
    if old.algorithm() == new_algorithm && !staged_path.exists() {
        info!("master key already uses {}", new_algorithm.name());
        return Ok(());
    }

    // Stage the new key first; a rerun after a crash resumes with it.
    let new = if staged_path.exists() {
        let staged = MasterKey::open(&staged_path, passphrase)?;
        if staged.algorithm() != new_algorithm {
            return Err(ServerError::Denied(
                "a conversion to a different algorithm is already in progress",
            ));
        }
        Arc::new(staged)
    } else {
        let key = Arc::new(MasterKey::random(new_algorithm));
        key.save(&staged_path, passphrase)?;
        key
    };

    let old_db = Db::open(data_dir, old.clone(), None)?;
    let new_db = Db::open(data_dir, new.clone(), None)?;

    // Per-user wrapped fields need real re-wrapping, not just a new
    // envelope: rewrite those records through the typed layer and skip
    // them in the generic pass. After an interrupted run the user index
    // may already read only under the staged key.
    let user_ids = match old_db.user_ids() {
        Ok(ids) => ids,
        Err(ServerError::DecryptFailed) => new_db.user_ids()?,
        Err(e) => return Err(e),
    };
    let mut done: HashSet<PathBuf> = HashSet::new();
    for id in user_ids {
        let key = Db::user_key(id);
        let path = old_db.store().object_path(&key);
        let user: UserRecord = match old_db.store().snapshot(&key) {
            Ok(Some(u)) => u,
            Ok(None) => continue,
            Err(ServerError::DecryptFailed) => {
                // Already converted by an earlier, interrupted run.
                done.insert(path);
                continue;
            }
            Err(e) => return Err(e),
        };

        let mut user = user;
        user.server_secret_key = new.encrypt(&old.decrypt(&user.server_secret_key)?);
        user.token_key = new.encrypt(&old.decrypt(&user.token_key)?);
        new_db.store().put(&key, &user)?;
        done.insert(path);
    }

    for path in old_db.store().walk_objects()? {
        if done.contains(&path) {
            continue;
        }
        reencrypt_object(&path, old_db.store(), &old, &new)?;
    }

    // The swap is the commit point. Failing here leaves the old key in
    // place and the tool is rerun.
    std::fs::rename(&staged_path, &key_path)?;
    info!("master key converted to {}", new_algorithm.name());
    Ok(())
}

fn reencrypt_object(
    path: &Path,
    store: &SecureStore,
    old: &MasterKey,
    new: &MasterKey,
) -> ServerResult<()> {
    let context = store.context_for_physical(path)?;

    let file = std::fs::File::open(path)?;
    let mut reader = match StreamReader::new(old, context, file) {
        Ok(r) => r,
        // Unreadable under the old key: this object was converted before
        // the previous run was interrupted.
        Err(ServerError::DecryptFailed) => {
            let file = std::fs::File::open(path)?;
            StreamReader::new(new, context, file)?;
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let tmp = path.with_extension(format!("conv{}", rand::thread_rng().gen::<u32>()));
    let result = (|| -> ServerResult<()> {
        let out = std::fs::File::create(&tmp)?;
        let mut writer = StreamWriter::new(new, context, out)?;
        let mut buf = vec![0u8; crate::crypto::CHUNK_SIZE];
        loop {
            let n = reader.read(&mut buf).map_err(|e| {
                if crate::crypto::stream::is_decrypt_failure(&e) {
                    ServerError::DecryptFailed
                } else {
                    ServerError::Io(e)
                }
            })?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n])?;
        }
        let (out, _) = writer.finish()?;
        out.sync_all()?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}
