use super::Db;
use crate::error::ServerResult;
use serde::{Deserialize, Serialize};
use wire::delete_type;

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DeleteEntry {
    pub file: String,
    pub album_id: String,
    pub kind: u8,
    pub date: i64,
}

/// Append-only per-user deletion log with a floor timestamp. Entries
/// older than the floor may have been pruned; a client whose cursor is
/// behind the floor must wipe and resync.
#[derive(Serialize, Deserialize, Clone, Default, Debug)]
pub struct DeleteLog {
    pub floor: i64,
    pub entries: Vec<DeleteEntry>,
}

/// Album-scope tombstones sort after file-scope tombstones that carry the
/// same timestamp.
fn scope_rank(kind: u8) -> u8 {
    match kind {
        delete_type::ALBUM | delete_type::UNSHARE => 1,
        _ => 0,
    }
}

impl Db {
    /// The caller holds the user's deletion-log lock.
    pub(crate) fn append_tombstone(&self, user: u64, entry: DeleteEntry) -> ServerResult<()> {
        let key = Db::deletes_key(user);
        let mut log: DeleteLog = self.store().snapshot(&key)?.unwrap_or_default();
        log.entries.push(entry);
        self.store().put(&key, &log)
    }

    /// Prunes entries behind the new floor. The caller holds the lock.
    pub(crate) fn advance_delete_floor(&self, user: u64, floor: i64) -> ServerResult<()> {
        let key = Db::deletes_key(user);
        let mut log: DeleteLog = self.store().snapshot(&key)?.unwrap_or_default();
        if floor <= log.floor {
            return Ok(());
        }
        log.floor = floor;
        log.entries.retain(|e| e.date >= floor);
        self.store().put(&key, &log)
    }

    /// Offline GC: advances the floor directly, pruning everything behind
    /// it.
    pub fn prune_deletes(&self, user: u64, before: i64) -> ServerResult<()> {
        let _lock = self.store().lock(&Db::deletes_key(user));
        self.advance_delete_floor(user, before)
    }

    /// Tombstones newer than `since`. The boolean is true when `since` is
    /// behind the floor, in which case the payload is best-effort and the
    /// client must resync from scratch.
    pub fn delete_updates(
        &self,
        user: u64,
        since: i64,
    ) -> ServerResult<(Vec<wire::DeleteRecord>, bool)> {
        let log: DeleteLog = self
            .store()
            .snapshot(&Db::deletes_key(user))?
            .unwrap_or_default();
        let out_of_sync = since < log.floor;

        let mut out: Vec<wire::DeleteRecord> = log
            .entries
            .iter()
            .filter(|e| e.date > since)
            .map(|e| wire::DeleteRecord {
                file: e.file.clone(),
                album_id: e.album_id.clone(),
                kind: e.kind,
                date: e.date,
            })
            .collect();
        out.sort_by(|a, b| {
            (a.date, scope_rank(a.kind), a.kind, &a.file).cmp(&(
                b.date,
                scope_rank(b.kind),
                b.kind,
                &b.file,
            ))
        });
        Ok((out, out_of_sync))
    }
}
