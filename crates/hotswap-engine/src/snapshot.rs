//! Snapshot store
//!
//! Captures a module's live state before a transaction first writes to it
//! and puts it back if the transaction aborts.
//!
//! # Lifecycle
//!
//! ```text
//! capture ──► restore ──► release
//!    │                       ▲
//!    └───────────────────────┘  (commit: released without restore)
//! ```
//!
//! Each (transaction, module) pair has at most one active snapshot; a second
//! capture returns the existing id. A restored snapshot cannot be restored
//! again until a fresh capture. Stored bytes carry a CRC32 of the
//! uncompressed state; blobs at or above the compression threshold are
//! stored LZ4-compressed.

use crate::config::SnapshotConfig;
use crate::runtime::ModuleRuntime;
use crate::{Error, Result};
use hotswap_core::{Clock, IdAllocator, ModuleId, ModuleVersion, SnapshotId, StateBlob, TxnId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

/// A stored copy of a module's state
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    pub id: SnapshotId,
    pub txn: TxnId,
    pub module: ModuleId,
    pub version: ModuleVersion,
    pub taken_at: u64,
    /// CRC32 of the uncompressed state
    pub checksum: u32,
    pub compressed: bool,
    pub original_len: usize,
    data: Vec<u8>,
    restored: bool,
}

impl StateSnapshot {
    /// Bytes held in memory
    pub fn stored_len(&self) -> usize {
        self.data.len()
    }

    pub fn is_restored(&self) -> bool {
        self.restored
    }

    /// Decompress and verify the stored state
    fn decode(&self) -> Result<StateBlob> {
        let raw = if self.compressed {
            lz4_flex::decompress_size_prepended(&self.data)
                .map_err(|e| Error::SnapshotCorrupt(self.id, format!("decompress failed: {}", e)))?
        } else {
            self.data.clone()
        };
        if raw.len() != self.original_len {
            return Err(Error::SnapshotCorrupt(
                self.id,
                format!("length {} != {}", raw.len(), self.original_len),
            ));
        }
        let computed = crc32fast::hash(&raw);
        if computed != self.checksum {
            return Err(Error::SnapshotCorrupt(
                self.id,
                format!("checksum {:08x} != {:08x}", computed, self.checksum),
            ));
        }
        Ok(StateBlob::new(raw))
    }
}

/// Store-wide counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SnapshotStats {
    pub live: usize,
    pub bytes_used: usize,
    pub captured: u64,
    pub restored: u64,
    pub released: u64,
    pub compressed: u64,
}

#[derive(Debug, Default)]
struct Arena {
    snapshots: HashMap<SnapshotId, StateSnapshot>,
    active: HashMap<(TxnId, ModuleId), SnapshotId>,
    stats: SnapshotStats,
}

/// Arena of state snapshots indexed by [`SnapshotId`]
pub struct SnapshotStore {
    config: SnapshotConfig,
    ids: Arc<IdAllocator>,
    clock: Arc<dyn Clock>,
    arena: Mutex<Arena>,
}

impl SnapshotStore {
    pub fn new(config: SnapshotConfig, ids: Arc<IdAllocator>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            ids,
            clock,
            arena: Mutex::new(Arena::default()),
        }
    }

    /// Capture `module`'s live state on behalf of `txn`
    ///
    /// Returns the existing snapshot if `txn` already holds an active one
    /// for `module`.
    pub fn capture(
        &self,
        txn: TxnId,
        module: ModuleId,
        runtime: &dyn ModuleRuntime,
    ) -> Result<SnapshotId> {
        if let Some(id) = self.active_for(txn, module) {
            return Ok(id);
        }

        let version = runtime
            .current_version(module)
            .ok_or(Error::ModuleNotRegistered(module))?;
        let blob = runtime
            .serialize_state(module)
            .map_err(|e| Error::CaptureFailed {
                module,
                reason: e.to_string(),
            })?;
        if blob.len() > self.config.max_snapshot_bytes {
            return Err(Error::CaptureFailed {
                module,
                reason: format!(
                    "state of {} bytes exceeds the {} byte limit",
                    blob.len(),
                    self.config.max_snapshot_bytes
                ),
            });
        }

        let checksum = crc32fast::hash(blob.as_bytes());
        let compressed = blob.len() >= self.config.compression_threshold;
        let data = if compressed {
            lz4_flex::compress_prepend_size(blob.as_bytes())
        } else {
            blob.as_bytes().to_vec()
        };

        let mut arena = self.arena.lock();
        if arena.stats.bytes_used + data.len() > self.config.total_budget_bytes {
            return Err(Error::ResourceExhausted(format!(
                "snapshot budget of {} bytes exhausted",
                self.config.total_budget_bytes
            )));
        }

        let id = self.ids.next_snapshot();
        let snapshot = StateSnapshot {
            id,
            txn,
            module,
            version,
            taken_at: self.clock.now_micros(),
            checksum,
            compressed,
            original_len: blob.len(),
            data,
            restored: false,
        };

        arena.stats.bytes_used += snapshot.stored_len();
        arena.stats.captured += 1;
        if compressed {
            arena.stats.compressed += 1;
        }
        arena.active.insert((txn, module), id);
        arena.snapshots.insert(id, snapshot);
        arena.stats.live = arena.snapshots.len();
        debug!(%txn, %module, snapshot = %id, bytes = blob.len(), compressed, "captured snapshot");
        Ok(id)
    }

    /// Verify and re-apply a snapshot through `runtime`
    ///
    /// The snapshot stays stored until released but cannot be restored again.
    /// It is claimed before the runtime is called; a failed restore gives the
    /// claim back so the snapshot can be retried.
    pub fn restore(&self, id: SnapshotId, runtime: &dyn ModuleRuntime) -> Result<()> {
        let (txn, module, version, blob) = {
            let mut arena = self.arena.lock();
            let snapshot = arena
                .snapshots
                .get_mut(&id)
                .ok_or(Error::SnapshotNotFound(id))?;
            if snapshot.restored {
                error!(snapshot = %id, module = %snapshot.module, "snapshot restored twice");
                return Err(Error::StaleRestore(id));
            }
            let blob = snapshot.decode()?;
            snapshot.restored = true;
            (snapshot.txn, snapshot.module, snapshot.version.clone(), blob)
        };

        if let Err(e) = runtime.restore(module, &version, &blob) {
            if let Some(snapshot) = self.arena.lock().snapshots.get_mut(&id) {
                snapshot.restored = false;
            }
            return Err(e.into());
        }

        let mut arena = self.arena.lock();
        let key = (txn, module);
        if arena.active.get(&key) == Some(&id) {
            arena.active.remove(&key);
        }
        arena.stats.restored += 1;
        debug!(snapshot = %id, %module, "restored snapshot");
        Ok(())
    }

    /// Read a snapshot's version and state without restoring it
    pub fn load(&self, id: SnapshotId) -> Result<(ModuleVersion, StateBlob)> {
        let arena = self.arena.lock();
        let snapshot = arena.snapshots.get(&id).ok_or(Error::SnapshotNotFound(id))?;
        Ok((snapshot.version.clone(), snapshot.decode()?))
    }

    /// Free a snapshot; releasing an unknown id is a no-op
    pub fn release(&self, id: SnapshotId) -> bool {
        let mut arena = self.arena.lock();
        let Some(snapshot) = arena.snapshots.remove(&id) else {
            return false;
        };
        let key = (snapshot.txn, snapshot.module);
        if arena.active.get(&key) == Some(&id) {
            arena.active.remove(&key);
        }
        arena.stats.bytes_used -= snapshot.stored_len();
        arena.stats.released += 1;
        arena.stats.live = arena.snapshots.len();
        true
    }

    /// Free every snapshot owned by `txn`
    pub fn release_all(&self, txn: TxnId) -> usize {
        let ids: Vec<SnapshotId> = {
            let arena = self.arena.lock();
            arena
                .snapshots
                .values()
                .filter(|s| s.txn == txn)
                .map(|s| s.id)
                .collect()
        };
        ids.into_iter().filter(|id| self.release(*id)).count()
    }

    /// Active snapshot of `module` for `txn`
    pub fn active_for(&self, txn: TxnId, module: ModuleId) -> Option<SnapshotId> {
        self.arena.lock().active.get(&(txn, module)).copied()
    }

    /// Metadata of a stored snapshot
    pub fn get(&self, id: SnapshotId) -> Option<StateSnapshot> {
        self.arena.lock().snapshots.get(&id).cloned()
    }

    pub fn stats(&self) -> SnapshotStats {
        self.arena.lock().stats
    }

    #[cfg(test)]
    pub(crate) fn corrupt(&self, id: SnapshotId) {
        if let Some(snapshot) = self.arena.lock().snapshots.get_mut(&id) {
            if let Some(byte) = snapshot.data.last_mut() {
                *byte ^= 0xff;
            }
        }
    }
}
