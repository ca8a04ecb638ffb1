//! Multi-version table of committed module versions
//!
//! Every commit appends `(commit_ts, version, state)` to the module's chain.
//! A transaction reads the newest entry with `commit_ts <= read_ts`; an entry
//! newer than its `read_ts` means someone else committed in between.
//!
//! One logical counter issues every timestamp (`read_ts`, `write_ts`,
//! `commit_ts`), so timestamps from different modules are comparable.

use hotswap_core::{ModuleId, ModuleVersion, StateBlob, TxnId};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

/// A committed version of a module
#[derive(Debug, Clone, PartialEq)]
pub struct VersionEntry {
    pub commit_ts: u64,
    pub version: ModuleVersion,
    pub state: StateBlob,
    /// Committing transaction; `None` for registration
    pub txn: Option<TxnId>,
}

/// Per-module version chains with bounded history
#[derive(Debug)]
pub struct VersionTable {
    chains: RwLock<HashMap<ModuleId, VecDeque<VersionEntry>>>,
    clock: AtomicU64,
    history_depth: usize,
}

impl VersionTable {
    pub fn new(history_depth: usize) -> Self {
        Self {
            chains: RwLock::new(HashMap::new()),
            clock: AtomicU64::new(0),
            history_depth: history_depth.max(1),
        }
    }

    /// Issue the next timestamp
    pub fn next_ts(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Latest issued timestamp
    pub fn now_ts(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }

    pub fn contains(&self, module: ModuleId) -> bool {
        self.chains.read().contains_key(&module)
    }

    pub fn modules(&self) -> Vec<ModuleId> {
        let mut modules: Vec<ModuleId> = self.chains.read().keys().copied().collect();
        modules.sort();
        modules
    }

    /// Record a version as committed now; returns its commit timestamp
    pub fn install(
        &self,
        module: ModuleId,
        version: ModuleVersion,
        state: StateBlob,
        txn: Option<TxnId>,
    ) -> u64 {
        self.install_all([(module, version, state)], txn)
    }

    /// Record several modules as committed under one timestamp
    ///
    /// Readers see either none or all of the entries.
    pub fn install_all(
        &self,
        entries: impl IntoIterator<Item = (ModuleId, ModuleVersion, StateBlob)>,
        txn: Option<TxnId>,
    ) -> u64 {
        let mut chains = self.chains.write();
        let commit_ts = self.next_ts();
        for (module, version, state) in entries {
            let chain = chains.entry(module).or_default();
            chain.push_back(VersionEntry {
                commit_ts,
                version,
                state,
                txn,
            });
            while chain.len() > self.history_depth {
                chain.pop_front();
            }
        }
        commit_ts
    }

    /// Newest committed entry
    pub fn latest(&self, module: ModuleId) -> Option<VersionEntry> {
        self.chains.read().get(&module)?.back().cloned()
    }

    /// Newest entry visible at `ts`
    ///
    /// When history older than `ts` was trimmed, the oldest retained entry
    /// is returned so the caller still sees every later commit as concurrent.
    pub fn visible_at(&self, module: ModuleId, ts: u64) -> Option<VersionEntry> {
        let chains = self.chains.read();
        let chain = chains.get(&module)?;
        chain
            .iter()
            .rev()
            .find(|e| e.commit_ts <= ts)
            .or_else(|| chain.front())
            .cloned()
    }

    /// Newest entry committed after `ts`, if any
    pub fn committed_after(&self, module: ModuleId, ts: u64) -> Option<VersionEntry> {
        self.chains
            .read()
            .get(&module)?
            .back()
            .filter(|e| e.commit_ts > ts)
            .cloned()
    }

    /// Number of entries kept for `module`
    pub fn history_len(&self, module: ModuleId) -> usize {
        self.chains.read().get(&module).map_or(0, VecDeque::len)
    }

    /// Drop entries committed before `before_ts`, always keeping the newest
    pub fn cleanup_versions(&self, before_ts: u64) -> usize {
        let mut removed = 0;
        for chain in self.chains.write().values_mut() {
            while chain.len() > 1 && chain.front().is_some_and(|e| e.commit_ts < before_ts) {
                chain.pop_front();
                removed += 1;
            }
        }
        removed
    }
}
