//! Transaction data model
//!
//! A [`Transaction`] is owned by the engine's transaction table for its
//! whole life. Other components refer to it by [`TxnId`] only.
//!
//! # State machine
//!
//! ```text
//! Active ──► Preparing ──► Prepared ──► Committing ──► Committed
//!   │            │             │            │
//!   └────────────┴─────────────┴──► Aborting ──► Aborted
//!
//! any non-terminal state ──► Failed
//! ```
//!
//! `Committing → Aborting` is only taken when the first operation fails
//! before any module switched; once a module switched the transaction can
//! only end `Committed` or `Failed`.

use crate::conflict::ConflictRecord;
use crate::recovery::RecoveryAction;
use crate::Error;
use hotswap_core::{ModuleId, ModuleVersion, OperationId, SnapshotId, StateBlob, TxnId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Scope of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TransactionKind {
    /// One module swap
    #[default]
    SingleModule,
    /// A module together with modules that depend on it
    DependencyChain,
    /// Swap touching shared global state
    GlobalState,
    /// State layout migration across versions
    SchemaMigration,
    /// Unrelated swaps grouped for throughput
    Batch,
}

/// How strictly concurrent commits are checked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    #[default]
    Serializable,
}

impl IsolationLevel {
    /// Whether the write-write check against `read_ts` is enforced
    pub fn checks_write_conflicts(&self) -> bool {
        matches!(
            self,
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable
        )
    }
}

/// What to do with a conflict that does not merge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ConflictPolicy {
    /// Abort the transaction
    #[default]
    Abort,
    /// Install the transaction's state, discarding the concurrent change
    ForceAcceptNew,
    /// Keep the live state, discarding the transaction's change
    ForceKeepCurrent,
}

/// Transaction lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionState {
    Active,
    Preparing,
    Prepared,
    Committing,
    Committed,
    Aborting,
    Aborted,
    Failed,
}

impl TransactionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::Aborted | TransactionState::Failed
        )
    }

    /// Whether a cancel request is still honored in this state
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            TransactionState::Active | TransactionState::Preparing | TransactionState::Prepared
        )
    }

    /// Whether `next` is a legal successor
    pub fn can_transition_to(&self, next: TransactionState) -> bool {
        use TransactionState::*;
        match (self, next) {
            (Active, Preparing) | (Preparing, Prepared) | (Prepared, Committing) => true,
            (Committing, Committed) => true,
            (Active | Preparing | Prepared | Committing, Aborting) => true,
            (Aborting, Aborted) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionState::Active => "active",
            TransactionState::Preparing => "preparing",
            TransactionState::Prepared => "prepared",
            TransactionState::Committing => "committing",
            TransactionState::Committed => "committed",
            TransactionState::Aborting => "aborting",
            TransactionState::Aborted => "aborted",
            TransactionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Kind of module operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    /// Load a new version with its state
    Install,
    /// Make the loaded version live
    Activate,
    /// Take the module out of service, keeping its state
    Deactivate,
    /// Return the module to an earlier version and state
    Rollback,
}

impl OperationKind {
    /// Whether the kind carries a version and state payload
    pub fn needs_payload(&self) -> bool {
        matches!(self, OperationKind::Install | OperationKind::Rollback)
    }
}

/// Version and state an operation installs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub version: ModuleVersion,
    pub state: StateBlob,
}

/// A single step of a transaction against one module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub module: ModuleId,
    pub kind: OperationKind,
    pub payload: Option<Payload>,
    /// Snapshot restored if this operation must be undone
    pub rollback: Option<SnapshotId>,
    pub rollback_required: bool,
    pub applied: bool,
}

impl Operation {
    fn new(module: ModuleId, kind: OperationKind, payload: Option<Payload>) -> Self {
        Self {
            // Assigned when the operation joins a transaction
            id: OperationId(0),
            module,
            kind,
            payload,
            rollback: None,
            rollback_required: true,
            applied: false,
        }
    }

    /// Install `version` with `state`
    pub fn install(version: ModuleVersion, state: StateBlob) -> Self {
        let module = version.module();
        Self::new(module, OperationKind::Install, Some(Payload { version, state }))
    }

    /// Return a module to `version` with `state`
    pub fn rollback_to(version: ModuleVersion, state: StateBlob) -> Self {
        let module = version.module();
        Self::new(module, OperationKind::Rollback, Some(Payload { version, state }))
    }

    pub fn activate(module: ModuleId) -> Self {
        Self::new(module, OperationKind::Activate, None)
    }

    pub fn deactivate(module: ModuleId) -> Self {
        Self::new(module, OperationKind::Deactivate, None)
    }

    /// Allow the operation to be applied without a rollback snapshot
    pub fn without_rollback(mut self) -> Self {
        self.rollback_required = false;
        self
    }

    pub fn version(&self) -> Option<&ModuleVersion> {
        self.payload.as_ref().map(|p| &p.version)
    }

    pub fn is_breaking(&self) -> bool {
        self.version().is_some_and(|v| v.is_breaking())
    }
}

/// A module version a transaction requires to be live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dependency {
    pub module: ModuleId,
    pub required_version: u64,
    /// Unsatisfied critical dependencies abort; others only warn
    pub critical: bool,
}

impl Dependency {
    pub fn critical(module: ModuleId, required_version: u64) -> Self {
        Self {
            module,
            required_version,
            critical: true,
        }
    }

    pub fn optional(module: ModuleId, required_version: u64) -> Self {
        Self {
            module,
            required_version,
            critical: false,
        }
    }
}

/// Per-transaction timings and sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransactionStats {
    pub snapshot_bytes: u64,
    pub lock_wait_us: u64,
    pub conflict_resolution_us: u64,
    pub prepare_us: u64,
    pub apply_us: u64,
}

/// An open transaction
#[derive(Debug)]
pub struct Transaction {
    pub(crate) id: TxnId,
    pub(crate) kind: TransactionKind,
    pub(crate) isolation: IsolationLevel,
    pub(crate) policy: ConflictPolicy,
    pub(crate) state: TransactionState,
    pub(crate) started_at: u64,
    pub(crate) last_activity: u64,
    pub(crate) operations: Vec<Operation>,
    pub(crate) dependencies: Vec<Dependency>,
    pub(crate) conflicts: Vec<ConflictRecord>,
    /// Snapshots in capture order
    pub(crate) snapshots: Vec<(ModuleId, SnapshotId)>,
    pub(crate) read_ts: u64,
    pub(crate) write_ts: Option<u64>,
    pub(crate) commit_ts: Option<u64>,
    pub(crate) held_locks: BTreeSet<ModuleId>,
    pub(crate) stats: TransactionStats,
}

impl Transaction {
    pub(crate) fn new(
        id: TxnId,
        kind: TransactionKind,
        isolation: IsolationLevel,
        read_ts: u64,
        now: u64,
    ) -> Self {
        Self {
            id,
            kind,
            isolation,
            policy: ConflictPolicy::default(),
            state: TransactionState::Active,
            started_at: now,
            last_activity: now,
            operations: Vec::new(),
            dependencies: Vec::new(),
            conflicts: Vec::new(),
            snapshots: Vec::new(),
            read_ts,
            write_ts: None,
            commit_ts: None,
            held_locks: BTreeSet::new(),
            stats: TransactionStats::default(),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn conflicts(&self) -> &[ConflictRecord] {
        &self.conflicts
    }

    pub fn stats(&self) -> TransactionStats {
        self.stats
    }

    /// Participating modules in ascending order
    pub fn modules(&self) -> BTreeSet<ModuleId> {
        self.operations.iter().map(|op| op.module).collect()
    }

    /// Snapshot taken for `module`, if any
    pub fn snapshot_for(&self, module: ModuleId) -> Option<SnapshotId> {
        self.snapshots
            .iter()
            .find(|(m, _)| *m == module)
            .map(|(_, id)| *id)
    }

    /// Final payload per module: the last payload-carrying operation wins
    pub fn final_payloads(&self) -> Vec<(ModuleId, &Payload)> {
        let mut finals: Vec<(ModuleId, &Payload)> = Vec::new();
        for op in &self.operations {
            if let Some(payload) = &op.payload {
                match finals.iter_mut().find(|(m, _)| *m == op.module) {
                    Some(slot) => slot.1 = payload,
                    None => finals.push((op.module, payload)),
                }
            }
        }
        finals.sort_by_key(|(m, _)| *m);
        finals
    }

    /// Whether any operation installs a breaking version of `module`
    pub fn is_breaking_for(&self, module: ModuleId) -> bool {
        self.operations
            .iter()
            .any(|op| op.module == module && op.is_breaking())
    }

    pub(crate) fn transition(&mut self, next: TransactionState) -> crate::Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidTransactionState {
                txn: self.id,
                state: self.state,
                action: "transition",
            });
        }
        tracing::debug!(txn = %self.id, from = %self.state, to = %next, "transaction state change");
        self.state = next;
        Ok(())
    }

    pub(crate) fn touch(&mut self, now: u64) {
        self.last_activity = now;
    }
}

/// Result of a commit
#[derive(Debug, Clone)]
pub enum CommitOutcome {
    /// All operations applied
    Committed { commit_ts: u64 },
    /// Nothing became visible; every module is back at its pre-transaction state
    Aborted(Error),
    /// Commit was partially visible; `recovery` is the action the recovery engine took
    Failed {
        reason: Error,
        recovery: Option<RecoveryAction>,
    },
}

impl CommitOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, CommitOutcome::Committed { .. })
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, CommitOutcome::Aborted(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, CommitOutcome::Failed { .. })
    }

    /// The abort or failure reason
    pub fn reason(&self) -> Option<&Error> {
        match self {
            CommitOutcome::Committed { .. } => None,
            CommitOutcome::Aborted(reason) => Some(reason),
            CommitOutcome::Failed { reason, .. } => Some(reason),
        }
    }

    /// Whether module state was rolled back after a failure
    pub fn rolled_back(&self) -> bool {
        match self {
            CommitOutcome::Failed {
                recovery: Some(action),
                ..
            } => action.success && action.strategy == crate::RecoveryStrategy::Rollback,
            CommitOutcome::Aborted(_) => true,
            _ => false,
        }
    }
}

/// What a call to [`Engine::cancel`](crate::Engine::cancel) achieved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelOutcome {
    /// The transaction was idle and has been aborted
    Aborted,
    /// The transaction is busy; it aborts with [`Error::Cancelled`] at its next step
    Requested,
    /// The commit is past the point of no return or the transaction already ended
    TooLate,
}

impl CancelOutcome {
    /// Whether the transaction is guaranteed not to commit
    pub fn is_honored(&self) -> bool {
        !matches!(self, CancelOutcome::TooLate)
    }
}

/// Pre-transaction state of one module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseState {
    pub module: ModuleId,
    pub version: ModuleVersion,
    pub state: StateBlob,
}

/// What a committed transaction did, kept for replay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedTransaction {
    pub txn: TxnId,
    pub kind: TransactionKind,
    pub commit_ts: u64,
    /// Modules as they were when first written by the transaction
    pub before: Vec<BaseState>,
    /// Operations as applied, with merged payloads
    pub operations: Vec<Operation>,
}
