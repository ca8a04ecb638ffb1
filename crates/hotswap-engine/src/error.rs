//! Error types for hotswap-engine
//!
//! The first block of variants is the failure taxonomy surfaced through
//! [`CommitOutcome`](crate::CommitOutcome); the rest report misuse of the
//! engine API or infrastructure faults. [`Error::requires_attention`] tells
//! which failures a caller must act on and which the engine already
//! resolved locally by aborting.

use crate::conflict::ConflictSeverity;
use crate::runtime::RuntimeError;
use hotswap_core::{ConflictId, ModuleId, SnapshotId, TxnId};
use thiserror::Error;

/// Result type for hotswap-engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in hotswap-engine
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A conflict could not be merged and no force policy was set
    #[error("unresolved {severity:?} conflict {conflict} on {module}")]
    ConflictUnresolved {
        module: ModuleId,
        conflict: ConflictId,
        severity: ConflictSeverity,
    },

    /// Snapshot bytes failed checksum or decompression
    #[error("snapshot {0} is corrupt: {1}")]
    SnapshotCorrupt(SnapshotId, String),

    /// Snapshot id is unknown or already released
    #[error("snapshot {0} not found")]
    SnapshotNotFound(SnapshotId),

    /// A participant did not vote before the prepare deadline
    #[error("prepare timed out waiting for {}", format_modules(.0))]
    PrepareTimeout(Vec<ModuleId>),

    /// A participant voted to abort
    #[error("{module} rejected prepare: {reason}")]
    PrepareRejected { module: ModuleId, reason: String },

    /// An operation failed while applying; `partial` when some modules had already switched
    #[error("apply failed on {module} (partial: {partial}): {reason}")]
    ApplyFailed {
        module: ModuleId,
        partial: bool,
        reason: String,
    },

    /// The module's circuit breaker is rejecting calls
    #[error("circuit open for {0}")]
    CircuitOpen(ModuleId),

    /// A configured capacity was exhausted
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A required module version is not live
    #[error("{module} requires {required} at version >= {required_version}")]
    DependencyUnsatisfied {
        module: ModuleId,
        required: ModuleId,
        required_version: u64,
    },

    /// An install would not move the module past its live version
    #[error("{module} is live at version {live}, cannot install version {requested}")]
    VersionRegression {
        module: ModuleId,
        live: u64,
        requested: u64,
    },

    /// Transaction not found
    #[error("transaction {0} not found")]
    TransactionNotFound(TxnId),

    /// Operation not allowed in the transaction's current state
    #[error("transaction {txn} cannot {action} while {state}")]
    InvalidTransactionState {
        txn: TxnId,
        state: crate::TransactionState,
        action: &'static str,
    },

    /// Module was never registered with the engine
    #[error("{0} is not registered")]
    ModuleNotRegistered(ModuleId),

    /// Module is cordoned off by the recovery engine
    #[error("{0} is isolated")]
    ModuleIsolated(ModuleId),

    /// The module refused to serialize or its state exceeds the snapshot budget
    #[error("capture failed for {module}: {reason}")]
    CaptureFailed { module: ModuleId, reason: String },

    /// A snapshot was restored a second time without an intervening capture
    #[error("snapshot {0} was already restored")]
    StaleRestore(SnapshotId),

    /// Intent lock wait exceeded the configured timeout
    #[error("timed out waiting for intent lock on {module} held by {holder}")]
    IntentTimeout { module: ModuleId, holder: TxnId },

    /// Lock requested below an already-held module id while contended
    #[error("{txn} would acquire {module} out of order")]
    LockOrder { txn: TxnId, module: ModuleId },

    /// An operation that must be reversible has no rollback snapshot
    #[error("operation on {0} requires a rollback payload")]
    MissingRollbackPayload(ModuleId),

    /// Operation kind needs a version and state payload
    #[error("operation on {0} requires a payload")]
    MissingPayload(ModuleId),

    /// The transaction was cancelled externally
    #[error("transaction {0} was cancelled")]
    Cancelled(TxnId),

    /// The transaction sat idle past the transaction timeout
    #[error("transaction {0} expired")]
    TransactionExpired(TxnId),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Module runtime error
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// Core error
    #[error("core error: {0}")]
    Core(#[from] hotswap_core::Error),
}

impl Error {
    /// Whether the caller must act on this failure
    ///
    /// Partial apply failures, exhausted resources and unresolved critical
    /// conflicts need attention. Everything else was resolved by aborting.
    pub fn requires_attention(&self) -> bool {
        match self {
            Error::ApplyFailed { partial, .. } => *partial,
            Error::ResourceExhausted(_) => true,
            Error::ConflictUnresolved { severity, .. } => *severity == ConflictSeverity::Critical,
            _ => false,
        }
    }

    /// The module this error concerns, if any
    pub fn module(&self) -> Option<ModuleId> {
        match self {
            Error::ConflictUnresolved { module, .. }
            | Error::PrepareRejected { module, .. }
            | Error::ApplyFailed { module, .. }
            | Error::DependencyUnsatisfied { module, .. }
            | Error::VersionRegression { module, .. }
            | Error::CaptureFailed { module, .. }
            | Error::IntentTimeout { module, .. }
            | Error::LockOrder { module, .. } => Some(*module),
            Error::CircuitOpen(module)
            | Error::ModuleNotRegistered(module)
            | Error::ModuleIsolated(module)
            | Error::MissingRollbackPayload(module)
            | Error::MissingPayload(module) => Some(*module),
            Error::PrepareTimeout(modules) => modules.first().copied(),
            _ => None,
        }
    }
}

fn format_modules(modules: &[ModuleId]) -> String {
    modules
        .iter()
        .map(|m| m.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

// Compile-time check that Error is Send + Sync for thread-safe error propagation.
// This function is never called but will fail to compile if the bound is not satisfied.
fn _assert_error_send_sync<T: Send + Sync>() {}
fn _error_is_send_sync() {
    _assert_error_send_sync::<Error>();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_attention() {
        let m = ModuleId(1);
        assert!(Error::ApplyFailed {
            module: m,
            partial: true,
            reason: "boom".into()
        }
        .requires_attention());
        assert!(!Error::ApplyFailed {
            module: m,
            partial: false,
            reason: "boom".into()
        }
        .requires_attention());
        assert!(Error::ResourceExhausted("snapshots".into()).requires_attention());
        assert!(Error::ConflictUnresolved {
            module: m,
            conflict: ConflictId(1),
            severity: ConflictSeverity::Critical
        }
        .requires_attention());
        assert!(!Error::ConflictUnresolved {
            module: m,
            conflict: ConflictId(1),
            severity: ConflictSeverity::Medium
        }
        .requires_attention());
        assert!(!Error::PrepareTimeout(vec![m]).requires_attention());
        assert!(!Error::CircuitOpen(m).requires_attention());
    }

    #[test]
    fn test_display() {
        let err = Error::PrepareTimeout(vec![ModuleId(1), ModuleId(2)]);
        assert_eq!(
            err.to_string(),
            "prepare timed out waiting for module:1, module:2"
        );
    }
}
