//! Identity types for modules, transactions and the records they produce
//!
//! All identifiers are plain integers wrapped in newtypes. Ids other than
//! [`ModuleId`] are issued by an [`IdAllocator`] owned by one engine instance,
//! so two engines never share counters.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier of a hot-swappable module (a protected module boundary)
///
/// Module ids are totally ordered; multi-module lock acquisition always
/// proceeds in ascending id order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleId(pub u32);

impl ModuleId {
    /// Create a new module ID
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "module:{}", self.0)
    }
}

impl From<u32> for ModuleId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

/// Unique identifier for a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxnId(pub u64);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

/// Unique identifier for a state snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotId(pub u64);

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "snapshot:{}", self.0)
    }
}

/// Unique identifier for an operation inside a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(pub u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op:{}", self.0)
    }
}

/// Unique identifier for a detected conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConflictId(pub u64);

impl fmt::Display for ConflictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conflict:{}", self.0)
    }
}

/// Unique identifier for a reported error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ErrorId(pub u64);

impl fmt::Display for ErrorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "error:{}", self.0)
    }
}

/// Unique identifier for a recovery action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActionId(pub u64);

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "action:{}", self.0)
    }
}

/// Monotonic id source for one engine instance
///
/// Every id kind has its own counter; ids start at 1 so that 0 never
/// names a live record.
#[derive(Debug)]
pub struct IdAllocator {
    txn: AtomicU64,
    snapshot: AtomicU64,
    operation: AtomicU64,
    conflict: AtomicU64,
    error: AtomicU64,
    action: AtomicU64,
}

impl IdAllocator {
    /// Create an allocator with all counters at 1
    pub fn new() -> Self {
        Self {
            txn: AtomicU64::new(1),
            snapshot: AtomicU64::new(1),
            operation: AtomicU64::new(1),
            conflict: AtomicU64::new(1),
            error: AtomicU64::new(1),
            action: AtomicU64::new(1),
        }
    }

    pub fn next_txn(&self) -> TxnId {
        TxnId(self.txn.fetch_add(1, Ordering::Relaxed))
    }

    pub fn next_snapshot(&self) -> SnapshotId {
        SnapshotId(self.snapshot.fetch_add(1, Ordering::Relaxed))
    }

    pub fn next_operation(&self) -> OperationId {
        OperationId(self.operation.fetch_add(1, Ordering::Relaxed))
    }

    pub fn next_conflict(&self) -> ConflictId {
        ConflictId(self.conflict.fetch_add(1, Ordering::Relaxed))
    }

    pub fn next_error(&self) -> ErrorId {
        ErrorId(self.error.fetch_add(1, Ordering::Relaxed))
    }

    pub fn next_action(&self) -> ActionId {
        ActionId(self.action.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_id() {
        let id = ModuleId::new(42);
        assert_eq!(id.raw(), 42);
        assert_eq!(format!("{}", id), "module:42");
        assert!(ModuleId(1) < ModuleId(2));
    }

    #[test]
    fn test_allocator_is_monotonic_per_kind() {
        let ids = IdAllocator::new();
        assert_eq!(ids.next_txn(), TxnId(1));
        assert_eq!(ids.next_txn(), TxnId(2));
        // Separate counters per kind
        assert_eq!(ids.next_snapshot(), SnapshotId(1));
        assert_eq!(ids.next_action(), ActionId(1));
    }

    #[test]
    fn test_allocators_are_independent() {
        let a = IdAllocator::new();
        let b = IdAllocator::new();
        a.next_txn();
        a.next_txn();
        assert_eq!(b.next_txn(), TxnId(1));
    }
}
