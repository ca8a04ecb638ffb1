//! Hotswap Journal - audit log, queries and export
//!
//! This crate is the optional persistence layer for `hotswap-engine`:
//!
//! - **AuditLog**: an [`EventSubscriber`](hotswap_engine::EventSubscriber) that
//!   appends every transaction outcome, conflict, recovery action, breaker
//!   transition and health alert as a self-describing, checksummed record
//! - **Auditor**: reports and queries over recorded history
//! - **Exporter**: RON, JSON, CSV and text export
//!
//! ```text
//! Engine ── EventBus ──► AuditLog ──► memory window
//!                            │
//!                            └──► writer thread ──► audit.log  | len | record | crc32 | ...
//! ```
//!
//! # Example
//!
//! ```
//! use hotswap_core::{ModuleId, ModuleState, ModuleVersion};
//! use hotswap_engine::{Engine, EngineConfig, InMemoryRuntime, IsolationLevel, Operation, TransactionKind};
//! use hotswap_journal::{AuditConfig, AuditLog, Auditor, ExportFormat, Exporter};
//! use std::sync::Arc;
//!
//! let runtime = Arc::new(InMemoryRuntime::new());
//! runtime.load(ModuleVersion::new(ModuleId(1), 1), ModuleState::new().encode().unwrap());
//! let engine = Engine::new(runtime, EngineConfig::default()).unwrap();
//! engine.register_module(ModuleId(1)).unwrap();
//!
//! let log = Arc::new(AuditLog::in_memory(AuditConfig::default()));
//! engine.subscribe(log.clone());
//!
//! let txn = engine
//!     .begin_transaction(TransactionKind::SingleModule, IsolationLevel::Serializable)
//!     .unwrap();
//! let state = ModuleState::new().with("ready", true).encode().unwrap();
//! engine
//!     .add_operation(txn, Operation::install(ModuleVersion::new(ModuleId(1), 2), state))
//!     .unwrap();
//! engine.commit(txn).unwrap();
//!
//! let records = log.entries();
//! let report = Auditor::new(&records).generate_report();
//! assert_eq!(report.transactions_committed, 1);
//! let csv = Exporter::new(&records).export(ExportFormat::Csv).unwrap();
//! assert!(csv.lines().count() > 1);
//! ```

mod auditor;
mod error;
mod exporter;
mod log;
mod record;

pub use auditor::{AuditQuery, AuditReport, Auditor, ModuleSummary};
pub use error::{Error, Result};
pub use exporter::{ExportFormat, Exporter};
pub use log::{AuditConfig, AuditLog, AuditStats};
pub use record::{
    decode_frames, AuditKind, AuditPayload, AuditRecord, Recovered, FRAME_OVERHEAD,
    MAX_RECORD_LEN,
};
