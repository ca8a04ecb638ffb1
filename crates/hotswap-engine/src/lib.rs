//! Hotswap Engine - transactional hot-swapping of live modules
//!
//! A swap replaces a module's code version and state while the host keeps
//! running. This crate makes one or more swaps atomic: every participant
//! switches, or every participant ends at its pre-transaction state.
//!
//! ## Architecture
//!
//! ```text
//! caller
//!  │ begin / add_operation / commit
//!  ▼
//! Engine ──────────────────────────────────────────────┐
//!  ├── transactions ── intent locks ── snapshots       │
//!  ├── VersionTable (MVCC) ── ConflictDetector         │
//!  ├── two-phase commit ──► ModuleRuntime (trait) ◄────┘
//!  ├── RecoveryEngine ── BreakerRegistry
//!  ├── HealthMonitor ── failure predictor
//!  └── EventBus ──► EventSubscriber (journal, metrics, tests)
//! ```
//!
//! ## Key Components
//!
//! - [`Engine`]: context object owning every subsystem
//! - [`ModuleRuntime`]: the only way the engine reaches live modules
//! - [`conflict::ConflictDetector`]: three-way diff, scoring and merge of concurrent writes
//! - [`recovery::RecoveryEngine`]: error classification and strategy execution
//! - [`breaker::BreakerRegistry`]: per-module circuit breakers
//! - [`health::HealthMonitor`]: metric windows and failure prediction
//!
//! ## Example
//!
//! ```
//! use hotswap_core::{ModuleId, ModuleState, ModuleVersion};
//! use hotswap_engine::{Engine, EngineConfig, InMemoryRuntime, IsolationLevel, Operation, TransactionKind};
//! use std::sync::Arc;
//!
//! let runtime = Arc::new(InMemoryRuntime::new());
//! for m in [ModuleId(1), ModuleId(2)] {
//!     runtime.load(ModuleVersion::new(m, 1), ModuleState::new().encode().unwrap());
//! }
//! let engine = Engine::new(runtime.clone(), EngineConfig::default()).unwrap();
//! engine.register_module(ModuleId(1)).unwrap();
//! engine.register_module(ModuleId(2)).unwrap();
//!
//! let txn = engine
//!     .begin_transaction(TransactionKind::DependencyChain, IsolationLevel::Serializable)
//!     .unwrap();
//! for m in [ModuleId(1), ModuleId(2)] {
//!     let state = ModuleState::new().with("ready", true).encode().unwrap();
//!     engine.add_operation(txn, Operation::install(ModuleVersion::new(m, 2), state)).unwrap();
//! }
//! assert!(engine.commit(txn).unwrap().is_committed());
//! assert_eq!(engine.live_version(ModuleId(2)).unwrap().version_id(), 2);
//! ```

pub mod breaker;
mod commit;
mod config;
pub mod conflict;
pub mod diff;
mod engine;
mod error;
pub mod event;
pub mod health;
mod locks;
mod metrics;
pub mod model;
pub mod mvcc;
pub mod recovery;
mod runtime;
pub mod snapshot;
mod txn;

pub use breaker::CircuitState;
pub use config::{
    BreakerConfig, ConflictConfig, EngineConfig, HealthConfig, RecoveryConfig, SnapshotConfig,
    TransactionConfig,
};
pub use conflict::{ConflictRecord, ConflictSeverity, ConflictStats, ConflictType, MergeStrategy};
pub use diff::{three_way_merge, MergeOutcome};
pub use engine::{Engine, EngineBuilder, SwapResult};
pub use error::{Error, Result};
pub use event::{
    CircuitEvent, CollectingSubscriber, ConflictEvent, EngineEvent, EventSubscriber, HealthEvent,
    Record, RecoveryEvent, TransactionEvent,
};
pub use health::{FailurePrediction, HealthStatus, MetricCategory, ModuleHealth, MonitorHandle};
pub use metrics::EngineMetrics;
pub use model::{LinearModel, ScoringModel};
pub use recovery::{
    ErrorCategory, ErrorContext, ErrorSeverity, RecoveryAction, RecoveryAnalytics, RecoveryHooks,
    RecoveryStrategy,
};
pub use runtime::{InMemoryRuntime, ModuleRuntime, RuntimeError, Vote};
pub use snapshot::SnapshotStats;
pub use txn::{
    BaseState, CancelOutcome, CommitOutcome, CommittedTransaction, ConflictPolicy, Dependency, IsolationLevel,
    Operation, OperationKind, Payload, Transaction, TransactionKind, TransactionState,
    TransactionStats,
};
