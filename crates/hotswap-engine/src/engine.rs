//! The engine context object
//!
//! [`Engine`] owns every subsystem and is passed explicitly to callers;
//! there is no global instance, so tests can run many engines side by side.
//!
//! ```text
//! Engine
//!  ├── transaction table ── Slot { Mutex<Transaction>, cancel flag }
//!  ├── VersionTable (MVCC) ── IntentLocks
//!  ├── SnapshotStore
//!  ├── ConflictDetector ── ScoringModel
//!  ├── RecoveryEngine ── BreakerRegistry
//!  ├── HealthMonitor ── ScoringModel
//!  └── EventBus ──► EventSubscriber[]
//!
//! live modules are only reached through ModuleRuntime
//! ```
//!
//! The transaction table mutex is only held to add, find or remove a slot.
//! Work on one transaction holds that transaction's own mutex, so commits
//! of unrelated transactions run in parallel.

use crate::breaker::{BreakerRegistry, CircuitState};
use crate::config::EngineConfig;
use crate::conflict::{ConflictDetector, ConflictStats};
use crate::event::{EventBus, EventSubscriber, TransactionEvent};
use crate::health::{HealthMonitor, MetricCategory, ModuleHealth, MonitorHandle};
use crate::locks::IntentLocks;
use crate::metrics::{EngineMetrics, MetricsRecorder};
use crate::model::{LinearModel, ScoringModel};
use crate::mvcc::VersionTable;
use crate::recovery::{
    ErrorCategory, ErrorContext, ErrorSeverity, NoHooks, RecoveryAction, RecoveryAnalytics,
    RecoveryEngine, RecoveryHooks,
};
use crate::runtime::ModuleRuntime;
use crate::snapshot::{SnapshotStats, SnapshotStore};
use crate::txn::{
    CancelOutcome, CommitOutcome, CommittedTransaction, ConflictPolicy, Dependency,
    IsolationLevel, Operation, OperationKind, Transaction, TransactionKind, TransactionState,
};
use crate::{Error, Result};
use hotswap_core::{
    Clock, IdAllocator, ModuleId, ModuleVersion, OperationId, StateBlob, SystemClock, TxnId,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Table entry for an open transaction
pub(crate) struct Slot {
    pub(crate) txn: Mutex<Transaction>,
    pub(crate) cancel: CancelLatch,
}

/// One-way latch shared by `cancel` and `commit`
///
/// Moves once from open to cancelled or to sealed. Commit seals it at the
/// point of no return; a cancel that loses the race is refused.
#[derive(Debug, Default)]
pub(crate) struct CancelLatch(AtomicU8);

impl CancelLatch {
    const OPEN: u8 = 0;
    const CANCELLED: u8 = 1;
    const SEALED: u8 = 2;

    pub(crate) fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst) == Self::CANCELLED
    }

    /// False once sealed
    pub(crate) fn cancel(&self) -> bool {
        match self
            .0
            .compare_exchange(Self::OPEN, Self::CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => true,
            Err(state) => state == Self::CANCELLED,
        }
    }

    /// False when a cancel got there first
    pub(crate) fn seal(&self) -> bool {
        match self
            .0
            .compare_exchange(Self::OPEN, Self::SEALED, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => true,
            Err(state) => state == Self::SEALED,
        }
    }
}

/// Result of [`Engine::request_swap`]
#[derive(Debug, Clone)]
pub struct SwapResult {
    pub txn: TxnId,
    pub outcome: CommitOutcome,
}

/// Builder for an [`Engine`] with non-default parts
///
/// ```
/// use hotswap_engine::{Engine, EngineConfig, InMemoryRuntime};
/// use std::sync::Arc;
///
/// let engine = Engine::builder(Arc::new(InMemoryRuntime::new()))
///     .config(EngineConfig::default())
///     .build()
///     .unwrap();
/// assert_eq!(engine.metrics().transactions_started, 0);
/// ```
pub struct EngineBuilder {
    runtime: Arc<dyn ModuleRuntime>,
    config: EngineConfig,
    clock: Option<Arc<dyn Clock>>,
    conflict_model: Option<Arc<dyn ScoringModel>>,
    health_model: Option<Arc<dyn ScoringModel>>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Replace the merge-success model
    pub fn conflict_model(mut self, model: Arc<dyn ScoringModel>) -> Self {
        self.conflict_model = Some(model);
        self
    }

    /// Replace the failure-prediction model
    pub fn health_model(mut self, model: Arc<dyn ScoringModel>) -> Self {
        self.health_model = Some(model);
        self
    }

    pub fn build(self) -> Result<Engine> {
        let config = self.config;
        config.validate()?;

        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        let ids = Arc::new(IdAllocator::new());
        let events = Arc::new(EventBus::new(clock.clone()));

        let conflict_model: Arc<dyn ScoringModel> = match self.conflict_model {
            Some(model) => model,
            None => Arc::new(LinearModel::new(
                config.conflict.model_weights.clone(),
                config.conflict.model_bias,
                config.conflict.learning_rate,
            )),
        };
        let health_model: Arc<dyn ScoringModel> = match self.health_model {
            Some(model) => model,
            None => Arc::new(LinearModel::new(
                config.health.model_weights.clone(),
                config.health.model_bias,
                config.health.learning_rate,
            )),
        };

        let breakers = Arc::new(BreakerRegistry::new(
            config.breaker.clone(),
            clock.clone(),
            events.clone(),
        ));
        let health = Arc::new(HealthMonitor::new(
            config.health.clone(),
            health_model,
            clock.clone(),
            events.clone(),
        ));
        let recovery = RecoveryEngine::new(
            config.recovery.clone(),
            clock.clone(),
            ids.clone(),
            breakers.clone(),
            health.clone(),
            events.clone(),
        );

        Ok(Engine {
            snapshots: SnapshotStore::new(config.snapshot.clone(), ids.clone(), clock.clone()),
            versions: VersionTable::new(config.transaction.history_depth),
            locks: IntentLocks::new(),
            conflicts: ConflictDetector::new(config.conflict.clone(), conflict_model, ids.clone()),
            transactions: Mutex::new(HashMap::new()),
            finished: Mutex::new(VecDeque::new()),
            committed: RwLock::new(VecDeque::new()),
            metrics: MetricsRecorder::default(),
            runtime: self.runtime,
            config,
            clock,
            ids,
            events,
            breakers,
            health,
            recovery,
        })
    }
}

/// Transactional hot-swap engine
///
/// # Example
///
/// ```
/// use hotswap_core::{ModuleId, ModuleState, ModuleVersion};
/// use hotswap_engine::{Engine, EngineConfig, InMemoryRuntime};
/// use std::sync::Arc;
///
/// let runtime = Arc::new(InMemoryRuntime::new());
/// let m = ModuleId(1);
/// let v1 = ModuleState::new().with("x", 1i64).encode().unwrap();
/// runtime.load(ModuleVersion::new(m, 1), v1);
///
/// let engine = Engine::new(runtime.clone(), EngineConfig::default()).unwrap();
/// engine.register_module(m).unwrap();
///
/// let v2 = ModuleState::new().with("x", 2i64).encode().unwrap();
/// let swap = engine.request_swap(ModuleVersion::new(m, 2), v2.clone()).unwrap();
/// assert!(swap.outcome.is_committed());
/// assert_eq!(runtime.state_of(m), Some(v2));
/// ```
pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) runtime: Arc<dyn ModuleRuntime>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) ids: Arc<IdAllocator>,
    pub(crate) events: Arc<EventBus>,
    pub(crate) snapshots: SnapshotStore,
    pub(crate) versions: VersionTable,
    pub(crate) locks: IntentLocks,
    pub(crate) conflicts: ConflictDetector,
    pub(crate) breakers: Arc<BreakerRegistry>,
    pub(crate) health: Arc<HealthMonitor>,
    pub(crate) recovery: RecoveryEngine,
    pub(crate) metrics: MetricsRecorder,
    transactions: Mutex<HashMap<TxnId, Arc<Slot>>>,
    /// Final states of recently finished transactions
    finished: Mutex<VecDeque<(TxnId, TransactionState)>>,
    committed: RwLock<VecDeque<CommittedTransaction>>,
}

impl Engine {
    /// Create an engine with default models and the system clock
    pub fn new(runtime: Arc<dyn ModuleRuntime>, config: EngineConfig) -> Result<Self> {
        Self::builder(runtime).config(config).build()
    }

    /// Create an engine reading time from `clock`
    pub fn with_clock(
        runtime: Arc<dyn ModuleRuntime>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        Self::builder(runtime).config(config).clock(clock).build()
    }

    pub fn builder(runtime: Arc<dyn ModuleRuntime>) -> EngineBuilder {
        EngineBuilder {
            runtime,
            config: EngineConfig::default(),
            clock: None,
            conflict_model: None,
            health_model: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ---- modules ----

    /// Start tracking a module the runtime already has loaded
    ///
    /// Its live version and state become the first committed entry.
    pub fn register_module(&self, module: ModuleId) -> Result<ModuleVersion> {
        let version = self
            .runtime
            .current_version(module)
            .ok_or(Error::ModuleNotRegistered(module))?;
        let state = self.runtime.serialize_state(module)?;
        self.versions.install(module, version.clone(), state, None);
        info!(%module, %version, "module registered");
        Ok(version)
    }

    /// Record that `dependent` relies on `on`; isolating `on` notifies `dependent`
    pub fn register_dependency(&self, dependent: ModuleId, on: ModuleId) {
        self.recovery.register_dependency(dependent, on);
    }

    /// Newest committed version of `module`
    pub fn live_version(&self, module: ModuleId) -> Option<ModuleVersion> {
        self.versions.latest(module).map(|e| e.version)
    }

    /// Installed versions must climb past the live one
    pub(crate) fn check_version_advances(
        &self,
        module: ModuleId,
        version: &ModuleVersion,
    ) -> Result<()> {
        let Some(live) = self.versions.latest(module) else {
            return Ok(());
        };
        let live = live.version.version_id();
        let requested = version.version_id();
        if requested <= live {
            return Err(Error::VersionRegression {
                module,
                live,
                requested,
            });
        }
        Ok(())
    }

    /// Newest committed state of `module`
    pub fn live_state(&self, module: ModuleId) -> Option<StateBlob> {
        self.versions.latest(module).map(|e| e.state)
    }

    // ---- transactions ----

    /// Open a transaction
    pub fn begin_transaction(
        &self,
        kind: TransactionKind,
        isolation: IsolationLevel,
    ) -> Result<TxnId> {
        let id = {
            let mut table = self.transactions.lock();
            if table.len() >= self.config.transaction.max_concurrent {
                return Err(Error::ResourceExhausted(format!(
                    "{} transactions already open",
                    table.len()
                )));
            }
            let id = self.ids.next_txn();
            let txn = Transaction::new(
                id,
                kind,
                isolation,
                self.versions.now_ts(),
                self.clock.now_micros(),
            );
            table.insert(
                id,
                Arc::new(Slot {
                    txn: Mutex::new(txn),
                    cancel: CancelLatch::default(),
                }),
            );
            id
        };

        self.metrics.started();
        debug!(txn = %id, ?kind, ?isolation, "transaction started");
        self.events
            .transaction(TransactionEvent::Started { txn: id, kind });
        Ok(id)
    }

    /// Choose how unmergeable conflicts are handled
    pub fn set_conflict_policy(&self, txn: TxnId, policy: ConflictPolicy) -> Result<()> {
        let slot = self.slot(txn)?;
        let mut t = slot.txn.lock();
        ensure_active(&t, "set conflict policy")?;
        t.policy = policy;
        Ok(())
    }

    /// Append an operation
    ///
    /// The first write to a module takes its intent lock and captures its
    /// rollback snapshot.
    pub fn add_operation(&self, txn: TxnId, mut op: Operation) -> Result<OperationId> {
        let slot = self.slot(txn)?;
        if slot.cancel.is_cancelled() {
            return Err(Error::Cancelled(txn));
        }
        let mut t = slot.txn.lock();
        ensure_active(&t, "add operation")?;

        let module = op.module;
        if self.recovery.is_isolated(module) {
            return Err(Error::ModuleIsolated(module));
        }
        if !self.versions.contains(module) {
            return Err(Error::ModuleNotRegistered(module));
        }
        if self.breakers.is_rejecting(module) {
            self.metrics.rejected();
            return Err(Error::CircuitOpen(module));
        }
        if op.kind.needs_payload() && op.payload.is_none() {
            return Err(Error::MissingPayload(module));
        }
        if op.kind == OperationKind::Install {
            if let Some(payload) = &op.payload {
                self.check_version_advances(module, &payload.version)?;
            }
        }

        if !t.held_locks.contains(&module) {
            let waited = self.locks.acquire(
                txn,
                module,
                &t.held_locks,
                self.config.transaction.intent_timeout(),
            )?;
            t.held_locks.insert(module);
            t.stats.lock_wait_us += waited.as_micros() as u64;
        }

        if op.rollback_required {
            let id = match t.snapshot_for(module) {
                Some(id) => id,
                None => {
                    let id = self.snapshots.capture(txn, module, self.runtime.as_ref())?;
                    if let Some(snapshot) = self.snapshots.get(id) {
                        t.stats.snapshot_bytes += snapshot.stored_len() as u64;
                    }
                    t.snapshots.push((module, id));
                    id
                }
            };
            op.rollback = Some(id);
        }

        op.id = self.ids.next_operation();
        let id = op.id;
        debug!(txn = %txn, %module, op = %id, kind = ?op.kind, "operation added");
        t.operations.push(op);
        t.touch(self.clock.now_micros());
        Ok(id)
    }

    /// Append several operations in ascending module order
    ///
    /// Sorting first keeps intent lock acquisition in the global order.
    pub fn add_operations(&self, txn: TxnId, mut ops: Vec<Operation>) -> Result<Vec<OperationId>> {
        ops.sort_by_key(|op| op.module);
        ops.into_iter()
            .map(|op| self.add_operation(txn, op))
            .collect()
    }

    /// Require `dependency` to be satisfied at commit
    pub fn add_dependency(&self, txn: TxnId, dependency: Dependency) -> Result<()> {
        let slot = self.slot(txn)?;
        let mut t = slot.txn.lock();
        ensure_active(&t, "add dependency")?;
        t.dependencies.push(dependency);
        Ok(())
    }

    /// Begin, install and commit in one call
    ///
    /// Returns [`Error::CircuitOpen`] without opening a transaction when the
    /// module's breaker is rejecting calls.
    pub fn request_swap(&self, version: ModuleVersion, state: StateBlob) -> Result<SwapResult> {
        let module = version.module();
        if self.breakers.is_rejecting(module) {
            self.metrics.rejected();
            return Err(Error::CircuitOpen(module));
        }

        let txn = self.begin_transaction(TransactionKind::SingleModule, IsolationLevel::default())?;
        if let Err(e) = self.add_operation(txn, Operation::install(version, state)) {
            self.abort_with(txn, e.clone())?;
            return Err(e);
        }
        let outcome = self.commit(txn)?;
        Ok(SwapResult { txn, outcome })
    }

    /// Abort an open transaction, restoring every module it touched
    pub fn abort(&self, txn: TxnId) -> Result<CommitOutcome> {
        self.abort_with(txn, Error::Cancelled(txn))
    }

    fn abort_with(&self, txn: TxnId, reason: Error) -> Result<CommitOutcome> {
        let slot = self.slot(txn)?;
        let mut t = slot.txn.lock();
        if t.state.is_terminal() {
            return Err(Error::InvalidTransactionState {
                txn,
                state: t.state,
                action: "abort",
            });
        }
        let started = self.clock.now_micros();
        Ok(self.rollback_and_finish(&mut t, reason, started))
    }

    /// Request cancellation
    ///
    /// An idle transaction is aborted at once. A transaction that is
    /// committing observes the request at its next phase boundary, up to the
    /// point where it starts applying operations; after that the request is
    /// refused with [`CancelOutcome::TooLate`] and the commit runs to its end.
    pub fn cancel(&self, txn: TxnId) -> Result<CancelOutcome> {
        let slot = self.slot(txn)?;
        if !slot.cancel.cancel() {
            debug!(%txn, "cancel refused, commit already applying");
            return Ok(CancelOutcome::TooLate);
        }

        let Some(mut t) = slot.txn.try_lock() else {
            debug!(%txn, "cancel requested for busy transaction");
            return Ok(CancelOutcome::Requested);
        };
        if !t.state.is_cancellable() {
            return Ok(CancelOutcome::TooLate);
        }
        let started = self.clock.now_micros();
        self.rollback_and_finish(&mut t, Error::Cancelled(txn), started);
        Ok(CancelOutcome::Aborted)
    }

    /// Abort transactions idle longer than the transaction timeout
    pub fn abort_expired(&self) -> Vec<TxnId> {
        let timeout_us = self.config.transaction.transaction_timeout_ms.saturating_mul(1_000);
        let slots: Vec<Arc<Slot>> = self.transactions.lock().values().cloned().collect();

        let mut expired = Vec::new();
        for slot in slots {
            let Some(mut t) = slot.txn.try_lock() else {
                continue;
            };
            if t.state == TransactionState::Active
                && self.clock.elapsed_since(t.last_activity) > timeout_us
            {
                let id = t.id;
                warn!(txn = %id, "transaction expired");
                let started = self.clock.now_micros();
                self.rollback_and_finish(&mut t, Error::TransactionExpired(id), started);
                expired.push(id);
            }
        }
        expired
    }

    /// State of a transaction, open or recently finished
    pub fn transaction_state(&self, txn: TxnId) -> Option<TransactionState> {
        let open = self.transactions.lock().get(&txn).cloned();
        if let Some(slot) = open {
            return Some(slot.txn.lock().state);
        }
        self.finished
            .lock()
            .iter()
            .rev()
            .find(|(id, _)| *id == txn)
            .map(|(_, state)| *state)
    }

    /// Inspect an open transaction
    pub fn with_transaction<R>(&self, txn: TxnId, f: impl FnOnce(&Transaction) -> R) -> Option<R> {
        let slot = self.transactions.lock().get(&txn).cloned()?;
        let t = slot.txn.lock();
        Some(f(&t))
    }

    pub fn open_transactions(&self) -> usize {
        self.transactions.lock().len()
    }

    /// Record of a committed transaction, kept for replay
    pub fn committed(&self, txn: TxnId) -> Option<CommittedTransaction> {
        self.committed
            .read()
            .iter()
            .find(|c| c.txn == txn)
            .cloned()
    }

    /// Re-run a committed transaction on `runtime`
    ///
    /// Restores every module to its pre-transaction state, then applies the
    /// recorded operations in order. Starting from the same state this
    /// reproduces the committed state.
    pub fn replay(record: &CommittedTransaction, runtime: &dyn ModuleRuntime) -> Result<()> {
        for base in &record.before {
            runtime.restore(base.module, &base.version, &base.state)?;
        }
        for op in &record.operations {
            runtime.apply(op.module, op)?;
        }
        debug!(txn = %record.txn, operations = record.operations.len(), "transaction replayed");
        Ok(())
    }

    // ---- health, breakers, recovery ----

    pub fn get_module_health(&self, module: ModuleId) -> ModuleHealth {
        self.health.health(module)
    }

    pub fn get_circuit_state(&self, module: ModuleId) -> CircuitState {
        self.breakers.state(module)
    }

    /// Queue a metric sample for `module` without blocking
    pub fn record_metric(&self, module: ModuleId, category: MetricCategory, value: f64) -> bool {
        self.health.sample(module, category, value)
    }

    pub fn health_monitor(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// Start the background monitor and prediction loops
    pub fn start_monitoring(&self) -> MonitorHandle {
        self.health.spawn()
    }

    /// Report a fault observed outside any transaction
    ///
    /// Counts as a failure for the module's circuit breaker.
    pub fn report_error(
        &self,
        module: ModuleId,
        category: ErrorCategory,
        severity: ErrorSeverity,
        message: impl Into<String>,
    ) -> RecoveryAction {
        self.breakers.record_failure(module);
        self.health.sample(module, MetricCategory::ErrorRate, 1.0);
        let breaking = self.live_version(module).is_some_and(|v| v.is_breaking());
        let ctx = ErrorContext::new(self.ids.next_error(), module, category, severity, message)
            .breaking(breaking);
        self.handle_error(ctx, &NoHooks)
    }

    /// Run recovery for `ctx`, delegating strategy work to `hooks`
    pub fn handle_error(&self, ctx: ErrorContext, hooks: &dyn RecoveryHooks) -> RecoveryAction {
        let action = self.recovery.handle(ctx, hooks);
        self.metrics.recovery(action.over_budget);
        action
    }

    pub fn is_isolated(&self, module: ModuleId) -> bool {
        self.recovery.is_isolated(module)
    }

    pub fn is_degraded(&self, module: ModuleId) -> bool {
        self.recovery.is_degraded(module)
    }

    pub fn release_isolation(&self, module: ModuleId) -> bool {
        self.recovery.release_isolation(module)
    }

    /// Close `module`'s breaker by operator decision
    pub fn reset_circuit(&self, module: ModuleId) {
        self.breakers.reset(module);
    }

    // ---- observation ----

    pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) {
        self.events.subscribe(subscriber);
    }

    pub fn metrics(&self) -> EngineMetrics {
        self.metrics.snapshot()
    }

    /// Zero the engine, conflict and recovery counters
    pub fn reset_metrics(&self) {
        self.metrics.reset();
        self.conflicts.reset_stats();
        self.recovery.reset_analytics();
    }

    pub fn conflict_stats(&self) -> ConflictStats {
        self.conflicts.stats()
    }

    pub fn conflict_model_accuracy(&self) -> f64 {
        self.conflicts.model_accuracy()
    }

    pub fn recovery_analytics(&self) -> RecoveryAnalytics {
        self.recovery.analytics()
    }

    pub fn recovery_history(&self) -> Vec<RecoveryAction> {
        self.recovery.history()
    }

    pub fn snapshot_stats(&self) -> SnapshotStats {
        self.snapshots.stats()
    }

    /// Drop committed versions older than `before_ts`
    pub fn cleanup_versions(&self, before_ts: u64) -> usize {
        self.versions.cleanup_versions(before_ts)
    }

    /// Latest issued logical timestamp
    pub fn now_ts(&self) -> u64 {
        self.versions.now_ts()
    }

    // ---- internals shared with the commit path ----

    pub(crate) fn slot(&self, txn: TxnId) -> Result<Arc<Slot>> {
        self.transactions
            .lock()
            .get(&txn)
            .cloned()
            .ok_or(Error::TransactionNotFound(txn))
    }

    /// Release locks and snapshots and move `t` out of the open table
    pub(crate) fn finish(&self, t: &mut Transaction) {
        self.snapshots.release_all(t.id);
        self.locks.release_all(t.id, &t.held_locks);
        t.held_locks.clear();
        self.transactions.lock().remove(&t.id);

        let mut finished = self.finished.lock();
        if finished.len() >= self.config.transaction.committed_history.max(1) {
            finished.pop_front();
        }
        finished.push_back((t.id, t.state));
    }

    pub(crate) fn remember_commit(&self, record: CommittedTransaction) {
        let mut committed = self.committed.write();
        if committed.len() >= self.config.transaction.committed_history.max(1) {
            committed.pop_front();
        }
        committed.push_back(record);
    }
}

fn ensure_active(t: &Transaction, action: &'static str) -> Result<()> {
    if t.state == TransactionState::Active {
        Ok(())
    } else {
        Err(Error::InvalidTransactionState {
            txn: t.id,
            state: t.state,
            action,
        })
    }
}
