//! Two-phase commit of a transaction
//!
//! ```text
//! Active ─► Preparing: cancel check, dependency check, MVCC write-write
//!           │          validation (detect, resolve, retry once), votes
//!           ▼
//!         Prepared:    cancel check, rollback payload check, seal
//!           │          against cancellation (point of no return)
//!           ▼
//!         Committing:  apply operations in order
//!           │   ├─ first apply fails ─────────► Aborting ─► Aborted
//!           │   └─ later apply fails ─────────► Failed (recovery engine)
//!           ▼
//!         Committed:   install versions under one commit_ts, release snapshots
//! ```
//!
//! Votes are collected in parallel, one thread per participant, and the
//! wait is bounded by the prepare timeout. A participant that does not
//! answer in time is treated as voting abort and every participant is told
//! to discard its prepared state. Votes arriving after the deadline are
//! answered with another discard.

use crate::conflict::ConflictSeverity;
use crate::diff::{three_way_merge, MergeOutcome};
use crate::engine::{CancelLatch, Engine};
use crate::event::{ConflictEvent, TransactionEvent};
use crate::health::MetricCategory;
use crate::recovery::{ErrorContext, RecoveryHooks, RecoveryStrategy};
use crate::runtime::{ModuleRuntime, Vote};
use crate::snapshot::SnapshotStore;
use crate::txn::{
    BaseState, CommitOutcome, CommittedTransaction, ConflictPolicy, Operation, OperationKind,
    Payload, Transaction, TransactionState,
};
use crate::{Error, Result};
use crossbeam_channel::Receiver;
use hotswap_core::{ModuleId, SnapshotId, StateBlob, TxnId};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Why a commit stopped short of `Committed`
enum Halt {
    /// Nothing became visible; `blame` lists modules at fault for their breakers
    Abort { reason: Error, blame: Vec<ModuleId> },
    /// Some modules had already switched when `module` failed
    Fail { reason: Error, module: ModuleId },
}

impl From<Error> for Halt {
    fn from(reason: Error) -> Self {
        Halt::Abort {
            reason,
            blame: Vec::new(),
        }
    }
}

/// Restores a transaction's snapshots for the recovery engine's rollback
struct RestoreSnapshots<'a> {
    store: &'a SnapshotStore,
    runtime: &'a dyn ModuleRuntime,
    snapshots: &'a [(ModuleId, SnapshotId)],
}

impl RecoveryHooks for RestoreSnapshots<'_> {
    fn rollback(&self, _ctx: &ErrorContext) -> std::result::Result<Vec<ModuleId>, String> {
        let mut restored = Vec::with_capacity(self.snapshots.len());
        let mut failed = Vec::new();
        for (module, id) in self.snapshots.iter().rev() {
            match self.store.restore(*id, self.runtime) {
                Ok(()) => restored.push(*module),
                Err(e) => {
                    error!(%module, snapshot = %id, error = %e, "restore failed during rollback");
                    failed.push(format!("{} ({})", module, e));
                }
            }
        }
        if failed.is_empty() {
            return Ok(restored);
        }
        let restored: Vec<String> = restored.iter().map(ModuleId::to_string).collect();
        Err(format!(
            "could not restore {}; restored [{}]",
            failed.join(", "),
            restored.join(", ")
        ))
    }
}

impl Engine {
    /// Run two-phase commit
    ///
    /// Every transaction ends `Committed`, `Aborted` or `Failed`; the
    /// outcome says which. `Err` is returned for misuse (unknown or finished
    /// transaction) and for [`Error::CircuitOpen`], which aborts the
    /// transaction without contacting any module.
    pub fn commit(&self, txn: TxnId) -> Result<CommitOutcome> {
        let slot = self.slot(txn)?;
        let mut guard = slot.txn.lock();
        let t = &mut *guard;
        if t.state != TransactionState::Active {
            return Err(Error::InvalidTransactionState {
                txn,
                state: t.state,
                action: "commit",
            });
        }
        let started = self.clock.now_micros();

        let modules: Vec<ModuleId> = t.modules().into_iter().collect();
        let mut admitted = Vec::with_capacity(modules.len());
        for module in &modules {
            if self.breakers.try_acquire(*module).is_none() {
                for m in &admitted {
                    self.breakers.abandon_trial(*m);
                }
                self.metrics.rejected();
                let reason = Error::CircuitOpen(*module);
                self.abort_untouched(t, reason.clone(), started);
                return Err(reason);
            }
            admitted.push(*module);
        }

        match self.run_commit(t, &slot.cancel, started) {
            Ok(commit_ts) => Ok(CommitOutcome::Committed { commit_ts }),
            Err(Halt::Abort { reason, blame }) => {
                for module in &modules {
                    if blame.contains(module) {
                        self.breakers.record_failure(*module);
                        self.health.sample(*module, MetricCategory::ErrorRate, 1.0);
                    } else {
                        self.breakers.abandon_trial(*module);
                    }
                }
                Ok(self.rollback_and_finish(t, reason, started))
            }
            Err(Halt::Fail { reason, module }) => Ok(self.fail(t, reason, module, started)),
        }
    }

    fn run_commit(
        &self,
        t: &mut Transaction,
        cancel: &CancelLatch,
        started: u64,
    ) -> std::result::Result<u64, Halt> {
        t.transition(TransactionState::Preparing)?;
        check_cancel(t, cancel)?;
        self.check_dependencies(t)?;
        self.check_versions(t)?;
        t.write_ts = Some(self.versions.next_ts());

        let validation_started = self.clock.now_micros();
        self.validate(t)?;
        t.stats.conflict_resolution_us += self.clock.elapsed_since(validation_started);
        check_cancel(t, cancel)?;

        let prepare_started = self.clock.now_micros();
        self.collect_votes(t)?;
        t.stats.prepare_us = self.clock.elapsed_since(prepare_started);

        t.transition(TransactionState::Prepared)?;
        check_cancel(t, cancel)?;
        if let Some(op) = t
            .operations
            .iter()
            .find(|op| op.rollback_required && op.rollback.is_none())
        {
            return Err(Error::MissingRollbackPayload(op.module).into());
        }
        if !cancel.seal() {
            debug!(txn = %t.id, "cancellation won the race to apply");
            return Err(Error::Cancelled(t.id).into());
        }

        t.transition(TransactionState::Committing)?;
        let apply_started = self.clock.now_micros();
        for i in 0..t.operations.len() {
            let op = &t.operations[i];
            if let Err(e) = self.runtime.apply(op.module, op) {
                let module = op.module;
                let partial = t.operations.iter().any(|o| o.applied);
                let reason = Error::ApplyFailed {
                    module,
                    partial,
                    reason: e.to_string(),
                };
                return Err(if partial {
                    Halt::Fail { reason, module }
                } else {
                    Halt::Abort {
                        reason,
                        blame: vec![module],
                    }
                });
            }
            t.operations[i].applied = true;
        }
        t.stats.apply_us = self.clock.elapsed_since(apply_started);

        let installs: Vec<_> = t
            .final_payloads()
            .into_iter()
            .map(|(module, p)| (module, p.version.clone(), p.state.clone()))
            .collect();
        let commit_ts = self.versions.install_all(installs, Some(t.id));
        t.commit_ts = Some(commit_ts);

        self.remember_commit(CommittedTransaction {
            txn: t.id,
            kind: t.kind,
            commit_ts,
            before: self.base_states(t),
            operations: t.operations.clone(),
        });
        t.transition(TransactionState::Committed)?;

        let duration_us = self.clock.elapsed_since(started);
        let modules: Vec<ModuleId> = t.modules().into_iter().collect();
        for module in &modules {
            self.breakers.record_success(*module);
            self.health.sample(*module, MetricCategory::ErrorRate, 0.0);
            self.health
                .sample(*module, MetricCategory::Latency, duration_us as f64 / 1_000.0);
            let conflicted = t.conflicts.iter().any(|c| c.module == *module);
            self.health.sample(
                *module,
                MetricCategory::ConflictDensity,
                if conflicted { 1.0 } else { 0.0 },
            );
        }
        self.metrics.committed(duration_us);
        self.finish(t);

        info!(txn = %t.id, commit_ts, duration_us, modules = modules.len(), "transaction committed");
        self.events.transaction(TransactionEvent::Committed {
            txn: t.id,
            modules,
            commit_ts,
            duration_us,
        });
        Ok(commit_ts)
    }

    fn check_dependencies(&self, t: &Transaction) -> std::result::Result<(), Halt> {
        let finals = t.final_payloads();
        for dep in &t.dependencies {
            let staged = finals
                .iter()
                .find(|(m, _)| *m == dep.module)
                .map(|(_, p)| p.version.clone());
            let version = staged.or_else(|| self.versions.latest(dep.module).map(|e| e.version));
            if version.is_some_and(|v| v.satisfies(dep.required_version)) {
                continue;
            }

            let dependent = t.modules().into_iter().next().unwrap_or(dep.module);
            if dep.critical {
                return Err(Error::DependencyUnsatisfied {
                    module: dependent,
                    required: dep.module,
                    required_version: dep.required_version,
                }
                .into());
            }
            warn!(txn = %t.id, required = %dep.module, required_version = dep.required_version, "optional dependency unsatisfied");
        }
        Ok(())
    }

    /// Re-check each final install against the version live now
    fn check_versions(&self, t: &Transaction) -> Result<()> {
        let mut last: BTreeMap<ModuleId, &Operation> = BTreeMap::new();
        for op in t.operations.iter().filter(|op| op.payload.is_some()) {
            last.insert(op.module, op);
        }
        for (module, op) in last {
            if let (OperationKind::Install, Some(payload)) = (op.kind, &op.payload) {
                self.check_version_advances(module, &payload.version)?;
            }
        }
        Ok(())
    }

    /// MVCC write-write check of every module's final payload
    ///
    /// A commit newer than the transaction's read timestamp is merged with
    /// the proposed state. After a successful resolution the check runs once
    /// more against anything committed meanwhile.
    fn validate(&self, t: &mut Transaction) -> std::result::Result<(), Halt> {
        if !t.isolation.checks_write_conflicts() {
            return Ok(());
        }

        let targets: Vec<(ModuleId, StateBlob)> = t
            .final_payloads()
            .into_iter()
            .map(|(module, p)| (module, p.state.clone()))
            .collect();

        for (module, new) in targets {
            let mut seen_ts = t.read_ts;
            let mut proposed = new;
            let mut changed = false;
            for _ in 0..2 {
                let Some(current) = self.versions.committed_after(module, seen_ts) else {
                    break;
                };
                let Some(base) = self.versions.visible_at(module, seen_ts) else {
                    break;
                };
                seen_ts = current.commit_ts;
                if base.commit_ts == current.commit_ts || base.state == current.state {
                    continue;
                }
                debug!(txn = %t.id, %module, read_ts = t.read_ts, concurrent_ts = current.commit_ts, "concurrent commit");
                proposed = self.reconcile(t, module, &base.state, &current.state, &proposed)?;
                changed = true;
            }

            if self.versions.committed_after(module, seen_ts).is_some() {
                warn!(txn = %t.id, %module, "module kept changing during validation");
                return Err(Error::ConflictUnresolved {
                    module,
                    conflict: self.ids.next_conflict(),
                    severity: ConflictSeverity::Medium,
                }
                .into());
            }
            if changed {
                if let Some(payload) = final_payload_mut(t, module) {
                    payload.state = proposed;
                }
            }
        }
        Ok(())
    }

    /// Merge `proposed` with a concurrent commit, or explain why not
    fn reconcile(
        &self,
        t: &mut Transaction,
        module: ModuleId,
        base: &StateBlob,
        current: &StateBlob,
        proposed: &StateBlob,
    ) -> std::result::Result<StateBlob, Halt> {
        let Some(mut record) = self.conflicts.detect(module, base, current, proposed) else {
            return match three_way_merge(base, current, proposed, self.config.conflict.region_size)
            {
                MergeOutcome::Clean(merged) => Ok(merged),
                MergeOutcome::Conflicting(paths) => {
                    warn!(txn = %t.id, %module, ?paths, "disjoint changes failed to merge");
                    Err(Error::ConflictUnresolved {
                        module,
                        conflict: self.ids.next_conflict(),
                        severity: ConflictSeverity::Low,
                    }
                    .into())
                }
            };
        };

        if t.is_breaking_for(module) {
            record.escalate_breaking();
        }
        self.events.conflict(ConflictEvent {
            txn: t.id,
            conflict: record.id,
            module,
            conflict_type: record.conflict_type,
            severity: record.severity,
            auto_resolvable: record.auto_resolvable,
        });

        let result = self
            .conflicts
            .resolve(&record, base, current, proposed, t.policy);
        self.metrics.conflict(result.resolved);
        if record.auto_resolvable && t.policy == ConflictPolicy::Abort {
            self.conflicts.learn(&record, result.resolved);
        }

        let (conflict, severity) = (record.id, record.severity);
        t.conflicts.push(record);
        match result.merged {
            Some(merged) if result.resolved => {
                debug!(txn = %t.id, %module, %conflict, strategy = ?result.strategy, "conflict resolved");
                Ok(merged)
            }
            _ => {
                warn!(txn = %t.id, %module, %conflict, ?severity, "conflict unresolved");
                Err(Error::ConflictUnresolved {
                    module,
                    conflict,
                    severity,
                }
                .into())
            }
        }
    }

    /// Ask every participant to prepare its final operation
    fn collect_votes(&self, t: &Transaction) -> std::result::Result<(), Halt> {
        let mut ballots: BTreeMap<ModuleId, Operation> = BTreeMap::new();
        for op in &t.operations {
            ballots.insert(op.module, op.clone());
        }
        if ballots.is_empty() {
            return Ok(());
        }

        let deadline = Instant::now() + self.config.transaction.prepare_timeout();
        let (tx, rx) = crossbeam_channel::bounded(ballots.len());
        let mut pending: BTreeSet<ModuleId> = BTreeSet::new();
        for (module, op) in ballots {
            let runtime = Arc::clone(&self.runtime);
            let tx = tx.clone();
            std::thread::Builder::new()
                .name(format!("prepare-{}", module.raw()))
                .spawn(move || {
                    let vote = runtime.prepare(module, &op);
                    let _ = tx.send((module, vote));
                })
                .map_err(|e| Error::ResourceExhausted(format!("prepare thread: {}", e)))?;
            pending.insert(module);
        }
        drop(tx);

        // After a rejection the remaining votes are still drained until the
        // deadline, so the discard that follows reaches every participant
        // after its prepare.
        let mut rejection: Option<(ModuleId, String)> = None;
        while !pending.is_empty() {
            match rx.recv_deadline(deadline) {
                Ok((module, vote)) => {
                    pending.remove(&module);
                    if let Vote::Abort(reason) = vote {
                        warn!(txn = %t.id, %module, %reason, "participant voted abort");
                        rejection.get_or_insert((module, reason));
                    }
                }
                Err(_) => break,
            }
        }

        if !pending.is_empty() {
            self.discard_late_votes(t.id, rx);
        }
        if let Some((module, reason)) = rejection {
            return Err(Halt::Abort {
                reason: Error::PrepareRejected { module, reason },
                blame: vec![module],
            });
        }
        if !pending.is_empty() {
            let missing: Vec<ModuleId> = pending.into_iter().collect();
            warn!(txn = %t.id, ?missing, "prepare timed out");
            return Err(Halt::Abort {
                reason: Error::PrepareTimeout(missing.clone()),
                blame: missing,
            });
        }
        Ok(())
    }

    /// Discard the prepare of every participant that votes after the deadline
    fn discard_late_votes(&self, txn: TxnId, rx: Receiver<(ModuleId, Vote)>) {
        let runtime = Arc::clone(&self.runtime);
        let spawned = std::thread::Builder::new()
            .name(format!("late-votes-{}", txn.0))
            .spawn(move || {
                for (module, _) in rx.iter() {
                    debug!(%txn, %module, "discarding late prepare");
                    runtime.discard_prepared(module);
                }
            });
        if let Err(e) = spawned {
            error!(%txn, error = %e, "cannot watch for late votes");
        }
    }

    /// Pre-transaction state of every module the transaction wrote
    fn base_states(&self, t: &Transaction) -> Vec<BaseState> {
        t.snapshots
            .iter()
            .filter_map(|(module, id)| match self.snapshots.load(*id) {
                Ok((version, state)) => Some(BaseState {
                    module: *module,
                    version,
                    state,
                }),
                Err(e) => {
                    warn!(txn = %t.id, %module, error = %e, "base state unavailable for replay");
                    None
                }
            })
            .collect()
    }

    /// Abort: discard prepared state, restore snapshots newest first, finish
    ///
    /// A snapshot that cannot be restored turns the abort into a failure.
    pub(crate) fn rollback_and_finish(
        &self,
        t: &mut Transaction,
        reason: Error,
        started: u64,
    ) -> CommitOutcome {
        let voted = matches!(
            t.state,
            TransactionState::Preparing | TransactionState::Prepared | TransactionState::Committing
        );
        if let Err(e) = t.transition(TransactionState::Aborting) {
            error!(txn = %t.id, error = %e, "abort from unexpected state");
        }
        let modules = t.modules();
        if voted {
            for module in &modules {
                self.runtime.discard_prepared(*module);
            }
        }

        let mut restore_error = None;
        for (module, id) in t.snapshots.iter().rev() {
            if let Err(e) = self.snapshots.restore(*id, self.runtime.as_ref()) {
                error!(txn = %t.id, %module, snapshot = %id, error = %e, "restore failed during abort");
                restore_error.get_or_insert(e);
            }
        }
        let duration_us = self.clock.elapsed_since(started);

        if let Some(e) = restore_error {
            if let Err(te) = t.transition(TransactionState::Failed) {
                error!(txn = %t.id, error = %te, "failed transition rejected");
            }
            self.metrics.failed(duration_us);
            self.finish(t);
            self.events.transaction(TransactionEvent::Failed {
                txn: t.id,
                reason: e.to_string(),
                rolled_back: false,
            });
            return CommitOutcome::Failed {
                reason: e,
                recovery: None,
            };
        }

        if let Err(e) = t.transition(TransactionState::Aborted) {
            error!(txn = %t.id, error = %e, "aborted transition rejected");
        }
        if matches!(reason, Error::ConflictUnresolved { .. }) {
            for module in &modules {
                self.health
                    .sample(*module, MetricCategory::ConflictDensity, 1.0);
            }
        }
        self.metrics.aborted(duration_us);
        self.finish(t);

        info!(txn = %t.id, %reason, duration_us, "transaction aborted");
        self.events.transaction(TransactionEvent::Aborted {
            txn: t.id,
            reason: reason.to_string(),
        });
        CommitOutcome::Aborted(reason)
    }

    /// Abort before any module was contacted
    ///
    /// Nothing was prepared or applied, so snapshots are released without
    /// being restored.
    fn abort_untouched(&self, t: &mut Transaction, reason: Error, started: u64) {
        for state in [TransactionState::Aborting, TransactionState::Aborted] {
            if let Err(e) = t.transition(state) {
                error!(txn = %t.id, error = %e, "abort from unexpected state");
            }
        }
        let duration_us = self.clock.elapsed_since(started);
        self.metrics.aborted(duration_us);
        self.finish(t);

        info!(txn = %t.id, %reason, duration_us, "transaction aborted");
        self.events.transaction(TransactionEvent::Aborted {
            txn: t.id,
            reason: reason.to_string(),
        });
    }

    /// Partial apply: hand the transaction to the recovery engine
    fn fail(
        &self,
        t: &mut Transaction,
        reason: Error,
        module: ModuleId,
        started: u64,
    ) -> CommitOutcome {
        if let Err(e) = t.transition(TransactionState::Failed) {
            error!(txn = %t.id, error = %e, "failed transition rejected");
        }
        error!(txn = %t.id, %module, %reason, "commit failed after partial apply");
        for m in t.modules() {
            self.runtime.discard_prepared(m);
        }
        self.breakers.record_failure(module);
        self.health.sample(module, MetricCategory::ErrorRate, 1.0);

        let breaking = t.operations.iter().any(Operation::is_breaking);
        let ctx = ErrorContext::from_error(self.ids.next_error(), module, &reason)
            .with_txn(t.id)
            .breaking(breaking);
        let hooks = RestoreSnapshots {
            store: &self.snapshots,
            runtime: self.runtime.as_ref(),
            snapshots: &t.snapshots,
        };
        let action = self.handle_error(ctx, &hooks);

        let duration_us = self.clock.elapsed_since(started);
        self.metrics.failed(duration_us);
        self.finish(t);

        self.events.transaction(TransactionEvent::Failed {
            txn: t.id,
            reason: reason.to_string(),
            rolled_back: action.success && action.strategy == RecoveryStrategy::Rollback,
        });
        CommitOutcome::Failed {
            reason,
            recovery: Some(action),
        }
    }
}

fn check_cancel(t: &Transaction, cancel: &CancelLatch) -> std::result::Result<(), Halt> {
    if cancel.is_cancelled() {
        debug!(txn = %t.id, state = %t.state, "cancellation observed");
        return Err(Error::Cancelled(t.id).into());
    }
    Ok(())
}

/// The payload that decides `module`'s final state
fn final_payload_mut(t: &mut Transaction, module: ModuleId) -> Option<&mut Payload> {
    t.operations
        .iter_mut()
        .rev()
        .find(|op| op.module == module && op.payload.is_some())
        .and_then(|op| op.payload.as_mut())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::event::{CollectingSubscriber, EngineEvent};
    use crate::recovery::{ErrorCategory, ErrorSeverity};
    use crate::runtime::InMemoryRuntime;
    use crate::txn::{CancelOutcome, Dependency, IsolationLevel, TransactionKind};
    use hotswap_core::{Clock, ManualClock, ModuleState, ModuleVersion, Value};
    use std::time::Duration;

    fn config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.recovery.backoff_base_ms = 0;
        config.recovery.backoff_cap_ms = 0;
        config
    }

    fn blob(state: ModuleState) -> StateBlob {
        state.encode().unwrap()
    }

    fn decode(blob: &StateBlob) -> ModuleState {
        ModuleState::decode(blob.as_bytes()).unwrap()
    }

    fn setup_with(config: EngineConfig, modules: &[u32]) -> (Arc<InMemoryRuntime>, Engine) {
        let runtime = Arc::new(InMemoryRuntime::new());
        for &m in modules {
            runtime.load(
                ModuleVersion::new(ModuleId(m), 1),
                blob(ModuleState::new().with("x", 1i64).with("name", "a")),
            );
        }
        let engine = Engine::new(runtime.clone(), config).unwrap();
        for &m in modules {
            engine.register_module(ModuleId(m)).unwrap();
        }
        (runtime, engine)
    }

    fn setup(modules: &[u32]) -> (Arc<InMemoryRuntime>, Engine) {
        setup_with(config(), modules)
    }

    fn begin(engine: &Engine) -> TxnId {
        engine
            .begin_transaction(TransactionKind::SingleModule, IsolationLevel::Serializable)
            .unwrap()
    }

    fn install(m: u32, version: u64, state: ModuleState) -> Operation {
        Operation::install(ModuleVersion::new(ModuleId(m), version), blob(state))
    }

    #[test]
    fn test_simple_swap_commits() {
        let (runtime, engine) = setup(&[1]);
        let m = ModuleId(1);
        let new = blob(ModuleState::new().with("x", 2i64));

        let swap = engine
            .request_swap(ModuleVersion::new(m, 2), new.clone())
            .unwrap();
        assert!(swap.outcome.is_committed());
        assert_eq!(runtime.state_of(m), Some(new.clone()));
        assert_eq!(engine.live_version(m).unwrap().version_id(), 2);
        assert_eq!(engine.live_state(m), Some(new));
        assert_eq!(
            engine.transaction_state(swap.txn),
            Some(TransactionState::Committed)
        );
        assert!(engine.committed(swap.txn).is_some());

        let metrics = engine.metrics();
        assert_eq!(metrics.transactions_committed, 1);
        assert_eq!(metrics.active_transactions, 0);
        assert_eq!(engine.open_transactions(), 0);
        assert_eq!(engine.snapshot_stats().live, 0);
        assert_eq!(runtime.discard_count(m), 0);
    }

    #[test]
    fn test_string_conflict_aborts_second_writer() {
        let (runtime, engine) = setup(&[1]);
        let m = ModuleId(1);
        let t1 = begin(&engine);
        let t2 = begin(&engine);

        engine
            .add_operation(t1, install(1, 2, ModuleState::new().with("x", 1i64).with("name", "b")))
            .unwrap();
        assert!(engine.commit(t1).unwrap().is_committed());
        let after_t1 = runtime.state_of(m).unwrap();

        engine
            .add_operation(t2, install(1, 3, ModuleState::new().with("x", 1i64).with("name", "c")))
            .unwrap();
        let outcome = engine.commit(t2).unwrap();
        match outcome.reason() {
            Some(Error::ConflictUnresolved { module, .. }) => assert_eq!(*module, m),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(outcome.is_aborted());

        assert_eq!(runtime.state_of(m), Some(after_t1));
        assert_eq!(engine.live_version(m).unwrap().version_id(), 2);
        assert_eq!(engine.conflict_stats().detected, 1);
        assert_eq!(engine.metrics().transactions_aborted, 1);
        assert_eq!(runtime.apply_count(m), 1);
    }

    #[test]
    fn test_disjoint_changes_merge_on_commit() {
        let (runtime, engine) = setup(&[1]);
        let m = ModuleId(1);
        let t1 = begin(&engine);
        let t2 = begin(&engine);

        engine
            .add_operation(t1, install(1, 2, ModuleState::new().with("x", 2i64).with("name", "a")))
            .unwrap();
        assert!(engine.commit(t1).unwrap().is_committed());

        engine
            .add_operation(t2, install(1, 3, ModuleState::new().with("x", 1i64).with("name", "z")))
            .unwrap();
        assert!(engine.commit(t2).unwrap().is_committed());

        let live = decode(&runtime.state_of(m).unwrap());
        assert_eq!(live.get("x"), Some(&Value::Int(2)));
        assert_eq!(live.get("name"), Some(&Value::from("z")));
        assert_eq!(engine.live_version(m).unwrap().version_id(), 3);
        assert_eq!(engine.live_state(m), runtime.state_of(m));
        assert_eq!(engine.conflict_stats().detected, 0);

        let record = engine.committed(t2).unwrap();
        assert_eq!(record.operations[0].payload.as_ref().map(|p| &p.state), runtime.state_of(m).as_ref());
    }

    fn hits(n: i64) -> ModuleState {
        let mut state = ModuleState::new().with("x", 1i64).with("name", "a");
        state.set_path("counters.hits", Value::Int(n)).unwrap();
        state
    }

    #[test]
    fn test_counter_conflict_merges_additively() {
        let (runtime, engine) = setup(&[1]);
        let events = Arc::new(CollectingSubscriber::new());
        engine.subscribe(events.clone());
        let m = ModuleId(1);
        engine
            .request_swap(ModuleVersion::new(m, 2), blob(hits(1)))
            .unwrap();

        let t1 = begin(&engine);
        let t2 = begin(&engine);
        engine.add_operation(t1, install(1, 3, hits(6))).unwrap();
        assert!(engine.commit(t1).unwrap().is_committed());
        engine.add_operation(t2, install(1, 4, hits(3))).unwrap();
        assert!(engine.commit(t2).unwrap().is_committed());

        let live = decode(&runtime.state_of(m).unwrap());
        assert_eq!(live.get_path("counters.hits"), Some(&Value::Int(8)));

        let metrics = engine.metrics();
        assert_eq!(metrics.conflicts_detected, 1);
        assert_eq!(metrics.conflicts_auto_resolved, 1);
        assert!(events
            .events()
            .iter()
            .any(|e| matches!(e, EngineEvent::Conflict(r) if r.event.txn == t2)));
    }

    #[test]
    fn test_plain_numeric_conflict_aborts_second_writer() {
        let (runtime, engine) = setup(&[1]);
        let m = ModuleId(1);
        let t1 = begin(&engine);
        let t2 = begin(&engine);

        engine
            .add_operation(t1, install(1, 2, ModuleState::new().with("x", 6i64).with("name", "a")))
            .unwrap();
        assert!(engine.commit(t1).unwrap().is_committed());
        engine
            .add_operation(t2, install(1, 3, ModuleState::new().with("x", 3i64).with("name", "a")))
            .unwrap();
        let outcome = engine.commit(t2).unwrap();
        assert!(matches!(
            outcome.reason(),
            Some(Error::ConflictUnresolved { module, .. }) if *module == m
        ));

        let live = decode(&runtime.state_of(m).unwrap());
        assert_eq!(live.get("x"), Some(&Value::Int(6)));
        assert_eq!(engine.live_version(m).unwrap().version_id(), 2);
        assert_eq!(engine.metrics().conflicts_auto_resolved, 0);
    }

    #[test]
    fn test_force_keep_current_installs_version_with_live_state() {
        let (runtime, engine) = setup(&[1]);
        let m = ModuleId(1);
        let t1 = begin(&engine);
        let t2 = begin(&engine);
        engine.set_conflict_policy(t2, ConflictPolicy::ForceKeepCurrent).unwrap();

        engine
            .add_operation(t1, install(1, 2, ModuleState::new().with("x", 1i64).with("name", "b")))
            .unwrap();
        assert!(engine.commit(t1).unwrap().is_committed());
        let after_t1 = runtime.state_of(m).unwrap();

        engine
            .add_operation(t2, install(1, 3, ModuleState::new().with("x", 1i64).with("name", "c")))
            .unwrap();
        assert!(engine.commit(t2).unwrap().is_committed());
        assert_eq!(runtime.state_of(m), Some(after_t1));
        assert_eq!(engine.live_version(m).unwrap().version_id(), 3);
        assert_eq!(engine.conflict_stats().forced, 1);
    }

    #[test]
    fn test_partial_apply_failure_rolls_back_every_module() {
        let (runtime, engine) = setup(&[1, 2, 3]);
        let before: Vec<_> = (1..=3).map(|m| runtime.state_of(ModuleId(m))).collect();
        runtime.fail_apply(ModuleId(3));

        let txn = engine
            .begin_transaction(TransactionKind::Batch, IsolationLevel::Serializable)
            .unwrap();
        engine
            .add_operations(
                txn,
                (1..=3)
                    .map(|m| install(m, 2, ModuleState::new().with("x", 9i64)))
                    .collect(),
            )
            .unwrap();

        let outcome = engine.commit(txn).unwrap();
        assert!(outcome.is_failed());
        assert!(outcome.rolled_back());
        assert!(matches!(
            outcome.reason(),
            Some(Error::ApplyFailed { partial: true, .. })
        ));
        assert!(outcome.reason().unwrap().requires_attention());
        match &outcome {
            CommitOutcome::Failed {
                recovery: Some(action),
                ..
            } => assert_eq!(action.strategy, RecoveryStrategy::Rollback),
            other => panic!("unexpected outcome {:?}", other),
        }

        for (i, m) in (1..=3).map(ModuleId).enumerate() {
            assert_eq!(runtime.current_version(m).unwrap().version_id(), 1);
            assert_eq!(runtime.state_of(m), before[i]);
            assert_eq!(engine.live_version(m).unwrap().version_id(), 1);
        }
        assert_eq!(engine.transaction_state(txn), Some(TransactionState::Failed));
        assert_eq!(engine.metrics().transactions_failed, 1);
        assert_eq!(engine.snapshot_stats().live, 0);
    }

    #[test]
    fn test_rollback_continues_past_failed_restore() {
        let (runtime, engine) = setup(&[1, 2, 3]);
        let before: Vec<_> = (1..=3).map(|m| runtime.state_of(ModuleId(m))).collect();
        runtime.fail_apply(ModuleId(3));
        runtime.fail_restore(ModuleId(3));

        let txn = engine
            .begin_transaction(TransactionKind::Batch, IsolationLevel::Serializable)
            .unwrap();
        engine
            .add_operations(
                txn,
                (1..=3)
                    .map(|m| install(m, 2, ModuleState::new().with("x", 9i64)))
                    .collect(),
            )
            .unwrap();

        let outcome = engine.commit(txn).unwrap();
        assert!(outcome.is_failed());
        assert!(!outcome.rolled_back());
        let CommitOutcome::Failed {
            recovery: Some(action),
            ..
        } = &outcome
        else {
            panic!("unexpected outcome {:?}", outcome);
        };
        assert!(!action.success);
        assert!(action
            .steps
            .iter()
            .any(|s| s.description.contains("could not restore module:3")
                && s.description.contains("restored [module:2, module:1]")));

        for (i, m) in (1..=2).map(ModuleId).enumerate() {
            assert_eq!(runtime.current_version(m).unwrap().version_id(), 1);
            assert_eq!(runtime.state_of(m), before[i]);
            assert_eq!(runtime.restore_count(m), 1);
        }
        assert!(engine.is_isolated(ModuleId(3)));
    }

    #[test]
    fn test_repeated_apply_failures_open_circuit() {
        let (runtime, engine) = setup(&[1]);
        let m = ModuleId(1);
        runtime.fail_apply(m);

        for version in 2..7 {
            let swap = engine
                .request_swap(
                    ModuleVersion::new(m, version),
                    blob(ModuleState::new().with("x", version as i64)),
                )
                .unwrap();
            assert!(matches!(
                swap.outcome.reason(),
                Some(Error::ApplyFailed { partial: false, .. })
            ));
        }
        assert_eq!(engine.get_circuit_state(m), crate::CircuitState::Open);
        assert_eq!(runtime.apply_count(m), 5);

        let rejected = engine.request_swap(ModuleVersion::new(m, 7), blob(ModuleState::new()));
        assert!(matches!(rejected, Err(Error::CircuitOpen(id)) if id == m));
        assert_eq!(runtime.apply_count(m), 5);
        assert_eq!(engine.metrics().circuit_rejections, 1);
        assert_eq!(runtime.current_version(m).unwrap().version_id(), 1);
    }

    #[test]
    fn test_circuit_opened_mid_transaction_leaves_modules_untouched() {
        let (runtime, engine) = setup(&[1, 2]);
        let txn = engine
            .begin_transaction(TransactionKind::Batch, IsolationLevel::Serializable)
            .unwrap();
        engine
            .add_operations(
                txn,
                vec![
                    install(1, 2, ModuleState::new().with("x", 2i64)),
                    install(2, 2, ModuleState::new().with("x", 2i64)),
                ],
            )
            .unwrap();
        engine.breakers.force_open(ModuleId(2));

        assert!(matches!(
            engine.commit(txn),
            Err(Error::CircuitOpen(id)) if id == ModuleId(2)
        ));
        for m in [ModuleId(1), ModuleId(2)] {
            assert_eq!(runtime.restore_count(m), 0);
            assert_eq!(runtime.apply_count(m), 0);
            assert_eq!(runtime.prepare_count(m), 0);
            assert_eq!(runtime.discard_count(m), 0);
        }
        assert_eq!(engine.transaction_state(txn), Some(TransactionState::Aborted));
        assert_eq!(engine.get_circuit_state(ModuleId(1)), crate::CircuitState::Closed);
        assert_eq!(engine.snapshot_stats().live, 0);
        let metrics = engine.metrics();
        assert_eq!(metrics.circuit_rejections, 1);
        assert_eq!(metrics.transactions_aborted, 1);
    }

    #[test]
    fn test_prepare_rejection_aborts_all_participants() {
        let (runtime, engine) = setup(&[1, 2]);
        runtime.reject_prepare(ModuleId(2), "not ready");

        let txn = begin(&engine);
        engine
            .add_operations(
                txn,
                vec![
                    install(1, 2, ModuleState::new().with("x", 2i64)),
                    install(2, 2, ModuleState::new().with("x", 2i64)),
                ],
            )
            .unwrap();
        let outcome = engine.commit(txn).unwrap();
        assert!(matches!(
            outcome.reason(),
            Some(Error::PrepareRejected { module, .. }) if *module == ModuleId(2)
        ));
        for m in [ModuleId(1), ModuleId(2)] {
            assert_eq!(runtime.apply_count(m), 0);
            assert!(runtime.discard_count(m) >= 1);
            assert!(!runtime.is_prepared(m));
            assert_eq!(runtime.current_version(m).unwrap().version_id(), 1);
        }
    }

    #[test]
    fn test_prepare_timeout_aborts() {
        let mut config = config();
        config.transaction.prepare_timeout_ms = 20;
        let (runtime, engine) = setup_with(config, &[1]);
        let m = ModuleId(1);
        runtime.delay_prepare(m, Duration::from_millis(200));

        let swap = engine
            .request_swap(ModuleVersion::new(m, 2), blob(ModuleState::new()))
            .unwrap();
        assert!(matches!(
            swap.outcome.reason(),
            Some(Error::PrepareTimeout(missing)) if missing == &vec![m]
        ));
        assert_eq!(runtime.apply_count(m), 0);
        assert_eq!(engine.live_version(m).unwrap().version_id(), 1);

        // the late vote still lands and must not leave the module prepared
        std::thread::sleep(Duration::from_millis(400));
        assert_eq!(runtime.prepare_count(m), 1);
        assert!(!runtime.is_prepared(m));
        assert!(runtime.discard_count(m) >= 2);
    }

    #[test]
    fn test_cancel_idle_transaction() {
        let (runtime, engine) = setup(&[1]);
        let m = ModuleId(1);
        let before = runtime.state_of(m);
        let txn = begin(&engine);
        engine
            .add_operation(txn, install(1, 2, ModuleState::new()))
            .unwrap();

        assert_eq!(engine.cancel(txn).unwrap(), CancelOutcome::Aborted);
        assert_eq!(engine.transaction_state(txn), Some(TransactionState::Aborted));
        assert!(matches!(
            engine.commit(txn),
            Err(Error::TransactionNotFound(id)) if id == txn
        ));
        assert_eq!(runtime.state_of(m), before);
        assert_eq!(runtime.apply_count(m), 0);
    }

    fn wait_until(done: impl Fn() -> bool) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(std::time::Instant::now() < deadline, "condition never held");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_cancel_during_apply_is_too_late() {
        let (runtime, engine) = setup(&[1]);
        let engine = Arc::new(engine);
        let m = ModuleId(1);
        runtime.delay_apply(m, Duration::from_millis(200));
        let txn = begin(&engine);
        engine
            .add_operation(txn, install(1, 2, ModuleState::new().with("x", 2i64)))
            .unwrap();

        let committer = {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || engine.commit(txn).unwrap())
        };
        wait_until(|| runtime.apply_count(m) == 1);

        let cancelled = engine.cancel(txn).unwrap();
        assert_eq!(cancelled, CancelOutcome::TooLate);
        assert!(!cancelled.is_honored());
        assert!(committer.join().unwrap().is_committed());
        assert_eq!(engine.live_version(m).unwrap().version_id(), 2);
    }

    #[test]
    fn test_cancel_during_prepare_aborts_commit() {
        let mut config = config();
        config.transaction.prepare_timeout_ms = 5_000;
        let (runtime, engine) = setup_with(config, &[1]);
        let engine = Arc::new(engine);
        let m = ModuleId(1);
        runtime.delay_prepare(m, Duration::from_millis(200));
        let txn = begin(&engine);
        engine
            .add_operation(txn, install(1, 2, ModuleState::new()))
            .unwrap();

        let committer = {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || engine.commit(txn).unwrap())
        };
        wait_until(|| runtime.prepare_count(m) == 1);

        assert_eq!(engine.cancel(txn).unwrap(), CancelOutcome::Requested);
        let outcome = committer.join().unwrap();
        assert!(matches!(outcome.reason(), Some(Error::Cancelled(id)) if *id == txn));
        assert_eq!(runtime.apply_count(m), 0);
        assert!(!runtime.is_prepared(m));
        assert_eq!(engine.live_version(m).unwrap().version_id(), 1);
    }

    #[test]
    fn test_abort_restores_captured_state() {
        let (runtime, engine) = setup(&[1]);
        let m = ModuleId(1);
        let original = runtime.state_of(m).unwrap();
        let txn = begin(&engine);
        engine
            .add_operation(txn, install(1, 2, ModuleState::new()))
            .unwrap();

        // the live module drifts while the transaction is open
        runtime.load(ModuleVersion::new(m, 1), StateBlob::new(vec![0xde, 0xad]));

        let outcome = engine.abort(txn).unwrap();
        assert!(outcome.is_aborted());
        assert_eq!(runtime.state_of(m).unwrap().as_bytes(), original.as_bytes());
        assert_eq!(engine.snapshot_stats().live, 0);
    }

    #[test]
    fn test_abort_expired_with_manual_clock() {
        let runtime = Arc::new(InMemoryRuntime::new());
        let m = ModuleId(1);
        runtime.load(ModuleVersion::new(m, 1), blob(ModuleState::new()));
        let clock = Arc::new(ManualClock::new(1_000));
        let engine = Engine::with_clock(runtime.clone(), config(), clock.clone()).unwrap();
        engine.register_module(m).unwrap();

        let txn = begin(&engine);
        engine
            .add_operation(txn, install(1, 2, ModuleState::new()))
            .unwrap();
        assert!(engine.abort_expired().is_empty());

        clock.advance_ms(engine.config().transaction.transaction_timeout_ms + 1);
        assert_eq!(engine.abort_expired(), vec![txn]);
        assert_eq!(engine.transaction_state(txn), Some(TransactionState::Aborted));
        assert!(clock.now_micros() > 1_000);
    }

    #[test]
    fn test_max_concurrent_transactions() {
        let mut config = config();
        config.transaction.max_concurrent = 1;
        let (_runtime, engine) = setup_with(config, &[1]);

        let first = begin(&engine);
        assert!(matches!(
            engine.begin_transaction(TransactionKind::Batch, IsolationLevel::ReadCommitted),
            Err(Error::ResourceExhausted(_))
        ));
        engine.abort(first).unwrap();
        assert!(engine
            .begin_transaction(TransactionKind::Batch, IsolationLevel::ReadCommitted)
            .is_ok());
    }

    #[test]
    fn test_isolated_module_rejects_operations() {
        let (_runtime, engine) = setup(&[1, 2]);
        let m = ModuleId(1);
        engine.register_dependency(ModuleId(2), m);

        let action = engine.report_error(m, ErrorCategory::Memory, ErrorSeverity::High, "leak");
        assert_eq!(action.strategy, RecoveryStrategy::Isolate);
        assert_eq!(action.dependents_notified, vec![ModuleId(2)]);
        assert!(engine.is_isolated(m));

        let txn = begin(&engine);
        assert!(matches!(
            engine.add_operation(txn, install(1, 2, ModuleState::new())),
            Err(Error::ModuleIsolated(id)) if id == m
        ));
        assert!(engine.release_isolation(m));
        assert!(engine
            .add_operation(txn, install(1, 2, ModuleState::new()))
            .is_ok());
    }

    #[test]
    fn test_dependencies_checked_at_commit() {
        let (_runtime, engine) = setup(&[1, 2]);

        let txn = begin(&engine);
        engine
            .add_operation(txn, install(1, 2, ModuleState::new()))
            .unwrap();
        engine
            .add_dependency(txn, Dependency::critical(ModuleId(2), 5))
            .unwrap();
        assert!(matches!(
            engine.commit(txn).unwrap().reason(),
            Some(Error::DependencyUnsatisfied { required, required_version: 5, .. })
                if *required == ModuleId(2)
        ));

        let txn = begin(&engine);
        engine
            .add_operation(txn, install(1, 2, ModuleState::new()))
            .unwrap();
        engine
            .add_dependency(txn, Dependency::optional(ModuleId(2), 5))
            .unwrap();
        assert!(engine.commit(txn).unwrap().is_committed());

        // satisfied by the transaction's own payload
        let txn = begin(&engine);
        engine
            .add_operations(
                txn,
                vec![
                    install(1, 3, ModuleState::new()),
                    install(2, 5, ModuleState::new()),
                ],
            )
            .unwrap();
        engine
            .add_dependency(txn, Dependency::critical(ModuleId(2), 5))
            .unwrap();
        assert!(engine.commit(txn).unwrap().is_committed());
    }

    #[test]
    fn test_downgrade_rejected() {
        let (runtime, engine) = setup(&[1]);
        let m = ModuleId(1);
        assert!(engine
            .request_swap(ModuleVersion::new(m, 5), blob(ModuleState::new()))
            .unwrap()
            .outcome
            .is_committed());

        for requested in [2, 5] {
            let result = engine.request_swap(ModuleVersion::new(m, requested), blob(ModuleState::new()));
            assert!(matches!(
                result,
                Err(Error::VersionRegression { module, live: 5, requested: r })
                    if module == m && r == requested
            ));
        }
        assert_eq!(engine.live_version(m).unwrap().version_id(), 5);
        assert_eq!(runtime.current_version(m).unwrap().version_id(), 5);
        assert_eq!(runtime.apply_count(m), 1);
        assert_eq!(engine.open_transactions(), 0);
    }

    #[test]
    fn test_rollback_operation_may_lower_version() {
        let (runtime, engine) = setup(&[1]);
        let m = ModuleId(1);
        let original = runtime.state_of(m).unwrap();
        engine
            .request_swap(ModuleVersion::new(m, 2), blob(ModuleState::new()))
            .unwrap();

        let txn = begin(&engine);
        engine
            .add_operation(txn, Operation::rollback_to(ModuleVersion::new(m, 1), original))
            .unwrap();
        assert!(engine.commit(txn).unwrap().is_committed());
        assert_eq!(engine.live_version(m).unwrap().version_id(), 1);
    }

    #[test]
    fn test_install_overtaken_before_commit_aborts() {
        let (runtime, engine) = setup(&[1]);
        let m = ModuleId(1);
        let txn = begin(&engine);
        engine
            .add_operation(txn, install(1, 3, ModuleState::new()))
            .unwrap();

        // the module moves past the staged version outside the transaction
        runtime.load(ModuleVersion::new(m, 4), blob(ModuleState::new()));
        engine.register_module(m).unwrap();

        let outcome = engine.commit(txn).unwrap();
        assert!(outcome.is_aborted());
        assert!(matches!(
            outcome.reason(),
            Some(Error::VersionRegression { live: 4, requested: 3, .. })
        ));
        assert_eq!(runtime.apply_count(m), 0);
        assert_eq!(engine.live_version(m).unwrap().version_id(), 4);
    }

    #[test]
    fn test_replay_reproduces_committed_state() {
        let (runtime, engine) = setup(&[1, 2]);
        let txn = begin(&engine);
        engine
            .add_operations(
                txn,
                vec![
                    install(1, 2, ModuleState::new().with("x", 5i64)),
                    Operation::deactivate(ModuleId(2)),
                    install(2, 4, ModuleState::new().with("name", "b")),
                ],
            )
            .unwrap();
        assert!(engine.commit(txn).unwrap().is_committed());
        let record = engine.committed(txn).unwrap();
        assert_eq!(record.before.len(), 2);

        let replica = InMemoryRuntime::new();
        for m in [ModuleId(1), ModuleId(2)] {
            replica.load(ModuleVersion::new(m, 7), StateBlob::new(vec![7]));
        }
        Engine::replay(&record, &replica).unwrap();
        for m in [ModuleId(1), ModuleId(2)] {
            assert_eq!(replica.state_of(m), runtime.state_of(m));
            assert_eq!(replica.current_version(m), runtime.current_version(m));
        }
    }

    #[test]
    fn test_transaction_events_in_order() {
        let (runtime, engine) = setup(&[1]);
        let events = Arc::new(CollectingSubscriber::new());
        engine.subscribe(events.clone());
        let m = ModuleId(1);

        let ok = engine
            .request_swap(ModuleVersion::new(m, 2), blob(ModuleState::new()))
            .unwrap();
        runtime.reject_prepare(m, "busy");
        let rejected = engine
            .request_swap(ModuleVersion::new(m, 3), blob(ModuleState::new()))
            .unwrap();

        let seen = events.transactions();
        assert_eq!(seen.len(), 4);
        assert!(matches!(seen[0], TransactionEvent::Started { txn, .. } if txn == ok.txn));
        assert!(matches!(seen[1], TransactionEvent::Committed { txn, .. } if txn == ok.txn));
        assert!(matches!(seen[2], TransactionEvent::Started { txn, .. } if txn == rejected.txn));
        assert!(matches!(seen[3], TransactionEvent::Aborted { txn, .. } if txn == rejected.txn));
    }

    #[test]
    fn test_commit_requires_active_transaction() {
        let (_runtime, engine) = setup(&[1]);
        let txn = begin(&engine);
        engine
            .add_operation(txn, install(1, 2, ModuleState::new()))
            .unwrap();
        assert!(engine.commit(txn).unwrap().is_committed());
        assert!(matches!(
            engine.commit(txn),
            Err(Error::TransactionNotFound(_))
        ));
        assert!(matches!(
            engine.add_operation(txn, Operation::activate(ModuleId(1))),
            Err(Error::TransactionNotFound(_))
        ));
    }

    #[test]
    fn test_parallel_commits_on_distinct_modules() {
        let (runtime, engine) = setup(&[1, 2, 3, 4]);
        let engine = Arc::new(engine);

        let handles: Vec<_> = (1..=4u32)
            .map(|m| {
                let engine = Arc::clone(&engine);
                std::thread::spawn(move || {
                    engine
                        .request_swap(
                            ModuleVersion::new(ModuleId(m), 2),
                            blob(ModuleState::new().with("x", m as i64)),
                        )
                        .unwrap()
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap().outcome.is_committed());
        }
        for m in 1..=4u32 {
            assert_eq!(runtime.current_version(ModuleId(m)).unwrap().version_id(), 2);
        }
        assert_eq!(engine.metrics().transactions_committed, 4);
    }
}
