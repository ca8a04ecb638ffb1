//! Error classification and recovery
//!
//! [`RecoveryEngine::handle`] turns an [`ErrorContext`] into a
//! [`RecoveryAction`]:
//!
//! ```text
//!   category x severity ──► default strategy
//!                               │
//!        breaking change? ──────┼──► ManualIntervention
//!        valid high-risk        │
//!        prediction? ───────────┼──► Isolate (instead of Retry / Degrade)
//!        breaker open? ─────────┼──► CircuitBreak (instead of Retry)
//!                               ▼
//!                           execute ──► step log, analytics, RecoveryEvent
//! ```
//!
//! Work that only the owner of the failed transaction can do (re-running
//! the failed call, restoring snapshots) is delegated through
//! [`RecoveryHooks`].

use crate::breaker::BreakerRegistry;
use crate::config::RecoveryConfig;
use crate::conflict::ConflictSeverity;
use crate::event::{EventBus, RecoveryEvent};
use crate::health::{HealthMonitor, HealthSignal};
use crate::Error;
use hotswap_core::{ActionId, Clock, ErrorId, IdAllocator, ModuleId, TxnId};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use tracing::{error, info, warn};

/// What kind of fault occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorCategory {
    Memory,
    Transaction,
    Conflict,
    ResourceExhaustion,
    Corruption,
    Deadlock,
    Timeout,
    Io,
}

impl ErrorCategory {
    /// Category of an engine error
    pub fn of(err: &Error) -> Self {
        match err {
            Error::ConflictUnresolved { .. } => ErrorCategory::Conflict,
            Error::SnapshotCorrupt(..) | Error::Core(_) => ErrorCategory::Corruption,
            Error::PrepareTimeout(_) | Error::IntentTimeout { .. } => ErrorCategory::Timeout,
            Error::LockOrder { .. } => ErrorCategory::Deadlock,
            Error::ResourceExhausted(_) | Error::CircuitOpen(_) => {
                ErrorCategory::ResourceExhaustion
            }
            Error::CaptureFailed { .. } => ErrorCategory::Memory,
            Error::Runtime(_) => ErrorCategory::Io,
            _ => ErrorCategory::Transaction,
        }
    }
}

/// How bad a fault is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Info,
    Low,
    Medium,
    High,
    Critical,
    Fatal,
}

impl ErrorSeverity {
    /// Severity of an engine error
    pub fn of(err: &Error) -> Self {
        match err {
            Error::ApplyFailed { partial: true, .. } | Error::SnapshotCorrupt(..) => {
                ErrorSeverity::Critical
            }
            Error::ApplyFailed { .. } | Error::ResourceExhausted(_) => ErrorSeverity::High,
            Error::ConflictUnresolved { severity, .. } => match severity {
                ConflictSeverity::Info => ErrorSeverity::Info,
                ConflictSeverity::Low => ErrorSeverity::Low,
                ConflictSeverity::Medium => ErrorSeverity::Medium,
                ConflictSeverity::High => ErrorSeverity::High,
                ConflictSeverity::Critical => ErrorSeverity::Critical,
            },
            Error::IntentTimeout { .. } | Error::LockOrder { .. } => ErrorSeverity::Low,
            _ => ErrorSeverity::Medium,
        }
    }
}

/// Recovery strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RecoveryStrategy {
    /// Bounded attempts with exponential backoff
    Retry,
    /// Restore the owning transaction's snapshots
    Rollback,
    /// Open the module's breaker
    CircuitBreak,
    /// Mark the module non-essential and keep going
    GracefulDegradation,
    /// Cordon the module and notify its dependents
    Isolate,
    /// Surface to an operator; nothing is done automatically
    ManualIntervention,
}

/// Default strategy for a category and severity
pub fn default_strategy(category: ErrorCategory, severity: ErrorSeverity) -> RecoveryStrategy {
    use ErrorCategory as C;
    use ErrorSeverity as S;
    use RecoveryStrategy as R;

    match (category, severity) {
        (C::Memory | C::Corruption, S::Fatal) => R::Isolate,
        (_, S::Fatal) => R::ManualIntervention,
        (C::Corruption, _) => R::Rollback,
        (C::Memory, S::High | S::Critical) => R::Isolate,
        (C::Memory, _) => R::Rollback,
        (C::Transaction, S::Info | S::Low | S::Medium) => R::Retry,
        (C::Transaction, _) => R::Rollback,
        (C::Conflict, S::Info | S::Low) => R::Retry,
        (C::Conflict, _) => R::Rollback,
        (C::ResourceExhaustion, S::Critical) => R::CircuitBreak,
        (C::ResourceExhaustion, _) => R::GracefulDegradation,
        (C::Deadlock, S::Critical) => R::Rollback,
        (C::Deadlock, _) => R::Retry,
        (C::Timeout | C::Io, S::Critical) => R::CircuitBreak,
        (C::Timeout, S::High) => R::CircuitBreak,
        (C::Io, S::High) => R::GracefulDegradation,
        (C::Timeout | C::Io, _) => R::Retry,
    }
}

/// Description of a fault handed to the recovery engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub id: ErrorId,
    pub module: ModuleId,
    pub txn: Option<TxnId>,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub message: String,
    /// The fault involves a breaking module version
    pub breaking_change: bool,
}

impl ErrorContext {
    pub fn new(
        id: ErrorId,
        module: ModuleId,
        category: ErrorCategory,
        severity: ErrorSeverity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id,
            module,
            txn: None,
            category,
            severity,
            message: message.into(),
            breaking_change: false,
        }
    }

    /// Context classified from an engine error
    pub fn from_error(id: ErrorId, module: ModuleId, err: &Error) -> Self {
        Self::new(
            id,
            module,
            ErrorCategory::of(err),
            ErrorSeverity::of(err),
            err.to_string(),
        )
    }

    pub fn with_txn(mut self, txn: TxnId) -> Self {
        self.txn = Some(txn);
        self
    }

    pub fn breaking(mut self, breaking: bool) -> Self {
        self.breaking_change = breaking;
        self
    }
}

/// Strategy work delegated to whoever owns the failed call
pub trait RecoveryHooks {
    /// Re-run the failed call; `attempt` is zero-based
    fn retry(&self, _ctx: &ErrorContext, _attempt: u32) -> bool {
        false
    }

    /// Restore the owning transaction's snapshots, returning the restored modules
    fn rollback(&self, ctx: &ErrorContext) -> std::result::Result<Vec<ModuleId>, String>;
}

/// Hooks for errors reported outside any transaction
pub struct NoHooks;

impl RecoveryHooks for NoHooks {
    fn rollback(&self, ctx: &ErrorContext) -> std::result::Result<Vec<ModuleId>, String> {
        Err(format!("no transaction to roll back for {}", ctx.module))
    }
}

/// One entry of a recovery step log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryStep {
    pub at: u64,
    pub description: String,
}

/// Audit record of one recovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAction {
    pub id: ActionId,
    pub error: ErrorId,
    pub module: ModuleId,
    pub txn: Option<TxnId>,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    /// Strategy that was finally executed
    pub strategy: RecoveryStrategy,
    pub steps: Vec<RecoveryStep>,
    pub success: bool,
    pub duration_us: u64,
    pub over_budget: bool,
    pub dependents_notified: Vec<ModuleId>,
}

/// Aggregate view over every recovery run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAnalytics {
    pub total: u64,
    pub successful: u64,
    pub by_category: BTreeMap<ErrorCategory, u64>,
    pub by_severity: BTreeMap<ErrorSeverity, u64>,
    pub by_strategy: BTreeMap<RecoveryStrategy, u64>,
    pub fastest_us: Option<u64>,
    pub slowest_us: Option<u64>,
    pub total_us: u64,
    pub budget_overruns: u64,
}

impl RecoveryAnalytics {
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.successful as f64 / self.total as f64
        }
    }

    pub fn average_us(&self) -> u64 {
        self.total_us.checked_div(self.total).unwrap_or(0)
    }

    fn record(&mut self, action: &RecoveryAction) {
        self.total += 1;
        if action.success {
            self.successful += 1;
        }
        *self.by_category.entry(action.category).or_default() += 1;
        *self.by_severity.entry(action.severity).or_default() += 1;
        *self.by_strategy.entry(action.strategy).or_default() += 1;
        self.fastest_us = Some(self.fastest_us.map_or(action.duration_us, |f| f.min(action.duration_us)));
        self.slowest_us = Some(self.slowest_us.map_or(action.duration_us, |s| s.max(action.duration_us)));
        self.total_us += action.duration_us;
        if action.over_budget {
            self.budget_overruns += 1;
        }
    }
}

#[derive(Debug, Default)]
struct Cordons {
    isolated: BTreeSet<ModuleId>,
    degraded: BTreeSet<ModuleId>,
    /// module -> modules that depend on it
    dependents: BTreeMap<ModuleId, BTreeSet<ModuleId>>,
}

impl Cordons {
    /// Every module that transitively depends on `module`
    fn dependents_of(&self, module: ModuleId) -> Vec<ModuleId> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![module];
        while let Some(next) = stack.pop() {
            for dependent in self.dependents.get(&next).into_iter().flatten() {
                if *dependent != module && seen.insert(*dependent) {
                    stack.push(*dependent);
                }
            }
        }
        seen.into_iter().collect()
    }
}

/// Selects and executes recovery strategies
pub struct RecoveryEngine {
    config: RecoveryConfig,
    clock: Arc<dyn Clock>,
    ids: Arc<IdAllocator>,
    breakers: Arc<BreakerRegistry>,
    health: Arc<HealthMonitor>,
    events: Arc<EventBus>,
    cordons: RwLock<Cordons>,
    history: Mutex<VecDeque<RecoveryAction>>,
    analytics: Mutex<RecoveryAnalytics>,
}

impl RecoveryEngine {
    pub fn new(
        config: RecoveryConfig,
        clock: Arc<dyn Clock>,
        ids: Arc<IdAllocator>,
        breakers: Arc<BreakerRegistry>,
        health: Arc<HealthMonitor>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            clock,
            ids,
            breakers,
            health,
            events,
            cordons: RwLock::new(Cordons::default()),
            history: Mutex::new(VecDeque::new()),
            analytics: Mutex::new(RecoveryAnalytics::default()),
        }
    }

    /// Record that `dependent` relies on `on`
    pub fn register_dependency(&self, dependent: ModuleId, on: ModuleId) {
        self.cordons
            .write()
            .dependents
            .entry(on)
            .or_default()
            .insert(dependent);
    }

    pub fn is_isolated(&self, module: ModuleId) -> bool {
        self.cordons.read().isolated.contains(&module)
    }

    pub fn is_degraded(&self, module: ModuleId) -> bool {
        self.cordons.read().degraded.contains(&module)
    }

    /// Lift isolation and degradation; returns false if neither applied
    pub fn release_isolation(&self, module: ModuleId) -> bool {
        let mut cordons = self.cordons.write();
        let isolated = cordons.isolated.remove(&module);
        let degraded = cordons.degraded.remove(&module);
        if isolated || degraded {
            info!(%module, "module released from isolation");
        }
        isolated || degraded
    }

    /// Strategy for `ctx` after health and breaker overrides
    pub fn select_strategy(&self, ctx: &ErrorContext) -> RecoveryStrategy {
        if ctx.breaking_change {
            return RecoveryStrategy::ManualIntervention;
        }

        let mut strategy = default_strategy(ctx.category, ctx.severity);
        let high_risk = self
            .health
            .prediction(ctx.module)
            .is_some_and(|p| p.failure_probability >= self.config.high_risk_threshold);
        if high_risk
            && matches!(
                strategy,
                RecoveryStrategy::Retry | RecoveryStrategy::GracefulDegradation
            )
        {
            strategy = RecoveryStrategy::Isolate;
        }
        if strategy == RecoveryStrategy::Retry && self.breakers.is_rejecting(ctx.module) {
            strategy = RecoveryStrategy::CircuitBreak;
        }
        strategy
    }

    /// Classify, select a strategy, execute it and record the outcome
    pub fn handle(&self, ctx: ErrorContext, hooks: &dyn RecoveryHooks) -> RecoveryAction {
        let started = self.clock.now_micros();
        self.health.submit(HealthSignal::Error {
            module: ctx.module,
            category: ctx.category,
        });

        let mut run = Run {
            clock: self.clock.as_ref(),
            steps: Vec::new(),
            dependents: Vec::new(),
        };
        let selected = self.select_strategy(&ctx);
        run.step(format!(
            "classified {:?}/{:?}, selected {:?}",
            ctx.category, ctx.severity, selected
        ));
        let (strategy, success) = self.execute(selected, &ctx, hooks, &mut run);

        let duration_us = self.clock.elapsed_since(started);
        let over_budget = duration_us > self.config.budget_ms.saturating_mul(1_000);
        if over_budget {
            warn!(
                module = %ctx.module,
                duration_us,
                budget_ms = self.config.budget_ms,
                "recovery exceeded its time budget"
            );
        }

        let action = RecoveryAction {
            id: self.ids.next_action(),
            error: ctx.id,
            module: ctx.module,
            txn: ctx.txn,
            category: ctx.category,
            severity: ctx.severity,
            strategy,
            steps: run.steps,
            success,
            duration_us,
            over_budget,
            dependents_notified: run.dependents,
        };
        info!(
            module = %action.module,
            strategy = ?action.strategy,
            success = action.success,
            duration_us,
            "recovery finished"
        );

        self.analytics.lock().record(&action);
        {
            let mut history = self.history.lock();
            if history.len() == self.config.history_capacity {
                history.pop_front();
            }
            if self.config.history_capacity > 0 {
                history.push_back(action.clone());
            }
        }
        self.health.submit(HealthSignal::Outcome {
            module: ctx.module,
            failed: !action.success,
        });
        self.events.recovery(RecoveryEvent {
            action: action.clone(),
        });
        action
    }

    fn execute(
        &self,
        strategy: RecoveryStrategy,
        ctx: &ErrorContext,
        hooks: &dyn RecoveryHooks,
        run: &mut Run<'_>,
    ) -> (RecoveryStrategy, bool) {
        let module = ctx.module;
        match strategy {
            RecoveryStrategy::Retry => {
                for attempt in 0..self.config.max_retry_attempts {
                    std::thread::sleep(self.config.backoff(attempt));
                    if hooks.retry(ctx, attempt) {
                        run.step(format!("retry {} succeeded", attempt + 1));
                        self.breakers.record_success(module);
                        return (RecoveryStrategy::Retry, true);
                    }
                    run.step(format!("retry {} failed", attempt + 1));
                }
                self.breakers.record_failure(module);
                run.step("retries exhausted, escalating");
                self.execute(RecoveryStrategy::CircuitBreak, ctx, hooks, run);
                (RecoveryStrategy::CircuitBreak, false)
            }
            RecoveryStrategy::Rollback => match hooks.rollback(ctx) {
                Ok(restored) => {
                    run.step(format!("rolled back {} module(s)", restored.len()));
                    (RecoveryStrategy::Rollback, true)
                }
                Err(reason) => {
                    run.step(format!("rollback failed: {}", reason));
                    self.execute(RecoveryStrategy::Isolate, ctx, hooks, run);
                    (RecoveryStrategy::Rollback, false)
                }
            },
            RecoveryStrategy::CircuitBreak => {
                self.breakers.force_open(module);
                run.step(format!("opened circuit for {}", module));
                (RecoveryStrategy::CircuitBreak, true)
            }
            RecoveryStrategy::GracefulDegradation => {
                self.cordons.write().degraded.insert(module);
                run.step(format!("marked {} non-essential", module));
                (RecoveryStrategy::GracefulDegradation, true)
            }
            RecoveryStrategy::Isolate => {
                let dependents = {
                    let mut cordons = self.cordons.write();
                    cordons.isolated.insert(module);
                    cordons.dependents_of(module)
                };
                warn!(%module, ?dependents, "module isolated");
                run.step(format!(
                    "isolated {}, notified {} dependent(s)",
                    module,
                    dependents.len()
                ));
                run.dependents.extend(dependents);
                (RecoveryStrategy::Isolate, true)
            }
            RecoveryStrategy::ManualIntervention => {
                error!(%module, message = %ctx.message, "manual intervention required");
                run.step("escalated to operator");
                (RecoveryStrategy::ManualIntervention, false)
            }
        }
    }

    /// Finished recovery actions, oldest first
    pub fn history(&self) -> Vec<RecoveryAction> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn analytics(&self) -> RecoveryAnalytics {
        self.analytics.lock().clone()
    }

    pub fn reset_analytics(&self) {
        *self.analytics.lock() = RecoveryAnalytics::default();
    }
}

struct Run<'a> {
    clock: &'a dyn Clock,
    steps: Vec<RecoveryStep>,
    dependents: Vec<ModuleId>,
}

impl Run<'_> {
    fn step(&mut self, description: impl Into<String>) {
        self.steps.push(RecoveryStep {
            at: self.clock.now_micros(),
            description: description.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitState;
    use crate::config::{BreakerConfig, HealthConfig};
    use crate::event::CollectingSubscriber;
    use crate::health::MetricCategory;
    use crate::model::LinearModel;
    use hotswap_core::ManualClock;
    use std::cell::Cell;

    struct Fixture {
        recovery: RecoveryEngine,
        breakers: Arc<BreakerRegistry>,
        health: Arc<HealthMonitor>,
        sink: Arc<CollectingSubscriber>,
        ids: Arc<IdAllocator>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(1));
        let ids = Arc::new(IdAllocator::new());
        let events = Arc::new(EventBus::new(clock.clone()));
        let sink = Arc::new(CollectingSubscriber::new());
        events.subscribe(sink.clone());
        let breakers = Arc::new(BreakerRegistry::new(
            BreakerConfig::default(),
            clock.clone(),
            events.clone(),
        ));
        let health_config = HealthConfig {
            min_samples: 4,
            ..HealthConfig::default()
        };
        let model = Arc::new(LinearModel::new(
            health_config.model_weights.clone(),
            health_config.model_bias,
            health_config.learning_rate,
        ));
        let health = Arc::new(HealthMonitor::new(
            health_config,
            model,
            clock.clone(),
            events.clone(),
        ));
        let config = RecoveryConfig {
            backoff_base_ms: 0,
            backoff_cap_ms: 0,
            ..RecoveryConfig::default()
        };
        let recovery = RecoveryEngine::new(
            config,
            clock,
            ids.clone(),
            breakers.clone(),
            health.clone(),
            events,
        );
        Fixture {
            recovery,
            breakers,
            health,
            sink,
            ids,
        }
    }

    fn ctx(f: &Fixture, category: ErrorCategory, severity: ErrorSeverity) -> ErrorContext {
        ErrorContext::new(f.ids.next_error(), ModuleId(1), category, severity, "boom")
    }

    struct Hooks {
        succeed_on: Option<u32>,
        attempts: Cell<u32>,
        rollback: std::result::Result<Vec<ModuleId>, String>,
    }

    impl Hooks {
        fn new() -> Self {
            Self {
                succeed_on: None,
                attempts: Cell::new(0),
                rollback: Ok(vec![ModuleId(1)]),
            }
        }
    }

    impl RecoveryHooks for Hooks {
        fn retry(&self, _ctx: &ErrorContext, attempt: u32) -> bool {
            self.attempts.set(self.attempts.get() + 1);
            self.succeed_on == Some(attempt)
        }

        fn rollback(&self, _ctx: &ErrorContext) -> std::result::Result<Vec<ModuleId>, String> {
            self.rollback.clone()
        }
    }

    #[test]
    fn test_default_table() {
        use ErrorCategory as C;
        use ErrorSeverity as S;
        assert_eq!(default_strategy(C::Transaction, S::Critical), RecoveryStrategy::Rollback);
        assert_eq!(default_strategy(C::Transaction, S::Low), RecoveryStrategy::Retry);
        assert_eq!(default_strategy(C::Timeout, S::Medium), RecoveryStrategy::Retry);
        assert_eq!(default_strategy(C::Timeout, S::High), RecoveryStrategy::CircuitBreak);
        assert_eq!(
            default_strategy(C::ResourceExhaustion, S::Medium),
            RecoveryStrategy::GracefulDegradation
        );
        assert_eq!(default_strategy(C::Memory, S::High), RecoveryStrategy::Isolate);
        assert_eq!(default_strategy(C::Corruption, S::Low), RecoveryStrategy::Rollback);
        assert_eq!(default_strategy(C::Io, S::Fatal), RecoveryStrategy::ManualIntervention);
    }

    #[test]
    fn test_classify_engine_errors() {
        let partial = Error::ApplyFailed {
            module: ModuleId(1),
            partial: true,
            reason: "x".into(),
        };
        assert_eq!(ErrorCategory::of(&partial), ErrorCategory::Transaction);
        assert_eq!(ErrorSeverity::of(&partial), ErrorSeverity::Critical);
        assert_eq!(
            ErrorCategory::of(&Error::PrepareTimeout(vec![ModuleId(1)])),
            ErrorCategory::Timeout
        );
        assert_eq!(
            ErrorCategory::of(&Error::SnapshotCorrupt(hotswap_core::SnapshotId(1), "crc".into())),
            ErrorCategory::Corruption
        );
    }

    #[test]
    fn test_breaking_change_forces_manual() {
        let f = fixture();
        let ctx = ctx(&f, ErrorCategory::Transaction, ErrorSeverity::Critical).breaking(true);
        let action = f.recovery.handle(ctx, &Hooks::new());
        assert_eq!(action.strategy, RecoveryStrategy::ManualIntervention);
        assert!(!action.success);
    }

    #[test]
    fn test_retry_until_success() {
        let f = fixture();
        let hooks = Hooks {
            succeed_on: Some(1),
            ..Hooks::new()
        };
        let action = f
            .recovery
            .handle(ctx(&f, ErrorCategory::Timeout, ErrorSeverity::Low), &hooks);
        assert_eq!(action.strategy, RecoveryStrategy::Retry);
        assert!(action.success);
        assert_eq!(hooks.attempts.get(), 2);
    }

    #[test]
    fn test_exhausted_retries_open_circuit() {
        let f = fixture();
        let hooks = Hooks::new();
        let action = f
            .recovery
            .handle(ctx(&f, ErrorCategory::Io, ErrorSeverity::Low), &hooks);
        assert_eq!(hooks.attempts.get(), 3);
        assert_eq!(action.strategy, RecoveryStrategy::CircuitBreak);
        assert!(!action.success);
        assert_eq!(f.breakers.state(ModuleId(1)), CircuitState::Open);
    }

    #[test]
    fn test_open_breaker_skips_retry() {
        let f = fixture();
        f.breakers.force_open(ModuleId(1));
        let hooks = Hooks::new();
        let action = f
            .recovery
            .handle(ctx(&f, ErrorCategory::Timeout, ErrorSeverity::Low), &hooks);
        assert_eq!(action.strategy, RecoveryStrategy::CircuitBreak);
        assert_eq!(hooks.attempts.get(), 0);
    }

    #[test]
    fn test_high_risk_prediction_isolates() {
        let f = fixture();
        f.recovery.register_dependency(ModuleId(2), ModuleId(1));
        f.recovery.register_dependency(ModuleId(3), ModuleId(2));
        for _ in 0..8 {
            f.health.record(ModuleId(1), MetricCategory::ErrorRate, 1.0);
        }
        assert!(f.health.predict(ModuleId(1)).valid);

        let action = f.recovery.handle(
            ctx(&f, ErrorCategory::Timeout, ErrorSeverity::Low),
            &Hooks::new(),
        );
        assert_eq!(action.strategy, RecoveryStrategy::Isolate);
        assert_eq!(action.dependents_notified, vec![ModuleId(2), ModuleId(3)]);
        assert!(f.recovery.is_isolated(ModuleId(1)));
        assert!(f.recovery.release_isolation(ModuleId(1)));
        assert!(!f.recovery.is_isolated(ModuleId(1)));
    }

    #[test]
    fn test_failed_rollback_isolates() {
        let f = fixture();
        let hooks = Hooks {
            rollback: Err("restore refused".into()),
            ..Hooks::new()
        };
        let action = f
            .recovery
            .handle(ctx(&f, ErrorCategory::Corruption, ErrorSeverity::High), &hooks);
        assert_eq!(action.strategy, RecoveryStrategy::Rollback);
        assert!(!action.success);
        assert!(f.recovery.is_isolated(ModuleId(1)));
    }

    #[test]
    fn test_analytics_history_and_events() {
        let f = fixture();
        f.recovery.handle(
            ctx(&f, ErrorCategory::Transaction, ErrorSeverity::Critical),
            &Hooks::new(),
        );
        f.recovery.handle(
            ctx(&f, ErrorCategory::ResourceExhaustion, ErrorSeverity::Medium),
            &Hooks::new(),
        );
        assert!(f.recovery.is_degraded(ModuleId(1)));

        let analytics = f.recovery.analytics();
        assert_eq!(analytics.total, 2);
        assert_eq!(analytics.success_rate(), 1.0);
        assert_eq!(analytics.by_strategy[&RecoveryStrategy::Rollback], 1);
        assert_eq!(analytics.by_category[&ErrorCategory::ResourceExhaustion], 1);
        assert!(analytics.fastest_us.is_some());

        assert_eq!(f.recovery.history().len(), 2);
        assert_eq!(f.sink.recoveries().len(), 2);

        f.recovery.reset_analytics();
        assert_eq!(f.recovery.analytics().total, 0);
    }
}
