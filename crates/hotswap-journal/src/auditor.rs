//! Queries and reports over audit records

use crate::record::{AuditKind, AuditPayload, AuditRecord};
use chrono::{DateTime, Utc};
use hotswap_core::{ModuleId, TxnId};
use hotswap_engine::{
    CircuitState, ConflictType, HealthStatus, RecoveryAction, RecoveryStrategy, TransactionEvent,
};
use std::collections::{BTreeMap, BTreeSet};

/// Auditor over a slice of records
pub struct Auditor<'a> {
    records: &'a [AuditRecord],
}

impl<'a> Auditor<'a> {
    pub fn new(records: &'a [AuditRecord]) -> Self {
        Self { records }
    }

    /// Generate a report over every record
    pub fn generate_report(&self) -> AuditReport {
        let mut report = AuditReport {
            total_records: self.records.len(),
            first: self.records.first().map(|r| r.timestamp),
            last: self.records.last().map(|r| r.timestamp),
            ..Default::default()
        };
        let mut recovered_ok = 0u64;

        for record in self.records {
            *report.records_by_kind.entry(record.kind).or_insert(0) += 1;
            if !record.verify() {
                report.integrity_failures += 1;
            }

            match &record.payload {
                AuditPayload::Transaction(event) => match event {
                    TransactionEvent::Started { .. } => report.transactions_started += 1,
                    TransactionEvent::Committed { .. } => report.transactions_committed += 1,
                    TransactionEvent::Aborted { reason, .. } => {
                        report.transactions_aborted += 1;
                        *report
                            .abort_reasons
                            .entry(reason_class(reason).to_string())
                            .or_insert(0) += 1;
                    }
                    TransactionEvent::Failed { rolled_back, .. } => {
                        report.transactions_failed += 1;
                        if *rolled_back {
                            report.failures_rolled_back += 1;
                        }
                    }
                },
                AuditPayload::Conflict(event) => {
                    *report
                        .conflicts_by_type
                        .entry(event.conflict_type)
                        .or_insert(0) += 1;
                }
                AuditPayload::Recovery(action) => {
                    *report
                        .recoveries_by_strategy
                        .entry(action.strategy)
                        .or_insert(0) += 1;
                    if action.success {
                        recovered_ok += 1;
                    }
                    if action.over_budget {
                        report.recovery_budget_overruns += 1;
                    }
                }
                AuditPayload::Circuit(event) => {
                    if event.to == CircuitState::Open {
                        *report.circuit_opens.entry(event.module).or_insert(0) += 1;
                    }
                }
                AuditPayload::Health(_) => report.health_alerts += 1,
            }
        }

        let recoveries: u64 = report.recoveries_by_strategy.values().sum();
        if recoveries > 0 {
            report.recovery_success_rate = recovered_ok as f64 / recoveries as f64;
        }
        report
    }

    /// Records matching a query, in log order
    pub fn query(&self, query: &AuditQuery) -> Vec<&'a AuditRecord> {
        self.records.iter().filter(|r| query.matches(r)).collect()
    }

    /// Every record that concerns a transaction
    pub fn transaction_history(&self, txn: TxnId) -> Vec<&'a AuditRecord> {
        self.query(&AuditQuery::new().by_txn(txn))
    }

    /// Transactions that ended in `Failed`
    pub fn failed_transactions(&self) -> Vec<TxnId> {
        self.records
            .iter()
            .filter_map(|r| match &r.payload {
                AuditPayload::Transaction(TransactionEvent::Failed { txn, .. }) => Some(*txn),
                _ => None,
            })
            .collect()
    }

    /// Recovery actions, oldest first
    pub fn recoveries(&self) -> impl Iterator<Item = &'a RecoveryAction> + 'a {
        self.records.iter().filter_map(|r| match &r.payload {
            AuditPayload::Recovery(action) => Some(action),
            _ => None,
        })
    }

    /// Summary of everything recorded about one module
    pub fn module_summary(&self, module: ModuleId) -> ModuleSummary {
        let mut summary = ModuleSummary::default();
        let mut txns = BTreeSet::new();

        for record in self.records {
            if !record.payload.touches(module) {
                continue;
            }
            summary.records += 1;
            match &record.payload {
                AuditPayload::Transaction(event) => {
                    txns.insert(event.txn());
                }
                AuditPayload::Conflict(event) => {
                    summary.conflicts += 1;
                    txns.insert(event.txn);
                }
                AuditPayload::Recovery(action) => {
                    summary.recoveries += 1;
                    if !action.success {
                        summary.failed_recoveries += 1;
                    }
                    txns.extend(action.txn);
                }
                AuditPayload::Circuit(event) => {
                    if event.to == CircuitState::Open {
                        summary.circuit_opens += 1;
                    }
                    summary.circuit = Some(event.to);
                }
                AuditPayload::Health(event) => summary.health = Some(event.status),
            }
        }

        summary.transactions = txns.into_iter().collect();
        summary
    }
}

/// Coarse bucket for an abort reason
fn reason_class(reason: &str) -> &'static str {
    let reason = reason.to_ascii_lowercase();
    if reason.contains("conflict") {
        "conflict"
    } else if reason.contains("prepare") {
        "prepare"
    } else if reason.contains("cancelled") {
        "cancelled"
    } else if reason.contains("expired") {
        "expired"
    } else if reason.contains("circuit open") {
        "circuit_open"
    } else if reason.contains("rollback payload") {
        "missing_rollback"
    } else if reason.contains("requires") {
        "dependency"
    } else if reason.contains("apply failed") {
        "apply"
    } else {
        "other"
    }
}

/// Aggregate report over audit records
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditReport {
    pub total_records: usize,
    pub first: Option<DateTime<Utc>>,
    pub last: Option<DateTime<Utc>>,
    pub records_by_kind: BTreeMap<AuditKind, u64>,
    /// Records whose checksum no longer matches
    pub integrity_failures: usize,
    pub transactions_started: u64,
    pub transactions_committed: u64,
    pub transactions_aborted: u64,
    pub transactions_failed: u64,
    /// Failed transactions whose participants were restored
    pub failures_rolled_back: u64,
    pub abort_reasons: BTreeMap<String, u64>,
    pub conflicts_by_type: BTreeMap<ConflictType, u64>,
    pub recoveries_by_strategy: BTreeMap<RecoveryStrategy, u64>,
    pub recovery_success_rate: f64,
    pub recovery_budget_overruns: u64,
    pub circuit_opens: BTreeMap<ModuleId, u64>,
    pub health_alerts: u64,
}

impl std::fmt::Display for AuditReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Audit Report ===")?;
        writeln!(f, "Total records: {}", self.total_records)?;
        if let (Some(first), Some(last)) = (self.first, self.last) {
            writeln!(f, "Time range: {} - {}", first.to_rfc3339(), last.to_rfc3339())?;
        }
        if self.integrity_failures > 0 {
            writeln!(f, "Integrity failures: {}", self.integrity_failures)?;
        }

        writeln!(f, "\nTransactions:")?;
        writeln!(f, "  started: {}", self.transactions_started)?;
        writeln!(f, "  committed: {}", self.transactions_committed)?;
        writeln!(f, "  aborted: {}", self.transactions_aborted)?;
        writeln!(
            f,
            "  failed: {} (rolled back: {})",
            self.transactions_failed, self.failures_rolled_back
        )?;

        if !self.abort_reasons.is_empty() {
            writeln!(f, "\nAbort reasons:")?;
            let mut sorted: Vec<_> = self.abort_reasons.iter().collect();
            sorted.sort_by_key(|(_, count)| std::cmp::Reverse(**count));
            for (reason, count) in sorted {
                writeln!(f, "  {}: {}", reason, count)?;
            }
        }

        if !self.conflicts_by_type.is_empty() {
            writeln!(f, "\nConflicts by type:")?;
            for (kind, count) in &self.conflicts_by_type {
                writeln!(f, "  {:?}: {}", kind, count)?;
            }
        }

        if !self.recoveries_by_strategy.is_empty() {
            writeln!(f, "\nRecoveries by strategy:")?;
            for (strategy, count) in &self.recoveries_by_strategy {
                writeln!(f, "  {:?}: {}", strategy, count)?;
            }
            writeln!(
                f,
                "  success rate: {:.1}%",
                self.recovery_success_rate * 100.0
            )?;
            if self.recovery_budget_overruns > 0 {
                writeln!(f, "  over budget: {}", self.recovery_budget_overruns)?;
            }
        }

        if !self.circuit_opens.is_empty() {
            writeln!(f, "\nCircuit openings:")?;
            for (module, count) in &self.circuit_opens {
                writeln!(f, "  {}: {}", module, count)?;
            }
        }

        if self.health_alerts > 0 {
            writeln!(f, "\nHealth alerts: {}", self.health_alerts)?;
        }

        Ok(())
    }
}

/// Criteria for filtering audit records
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    /// First lsn (inclusive)
    pub from_lsn: Option<u64>,
    /// Last lsn (inclusive)
    pub to_lsn: Option<u64>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub kind: Option<AuditKind>,
    pub txn: Option<TxnId>,
    pub module: Option<ModuleId>,
}

impl AuditQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by lsn range
    pub fn in_range(mut self, from: u64, to: u64) -> Self {
        self.from_lsn = Some(from);
        self.to_lsn = Some(to);
        self
    }

    /// Filter by wall-clock window
    pub fn between(mut self, since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self.until = Some(until);
        self
    }

    pub fn by_kind(mut self, kind: AuditKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn by_txn(mut self, txn: TxnId) -> Self {
        self.txn = Some(txn);
        self
    }

    pub fn by_module(mut self, module: ModuleId) -> Self {
        self.module = Some(module);
        self
    }

    pub fn matches(&self, record: &AuditRecord) -> bool {
        if self.from_lsn.is_some_and(|lsn| record.lsn < lsn) {
            return false;
        }
        if self.to_lsn.is_some_and(|lsn| record.lsn > lsn) {
            return false;
        }
        if self.since.is_some_and(|t| record.timestamp < t) {
            return false;
        }
        if self.until.is_some_and(|t| record.timestamp > t) {
            return false;
        }
        if self.kind.is_some_and(|k| record.kind != k) {
            return false;
        }
        if let Some(txn) = self.txn {
            if record.payload.txn() != Some(txn) {
                return false;
            }
        }
        if let Some(module) = self.module {
            if !record.payload.touches(module) {
                return false;
            }
        }
        true
    }
}

/// What the log says about one module
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModuleSummary {
    pub records: u64,
    /// Transactions that named the module, ascending
    pub transactions: Vec<TxnId>,
    pub conflicts: u64,
    pub recoveries: u64,
    pub failed_recoveries: u64,
    pub circuit_opens: u64,
    /// Last breaker state seen
    pub circuit: Option<CircuitState>,
    /// Last health status seen
    pub health: Option<HealthStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use hotswap_core::{ActionId, ConflictId, ErrorId};
    use hotswap_engine::{
        CircuitEvent, ConflictEvent, ConflictSeverity, ErrorCategory, ErrorSeverity, HealthEvent,
        TransactionKind,
    };

    fn record(lsn: u64, payload: AuditPayload) -> AuditRecord {
        AuditRecord::new(lsn, lsn, payload).unwrap()
    }

    fn recovery(module: u32, txn: u64, strategy: RecoveryStrategy, success: bool) -> AuditPayload {
        AuditPayload::Recovery(RecoveryAction {
            id: ActionId(txn),
            error: ErrorId(txn),
            module: ModuleId(module),
            txn: Some(TxnId(txn)),
            category: ErrorCategory::Transaction,
            severity: ErrorSeverity::High,
            strategy,
            steps: Vec::new(),
            success,
            duration_us: 120,
            over_budget: false,
            dependents_notified: Vec::new(),
        })
    }

    fn sample() -> Vec<AuditRecord> {
        vec![
            record(
                1,
                AuditPayload::Transaction(TransactionEvent::Started {
                    txn: TxnId(1),
                    kind: TransactionKind::SingleModule,
                }),
            ),
            record(
                2,
                AuditPayload::Transaction(TransactionEvent::Committed {
                    txn: TxnId(1),
                    modules: vec![ModuleId(1)],
                    commit_ts: 4,
                    duration_us: 300,
                }),
            ),
            record(
                3,
                AuditPayload::Conflict(ConflictEvent {
                    txn: TxnId(2),
                    conflict: ConflictId(1),
                    module: ModuleId(2),
                    conflict_type: ConflictType::Semantic,
                    severity: ConflictSeverity::Low,
                    auto_resolvable: false,
                }),
            ),
            record(
                4,
                AuditPayload::Transaction(TransactionEvent::Aborted {
                    txn: TxnId(2),
                    reason: "unresolved Low conflict conflict:1 on module:2".into(),
                }),
            ),
            record(5, recovery(1, 3, RecoveryStrategy::Rollback, true)),
            record(
                6,
                AuditPayload::Transaction(TransactionEvent::Failed {
                    txn: TxnId(3),
                    reason: "apply failed on module:1 (partial: true): boom".into(),
                    rolled_back: true,
                }),
            ),
            record(
                7,
                AuditPayload::Circuit(CircuitEvent {
                    module: ModuleId(1),
                    from: CircuitState::Closed,
                    to: CircuitState::Open,
                }),
            ),
            record(
                8,
                AuditPayload::Health(HealthEvent {
                    module: ModuleId(1),
                    previous: HealthStatus::Healthy,
                    status: HealthStatus::Critical,
                    failure_probability: 0.7,
                    message: "error rate rising".into(),
                }),
            ),
            record(9, recovery(2, 4, RecoveryStrategy::Retry, false)),
        ]
    }

    #[test]
    fn test_report_counts_outcomes() {
        let records = sample();
        let report = Auditor::new(&records).generate_report();

        assert_eq!(report.total_records, 9);
        assert_eq!(report.transactions_started, 1);
        assert_eq!(report.transactions_committed, 1);
        assert_eq!(report.transactions_aborted, 1);
        assert_eq!(report.transactions_failed, 1);
        assert_eq!(report.failures_rolled_back, 1);
        assert_eq!(report.abort_reasons.get("conflict"), Some(&1));
        assert_eq!(report.conflicts_by_type.get(&ConflictType::Semantic), Some(&1));
        assert_eq!(report.circuit_opens.get(&ModuleId(1)), Some(&1));
        assert_eq!(report.health_alerts, 1);
        assert!((report.recovery_success_rate - 0.5).abs() < 1e-9);
        assert_eq!(report.integrity_failures, 0);

        let text = report.to_string();
        assert!(text.starts_with("=== Audit Report ==="));
        assert!(text.contains("committed: 1"));
        assert!(text.contains("success rate: 50.0%"));
    }

    #[test]
    fn test_report_flags_tampered_records() {
        let mut records = sample();
        records[1].payload = records[0].payload.clone();
        let report = Auditor::new(&records).generate_report();
        assert_eq!(report.integrity_failures, 1);
    }

    #[test]
    fn test_query_filters_combine() {
        let records = sample();
        let auditor = Auditor::new(&records);

        let by_txn: Vec<u64> = auditor
            .transaction_history(TxnId(2))
            .iter()
            .map(|r| r.lsn)
            .collect();
        assert_eq!(by_txn, vec![3, 4]);

        let module_recoveries = auditor.query(
            &AuditQuery::new()
                .by_module(ModuleId(1))
                .by_kind(AuditKind::Recovery),
        );
        assert_eq!(module_recoveries.len(), 1);
        assert_eq!(module_recoveries[0].lsn, 5);

        assert_eq!(auditor.query(&AuditQuery::new().in_range(3, 5)).len(), 3);

        let all = auditor.query(&AuditQuery::new().between(
            records[0].timestamp,
            records[8].timestamp,
        ));
        assert_eq!(all.len(), 9);
    }

    #[test]
    fn test_module_summary() {
        let records = sample();
        let auditor = Auditor::new(&records);
        let summary = auditor.module_summary(ModuleId(1));

        assert_eq!(summary.transactions, vec![TxnId(1), TxnId(3)]);
        assert_eq!(summary.recoveries, 1);
        assert_eq!(summary.circuit_opens, 1);
        assert_eq!(summary.circuit, Some(CircuitState::Open));
        assert_eq!(summary.health, Some(HealthStatus::Critical));

        let other = auditor.module_summary(ModuleId(2));
        assert_eq!(other.conflicts, 1);
        assert_eq!(other.failed_recoveries, 1);
        assert_eq!(auditor.failed_transactions(), vec![TxnId(3)]);
        assert_eq!(auditor.recoveries().count(), 2);
    }
}
