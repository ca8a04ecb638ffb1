//! Conflict detection and resolution for concurrent module state changes
//!
//! A conflict exists when the change a transaction wants (`base → new`) and
//! the change committed meanwhile (`base → current`) touch the same field or
//! byte region.
//!
//! # Conflict Types
//!
//! Ordered from least to most dangerous, the type of a conflict is the most
//! dangerous type among its overlapping changes:
//!
//! - **Semantic**: same counter or list field changed on both sides; type-aware rules can merge it
//! - **ConcurrentModification**: same data field changed on both sides
//! - **Structural**: fields inserted, deleted or changed type
//! - **Dependency**: entries under `deps`
//! - **Signature**: exported function signatures under `sig`
//! - **MemoryLayout**: entries under `layout`, or a `Bytes` field changing length
//!
//! # Resolution
//!
//! [`ConflictDetector::resolve`] tries, in order:
//!
//! 1. the transaction's force policy, if any
//! 2. escalation to manual review when severity is critical, the version is
//!    breaking, or model confidence is below the configured threshold
//! 3. automatic merge when every overlap is the same change on both sides
//! 4. semantic merge: numbers under `counters` merge additively
//!    (`current + (new - base)`), lists merge by appending new items
//! 5. manual review, which is where any other number edited on both sides ends up

use crate::config::ConflictConfig;
use crate::diff::{apply_changes, diff, ChangeSummary, FieldChange, StateView};
use crate::model::ScoringModel;
use crate::txn::ConflictPolicy;
use hotswap_core::{ConflictId, FieldClass, IdAllocator, ModuleId, StateBlob, Value};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Number of features scored by the merge-success model
pub const FEATURE_COUNT: usize = 6;

/// Nature of a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConflictType {
    Semantic,
    ConcurrentModification,
    Structural,
    Dependency,
    Signature,
    MemoryLayout,
}

/// Breadth of impact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConflictSeverity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl ConflictSeverity {
    fn rank(self) -> u8 {
        self as u8
    }

    fn bump(self) -> Self {
        match self {
            ConflictSeverity::Info => ConflictSeverity::Low,
            ConflictSeverity::Low => ConflictSeverity::Medium,
            ConflictSeverity::Medium => ConflictSeverity::High,
            ConflictSeverity::High | ConflictSeverity::Critical => ConflictSeverity::Critical,
        }
    }
}

/// How a conflict is (to be) merged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MergeStrategy {
    /// Overlaps are identical on both sides
    Automatic,
    /// Type-aware rules merge the overlapping values
    Semantic,
    /// Needs a human
    ManualReview,
    /// Keep the transaction's state
    AcceptNew,
    /// Keep the live state
    KeepCurrent,
}

/// A detected conflict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: ConflictId,
    pub module: ModuleId,
    pub conflict_type: ConflictType,
    pub severity: ConflictSeverity,
    pub base_to_current: ChangeSummary,
    pub base_to_new: ChangeSummary,
    pub current_to_new: ChangeSummary,
    /// Paths changed on both sides
    pub overlapping: Vec<String>,
    pub suggested_strategy: MergeStrategy,
    pub auto_resolvable: bool,
    /// Estimated merge-success probability
    pub confidence: f64,
    /// 0 (trivial) to 1000 (hopeless)
    pub complexity: u32,
    pub breaking_change: bool,
    pub features: Vec<f64>,
}

impl ConflictRecord {
    /// Force manual review because the incoming version is breaking
    pub fn escalate_breaking(&mut self) {
        self.breaking_change = true;
        self.severity = self.severity.max(ConflictSeverity::High);
        self.suggested_strategy = MergeStrategy::ManualReview;
        self.auto_resolvable = false;
    }
}

impl std::fmt::Display for ConflictRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} conflict {} on {} ({:?}, {} overlapping, confidence {:.2})",
            self.conflict_type,
            self.id,
            self.module,
            self.severity,
            self.overlapping.len(),
            self.confidence
        )
    }
}

/// Outcome of [`ConflictDetector::resolve`]
#[derive(Debug, Clone, PartialEq)]
pub struct MergeResult {
    pub conflict: ConflictId,
    pub strategy: MergeStrategy,
    pub resolved: bool,
    /// State to install when resolved
    pub merged: Option<StateBlob>,
    pub confidence: f64,
}

/// Conflict counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConflictStats {
    pub detected: u64,
    pub auto_resolved: u64,
    pub semantic_merges: u64,
    pub forced: u64,
    pub manual_escalations: u64,
}

/// Per-pair facts used for classification and scoring
struct PairFacts {
    conflict_type: ConflictType,
    identical: bool,
    structural: bool,
    semantic: bool,
}

/// Detects and resolves conflicts between concurrent versions of module state
pub struct ConflictDetector {
    config: ConflictConfig,
    model: Arc<dyn ScoringModel>,
    ids: Arc<IdAllocator>,
    stats: Mutex<ConflictStats>,
}

impl ConflictDetector {
    pub fn new(config: ConflictConfig, model: Arc<dyn ScoringModel>, ids: Arc<IdAllocator>) -> Self {
        Self {
            config,
            model,
            ids,
            stats: Mutex::new(ConflictStats::default()),
        }
    }

    /// Compare `base → current` against `base → new`
    ///
    /// Returns `None` when the two changes touch disjoint fields.
    pub fn detect(
        &self,
        module: ModuleId,
        base: &StateBlob,
        current: &StateBlob,
        new: &StateBlob,
    ) -> Option<ConflictRecord> {
        let region = self.config.region_size;
        let base_view = StateView::of(base);
        let current_view = StateView::of(current);
        let new_view = StateView::of(new);

        let ours = diff(&base_view.state, &current_view.state, region);
        let theirs = diff(&base_view.state, &new_view.state, region);
        let pairs = ours.overlapping(&theirs);
        if pairs.is_empty() {
            return None;
        }

        let facts: Vec<PairFacts> = pairs
            .iter()
            .map(|(a, b)| classify_pair(a, b))
            .collect();

        let mut overlapping: Vec<String> = pairs.iter().map(|(a, _)| a.path.clone()).collect();
        overlapping.dedup();

        let all_identical = facts.iter().all(|f| f.identical);
        let conflict_type = facts
            .iter()
            .filter(|f| all_identical || !f.identical)
            .map(|f| f.conflict_type)
            .max()
            .unwrap_or(ConflictType::ConcurrentModification);

        let pair_count = pairs.len();
        let structural = facts.iter().filter(|f| f.structural).count();
        let sensitive = facts
            .iter()
            .filter(|f| f.conflict_type >= ConflictType::Dependency)
            .count();
        let complexity = (10 * (ours.len() + theirs.len())
            + 40 * pair_count
            + 80 * structural
            + 150 * sensitive)
            .min(1000) as u32;

        let severity = if all_identical {
            ConflictSeverity::Info
        } else {
            let base_severity = severity_of(conflict_type);
            let distinct = facts.iter().filter(|f| !f.identical).count();
            if distinct > 8 || complexity > 600 {
                base_severity.bump()
            } else {
                base_severity
            }
        };

        let total_changes = (ours.len() + theirs.len()).max(1) as f64;
        let involved = pairs
            .iter()
            .flat_map(|(a, b)| [a.path.as_str(), b.path.as_str()])
            .collect::<std::collections::BTreeSet<_>>()
            .len() as f64;
        let n = pair_count as f64;
        let features = vec![
            (involved / total_changes).min(1.0),
            structural as f64 / n,
            complexity as f64 / 1000.0,
            severity.rank() as f64 / 4.0,
            facts.iter().filter(|f| f.identical).count() as f64 / n,
            facts.iter().filter(|f| f.semantic).count() as f64 / n,
        ];
        let confidence = self.model.score(&features);

        let mergeable = facts.iter().all(|f| f.identical || f.semantic);
        let suggested_strategy = if all_identical {
            MergeStrategy::Automatic
        } else if severity == ConflictSeverity::Critical || !mergeable {
            MergeStrategy::ManualReview
        } else {
            MergeStrategy::Semantic
        };
        let auto_resolvable = suggested_strategy != MergeStrategy::ManualReview
            && confidence >= self.config.confidence_threshold;

        let record = ConflictRecord {
            id: self.ids.next_conflict(),
            module,
            conflict_type,
            severity,
            current_to_new: diff(&current_view.state, &new_view.state, region),
            base_to_current: ours,
            base_to_new: theirs,
            overlapping,
            suggested_strategy,
            auto_resolvable,
            confidence,
            complexity,
            breaking_change: false,
            features,
        };

        self.stats.lock().detected += 1;
        debug!(conflict = %record.id, %module, kind = ?record.conflict_type, severity = ?record.severity, confidence, "conflict detected");
        Some(record)
    }

    /// Try to merge a detected conflict
    pub fn resolve(
        &self,
        record: &ConflictRecord,
        base: &StateBlob,
        current: &StateBlob,
        new: &StateBlob,
        policy: ConflictPolicy,
    ) -> MergeResult {
        let unresolved = |strategy| MergeResult {
            conflict: record.id,
            strategy,
            resolved: false,
            merged: None,
            confidence: record.confidence,
        };
        let resolved = |strategy, merged| MergeResult {
            conflict: record.id,
            strategy,
            resolved: true,
            merged: Some(merged),
            confidence: record.confidence,
        };

        match policy {
            ConflictPolicy::ForceAcceptNew => {
                self.stats.lock().forced += 1;
                return resolved(MergeStrategy::AcceptNew, new.clone());
            }
            ConflictPolicy::ForceKeepCurrent => {
                self.stats.lock().forced += 1;
                return resolved(MergeStrategy::KeepCurrent, current.clone());
            }
            ConflictPolicy::Abort => {}
        }

        if record.severity == ConflictSeverity::Critical
            || record.breaking_change
            || record.confidence < self.config.confidence_threshold
        {
            self.stats.lock().manual_escalations += 1;
            return unresolved(MergeStrategy::ManualReview);
        }

        let strategy = match record.suggested_strategy {
            MergeStrategy::Automatic | MergeStrategy::Semantic => record.suggested_strategy,
            _ => {
                self.stats.lock().manual_escalations += 1;
                return unresolved(MergeStrategy::ManualReview);
            }
        };

        match self.merge(base, current, new) {
            Some(merged) => {
                let mut stats = self.stats.lock();
                stats.auto_resolved += 1;
                if strategy == MergeStrategy::Semantic {
                    stats.semantic_merges += 1;
                }
                debug!(conflict = %record.id, ?strategy, "conflict merged");
                resolved(strategy, merged)
            }
            None => {
                self.stats.lock().manual_escalations += 1;
                unresolved(MergeStrategy::ManualReview)
            }
        }
    }

    /// Feed a merge outcome back into the confidence model
    pub fn learn(&self, record: &ConflictRecord, merge_succeeded: bool) {
        self.model
            .update(&record.features, if merge_succeeded { 1.0 } else { 0.0 });
    }

    pub fn stats(&self) -> ConflictStats {
        *self.stats.lock()
    }

    pub fn reset_stats(&self) {
        *self.stats.lock() = ConflictStats::default();
    }

    pub fn model_accuracy(&self) -> f64 {
        self.model.accuracy()
    }

    /// Merge with identical-change and semantic rules
    fn merge(&self, base: &StateBlob, current: &StateBlob, new: &StateBlob) -> Option<StateBlob> {
        let region = self.config.region_size;
        let base_view = StateView::of(base);
        let current_view = StateView::of(current);
        let new_view = StateView::of(new);
        let ours = diff(&base_view.state, &current_view.state, region);
        let theirs = diff(&base_view.state, &new_view.state, region);

        let mut merged = current_view.clone();
        let mut plain: Vec<FieldChange> = Vec::new();
        for change in &theirs.changes {
            if ours.changes.iter().any(|a| a.same_effect(change)) {
                continue;
            }
            match ours.changes.iter().find(|a| a.overlaps(change)) {
                Some(ours_change) => {
                    let value = merge_values(ours_change, change)?;
                    merged.state.set_path(&change.path, value).ok()?;
                }
                None => plain.push(change.clone()),
            }
        }
        apply_changes(&mut merged.state, &plain, region).ok()?;
        merged.encode().ok()
    }
}

fn severity_of(conflict_type: ConflictType) -> ConflictSeverity {
    match conflict_type {
        ConflictType::Semantic | ConflictType::ConcurrentModification => ConflictSeverity::Low,
        ConflictType::Structural => ConflictSeverity::Medium,
        ConflictType::Dependency | ConflictType::Signature => ConflictSeverity::High,
        ConflictType::MemoryLayout => ConflictSeverity::Critical,
    }
}

fn classify_pair(a: &FieldChange, b: &FieldChange) -> PairFacts {
    let identical = a.same_effect(b);
    let structural = a.is_structural() || b.is_structural();
    let semantic = !identical && merge_values(a, b).is_some();
    let either = |class: FieldClass| a.class == class || b.class == class;

    let conflict_type = if a.layout_changed || b.layout_changed || either(FieldClass::Layout) {
        ConflictType::MemoryLayout
    } else if either(FieldClass::Signature) {
        ConflictType::Signature
    } else if either(FieldClass::Dependency) {
        ConflictType::Dependency
    } else if structural {
        ConflictType::Structural
    } else if semantic {
        ConflictType::Semantic
    } else {
        ConflictType::ConcurrentModification
    };

    PairFacts {
        conflict_type,
        identical,
        structural,
        semantic,
    }
}

/// Type-aware merge of one field modified on both sides
///
/// `ours` is `base → current`, `theirs` is `base → new`.
fn merge_values(ours: &FieldChange, theirs: &FieldChange) -> Option<Value> {
    if ours.path != theirs.path || ours.is_structural() || theirs.is_structural() {
        return None;
    }
    let base = ours.old.as_ref()?;
    let current = ours.new.as_ref()?;
    let new = theirs.new.as_ref()?;
    let counter = ours.class == FieldClass::Counter;

    match (base, current, new) {
        (Value::Int(b), Value::Int(c), Value::Int(n)) if counter => {
            Some(Value::Int(c.checked_add(n.checked_sub(*b)?)?))
        }
        (Value::List(b), Value::List(c), Value::List(n)) => {
            let mut out = c.clone();
            for item in n {
                if !b.contains(item) && !out.contains(item) {
                    out.push(item.clone());
                }
            }
            Some(Value::List(out))
        }
        _ if counter && base.is_numeric() && current.is_numeric() && new.is_numeric() => {
            let (b, c, n) = (base.as_float()?, current.as_float()?, new.as_float()?);
            Some(Value::Float(c + (n - b)))
        }
        _ => None,
    }
}
