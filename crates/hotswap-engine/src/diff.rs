//! Structural diff and three-way merge of module state
//!
//! States are compared as [`ModuleState`] field maps. A blob that does not
//! decode as a `ModuleState` is viewed as a single `Bytes` field named
//! [`RAW_FIELD`], so raw state gets byte-region granularity for free.
//!
//! # Change paths
//!
//! - nested maps: dotted paths (`physics.gravity`)
//! - equal-length `Bytes`: one change per differing region (`buf#3`)
//! - `Bytes` length change: a single layout change on the field path
//! - value type change: a single structural change on the field path

use hotswap_core::state::{PATH_SEPARATOR, REGION_SEPARATOR};
use hotswap_core::{FieldClass, ModuleState, StateBlob, Value, ValueMap};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Field name under which raw (non-structured) state is diffed
pub const RAW_FIELD: &str = "raw";

/// Kind of a single field change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    Insert,
    Delete,
    Modify,
}

/// One field or region that differs between two states
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub path: String,
    pub kind: ChangeKind,
    pub class: FieldClass,
    pub old: Option<Value>,
    pub new: Option<Value>,
    /// The value changed type
    pub type_changed: bool,
    /// A `Bytes` value changed length
    pub layout_changed: bool,
}

impl FieldChange {
    /// Insert, delete or type change
    pub fn is_structural(&self) -> bool {
        self.kind != ChangeKind::Modify || self.type_changed
    }

    /// Whether two changes touch the same field or region
    pub fn overlaps(&self, other: &FieldChange) -> bool {
        paths_overlap(&self.path, &other.path)
    }

    /// Whether two changes produce the same result
    pub fn same_effect(&self, other: &FieldChange) -> bool {
        self.path == other.path && self.kind == other.kind && self.new == other.new
    }
}

/// All changes from one state to another
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChangeSummary {
    pub changes: Vec<FieldChange>,
}

impl ChangeSummary {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn insertions(&self) -> usize {
        self.count(ChangeKind::Insert)
    }

    pub fn deletions(&self) -> usize {
        self.count(ChangeKind::Delete)
    }

    pub fn modifications(&self) -> usize {
        self.count(ChangeKind::Modify)
    }

    fn count(&self, kind: ChangeKind) -> usize {
        self.changes.iter().filter(|c| c.kind == kind).count()
    }

    pub fn structural(&self) -> usize {
        self.changes.iter().filter(|c| c.is_structural()).count()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.changes.iter().map(|c| c.path.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldChange> {
        self.changes.iter()
    }

    /// Pairs of changes from `self` and `other` that touch the same place
    pub fn overlapping<'a>(
        &'a self,
        other: &'a ChangeSummary,
    ) -> Vec<(&'a FieldChange, &'a FieldChange)> {
        let mut pairs = Vec::new();
        for a in &self.changes {
            for b in &other.changes {
                if a.overlaps(b) {
                    pairs.push((a, b));
                }
            }
        }
        pairs
    }

    /// Whether no change in `self` overlaps a change in `other`
    pub fn is_disjoint(&self, other: &ChangeSummary) -> bool {
        self.changes
            .iter()
            .all(|a| other.changes.iter().all(|b| !a.overlaps(b)))
    }
}

/// Whether two change paths address overlapping data
///
/// Paths overlap when equal or when one is an ancestor of the other.
pub fn paths_overlap(a: &str, b: &str) -> bool {
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    if !long.starts_with(short) {
        return false;
    }
    match long[short.len()..].chars().next() {
        None => true,
        Some(c) => c == PATH_SEPARATOR || c == REGION_SEPARATOR,
    }
}

/// A decoded view of a state blob
#[derive(Debug, Clone, PartialEq)]
pub struct StateView {
    pub state: ModuleState,
    /// The blob was raw bytes, not an encoded `ModuleState`
    pub raw: bool,
}

impl StateView {
    /// Decode a blob, falling back to a raw single-field view
    pub fn of(blob: &StateBlob) -> Self {
        if blob.is_structured() {
            if let Ok(state) = ModuleState::decode(blob.as_bytes()) {
                return Self { state, raw: false };
            }
        }
        Self {
            state: ModuleState::new().with(RAW_FIELD, Value::bytes(blob.as_bytes().to_vec())),
            raw: true,
        }
    }

    /// Encode back into a blob of the same flavor
    pub fn encode(&self) -> hotswap_core::Result<StateBlob> {
        if self.raw {
            if let Some(bytes) = self.state.get(RAW_FIELD).and_then(Value::as_bytes) {
                return Ok(StateBlob::from_slice(bytes));
            }
        }
        self.state.encode()
    }
}

/// Diff two blobs
pub fn diff_blobs(old: &StateBlob, new: &StateBlob, region_size: usize) -> ChangeSummary {
    diff(&StateView::of(old).state, &StateView::of(new).state, region_size)
}

/// Diff two structured states
pub fn diff(old: &ModuleState, new: &ModuleState, region_size: usize) -> ChangeSummary {
    let mut summary = ChangeSummary::default();
    diff_maps("", old.fields(), new.fields(), region_size.max(1), &mut summary);
    summary
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}{}{}", prefix, PATH_SEPARATOR, key)
    }
}

fn diff_maps(
    prefix: &str,
    old: &ValueMap,
    new: &ValueMap,
    region_size: usize,
    out: &mut ChangeSummary,
) {
    for (key, old_value) in old {
        let path = join(prefix, key);
        match new.get(key) {
            None => out.changes.push(FieldChange {
                class: FieldClass::of(&path),
                path,
                kind: ChangeKind::Delete,
                old: Some(old_value.clone()),
                new: None,
                type_changed: false,
                layout_changed: false,
            }),
            Some(new_value) => diff_values(path, old_value, new_value, region_size, out),
        }
    }
    for (key, new_value) in new {
        if !old.contains_key(key) {
            let path = join(prefix, key);
            out.changes.push(FieldChange {
                class: FieldClass::of(&path),
                path,
                kind: ChangeKind::Insert,
                old: None,
                new: Some(new_value.clone()),
                type_changed: false,
                layout_changed: false,
            });
        }
    }
}

fn diff_values(path: String, old: &Value, new: &Value, region_size: usize, out: &mut ChangeSummary) {
    match (old, new) {
        (Value::Map(a), Value::Map(b)) => diff_maps(&path, a, b, region_size, out),
        (Value::Bytes(a), Value::Bytes(b)) if a.len() == b.len() => {
            for (index, (ra, rb)) in a.chunks(region_size).zip(b.chunks(region_size)).enumerate() {
                if ra != rb {
                    let region_path = format!("{}{}{}", path, REGION_SEPARATOR, index);
                    out.changes.push(FieldChange {
                        class: FieldClass::of(&region_path),
                        path: region_path,
                        kind: ChangeKind::Modify,
                        old: Some(Value::bytes(ra.to_vec())),
                        new: Some(Value::bytes(rb.to_vec())),
                        type_changed: false,
                        layout_changed: false,
                    });
                }
            }
        }
        _ if old == new => {}
        _ => out.changes.push(FieldChange {
            class: FieldClass::of(&path),
            layout_changed: matches!((old, new), (Value::Bytes(_), Value::Bytes(_))),
            type_changed: !old.same_type(new),
            path,
            kind: ChangeKind::Modify,
            old: Some(old.clone()),
            new: Some(new.clone()),
        }),
    }
}

/// Apply `changes` on top of `target`
///
/// Region changes splice their bytes into the `Bytes` value found at the
/// field path, at `index * region_size`. Fails when a path cannot be
/// addressed in `target`.
pub fn apply_changes(
    target: &mut ModuleState,
    changes: &[FieldChange],
    region_size: usize,
) -> Result<(), String> {
    let region_size = region_size.max(1);
    for change in changes {
        if let Some((field, index)) = split_region(&change.path) {
            let replacement = change
                .new
                .as_ref()
                .and_then(Value::as_bytes)
                .ok_or_else(|| format!("region change at {} has no bytes", change.path))?;
            let current = target
                .get_path(field)
                .and_then(Value::as_bytes)
                .ok_or_else(|| format!("{} is not a byte field", field))?;
            let start = index * region_size;
            let end = start + replacement.len();
            if end > current.len() {
                return Err(format!("region {} is out of range", change.path));
            }
            let mut spliced = current.to_vec();
            spliced[start..end].copy_from_slice(replacement);
            target
                .set_path(field, Value::Bytes(spliced))
                .map_err(|e| e.to_string())?;
            continue;
        }

        match (&change.kind, &change.new) {
            (ChangeKind::Delete, _) => {
                target.remove_path(&change.path);
            }
            (_, Some(value)) => target
                .set_path(&change.path, value.clone())
                .map_err(|e| e.to_string())?,
            (_, None) => return Err(format!("change at {} has no value", change.path)),
        }
    }
    Ok(())
}

fn split_region(path: &str) -> Option<(&str, usize)> {
    let (field, index) = path.rsplit_once(REGION_SEPARATOR)?;
    index.parse().ok().map(|i| (field, i))
}

/// Result of a three-way merge
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// The merged state
    Clean(StateBlob),
    /// Paths changed differently on both sides
    Conflicting(Vec<String>),
}

/// Merge `base → current` and `base → new` into one state
///
/// Changes that are identical on both sides merge cleanly; any other overlap
/// is reported as conflicting.
pub fn three_way_merge(
    base: &StateBlob,
    current: &StateBlob,
    new: &StateBlob,
    region_size: usize,
) -> MergeOutcome {
    let base_view = StateView::of(base);
    let current_view = StateView::of(current);
    let new_view = StateView::of(new);

    let ours = diff(&base_view.state, &current_view.state, region_size);
    let theirs = diff(&base_view.state, &new_view.state, region_size);

    let mut conflicting: BTreeSet<String> = BTreeSet::new();
    for (a, b) in ours.overlapping(&theirs) {
        if !a.same_effect(b) {
            conflicting.insert(a.path.clone());
            conflicting.insert(b.path.clone());
        }
    }
    if !conflicting.is_empty() {
        return MergeOutcome::Conflicting(conflicting.into_iter().collect());
    }

    // Changes already present in current do not need re-applying
    let pending: Vec<FieldChange> = theirs
        .changes
        .into_iter()
        .filter(|b| !ours.changes.iter().any(|a| a.same_effect(b)))
        .collect();

    let mut merged = current_view.clone();
    if let Err(reason) = apply_changes(&mut merged.state, &pending, region_size) {
        return MergeOutcome::Conflicting(vec![reason]);
    }
    match merged.encode() {
        Ok(blob) => MergeOutcome::Clean(blob),
        Err(e) => MergeOutcome::Conflicting(vec![e.to_string()]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(state: ModuleState) -> StateBlob {
        state.encode().unwrap()
    }

    #[test]
    fn test_diff_fields() {
        let old = ModuleState::new().with("x", 1i64).with("y", "a");
        let new = ModuleState::new().with("x", 2i64).with("z", true);

        let summary = diff(&old, &new, 64);
        assert_eq!(summary.modifications(), 1);
        assert_eq!(summary.deletions(), 1);
        assert_eq!(summary.insertions(), 1);
        assert_eq!(summary.structural(), 2);
    }

    #[test]
    fn test_diff_nested_and_types() {
        let mut old = ModuleState::new();
        old.set_path("physics.gravity", Value::Float(9.8)).unwrap();
        old.set_path("physics.steps", Value::Int(4)).unwrap();
        let mut new = old.clone();
        new.set_path("physics.gravity", Value::Float(1.6)).unwrap();
        new.set_path("physics.steps", Value::String("4".into())).unwrap();

        let summary = diff(&old, &new, 64);
        let paths: Vec<&str> = summary.paths().collect();
        assert_eq!(paths, vec!["physics.gravity", "physics.steps"]);
        assert!(!summary.changes[0].type_changed);
        assert!(summary.changes[1].type_changed);
    }

    #[test]
    fn test_diff_byte_regions() {
        let old = ModuleState::new().with("buf", Value::bytes(vec![0u8; 256]));
        let mut bytes = vec![0u8; 256];
        bytes[70] = 1;
        bytes[200] = 1;
        let new = ModuleState::new().with("buf", Value::bytes(bytes));

        let summary = diff(&old, &new, 64);
        let paths: Vec<&str> = summary.paths().collect();
        assert_eq!(paths, vec!["buf#1", "buf#3"]);

        let grown = ModuleState::new().with("buf", Value::bytes(vec![0u8; 300]));
        let summary = diff(&old, &grown, 64);
        assert_eq!(summary.len(), 1);
        assert!(summary.changes[0].layout_changed);
    }

    #[test]
    fn test_raw_blobs_diff_by_region() {
        let old = StateBlob::new(vec![0u8; 128]);
        let mut bytes = vec![0u8; 128];
        bytes[127] = 9;
        let summary = diff_blobs(&old, &StateBlob::new(bytes), 64);
        assert_eq!(summary.paths().collect::<Vec<_>>(), vec!["raw#1"]);
    }

    #[test]
    fn test_paths_overlap() {
        assert!(paths_overlap("x", "x"));
        assert!(paths_overlap("a", "a.b"));
        assert!(paths_overlap("buf#2", "buf"));
        assert!(!paths_overlap("a", "ab"));
        assert!(!paths_overlap("buf#1", "buf#2"));
        assert!(!paths_overlap("a.b", "a.c"));
    }

    #[test]
    fn test_three_way_merge_disjoint() {
        let base = blob(ModuleState::new().with("x", 1i64).with("y", 1i64));
        let current = blob(ModuleState::new().with("x", 2i64).with("y", 1i64));
        let new = blob(ModuleState::new().with("x", 1i64).with("y", 3i64).with("z", 0i64));

        let MergeOutcome::Clean(merged) = three_way_merge(&base, &current, &new, 64) else {
            panic!("expected clean merge");
        };
        let merged = ModuleState::decode(merged.as_bytes()).unwrap();
        assert_eq!(merged.get("x"), Some(&Value::Int(2)));
        assert_eq!(merged.get("y"), Some(&Value::Int(3)));
        assert_eq!(merged.get("z"), Some(&Value::Int(0)));
    }

    #[test]
    fn test_three_way_merge_conflict() {
        let base = blob(ModuleState::new().with("x", 1i64));
        let current = blob(ModuleState::new().with("x", 2i64));
        let new = blob(ModuleState::new().with("x", 3i64));
        assert_eq!(
            three_way_merge(&base, &current, &new, 64),
            MergeOutcome::Conflicting(vec!["x".to_string()])
        );

        // Identical changes merge cleanly
        assert!(matches!(
            three_way_merge(&base, &current, &current, 64),
            MergeOutcome::Clean(_)
        ));
    }

    #[test]
    fn test_three_way_merge_raw_regions() {
        let base = StateBlob::new(vec![0u8; 130]);
        let mut cur = vec![0u8; 130];
        cur[0] = 1;
        let mut new = vec![0u8; 130];
        new[129] = 2;

        let MergeOutcome::Clean(merged) =
            three_way_merge(&base, &StateBlob::new(cur), &StateBlob::new(new), 64)
        else {
            panic!("expected clean merge");
        };
        assert!(!merged.is_structured());
        assert_eq!(merged.len(), 130);
        assert_eq!(merged.as_bytes()[0], 1);
        assert_eq!(merged.as_bytes()[129], 2);
    }
}
