//! Module runtime boundary
//!
//! The engine never touches live modules directly. Loading code, serializing
//! state and switching versions all go through [`ModuleRuntime`], which the
//! host implements on top of its own loader.
//!
//! [`InMemoryRuntime`] keeps modules in memory and can inject faults, which
//! makes it the runtime of choice for tests and demos.

use crate::txn::{Operation, OperationKind};
use hotswap_core::{ModuleId, ModuleVersion, StateBlob};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use thiserror::Error;

/// Failure reported by a module runtime
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("{0} is not loaded")]
    UnknownModule(ModuleId),

    #[error("{module} refused to serialize: {reason}")]
    CaptureRefused { module: ModuleId, reason: String },

    #[error("{module} failed to apply operation: {reason}")]
    ApplyFailed { module: ModuleId, reason: String },

    #[error("{module} failed to restore: {reason}")]
    RestoreFailed { module: ModuleId, reason: String },
}

/// A participant's two-phase commit vote
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Vote {
    Commit,
    Abort(String),
}

/// Host-side access to live modules
pub trait ModuleRuntime: Send + Sync {
    /// Version currently live for `module`
    fn current_version(&self, module: ModuleId) -> Option<ModuleVersion>;

    /// Serialize the module's live state
    fn serialize_state(&self, module: ModuleId) -> Result<StateBlob, RuntimeError>;

    /// Put `module` back at `version` with `state`
    fn restore(
        &self,
        module: ModuleId,
        version: &ModuleVersion,
        state: &StateBlob,
    ) -> Result<(), RuntimeError>;

    /// Vote on whether `operation` can be applied
    fn prepare(&self, module: ModuleId, operation: &Operation) -> Vote;

    /// Drop anything staged by `prepare`
    fn discard_prepared(&self, module: ModuleId);

    /// Apply a prepared operation
    fn apply(&self, module: ModuleId, operation: &Operation) -> Result<(), RuntimeError>;
}

#[derive(Debug, Clone)]
struct LoadedModule {
    version: ModuleVersion,
    state: StateBlob,
    active: bool,
    prepared: bool,
}

#[derive(Debug, Default)]
struct Faults {
    fail_apply: HashSet<ModuleId>,
    fail_restore: HashSet<ModuleId>,
    refuse_capture: HashSet<ModuleId>,
    reject_prepare: HashMap<ModuleId, String>,
    delay_prepare: HashMap<ModuleId, Duration>,
    delay_apply: HashMap<ModuleId, Duration>,
}

#[derive(Debug, Default)]
struct Counters {
    applies: HashMap<ModuleId, u64>,
    prepares: HashMap<ModuleId, u64>,
    discards: HashMap<ModuleId, u64>,
    restores: HashMap<ModuleId, u64>,
}

/// In-memory module runtime with fault injection
///
/// # Example
///
/// ```
/// use hotswap_core::{ModuleId, ModuleVersion, StateBlob};
/// use hotswap_engine::{InMemoryRuntime, ModuleRuntime};
///
/// let runtime = InMemoryRuntime::new();
/// runtime.load(ModuleVersion::new(ModuleId(1), 1), StateBlob::new(vec![1, 2, 3]));
/// assert_eq!(runtime.current_version(ModuleId(1)).unwrap().version_id(), 1);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryRuntime {
    modules: RwLock<BTreeMap<ModuleId, LoadedModule>>,
    faults: Mutex<Faults>,
    counters: Mutex<Counters>,
}

impl InMemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load (or replace) a module
    pub fn load(&self, version: ModuleVersion, state: StateBlob) {
        let module = version.module();
        self.modules.write().insert(
            module,
            LoadedModule {
                version,
                state,
                active: true,
                prepared: false,
            },
        );
    }

    /// Live state of `module`
    pub fn state_of(&self, module: ModuleId) -> Option<StateBlob> {
        self.modules.read().get(&module).map(|m| m.state.clone())
    }

    pub fn is_active(&self, module: ModuleId) -> bool {
        self.modules.read().get(&module).is_some_and(|m| m.active)
    }

    /// Whether `module` has a staged, unapplied prepare
    pub fn is_prepared(&self, module: ModuleId) -> bool {
        self.modules.read().get(&module).is_some_and(|m| m.prepared)
    }

    /// Make every apply on `module` fail
    pub fn fail_apply(&self, module: ModuleId) {
        self.faults.lock().fail_apply.insert(module);
    }

    /// Make every restore on `module` fail
    pub fn fail_restore(&self, module: ModuleId) {
        self.faults.lock().fail_restore.insert(module);
    }

    /// Make `serialize_state` on `module` fail
    pub fn refuse_capture(&self, module: ModuleId) {
        self.faults.lock().refuse_capture.insert(module);
    }

    /// Make `module` vote abort
    pub fn reject_prepare(&self, module: ModuleId, reason: impl Into<String>) {
        self.faults
            .lock()
            .reject_prepare
            .insert(module, reason.into());
    }

    /// Make `module` sleep before voting
    pub fn delay_prepare(&self, module: ModuleId, delay: Duration) {
        self.faults.lock().delay_prepare.insert(module, delay);
    }

    /// Make `module` sleep at the start of every apply
    pub fn delay_apply(&self, module: ModuleId, delay: Duration) {
        self.faults.lock().delay_apply.insert(module, delay);
    }

    /// Remove every injected fault
    pub fn clear_faults(&self) {
        *self.faults.lock() = Faults::default();
    }

    /// Number of `apply` calls made against `module`
    pub fn apply_count(&self, module: ModuleId) -> u64 {
        self.counters.lock().applies.get(&module).copied().unwrap_or(0)
    }

    /// Number of `prepare` calls made against `module`
    pub fn prepare_count(&self, module: ModuleId) -> u64 {
        self.counters.lock().prepares.get(&module).copied().unwrap_or(0)
    }

    /// Number of `restore` calls made against `module`
    pub fn restore_count(&self, module: ModuleId) -> u64 {
        self.counters.lock().restores.get(&module).copied().unwrap_or(0)
    }

    /// Number of `discard_prepared` calls made against `module`
    pub fn discard_count(&self, module: ModuleId) -> u64 {
        self.counters.lock().discards.get(&module).copied().unwrap_or(0)
    }
}

impl ModuleRuntime for InMemoryRuntime {
    fn current_version(&self, module: ModuleId) -> Option<ModuleVersion> {
        self.modules.read().get(&module).map(|m| m.version.clone())
    }

    fn serialize_state(&self, module: ModuleId) -> Result<StateBlob, RuntimeError> {
        if self.faults.lock().refuse_capture.contains(&module) {
            return Err(RuntimeError::CaptureRefused {
                module,
                reason: "capture disabled".to_string(),
            });
        }
        self.state_of(module)
            .ok_or(RuntimeError::UnknownModule(module))
    }

    fn restore(
        &self,
        module: ModuleId,
        version: &ModuleVersion,
        state: &StateBlob,
    ) -> Result<(), RuntimeError> {
        *self.counters.lock().restores.entry(module).or_default() += 1;
        if self.faults.lock().fail_restore.contains(&module) {
            return Err(RuntimeError::RestoreFailed {
                module,
                reason: "restore disabled".to_string(),
            });
        }
        let mut modules = self.modules.write();
        let loaded = modules
            .get_mut(&module)
            .ok_or(RuntimeError::UnknownModule(module))?;
        loaded.version = version.clone();
        loaded.state = state.clone();
        loaded.active = true;
        loaded.prepared = false;
        Ok(())
    }

    fn prepare(&self, module: ModuleId, _operation: &Operation) -> Vote {
        *self.counters.lock().prepares.entry(module).or_default() += 1;

        let (delay, rejection) = {
            let faults = self.faults.lock();
            (
                faults.delay_prepare.get(&module).copied(),
                faults.reject_prepare.get(&module).cloned(),
            )
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if let Some(reason) = rejection {
            return Vote::Abort(reason);
        }

        match self.modules.write().get_mut(&module) {
            Some(loaded) => {
                loaded.prepared = true;
                Vote::Commit
            }
            None => Vote::Abort(format!("{} is not loaded", module)),
        }
    }

    fn discard_prepared(&self, module: ModuleId) {
        *self.counters.lock().discards.entry(module).or_default() += 1;
        if let Some(loaded) = self.modules.write().get_mut(&module) {
            loaded.prepared = false;
        }
    }

    fn apply(&self, module: ModuleId, operation: &Operation) -> Result<(), RuntimeError> {
        *self.counters.lock().applies.entry(module).or_default() += 1;
        let delay = self.faults.lock().delay_apply.get(&module).copied();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if self.faults.lock().fail_apply.contains(&module) {
            return Err(RuntimeError::ApplyFailed {
                module,
                reason: "injected apply failure".to_string(),
            });
        }

        let mut modules = self.modules.write();
        let loaded = modules
            .get_mut(&module)
            .ok_or(RuntimeError::UnknownModule(module))?;
        match (operation.kind, &operation.payload) {
            (OperationKind::Install | OperationKind::Rollback, Some(payload)) => {
                loaded.version = payload.version.clone();
                loaded.state = payload.state.clone();
                loaded.active = true;
            }
            (OperationKind::Install | OperationKind::Rollback, None) => {
                return Err(RuntimeError::ApplyFailed {
                    module,
                    reason: "operation has no payload".to_string(),
                });
            }
            (OperationKind::Activate, _) => loaded.active = true,
            (OperationKind::Deactivate, _) => loaded.active = false,
        }
        loaded.prepared = false;
        Ok(())
    }
}
