//! Module versions
//!
//! A [`ModuleVersion`] is immutable once created. Versions of one module form
//! a total order by `version_id`.

use crate::identity::ModuleId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// How far a version departs from the one it replaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum CompatibilityLevel {
    /// Bug fix, fully compatible
    #[default]
    Patch,
    /// Additive change
    Minor,
    /// Incompatible change
    Major,
}

/// An immutable, versioned build of a module
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModuleVersion {
    module: ModuleId,
    version_id: u64,
    checksum: u32,
    dependency_hash: u64,
    compatibility: CompatibilityLevel,
    breaking_change: bool,
    tag: String,
    created_at: u64,
}

impl ModuleVersion {
    /// Create a version with default metadata
    pub fn new(module: ModuleId, version_id: u64) -> Self {
        Self {
            module,
            version_id,
            checksum: 0,
            dependency_hash: 0,
            compatibility: CompatibilityLevel::Patch,
            breaking_change: false,
            tag: format!("v{}", version_id),
            created_at: 0,
        }
    }

    pub fn with_checksum(mut self, checksum: u32) -> Self {
        self.checksum = checksum;
        self
    }

    pub fn with_dependency_hash(mut self, hash: u64) -> Self {
        self.dependency_hash = hash;
        self
    }

    pub fn with_compatibility(mut self, level: CompatibilityLevel) -> Self {
        self.compatibility = level;
        self
    }

    /// Mark this version as carrying a breaking change
    pub fn breaking(mut self) -> Self {
        self.breaking_change = true;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    /// Set the creation timestamp (microseconds)
    pub fn created_at(mut self, micros: u64) -> Self {
        self.created_at = micros;
        self
    }

    pub fn module(&self) -> ModuleId {
        self.module
    }

    pub fn version_id(&self) -> u64 {
        self.version_id
    }

    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    pub fn dependency_hash(&self) -> u64 {
        self.dependency_hash
    }

    pub fn compatibility(&self) -> CompatibilityLevel {
        self.compatibility
    }

    pub fn is_breaking(&self) -> bool {
        self.breaking_change
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn timestamp(&self) -> u64 {
        self.created_at
    }

    /// Whether this version satisfies a minimum required version id
    pub fn satisfies(&self, required_version: u64) -> bool {
        self.version_id >= required_version
    }

    /// Compare two versions of the same module
    ///
    /// Returns `None` for versions of different modules.
    pub fn compare(&self, other: &ModuleVersion) -> Option<Ordering> {
        (self.module == other.module).then(|| self.version_id.cmp(&other.version_id))
    }
}

impl fmt::Display for ModuleVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.module, self.version_id)?;
        if self.breaking_change {
            write!(f, " (breaking)")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_order() {
        let m = ModuleId(1);
        let v1 = ModuleVersion::new(m, 1);
        let v2 = ModuleVersion::new(m, 2).breaking();

        assert_eq!(v1.compare(&v2), Some(Ordering::Less));
        assert_eq!(v1.compare(&ModuleVersion::new(ModuleId(2), 1)), None);
        assert!(v2.satisfies(2));
        assert!(!v1.satisfies(2));
    }

    #[test]
    fn test_version_display() {
        let v = ModuleVersion::new(ModuleId(3), 7).breaking();
        assert_eq!(v.to_string(), "module:3@7 (breaking)");
        assert_eq!(v.tag(), "v7");
    }
}
