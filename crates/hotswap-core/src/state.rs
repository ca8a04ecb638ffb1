//! Module state: named fields and the opaque blobs they travel in
//!
//! Collaborators hand the engine an opaque [`StateBlob`]. When a blob was
//! produced by [`ModuleState::encode`] the engine can diff it field by field;
//! any other blob is treated as raw bytes.
//!
//! # Encoding
//!
//! ```text
//! +--------+---------+--------------------------+
//! | "HSMS" | version | bincode(ValueMap)        |
//! | 4B     | 1B      | variable                 |
//! +--------+---------+--------------------------+
//! ```
//!
//! # Field paths
//!
//! Nested maps are addressed with dotted paths (`physics.gravity`). The first
//! segment decides the [`FieldClass`]: `sig` holds exported function
//! signatures, `layout` memory layout descriptors, `deps` dependency
//! entries and `counters` numbers that only ever accumulate.

use crate::value::{Value, ValueMap};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Magic bytes that prefix an encoded [`ModuleState`]
pub const STATE_MAGIC: &[u8; 4] = b"HSMS";

/// Current encoding format version
pub const STATE_FORMAT_VERSION: u8 = 1;

/// Path separator for nested map fields
pub const PATH_SEPARATOR: char = '.';

/// Separator between a bytes field path and its region index
pub const REGION_SEPARATOR: char = '#';

/// Immutable, cheaply clonable opaque state payload
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<u8>", into = "Vec<u8>")]
pub struct StateBlob(Arc<[u8]>);

impl StateBlob {
    /// Wrap owned bytes
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Arc::from(bytes))
    }

    /// Copy a byte slice into a new blob
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self(Arc::from(bytes))
    }

    /// An empty blob
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether this blob carries an encoded [`ModuleState`]
    pub fn is_structured(&self) -> bool {
        self.0.len() > STATE_MAGIC.len() && &self.0[..STATE_MAGIC.len()] == STATE_MAGIC
    }
}

impl fmt::Debug for StateBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateBlob({} bytes)", self.0.len())
    }
}

impl From<Vec<u8>> for StateBlob {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl From<StateBlob> for Vec<u8> {
    fn from(blob: StateBlob) -> Self {
        blob.0.to_vec()
    }
}

impl AsRef<[u8]> for StateBlob {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Classification of a field by its top-level namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldClass {
    /// Plain module data
    Data,
    /// Exported function signature (`sig.*`)
    Signature,
    /// Memory layout descriptor (`layout.*`)
    Layout,
    /// Dependency entry (`deps.*`)
    Dependency,
    /// Accumulating number (`counters.*`); concurrent increments add up
    Counter,
}

impl FieldClass {
    /// Classify a field path by its first segment
    pub fn of(path: &str) -> Self {
        let head = path
            .split([PATH_SEPARATOR, REGION_SEPARATOR])
            .next()
            .unwrap_or_default();
        match head {
            "sig" => FieldClass::Signature,
            "layout" => FieldClass::Layout,
            "deps" => FieldClass::Dependency,
            "counters" => FieldClass::Counter,
            _ => FieldClass::Data,
        }
    }
}

/// Structured module state: an ordered map of named fields
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ModuleState {
    fields: ValueMap,
}

impl ModuleState {
    /// Create an empty state
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a state from an existing field map
    pub fn from_fields(fields: ValueMap) -> Self {
        Self { fields }
    }

    /// Builder-style top-level field insertion
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Set a top-level field
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    /// Get a top-level field
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Remove a top-level field
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.shift_remove(key)
    }

    pub fn fields(&self) -> &ValueMap {
        &self.fields
    }

    pub fn into_fields(self) -> ValueMap {
        self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Resolve a dotted path through nested maps
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split(PATH_SEPARATOR);
        let mut current = self.fields.get(segments.next()?)?;
        for segment in segments {
            current = current.as_map()?.get(segment)?;
        }
        Some(current)
    }

    /// Set a value at a dotted path, creating intermediate maps
    ///
    /// Fails if an intermediate segment exists and is not a map.
    pub fn set_path(&mut self, path: &str, value: Value) -> Result<()> {
        let segments = split_path(path)?;
        let (last, parents) = segments
            .split_last()
            .ok_or_else(|| invalid_path(path, "empty path"))?;

        let mut map = &mut self.fields;
        for segment in parents {
            let entry = map
                .entry((*segment).to_string())
                .or_insert_with(|| Value::Map(ValueMap::new()));
            map = match entry {
                Value::Map(inner) => inner,
                other => {
                    return Err(invalid_path(
                        path,
                        &format!("segment '{}' is a {}", segment, other.type_name()),
                    ))
                }
            };
        }
        map.insert((*last).to_string(), value);
        Ok(())
    }

    /// Remove the value at a dotted path
    pub fn remove_path(&mut self, path: &str) -> Option<Value> {
        let segments: Vec<&str> = path.split(PATH_SEPARATOR).collect();
        let (last, parents) = segments.split_last()?;
        let mut map = &mut self.fields;
        for segment in parents {
            map = match map.get_mut(*segment)? {
                Value::Map(inner) => inner,
                _ => return None,
            };
        }
        map.shift_remove(*last)
    }

    /// Encode into a tagged blob
    pub fn encode(&self) -> Result<StateBlob> {
        let body = bincode::serialize(&self.fields)?;
        let mut bytes = Vec::with_capacity(STATE_MAGIC.len() + 1 + body.len());
        bytes.extend_from_slice(STATE_MAGIC);
        bytes.push(STATE_FORMAT_VERSION);
        bytes.extend_from_slice(&body);
        Ok(StateBlob::new(bytes))
    }

    /// Decode a tagged blob
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() <= STATE_MAGIC.len() || &bytes[..STATE_MAGIC.len()] != STATE_MAGIC {
            return Err(Error::InvalidStateMagic);
        }
        let version = bytes[STATE_MAGIC.len()];
        if version != STATE_FORMAT_VERSION {
            return Err(Error::UnsupportedFormat(version));
        }
        let fields: ValueMap = bincode::deserialize(&bytes[STATE_MAGIC.len() + 1..])?;
        Ok(Self { fields })
    }
}

impl FromIterator<(String, Value)> for ModuleState {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

fn split_path(path: &str) -> Result<Vec<&str>> {
    let segments: Vec<&str> = path.split(PATH_SEPARATOR).collect();
    for segment in &segments {
        if segment.is_empty() {
            return Err(invalid_path(path, "empty segment"));
        }
        if segment.contains(REGION_SEPARATOR) {
            return Err(invalid_path(path, "segment contains region separator"));
        }
    }
    Ok(segments)
}

fn invalid_path(path: &str, reason: &str) -> Error {
    Error::InvalidPath {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let state = ModuleState::new()
            .with("x", 1i64)
            .with("name", "physics")
            .with("buf", Value::bytes(vec![1u8, 2, 3]));

        let blob = state.encode().unwrap();
        assert!(blob.is_structured());
        assert_eq!(ModuleState::decode(blob.as_bytes()).unwrap(), state);
    }

    #[test]
    fn test_raw_blob_is_not_structured() {
        let blob = StateBlob::new(vec![0xde, 0xad, 0xbe, 0xef, 0x01]);
        assert!(!blob.is_structured());
        assert!(matches!(
            ModuleState::decode(blob.as_bytes()),
            Err(Error::InvalidStateMagic)
        ));
    }

    #[test]
    fn test_unsupported_version() {
        let mut bytes = ModuleState::new().with("x", 1i64).encode().unwrap().as_bytes().to_vec();
        bytes[4] = 99;
        assert!(matches!(
            ModuleState::decode(&bytes),
            Err(Error::UnsupportedFormat(99))
        ));
    }

    #[test]
    fn test_paths() {
        let mut state = ModuleState::new();
        state.set_path("physics.gravity", Value::Float(9.8)).unwrap();
        state.set_path("physics.drag", Value::Float(0.1)).unwrap();

        assert_eq!(
            state.get_path("physics.gravity").and_then(|v| v.as_float()),
            Some(9.8)
        );
        assert_eq!(state.len(), 1);

        assert_eq!(state.remove_path("physics.drag"), Some(Value::Float(0.1)));
        assert!(state.get_path("physics.drag").is_none());
    }

    #[test]
    fn test_set_path_through_scalar_fails() {
        let mut state = ModuleState::new().with("x", 1i64);
        assert!(state.set_path("x.y", Value::Int(2)).is_err());
        assert!(state.set_path("a..b", Value::Int(2)).is_err());
        assert!(state.set_path("a#1", Value::Int(2)).is_err());
    }

    #[test]
    fn test_field_class() {
        assert_eq!(FieldClass::of("sig.update"), FieldClass::Signature);
        assert_eq!(FieldClass::of("layout.agent"), FieldClass::Layout);
        assert_eq!(FieldClass::of("deps.render"), FieldClass::Dependency);
        assert_eq!(FieldClass::of("counters.frames"), FieldClass::Counter);
        assert_eq!(FieldClass::of("counter"), FieldClass::Data);
        assert_eq!(FieldClass::of("x"), FieldClass::Data);
        assert_eq!(FieldClass::of("buf#3"), FieldClass::Data);
    }

    #[test]
    fn test_blob_serde_roundtrip_through_ron() {
        let blob = StateBlob::new(vec![1, 2, 3]);
        let text = ron::to_string(&blob).unwrap();
        let back: StateBlob = ron::from_str(&text).unwrap();
        assert_eq!(back, blob);
    }
}
