//! Hotswap Core - shared vocabulary for transactional module hot-swapping
//!
//! This crate holds the types every other hotswap crate speaks in:
//!
//! - **Identity**: [`ModuleId`], [`TxnId`], [`SnapshotId`] and friends, issued by an [`IdAllocator`]
//! - **Values**: dynamic [`Value`] and insertion-ordered [`ValueMap`]
//! - **State**: structured [`ModuleState`] and the opaque [`StateBlob`] it encodes into
//! - **Versions**: immutable [`ModuleVersion`] records
//! - **Time**: the [`Clock`] trait with [`SystemClock`] and [`ManualClock`]
//!
//! # Example
//!
//! ```
//! use hotswap_core::{ModuleState, Value};
//!
//! let state = ModuleState::new().with("x", 1i64).with("name", "physics");
//! let blob = state.encode().unwrap();
//! assert!(blob.is_structured());
//!
//! let back = ModuleState::decode(blob.as_bytes()).unwrap();
//! assert_eq!(back.get("x"), Some(&Value::Int(1)));
//! ```

mod error;
pub mod identity;
pub mod state;
pub mod time;
pub mod value;
pub mod version;

pub use error::{Error, Result};
pub use identity::{
    ActionId, ConflictId, ErrorId, IdAllocator, ModuleId, OperationId, SnapshotId, TxnId,
};
pub use state::{FieldClass, ModuleState, StateBlob, STATE_FORMAT_VERSION, STATE_MAGIC};
pub use time::{Clock, ManualClock, SystemClock};
pub use value::{Value, ValueMap};
pub use version::{CompatibilityLevel, ModuleVersion};
