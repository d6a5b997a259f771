//! mnemo core - record model, identity-map sessions, and storage pipeline.
//!
//! Application code defines [`UnitClass`]es with typed fields, declares
//! associations in a [`Registry`], and reads/writes instances through a
//! [`Sandbox`] bound to a chain of [`StorageBackend`]s. Predicates are
//! built once with `mnemo_expr` and evaluated natively by backends or
//! locally as a fallback.

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod error;
pub mod model;
pub mod pipeline;
pub mod sequencer;
pub mod session;
pub mod storage;
pub mod unit;

pub use error::{
    ConflictMode, Error, FlushError, FlushFailure, StorageWarning, Warnings,
};
pub use model::{
    AssociationDef, Cardinality, Endpoint, FieldDef, PropertyType, Registry, StorageHints,
    UnitClass, UnitClassBuilder,
};
pub use pipeline::{AgedCache, BurnedCache, ObjectCache, VerticalPartitioner};
pub use sequencer::{MonotonicSequencer, Sequencer};
pub use session::{Recall, Related, Sandbox, SharedUnit};
pub use storage::{DiskBackend, Join, MemoryBackend, Options, StorageBackend};
pub use unit::Unit;

/// Re-export expression types.
pub use mnemo_expr as expr;
