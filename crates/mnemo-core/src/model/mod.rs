//! The record model: unit classes, fields, associations, and the registry.

mod association;
mod class;
mod field;
mod registry;
mod types;

pub use association::{AssociationDef, Cardinality, Endpoint};
pub use class::{AfterSetHook, BeforeSetHook, FieldHooks, UnitClass, UnitClassBuilder};
pub use field::FieldDef;
pub use registry::Registry;
pub use types::{PropertyType, StorageHints};
