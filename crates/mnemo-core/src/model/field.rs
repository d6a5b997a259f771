//! Field definitions for unit classes.

use mnemo_expr::Value;
use serde::{Deserialize, Serialize};

use super::types::{PropertyType, StorageHints};

/// A field definition within a unit class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Field name.
    pub name: String,
    /// Semantic type.
    pub property_type: PropertyType,
    /// Whether backends should index this field.
    pub indexed: bool,
    /// Backend-facing storage hints.
    pub hints: StorageHints,
    /// Default value applied to detached instances.
    pub default: Option<Value>,
}

impl FieldDef {
    /// Create a field definition.
    pub fn new(name: impl Into<String>, property_type: PropertyType) -> Self {
        Self {
            name: name.into(),
            property_type,
            indexed: false,
            hints: StorageHints::default(),
            default: None,
        }
    }

    /// Mark as indexed.
    pub fn with_index(mut self) -> Self {
        self.indexed = true;
        self
    }

    /// Set storage hints.
    pub fn with_hints(mut self, hints: StorageHints) -> Self {
        self.hints = hints;
        self
    }

    /// Set the default value.
    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }

    /// The default for new instances: the declared default, else null.
    pub fn initial_value(&self) -> Value {
        self.default.clone().unwrap_or(Value::Null)
    }
}
