//! Semantic field types and storage hints.

use mnemo_expr::ValueKind;
use serde::{Deserialize, Serialize};

/// Semantic type of a unit field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyType {
    /// Boolean.
    Bool,
    /// 64-bit signed integer.
    Int,
    /// Arbitrary-precision integer.
    BigInt,
    /// 64-bit floating point.
    Float,
    /// Fixed-point decimal (scale/precision via storage hints).
    Decimal,
    /// UTF-8 text.
    Str,
    /// Raw bytes.
    Bytes,
    /// Calendar date.
    Date,
    /// Time of day.
    Time,
    /// Calendar timestamp.
    DateTime,
    /// Elapsed time.
    Duration,
    /// Ordered list of values.
    List,
    /// Unordered set of values.
    Set,
    /// String-keyed mapping.
    Map,
    /// Opaquely serialized payload for unrecognized types.
    Opaque,
}

impl PropertyType {
    /// The value kind instances of this type must carry.
    pub fn kind(&self) -> ValueKind {
        match self {
            PropertyType::Bool => ValueKind::Bool,
            PropertyType::Int => ValueKind::Int,
            PropertyType::BigInt => ValueKind::BigInt,
            PropertyType::Float => ValueKind::Float,
            PropertyType::Decimal => ValueKind::Decimal,
            PropertyType::Str => ValueKind::Str,
            PropertyType::Bytes => ValueKind::Bytes,
            PropertyType::Date => ValueKind::Date,
            PropertyType::Time => ValueKind::Time,
            PropertyType::DateTime => ValueKind::DateTime,
            PropertyType::Duration => ValueKind::Duration,
            PropertyType::List => ValueKind::List,
            PropertyType::Set => ValueKind::Set,
            PropertyType::Map => ValueKind::Map,
            PropertyType::Opaque => ValueKind::Opaque,
        }
    }

    /// Check if this type is numeric.
    pub fn is_numeric(&self) -> bool {
        self.kind().is_numeric()
    }

    /// Check if identities of this type can be allocated by the default
    /// sequencer.
    pub fn is_sequenceable(&self) -> bool {
        matches!(self, PropertyType::Int)
    }
}

/// Backend-facing storage hints for a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StorageHints {
    /// Maximum encoded size for text/bytes fields.
    pub max_bytes: Option<u32>,
    /// Total number of digits for decimal fields.
    pub precision: Option<u8>,
    /// Digits after the decimal point for decimal fields.
    pub scale: Option<u8>,
}

impl StorageHints {
    /// Hints for a text or bytes field with a size cap.
    pub fn sized(max_bytes: u32) -> Self {
        Self {
            max_bytes: Some(max_bytes),
            ..Self::default()
        }
    }

    /// Hints for a decimal field.
    pub fn decimal(precision: u8, scale: u8) -> Self {
        Self {
            precision: Some(precision),
            scale: Some(scale),
            max_bytes: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_kinds() {
        assert_eq!(PropertyType::Int.kind(), ValueKind::Int);
        assert_eq!(PropertyType::Map.kind(), ValueKind::Map);
        assert!(PropertyType::Decimal.is_numeric());
        assert!(!PropertyType::Str.is_numeric());
        assert!(PropertyType::Int.is_sequenceable());
        assert!(!PropertyType::BigInt.is_sequenceable());
    }
}
