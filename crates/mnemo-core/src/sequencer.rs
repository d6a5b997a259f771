//! Identity allocation.

use mnemo_expr::Value;

use crate::error::Error;
use crate::model::{PropertyType, UnitClass};

/// Allocation strategy for unit identities.
///
/// Callers hold the per-class reserve lock for the whole allocation, so an
/// implementation only has to be distinct with respect to `existing`;
/// backends with native allocation (autoincrement and the like) substitute
/// their own implementation behind this trait.
pub trait Sequencer: Send + Sync {
    /// Whether an identity tuple is fully assigned and well-formed.
    fn valid(&self, identity: &[Value]) -> bool {
        !identity.is_empty() && identity.iter().all(|v| !v.is_null())
    }

    /// Allocate an identity distinct from every tuple in `existing`.
    fn assign(&self, class: &UnitClass, existing: &[Vec<Value>]) -> Result<Vec<Value>, Error>;
}

/// Monotonic integer allocation: one more than the maximum observed
/// identity, seeded at 1.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicSequencer;

impl Sequencer for MonotonicSequencer {
    fn assign(&self, class: &UnitClass, existing: &[Vec<Value>]) -> Result<Vec<Value>, Error> {
        let [identifier] = class.identifiers() else {
            return Err(Error::Definition(format!(
                "cannot auto-assign a composite identity for class `{}`",
                class.name()
            )));
        };
        let field = class
            .field(identifier)
            .ok_or_else(|| Error::UnknownField {
                class: class.name().to_owned(),
                field: identifier.clone(),
            })?;
        if field.property_type != PropertyType::Int {
            return Err(Error::Definition(format!(
                "cannot auto-assign `{}.{}`: identity sequencing needs an integer field",
                class.name(),
                identifier
            )));
        }

        let max = existing
            .iter()
            .filter_map(|identity| identity.first())
            .filter_map(Value::as_int)
            .max()
            .unwrap_or(0);
        Ok(vec![Value::Int(max + 1)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldDef, UnitClass};

    #[test]
    fn test_monotonic_assignment() {
        let class = UnitClass::builder("Zoo")
            .field(FieldDef::new("id", PropertyType::Int))
            .identifiers(["id"])
            .build()
            .unwrap();

        let seq = MonotonicSequencer;
        assert_eq!(seq.assign(&class, &[]).unwrap(), vec![Value::Int(1)]);

        let existing = vec![vec![Value::Int(3)], vec![Value::Int(7)], vec![Value::Int(2)]];
        assert_eq!(seq.assign(&class, &existing).unwrap(), vec![Value::Int(8)]);
    }

    #[test]
    fn test_validity() {
        let seq = MonotonicSequencer;
        assert!(seq.valid(&[Value::Int(1)]));
        assert!(!seq.valid(&[Value::Null]));
        assert!(!seq.valid(&[]));
        assert!(!seq.valid(&[Value::Int(1), Value::Null]));
    }

    #[test]
    fn test_composite_identity_is_rejected() {
        let class = UnitClass::builder("Edge")
            .field(FieldDef::new("a", PropertyType::Int))
            .field(FieldDef::new("b", PropertyType::Int))
            .identifiers(["a", "b"])
            .build()
            .unwrap();
        assert!(MonotonicSequencer.assign(&class, &[]).is_err());
    }

    #[test]
    fn test_non_integer_identity_is_rejected() {
        let class = UnitClass::builder("Tag")
            .field(FieldDef::new("name", PropertyType::Str))
            .identifiers(["name"])
            .build()
            .unwrap();
        assert!(MonotonicSequencer.assign(&class, &[]).is_err());
    }
}
