//! Record instances.
//!
//! A `Unit` owns its field values exclusively; getters clone values out and
//! setters take ownership, so no interior aliasing is possible. Dirtiness is
//! tracked by content: a blake3 fingerprint of the codec-encoded row is
//! taken at every cleanse (load/save), and the unit is dirty whenever the
//! current fingerprint differs. Assigning a value equal to the current one
//! therefore does not dirty the unit.

use std::sync::Arc;

use mnemo_expr::{codec, Row, Value};

use crate::error::{render_identity, Error};
use crate::model::UnitClass;

/// One record: a unit class plus its field values.
pub struct Unit {
    class: Arc<UnitClass>,
    /// Parallel to `class.fields()` declaration order.
    values: Vec<Value>,
    clean_fingerprint: Option<[u8; 32]>,
    destroyed: bool,
}

impl std::fmt::Debug for Unit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unit")
            .field("class", &self.class.name())
            .field("identity", &render_identity(&self.identity()))
            .field("dirty", &self.dirty())
            .finish()
    }
}

impl Unit {
    /// Create a detached instance with declared defaults applied.
    pub fn new(class: Arc<UnitClass>) -> Unit {
        let values = class.fields().iter().map(|f| f.initial_value()).collect();
        Unit {
            class,
            values,
            clean_fingerprint: None,
            destroyed: false,
        }
    }

    /// Materialize an instance from a stored row. The result is clean.
    ///
    /// Fields absent from the row become null; row entries with no matching
    /// field are dropped.
    pub fn from_row(class: Arc<UnitClass>, row: &Row) -> Unit {
        let values = class
            .fields()
            .iter()
            .map(|f| codec::get_field(row, &f.name).cloned().unwrap_or(Value::Null))
            .collect();
        let mut unit = Unit {
            class,
            values,
            clean_fingerprint: None,
            destroyed: false,
        };
        unit.cleanse();
        unit
    }

    /// The unit's class.
    pub fn class(&self) -> &Arc<UnitClass> {
        &self.class
    }

    /// Read a field value (cloned out; the unit keeps exclusive ownership).
    pub fn get(&self, name: &str) -> Result<Value, Error> {
        self.ensure_live()?;
        let index = self.field_index(name)?;
        Ok(self.values[index].clone())
    }

    /// Assign a field value.
    ///
    /// The value must be null or an instance of the declared type; narrower
    /// numeric values widen to the declared type. Anything else fails with a
    /// type mismatch — there is no silent default coercion. `before_set`
    /// hooks may rewrite or veto the assignment; `after_set` hooks observe
    /// the final value.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<(), Error> {
        self.ensure_live()?;
        let index = self.field_index(name)?;
        let field = &self.class.fields()[index];
        let declared = field.property_type.kind();

        let incoming = value.into();
        let actual = incoming.kind();
        let mut coerced = incoming.coerce_to(declared).ok_or_else(|| Error::TypeMismatch {
            class: self.class.name().to_owned(),
            field: name.to_owned(),
            expected: declared.to_string(),
            actual: actual.to_string(),
        })?;

        let old = self.values[index].clone();
        if let Some(hooks) = self.class.hooks(name) {
            for hook in &hooks.before {
                if let Some(rewritten) = hook(&self.class, name, &old, &coerced)? {
                    coerced = rewritten.coerce_to(declared).ok_or_else(|| {
                        Error::TypeMismatch {
                            class: self.class.name().to_owned(),
                            field: name.to_owned(),
                            expected: declared.to_string(),
                            actual: "hook result".to_owned(),
                        }
                    })?;
                }
            }
        }

        self.values[index] = coerced.clone();

        if let Some(hooks) = self.class.hooks(name) {
            for hook in &hooks.after {
                hook(&self.class, name, &old, &coerced);
            }
        }
        Ok(())
    }

    /// Assign several fields in one update.
    ///
    /// Hooks fire grouped per field, in class declaration order regardless
    /// of the order of the input pairs.
    pub fn set_many(
        &mut self,
        values: impl IntoIterator<Item = (String, Value)>,
    ) -> Result<(), Error> {
        let mut pending: Vec<(String, Value)> = values.into_iter().collect();
        let order: Vec<String> = self
            .class
            .fields()
            .iter()
            .map(|f| f.name.clone())
            .collect();
        pending.sort_by_key(|(name, _)| {
            order.iter().position(|f| f == name).unwrap_or(usize::MAX)
        });
        for (name, value) in pending {
            self.set(&name, value)?;
        }
        Ok(())
    }

    /// Assign without type checks or hooks. Used by the reserve path to
    /// install sequencer-allocated identity values.
    pub(crate) fn set_raw(&mut self, name: &str, value: Value) -> Result<(), Error> {
        let index = self.field_index(name)?;
        self.values[index] = value;
        Ok(())
    }

    /// The unit as a field row, in declaration order.
    pub fn row(&self) -> Row {
        self.class
            .fields()
            .iter()
            .zip(&self.values)
            .map(|(f, v)| (f.name.clone(), v.clone()))
            .collect()
    }

    /// The identity tuple, in identifier order.
    pub fn identity(&self) -> Vec<Value> {
        self.class
            .identifiers()
            .iter()
            .filter_map(|id| self.class.field_index(id))
            .map(|index| self.values[index].clone())
            .collect()
    }

    /// Whether every identifier field holds a non-null value.
    pub fn has_identity(&self) -> bool {
        let identity = self.identity();
        !identity.is_empty() && identity.iter().all(|v| !v.is_null())
    }

    /// The identity tuple in its canonical key encoding.
    pub fn identity_key(&self) -> Vec<u8> {
        codec::encode_values(&self.identity())
    }

    /// Content fingerprint of the current field values.
    pub fn fingerprint(&self) -> [u8; 32] {
        *blake3::hash(&codec::encode_row(&self.row())).as_bytes()
    }

    /// Hex form of the fingerprint, for trace events.
    pub fn fingerprint_hex(&self) -> String {
        hex::encode(self.fingerprint())
    }

    /// Whether any field changed since the last cleanse.
    pub fn dirty(&self) -> bool {
        match self.clean_fingerprint {
            Some(clean) => clean != self.fingerprint(),
            None => true,
        }
    }

    /// Mark the current state as persisted.
    pub fn cleanse(&mut self) {
        self.clean_fingerprint = Some(self.fingerprint());
    }

    /// Whether the unit was destroyed.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Mark destroyed; every later operation fails.
    pub(crate) fn mark_destroyed(&mut self) {
        self.destroyed = true;
    }

    fn ensure_live(&self) -> Result<(), Error> {
        if self.destroyed {
            Err(Error::Destroyed)
        } else {
            Ok(())
        }
    }

    fn field_index(&self, name: &str) -> Result<usize, Error> {
        self.class
            .field_index(name)
            .ok_or_else(|| Error::UnknownField {
                class: self.class.name().to_owned(),
                field: name.to_owned(),
            })
    }

    /// Typed read of a boolean field.
    pub fn get_bool(&self, name: &str) -> Result<Option<bool>, Error> {
        Ok(self.get(name)?.as_bool())
    }

    /// Typed read of an integer field.
    pub fn get_int(&self, name: &str) -> Result<Option<i64>, Error> {
        Ok(self.get(name)?.as_int())
    }

    /// Typed read of a float field (widening from other numerics).
    pub fn get_float(&self, name: &str) -> Result<Option<f64>, Error> {
        Ok(self.get(name)?.as_float())
    }

    /// Typed read of a text field.
    pub fn get_str(&self, name: &str) -> Result<Option<String>, Error> {
        Ok(self.get(name)?.as_str().map(String::from))
    }

    /// Typed read of a datetime field.
    pub fn get_datetime(&self, name: &str) -> Result<Option<chrono::NaiveDateTime>, Error> {
        Ok(self.get(name)?.as_datetime())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldDef, PropertyType, UnitClass};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn animal() -> Arc<UnitClass> {
        UnitClass::builder("Animal")
            .field(FieldDef::new("id", PropertyType::Int))
            .field(FieldDef::new("name", PropertyType::Str))
            .field(FieldDef::new("legs", PropertyType::Int).with_default(4i64))
            .field(FieldDef::new("weight", PropertyType::Float))
            .identifiers(["id"])
            .build()
            .unwrap()
    }

    #[test]
    fn test_defaults_and_dirtiness() {
        let mut unit = Unit::new(animal());
        assert_eq!(unit.get("legs").unwrap(), Value::Int(4));
        assert!(unit.dirty());

        unit.cleanse();
        assert!(!unit.dirty());

        // Assigning an equal value does not dirty the unit.
        unit.set("legs", 4i64).unwrap();
        assert!(!unit.dirty());

        unit.set("legs", 2i64).unwrap();
        assert!(unit.dirty());
    }

    #[test]
    fn test_type_mismatch_is_rejected() {
        let mut unit = Unit::new(animal());
        let err = unit.set("name", 42i64).unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }));

        // Narrower numerics widen; null is always accepted.
        unit.set("weight", 12i64).unwrap();
        assert_eq!(unit.get("weight").unwrap(), Value::Float(12.0));
        unit.set("weight", Value::Null).unwrap();
        assert_eq!(unit.get("weight").unwrap(), Value::Null);
    }

    #[test]
    fn test_identity() {
        let mut unit = Unit::new(animal());
        assert!(!unit.has_identity());
        unit.set("id", 9i64).unwrap();
        assert!(unit.has_identity());
        assert_eq!(unit.identity(), vec![Value::Int(9)]);
    }

    #[test]
    fn test_unknown_field() {
        let unit = Unit::new(animal());
        assert!(matches!(
            unit.get("wings"),
            Err(Error::UnknownField { .. })
        ));
    }

    #[test]
    fn test_destroyed_units_reject_everything() {
        let mut unit = Unit::new(animal());
        unit.mark_destroyed();
        assert!(matches!(unit.get("name"), Err(Error::Destroyed)));
        assert!(matches!(unit.set("name", "x"), Err(Error::Destroyed)));
    }

    #[test]
    fn test_row_roundtrip_is_clean() {
        let mut unit = Unit::new(animal());
        unit.set("id", 1i64).unwrap();
        unit.set("name", "Gus").unwrap();
        let row = unit.row();

        let copy = Unit::from_row(animal(), &row);
        assert!(!copy.dirty());
        assert_eq!(copy.get("name").unwrap(), Value::Str("Gus".into()));
    }

    #[test]
    fn test_before_hook_rewrites_and_after_hook_observes() {
        static AFTER_CALLS: AtomicUsize = AtomicUsize::new(0);

        let class = UnitClass::builder("Animal")
            .field(FieldDef::new("id", PropertyType::Int))
            .field(FieldDef::new("name", PropertyType::Str))
            .identifiers(["id"])
            .before_set("name", |_, _, _, new| {
                let trimmed = new.as_str().map(str::trim).unwrap_or_default();
                Ok(Some(Value::Str(trimmed.to_owned())))
            })
            .after_set("name", |_, _, _, _| {
                AFTER_CALLS.fetch_add(1, Ordering::SeqCst);
            })
            .build()
            .unwrap();

        let mut unit = Unit::new(class);
        unit.set("name", "  Gus  ").unwrap();
        assert_eq!(unit.get("name").unwrap(), Value::Str("Gus".into()));
        assert_eq!(AFTER_CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_before_hook_vetoes() {
        let class = UnitClass::builder("Animal")
            .field(FieldDef::new("id", PropertyType::Int))
            .field(FieldDef::new("legs", PropertyType::Int))
            .identifiers(["id"])
            .before_set("legs", |class, field, _, new| {
                if new.as_int().is_some_and(|n| n < 0) {
                    Err(Error::HookVeto {
                        class: class.name().to_owned(),
                        field: field.to_owned(),
                        reason: "legs cannot be negative".into(),
                    })
                } else {
                    Ok(None)
                }
            })
            .build()
            .unwrap();

        let mut unit = Unit::new(class);
        unit.set("legs", 4i64).unwrap();
        assert!(matches!(
            unit.set("legs", -1i64),
            Err(Error::HookVeto { .. })
        ));
        assert_eq!(unit.get("legs").unwrap(), Value::Int(4));
    }

    #[test]
    fn test_set_many_fires_in_declaration_order() {
        use std::sync::{Arc as StdArc, Mutex};
        let order: StdArc<Mutex<Vec<String>>> = StdArc::new(Mutex::new(Vec::new()));

        let seen_a = order.clone();
        let seen_b = order.clone();
        let class = UnitClass::builder("Pair")
            .field(FieldDef::new("first", PropertyType::Int))
            .field(FieldDef::new("second", PropertyType::Int))
            .after_set("first", move |_, field, _, _| {
                seen_a.lock().unwrap().push(field.to_owned());
            })
            .after_set("second", move |_, field, _, _| {
                seen_b.lock().unwrap().push(field.to_owned());
            })
            .build()
            .unwrap();

        let mut unit = Unit::new(class);
        unit.set_many([
            ("second".to_owned(), Value::Int(2)),
            ("first".to_owned(), Value::Int(1)),
        ])
        .unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }
}
