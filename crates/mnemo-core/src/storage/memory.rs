//! Unindexed in-memory terminal backend.
//!
//! Rows are kept per class in a locked map keyed by the encoded identity
//! tuple (classes without identifiers are keyed by their whole encoded row
//! and are effectively append-only). Filtering is exact local evaluation,
//! so every expression — perfect or not — is resolved here without
//! post-filtering by the caller. This is also the default cache store for
//! the pipeline wrappers.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use mnemo_expr::{codec, Expression, Row, Value};

use crate::error::{conflict, ConflictMode, Error, Warnings};
use crate::model::UnitClass;
use crate::sequencer::{MonotonicSequencer, Sequencer};
use crate::unit::Unit;

use super::{Join, Options, StorageBackend};

#[derive(Default)]
struct ClassStore {
    rows: HashMap<Vec<u8>, Row>,
}

/// A storage backend that keeps all data in memory.
pub struct MemoryBackend {
    classes: DashMap<String, Arc<UnitClass>>,
    stores: DashMap<String, Arc<Mutex<ClassStore>>>,
    seq: Box<dyn Sequencer>,
}

impl MemoryBackend {
    /// Create a backend. No configuration keys are recognized; the options
    /// argument exists for constructor uniformity across backends.
    pub fn new(_options: &Options) -> Self {
        Self {
            classes: DashMap::new(),
            stores: DashMap::new(),
            seq: Box::new(MonotonicSequencer),
        }
    }

    /// Replace the identity sequencer.
    pub fn with_sequencer(mut self, seq: impl Sequencer + 'static) -> Self {
        self.seq = Box::new(seq);
        self
    }

    /// Number of stored rows for a class (0 when storage is missing).
    pub fn row_count(&self, class: &str) -> usize {
        self.stores
            .get(class)
            .map(|store| store.lock().rows.len())
            .unwrap_or(0)
    }

    fn class_def(&self, class: &str) -> Result<Arc<UnitClass>, Error> {
        self.classes
            .get(class)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::UnknownClass(class.to_owned()))
    }

    fn store(&self, class: &str) -> Result<Arc<Mutex<ClassStore>>, Error> {
        self.stores
            .get(class)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::Mapping(format!("{class}: no storage found")))
    }

    fn row_key(unit: &Unit) -> Vec<u8> {
        if unit.class().has_identifiers() {
            unit.identity_key()
        } else {
            codec::encode_row(&unit.row())
        }
    }
}

impl StorageBackend for MemoryBackend {
    fn register(&self, class: &Arc<UnitClass>) -> Result<(), Error> {
        self.classes.insert(class.name().to_owned(), class.clone());
        Ok(())
    }

    fn is_registered(&self, class: &str) -> bool {
        self.classes.contains_key(class)
    }

    fn reserve(&self, unit: &mut Unit) -> Result<(), Error> {
        let class = unit.class().clone();
        if !class.has_identifiers() {
            // Nothing to allocate; the row is written at save time.
            return Ok(());
        }
        let store = self.store(class.name())?;
        // The store lock doubles as the per-class reserve lock, so identity
        // allocation is mutually exclusive per class.
        let mut guard = store.lock();
        if !self.seq.valid(&unit.identity()) {
            let existing = guard
                .rows
                .keys()
                .map(|key| codec::decode_values(key))
                .collect::<Result<Vec<_>, _>>()?;
            let identity = self.seq.assign(&class, &existing)?;
            for (field, value) in class.identifiers().iter().zip(identity) {
                unit.set_raw(field, value)?;
            }
        }
        unit.cleanse();
        guard.rows.insert(unit.identity_key(), unit.row());
        debug!(class = class.name(), "reserve");
        Ok(())
    }

    fn save(&self, unit: &mut Unit, force: bool) -> Result<(), Error> {
        if !force && !unit.dirty() {
            return Ok(());
        }
        let class = unit.class().clone();
        if class.has_identifiers() && !unit.has_identity() {
            return Err(Error::MissingIdentity(class.name().to_owned()));
        }
        let store = self.store(class.name())?;
        let mut guard = store.lock();
        debug!(
            class = class.name(),
            state = &unit.fingerprint_hex()[..12],
            "save"
        );
        guard.rows.insert(Self::row_key(unit), unit.row());
        unit.cleanse();
        Ok(())
    }

    fn destroy(&self, class: &str, identity: &[Value]) -> Result<(), Error> {
        let store = self.store(class)?;
        let mut guard = store.lock();
        guard.rows.remove(&codec::encode_values(identity));
        debug!(class, "destroy");
        Ok(())
    }

    fn recall(&self, class: &str, expr: Option<&Expression>) -> Result<Vec<Row>, Error> {
        let store = self.store(class)?;
        let guard = store.lock();
        debug!(class, filtered = expr.is_some(), "recall");
        let mut matches = Vec::new();
        for row in guard.rows.values() {
            let keep = match expr {
                Some(expr) => expr.matches(row)?,
                None => true,
            };
            if keep {
                matches.push(row.clone());
            }
        }
        Ok(matches)
    }

    fn distinct(
        &self,
        class: &str,
        fields: &[String],
        expr: Option<&Expression>,
    ) -> Result<Vec<Vec<Value>>, Error> {
        let rows = self.recall(class, expr)?;
        Ok(super::distinct_projection(rows, fields))
    }

    fn multirecall(
        &self,
        join: &Join,
        expr: Option<&Expression>,
    ) -> Result<Vec<Vec<Row>>, Error> {
        super::combine(|class| self.recall(class, None), join, expr)
    }

    fn create_storage(&self, class: &str, conflicts: ConflictMode) -> Result<Warnings, Error> {
        let mut warnings = Warnings::new();
        self.class_def(class)?;
        debug!(class, "create storage");
        if self.stores.contains_key(class) {
            match conflicts {
                // Existing storage already matches the model.
                ConflictMode::Repair | ConflictMode::Ignore => {}
                mode => conflict(mode, &mut warnings, class, "storage already exists")?,
            }
            return Ok(warnings);
        }
        self.stores
            .insert(class.to_owned(), Arc::new(Mutex::new(ClassStore::default())));
        Ok(warnings)
    }

    fn has_storage(&self, class: &str) -> bool {
        self.stores.contains_key(class)
    }

    fn drop_storage(&self, class: &str, conflicts: ConflictMode) -> Result<Warnings, Error> {
        let mut warnings = Warnings::new();
        debug!(class, "drop storage");
        if self.stores.remove(class).is_none() {
            match conflicts {
                ConflictMode::Repair | ConflictMode::Ignore => {}
                mode => conflict(mode, &mut warnings, class, "no storage to drop")?,
            }
        }
        Ok(warnings)
    }

    fn add_property(
        &self,
        class: &str,
        name: &str,
        conflicts: ConflictMode,
    ) -> Result<Warnings, Error> {
        let mut warnings = Warnings::new();
        debug!(class, property = name, "add property");
        let store = match self.stores.get(class) {
            Some(entry) => entry.value().clone(),
            None => {
                conflict(conflicts, &mut warnings, class, "no storage found")?;
                return Ok(warnings);
            }
        };
        let mut guard = store.lock();
        for row in guard.rows.values_mut() {
            if codec::get_field(row, name).is_none() {
                row.push((name.to_owned(), Value::Null));
            }
        }
        Ok(warnings)
    }

    fn has_property(&self, class: &str, name: &str) -> Result<bool, Error> {
        let store = self.store(class)?;
        let guard = store.lock();
        // An empty store has nothing to declare unprepared.
        Ok(match guard.rows.values().next() {
            Some(row) => codec::get_field(row, name).is_some(),
            None => true,
        })
    }

    fn drop_property(
        &self,
        class: &str,
        name: &str,
        conflicts: ConflictMode,
    ) -> Result<Warnings, Error> {
        let mut warnings = Warnings::new();
        debug!(class, property = name, "drop property");
        let store = match self.stores.get(class) {
            Some(entry) => entry.value().clone(),
            None => {
                conflict(conflicts, &mut warnings, class, "no storage found")?;
                return Ok(warnings);
            }
        };
        let mut guard = store.lock();
        for row in guard.rows.values_mut() {
            row.retain(|(field, _)| field != name);
        }
        Ok(warnings)
    }

    fn rename_property(
        &self,
        class: &str,
        old: &str,
        new: &str,
        conflicts: ConflictMode,
    ) -> Result<Warnings, Error> {
        let mut warnings = Warnings::new();
        debug!(class, from = old, to = new, "rename property");
        let store = match self.stores.get(class) {
            Some(entry) => entry.value().clone(),
            None => {
                conflict(conflicts, &mut warnings, class, "no storage found")?;
                return Ok(warnings);
            }
        };
        let mut guard = store.lock();
        for row in guard.rows.values_mut() {
            for (field, _) in row.iter_mut() {
                if field == old {
                    *field = new.to_owned();
                }
            }
        }
        Ok(warnings)
    }

    fn shutdown(&self) -> Result<(), Error> {
        self.stores.clear();
        self.classes.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldDef, PropertyType};
    use mnemo_expr::field;

    fn animal_class() -> Arc<UnitClass> {
        UnitClass::builder("Animal")
            .field(FieldDef::new("id", PropertyType::Int))
            .field(FieldDef::new("name", PropertyType::Str))
            .field(FieldDef::new("legs", PropertyType::Int))
            .identifiers(["id"])
            .build()
            .unwrap()
    }

    fn backend_with_animals() -> (MemoryBackend, Arc<UnitClass>) {
        let backend = MemoryBackend::new(&Options::new());
        let class = animal_class();
        backend.register(&class).unwrap();
        backend
            .create_storage("Animal", ConflictMode::Error)
            .unwrap();
        (backend, class)
    }

    fn put(backend: &MemoryBackend, class: &Arc<UnitClass>, name: &str, legs: i64) -> Unit {
        let mut unit = Unit::new(class.clone());
        unit.set("name", name).unwrap();
        unit.set("legs", legs).unwrap();
        backend.reserve(&mut unit).unwrap();
        backend.save(&mut unit, false).unwrap();
        unit
    }

    #[test]
    fn test_reserve_allocates_monotonic_ids() {
        let (backend, class) = backend_with_animals();
        let a = put(&backend, &class, "emu", 2);
        let b = put(&backend, &class, "cat", 4);
        assert_eq!(a.get("id").unwrap(), Value::Int(1));
        assert_eq!(b.get("id").unwrap(), Value::Int(2));
    }

    #[test]
    fn test_recall_filters_exactly() {
        let (backend, class) = backend_with_animals();
        put(&backend, &class, "emu", 2);
        put(&backend, &class, "cat", 4);
        put(&backend, &class, "dog", 4);

        let rows = backend
            .recall("Animal", Some(&field("legs").eq(4).expr()))
            .unwrap();
        assert_eq!(rows.len(), 2);

        let all = backend.recall("Animal", None).unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_save_persists_dirty_changes() {
        let (backend, class) = backend_with_animals();
        let mut unit = put(&backend, &class, "emu", 2);
        assert!(!unit.dirty());

        // Mutate the stored copy out from under a clean save.
        unit.set("legs", 3i64).unwrap();
        backend.save(&mut unit, false).unwrap();
        assert!(!unit.dirty());

        let rows = backend
            .recall("Animal", Some(&field("legs").eq(3).expr()))
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let (backend, class) = backend_with_animals();
        let unit = put(&backend, &class, "emu", 2);
        let identity = unit.identity();

        backend.destroy("Animal", &identity).unwrap();
        assert_eq!(backend.row_count("Animal"), 0);
        backend.destroy("Animal", &identity).unwrap();
    }

    #[test]
    fn test_distinct_bypasses_duplicates() {
        let (backend, class) = backend_with_animals();
        put(&backend, &class, "emu", 2);
        put(&backend, &class, "cat", 4);
        put(&backend, &class, "dog", 4);

        let legs = backend
            .distinct("Animal", &["legs".to_owned()], None)
            .unwrap();
        assert_eq!(legs.len(), 2);
    }

    #[test]
    fn test_property_ddl_rewrites_rows() {
        let (backend, class) = backend_with_animals();
        put(&backend, &class, "emu", 2);

        backend
            .add_property("Animal", "wings", ConflictMode::Error)
            .unwrap();
        assert!(backend.has_property("Animal", "wings").unwrap());

        backend
            .rename_property("Animal", "wings", "fins", ConflictMode::Error)
            .unwrap();
        assert!(!backend.has_property("Animal", "wings").unwrap());
        assert!(backend.has_property("Animal", "fins").unwrap());

        backend
            .drop_property("Animal", "fins", ConflictMode::Error)
            .unwrap();
        assert!(!backend.has_property("Animal", "fins").unwrap());
    }

    #[test]
    fn test_conflict_modes_on_ddl() {
        let (backend, _class) = backend_with_animals();

        assert!(backend
            .create_storage("Animal", ConflictMode::Error)
            .is_err());
        let warnings = backend
            .create_storage("Animal", ConflictMode::Warn)
            .unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(backend
            .create_storage("Animal", ConflictMode::Repair)
            .unwrap()
            .is_empty());

        assert!(backend
            .add_property("Ghost", "x", ConflictMode::Error)
            .is_err());
        assert!(backend
            .add_property("Ghost", "x", ConflictMode::Ignore)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_map_repairs_missing_schema() {
        let backend = MemoryBackend::new(&Options::new());
        let class = animal_class();
        backend.register(&class).unwrap();

        assert!(backend
            .map(std::slice::from_ref(&class), ConflictMode::Error)
            .is_err());
        let warnings = backend
            .map(std::slice::from_ref(&class), ConflictMode::Warn)
            .unwrap();
        assert_eq!(warnings.len(), 1);

        backend
            .map(std::slice::from_ref(&class), ConflictMode::Repair)
            .unwrap();
        assert!(backend.has_storage("Animal"));
        assert!(backend
            .map(std::slice::from_ref(&class), ConflictMode::Error)
            .unwrap()
            .is_empty());
    }
}
