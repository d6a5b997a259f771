//! Shared fixtures for the integration suites.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use mnemo_core::error::{ConflictMode, Error, Warnings};
use mnemo_core::expr::{Expression, Row, Value};
use mnemo_core::model::{Cardinality, FieldDef, PropertyType, Registry, UnitClass};
use mnemo_core::storage::{Join, StorageBackend};
use mnemo_core::unit::Unit;

/// A wrapping backend with test knobs: per-class recall counters, injected
/// save failures, and an "approximate" mode whose native filter evaluates
/// imperfect expressions in superset semantics (so callers must discard
/// over-matches themselves).
pub struct TestBackend {
    inner: Arc<dyn StorageBackend>,
    recalls: Mutex<HashMap<String, usize>>,
    pub fail_saves: AtomicBool,
    /// Hand every matching row back twice, simulating a store that violates
    /// the one-row-per-identity invariant.
    pub duplicate_rows: AtomicBool,
    approximate: bool,
}

impl TestBackend {
    pub fn new(inner: Arc<dyn StorageBackend>) -> Self {
        Self {
            inner,
            recalls: Mutex::new(HashMap::new()),
            fail_saves: AtomicBool::new(false),
            duplicate_rows: AtomicBool::new(false),
            approximate: false,
        }
    }

    /// A backend whose best-effort native filter over-matches imperfect
    /// expressions.
    pub fn approximate(inner: Arc<dyn StorageBackend>) -> Self {
        Self {
            approximate: true,
            ..Self::new(inner)
        }
    }

    pub fn recall_count(&self, class: &str) -> usize {
        self.recalls.lock().get(class).copied().unwrap_or(0)
    }
}

impl StorageBackend for TestBackend {
    fn register(&self, class: &Arc<UnitClass>) -> Result<(), Error> {
        self.inner.register(class)
    }

    fn is_registered(&self, class: &str) -> bool {
        self.inner.is_registered(class)
    }

    fn reserve(&self, unit: &mut Unit) -> Result<(), Error> {
        self.inner.reserve(unit)
    }

    fn save(&self, unit: &mut Unit, force: bool) -> Result<(), Error> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(Error::Mapping("injected save failure".into()));
        }
        self.inner.save(unit, force)
    }

    fn destroy(&self, class: &str, identity: &[Value]) -> Result<(), Error> {
        self.inner.destroy(class, identity)
    }

    fn recall(&self, class: &str, expr: Option<&Expression>) -> Result<Vec<Row>, Error> {
        *self.recalls.lock().entry(class.to_owned()).or_insert(0) += 1;
        let mut rows = match expr {
            Some(e) if self.approximate && !e.is_perfect() => {
                let mut rows = Vec::new();
                for row in self.inner.recall(class, None)? {
                    if e.approximate_row(&row)? {
                        rows.push(row);
                    }
                }
                rows
            }
            _ => self.inner.recall(class, expr)?,
        };
        if self.duplicate_rows.load(Ordering::SeqCst) {
            let copies = rows.clone();
            rows.extend(copies);
        }
        Ok(rows)
    }

    fn distinct(
        &self,
        class: &str,
        fields: &[String],
        expr: Option<&Expression>,
    ) -> Result<Vec<Vec<Value>>, Error> {
        self.inner.distinct(class, fields, expr)
    }

    fn multirecall(
        &self,
        join: &Join,
        expr: Option<&Expression>,
    ) -> Result<Vec<Vec<Row>>, Error> {
        self.inner.multirecall(join, expr)
    }

    fn create_storage(&self, class: &str, conflicts: ConflictMode) -> Result<Warnings, Error> {
        self.inner.create_storage(class, conflicts)
    }

    fn has_storage(&self, class: &str) -> bool {
        self.inner.has_storage(class)
    }

    fn drop_storage(&self, class: &str, conflicts: ConflictMode) -> Result<Warnings, Error> {
        self.inner.drop_storage(class, conflicts)
    }

    fn add_property(
        &self,
        class: &str,
        name: &str,
        conflicts: ConflictMode,
    ) -> Result<Warnings, Error> {
        self.inner.add_property(class, name, conflicts)
    }

    fn has_property(&self, class: &str, name: &str) -> Result<bool, Error> {
        self.inner.has_property(class, name)
    }

    fn drop_property(
        &self,
        class: &str,
        name: &str,
        conflicts: ConflictMode,
    ) -> Result<Warnings, Error> {
        self.inner.drop_property(class, name, conflicts)
    }

    fn rename_property(
        &self,
        class: &str,
        old: &str,
        new: &str,
        conflicts: ConflictMode,
    ) -> Result<Warnings, Error> {
        self.inner.rename_property(class, old, new, conflicts)
    }

    fn shutdown(&self) -> Result<(), Error> {
        self.inner.shutdown()
    }
}

/// The zoo schema: `Zoo 1..n Animal`, linked by `Animal.zoo_id -> Zoo.id`.
pub fn zoo_classes() -> (Arc<UnitClass>, Arc<UnitClass>) {
    let zoo = UnitClass::builder("Zoo")
        .field(FieldDef::new("id", PropertyType::Int))
        .field(FieldDef::new("name", PropertyType::Str).with_index())
        .field(FieldDef::new("founded", PropertyType::Date))
        .identifiers(["id"])
        .build()
        .unwrap();
    let animal = UnitClass::builder("Animal")
        .field(FieldDef::new("id", PropertyType::Int))
        .field(FieldDef::new("zoo_id", PropertyType::Int))
        .field(FieldDef::new("name", PropertyType::Str))
        .field(FieldDef::new("legs", PropertyType::Int).with_default(4i64))
        .field(FieldDef::new("weight", PropertyType::Float))
        .identifiers(["id"])
        .build()
        .unwrap();
    (zoo, animal)
}

/// Registry with the zoo schema and its association installed.
pub fn zoo_registry() -> Arc<Registry> {
    let registry = Registry::new();
    let (zoo, animal) = zoo_classes();
    registry.add_class(zoo).unwrap();
    registry.add_class(animal).unwrap();
    registry
        .associate("animals", "Zoo", "id", "Animal", "zoo_id", Cardinality::OneToMany)
        .unwrap();
    registry
}

/// Register every registry class on a backend and create its storage.
pub fn prepare(store: &dyn StorageBackend, registry: &Registry) {
    for class in registry.classes() {
        store.register(&class).unwrap();
        store
            .create_storage(class.name(), ConflictMode::Ignore)
            .unwrap();
    }
}
