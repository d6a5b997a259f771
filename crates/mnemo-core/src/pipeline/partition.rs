//! Vertical partitioning across named backends.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

use mnemo_expr::{Expression, Row, Value};

use crate::error::{ConflictMode, Error, Warnings};
use crate::model::UnitClass;
use crate::storage::{Join, StorageBackend};
use crate::unit::Unit;

/// A mediator that routes each class to its own backend(s).
///
/// The partitioner has no storage of its own. Schema operations fan out to
/// every backend mapped for a class; data operations route to the first
/// mapped backend. Joins need one backend that covers every involved class
/// — resolved through the per-join override table first, then by
/// intersecting the class mappings — and fail with `UnsupportedJoinError`
/// when none exists.
#[derive(Default)]
pub struct VerticalPartitioner {
    stores: RwLock<BTreeMap<String, Arc<dyn StorageBackend>>>,
    /// class -> store names, primary first.
    classmap: RwLock<HashMap<String, Vec<String>>>,
    /// Explicit store choice for an exact ordered class sequence.
    join_routes: RwLock<HashMap<Vec<String>, String>>,
    classes: DashMap<String, Arc<UnitClass>>,
}

impl VerticalPartitioner {
    /// Create an empty partitioner.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a named backend to mediate.
    pub fn add_store(&self, name: impl Into<String>, store: Arc<dyn StorageBackend>) {
        self.stores.write().insert(name.into(), store);
    }

    /// Remove a named backend, dissolving every class mapping that used it.
    pub fn remove_store(&self, name: &str) {
        self.stores.write().remove(name);
        let mut classmap = self.classmap.write();
        classmap.retain(|class, stores| {
            stores.retain(|store| store != name);
            if stores.is_empty() {
                self.classes.remove(class);
                false
            } else {
                true
            }
        });
    }

    /// Map a class to a named store. The newest assignment becomes the
    /// primary (data operations route to it).
    pub fn assign(&self, class: &str, store: &str) -> Result<(), Error> {
        if !self.stores.read().contains_key(store) {
            return Err(Error::Mapping(format!("no store named `{store}`")));
        }
        let mut classmap = self.classmap.write();
        let stores = classmap.entry(class.to_owned()).or_default();
        if !stores.iter().any(|s| s == store) {
            stores.insert(0, store.to_owned());
        }
        Ok(())
    }

    /// Route an exact ordered join to a named store, overriding the
    /// covering-store search.
    pub fn route_join(
        &self,
        classes: impl IntoIterator<Item = impl Into<String>>,
        store: &str,
    ) -> Result<(), Error> {
        if !self.stores.read().contains_key(store) {
            return Err(Error::Mapping(format!("no store named `{store}`")));
        }
        self.join_routes
            .write()
            .insert(classes.into_iter().map(Into::into).collect(), store.to_owned());
        Ok(())
    }

    fn store_named(&self, name: &str) -> Result<Arc<dyn StorageBackend>, Error> {
        self.stores
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Mapping(format!("no store named `{name}`")))
    }

    fn store_names_for(&self, class: &str) -> Result<Vec<String>, Error> {
        self.classmap
            .read()
            .get(class)
            .cloned()
            .ok_or_else(|| Error::Mapping(format!("class `{class}` is not assigned to any store")))
    }

    fn stores_for(&self, class: &str) -> Result<Vec<Arc<dyn StorageBackend>>, Error> {
        self.store_names_for(class)?
            .iter()
            .map(|name| self.store_named(name))
            .collect()
    }

    fn primary(&self, class: &str) -> Result<Arc<dyn StorageBackend>, Error> {
        let names = self.store_names_for(class)?;
        self.store_named(&names[0])
    }

    /// The single store that can answer a join over `classes`.
    fn single_store(&self, classes: &[String]) -> Result<Arc<dyn StorageBackend>, Error> {
        if let Some(name) = self.join_routes.read().get(classes) {
            return self.store_named(name);
        }
        let mut covering = self.store_names_for(&classes[0])?;
        for class in &classes[1..] {
            let names = self.store_names_for(class)?;
            covering.retain(|name| names.contains(name));
        }
        match covering.first() {
            Some(name) => self.store_named(name),
            None => Err(Error::UnsupportedJoin(classes.to_vec())),
        }
    }

    /// Move all rows of the given classes to another store.
    ///
    /// Copies every row into `to`; unless `copy_only`, the rows are removed
    /// from the old stores and the class is remapped to `to` alone.
    pub fn migrate(&self, classes: &[&str], to: &str, copy_only: bool) -> Result<(), Error> {
        let target = self.store_named(to)?;
        for class in classes {
            let def = self
                .classes
                .get(*class)
                .map(|entry| entry.value().clone())
                .ok_or_else(|| Error::UnknownClass((*class).to_owned()))?;
            target.register(&def)?;
            if !target.has_storage(class) {
                target.create_storage(class, ConflictMode::Repair)?;
            }

            let rows = self.recall(class, None)?;
            debug!(class, rows = rows.len(), to, "migrate");
            for row in &rows {
                let mut unit = Unit::from_row(def.clone(), row);
                target.save(&mut unit, true)?;
            }

            if !copy_only {
                for store in self.stores_for(class)? {
                    for row in &rows {
                        let unit = Unit::from_row(def.clone(), row);
                        store.destroy(class, &unit.identity())?;
                    }
                }
                self.classmap
                    .write()
                    .insert((*class).to_owned(), vec![to.to_owned()]);
            }
        }
        Ok(())
    }
}

impl StorageBackend for VerticalPartitioner {
    fn register(&self, class: &Arc<UnitClass>) -> Result<(), Error> {
        // The class -> store mapping is built before registration.
        for store in self.stores_for(class.name())? {
            store.register(class)?;
        }
        self.classes.insert(class.name().to_owned(), class.clone());
        Ok(())
    }

    fn is_registered(&self, class: &str) -> bool {
        self.classes.contains_key(class)
    }

    fn reserve(&self, unit: &mut Unit) -> Result<(), Error> {
        self.primary(unit.class().name())?.reserve(unit)
    }

    fn save(&self, unit: &mut Unit, force: bool) -> Result<(), Error> {
        self.primary(unit.class().name())?.save(unit, force)
    }

    fn destroy(&self, class: &str, identity: &[Value]) -> Result<(), Error> {
        self.primary(class)?.destroy(class, identity)
    }

    fn recall(&self, class: &str, expr: Option<&Expression>) -> Result<Vec<Row>, Error> {
        self.primary(class)?.recall(class, expr)
    }

    fn distinct(
        &self,
        class: &str,
        fields: &[String],
        expr: Option<&Expression>,
    ) -> Result<Vec<Vec<Value>>, Error> {
        self.primary(class)?.distinct(class, fields, expr)
    }

    fn multirecall(
        &self,
        join: &Join,
        expr: Option<&Expression>,
    ) -> Result<Vec<Vec<Row>>, Error> {
        self.single_store(&join.classes)?.multirecall(join, expr)
    }

    fn create_storage(&self, class: &str, conflicts: ConflictMode) -> Result<Warnings, Error> {
        let mut warnings = Warnings::new();
        for store in self.stores_for(class)? {
            warnings.extend(store.create_storage(class, conflicts)?);
        }
        Ok(warnings)
    }

    fn has_storage(&self, class: &str) -> bool {
        match self.stores_for(class) {
            Ok(stores) => !stores.is_empty() && stores.iter().all(|s| s.has_storage(class)),
            Err(_) => false,
        }
    }

    fn drop_storage(&self, class: &str, conflicts: ConflictMode) -> Result<Warnings, Error> {
        let mut warnings = Warnings::new();
        for store in self.stores_for(class)? {
            warnings.extend(store.drop_storage(class, conflicts)?);
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
        for store in self.stores_for(class)? {
            warnings.extend(store.add_property(class, name, conflicts)?);
        }
        Ok(warnings)
    }

    fn has_property(&self, class: &str, name: &str) -> Result<bool, Error> {
        for store in self.stores_for(class)? {
            if !store.has_property(class, name)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn drop_property(
        &self,
        class: &str,
        name: &str,
        conflicts: ConflictMode,
    ) -> Result<Warnings, Error> {
        let mut warnings = Warnings::new();
        for store in self.stores_for(class)? {
            warnings.extend(store.drop_property(class, name, conflicts)?);
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
        for store in self.stores_for(class)? {
            warnings.extend(store.rename_property(class, old, new, conflicts)?);
        }
        Ok(warnings)
    }

    fn shutdown(&self) -> Result<(), Error> {
        for store in self.stores.read().values() {
            store.shutdown()?;
        }
        Ok(())
    }
}
