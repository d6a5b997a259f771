//! Full-preload ("burned") object cache.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use mnemo_expr::{Expression, Row, Value};

use crate::error::{ConflictMode, Error, Warnings};
use crate::model::UnitClass;
use crate::storage::{Join, Options, StorageBackend};
use crate::unit::Unit;

use super::cache::ObjectCache;

/// An object cache that pulls *all* rows of a class from the next store on
/// first access, then serves that class from the cache alone.
///
/// Writes still propagate to the next store; destroys invalidate the cached
/// copy. Dropping storage for a class resets its preload, so the next
/// recall refills. Not suitable over lossy cache stores — the preload
/// contract depends on the cache holding the complete class.
pub struct BurnedCache {
    layer: ObjectCache,
    preloaded: Mutex<HashSet<String>>,
}

impl BurnedCache {
    /// Wrap `next` with a fresh in-memory cache store.
    pub fn new(next: Arc<dyn StorageBackend>, options: &Options) -> Self {
        Self {
            layer: ObjectCache::new(next, options),
            preloaded: Mutex::new(HashSet::new()),
        }
    }

    /// Wrap `next` with an explicit cache store.
    pub fn with_cache(
        next: Arc<dyn StorageBackend>,
        cache: Arc<dyn StorageBackend>,
        options: &Options,
    ) -> Self {
        Self {
            layer: ObjectCache::with_cache(next, cache, options),
            preloaded: Mutex::new(HashSet::new()),
        }
    }

    fn ensure_preloaded(&self, class: &str) -> Result<(), Error> {
        let mut preloaded = self.preloaded.lock();
        if preloaded.contains(class) {
            return Ok(());
        }
        let def = self.layer.class_def(class)?;
        // No expression here: the point is to pull the complete class.
        let rows = self.layer.next_backend().recall(class, None)?;
        debug!(class, rows = rows.len(), "preload");
        for row in &rows {
            let mut unit = Unit::from_row(def.clone(), row);
            self.layer.cache_backend().save(&mut unit, true)?;
        }
        preloaded.insert(class.to_owned());
        Ok(())
    }
}

impl StorageBackend for BurnedCache {
    fn register(&self, class: &Arc<UnitClass>) -> Result<(), Error> {
        self.layer.register(class)
    }

    fn is_registered(&self, class: &str) -> bool {
        self.layer.is_registered(class)
    }

    fn reserve(&self, unit: &mut Unit) -> Result<(), Error> {
        self.layer.reserve(unit)
    }

    fn save(&self, unit: &mut Unit, force: bool) -> Result<(), Error> {
        self.layer.save(unit, force)
    }

    fn destroy(&self, class: &str, identity: &[Value]) -> Result<(), Error> {
        self.layer.destroy(class, identity)
    }

    fn recall(&self, class: &str, expr: Option<&Expression>) -> Result<Vec<Row>, Error> {
        if !self.layer.is_cached(class) {
            return self.layer.next_backend().recall(class, expr);
        }
        self.ensure_preloaded(class)?;
        self.layer.cache_backend().recall(class, expr)
    }

    fn distinct(
        &self,
        class: &str,
        fields: &[String],
        expr: Option<&Expression>,
    ) -> Result<Vec<Vec<Value>>, Error> {
        self.layer.distinct(class, fields, expr)
    }

    fn multirecall(
        &self,
        join: &Join,
        expr: Option<&Expression>,
    ) -> Result<Vec<Vec<Row>>, Error> {
        self.layer.multirecall(join, expr)
    }

    fn create_storage(&self, class: &str, conflicts: ConflictMode) -> Result<Warnings, Error> {
        self.layer.create_storage(class, conflicts)
    }

    fn has_storage(&self, class: &str) -> bool {
        self.layer.has_storage(class)
    }

    fn drop_storage(&self, class: &str, conflicts: ConflictMode) -> Result<Warnings, Error> {
        self.preloaded.lock().remove(class);
        self.layer.drop_storage(class, conflicts)
    }

    fn add_property(
        &self,
        class: &str,
        name: &str,
        conflicts: ConflictMode,
    ) -> Result<Warnings, Error> {
        self.layer.add_property(class, name, conflicts)
    }

    fn has_property(&self, class: &str, name: &str) -> Result<bool, Error> {
        self.layer.has_property(class, name)
    }

    fn drop_property(
        &self,
        class: &str,
        name: &str,
        conflicts: ConflictMode,
    ) -> Result<Warnings, Error> {
        self.layer.drop_property(class, name, conflicts)
    }

    fn rename_property(
        &self,
        class: &str,
        old: &str,
        new: &str,
        conflicts: ConflictMode,
    ) -> Result<Warnings, Error> {
        self.layer.rename_property(class, old, new, conflicts)
    }

    fn shutdown(&self) -> Result<(), Error> {
        self.layer.shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldDef, PropertyType};
    use crate::storage::MemoryBackend;
    use mnemo_expr::field;

    fn setup() -> (Arc<MemoryBackend>, BurnedCache, Arc<UnitClass>) {
        let terminal = Arc::new(MemoryBackend::new(&Options::new()));
        let cache = BurnedCache::new(terminal.clone(), &Options::new());
        let class = UnitClass::builder("Animal")
            .field(FieldDef::new("id", PropertyType::Int))
            .field(FieldDef::new("name", PropertyType::Str))
            .identifiers(["id"])
            .build()
            .unwrap();
        cache.register(&class).unwrap();
        cache.create_storage("Animal", ConflictMode::Error).unwrap();
        (terminal, cache, class)
    }

    fn seed(terminal: &MemoryBackend, class: &Arc<UnitClass>, names: &[&str]) {
        for name in names {
            let mut unit = Unit::new(class.clone());
            unit.set("name", *name).unwrap();
            terminal.reserve(&mut unit).unwrap();
        }
    }

    #[test]
    fn test_first_recall_preloads_everything() {
        let (terminal, cache, class) = setup();
        seed(&terminal, &class, &["emu", "cat", "dog"]);

        // A filtered first recall still pulls the whole class.
        let rows = cache
            .recall("Animal", Some(&field("name").eq("cat").expr()))
            .unwrap();
        assert_eq!(rows.len(), 1);

        // Empty the terminal store: everything is served from the cache.
        for id in 1..=3i64 {
            terminal.destroy("Animal", &[Value::Int(id)]).unwrap();
        }
        let rows = cache.recall("Animal", None).unwrap();
        assert_eq!(rows.len(), 3);
    }

    #[test]
    fn test_writes_propagate_while_burned() {
        let (terminal, cache, class) = setup();
        seed(&terminal, &class, &["emu"]);
        cache.recall("Animal", None).unwrap();

        let mut unit = Unit::new(class);
        unit.set("name", "cat").unwrap();
        cache.reserve(&mut unit).unwrap();
        cache.save(&mut unit, false).unwrap();

        assert_eq!(terminal.row_count("Animal"), 2);
        assert_eq!(cache.recall("Animal", None).unwrap().len(), 2);
    }

    #[test]
    fn test_drop_storage_resets_preload() {
        let (terminal, cache, class) = setup();
        seed(&terminal, &class, &["emu"]);
        cache.recall("Animal", None).unwrap();

        cache.drop_storage("Animal", ConflictMode::Error).unwrap();
        cache.create_storage("Animal", ConflictMode::Error).unwrap();
        seed(&terminal, &class, &["cat", "dog"]);

        let rows = cache.recall("Animal", None).unwrap();
        assert_eq!(rows.len(), 2);
    }
}
