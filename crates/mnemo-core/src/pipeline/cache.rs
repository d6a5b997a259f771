//! Pass-through object cache.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use mnemo_expr::{codec, Expression, Row, Value};

use crate::error::{ConflictMode, Error, Warnings};
use crate::model::UnitClass;
use crate::storage::{Join, MemoryBackend, Options, StorageBackend};
use crate::unit::Unit;

/// A wrapping backend that keeps recalled units in a cache store.
///
/// Recall, reserve, and save place rows in the cache; destroy invalidates
/// them. Cached rows perfectly reflect the next store because every write
/// goes through to both. Classes without identifiers are never cached.
///
/// Options:
/// - `fullquery`: when set, general recalls are answered from the cache
///   first and merged with the next store's rows. Off by default; identity
///   probes always consult the cache.
pub struct ObjectCache {
    next: Arc<dyn StorageBackend>,
    cache: Arc<dyn StorageBackend>,
    fullquery: bool,
    classes: DashMap<String, Arc<UnitClass>>,
}

impl ObjectCache {
    /// Wrap `next` with a fresh in-memory cache store.
    pub fn new(next: Arc<dyn StorageBackend>, options: &Options) -> Self {
        Self::with_cache(next, Arc::new(MemoryBackend::new(options)), options)
    }

    /// Wrap `next` with an explicit cache store.
    pub fn with_cache(
        next: Arc<dyn StorageBackend>,
        cache: Arc<dyn StorageBackend>,
        options: &Options,
    ) -> Self {
        Self {
            next,
            cache,
            fullquery: options.get_bool("fullquery").unwrap_or(false),
            classes: DashMap::new(),
        }
    }

    /// The wrapped backend.
    pub fn next_backend(&self) -> &Arc<dyn StorageBackend> {
        &self.next
    }

    /// The cache store.
    pub fn cache_backend(&self) -> &Arc<dyn StorageBackend> {
        &self.cache
    }

    /// Whether rows of this class are cached.
    pub fn is_cached(&self, class: &str) -> bool {
        self.classes
            .get(class)
            .map(|entry| entry.value().has_identifiers())
            .unwrap_or(false)
            && self.cache.is_registered(class)
    }

    /// Names of every cached class.
    pub fn cached_classes(&self) -> Vec<String> {
        self.classes
            .iter()
            .filter(|entry| entry.value().has_identifiers())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// The registered definition for a class.
    pub fn class_def(&self, class: &str) -> Result<Arc<UnitClass>, Error> {
        self.classes
            .get(class)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::UnknownClass(class.to_owned()))
    }

    /// Drop a row from the cache store only.
    pub fn invalidate(&self, class: &str, identity: &[Value]) -> Result<(), Error> {
        if self.is_cached(class) {
            self.cache.destroy(class, identity)?;
        }
        Ok(())
    }

    fn populate(&self, def: &Arc<UnitClass>, rows: &[Row]) -> Result<(), Error> {
        for row in rows {
            let mut unit = Unit::from_row(def.clone(), row);
            self.cache.save(&mut unit, true)?;
        }
        Ok(())
    }

    fn row_key(def: &UnitClass, row: &Row) -> Vec<u8> {
        let identity: Vec<Value> = def
            .identifiers()
            .iter()
            .map(|id| codec::get_field(row, id).cloned().unwrap_or(Value::Null))
            .collect();
        codec::encode_values(&identity)
    }
}

impl StorageBackend for ObjectCache {
    fn register(&self, class: &Arc<UnitClass>) -> Result<(), Error> {
        self.next.register(class)?;
        self.classes.insert(class.name().to_owned(), class.clone());
        if class.has_identifiers() {
            self.cache.register(class)?;
            // The cache store's schema exists as soon as the class does.
            self.cache.create_storage(class.name(), ConflictMode::Ignore)?;
        }
        Ok(())
    }

    fn is_registered(&self, class: &str) -> bool {
        self.next.is_registered(class)
    }

    fn reserve(&self, unit: &mut Unit) -> Result<(), Error> {
        // The next store allocates identity values.
        self.next.reserve(unit)?;
        if self.is_cached(unit.class().name()) && !unit.dirty() {
            self.cache.save(unit, true)?;
        }
        Ok(())
    }

    fn save(&self, unit: &mut Unit, force: bool) -> Result<(), Error> {
        let class = unit.class().name().to_owned();
        if !self.is_cached(&class) {
            return self.next.save(unit, force);
        }
        // Decide before the next store cleanses the unit.
        let update_cache = force || unit.dirty();
        self.next.save(unit, force)?;
        if update_cache {
            self.cache.save(unit, true)?;
        }
        Ok(())
    }

    fn destroy(&self, class: &str, identity: &[Value]) -> Result<(), Error> {
        self.next.destroy(class, identity)?;
        self.invalidate(class, identity)
    }

    fn recall(&self, class: &str, expr: Option<&Expression>) -> Result<Vec<Row>, Error> {
        if !self.is_cached(class) {
            return self.next.recall(class, expr);
        }
        let def = self.class_def(class)?;

        // Identity probes are answered from the cache when resident.
        if let Some(expr) = expr {
            if expr.as_identity_probe(def.identifiers()).is_some() {
                let hits = self.cache.recall(class, Some(expr))?;
                if !hits.is_empty() {
                    debug!(class, "cache hit");
                    return Ok(hits);
                }
                let rows = self.next.recall(class, Some(expr))?;
                self.populate(&def, &rows)?;
                return Ok(rows);
            }
        }

        if self.fullquery {
            let mut rows = self.cache.recall(class, expr)?;
            let mut seen: HashSet<Vec<u8>> = rows
                .iter()
                .map(|row| Self::row_key(&def, row))
                .collect();
            for row in self.next.recall(class, expr)? {
                if seen.insert(Self::row_key(&def, &row)) {
                    self.populate(&def, std::slice::from_ref(&row))?;
                    rows.push(row);
                }
            }
            Ok(rows)
        } else {
            let rows = self.next.recall(class, expr)?;
            self.populate(&def, &rows)?;
            Ok(rows)
        }
    }

    fn distinct(
        &self,
        class: &str,
        fields: &[String],
        expr: Option<&Expression>,
    ) -> Result<Vec<Vec<Value>>, Error> {
        self.next.distinct(class, fields, expr)
    }

    fn multirecall(
        &self,
        join: &Join,
        expr: Option<&Expression>,
    ) -> Result<Vec<Vec<Row>>, Error> {
        // Joins skip the cache on the read side but still feed it.
        let tuples = self.next.multirecall(join, expr)?;
        let mut seen: Vec<HashSet<Vec<u8>>> = join.classes.iter().map(|_| HashSet::new()).collect();
        for tuple in &tuples {
            for (i, class) in join.classes.iter().enumerate() {
                if !self.is_cached(class) {
                    continue;
                }
                let def = self.class_def(class)?;
                let key = Self::row_key(&def, &tuple[i]);
                if seen[i].insert(key) {
                    self.populate(&def, std::slice::from_ref(&tuple[i]))?;
                }
            }
        }
        Ok(tuples)
    }

    fn create_storage(&self, class: &str, conflicts: ConflictMode) -> Result<Warnings, Error> {
        let warnings = self.next.create_storage(class, conflicts)?;
        if self.is_cached(class) {
            self.cache.create_storage(class, ConflictMode::Ignore)?;
        }
        Ok(warnings)
    }

    fn has_storage(&self, class: &str) -> bool {
        self.next.has_storage(class)
    }

    fn drop_storage(&self, class: &str, conflicts: ConflictMode) -> Result<Warnings, Error> {
        let warnings = self.next.drop_storage(class, conflicts)?;
        if self.is_cached(class) {
            self.cache.drop_storage(class, ConflictMode::Ignore)?;
        }
        Ok(warnings)
    }

    fn add_property(
        &self,
        class: &str,
        name: &str,
        conflicts: ConflictMode,
    ) -> Result<Warnings, Error> {
        let warnings = self.next.add_property(class, name, conflicts)?;
        if self.is_cached(class) {
            self.cache.add_property(class, name, ConflictMode::Ignore)?;
        }
        Ok(warnings)
    }

    fn has_property(&self, class: &str, name: &str) -> Result<bool, Error> {
        self.next.has_property(class, name)
    }

    fn drop_property(
        &self,
        class: &str,
        name: &str,
        conflicts: ConflictMode,
    ) -> Result<Warnings, Error> {
        let warnings = self.next.drop_property(class, name, conflicts)?;
        if self.is_cached(class) {
            self.cache.drop_property(class, name, ConflictMode::Ignore)?;
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
        let warnings = self.next.rename_property(class, old, new, conflicts)?;
        if self.is_cached(class) {
            self.cache
                .rename_property(class, old, new, ConflictMode::Ignore)?;
        }
        Ok(warnings)
    }

    fn shutdown(&self) -> Result<(), Error> {
        self.cache.shutdown()?;
        self.next.shutdown()
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
            .identifiers(["id"])
            .build()
            .unwrap()
    }

    fn setup() -> (Arc<MemoryBackend>, ObjectCache, Arc<UnitClass>) {
        let terminal = Arc::new(MemoryBackend::new(&Options::new()));
        let cache = ObjectCache::new(terminal.clone(), &Options::new());
        let class = animal_class();
        cache.register(&class).unwrap();
        cache.create_storage("Animal", ConflictMode::Error).unwrap();
        (terminal, cache, class)
    }

    #[test]
    fn test_write_through() {
        let (terminal, cache, class) = setup();
        let mut unit = Unit::new(class);
        unit.set("name", "emu").unwrap();
        cache.reserve(&mut unit).unwrap();
        cache.save(&mut unit, false).unwrap();

        // The write is visible with the cache layer removed.
        let rows = terminal.recall("Animal", None).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_identity_probe_served_from_cache() {
        let (terminal, cache, class) = setup();
        let mut unit = Unit::new(class);
        unit.set("name", "emu").unwrap();
        cache.reserve(&mut unit).unwrap();

        let probe = field("id").eq(1).expr();
        // Remove the row from the terminal store; the cache still has it.
        terminal.destroy("Animal", &[Value::Int(1)]).unwrap();
        let rows = cache.recall("Animal", Some(&probe)).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_destroy_invalidates_cache() {
        let (_terminal, cache, class) = setup();
        let mut unit = Unit::new(class);
        unit.set("name", "emu").unwrap();
        cache.reserve(&mut unit).unwrap();
        cache.destroy("Animal", &[Value::Int(1)]).unwrap();

        let rows = cache
            .recall("Animal", Some(&field("id").eq(1).expr()))
            .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_general_recall_populates_cache() {
        let (terminal, cache, class) = setup();
        let mut unit = Unit::new(class.clone());
        unit.set("name", "emu").unwrap();
        // Write directly to the terminal store, bypassing the cache.
        terminal.reserve(&mut unit).unwrap();

        let rows = cache.recall("Animal", None).unwrap();
        assert_eq!(rows.len(), 1);

        // Now resident: identity probes no longer touch the terminal store.
        terminal.destroy("Animal", &[Value::Int(1)]).unwrap();
        let rows = cache
            .recall("Animal", Some(&field("id").eq(1).expr()))
            .unwrap();
        assert_eq!(rows.len(), 1);
    }
}
