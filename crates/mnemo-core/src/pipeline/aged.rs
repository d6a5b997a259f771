//! Time-expiring object cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use mnemo_expr::{codec, Expression, Row, Value};

use crate::error::{ConflictMode, Error, Warnings};
use crate::model::UnitClass;
use crate::storage::{Join, Options, StorageBackend};
use crate::unit::Unit;

use super::cache::ObjectCache;

/// An [`ObjectCache`] whose entries expire after a configured idle lifetime.
///
/// Every recall and reserve stamps the touched identities; `sweep` /
/// `sweep_all` evict entries idle longer than `lifetime_secs`. Sweeping is
/// driven externally — call it from a scheduler at whatever cadence suits
/// the deployment. Eviction takes the same per-identity guard as writes, so
/// a sweep never races destructively with an in-flight save or destroy for
/// the same identity.
///
/// Options (in addition to the [`ObjectCache`] ones):
/// - `lifetime_secs`: idle seconds before an entry is swept (default 300).
pub struct AgedCache {
    layer: ObjectCache,
    lifetime: Duration,
    /// class -> identity key -> last recall time.
    recall_times: DashMap<String, HashMap<Vec<u8>, Instant>>,
    /// (class, identity key) -> write/sweep guard.
    identity_locks: DashMap<(String, Vec<u8>), Arc<Mutex<()>>>,
}

impl AgedCache {
    /// Wrap `next` with a fresh in-memory cache store.
    pub fn new(next: Arc<dyn StorageBackend>, options: &Options) -> Self {
        Self::with_cache_layer(ObjectCache::new(next, options), options)
    }

    /// Wrap `next` with an explicit cache store.
    pub fn with_cache(
        next: Arc<dyn StorageBackend>,
        cache: Arc<dyn StorageBackend>,
        options: &Options,
    ) -> Self {
        Self::with_cache_layer(ObjectCache::with_cache(next, cache, options), options)
    }

    fn with_cache_layer(layer: ObjectCache, options: &Options) -> Self {
        let lifetime = options
            .get_f64("lifetime_secs")
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(Duration::from_secs_f64)
            .unwrap_or(Duration::from_secs(300));
        Self {
            layer,
            lifetime,
            recall_times: DashMap::new(),
            identity_locks: DashMap::new(),
        }
    }

    /// The configured idle lifetime.
    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    fn identity_lock(&self, class: &str, key: &[u8]) -> Arc<Mutex<()>> {
        self.identity_locks
            .entry((class.to_owned(), key.to_vec()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn stamp(&self, class: &str, key: Vec<u8>) {
        self.recall_times
            .entry(class.to_owned())
            .or_default()
            .insert(key, Instant::now());
    }

    fn stamp_rows(&self, class: &str, rows: &[Row]) -> Result<(), Error> {
        if !self.layer.is_cached(class) {
            return Ok(());
        }
        let def = self.layer.class_def(class)?;
        let now = Instant::now();
        let mut times = self.recall_times.entry(class.to_owned()).or_default();
        for row in rows {
            times.insert(row_key(&def, row), now);
        }
        Ok(())
    }

    /// Evict idle entries of one class; returns the eviction count.
    pub fn sweep(&self, class: &str) -> Result<usize, Error> {
        if !self.layer.is_cached(class) {
            return Ok(0);
        }
        let def = self.layer.class_def(class)?;
        let cutoff = Instant::now().checked_sub(self.lifetime);
        let cached = self.layer.cache_backend().recall(class, None)?;

        let mut evicted = 0;
        for row in cached {
            let key = row_key(&def, &row);
            let last = self
                .recall_times
                .get(class)
                .and_then(|times| times.get(&key).copied());
            let stale = match (last, cutoff) {
                (Some(last), Some(cutoff)) => last <= cutoff,
                (Some(_), None) => false,
                // Never stamped: nothing proves freshness, evict.
                (None, _) => true,
            };
            if !stale {
                continue;
            }
            let lock = self.identity_lock(class, &key);
            let _guard = lock.lock();
            let identity = identity_of(&def, &row);
            self.layer.invalidate(class, &identity)?;
            if let Some(mut times) = self.recall_times.get_mut(class) {
                times.remove(&key);
            }
            evicted += 1;
        }
        debug!(class, evicted, "sweep");
        Ok(evicted)
    }

    /// Evict idle entries of every cached class; returns the total count.
    pub fn sweep_all(&self) -> Result<usize, Error> {
        let mut evicted = 0;
        for class in self.layer.cached_classes() {
            evicted += self.sweep(&class)?;
        }
        Ok(evicted)
    }
}

fn row_key(def: &UnitClass, row: &Row) -> Vec<u8> {
    codec::encode_values(&identity_of(def, row))
}

fn identity_of(def: &UnitClass, row: &Row) -> Vec<Value> {
    def.identifiers()
        .iter()
        .map(|id| codec::get_field(row, id).cloned().unwrap_or(Value::Null))
        .collect()
}

impl StorageBackend for AgedCache {
    fn register(&self, class: &Arc<UnitClass>) -> Result<(), Error> {
        self.layer.register(class)
    }

    fn is_registered(&self, class: &str) -> bool {
        self.layer.is_registered(class)
    }

    fn reserve(&self, unit: &mut Unit) -> Result<(), Error> {
        self.layer.reserve(unit)?;
        if self.layer.is_cached(unit.class().name()) {
            self.stamp(unit.class().name(), unit.identity_key());
        }
        Ok(())
    }

    fn save(&self, unit: &mut Unit, force: bool) -> Result<(), Error> {
        let class = unit.class().name().to_owned();
        if self.layer.is_cached(&class) {
            let key = unit.identity_key();
            let lock = self.identity_lock(&class, &key);
            let _guard = lock.lock();
            self.layer.save(unit, force)?;
            self.stamp(&class, key);
            Ok(())
        } else {
            self.layer.save(unit, force)
        }
    }

    fn destroy(&self, class: &str, identity: &[Value]) -> Result<(), Error> {
        let key = codec::encode_values(identity);
        let lock = self.identity_lock(class, &key);
        let _guard = lock.lock();
        self.layer.destroy(class, identity)?;
        if let Some(mut times) = self.recall_times.get_mut(class) {
            times.remove(&key);
        }
        Ok(())
    }

    fn recall(&self, class: &str, expr: Option<&Expression>) -> Result<Vec<Row>, Error> {
        let rows = self.layer.recall(class, expr)?;
        self.stamp_rows(class, &rows)?;
        Ok(rows)
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
        self.recall_times.remove(class);
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
    use crate::model::FieldDef;
    use crate::model::PropertyType;
    use crate::storage::MemoryBackend;
    use mnemo_expr::field;

    fn setup(lifetime: &str) -> (Arc<MemoryBackend>, AgedCache, Arc<UnitClass>) {
        let terminal = Arc::new(MemoryBackend::new(&Options::new()));
        let options = Options::new().with("lifetime_secs", lifetime);
        let cache = AgedCache::new(terminal.clone(), &options);
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

    #[test]
    fn test_sweep_evicts_idle_entries() {
        // Zero lifetime: everything is idle immediately.
        let (terminal, cache, class) = setup("0");
        let mut unit = Unit::new(class);
        unit.set("name", "emu").unwrap();
        cache.reserve(&mut unit).unwrap();

        let evicted = cache.sweep_all().unwrap();
        assert_eq!(evicted, 1);

        // The next identity probe must go back to the wrapped store.
        terminal.destroy("Animal", &[Value::Int(1)]).unwrap();
        let rows = cache
            .recall("Animal", Some(&field("id").eq(1).expr()))
            .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_fresh_entries_survive_sweep() {
        let (_terminal, cache, class) = setup("3600");
        let mut unit = Unit::new(class);
        unit.set("name", "emu").unwrap();
        cache.reserve(&mut unit).unwrap();

        assert_eq!(cache.sweep_all().unwrap(), 0);
        let rows = cache
            .recall("Animal", Some(&field("id").eq(1).expr()))
            .unwrap();
        assert_eq!(rows.len(), 1);
    }
}
