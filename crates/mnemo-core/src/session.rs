//! Identity-map sessions.
//!
//! A `Sandbox` is the single-owner working set for one logical unit of
//! work: it materializes units out of a backend chain, guarantees at most
//! one in-memory representative per identity, tracks dirtiness, and writes
//! changes back. Sandboxes are deliberately `!Send` — construct one per
//! request or transaction and drop it when done; the backend chain behind
//! it is the shared, thread-safe part.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::Arc;

use tracing::debug;

use mnemo_expr::{all, codec, field, Expression, Row, Value};

use crate::error::{render_identity, Error, FlushError, FlushFailure};
use crate::model::{Registry, UnitClass};
use crate::storage::{Join, StorageBackend};
use crate::unit::Unit;

/// A session-resident unit. Reference equality (`Rc::ptr_eq`) is the
/// identity-map guarantee: one identity, one instance.
pub type SharedUnit = Rc<RefCell<Unit>>;

/// Result of a relation accessor.
pub enum Related {
    /// To-one side: at most one related unit.
    One(Option<SharedUnit>),
    /// To-many side: possibly empty, never null.
    Many(Vec<SharedUnit>),
}

/// An identity map bound to a backend chain.
pub struct Sandbox {
    store: Arc<dyn StorageBackend>,
    registry: Arc<Registry>,
    /// class -> identity key -> resident instance.
    caches: RefCell<HashMap<String, HashMap<Vec<u8>, SharedUnit>>>,
}

impl Sandbox {
    /// Bind a new sandbox to a backend chain and registry.
    pub fn new(store: Arc<dyn StorageBackend>, registry: Arc<Registry>) -> Self {
        Self {
            store,
            registry,
            caches: RefCell::new(HashMap::new()),
        }
    }

    /// The bound registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The bound backend chain.
    pub fn store(&self) -> &Arc<dyn StorageBackend> {
        &self.store
    }

    /// A detached instance of a registered class.
    pub fn new_unit(&self, class: &str) -> Result<Unit, Error> {
        Ok(Unit::new(self.registry.class(class)?))
    }

    /// Attach a detached unit: allocate identity if absent, record it in
    /// the backend, and insert it into the identity map.
    ///
    /// Fails with a duplicate-identity error when a *different* instance
    /// with the same identity is already resident.
    pub fn memorize(&self, unit: Unit) -> Result<SharedUnit, Error> {
        if unit.is_destroyed() {
            return Err(Error::Destroyed);
        }
        let class = unit.class().clone();
        let mut unit = unit;

        if class.has_identifiers() {
            if unit.has_identity() {
                let key = unit.identity_key();
                if self.resident(class.name(), &key).is_some() {
                    return Err(Error::DuplicateIdentity {
                        class: class.name().to_owned(),
                        identity: render_identity(&unit.identity()),
                    });
                }
            }
            self.store.reserve(&mut unit)?;
            let key = unit.identity_key();
            let mut caches = self.caches.borrow_mut();
            let cache = caches.entry(class.name().to_owned()).or_default();
            if cache.contains_key(&key) {
                return Err(Error::DuplicateIdentity {
                    class: class.name().to_owned(),
                    identity: render_identity(&unit.identity()),
                });
            }
            debug!(class = class.name(), "memorize");
            let shared = Rc::new(RefCell::new(unit));
            cache.insert(key, shared.clone());
            Ok(shared)
        } else {
            self.store.reserve(&mut unit)?;
            debug!(class = class.name(), "memorize");
            let shared = Rc::new(RefCell::new(unit));
            let key = ptr_key(&shared);
            self.caches
                .borrow_mut()
                .entry(class.name().to_owned())
                .or_default()
                .insert(key, shared.clone());
            Ok(shared)
        }
    }

    /// Recall units of a class matching an expression.
    ///
    /// The result is a lazy, single-pass iterator; every call re-queries the
    /// backend. Resident instances take precedence over incoming copies of
    /// the same identity, and when the expression is imperfect the original
    /// predicate is re-applied here to discard any over-matches a
    /// best-effort backend let through.
    pub fn recall(&self, class: &str, expr: Option<&Expression>) -> Result<Recall<'_>, Error> {
        let def = self.registry.class(class)?;
        debug!(class, filtered = expr.is_some(), "recall");

        // Recall-by-identity: a resident instance answers without a store
        // round trip.
        if def.has_identifiers() {
            if let Some(probe) = expr.and_then(|e| e.as_identity_probe(def.identifiers())) {
                let key = codec::encode_values(&probe);
                if let Some(resident) = self.resident(class, &key) {
                    return Ok(Recall {
                        sandbox: self,
                        def,
                        expr: expr.cloned(),
                        hits: vec![resident].into_iter(),
                        rows: Vec::new().into_iter(),
                        checked: HashSet::new(),
                    });
                }
            }
        }

        // The identity map holds the freshest state, so every resident key
        // counts as checked whether or not it matches.
        let mut checked = HashSet::new();
        let mut hits = Vec::new();
        if def.has_identifiers() {
            let caches = self.caches.borrow();
            if let Some(cache) = caches.get(class) {
                for (key, resident) in cache.iter() {
                    checked.insert(key.clone());
                    let unit = resident.borrow();
                    if unit.is_destroyed() {
                        continue;
                    }
                    let matched = match expr {
                        Some(e) => e.matches(&unit.row())?,
                        None => true,
                    };
                    if matched {
                        hits.push(resident.clone());
                    }
                }
            }
        }

        let rows = self.store.recall(class, expr)?;
        Ok(Recall {
            sandbox: self,
            def,
            expr: expr.cloned(),
            hits: hits.into_iter(),
            rows: rows.into_iter(),
            checked,
        })
    }

    /// Recall into a vector.
    pub fn recall_all(
        &self,
        class: &str,
        expr: Option<&Expression>,
    ) -> Result<Vec<SharedUnit>, Error> {
        self.recall(class, expr)?.collect()
    }

    /// The single unit matching the given field values, else `None`.
    ///
    /// When the pairs cover exactly the class identifiers this is a
    /// recall-by-identity with an at-most-one guarantee: a backend handing
    /// back more than one raw record for the identity is an invariant
    /// violation reported as an ambiguous identity. With any other pairs the
    /// first match wins.
    pub fn unit(
        &self,
        class: &str,
        pairs: &[(&str, Value)],
    ) -> Result<Option<SharedUnit>, Error> {
        let def = self.registry.class(class)?;
        let expr = all(pairs
            .iter()
            .map(|(name, value)| field(*name).eq(value.clone())))
        .expr();

        let covers_identity = def.has_identifiers()
            && pairs.len() == def.identifiers().len()
            && def
                .identifiers()
                .iter()
                .all(|id| pairs.iter().any(|(name, _)| *name == id.as_str()));

        if covers_identity {
            let identity: Vec<Value> = def
                .identifiers()
                .iter()
                .map(|id| {
                    pairs
                        .iter()
                        .find(|(name, _)| *name == id.as_str())
                        .map(|(_, value)| value.clone())
                        .unwrap_or(Value::Null)
                })
                .collect();
            let key = codec::encode_values(&identity);
            if let Some(resident) = self.resident(class, &key) {
                return Ok(Some(resident));
            }
            let rows = self.store.recall(class, Some(&expr))?;
            if rows.len() > 1 {
                return Err(Error::AmbiguousIdentity {
                    class: class.to_owned(),
                    identity: render_identity(&identity),
                });
            }
            Ok(rows.first().map(|row| self.adopt(&def, row)))
        } else {
            match self.recall(class, Some(&expr))?.next() {
                Some(result) => result.map(Some),
                None => Ok(None),
            }
        }
    }

    /// Persist every dirty resident unit.
    ///
    /// Every unit is attempted; failures are aggregated and reported as one
    /// error carrying the full set of failed identities.
    pub fn flush_all(&self) -> Result<(), Error> {
        let snapshot: Vec<SharedUnit> = self
            .caches
            .borrow()
            .values()
            .flat_map(|cache| cache.values().cloned())
            .collect();

        let mut failures = Vec::new();
        for resident in snapshot {
            let mut unit = resident.borrow_mut();
            if unit.is_destroyed() || !unit.dirty() {
                continue;
            }
            if let Err(error) = self.store.save(&mut unit, false) {
                failures.push(FlushFailure {
                    class: unit.class().name().to_owned(),
                    identity: render_identity(&unit.identity()),
                    error: error.to_string(),
                });
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(FlushError { failures }.into())
        }
    }

    /// Destroy a unit in both the identity map and the backend.
    ///
    /// Destruction is terminal: the instance rejects every further
    /// operation. Classes without identifiers are append-only — forgetting
    /// one releases the in-memory instance but leaves stored rows alone.
    pub fn forget(&self, unit: &SharedUnit) -> Result<(), Error> {
        let (class, identity, key) = {
            let borrowed = unit.borrow();
            if borrowed.is_destroyed() {
                return Err(Error::Destroyed);
            }
            let key = if borrowed.class().has_identifiers() {
                borrowed.identity_key()
            } else {
                ptr_key(unit)
            };
            (
                borrowed.class().clone(),
                borrowed.identity(),
                key,
            )
        };

        if class.has_identifiers() {
            self.store.destroy(class.name(), &identity)?;
        }
        if let Some(cache) = self.caches.borrow_mut().get_mut(class.name()) {
            cache.remove(&key);
        }
        unit.borrow_mut().mark_destroyed();
        debug!(class = class.name(), "forget");
        Ok(())
    }

    /// Save a unit and release it from the identity map without destroying
    /// it in storage.
    pub fn release(&self, unit: &SharedUnit) -> Result<(), Error> {
        let (class, key) = {
            let borrowed = unit.borrow();
            if borrowed.is_destroyed() {
                return Err(Error::Destroyed);
            }
            let key = if borrowed.class().has_identifiers() {
                borrowed.identity_key()
            } else {
                ptr_key(unit)
            };
            (borrowed.class().name().to_owned(), key)
        };
        self.store.save(&mut unit.borrow_mut(), false)?;
        if let Some(cache) = self.caches.borrow_mut().get_mut(&class) {
            cache.remove(&key);
        }
        Ok(())
    }

    /// Drop every resident unit of a class without saving.
    pub fn purge(&self, class: &str) {
        self.caches.borrow_mut().remove(class);
    }

    /// Distinct value tuples straight from the backend, bypassing the
    /// identity map.
    pub fn distinct(
        &self,
        class: &str,
        fields: &[&str],
        expr: Option<&Expression>,
    ) -> Result<Vec<Vec<Value>>, Error> {
        let fields: Vec<String> = fields.iter().map(|f| (*f).to_owned()).collect();
        self.store.distinct(class, &fields, expr)
    }

    /// Number of stored units matching an expression.
    pub fn count(&self, class: &str, expr: Option<&Expression>) -> Result<usize, Error> {
        let def = self.registry.class(class)?;
        let fields: Vec<String> = if def.has_identifiers() {
            def.identifiers().to_vec()
        } else {
            def.fields().iter().map(|f| f.name.clone()).collect()
        };
        Ok(self.store.distinct(class, &fields, expr)?.len())
    }

    /// Recall tuples across an ordered join of classes.
    ///
    /// Adjacent classes must be directly associated; the links are resolved
    /// against the registry and handed to the backend chain. Each returned
    /// tuple prefers resident instances over incoming copies.
    pub fn multirecall(
        &self,
        classes: &[&str],
        expr: Option<&Expression>,
    ) -> Result<Vec<Vec<SharedUnit>>, Error> {
        let mut links = Vec::new();
        for pair in classes.windows(2) {
            links.push(self.registry.direct_link(pair[0], pair[1])?);
        }
        let join = Join::new(classes.iter().map(|c| (*c).to_owned()).collect(), links)?;
        let defs = classes
            .iter()
            .map(|c| self.registry.class(c))
            .collect::<Result<Vec<_>, _>>()?;

        let tuples = self.store.multirecall(&join, expr)?;
        let mut out = Vec::new();
        for tuple in tuples {
            if let Some(e) = expr {
                if !e.is_perfect() {
                    let refs: Vec<&Row> = tuple.iter().collect();
                    if !e.evaluate(&refs)? {
                        continue;
                    }
                }
            }
            let units = tuple
                .iter()
                .zip(&defs)
                .map(|(row, def)| self.adopt(def, row))
                .collect();
            out.push(units);
        }
        Ok(out)
    }

    /// Follow a relation accessor from a unit.
    ///
    /// Yields one unit or none for the to-one side, a list for the to-many
    /// side; the optional expression further filters the results.
    pub fn related(
        &self,
        unit: &SharedUnit,
        relation: &str,
        expr: Option<&Expression>,
    ) -> Result<Related, Error> {
        let class = unit.borrow().class().clone();
        let assoc = self.registry.association(class.name(), relation)?;
        let endpoint = assoc.endpoint_for(class.name()).ok_or_else(|| {
            Error::Definition(format!(
                "relation `{relation}` does not touch class `{}`",
                class.name()
            ))
        })?;

        let local = unit.borrow().get(&endpoint.local_field)?;
        if local.is_null() {
            return Ok(if endpoint.cardinality.is_to_one() {
                Related::One(None)
            } else {
                Related::Many(Vec::new())
            });
        }

        let probe = field(&endpoint.remote_field).eq(local).expr();
        let combined = match expr {
            Some(extra) => probe.and(extra.clone()),
            None => probe,
        };
        let matches = self.recall_all(&endpoint.remote_class, Some(&combined))?;
        Ok(if endpoint.cardinality.is_to_one() {
            Related::One(matches.into_iter().next())
        } else {
            Related::Many(matches)
        })
    }

    fn resident(&self, class: &str, key: &[u8]) -> Option<SharedUnit> {
        self.caches
            .borrow()
            .get(class)
            .and_then(|cache| cache.get(key))
            .filter(|resident| !resident.borrow().is_destroyed())
            .cloned()
    }

    /// Wrap a raw row, preferring an already-resident instance of the same
    /// identity.
    fn adopt(&self, def: &Arc<UnitClass>, row: &Row) -> SharedUnit {
        let unit = Unit::from_row(def.clone(), row);
        if !def.has_identifiers() {
            // No identity to compare against the map; hand back a fresh,
            // untracked instance.
            return Rc::new(RefCell::new(unit));
        }
        let key = unit.identity_key();
        let mut caches = self.caches.borrow_mut();
        let cache = caches.entry(def.name().to_owned()).or_default();
        if let Some(existing) = cache.get(&key) {
            return existing.clone();
        }
        let shared = Rc::new(RefCell::new(unit));
        cache.insert(key, shared.clone());
        shared
    }
}

fn ptr_key(unit: &SharedUnit) -> Vec<u8> {
    (Rc::as_ptr(unit) as usize).to_le_bytes().to_vec()
}

/// Lazy, single-pass recall sequence. Re-invoke [`Sandbox::recall`] to
/// restart — each call re-queries the backend.
pub struct Recall<'a> {
    sandbox: &'a Sandbox,
    def: Arc<UnitClass>,
    expr: Option<Expression>,
    hits: std::vec::IntoIter<SharedUnit>,
    rows: std::vec::IntoIter<Row>,
    checked: HashSet<Vec<u8>>,
}

impl Iterator for Recall<'_> {
    type Item = Result<SharedUnit, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(hit) = self.hits.next() {
            return Some(Ok(hit));
        }
        for row in self.rows.by_ref() {
            if !self.def.has_identifiers() {
                return Some(Ok(self.sandbox.adopt(&self.def, &row)));
            }
            let key = row_identity_key(&self.def, &row);
            if !self.checked.insert(key.clone()) {
                // Already answered from the identity map.
                continue;
            }
            if let Some(resident) = self.sandbox.resident(self.def.name(), &key) {
                return Some(Ok(resident));
            }
            if let Some(expr) = &self.expr {
                if !expr.is_perfect() {
                    // Caller-side fallback: drop over-matches from a
                    // best-effort native filter.
                    match expr.matches(&row) {
                        Ok(true) => {}
                        Ok(false) => continue,
                        Err(error) => return Some(Err(error.into())),
                    }
                }
            }
            return Some(Ok(self.sandbox.adopt(&self.def, &row)));
        }
        None
    }
}

fn row_identity_key(def: &UnitClass, row: &Row) -> Vec<u8> {
    let identity: Vec<Value> = def
        .identifiers()
        .iter()
        .map(|id| codec::get_field(row, id).cloned().unwrap_or(Value::Null))
        .collect();
    codec::encode_values(&identity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConflictMode;
    use crate::model::{FieldDef, PropertyType};
    use crate::storage::{MemoryBackend, Options};

    fn setup() -> Sandbox {
        let registry = Registry::new();
        let class = UnitClass::builder("Animal")
            .field(FieldDef::new("id", PropertyType::Int))
            .field(FieldDef::new("name", PropertyType::Str))
            .identifiers(["id"])
            .build()
            .unwrap();
        registry.add_class(class.clone()).unwrap();

        let store = Arc::new(MemoryBackend::new(&Options::new()));
        store.register(&class).unwrap();
        store.create_storage("Animal", ConflictMode::Error).unwrap();
        Sandbox::new(store, registry)
    }

    #[test]
    fn test_memorize_assigns_identity() {
        let sandbox = setup();
        let mut unit = sandbox.new_unit("Animal").unwrap();
        unit.set("name", "emu").unwrap();
        let shared = sandbox.memorize(unit).unwrap();
        assert_eq!(shared.borrow().get("id").unwrap(), Value::Int(1));
        assert!(!shared.borrow().dirty());
    }

    #[test]
    fn test_duplicate_identity_is_rejected() {
        let sandbox = setup();
        let mut unit = sandbox.new_unit("Animal").unwrap();
        unit.set("id", 5i64).unwrap();
        sandbox.memorize(unit).unwrap();

        let mut copy = sandbox.new_unit("Animal").unwrap();
        copy.set("id", 5i64).unwrap();
        assert!(matches!(
            sandbox.memorize(copy),
            Err(Error::DuplicateIdentity { .. })
        ));
    }

    #[test]
    fn test_recall_returns_resident_instance() {
        let sandbox = setup();
        let mut unit = sandbox.new_unit("Animal").unwrap();
        unit.set("name", "emu").unwrap();
        let original = sandbox.memorize(unit).unwrap();

        let recalled = sandbox
            .unit("Animal", &[("id", Value::Int(1))])
            .unwrap()
            .unwrap();
        assert!(Rc::ptr_eq(&original, &recalled));
    }

    #[test]
    fn test_forget_is_terminal() {
        let sandbox = setup();
        let mut unit = sandbox.new_unit("Animal").unwrap();
        unit.set("name", "emu").unwrap();
        let shared = sandbox.memorize(unit).unwrap();

        sandbox.forget(&shared).unwrap();
        assert!(shared.borrow().is_destroyed());
        assert!(matches!(sandbox.forget(&shared), Err(Error::Destroyed)));
        assert!(sandbox.unit("Animal", &[("id", Value::Int(1))]).unwrap().is_none());
    }
}
