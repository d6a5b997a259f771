//! The storage backend contract and terminal backends.
//!
//! Every backend — terminal store or wrapping layer — implements
//! [`StorageBackend`]. Wrappers hold their "next" backend by reference
//! (composition, never subclassing), so chains stay substitutable at
//! runtime. Registration of a class must propagate through the whole chain
//! before any operation on that class is valid.

mod disk;
mod memory;

pub use disk::DiskBackend;
pub use memory::MemoryBackend;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use mnemo_expr::{Expression, Row, Value};

use crate::error::{conflict, ConflictMode, Error, Warnings};
use crate::model::{AssociationDef, UnitClass};
use crate::unit::Unit;

/// String-keyed configuration passed to backends at construction.
///
/// Recognized keys are backend-specific; the core imposes none.
#[derive(Debug, Clone, Default)]
pub struct Options(BTreeMap<String, String>);

impl Options {
    /// Empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key/value pair.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Raw string lookup.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Boolean lookup; accepts `1`/`true`/`yes`/`on` (case-insensitive).
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key)
            .map(|raw| matches!(raw.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
    }

    /// Unsigned integer lookup; unparsable values read as absent.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|raw| raw.parse().ok())
    }

    /// Float lookup; unparsable values read as absent.
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|raw| raw.parse().ok())
    }

    /// Path lookup.
    pub fn get_path(&self, key: &str) -> Option<PathBuf> {
        self.get(key).map(PathBuf::from)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Options {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// An ordered multi-class join: the classes plus the association links that
/// connect each adjacent pair.
///
/// Callers resolve the links against their [`Registry`] (via
/// `shortest_path`/`direct_link`) before handing the join to a backend, so
/// backends stay registry-free.
///
/// [`Registry`]: crate::model::Registry
#[derive(Debug, Clone)]
pub struct Join {
    /// Class names, in result-tuple order.
    pub classes: Vec<String>,
    /// `links[i]` connects `classes[i]` and `classes[i + 1]`.
    pub links: Vec<Arc<AssociationDef>>,
}

impl Join {
    /// Build a join, validating the link count.
    pub fn new(classes: Vec<String>, links: Vec<Arc<AssociationDef>>) -> Result<Self, Error> {
        if classes.len() < 2 {
            return Err(Error::Definition(
                "a join needs at least two classes".into(),
            ));
        }
        if links.len() + 1 != classes.len() {
            return Err(Error::Definition(format!(
                "join over {} classes needs {} links, got {}",
                classes.len(),
                classes.len() - 1,
                links.len()
            )));
        }
        Ok(Self { classes, links })
    }
}

/// The operation set every storage backend must provide.
pub trait StorageBackend: Send + Sync {
    /// Prepare the backend to handle a class. Idempotent.
    fn register(&self, class: &Arc<UnitClass>) -> Result<(), Error>;

    /// Whether a class has been registered.
    fn is_registered(&self, class: &str) -> bool;

    /// Allocate identity for the unit if absent and record it.
    ///
    /// Implementations hold a per-class mutual-exclusion lock for the whole
    /// allocation.
    fn reserve(&self, unit: &mut Unit) -> Result<(), Error>;

    /// Persist the unit's field values.
    ///
    /// A no-op unless the unit is dirty or `force` is set. Clears the dirty
    /// flag on success only; a failed save leaves it unchanged so the caller
    /// can retry.
    fn save(&self, unit: &mut Unit, force: bool) -> Result<(), Error>;

    /// Remove the persisted record for an identity. Destroying an absent
    /// identity is a no-op.
    fn destroy(&self, class: &str, identity: &[Value]) -> Result<(), Error>;

    /// Every stored row of `class` matching `expr` (all rows when `None`).
    ///
    /// Backends whose native filtering is imperfect for `expr` must apply
    /// the fallback post-filter themselves before returning.
    fn recall(&self, class: &str, expr: Option<&Expression>) -> Result<Vec<Row>, Error>;

    /// Distinct value tuples for `fields` among matching rows.
    fn distinct(
        &self,
        class: &str,
        fields: &[String],
        expr: Option<&Expression>,
    ) -> Result<Vec<Vec<Value>>, Error>;

    /// Matching row tuples across joined classes, in join order.
    fn multirecall(
        &self,
        join: &Join,
        expr: Option<&Expression>,
    ) -> Result<Vec<Vec<Row>>, Error>;

    /// Create storage structures for a class.
    fn create_storage(&self, class: &str, conflicts: ConflictMode) -> Result<Warnings, Error>;

    /// Whether storage structures exist for a class.
    fn has_storage(&self, class: &str) -> bool;

    /// Drop storage structures for a class.
    fn drop_storage(&self, class: &str, conflicts: ConflictMode) -> Result<Warnings, Error>;

    /// Add storage for one property of a class.
    fn add_property(
        &self,
        class: &str,
        name: &str,
        conflicts: ConflictMode,
    ) -> Result<Warnings, Error>;

    /// Whether storage exists for the property.
    fn has_property(&self, class: &str, name: &str) -> Result<bool, Error>;

    /// Drop storage for one property of a class.
    fn drop_property(
        &self,
        class: &str,
        name: &str,
        conflicts: ConflictMode,
    ) -> Result<Warnings, Error>;

    /// Rename a stored property.
    fn rename_property(
        &self,
        class: &str,
        old: &str,
        new: &str,
        conflicts: ConflictMode,
    ) -> Result<Warnings, Error>;

    /// Add an index for a property. Backends without native indexes treat
    /// this as a hint and succeed.
    fn add_index(
        &self,
        _class: &str,
        _name: &str,
        _conflicts: ConflictMode,
    ) -> Result<Warnings, Error> {
        Ok(Warnings::new())
    }

    /// Whether an index exists for the property.
    fn has_index(&self, _class: &str, _name: &str) -> Result<bool, Error> {
        Ok(false)
    }

    /// Drop the index for a property.
    fn drop_index(
        &self,
        _class: &str,
        _name: &str,
        _conflicts: ConflictMode,
    ) -> Result<Warnings, Error> {
        Ok(Warnings::new())
    }

    /// Verify (or, under `Repair`, reconcile) storage against the model.
    ///
    /// Checks class storage and every model property; `Repair` creates
    /// whatever is missing, `Warn` collects one warning per discrepancy,
    /// `Error` aborts on the first.
    fn map(&self, classes: &[Arc<UnitClass>], conflicts: ConflictMode) -> Result<Warnings, Error> {
        let mut warnings = Warnings::new();
        for class in classes {
            if !self.has_storage(class.name()) {
                if conflicts == ConflictMode::Repair {
                    warnings.extend(self.create_storage(class.name(), conflicts)?);
                    continue;
                }
                conflict(
                    conflicts,
                    &mut warnings,
                    class.name(),
                    "no storage found",
                )?;
                continue;
            }
            for field in class.fields() {
                if !self.has_property(class.name(), &field.name)? {
                    if conflicts == ConflictMode::Repair {
                        warnings.extend(self.add_property(
                            class.name(),
                            &field.name,
                            conflicts,
                        )?);
                    } else {
                        conflict(
                            conflicts,
                            &mut warnings,
                            class.name(),
                            format!("no storage found for property `{}`", field.name),
                        )?;
                    }
                }
            }
        }
        Ok(warnings)
    }

    /// Release backend resources. Default no-op.
    fn shutdown(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// Resolve a join by chained hash joins over per-class row sets.
///
/// Build phase hashes each right-hand class by its join field; probe phase
/// extends every partial tuple with its matches. The combining expression is
/// applied to complete tuples only, with exact semantics, so callers get no
/// false positives from this path.
pub(crate) fn combine<F>(
    fetch: F,
    join: &Join,
    expr: Option<&Expression>,
) -> Result<Vec<Vec<Row>>, Error>
where
    F: Fn(&str) -> Result<Vec<Row>, Error>,
{
    use mnemo_expr::codec;
    use std::collections::HashMap;

    let mut tuples: Vec<Vec<Row>> = fetch(&join.classes[0])?
        .into_iter()
        .map(|row| vec![row])
        .collect();

    for (i, link) in join.links.iter().enumerate() {
        let left_class = &join.classes[i];
        let right_class = &join.classes[i + 1];
        let endpoint = link.endpoint_for(left_class).ok_or_else(|| {
            Error::Definition(format!(
                "association `{}` does not touch class `{left_class}`",
                link.name
            ))
        })?;
        if endpoint.remote_class != *right_class {
            return Err(Error::Definition(format!(
                "association `{}` does not connect `{left_class}` to `{right_class}`",
                link.name
            )));
        }

        let mut table: HashMap<Vec<u8>, Vec<Row>> = HashMap::new();
        for row in fetch(right_class)? {
            if let Some(value) = codec::get_field(&row, &endpoint.remote_field) {
                if !value.is_null() {
                    table
                        .entry(codec::encode_single(value))
                        .or_default()
                        .push(row);
                }
            }
        }

        let mut extended = Vec::new();
        for tuple in tuples {
            let probe = codec::get_field(&tuple[i], &endpoint.local_field)
                .filter(|value| !value.is_null())
                .map(codec::encode_single);
            if let Some(key) = probe {
                if let Some(matches) = table.get(&key) {
                    for row in matches {
                        let mut next = tuple.clone();
                        next.push(row.clone());
                        extended.push(next);
                    }
                }
            }
        }
        tuples = extended;
    }

    if let Some(expr) = expr {
        let mut filtered = Vec::new();
        for tuple in tuples {
            let refs: Vec<&Row> = tuple.iter().collect();
            if expr.evaluate(&refs)? {
                filtered.push(tuple);
            }
        }
        tuples = filtered;
    }
    Ok(tuples)
}

/// Project rows onto `fields` and drop duplicate tuples (by encoded form).
pub(crate) fn distinct_projection(rows: Vec<Row>, fields: &[String]) -> Vec<Vec<Value>> {
    use mnemo_expr::codec;
    use std::collections::HashSet;

    let mut seen = HashSet::new();
    let mut tuples = Vec::new();
    for row in rows {
        let tuple: Vec<Value> = fields
            .iter()
            .map(|f| codec::get_field(&row, f).cloned().unwrap_or(Value::Null))
            .collect();
        if seen.insert(codec::encode_values(&tuple)) {
            tuples.push(tuple);
        }
    }
    tuples
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_typed_getters() {
        let options: Options = [
            ("fullquery", "true"),
            ("lifetime_secs", "2.5"),
            ("count", "12"),
            ("path", "/tmp/store"),
            ("junk", "wat"),
        ]
        .into_iter()
        .collect();

        assert_eq!(options.get_bool("fullquery"), Some(true));
        assert_eq!(options.get_bool("junk"), Some(false));
        assert_eq!(options.get_bool("missing"), None);
        assert_eq!(options.get_f64("lifetime_secs"), Some(2.5));
        assert_eq!(options.get_u64("count"), Some(12));
        assert_eq!(options.get_u64("junk"), None);
        assert_eq!(options.get_path("path"), Some(PathBuf::from("/tmp/store")));
    }

    #[test]
    fn test_join_link_arity() {
        assert!(Join::new(vec!["A".into()], vec![]).is_err());
        assert!(Join::new(vec!["A".into(), "B".into()], vec![]).is_err());
    }
}
