//! The class and association registry.
//!
//! A `Registry` is an explicit object constructed alongside each backend or
//! session root and passed by reference — never a process-wide global. It
//! owns the unit classes and the undirected association graph used for
//! shortest-path discovery between classes when building ad hoc joins.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Error;

use super::association::{AssociationDef, Cardinality};
use super::class::UnitClass;

#[derive(Default)]
struct Inner {
    classes: BTreeMap<String, Arc<UnitClass>>,
    associations: Vec<Arc<AssociationDef>>,
    /// class name -> indices into `associations` (undirected).
    edges: HashMap<String, Vec<usize>>,
}

/// Registry of unit classes and their associations.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<Inner>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a class. Duplicate names fail with a definition error.
    pub fn add_class(&self, class: Arc<UnitClass>) -> Result<(), Error> {
        let mut inner = self.inner.write();
        if inner.classes.contains_key(class.name()) {
            return Err(Error::Definition(format!(
                "class `{}` is already registered",
                class.name()
            )));
        }
        inner.classes.insert(class.name().to_owned(), class);
        Ok(())
    }

    /// Look up a class by name.
    pub fn class(&self, name: &str) -> Result<Arc<UnitClass>, Error> {
        self.inner
            .read()
            .classes
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownClass(name.to_owned()))
    }

    /// All registered classes, in name order.
    pub fn classes(&self) -> Vec<Arc<UnitClass>> {
        self.inner.read().classes.values().cloned().collect()
    }

    /// Declare an association between `(class_a, field_a)` and
    /// `(class_b, field_b)` with the given cardinality (read from the
    /// `class_a` side).
    ///
    /// The relation name becomes an accessor on both classes, so it must not
    /// collide with a field name of either class, nor with an existing
    /// relation on either class.
    pub fn associate(
        &self,
        name: impl Into<String>,
        class_a: &str,
        field_a: &str,
        class_b: &str,
        field_b: &str,
        cardinality: Cardinality,
    ) -> Result<Arc<AssociationDef>, Error> {
        let name = name.into();
        let mut inner = self.inner.write();

        for (class, field) in [(class_a, field_a), (class_b, field_b)] {
            let def = inner
                .classes
                .get(class)
                .ok_or_else(|| Error::UnknownClass(class.to_owned()))?;
            if def.field(field).is_none() {
                return Err(Error::UnknownField {
                    class: class.to_owned(),
                    field: field.to_owned(),
                });
            }
            if def.field(&name).is_some() {
                return Err(Error::Definition(format!(
                    "relation `{name}` collides with a field of class `{class}`"
                )));
            }
        }

        let clash = inner.associations.iter().any(|assoc| {
            assoc.name == name
                && (assoc.endpoint_for(class_a).is_some() || assoc.endpoint_for(class_b).is_some())
        });
        if clash {
            return Err(Error::Definition(format!(
                "relation `{name}` is already defined for `{class_a}` or `{class_b}`"
            )));
        }

        let assoc = Arc::new(AssociationDef {
            name,
            near_class: class_a.to_owned(),
            near_field: field_a.to_owned(),
            far_class: class_b.to_owned(),
            far_field: field_b.to_owned(),
            cardinality,
        });
        let index = inner.associations.len();
        inner.associations.push(assoc.clone());
        inner
            .edges
            .entry(class_a.to_owned())
            .or_default()
            .push(index);
        if class_b != class_a {
            inner
                .edges
                .entry(class_b.to_owned())
                .or_default()
                .push(index);
        }
        Ok(assoc)
    }

    /// Look up the association named `name` reachable from `class`.
    pub fn association(&self, class: &str, name: &str) -> Result<Arc<AssociationDef>, Error> {
        let inner = self.inner.read();
        inner
            .edges
            .get(class)
            .into_iter()
            .flatten()
            .map(|&i| &inner.associations[i])
            .find(|assoc| assoc.name == name)
            .cloned()
            .ok_or_else(|| Error::Definition(format!("class `{class}` has no relation `{name}`")))
    }

    /// Every association touching `class`.
    pub fn associations_of(&self, class: &str) -> Vec<Arc<AssociationDef>> {
        let inner = self.inner.read();
        inner
            .edges
            .get(class)
            .into_iter()
            .flatten()
            .map(|&i| inner.associations[i].clone())
            .collect()
    }

    /// The direct association between two adjacent classes, used when
    /// resolving an ordered join.
    pub fn direct_link(&self, from: &str, to: &str) -> Result<Arc<AssociationDef>, Error> {
        let inner = self.inner.read();
        inner
            .edges
            .get(from)
            .into_iter()
            .flatten()
            .map(|&i| &inner.associations[i])
            .find(|assoc| assoc.other_class(from) == Some(to))
            .cloned()
            .ok_or_else(|| Error::NoPath {
                from: from.to_owned(),
                to: to.to_owned(),
            })
    }

    /// The shortest chain of associations connecting two classes.
    ///
    /// Breadth-first over the undirected association graph; fails with
    /// `NoPath` when the classes are disconnected.
    pub fn shortest_path(
        &self,
        from: &str,
        to: &str,
    ) -> Result<Vec<Arc<AssociationDef>>, Error> {
        let inner = self.inner.read();
        if !inner.classes.contains_key(from) {
            return Err(Error::UnknownClass(from.to_owned()));
        }
        if !inner.classes.contains_key(to) {
            return Err(Error::UnknownClass(to.to_owned()));
        }
        if from == to {
            return Ok(Vec::new());
        }

        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(from.to_owned());
        // class -> (predecessor class, association index)
        let mut came_from: HashMap<String, (String, usize)> = HashMap::new();
        let mut queue: VecDeque<String> = VecDeque::new();
        queue.push_back(from.to_owned());

        while let Some(current) = queue.pop_front() {
            for &index in inner.edges.get(&current).into_iter().flatten() {
                let assoc = &inner.associations[index];
                let Some(next) = assoc.other_class(&current) else {
                    continue;
                };
                if visited.contains(next) {
                    continue;
                }
                visited.insert(next.to_owned());
                came_from.insert(next.to_owned(), (current.clone(), index));
                if next == to {
                    let mut path = Vec::new();
                    let mut cursor = to.to_owned();
                    while let Some((previous, index)) = came_from.get(&cursor) {
                        path.push(inner.associations[*index].clone());
                        cursor = previous.clone();
                    }
                    path.reverse();
                    return Ok(path);
                }
                queue.push_back(next.to_owned());
            }
        }

        Err(Error::NoPath {
            from: from.to_owned(),
            to: to.to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::field::FieldDef;
    use crate::model::types::PropertyType;

    fn class(name: &str) -> Arc<UnitClass> {
        UnitClass::builder(name)
            .field(FieldDef::new("id", PropertyType::Int))
            .field(FieldDef::new("ref_id", PropertyType::Int))
            .identifiers(["id"])
            .build()
            .unwrap()
    }

    fn registry_with(names: &[&str]) -> Arc<Registry> {
        let registry = Registry::new();
        for name in names {
            registry.add_class(class(name)).unwrap();
        }
        registry
    }

    #[test]
    fn test_duplicate_class_rejected() {
        let registry = registry_with(&["A"]);
        assert!(matches!(
            registry.add_class(class("A")),
            Err(Error::Definition(_))
        ));
    }

    #[test]
    fn test_relation_name_collision_with_field() {
        let registry = registry_with(&["A", "B"]);
        let result = registry.associate("ref_id", "A", "id", "B", "ref_id", Cardinality::OneToMany);
        assert!(matches!(result, Err(Error::Definition(_))));
    }

    #[test]
    fn test_associate_and_lookup() {
        let registry = registry_with(&["Owner", "Pet"]);
        registry
            .associate("pets", "Owner", "id", "Pet", "ref_id", Cardinality::OneToMany)
            .unwrap();

        let assoc = registry.association("Pet", "pets").unwrap();
        assert_eq!(assoc.near_class, "Owner");
        assert_eq!(registry.associations_of("Owner").len(), 1);
        assert!(registry.association("Owner", "missing").is_err());
    }

    #[test]
    fn test_shortest_path_chain() {
        let registry = registry_with(&["A", "B", "C", "D", "Lone"]);
        registry
            .associate("ab", "A", "id", "B", "ref_id", Cardinality::OneToMany)
            .unwrap();
        registry
            .associate("bc", "B", "id", "C", "ref_id", Cardinality::OneToMany)
            .unwrap();
        registry
            .associate("cd", "C", "id", "D", "ref_id", Cardinality::OneToMany)
            .unwrap();
        // A shortcut that should win over the chain.
        registry
            .associate("ad", "A", "id", "D", "ref_id", Cardinality::OneToOne)
            .unwrap();

        let path = registry.shortest_path("A", "D").unwrap();
        assert_eq!(path.len(), 1);
        assert_eq!(path[0].name, "ad");

        let path = registry.shortest_path("A", "C").unwrap();
        assert_eq!(path.len(), 2);
        assert_eq!(path[0].name, "ab");
        assert_eq!(path[1].name, "bc");

        assert!(matches!(
            registry.shortest_path("A", "Lone"),
            Err(Error::NoPath { .. })
        ));
        assert!(registry.shortest_path("A", "A").unwrap().is_empty());
    }

    #[test]
    fn test_direct_link() {
        let registry = registry_with(&["A", "B", "C"]);
        registry
            .associate("ab", "A", "id", "B", "ref_id", Cardinality::OneToMany)
            .unwrap();
        assert!(registry.direct_link("A", "B").is_ok());
        assert!(registry.direct_link("B", "A").is_ok());
        assert!(matches!(
            registry.direct_link("A", "C"),
            Err(Error::NoPath { .. })
        ));
    }
}
