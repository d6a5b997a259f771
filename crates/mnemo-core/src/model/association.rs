//! Association definitions between unit classes.

use serde::{Deserialize, Serialize};

/// Cardinality of an association, read from the near side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cardinality {
    /// One near record relates to at most one far record.
    OneToOne,
    /// One near record relates to many far records.
    OneToMany,
    /// Many near records relate to one far record.
    ManyToOne,
}

impl Cardinality {
    /// The cardinality as read from the far side.
    pub fn reversed(self) -> Self {
        match self {
            Cardinality::OneToOne => Cardinality::OneToOne,
            Cardinality::OneToMany => Cardinality::ManyToOne,
            Cardinality::ManyToOne => Cardinality::OneToMany,
        }
    }

    /// Whether an accessor reading in this direction yields at most one
    /// record.
    pub fn is_to_one(self) -> bool {
        matches!(self, Cardinality::OneToOne | Cardinality::ManyToOne)
    }
}

/// A declared relationship between a near (class, field) pair and a far
/// (class, field) pair.
///
/// Near/far is a labeling convenience, not a constraint: the association is
/// undirected for pathfinding and readable from either endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssociationDef {
    /// Association name; installs the relation accessor on both classes.
    pub name: String,
    /// Near class name.
    pub near_class: String,
    /// Field on the near class.
    pub near_field: String,
    /// Far class name.
    pub far_class: String,
    /// Field on the far class.
    pub far_field: String,
    /// Cardinality read from the near side.
    pub cardinality: Cardinality,
}

/// One endpoint of an association, as seen from a specific class.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    /// Field on the queried class.
    pub local_field: String,
    /// The class on the other end.
    pub remote_class: String,
    /// Field on the other end.
    pub remote_field: String,
    /// Cardinality read from the queried class.
    pub cardinality: Cardinality,
}

impl AssociationDef {
    /// View this association from the side of `class`.
    ///
    /// Returns `None` when `class` is not an endpoint. Self-associations
    /// resolve to the near side.
    pub fn endpoint_for(&self, class: &str) -> Option<Endpoint> {
        if self.near_class == class {
            Some(Endpoint {
                local_field: self.near_field.clone(),
                remote_class: self.far_class.clone(),
                remote_field: self.far_field.clone(),
                cardinality: self.cardinality,
            })
        } else if self.far_class == class {
            Some(Endpoint {
                local_field: self.far_field.clone(),
                remote_class: self.near_class.clone(),
                remote_field: self.near_field.clone(),
                cardinality: self.cardinality.reversed(),
            })
        } else {
            None
        }
    }

    /// The other endpoint class name, as seen from `class`.
    pub fn other_class(&self, class: &str) -> Option<&str> {
        if self.near_class == class {
            Some(&self.far_class)
        } else if self.far_class == class {
            Some(&self.near_class)
        } else {
            None
        }
    }
}
