//! Unit class definitions.
//!
//! A `UnitClass` is immutable once built; every check that can fail —
//! duplicate field names, unknown identifier fields, hooks on missing
//! fields — fails at build time with a definition error.

use std::collections::HashMap;
use std::sync::Arc;

use mnemo_expr::Value;

use crate::error::Error;

use super::field::FieldDef;

/// A `before_set` hook: `(class, field, old, new)`.
///
/// Returning `Ok(Some(value))` rewrites the incoming value; `Ok(None)` keeps
/// it; `Err` vetoes the assignment.
pub type BeforeSetHook =
    Arc<dyn Fn(&UnitClass, &str, &Value, &Value) -> Result<Option<Value>, Error> + Send + Sync>;

/// An `after_set` hook: `(class, field, old, new)`, called once the value is
/// in place.
pub type AfterSetHook = Arc<dyn Fn(&UnitClass, &str, &Value, &Value) + Send + Sync>;

/// Hooks registered for one field. Within a field, hooks fire in
/// registration order; across fields changed by one `set_many`, they fire in
/// class declaration order.
#[derive(Default)]
pub struct FieldHooks {
    /// Fired before assignment; may rewrite or veto.
    pub before: Vec<BeforeSetHook>,
    /// Fired after assignment.
    pub after: Vec<AfterSetHook>,
}

/// A named record type: ordered fields plus an identifier tuple.
pub struct UnitClass {
    name: String,
    fields: Vec<FieldDef>,
    identifiers: Vec<String>,
    hooks: HashMap<String, FieldHooks>,
}

impl std::fmt::Debug for UnitClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitClass")
            .field("name", &self.name)
            .field("fields", &self.fields)
            .field("identifiers", &self.identifiers)
            .finish()
    }
}

impl UnitClass {
    /// Start building a class.
    pub fn builder(name: impl Into<String>) -> UnitClassBuilder {
        UnitClassBuilder {
            name: name.into(),
            fields: Vec::new(),
            identifiers: Vec::new(),
            hooks: HashMap::new(),
        }
    }

    /// Class name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Field definitions in declaration order.
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    /// Look up a field by name.
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Position of a field in declaration order.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// The identifier tuple field names.
    pub fn identifiers(&self) -> &[String] {
        &self.identifiers
    }

    /// Whether this class has an identifier tuple. Classes without one are
    /// append-only and bypass the identity map.
    pub fn has_identifiers(&self) -> bool {
        !self.identifiers.is_empty()
    }

    /// All indexed fields.
    pub fn indexed_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| f.indexed)
    }

    /// Hooks registered for a field, if any.
    pub fn hooks(&self, field: &str) -> Option<&FieldHooks> {
        self.hooks.get(field)
    }
}

/// Builder for [`UnitClass`]; all validation happens in [`build`].
///
/// [`build`]: UnitClassBuilder::build
pub struct UnitClassBuilder {
    name: String,
    fields: Vec<FieldDef>,
    identifiers: Vec<String>,
    hooks: HashMap<String, FieldHooks>,
}

impl UnitClassBuilder {
    /// Add a field.
    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    /// Add multiple fields.
    pub fn fields(mut self, fields: impl IntoIterator<Item = FieldDef>) -> Self {
        self.fields.extend(fields);
        self
    }

    /// Declare the identifier tuple.
    pub fn identifiers(
        mut self,
        names: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.identifiers = names.into_iter().map(Into::into).collect();
        self
    }

    /// Register a `before_set` hook for a field.
    pub fn before_set<F>(mut self, field: impl Into<String>, hook: F) -> Self
    where
        F: Fn(&UnitClass, &str, &Value, &Value) -> Result<Option<Value>, Error>
            + Send
            + Sync
            + 'static,
    {
        self.hooks
            .entry(field.into())
            .or_default()
            .before
            .push(Arc::new(hook));
        self
    }

    /// Register an `after_set` hook for a field.
    pub fn after_set<F>(mut self, field: impl Into<String>, hook: F) -> Self
    where
        F: Fn(&UnitClass, &str, &Value, &Value) + Send + Sync + 'static,
    {
        self.hooks
            .entry(field.into())
            .or_default()
            .after
            .push(Arc::new(hook));
        self
    }

    /// Validate and build the class.
    pub fn build(self) -> Result<Arc<UnitClass>, Error> {
        if self.name.is_empty() {
            return Err(Error::Definition("class name must not be empty".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for field in &self.fields {
            if !seen.insert(field.name.as_str()) {
                return Err(Error::Definition(format!(
                    "duplicate field `{}` on class `{}`",
                    field.name, self.name
                )));
            }
        }
        for id in &self.identifiers {
            if !seen.contains(id.as_str()) {
                return Err(Error::Definition(format!(
                    "identifier `{id}` is not a field of class `{}`",
                    self.name
                )));
            }
        }
        for hooked in self.hooks.keys() {
            if !seen.contains(hooked.as_str()) {
                return Err(Error::Definition(format!(
                    "hook registered for unknown field `{hooked}` on class `{}`",
                    self.name
                )));
            }
        }
        Ok(Arc::new(UnitClass {
            name: self.name,
            fields: self.fields,
            identifiers: self.identifiers,
            hooks: self.hooks,
        }))
    }
}
