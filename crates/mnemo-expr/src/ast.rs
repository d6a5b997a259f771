//! The portable expression tree.
//!
//! An [`Expression`] is an immutable predicate over one or more field rows:
//! a parameter list (one name per joined class) and an operator tree with
//! literals already bound. Expressions carry no live captures; the one
//! escape hatch is an opaque fallback predicate, which marks the whole
//! expression imperfect (see [`Expression::is_perfect`]).

use std::fmt;
use std::sync::Arc;

use crate::codec::Row;
use crate::value::Value;

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Less than.
    Lt,
    /// Less than or equal.
    Le,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Ge,
}

/// Calendar component accessors usable inside expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatePart {
    /// Calendar year.
    Year,
    /// Calendar month (1-12).
    Month,
    /// Day of month (1-31).
    Day,
    /// Hour of day (0-23).
    Hour,
    /// Minute (0-59).
    Minute,
    /// Second (0-59).
    Second,
}

/// A node in the expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// A bound literal.
    Literal(Value),
    /// A field of the `unit`-th parameter row.
    Field {
        /// Parameter index into the evaluated row set.
        unit: usize,
        /// Field name.
        name: String,
    },
    /// Binary comparison.
    Compare {
        /// Operator.
        op: CompareOp,
        /// Left operand.
        left: Box<Node>,
        /// Right operand.
        right: Box<Node>,
    },
    /// Conjunction; empty means `true`.
    And(Vec<Node>),
    /// Disjunction; empty means `false`.
    Or(Vec<Node>),
    /// Negation.
    Not(Box<Node>),
    /// Membership in a bound literal set.
    In {
        /// Candidate operand.
        item: Box<Node>,
        /// Allowed values.
        values: Vec<Value>,
    },
    /// String pattern match with `%`/`_` wildcards.
    Like {
        /// String operand.
        value: Box<Node>,
        /// Pattern with `%` (any run) and `_` (single char), `\` escapes.
        pattern: String,
    },
    /// String prefix test.
    StartsWith {
        /// String operand.
        value: Box<Node>,
        /// Required prefix.
        prefix: String,
    },
    /// String suffix test.
    EndsWith {
        /// String operand.
        value: Box<Node>,
        /// Required suffix.
        suffix: String,
    },
    /// Substring test for strings, element membership for lists and sets.
    Contains {
        /// Container operand.
        value: Box<Node>,
        /// Needle.
        needle: Box<Node>,
    },
    /// Null test.
    IsNull {
        /// Operand.
        value: Box<Node>,
        /// When true, tests for non-null instead.
        negated: bool,
    },
    /// Calendar component of a date/datetime operand, as an integer.
    DatePart {
        /// Component to extract.
        part: DatePart,
        /// Date or datetime operand.
        value: Box<Node>,
    },
    /// A sub-expression no backend can translate; resolved only by the
    /// expression's fallback predicate.
    Opaque {
        /// Human-readable marker for diagnostics.
        label: String,
    },
}

impl Node {
    fn contains_opaque(&self) -> bool {
        match self {
            Node::Opaque { .. } => true,
            Node::Literal(_) | Node::Field { .. } => false,
            Node::Compare { left, right, .. } => {
                left.contains_opaque() || right.contains_opaque()
            }
            Node::And(items) | Node::Or(items) => items.iter().any(Node::contains_opaque),
            Node::Not(inner) => inner.contains_opaque(),
            Node::In { item, .. } => item.contains_opaque(),
            Node::Like { value, .. }
            | Node::StartsWith { value, .. }
            | Node::EndsWith { value, .. }
            | Node::IsNull { value, .. }
            | Node::DatePart { value, .. } => value.contains_opaque(),
            Node::Contains { value, needle } => {
                value.contains_opaque() || needle.contains_opaque()
            }
        }
    }

    fn max_unit(&self) -> usize {
        match self {
            Node::Field { unit, .. } => *unit,
            Node::Literal(_) | Node::Opaque { .. } => 0,
            Node::Compare { left, right, .. } => left.max_unit().max(right.max_unit()),
            Node::And(items) | Node::Or(items) => {
                items.iter().map(Node::max_unit).max().unwrap_or(0)
            }
            Node::Not(inner) => inner.max_unit(),
            Node::In { item, .. } => item.max_unit(),
            Node::Like { value, .. }
            | Node::StartsWith { value, .. }
            | Node::EndsWith { value, .. }
            | Node::IsNull { value, .. }
            | Node::DatePart { value, .. } => value.max_unit(),
            Node::Contains { value, needle } => value.max_unit().max(needle.max_unit()),
        }
    }
}

/// The fallback predicate attached to an imperfect expression.
pub type FallbackFn = Arc<dyn Fn(&[&Row]) -> bool + Send + Sync>;

/// A portable, immutable predicate over one or more field rows.
#[derive(Clone)]
pub struct Expression {
    params: Vec<String>,
    root: Node,
    fallback: Option<FallbackFn>,
}

impl Expression {
    /// Build a single-parameter expression from a tree.
    pub fn new(root: Node) -> Self {
        Self::with_params(vec!["u".into()], root)
    }

    /// Build an expression over named parameters (one per joined class).
    pub fn with_params(params: Vec<String>, root: Node) -> Self {
        Self {
            params,
            root,
            fallback: None,
        }
    }

    /// The expression that matches everything.
    pub fn always() -> Self {
        Self::new(Node::And(Vec::new()))
    }

    /// Wrap an arbitrary host predicate as an opaque, imperfect expression.
    ///
    /// Backends cannot translate the predicate; they fetch a candidate
    /// superset from whatever exact parts remain and the closure is
    /// re-applied locally to discard false positives.
    pub fn opaque<F>(label: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&[&Row]) -> bool + Send + Sync + 'static,
    {
        let mut expr = Self::new(Node::Opaque {
            label: label.into(),
        });
        expr.fallback = Some(Arc::new(predicate));
        expr
    }

    /// Attach a fallback predicate, marking exact evaluation to use it when
    /// the tree is imperfect.
    pub fn with_fallback<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&[&Row]) -> bool + Send + Sync + 'static,
    {
        self.fallback = Some(Arc::new(predicate));
        self
    }

    /// Parameter names, one per joined class.
    pub fn params(&self) -> &[String] {
        &self.params
    }

    /// The root of the operator tree.
    pub fn root(&self) -> &Node {
        &self.root
    }

    /// The attached fallback predicate, if any.
    pub fn fallback(&self) -> Option<&FallbackFn> {
        self.fallback.as_ref()
    }

    /// Whether every node of the tree translates exactly.
    ///
    /// Perfection is a property of the whole tree: one opaque node makes the
    /// entire expression imperfect, and any backend translation must then be
    /// treated as a candidate superset.
    pub fn is_perfect(&self) -> bool {
        !self.root.contains_opaque()
    }

    /// Conjoin two expressions.
    ///
    /// The parameter list of the wider expression wins; fallbacks compose so
    /// exact semantics are preserved when either side is imperfect.
    pub fn and(self, other: Expression) -> Expression {
        let params = if other.params.len() > self.params.len() {
            other.params.clone()
        } else {
            self.params.clone()
        };
        let root = Node::And(vec![self.root.clone(), other.root.clone()]);
        let fallback: Option<FallbackFn> =
            if self.fallback.is_some() || other.fallback.is_some() {
                let left = self.clone();
                let right = other.clone();
                Some(Arc::new(move |rows: &[&Row]| {
                    left.evaluate(rows).unwrap_or(false) && right.evaluate(rows).unwrap_or(false)
                }))
            } else {
                None
            };
        Expression {
            params,
            root,
            fallback,
        }
    }

    /// Highest parameter index referenced by the tree.
    pub fn max_unit(&self) -> usize {
        self.root.max_unit()
    }

    /// Recognize a recall-by-identity probe.
    ///
    /// Returns the identity values when the tree is a perfect conjunction of
    /// equality tests on parameter 0 covering exactly `identifiers`, in
    /// identifier order. This is the fast path that lets sessions and caches
    /// answer identity lookups without touching the terminal store.
    pub fn as_identity_probe(&self, identifiers: &[String]) -> Option<Vec<Value>> {
        if identifiers.is_empty() || !self.is_perfect() {
            return None;
        }
        let mut found: Vec<Option<Value>> = vec![None; identifiers.len()];
        let terms: Vec<&Node> = match &self.root {
            Node::And(items) => items.iter().collect(),
            single => vec![single],
        };
        if terms.len() != identifiers.len() {
            return None;
        }
        for term in terms {
            let (name, value) = match term {
                Node::Compare {
                    op: CompareOp::Eq,
                    left,
                    right,
                } => match (left.as_ref(), right.as_ref()) {
                    (Node::Field { unit: 0, name }, Node::Literal(value))
                    | (Node::Literal(value), Node::Field { unit: 0, name }) => {
                        (name.clone(), value.clone())
                    }
                    _ => return None,
                },
                _ => return None,
            };
            let slot = identifiers.iter().position(|id| *id == name)?;
            if found[slot].is_some() {
                return None;
            }
            found[slot] = Some(value);
        }
        found.into_iter().collect()
    }
}

impl fmt::Debug for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Expression")
            .field("params", &self.params)
            .field("root", &self.root)
            .field("fallback", &self.fallback.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::field;

    #[test]
    fn test_perfection_is_a_whole_tree_property() {
        let perfect = field("age").gt(18).expr();
        assert!(perfect.is_perfect());

        let tainted = perfect.and(Expression::opaque("custom", |_| true));
        assert!(!tainted.is_perfect());
        assert!(tainted.fallback().is_some());
    }

    #[test]
    fn test_identity_probe_recognition() {
        let ids = vec!["id".to_string()];
        let probe = field("id").eq(7).expr();
        assert_eq!(probe.as_identity_probe(&ids), Some(vec![Value::Int(7)]));

        let not_probe = field("name").eq("x").expr();
        assert_eq!(not_probe.as_identity_probe(&ids), None);

        let wide = vec!["a".to_string(), "b".to_string()];
        let both = field("b").eq(2).and_with(field("a").eq(1)).expr();
        assert_eq!(
            both.as_identity_probe(&wide),
            Some(vec![Value::Int(1), Value::Int(2)])
        );

        // A repeated identifier is not a probe.
        let dup = field("a").eq(1).and_with(field("a").eq(2)).expr();
        assert_eq!(dup.as_identity_probe(&wide), None);
    }

    #[test]
    fn test_identity_probe_rejects_extra_terms() {
        let ids = vec!["id".to_string()];
        let extra = field("id").eq(1).and_with(field("name").eq("x")).expr();
        assert_eq!(extra.as_identity_probe(&ids), None);

        let imperfect = Expression::opaque("f", |_| true);
        assert_eq!(imperfect.as_identity_probe(&ids), None);
    }
}
