//! Combinator builder for expressions.
//!
//! This is the primary way to construct predicates:
//!
//! ```
//! use mnemo_expr::builder::field;
//!
//! let expr = field("age")
//!     .ge(18)
//!     .and_with(field("name").starts_with("A"))
//!     .expr();
//! assert!(expr.is_perfect());
//! ```
//!
//! Every literal is bound at build time; builders never capture live state.

use crate::ast::{CompareOp, DatePart, Expression, Node};
use crate::value::Value;

/// Start a predicate on a field of the first (usually only) class.
pub fn field(name: impl Into<String>) -> FieldRef {
    FieldRef {
        unit: 0,
        name: name.into(),
    }
}

/// Start a predicate on a field of the `unit`-th class of a join.
pub fn field_of(unit: usize, name: impl Into<String>) -> FieldRef {
    FieldRef {
        unit,
        name: name.into(),
    }
}

/// A reference to a field, ready to be compared.
#[derive(Debug, Clone)]
pub struct FieldRef {
    unit: usize,
    name: String,
}

impl FieldRef {
    fn node(&self) -> Node {
        Node::Field {
            unit: self.unit,
            name: self.name.clone(),
        }
    }

    fn compare(self, op: CompareOp, value: impl Into<Value>) -> Cond {
        Cond(Node::Compare {
            op,
            left: Box::new(self.node()),
            right: Box::new(Node::Literal(value.into())),
        })
    }

    /// `field == value`
    pub fn eq(self, value: impl Into<Value>) -> Cond {
        self.compare(CompareOp::Eq, value)
    }

    /// `field != value`
    pub fn ne(self, value: impl Into<Value>) -> Cond {
        self.compare(CompareOp::Ne, value)
    }

    /// `field < value`
    pub fn lt(self, value: impl Into<Value>) -> Cond {
        self.compare(CompareOp::Lt, value)
    }

    /// `field <= value`
    pub fn le(self, value: impl Into<Value>) -> Cond {
        self.compare(CompareOp::Le, value)
    }

    /// `field > value`
    pub fn gt(self, value: impl Into<Value>) -> Cond {
        self.compare(CompareOp::Gt, value)
    }

    /// `field >= value`
    pub fn ge(self, value: impl Into<Value>) -> Cond {
        self.compare(CompareOp::Ge, value)
    }

    /// Compare against a field of another joined class.
    pub fn eq_field(self, other: FieldRef) -> Cond {
        Cond(Node::Compare {
            op: CompareOp::Eq,
            left: Box::new(self.node()),
            right: Box::new(other.node()),
        })
    }

    /// Membership in a literal set.
    pub fn is_in(self, values: impl IntoIterator<Item = impl Into<Value>>) -> Cond {
        Cond(Node::In {
            item: Box::new(self.node()),
            values: values.into_iter().map(Into::into).collect(),
        })
    }

    /// SQL-style pattern match (`%` any run, `_` one char, `\` escapes).
    pub fn like(self, pattern: impl Into<String>) -> Cond {
        Cond(Node::Like {
            value: Box::new(self.node()),
            pattern: pattern.into(),
        })
    }

    /// String prefix test.
    pub fn starts_with(self, prefix: impl Into<String>) -> Cond {
        Cond(Node::StartsWith {
            value: Box::new(self.node()),
            prefix: prefix.into(),
        })
    }

    /// String suffix test.
    pub fn ends_with(self, suffix: impl Into<String>) -> Cond {
        Cond(Node::EndsWith {
            value: Box::new(self.node()),
            suffix: suffix.into(),
        })
    }

    /// Substring test for text fields, element membership for lists/sets.
    pub fn contains(self, needle: impl Into<Value>) -> Cond {
        Cond(Node::Contains {
            value: Box::new(self.node()),
            needle: Box::new(Node::Literal(needle.into())),
        })
    }

    /// Null test.
    pub fn is_null(self) -> Cond {
        Cond(Node::IsNull {
            value: Box::new(self.node()),
            negated: false,
        })
    }

    /// Non-null test.
    pub fn is_not_null(self) -> Cond {
        Cond(Node::IsNull {
            value: Box::new(self.node()),
            negated: true,
        })
    }

    /// Calendar year of a date/datetime field.
    pub fn year(self) -> PartRef {
        self.part(DatePart::Year)
    }

    /// Calendar month of a date/datetime field.
    pub fn month(self) -> PartRef {
        self.part(DatePart::Month)
    }

    /// Day of month of a date/datetime field.
    pub fn day(self) -> PartRef {
        self.part(DatePart::Day)
    }

    /// Hour of a time/datetime field.
    pub fn hour(self) -> PartRef {
        self.part(DatePart::Hour)
    }

    /// Minute of a time/datetime field.
    pub fn minute(self) -> PartRef {
        self.part(DatePart::Minute)
    }

    /// Second of a time/datetime field.
    pub fn second(self) -> PartRef {
        self.part(DatePart::Second)
    }

    fn part(self, part: DatePart) -> PartRef {
        PartRef {
            part,
            value: self.node(),
        }
    }
}

/// A calendar component of a field, ready to be compared as an integer.
#[derive(Debug, Clone)]
pub struct PartRef {
    part: DatePart,
    value: Node,
}

impl PartRef {
    fn compare(self, op: CompareOp, value: i64) -> Cond {
        Cond(Node::Compare {
            op,
            left: Box::new(Node::DatePart {
                part: self.part,
                value: Box::new(self.value),
            }),
            right: Box::new(Node::Literal(Value::Int(value))),
        })
    }

    /// `part == value`
    pub fn eq(self, value: i64) -> Cond {
        self.compare(CompareOp::Eq, value)
    }

    /// `part != value`
    pub fn ne(self, value: i64) -> Cond {
        self.compare(CompareOp::Ne, value)
    }

    /// `part < value`
    pub fn lt(self, value: i64) -> Cond {
        self.compare(CompareOp::Lt, value)
    }

    /// `part <= value`
    pub fn le(self, value: i64) -> Cond {
        self.compare(CompareOp::Le, value)
    }

    /// `part > value`
    pub fn gt(self, value: i64) -> Cond {
        self.compare(CompareOp::Gt, value)
    }

    /// `part >= value`
    pub fn ge(self, value: i64) -> Cond {
        self.compare(CompareOp::Ge, value)
    }
}

/// A composable condition.
#[derive(Debug, Clone)]
pub struct Cond(Node);

impl Cond {
    /// Conjoin with another condition.
    pub fn and_with(self, other: Cond) -> Cond {
        // Flatten nested conjunctions so identity probes stay recognizable.
        let mut items = match self.0 {
            Node::And(items) => items,
            other => vec![other],
        };
        match other.0 {
            Node::And(mut rest) => items.append(&mut rest),
            single => items.push(single),
        }
        Cond(Node::And(items))
    }

    /// Disjoin with another condition.
    pub fn or_with(self, other: Cond) -> Cond {
        let mut items = match self.0 {
            Node::Or(items) => items,
            other => vec![other],
        };
        match other.0 {
            Node::Or(mut rest) => items.append(&mut rest),
            single => items.push(single),
        }
        Cond(Node::Or(items))
    }

    /// Negate this condition.
    pub fn negate(self) -> Cond {
        Cond(Node::Not(Box::new(self.0)))
    }

    /// Finish into a single-parameter [`Expression`].
    pub fn expr(self) -> Expression {
        Expression::new(self.0)
    }

    /// Finish into a join expression over named parameters.
    pub fn expr_over(self, params: impl IntoIterator<Item = impl Into<String>>) -> Expression {
        Expression::with_params(params.into_iter().map(Into::into).collect(), self.0)
    }

    /// The underlying tree node.
    pub fn into_node(self) -> Node {
        self.0
    }
}

/// Conjoin many conditions (empty means "match everything").
pub fn all(conds: impl IntoIterator<Item = Cond>) -> Cond {
    conds
        .into_iter()
        .reduce(Cond::and_with)
        .unwrap_or(Cond(Node::And(Vec::new())))
}

/// Disjoin many conditions (empty means "match nothing").
pub fn any(conds: impl IntoIterator<Item = Cond>) -> Cond {
    conds
        .into_iter()
        .reduce(Cond::or_with)
        .unwrap_or(Cond(Node::Or(Vec::new())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flattened_conjunction() {
        let cond = field("a")
            .eq(1)
            .and_with(field("b").eq(2))
            .and_with(field("c").eq(3));
        match cond.into_node() {
            Node::And(items) => assert_eq!(items.len(), 3),
            other => panic!("expected And, got {other:?}"),
        }
    }

    #[test]
    fn test_join_fields_use_parameter_indices() {
        let expr = field_of(1, "owner_id")
            .eq_field(field("id"))
            .expr_over(["user", "pet"]);
        assert_eq!(expr.params().len(), 2);
        assert_eq!(expr.max_unit(), 1);
    }

    #[test]
    fn test_empty_combinators() {
        assert!(matches!(all([]).into_node(), Node::And(v) if v.is_empty()));
        assert!(matches!(any([]).into_node(), Node::Or(v) if v.is_empty()));
    }
}
