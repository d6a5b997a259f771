//! Local evaluation of expressions against field rows.
//!
//! Two modes are provided. Exact evaluation reproduces the source
//! predicate's semantics: a perfect tree is walked directly, an imperfect
//! one defers to its fallback predicate. Approximate evaluation is the
//! candidate-superset contract for best-effort native filters: opaque nodes
//! evaluate to "unknown", and unknown widens to `true` at the root, so an
//! approximate match set is always a superset of the exact one.

use chrono::{Datelike, Timelike};

use crate::ast::{CompareOp, DatePart, Expression, Node};
use crate::codec::Row;
use crate::error::Error;
use crate::value::Value;

/// Three-valued result of walking a tree that may contain opaque nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Truth {
    True,
    False,
    Unknown,
}

impl Truth {
    fn not(self) -> Truth {
        match self {
            Truth::True => Truth::False,
            Truth::False => Truth::True,
            Truth::Unknown => Truth::Unknown,
        }
    }
}

impl From<bool> for Truth {
    fn from(b: bool) -> Self {
        if b {
            Truth::True
        } else {
            Truth::False
        }
    }
}

/// Outcome of evaluating a scalar operand.
enum Scalar {
    Known(Value),
    /// The named field is absent from the row.
    Missing,
    /// The operand contains an opaque node.
    Opaque,
}

impl Expression {
    /// Exact evaluation against one row per parameter.
    ///
    /// Imperfect expressions are resolved by their fallback predicate; an
    /// imperfect expression without one cannot be evaluated exactly.
    pub fn evaluate(&self, rows: &[&Row]) -> Result<bool, Error> {
        if self.is_perfect() {
            match walk(self.root(), rows)? {
                Truth::True => Ok(true),
                Truth::False => Ok(false),
                // A perfect tree has no opaque nodes, so this cannot occur.
                Truth::Unknown => Err(Error::MissingFallback),
            }
        } else {
            match self.fallback() {
                Some(predicate) => Ok(predicate(rows)),
                None => Err(Error::MissingFallback),
            }
        }
    }

    /// Exact evaluation of a single-class expression.
    pub fn matches(&self, row: &Row) -> Result<bool, Error> {
        self.evaluate(&[row])
    }

    /// Approximate (superset) evaluation: opaque nodes count as matches.
    ///
    /// For any rows, `approximate` returning `false` guarantees `evaluate`
    /// would also return `false`; the converse does not hold.
    pub fn approximate(&self, rows: &[&Row]) -> Result<bool, Error> {
        Ok(!matches!(walk(self.root(), rows)?, Truth::False))
    }

    /// Approximate evaluation of a single-class expression.
    pub fn approximate_row(&self, row: &Row) -> Result<bool, Error> {
        self.approximate(&[row])
    }
}

fn walk(node: &Node, rows: &[&Row]) -> Result<Truth, Error> {
    match node {
        Node::And(items) => {
            let mut out = Truth::True;
            for item in items {
                match walk(item, rows)? {
                    Truth::False => return Ok(Truth::False),
                    Truth::Unknown => out = Truth::Unknown,
                    Truth::True => {}
                }
            }
            Ok(out)
        }
        Node::Or(items) => {
            let mut out = Truth::False;
            for item in items {
                match walk(item, rows)? {
                    Truth::True => return Ok(Truth::True),
                    Truth::Unknown => out = Truth::Unknown,
                    Truth::False => {}
                }
            }
            Ok(out)
        }
        Node::Not(inner) => Ok(walk(inner, rows)?.not()),
        Node::Opaque { .. } => Ok(Truth::Unknown),
        Node::Compare { op, left, right } => {
            let left = scalar(left, rows)?;
            let right = scalar(right, rows)?;
            match (left, right) {
                (Scalar::Opaque, _) | (_, Scalar::Opaque) => Ok(Truth::Unknown),
                // A missing field matches nothing.
                (Scalar::Missing, _) | (_, Scalar::Missing) => Ok(Truth::False),
                (Scalar::Known(a), Scalar::Known(b)) => Ok(compare(*op, &a, &b).into()),
            }
        }
        Node::In { item, values } => match scalar(item, rows)? {
            Scalar::Opaque => Ok(Truth::Unknown),
            Scalar::Missing => Ok(Truth::False),
            Scalar::Known(v) => Ok(values.iter().any(|candidate| v.equals(candidate)).into()),
        },
        Node::Like { value, pattern } => string_test(value, rows, |s| like_match(s, pattern)),
        Node::StartsWith { value, prefix } => {
            string_test(value, rows, |s| s.starts_with(prefix.as_str()))
        }
        Node::EndsWith { value, suffix } => {
            string_test(value, rows, |s| s.ends_with(suffix.as_str()))
        }
        Node::Contains { value, needle } => {
            let container = scalar(value, rows)?;
            let needle = scalar(needle, rows)?;
            match (container, needle) {
                (Scalar::Opaque, _) | (_, Scalar::Opaque) => Ok(Truth::Unknown),
                (Scalar::Missing, _) | (_, Scalar::Missing) => Ok(Truth::False),
                (Scalar::Known(Value::Str(s)), Scalar::Known(Value::Str(sub))) => {
                    Ok(s.contains(sub.as_str()).into())
                }
                (Scalar::Known(Value::List(items)), Scalar::Known(needle))
                | (Scalar::Known(Value::Set(items)), Scalar::Known(needle)) => {
                    Ok(items.iter().any(|item| item.equals(&needle)).into())
                }
                _ => Ok(Truth::False),
            }
        }
        Node::IsNull { value, negated } => match scalar(value, rows)? {
            Scalar::Opaque => Ok(Truth::Unknown),
            Scalar::Missing | Scalar::Known(Value::Null) => Ok((!negated).into()),
            Scalar::Known(_) => Ok((*negated).into()),
        },
        // A bare scalar in boolean position: truthy when a true bool.
        other => match scalar(other, rows)? {
            Scalar::Opaque => Ok(Truth::Unknown),
            Scalar::Known(Value::Bool(b)) => Ok(b.into()),
            _ => Ok(Truth::False),
        },
    }
}

fn scalar(node: &Node, rows: &[&Row]) -> Result<Scalar, Error> {
    match node {
        Node::Literal(value) => Ok(Scalar::Known(value.clone())),
        Node::Field { unit, name } => {
            let row = rows.get(*unit).ok_or(Error::ParamOutOfRange(*unit))?;
            Ok(match crate::codec::get_field(row, name) {
                Some(value) => Scalar::Known(value.clone()),
                None => Scalar::Missing,
            })
        }
        Node::DatePart { part, value } => match scalar(value, rows)? {
            Scalar::Opaque => Ok(Scalar::Opaque),
            Scalar::Missing | Scalar::Known(Value::Null) => Ok(Scalar::Missing),
            Scalar::Known(v) => Ok(match date_part(*part, &v) {
                Some(n) => Scalar::Known(Value::Int(n)),
                None => Scalar::Missing,
            }),
        },
        Node::Opaque { .. } => Ok(Scalar::Opaque),
        // Boolean nodes are not scalar operands.
        _ => Ok(Scalar::Missing),
    }
}

fn compare(op: CompareOp, a: &Value, b: &Value) -> bool {
    match op {
        CompareOp::Eq => a.equals(b),
        CompareOp::Ne => !a.equals(b),
        CompareOp::Lt => a.compare(b).map(|ord| ord.is_lt()).unwrap_or(false),
        CompareOp::Le => a.compare(b).map(|ord| ord.is_le()).unwrap_or(false),
        CompareOp::Gt => a.compare(b).map(|ord| ord.is_gt()).unwrap_or(false),
        CompareOp::Ge => a.compare(b).map(|ord| ord.is_ge()).unwrap_or(false),
    }
}

fn string_test<F>(value: &Node, rows: &[&Row], test: F) -> Result<Truth, Error>
where
    F: FnOnce(&str) -> bool,
{
    match scalar(value, rows)? {
        Scalar::Opaque => Ok(Truth::Unknown),
        Scalar::Known(Value::Str(s)) => Ok(test(&s).into()),
        _ => Ok(Truth::False),
    }
}

fn date_part(part: DatePart, value: &Value) -> Option<i64> {
    match value {
        Value::Date(_) => {
            let date = value.as_date()?;
            Some(match part {
                DatePart::Year => i64::from(date.year()),
                DatePart::Month => i64::from(date.month()),
                DatePart::Day => i64::from(date.day()),
                DatePart::Hour | DatePart::Minute | DatePart::Second => 0,
            })
        }
        Value::DateTime(_) => {
            let dt = value.as_datetime()?;
            Some(match part {
                DatePart::Year => i64::from(dt.year()),
                DatePart::Month => i64::from(dt.month()),
                DatePart::Day => i64::from(dt.day()),
                DatePart::Hour => i64::from(dt.hour()),
                DatePart::Minute => i64::from(dt.minute()),
                DatePart::Second => i64::from(dt.second()),
            })
        }
        Value::Time(_) => {
            let time = value.as_time()?;
            match part {
                DatePart::Hour => Some(i64::from(time.hour())),
                DatePart::Minute => Some(i64::from(time.minute())),
                DatePart::Second => Some(i64::from(time.second())),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Match a string against a SQL LIKE pattern.
///
/// Supports:
/// - `%` matches zero or more characters
/// - `_` matches exactly one character
/// - `\%` and `\_` match the literal character
pub fn like_match(value: &str, pattern: &str) -> bool {
    let mut chars = value.chars().peekable();
    let mut pattern_chars = pattern.chars().peekable();
    like_match_recursive(&mut chars, &mut pattern_chars)
}

fn like_match_recursive(
    chars: &mut std::iter::Peekable<std::str::Chars>,
    pattern: &mut std::iter::Peekable<std::str::Chars>,
) -> bool {
    loop {
        match (pattern.peek().copied(), chars.peek().copied()) {
            (None, None) => return true,
            (None, Some(_)) => return false,
            (Some('%'), _) => {
                pattern.next();
                if pattern.peek().is_none() {
                    return true;
                }
                // Try matching % with 0, 1, 2, ... characters.
                loop {
                    let mut pattern_clone = pattern.clone();
                    let mut chars_clone = chars.clone();
                    if like_match_recursive(&mut chars_clone, &mut pattern_clone) {
                        return true;
                    }
                    if chars.next().is_none() {
                        return false;
                    }
                }
            }
            (Some('_'), Some(_)) => {
                pattern.next();
                chars.next();
            }
            (Some('_'), None) => return false,
            (Some('\\'), _) => {
                pattern.next();
                match (pattern.peek().copied(), chars.peek().copied()) {
                    (Some(p), Some(c)) if p == c => {
                        pattern.next();
                        chars.next();
                    }
                    _ => return false,
                }
            }
            (Some(p), Some(c)) => {
                if p == c {
                    pattern.next();
                    chars.next();
                } else {
                    return false;
                }
            }
            (Some(_), None) => return false,
        }
    }
}
