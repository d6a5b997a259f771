//! Portable values and predicate expressions for mnemo.
//!
//! This crate is the backend-agnostic layer: the [`Value`] runtime type, the
//! [`Expression`] tree with its [`builder`] API, exact and approximate local
//! evaluation, the tag-based value [`codec`], and JSON interchange.
//!
//! An expression is built once and reused across backends. It is *perfect*
//! when every node translates exactly; a backend implementing exact
//! translation of a perfect expression needs no post-filtering. Attaching an
//! opaque host predicate ([`Expression::opaque`]) makes it *imperfect*:
//! backends then fetch a candidate superset (see
//! [`Expression::approximate`]) and the original predicate is re-applied
//! locally to discard false positives.

pub mod ast;
pub mod builder;
pub mod codec;
pub mod error;
mod eval;
pub mod json;
pub mod value;

pub use ast::{CompareOp, DatePart, Expression, FallbackFn, Node};
pub use builder::{all, any, field, field_of, Cond, FieldRef};
pub use codec::{
    decode_row, decode_value, decode_values, encode_row, encode_single, encode_values, get_field,
    Row,
};
pub use error::Error;
pub use eval::like_match;
pub use value::{BigInt, Decimal, Value, ValueKind};
