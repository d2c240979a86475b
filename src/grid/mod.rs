//! Grid expander: turns a parameter template into concrete parameter sets.
//!
//! - `expr`: leaf classification (scalar, product, zip member, range)
//! - `expand`: recursive walker, `expand()` / `count()` / `first_values()`

pub mod expand;
pub mod expr;

pub use expand::{MAX_EXPANSION, META_PREFIX, ParameterSet, count, expand, first_values};
pub use expr::{Candidates, Leaf, MAX_RANGE_LEN, RangeSpec};
