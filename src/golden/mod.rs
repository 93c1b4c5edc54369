//! Golden comparator: normalize volatile paths, compare against references,
//! rewrite references in update mode.

pub mod compare;
pub mod normalize;

pub use compare::{Comparison, Mismatch, compare, update};
pub use normalize::{SANDBOX_PLACEHOLDER, SANDBOX_PREFIX, normalize};
