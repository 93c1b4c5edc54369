//! Fake topology builder: declaration parsing and sandbox materialization.

pub mod declaration;
pub mod materialize;

use std::path::Path;

use crate::core::errors::Result;

pub use declaration::FakeTopology;
pub use materialize::Materialized;

/// Parse `declaration` and materialize it under `sandbox`.
///
/// Malformed declarations are setup errors; the case cannot proceed.
pub fn build(declaration: &Path, sandbox: &Path, unique_name: &str) -> Result<Materialized> {
    let topology = FakeTopology::load(declaration)?;
    materialize::materialize(&topology, sandbox, unique_name)
}
