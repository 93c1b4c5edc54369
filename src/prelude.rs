//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use zfs_bootmenu_harness::prelude::*;
//! ```

// Core
pub use crate::core::config::Config;
pub use crate::core::errors::{HarnessError, Result};

// Catalog and topology
pub use crate::catalog::{TestCase, discover, select};
pub use crate::topology::{FakeTopology, Materialized};

// Invocation
pub use crate::invoke::{EnvBag, EnvRequest, Invocation, Phase, ProcessRunner, SecureBoot};

// Comparison
pub use crate::golden::{Comparison, Mismatch, SANDBOX_PLACEHOLDER};

// Orchestration
pub use crate::logger::RunLog;
pub use crate::orchestrate::{
    Harness, PhaseBarrier, PhaseSelection, Release, RunOptions, RunSummary, Verdict,
};
pub use crate::sandbox::Sandbox;
