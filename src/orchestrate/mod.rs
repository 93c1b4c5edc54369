//! Run orchestration: phase barrier, worker pools, verdicts.

pub mod barrier;
pub mod harness;
pub mod report;
#[cfg(feature = "signals")]
pub mod signals;

pub use barrier::{BootlistGuard, PhaseBarrier, Release};
pub use harness::{Harness, PhaseSelection, RunOptions};
pub use report::{CaseReport, RunSummary, Verdict};
