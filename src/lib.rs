#![forbid(unsafe_code)]

//! ZFS boot menu harness (zbh): golden-file tests for an external boot menu
//! generator.
//!
//! Each case declares a fake pool topology. The harness materializes it in a
//! private sandbox, runs the generator twice (boot list, then menu metadata)
//! with mock storage tools on the search path, and compares both outputs
//! against recorded references once sandbox paths are normalized.
//!
//! # Library usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use zfs_bootmenu_harness::prelude::*;
//!
//! let config = Config::load(None)?;
//! let harness = Harness::new(config, Arc::new(RunLog::disabled()))?;
//! let summary = harness.run(&RunOptions::default())?;
//! assert!(summary.is_success());
//! # Ok::<(), HarnessError>(())
//! ```

pub mod prelude;

pub mod catalog;
pub mod core;
pub mod golden;
pub mod invoke;
pub mod logger;
pub mod orchestrate;
pub mod sandbox;
pub mod topology;
