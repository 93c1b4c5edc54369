//! Generator invocation: environment composition and the deadline-bounded runner.

pub mod environment;
pub mod runner;

pub use environment::{EnvBag, EnvRequest, Phase, SecureBoot, compose};
pub use runner::{Invocation, ProcessRunner, RunOutcome};
