//! ZBH-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Top-level error type for the boot menu harness.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("[ZBH-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[ZBH-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[ZBH-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[ZBH-2001] cannot list fixtures under {path}: {details}")]
    Catalog { path: PathBuf, details: String },

    #[error("[ZBH-2002] malformed topology declaration {path}: {details}")]
    Declaration { path: PathBuf, details: String },

    #[error("[ZBH-2003] unknown case mode {mode:?} (expected enabled, disabled or no-mokutil)")]
    UnknownMode { mode: String },

    #[error("[ZBH-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[ZBH-3001] generator exited with {status}\n----- stdout -----\n{stdout}\n----- stderr -----\n{stderr}")]
    GeneratorFailed {
        status: String,
        stdout: String,
        stderr: String,
    },

    #[error("[ZBH-3002] generator exceeded {deadline_secs}s deadline and was killed\n----- stdout -----\n{stdout}\n----- stderr -----\n{stderr}")]
    GeneratorTimeout {
        deadline_secs: u64,
        stdout: String,
        stderr: String,
    },

    #[error("[ZBH-3003] generator spawn failure for {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("[ZBH-3004] run cancelled while {context}")]
    Cancelled { context: &'static str },

    #[error("[ZBH-4001] precondition not met: {details}")]
    Precondition { details: String },

    #[error("[ZBH-5001] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[ZBH-5900] runtime failure: {details}")]
    Runtime { details: String },
}

impl HarnessError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "ZBH-1001",
            Self::MissingConfig { .. } => "ZBH-1002",
            Self::ConfigParse { .. } => "ZBH-1003",
            Self::Catalog { .. } => "ZBH-2001",
            Self::Declaration { .. } => "ZBH-2002",
            Self::UnknownMode { .. } => "ZBH-2003",
            Self::Serialization { .. } => "ZBH-2101",
            Self::GeneratorFailed { .. } => "ZBH-3001",
            Self::GeneratorTimeout { .. } => "ZBH-3002",
            Self::Spawn { .. } => "ZBH-3003",
            Self::Cancelled { .. } => "ZBH-3004",
            Self::Precondition { .. } => "ZBH-4001",
            Self::Io { .. } => "ZBH-5001",
            Self::Runtime { .. } => "ZBH-5900",
        }
    }

    /// Whether the failure is about run configuration rather than generator
    /// correctness. Such cases are reported as skipped, never failed.
    #[must_use]
    pub const fn is_skip(&self) -> bool {
        matches!(self, Self::Precondition { .. })
    }

    /// Whether the failure happened before the generator ran.
    #[must_use]
    pub const fn is_setup(&self) -> bool {
        matches!(
            self,
            Self::Catalog { .. }
                | Self::Declaration { .. }
                | Self::UnknownMode { .. }
                | Self::Io { .. }
                | Self::Serialization { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Convenience constructor for precondition (skip) errors.
    #[must_use]
    pub fn precondition(details: impl Into<String>) -> Self {
        Self::Precondition {
            details: details.into(),
        }
    }
}

impl From<serde_json::Error> for HarnessError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for HarnessError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}

impl From<toml::ser::Error> for HarnessError {
    fn from(value: toml::ser::Error) -> Self {
        Self::Serialization {
            context: "toml",
            details: value.to_string(),
        }
    }
}
