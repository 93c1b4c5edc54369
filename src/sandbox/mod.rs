//! Per-case sandbox directories, generator staging, and the dangerous-mode guard.

#![allow(missing_docs)]

pub mod dangerous;
pub mod staging;

use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::core::errors::{HarnessError, Result};
use crate::golden::SANDBOX_PREFIX;

/// Isolated temporary directory for one case and phase.
///
/// Removed on drop unless created with `keep`, in which case the directory is
/// left behind for inspection.
#[derive(Debug)]
pub struct Sandbox {
    dir: Option<TempDir>,
    path: PathBuf,
    keep: bool,
}

impl Sandbox {
    /// Create a sandbox under the system temp directory.
    pub fn create(keep: bool) -> Result<Self> {
        Self::create_in(&std::env::temp_dir(), keep)
    }

    /// Create a sandbox under `parent`.
    pub fn create_in(parent: &Path, keep: bool) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(SANDBOX_PREFIX)
            .tempdir_in(parent)
            .map_err(|source| HarnessError::io(parent, source))?;
        let path = dir.path().to_path_buf();
        Ok(Self {
            dir: Some(dir),
            path,
            keep,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of `name` inside the sandbox.
    #[must_use]
    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Whether the directory survives this handle.
    #[must_use]
    pub const fn is_kept(&self) -> bool {
        self.keep
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if self.keep
            && let Some(dir) = self.dir.take()
        {
            // Forgetting the handle skips its cleanup.
            std::mem::forget(dir);
        }
    }
}
