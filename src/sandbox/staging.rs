//! Stage generator configuration into a sandbox.
//!
//! The generator reads its configuration from a single directory named by the
//! redirection variable. Each declared file is copied from the source root to
//! the same relative location under the sandbox, so the generator never reads
//! host configuration.

#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};

use crate::core::errors::{HarnessError, Result};
use crate::core::paths::is_plain_relative;

/// Copy every `files` entry (relative to `source_root`) into `sandbox`.
///
/// Permissions are preserved. A missing source file means the host lacks the
/// generator installation the run was configured for, which is a precondition
/// failure rather than a generator failure.
pub fn stage(sandbox: &Path, source_root: &Path, files: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut staged = Vec::with_capacity(files.len());
    for relative in files {
        if !is_plain_relative(relative) {
            return Err(HarnessError::InvalidConfig {
                details: format!(
                    "staged file {} must be relative to {} without '..'",
                    relative.display(),
                    source_root.display()
                ),
            });
        }
        let source = source_root.join(relative);
        if !source.is_file() {
            return Err(HarnessError::precondition(format!(
                "generator file {} is not installed",
                source.display()
            )));
        }
        let target = sandbox.join(relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|err| HarnessError::io(parent, err))?;
        }
        fs::copy(&source, &target).map_err(|err| HarnessError::io(&source, err))?;
        staged.push(target);
    }
    Ok(staged)
}
