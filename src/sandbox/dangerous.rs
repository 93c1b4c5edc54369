//! Dangerous mode: temporarily hide the host's secure-boot query binary.
//!
//! Cases in the `no-mokutil` mode exercise the generator's fallback when the
//! query tool is missing entirely. The only way to get there with an unmodified
//! generator is to move the real binary out of the way, so:
//!
//! - the mode is opt-in and requires root;
//! - every hide is serialized behind one process-wide lock;
//! - the original binary is restored when the guard drops, including on error
//!   and unwind;
//! - a backup left by a killed previous run is restored before anything else.

#![allow(missing_docs)]

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, MutexGuard};

use crate::core::errors::{HarnessError, Result};

/// Held for as long as any binary is hidden.
static HIDE_LOCK: Mutex<()> = Mutex::new(());

/// Skip reason when the opt-in flag is absent.
pub const NOT_ENABLED: &str = "dangerous is not set";

/// Backup location for `binary`: `<binary>.bak` in the same directory.
#[must_use]
pub fn backup_path(binary: &Path) -> PathBuf {
    let mut name = binary
        .file_name()
        .map(std::ffi::OsStr::to_os_string)
        .unwrap_or_default();
    name.push(".bak");
    binary.with_file_name(name)
}

/// Opt-in policy for dangerous cases.
#[derive(Debug, Clone)]
pub struct DangerousMode {
    enabled: bool,
    binary: PathBuf,
}

impl DangerousMode {
    #[must_use]
    pub fn new(enabled: bool, binary: impl Into<PathBuf>) -> Self {
        Self {
            enabled,
            binary: binary.into(),
        }
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Whether a dangerous case may run. Refusals are preconditions (skips).
    pub fn admit(&self, is_root: bool) -> Result<()> {
        if !self.enabled {
            return Err(HarnessError::precondition(NOT_ENABLED));
        }
        if !is_root {
            return Err(HarnessError::precondition(format!(
                "dangerous mode renames {} and must run as root",
                self.binary.display()
            )));
        }
        Ok(())
    }

    /// Serialize on the global lock and move the binary aside if present.
    pub fn hide(&self) -> Result<HiddenBinary> {
        let lock = HIDE_LOCK.lock();
        let backup = backup_path(&self.binary);
        let moved = match fs::symlink_metadata(&self.binary) {
            Ok(_) => {
                fs::rename(&self.binary, &backup)
                    .map_err(|source| HarnessError::io(&self.binary, source))?;
                true
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => false,
            Err(source) => return Err(HarnessError::io(&self.binary, source)),
        };
        Ok(HiddenBinary {
            _lock: lock,
            binary: self.binary.clone(),
            backup,
            moved,
        })
    }

    /// Restore a backup a previous, killed run left behind.
    ///
    /// Returns whether anything was restored. A present binary wins over the
    /// backup and nothing is touched.
    pub fn restore_leftover(&self) -> Result<bool> {
        let _lock = HIDE_LOCK.lock();
        let backup = backup_path(&self.binary);
        if !backup.exists() || self.binary.exists() {
            return Ok(false);
        }
        fs::rename(&backup, &self.binary).map_err(|source| HarnessError::io(&backup, source))?;
        Ok(true)
    }
}

/// Whether the current process runs with effective uid 0.
#[must_use]
pub fn running_as_root() -> bool {
    #[cfg(unix)]
    {
        nix::unistd::geteuid().is_root()
    }
    #[cfg(not(unix))]
    {
        false
    }
}

/// Scoped rename. Dropping it puts the binary back and releases the lock.
#[derive(Debug)]
#[must_use = "dropping the guard immediately restores the binary"]
pub struct HiddenBinary {
    _lock: MutexGuard<'static, ()>,
    binary: PathBuf,
    backup: PathBuf,
    moved: bool,
}

impl HiddenBinary {
    /// Whether a binary was actually moved aside.
    #[must_use]
    pub const fn moved(&self) -> bool {
        self.moved
    }

    #[must_use]
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Restore now and report failure. Drop does the same silently.
    pub fn restore(mut self) -> Result<bool> {
        self.put_back()
    }

    fn put_back(&mut self) -> Result<bool> {
        if !self.moved {
            return Ok(false);
        }
        self.moved = false;
        fs::rename(&self.backup, &self.binary)
            .map_err(|source| HarnessError::io(&self.backup, source))?;
        Ok(true)
    }
}

impl Drop for HiddenBinary {
    fn drop(&mut self) {
        if let Err(err) = self.put_back() {
            eprintln!(
                "[ZBH-DANGEROUS] failed to restore {}: {err}",
                self.binary.display()
            );
        }
    }
}
