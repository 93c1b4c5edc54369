//! Case catalog: discovers `<mode>/<case>/` fixture directories.
//!
//! The first level names the secure-boot mode a case runs under, the second
//! level the case itself. Every case gets a `full_name` derived from its
//! relative path, which the topology builder uses to namespace pool names so
//! concurrently running cases never collide.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::core::errors::{HarnessError, Result};
use crate::core::paths::resolve_absolute_path;

/// Separator replacement used when flattening a relative path into a name.
pub const NAME_SEPARATOR: char = '_';

/// One discovered test case. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestCase {
    /// First-level directory name (secure-boot mode).
    pub mode: String,
    /// Second-level directory name.
    pub name: String,
    /// `<mode>/<case>`, always `/`-separated. Also the catalog key.
    pub relative_path: String,
    /// Absolute fixture directory.
    pub path: PathBuf,
    /// `relative_path` with separators replaced by `_`.
    pub full_name: String,
}

impl TestCase {
    #[must_use]
    pub fn new(root: &Path, mode: &str, name: &str) -> Self {
        let relative_path = format!("{mode}/{name}");
        let full_name = relative_path.replace('/', &NAME_SEPARATOR.to_string());
        Self {
            mode: mode.to_string(),
            name: name.to_string(),
            path: root.join(mode).join(name),
            relative_path,
            full_name,
        }
    }

    /// Path of a file inside the case directory (declaration or reference).
    #[must_use]
    pub fn file(&self, file_name: &str) -> PathBuf {
        self.path.join(file_name)
    }
}

/// Discover every case under `root`.
///
/// Fails if `root` or any mode directory cannot be listed. Plain files and
/// hidden entries are ignored at both levels.
pub fn discover(root: &Path) -> Result<BTreeMap<String, TestCase>> {
    let root = resolve_absolute_path(root);
    let mut cases = BTreeMap::new();

    for mode in list_subdirs(&root)? {
        let mode_dir = root.join(&mode);
        for name in list_subdirs(&mode_dir)? {
            let case = TestCase::new(&root, &mode, &name);
            cases.insert(case.relative_path.clone(), case);
        }
    }

    Ok(cases)
}

/// Keep only cases whose key contains `filter`. `None` keeps everything.
#[must_use]
pub fn select(
    cases: BTreeMap<String, TestCase>,
    filter: Option<&str>,
) -> BTreeMap<String, TestCase> {
    match filter.map(str::trim).filter(|f| !f.is_empty()) {
        None => cases,
        Some(needle) => cases
            .into_iter()
            .filter(|(key, _)| key.contains(needle))
            .collect(),
    }
}

fn list_subdirs(dir: &Path) -> Result<Vec<String>> {
    let entries = fs::read_dir(dir).map_err(|err| HarnessError::Catalog {
        path: dir.to_path_buf(),
        details: err.to_string(),
    })?;

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| HarnessError::Catalog {
            path: dir.to_path_buf(),
            details: err.to_string(),
        })?;
        // Follows symlinks so a linked case directory is still a case.
        let is_dir = fs::metadata(entry.path()).is_ok_and(|m| m.is_dir());
        if !is_dir {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        names.push(name);
    }
    names.sort();
    Ok(names)
}
