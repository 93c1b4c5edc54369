//! `testcase.yaml` model: pools, datasets, snapshots, and the active root.

#![allow(missing_docs)]

use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::errors::{HarnessError, Result};

/// Declared storage layout for one case.
///
/// The active root is a single optional `<pool>/<dataset>` reference, so a
/// topology can never mark more than one dataset as the mounted root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FakeTopology {
    #[serde(default)]
    pub active_root: Option<String>,
    pub pools: Vec<PoolDecl>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolDecl {
    pub name: String,
    #[serde(default)]
    pub datasets: Vec<DatasetDecl>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetDecl {
    /// Name relative to the pool, e.g. `ROOT/ubuntu_1234`.
    pub name: String,
    #[serde(default)]
    pub mountpoint: Option<String>,
    #[serde(default)]
    pub canmount: CanMount,
    #[serde(default)]
    pub bootfs: bool,
    /// Unix seconds of the last boot from this dataset.
    #[serde(default)]
    pub last_used: Option<u64>,
    /// Files created (empty) under the dataset, relative to its root.
    #[serde(default)]
    pub files: Vec<PathBuf>,
    #[serde(default)]
    pub snapshots: Vec<SnapshotDecl>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SnapshotDecl {
    pub name: String,
    /// Unix seconds.
    #[serde(default)]
    pub creation: Option<u64>,
}

/// ZFS `canmount` property.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CanMount {
    #[default]
    On,
    Off,
    Noauto,
}

impl CanMount {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
            Self::Noauto => "noauto",
        }
    }
}

impl FakeTopology {
    /// Read, parse and validate a declaration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|source| HarnessError::io(path, source))?;
        let topology = Self::parse(&raw).map_err(|details| HarnessError::Declaration {
            path: path.to_path_buf(),
            details,
        })?;
        Ok(topology)
    }

    /// Parse and validate declaration text. Errors are human-readable details.
    pub fn parse(raw: &str) -> std::result::Result<Self, String> {
        let topology: Self = serde_yaml::from_str(raw).map_err(|e| e.to_string())?;
        topology.validate()?;
        Ok(topology)
    }

    /// Check structural invariants a mock could not otherwise report faithfully.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.pools.is_empty() {
            return Err("at least one pool must be declared".to_string());
        }

        let mut pool_names = HashSet::new();
        for pool in &self.pools {
            check_name("pool", &pool.name)?;
            if pool.name.contains('/') {
                return Err(format!("pool name {:?} must not contain '/'", pool.name));
            }
            if !pool_names.insert(pool.name.as_str()) {
                return Err(format!("duplicate pool {:?}", pool.name));
            }

            let mut dataset_names = HashSet::new();
            for dataset in &pool.datasets {
                check_name("dataset", &dataset.name)?;
                if dataset.name.starts_with('/') || dataset.name.ends_with('/') {
                    return Err(format!(
                        "dataset {:?} in pool {:?} must be relative to the pool",
                        dataset.name, pool.name
                    ));
                }
                if !dataset_names.insert(dataset.name.as_str()) {
                    return Err(format!(
                        "duplicate dataset {:?} in pool {:?}",
                        dataset.name, pool.name
                    ));
                }

                for file in &dataset.files {
                    let escapes = file.is_absolute()
                        || file
                            .components()
                            .any(|c| !matches!(c, Component::Normal(_)));
                    if escapes || file.as_os_str().is_empty() {
                        return Err(format!(
                            "file {} of {}/{} must be a plain relative path",
                            file.display(),
                            pool.name,
                            dataset.name
                        ));
                    }
                }

                let mut snapshot_names = HashSet::new();
                for snapshot in &dataset.snapshots {
                    check_name("snapshot", &snapshot.name)?;
                    if snapshot.name.contains('/') {
                        return Err(format!(
                            "snapshot name {:?} must not contain '/'",
                            snapshot.name
                        ));
                    }
                    if !snapshot_names.insert(snapshot.name.as_str()) {
                        return Err(format!(
                            "duplicate snapshot {:?} on {}/{}",
                            snapshot.name, pool.name, dataset.name
                        ));
                    }
                }
            }
        }

        if let Some(root) = &self.active_root
            && root.trim().is_empty()
        {
            return Err("active_root must not be empty when present".to_string());
        }

        Ok(())
    }

    /// Resolve `active_root` to its `(pool, dataset)` declaration.
    ///
    /// `None` both when nothing is marked and when the marked dataset is not
    /// declared; the caller decides whether to warn about the latter.
    #[must_use]
    pub fn active_root_dataset(&self) -> Option<(&PoolDecl, &DatasetDecl)> {
        let wanted = self.active_root.as_deref()?;
        let (pool_name, dataset_name) = wanted.split_once('/')?;
        let pool = self.pools.iter().find(|p| p.name == pool_name)?;
        let dataset = pool.datasets.iter().find(|d| d.name == dataset_name)?;
        Some((pool, dataset))
    }

    /// Total number of datasets across all pools.
    #[must_use]
    pub fn dataset_count(&self) -> usize {
        self.pools.iter().map(|p| p.datasets.len()).sum()
    }
}

fn check_name(kind: &str, name: &str) -> std::result::Result<(), String> {
    if name.is_empty() {
        return Err(format!("{kind} name must not be empty"));
    }
    if name.chars().any(char::is_whitespace) || name.contains('@') {
        return Err(format!(
            "{kind} name {name:?} must not contain whitespace or '@'"
        ));
    }
    Ok(())
}
