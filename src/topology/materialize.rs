//! Write a parsed topology into a sandbox so the mock `zfs`/`zpool` tools
//! report exactly that layout.
//!
//! Layout produced under the sandbox root:
//!
//! ```text
//! zpool-list           one namespaced pool per line
//! zfs-list             name \t mountpoint \t canmount \t bootfs \t last_used
//! zfs-snapshots        dataset@snapshot \t creation
//! topology.json        the full namespaced topology
//! pools/<pool>/<ds>/   dataset content (declared files, empty)
//! ```

#![allow(missing_docs)]

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::core::errors::{HarnessError, Result};
use crate::topology::declaration::FakeTopology;

pub const ZPOOL_LIST_FILE: &str = "zpool-list";
pub const ZFS_LIST_FILE: &str = "zfs-list";
pub const ZFS_SNAPSHOTS_FILE: &str = "zfs-snapshots";
pub const TOPOLOGY_JSON_FILE: &str = "topology.json";
pub const POOLS_DIR: &str = "pools";

/// Placeholder for unset property values, as `zfs get` prints them.
const UNSET: &str = "-";

/// Result of materializing a topology.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Materialized {
    /// Namespaced `<pool>/<dataset>` of the active root, if one resolved.
    pub root_dataset: Option<String>,
    /// `active_root` value that named no declared dataset.
    pub dangling_root: Option<String>,
    pub pool_names: Vec<String>,
    pub dataset_count: usize,
}

#[derive(Debug, Serialize)]
struct PoolRecord {
    name: String,
    declared_name: String,
    datasets: Vec<DatasetRecord>,
}

#[derive(Debug, Serialize)]
struct DatasetRecord {
    name: String,
    mountpoint: Option<String>,
    canmount: &'static str,
    bootfs: bool,
    last_used: Option<u64>,
    content_dir: PathBuf,
    snapshots: Vec<SnapshotRecord>,
}

#[derive(Debug, Serialize)]
struct SnapshotRecord {
    name: String,
    creation: Option<u64>,
}

#[derive(Debug, Serialize)]
struct TopologyRecord<'a> {
    unique_name: &'a str,
    current_root_dataset: Option<&'a str>,
    pools: Vec<PoolRecord>,
}

/// Namespaced pool name for a case.
#[must_use]
pub fn namespaced_pool(pool: &str, unique_name: &str) -> String {
    format!("{pool}-{unique_name}")
}

/// Materialize `topology` under `sandbox`, namespacing every pool with `unique_name`.
pub fn materialize(
    topology: &FakeTopology,
    sandbox: &Path,
    unique_name: &str,
) -> Result<Materialized> {
    let root_dataset = topology.active_root_dataset().map(|(pool, dataset)| {
        format!("{}/{}", namespaced_pool(&pool.name, unique_name), dataset.name)
    });
    let dangling_root = match (&topology.active_root, &root_dataset) {
        (Some(declared), None) => Some(declared.clone()),
        _ => None,
    };

    let mut zpool_list = String::new();
    let mut zfs_list = String::new();
    let mut zfs_snapshots = String::new();
    let mut pool_records = Vec::with_capacity(topology.pools.len());

    for pool in &topology.pools {
        let pool_name = namespaced_pool(&pool.name, unique_name);
        let _ = writeln!(zpool_list, "{pool_name}");
        // The pool's own root dataset is always listed, as `zfs list` does.
        let _ = writeln!(zfs_list, "{pool_name}\tnone\toff\t{UNSET}\t{UNSET}");

        let pool_dir = sandbox.join(POOLS_DIR).join(&pool_name);
        create_dir(&pool_dir)?;

        let mut dataset_records = Vec::with_capacity(pool.datasets.len());
        for dataset in &pool.datasets {
            let full_name = format!("{pool_name}/{}", dataset.name);
            let _ = writeln!(
                zfs_list,
                "{full_name}\t{}\t{}\t{}\t{}",
                dataset.mountpoint.as_deref().unwrap_or("none"),
                dataset.canmount.as_str(),
                if dataset.bootfs { "yes" } else { UNSET },
                dataset
                    .last_used
                    .map_or_else(|| UNSET.to_string(), |t| t.to_string()),
            );

            let content_dir = pool_dir.join(&dataset.name);
            create_dir(&content_dir)?;
            for file in &dataset.files {
                let target = content_dir.join(file);
                if let Some(parent) = target.parent() {
                    create_dir(parent)?;
                }
                fs::write(&target, b"").map_err(|source| HarnessError::io(&target, source))?;
            }

            let mut snapshot_records = Vec::with_capacity(dataset.snapshots.len());
            for snapshot in &dataset.snapshots {
                let _ = writeln!(
                    zfs_snapshots,
                    "{full_name}@{}\t{}",
                    snapshot.name,
                    snapshot
                        .creation
                        .map_or_else(|| UNSET.to_string(), |t| t.to_string()),
                );
                snapshot_records.push(SnapshotRecord {
                    name: snapshot.name.clone(),
                    creation: snapshot.creation,
                });
            }

            dataset_records.push(DatasetRecord {
                name: full_name,
                mountpoint: dataset.mountpoint.clone(),
                canmount: dataset.canmount.as_str(),
                bootfs: dataset.bootfs,
                last_used: dataset.last_used,
                content_dir,
                snapshots: snapshot_records,
            });
        }

        pool_records.push(PoolRecord {
            name: pool_name,
            declared_name: pool.name.clone(),
            datasets: dataset_records,
        });
    }

    write_file(&sandbox.join(ZPOOL_LIST_FILE), zpool_list.as_bytes())?;
    write_file(&sandbox.join(ZFS_LIST_FILE), zfs_list.as_bytes())?;
    write_file(&sandbox.join(ZFS_SNAPSHOTS_FILE), zfs_snapshots.as_bytes())?;

    let pool_names = pool_records.iter().map(|p| p.name.clone()).collect();
    let record = TopologyRecord {
        unique_name,
        current_root_dataset: root_dataset.as_deref(),
        pools: pool_records,
    };
    let json = serde_json::to_vec_pretty(&record)?;
    write_file(&sandbox.join(TOPOLOGY_JSON_FILE), &json)?;

    Ok(Materialized {
        root_dataset,
        dangling_root,
        pool_names,
        dataset_count: topology.dataset_count(),
    })
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|source| HarnessError::io(path, source))
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    fs::write(path, bytes).map_err(|source| HarnessError::io(path, source))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_pools() -> FakeTopology {
        FakeTopology::parse(
            r"
pools:
  - name: rpool
    datasets:
      - name: ROOT/ubuntu_1234
        mountpoint: /
        files: [boot/vmlinuz-5.0.0-13-generic]
        snapshots:
          - name: autozsys_abc
            creation: 1555555000
  - name: rpool2
    datasets:
      - name: ROOT/debian_5678
        mountpoint: /
        canmount: noauto
        last_used: 1555555555
",
        )
        .expect("parse")
    }

    #[test]
    fn writes_namespaced_listings() {
        let sandbox = tempfile::tempdir().unwrap();
        let result = materialize(&two_pools(), sandbox.path(), "enabled_two_pools").unwrap();

        assert_eq!(
            result.pool_names,
            vec!["rpool-enabled_two_pools", "rpool2-enabled_two_pools"]
        );
        assert_eq!(result.dataset_count, 2);
        assert_eq!(result.root_dataset, None);
        assert_eq!(result.dangling_root, None);

        let zpools = fs::read_to_string(sandbox.path().join(ZPOOL_LIST_FILE)).unwrap();
        assert_eq!(zpools, "rpool-enabled_two_pools\nrpool2-enabled_two_pools\n");

        let zfs = fs::read_to_string(sandbox.path().join(ZFS_LIST_FILE)).unwrap();
        let lines: Vec<&str> = zfs.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(
            lines[1],
            "rpool-enabled_two_pools/ROOT/ubuntu_1234\t/\ton\t-\t-"
        );
        assert_eq!(
            lines[3],
            "rpool2-enabled_two_pools/ROOT/debian_5678\t/\tnoauto\t-\t1555555555"
        );

        let snaps = fs::read_to_string(sandbox.path().join(ZFS_SNAPSHOTS_FILE)).unwrap();
        assert_eq!(
            snaps,
            "rpool-enabled_two_pools/ROOT/ubuntu_1234@autozsys_abc\t1555555000\n"
        );
    }

    #[test]
    fn creates_dataset_content() {
        let sandbox = tempfile::tempdir().unwrap();
        materialize(&two_pools(), sandbox.path(), "case").unwrap();
        let kernel = sandbox
            .path()
            .join(POOLS_DIR)
            .join("rpool-case/ROOT/ubuntu_1234/boot/vmlinuz-5.0.0-13-generic");
        assert!(kernel.is_file());
    }

    #[test]
    fn returns_namespaced_active_root() {
        let mut topo = two_pools();
        topo.active_root = Some("rpool2/ROOT/debian_5678".to_string());
        let sandbox = tempfile::tempdir().unwrap();
        let result = materialize(&topo, sandbox.path(), "disabled_x").unwrap();
        assert_eq!(
            result.root_dataset.as_deref(),
            Some("rpool2-disabled_x/ROOT/debian_5678")
        );

        let json: serde_json::Value = serde_json::from_slice(
            &fs::read(sandbox.path().join(TOPOLOGY_JSON_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(
            json["current_root_dataset"],
            "rpool2-disabled_x/ROOT/debian_5678"
        );
        assert_eq!(json["pools"][1]["declared_name"], "rpool2");
    }

    #[test]
    fn dangling_active_root_is_reported_not_fatal() {
        let mut topo = two_pools();
        topo.active_root = Some("rpool/ROOT/missing".to_string());
        let sandbox = tempfile::tempdir().unwrap();
        let result = materialize(&topo, sandbox.path(), "case").unwrap();
        assert_eq!(result.root_dataset, None);
        assert_eq!(result.dangling_root.as_deref(), Some("rpool/ROOT/missing"));
    }

    #[test]
    fn distinct_unique_names_never_collide() {
        let sandbox = tempfile::tempdir().unwrap();
        let a = materialize(&two_pools(), sandbox.path(), "enabled_a").unwrap();
        let b = materialize(&two_pools(), sandbox.path(), "disabled_a").unwrap();
        for name in &a.pool_names {
            assert!(!b.pool_names.contains(name));
        }
    }
}
