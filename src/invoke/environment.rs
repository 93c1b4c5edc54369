//! Environment composer: the exact variable set one generator run sees.
//!
//! Optional keys are omitted rather than set to empty: the generator and its
//! mocks branch on presence, not on value.

#![allow(missing_docs)]

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Serialize;

use crate::core::errors::HarnessError;

pub const VAR_PHASE: &str = "GRUB_LINUX_ZFS_TEST";
pub const VAR_INPUT: &str = "GRUB_LINUX_ZFS_TEST_INPUT";
pub const VAR_OUTPUT: &str = "GRUB_LINUX_ZFS_TEST_OUTPUT";
pub const VAR_POOL_DIR: &str = "TEST_POOL_DIR";
pub const VAR_SECUREBOOT: &str = "TEST_MOKUTIL_SECUREBOOT";
pub const VAR_ROOT_DATASET: &str = "TEST_MOCKZFS_CURRENT_ROOT_DATASET";
pub const VAR_LOCALE: &str = "LC_ALL";
pub const VAR_PATH: &str = "PATH";

/// Every key the composer owns. Host values for these never leak through.
pub const MANAGED_VARS: [&str; 8] = [
    VAR_PHASE,
    VAR_INPUT,
    VAR_OUTPUT,
    VAR_POOL_DIR,
    VAR_SECUREBOOT,
    VAR_ROOT_DATASET,
    VAR_LOCALE,
    VAR_PATH,
];

/// One of the two sequential generator invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Pools → boot list.
    Bootlist,
    /// Boot list → menu metadata.
    Metamenu,
}

impl Phase {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bootlist => "bootlist",
            Self::Metamenu => "metamenu",
        }
    }

    /// Reference file name inside a case directory.
    #[must_use]
    pub const fn reference_name(self) -> &'static str {
        match self {
            Self::Bootlist => "bootlist",
            Self::Metamenu => "menumeta",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Secure-boot state a case runs under, named by its mode directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SecureBoot {
    Enabled,
    Disabled,
    /// No query tool on the search path at all. Dangerous mode.
    NoMokutil,
}

impl SecureBoot {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
            Self::NoMokutil => "no-mokutil",
        }
    }

    /// Value for the mock override variable, `None` when the tool is absent.
    #[must_use]
    pub const fn mock_state(self) -> Option<&'static str> {
        match self {
            Self::Enabled | Self::Disabled => Some(self.as_str()),
            Self::NoMokutil => None,
        }
    }

    #[must_use]
    pub const fn is_dangerous(self) -> bool {
        matches!(self, Self::NoMokutil)
    }
}

impl FromStr for SecureBoot {
    type Err = HarnessError;

    fn from_str(mode: &str) -> Result<Self, Self::Err> {
        match mode {
            "enabled" => Ok(Self::Enabled),
            "disabled" => Ok(Self::Disabled),
            "no-mokutil" => Ok(Self::NoMokutil),
            other => Err(HarnessError::UnknownMode {
                mode: other.to_string(),
            }),
        }
    }
}

/// Ordered variable bag. Setting an existing key replaces it in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvBag {
    vars: Vec<(OsString, OsString)>,
}

impl EnvBag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<OsString>, value: impl Into<OsString>) {
        let key = key.into();
        let value = value.into();
        if let Some(slot) = self.vars.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.vars.push((key, value));
        }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&OsStr> {
        self.vars
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_os_str())
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OsStr, &OsStr)> {
        self.vars.iter().map(|(k, v)| (k.as_os_str(), v.as_os_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

/// Everything the composer needs for one invocation.
#[derive(Debug, Clone)]
pub struct EnvRequest<'a> {
    pub phase: Phase,
    pub sandbox: &'a Path,
    pub input: Option<&'a Path>,
    pub output: &'a Path,
    pub secure_boot: SecureBoot,
    pub root_dataset: Option<&'a str>,
    /// Mock tool directories, searched before the host path, in order.
    pub mock_dirs: &'a [PathBuf],
    /// Mock secure-boot tool directory, prepended unless the tool is absent.
    pub secureboot_mock_dir: &'a Path,
    pub locale: &'a str,
    pub sysconfdir_var: Option<&'a str>,
}

/// Compose the environment for one invocation on top of `inherited`.
///
/// `inherited` is usually the host environment; every managed key (and the
/// redirection variable) is dropped from it before the composed values are set.
pub fn compose<I, K, V>(request: &EnvRequest<'_>, inherited: I) -> EnvBag
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<OsString>,
    V: Into<OsString>,
{
    let mut bag = EnvBag::new();
    let mut host_path = None;
    for (key, value) in inherited {
        let key: OsString = key.into();
        let value: OsString = value.into();
        if key == VAR_PATH {
            host_path = Some(value);
            continue;
        }
        let managed = MANAGED_VARS.iter().any(|m| key == *m)
            || request.sysconfdir_var.is_some_and(|v| key == v);
        if !managed {
            bag.set(key, value);
        }
    }

    bag.set(VAR_PATH, search_path(request, host_path.as_deref()));
    bag.set(VAR_LOCALE, request.locale);
    bag.set(VAR_POOL_DIR, request.sandbox.as_os_str());
    bag.set(VAR_PHASE, request.phase.as_str());
    if let Some(input) = request.input {
        bag.set(VAR_INPUT, input.as_os_str());
    }
    bag.set(VAR_OUTPUT, request.output.as_os_str());
    if let Some(state) = request.secure_boot.mock_state() {
        bag.set(VAR_SECUREBOOT, state);
    }
    if let Some(dataset) = request.root_dataset {
        bag.set(VAR_ROOT_DATASET, dataset);
    }
    if let Some(var) = request.sysconfdir_var {
        bag.set(var, request.sandbox.join("etc").into_os_string());
    }
    bag
}

/// Mock directories first, then the host search path.
fn search_path(request: &EnvRequest<'_>, host_path: Option<&OsStr>) -> OsString {
    let mut dirs: Vec<PathBuf> = Vec::with_capacity(request.mock_dirs.len() + 1);
    if !request.secure_boot.is_dangerous() {
        dirs.push(request.secureboot_mock_dir.to_path_buf());
    }
    dirs.extend(request.mock_dirs.iter().cloned());
    if let Some(host) = host_path {
        dirs.extend(std::env::split_paths(host));
    }
    // Directories containing the separator cannot be expressed; join_paths
    // rejects them and the mock dirs alone are used instead.
    std::env::join_paths(&dirs).unwrap_or_else(|_| {
        std::env::join_paths(
            dirs.iter()
                .filter(|d| !d.to_string_lossy().contains(':')),
        )
        .unwrap_or_default()
    })
}
