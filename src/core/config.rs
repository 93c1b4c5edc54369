//! Configuration system: TOML file + env var overrides + smart defaults.

#![allow(missing_docs)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::{HarnessError, Result};
use crate::core::paths::is_plain_relative;

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "zbh.toml";

/// Full harness configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    pub fixtures: FixturesConfig,
    pub generator: GeneratorConfig,
    pub mocks: MocksConfig,
    pub run: RunConfig,
    pub paths: PathsConfig,
}

/// Where test case declarations and references live.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FixturesConfig {
    /// Two-level `<mode>/<case>` tree.
    pub root: PathBuf,
    /// Topology declaration file name inside each case directory.
    pub declaration_file: String,
}

/// How the external generator is invoked and sandboxed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GeneratorConfig {
    pub binary: PathBuf,
    /// Flag preceding the output path argument.
    pub output_flag: String,
    /// Output file name inside the sandbox.
    pub output_name: String,
    /// Privilege emulation wrapper (e.g. `fakeroot`). Empty disables it.
    pub privilege_wrapper: String,
    pub deadline_secs: u64,
    /// Root the staged host configuration files are copied from.
    pub source_root: PathBuf,
    /// Files (relative to `source_root`) copied into every sandbox.
    pub staged_files: Vec<PathBuf>,
    /// Generator source checkout holding the scripts under test.
    pub checkout_root: PathBuf,
    /// Files (relative to `checkout_root`) copied into every sandbox.
    pub checkout_files: Vec<PathBuf>,
    /// Variable pointing the generator at `<sandbox>/etc`. Empty disables it.
    pub sysconfdir_var: String,
}

/// Mock storage and secure-boot tools shadowing the real ones.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MocksConfig {
    /// Directory holding one sub-directory per mocked tool.
    pub dir: PathBuf,
    /// Tools always placed on the search path, in order.
    pub tools: Vec<String>,
    /// Secure-boot query tool, placed first unless the case exercises its absence.
    pub secureboot_tool: String,
    /// Real host binary renamed away in dangerous mode.
    pub host_secureboot_binary: PathBuf,
}

/// Scheduling and run-mode knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunConfig {
    pub parallelism: usize,
    /// How long the metamenu group waits for the bootlist group to start.
    pub phase_grace_ms: u64,
    pub locale: String,
    pub dangerous: bool,
    pub update: bool,
    pub keep_sandboxes: bool,
}

/// Filesystem paths used by zbh.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    pub jsonl_log: PathBuf,
}

impl Default for FixturesConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("testdata/definitions"),
            declaration_file: "testcase.yaml".to_string(),
        }
    }
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("/usr/sbin/grub-mkconfig"),
            output_flag: "-o".to_string(),
            output_name: "grub.cfg".to_string(),
            privilege_wrapper: "fakeroot".to_string(),
            deadline_secs: 10,
            source_root: PathBuf::from("/"),
            staged_files: vec![
                PathBuf::from("etc/grub.d/00_header"),
                PathBuf::from("etc/default/grub"),
            ],
            checkout_root: PathBuf::from("."),
            checkout_files: vec![PathBuf::from("etc/grub.d/15_linux_zfs")],
            sysconfdir_var: "GRUB_SYSCONFDIR".to_string(),
        }
    }
}

impl Default for MocksConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("mocks"),
            tools: vec!["zpool".to_string(), "zfs".to_string(), "date".to_string()],
            secureboot_tool: "mokutil".to_string(),
            host_secureboot_binary: PathBuf::from("/usr/bin/mokutil"),
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            parallelism: std::thread::available_parallelism().map_or(2, std::num::NonZeroUsize::get),
            phase_grace_ms: 1_000,
            locale: "C".to_string(),
            dangerous: false,
            update: false,
            keep_sandboxes: false,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            config_file: PathBuf::from(DEFAULT_CONFIG_FILE),
            jsonl_log: env::temp_dir().join("zbh").join("run.jsonl"),
        }
    }
}

impl GeneratorConfig {
    #[must_use]
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    /// Wrapper program, if privilege emulation is enabled.
    #[must_use]
    pub fn wrapper(&self) -> Option<&str> {
        let trimmed = self.privilege_wrapper.trim();
        (!trimmed.is_empty()).then_some(trimmed)
    }

    /// Redirection variable, if the generator honors one.
    #[must_use]
    pub fn sysconfdir_var(&self) -> Option<&str> {
        let trimmed = self.sysconfdir_var.trim();
        (!trimmed.is_empty()).then_some(trimmed)
    }
}

impl MocksConfig {
    /// Directory holding the mock for `tool`.
    #[must_use]
    pub fn tool_dir(&self, tool: &str) -> PathBuf {
        self.dir.join(tool)
    }
}

impl RunConfig {
    #[must_use]
    pub fn phase_grace(&self) -> Duration {
        Duration::from_millis(self.phase_grace_ms)
    }
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw =
                fs::read_to_string(&path_buf).map_err(|source| HarnessError::io(&path_buf, source))?;
            let parsed: Self = toml::from_str(&raw)?;
            parsed
        } else if is_explicit_path {
            return Err(HarnessError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides_from(env_var)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Deterministic hash of the effective config for the run log.
    ///
    /// FNV-1a over the canonical JSON form, stable across processes.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("ZBH_FIXTURES_ROOT") {
            self.fixtures.root = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("ZBH_GENERATOR_BINARY") {
            self.generator.binary = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("ZBH_GENERATOR_PRIVILEGE_WRAPPER") {
            self.generator.privilege_wrapper = raw;
        }
        if let Some(raw) = lookup("ZBH_GENERATOR_DEADLINE_SECS") {
            self.generator.deadline_secs = parse_env("ZBH_GENERATOR_DEADLINE_SECS", &raw)?;
        }
        if let Some(raw) = lookup("ZBH_GENERATOR_CHECKOUT_ROOT") {
            self.generator.checkout_root = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("ZBH_MOCKS_DIR") {
            self.mocks.dir = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("ZBH_RUN_PARALLELISM") {
            self.run.parallelism = parse_env("ZBH_RUN_PARALLELISM", &raw)?;
        }
        if let Some(raw) = lookup("ZBH_RUN_PHASE_GRACE_MS") {
            self.run.phase_grace_ms = parse_env("ZBH_RUN_PHASE_GRACE_MS", &raw)?;
        }
        if let Some(raw) = lookup("ZBH_RUN_DANGEROUS") {
            self.run.dangerous = parse_env("ZBH_RUN_DANGEROUS", &raw)?;
        }
        if let Some(raw) = lookup("ZBH_RUN_UPDATE") {
            self.run.update = parse_env("ZBH_RUN_UPDATE", &raw)?;
        }
        if let Some(raw) = lookup("ZBH_PATHS_JSONL_LOG") {
            self.paths.jsonl_log = PathBuf::from(raw);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.fixtures.declaration_file.trim().is_empty() {
            return Err(HarnessError::InvalidConfig {
                details: "fixtures.declaration_file must not be empty".to_string(),
            });
        }
        if self.generator.deadline_secs == 0 {
            return Err(HarnessError::InvalidConfig {
                details: "generator.deadline_secs must be >= 1".to_string(),
            });
        }
        if self.generator.output_name.trim().is_empty()
            || self.generator.output_name.contains('/')
        {
            return Err(HarnessError::InvalidConfig {
                details: format!(
                    "generator.output_name must be a plain file name, got {:?}",
                    self.generator.output_name
                ),
            });
        }
        let staged = [
            ("staged_files", &self.generator.staged_files),
            ("checkout_files", &self.generator.checkout_files),
        ];
        for (key, files) in staged {
            if let Some(bad) = files.iter().find(|f| !is_plain_relative(f)) {
                return Err(HarnessError::InvalidConfig {
                    details: format!(
                        "generator.{key} entries must be relative without '..', got {}",
                        bad.display()
                    ),
                });
            }
        }
        if self.run.parallelism == 0 {
            return Err(HarnessError::InvalidConfig {
                details: "run.parallelism must be >= 1".to_string(),
            });
        }
        if self.run.locale.trim().is_empty() {
            return Err(HarnessError::InvalidConfig {
                details: "run.locale must not be empty".to_string(),
            });
        }
        if self.mocks.secureboot_tool.trim().is_empty() {
            return Err(HarnessError::InvalidConfig {
                details: "mocks.secureboot_tool must not be empty".to_string(),
            });
        }
        if self.mocks.tools.iter().any(|t| t.trim().is_empty()) {
            return Err(HarnessError::InvalidConfig {
                details: "mocks.tools entries must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn parse_env<T>(name: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|error| HarnessError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: {error}"),
        })
}
