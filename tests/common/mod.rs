#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use zfs_bootmenu_harness::core::config::Config;
use zfs_bootmenu_harness::logger::RunLog;
use zfs_bootmenu_harness::orchestrate::Harness;

/// Stand-in generator. Reads the mocks the same way the real script does and
/// writes one tab-separated line per bootable dataset (bootlist phase), or a
/// count plus one menu entry per input line (metamenu phase).
const GENERATOR: &str = r#"#!/bin/sh
set -eu
out=""
while [ $# -gt 0 ]; do
  case "$1" in
    -o) out="$2"; shift 2 ;;
    *) shift ;;
  esac
done
if zpool list | grep -q '^silent-'; then
  exit 0
fi
[ -n "$out" ] && : > "$out"

if zpool list | grep -q '^broken-'; then
  echo "partial output"
  echo "cannot parse pool broken" >&2
  exit 3
fi
if zpool list | grep -q '^hang-'; then
  if [ -n "${ZBH_TEST_STARTED:-}" ]; then
    : > "$ZBH_TEST_STARTED"
  fi
  sleep 30
fi

case "$GRUB_LINUX_ZFS_TEST" in
  bootlist)
    if command -v mokutil >/dev/null 2>&1; then
      case "$(mokutil --sb-state)" in
        *enabled*) marker="secureboot" ;;
        *) marker="-" ;;
      esac
    else
      marker="no-mokutil"
    fi
    root="${TEST_MOCKZFS_CURRENT_ROOT_DATASET:-}"
    tab="$(printf '\t')"
    zfs list | while IFS="$tab" read -r name mountpoint canmount bootfs last_used; do
      [ "$mountpoint" = "/" ] || continue
      current="-"
      [ "$name" = "$root" ] && current="current"
      printf '%s\t%s\t%s\t%s\t%s\n' "$name" "$TEST_POOL_DIR/pools/$name" "$marker" "$current" "$(date +%s)"
    done > "$GRUB_LINUX_ZFS_TEST_OUTPUT"
    if [ -n "${ZBH_TEST_HOST_MOKUTIL:-}" ]; then
      if [ -e "$ZBH_TEST_HOST_MOKUTIL" ]; then
        echo "host-mokutil present" >> "$GRUB_LINUX_ZFS_TEST_OUTPUT"
      else
        echo "host-mokutil hidden" >> "$GRUB_LINUX_ZFS_TEST_OUTPUT"
      fi
    fi
    ;;
  metamenu)
    count="$(grep -c "$(printf '\t')" "$GRUB_LINUX_ZFS_TEST_INPUT" || true)"
    {
      echo "entries $count"
      grep "$(printf '\t')" "$GRUB_LINUX_ZFS_TEST_INPUT" | cut -f1 | sed 's/^/menuentry /'
    } > "$GRUB_LINUX_ZFS_TEST_OUTPUT"
    ;;
  *)
    echo "unknown phase" >&2
    exit 2
    ;;
esac
"#;

const MOCK_ZPOOL: &str = "#!/bin/sh\ncat \"$TEST_POOL_DIR/zpool-list\"\n";
const MOCK_ZFS: &str = "#!/bin/sh\ncat \"$TEST_POOL_DIR/zfs-list\"\n";
const MOCK_DATE: &str = "#!/bin/sh\necho 1555555555\n";
const MOCK_MOKUTIL: &str = "#!/bin/sh\necho \"SecureBoot ${TEST_MOKUTIL_SECUREBOOT:-unknown}\"\n";

/// Declaration for scenario A: one pool, one dataset, marked active root.
pub const ONE_POOL_ACTIVE: &str = r"
active_root: rpool/ROOT/ubuntu_1234
pools:
  - name: rpool
    datasets:
      - name: ROOT/ubuntu_1234
        mountpoint: /
        files: [boot/vmlinuz-5.0.0-13-generic]
";

/// Declaration for scenario B: two pools, one dataset each, no active root.
pub const TWO_POOLS: &str = r"
pools:
  - name: rpool
    datasets:
      - name: ROOT/ubuntu_1234
        mountpoint: /
  - name: rpool2
    datasets:
      - name: ROOT/debian_5678
        mountpoint: /
        last_used: 1555555000
";

pub const BROKEN_POOL: &str = r"
pools:
  - name: broken
    datasets:
      - name: ROOT/x
        mountpoint: /
";

/// The stand-in touches `$ZBH_TEST_STARTED` (when set) and then sleeps.
pub const HANGING_POOL: &str = r"
pools:
  - name: hang
    datasets:
      - name: ROOT/x
        mountpoint: /
";

/// The stand-in exits 0 without writing its output.
pub const SILENT_POOL: &str = r"
pools:
  - name: silent
    datasets:
      - name: ROOT/x
        mountpoint: /
";

/// `active_root` names a dataset that is not declared.
pub const DANGLING_ROOT: &str = r"
active_root: rpool/ROOT/gone
pools:
  - name: rpool
    datasets:
      - name: ROOT/ubuntu_1234
        mountpoint: /
";

/// A fixture tree, mock directory, and stand-in generator in one temp dir.
pub struct Workspace {
    pub root: tempfile::TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        let root = tempfile::tempdir().expect("create workspace");
        let ws = Self { root };
        fs::create_dir_all(ws.fixtures()).expect("create fixtures");
        write_script(&ws.generator(), GENERATOR);
        write_script(&ws.mocks().join("zpool/zpool"), MOCK_ZPOOL);
        write_script(&ws.mocks().join("zfs/zfs"), MOCK_ZFS);
        write_script(&ws.mocks().join("date/date"), MOCK_DATE);
        write_script(&ws.mocks().join("mokutil/mokutil"), MOCK_MOKUTIL);
        ws
    }

    pub fn path(&self) -> &Path {
        self.root.path()
    }

    pub fn fixtures(&self) -> PathBuf {
        self.path().join("definitions")
    }

    pub fn mocks(&self) -> PathBuf {
        self.path().join("mocks")
    }

    pub fn generator(&self) -> PathBuf {
        self.path().join("bin/grub-mkconfig")
    }

    pub fn log_path(&self) -> PathBuf {
        self.path().join("run.jsonl")
    }

    /// Write `<mode>/<name>/testcase.yaml` and return the case directory.
    pub fn add_case(&self, mode: &str, name: &str, declaration: &str) -> PathBuf {
        let dir = self.fixtures().join(mode).join(name);
        fs::create_dir_all(&dir).expect("create case dir");
        fs::write(dir.join("testcase.yaml"), declaration).expect("write declaration");
        dir
    }

    pub fn reference(&self, case: &str, file: &str) -> String {
        fs::read_to_string(self.fixtures().join(case).join(file)).expect("read reference")
    }

    pub fn write_reference(&self, case: &str, file: &str, content: &str) {
        fs::write(self.fixtures().join(case).join(file), content).expect("write reference");
    }

    /// Configuration pointing every path at this workspace. The generator is
    /// run through `sh` so the script never needs to be exec'd directly.
    pub fn config(&self) -> Config {
        let mut config = Config::default();
        config.fixtures.root = self.fixtures();
        config.generator.binary = self.generator();
        config.generator.privilege_wrapper = "sh".to_string();
        config.generator.deadline_secs = 10;
        config.generator.staged_files = Vec::new();
        config.generator.checkout_files = Vec::new();
        config.mocks.dir = self.mocks();
        config.mocks.host_secureboot_binary = self.path().join("host-bin/mokutil");
        config.run.parallelism = 4;
        config.run.phase_grace_ms = 200;
        config.paths.jsonl_log = self.log_path();
        config
    }

    pub fn harness(&self, config: Config) -> Harness {
        let log = Arc::new(RunLog::open(&config.paths.jsonl_log));
        Harness::new(config, log)
            .expect("build harness")
            .with_host_env(std::env::vars_os())
    }

    /// Host environment plus `extra`, for handing to `Harness::with_host_env`.
    pub fn host_env_with(
        &self,
        extra: &[(&str, &Path)],
    ) -> Vec<(std::ffi::OsString, std::ffi::OsString)> {
        std::env::vars_os()
            .chain(
                extra
                    .iter()
                    .map(|(k, v)| ((*k).into(), v.as_os_str().to_owned())),
            )
            .collect()
    }

    /// Parsed lines of the run log.
    pub fn log_events(&self) -> Vec<serde_json::Value> {
        fs::read_to_string(self.log_path())
            .unwrap_or_default()
            .lines()
            .map(|line| serde_json::from_str(line).expect("valid log line"))
            .collect()
    }
}

pub fn write_script(path: &Path, body: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create script dir");
    }
    fs::write(path, body).expect("write script");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).expect("chmod script");
    }
}

pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub log_path: PathBuf,
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Poll until `path` exists; panic after `timeout`.
pub fn wait_for_file(path: &Path, timeout: std::time::Duration) {
    let start = std::time::Instant::now();
    while !path.exists() {
        assert!(
            start.elapsed() < timeout,
            "{} did not appear within {timeout:?}",
            path.display()
        );
        std::thread::sleep(std::time::Duration::from_millis(20));
    }
}

pub fn resolve_bin_path() -> PathBuf {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_zbh") {
        return PathBuf::from(path);
    }

    let exe_name = if cfg!(windows) { "zbh.exe" } else { "zbh" };
    let fallback = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
        .and_then(|deps| deps.parent().map(PathBuf::from))
        .map(|debug_dir| debug_dir.join(exe_name));

    match fallback {
        Some(path) if path.exists() => path,
        _ => panic!("unable to resolve zbh binary path for integration test"),
    }
}

/// Run the `zbh` binary from `cwd`, keeping a transcript for post-mortems.
pub fn run_cli_case(case_name: &str, cwd: &Path, args: &[&str]) -> CmdResult {
    let root = std::env::temp_dir().join("zbh-test-logs");
    fs::create_dir_all(&root).expect("create temp test log dir");

    let log_path = root.join(format!("{}-{}.log", sanitize(case_name), now_millis()));
    let bin_path = resolve_bin_path();

    let output = Command::new(&bin_path)
        .args(args)
        .current_dir(cwd)
        .env("RUST_BACKTRACE", "1")
        .env_remove("ZBH_OUTPUT_FORMAT")
        .output()
        .expect("execute zbh command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    let mut log_content = String::new();
    log_content.push_str(&format!("case={case_name}\n"));
    log_content.push_str(&format!("bin={}\n", bin_path.display()));
    log_content.push_str(&format!("args={args:?}\n"));
    log_content.push_str(&format!("status={}\n", output.status));
    log_content.push_str("----- stdout -----\n");
    log_content.push_str(&stdout);
    log_content.push('\n');
    log_content.push_str("----- stderr -----\n");
    log_content.push_str(&stderr);
    log_content.push('\n');
    fs::write(&log_path, log_content).expect("write test log");

    CmdResult {
        status: output.status,
        stdout,
        stderr,
        log_path,
    }
}
