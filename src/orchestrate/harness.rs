//! Harness orchestrator: runs the bootlist and metamenu groups.
//!
//! Both groups start together on their own threads. The bootlist group claims
//! the barrier and fans its cases out to a worker pool; the metamenu group
//! waits on the barrier, then does the same. Every case and phase gets a fresh
//! sandbox, and every failure stays local to its case.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;

use crossbeam_channel as channel;
use serde::Serialize;

use crate::catalog::{self, TestCase};
use crate::core::config::Config;
use crate::core::errors::{HarnessError, Result};
use crate::core::paths::{find_executable, is_executable, resolve_absolute_path};
use crate::golden::{self, Comparison, Mismatch};
use crate::invoke::environment::VAR_PATH;
use crate::invoke::{EnvRequest, Invocation, Phase, ProcessRunner, SecureBoot, compose};
use crate::logger::RunLog;
use crate::logger::jsonl::{EventType, LogEntry, Severity};
use crate::orchestrate::barrier::PhaseBarrier;
use crate::orchestrate::report::{CaseReport, RunSummary, Verdict};
use crate::sandbox::Sandbox;
use crate::sandbox::dangerous::{self, DangerousMode};
use crate::sandbox::staging;
use crate::topology::{self, Materialized};

/// Which phase groups a run includes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseSelection {
    #[default]
    All,
    Bootlist,
    Metamenu,
}

impl PhaseSelection {
    #[must_use]
    pub const fn includes(self, phase: Phase) -> bool {
        matches!(
            (self, phase),
            (Self::All, _)
                | (Self::Bootlist, Phase::Bootlist)
                | (Self::Metamenu, Phase::Metamenu)
        )
    }
}

impl FromStr for PhaseSelection {
    type Err = HarnessError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw {
            "all" => Ok(Self::All),
            "bootlist" => Ok(Self::Bootlist),
            "metamenu" => Ok(Self::Metamenu),
            other => Err(HarnessError::InvalidConfig {
                details: format!("unknown phase {other:?} (expected all, bootlist or metamenu)"),
            }),
        }
    }
}

/// Per-run selection knobs.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Substring filter on `<mode>/<case>`.
    pub filter: Option<String>,
    pub phases: PhaseSelection,
    /// Echo generator output to stderr.
    pub forward_output: bool,
}

/// What a case produced before it is turned into a verdict.
enum CaseOutcome {
    Matched,
    Mismatched(Box<Mismatch>),
    Updated(PathBuf),
}

/// Runs one harness invocation over the fixture catalog.
pub struct Harness {
    config: Config,
    log: Arc<RunLog>,
    cancel: Arc<AtomicBool>,
    dangerous: DangerousMode,
    is_root: bool,
    host_env: Vec<(OsString, OsString)>,
    /// Absolute mock tool directories, in search order.
    mock_dirs: Vec<PathBuf>,
    secureboot_mock_dir: PathBuf,
    generator: PathBuf,
}

impl Harness {
    /// Build a harness from a validated configuration.
    pub fn new(config: Config, log: Arc<RunLog>) -> Result<Self> {
        config.validate()?;
        let mock_dirs = config
            .mocks
            .tools
            .iter()
            .map(|tool| resolve_absolute_path(&config.mocks.tool_dir(tool)))
            .collect();
        let secureboot_mock_dir =
            resolve_absolute_path(&config.mocks.tool_dir(&config.mocks.secureboot_tool));
        let generator = resolve_absolute_path(&config.generator.binary);
        let dangerous = DangerousMode::new(
            config.run.dangerous,
            config.mocks.host_secureboot_binary.clone(),
        );
        Ok(Self {
            log,
            cancel: Arc::new(AtomicBool::new(false)),
            dangerous,
            is_root: dangerous::running_as_root(),
            host_env: std::env::vars_os().collect(),
            mock_dirs,
            secureboot_mock_dir,
            generator,
            config,
        })
    }

    /// Kill running generators and skip pending cases once `flag` is set.
    #[must_use]
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = flag;
        self
    }

    /// Replace the environment generators inherit.
    #[must_use]
    pub fn with_host_env<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        self.host_env = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self
    }

    /// Override the effective-uid check used to admit dangerous cases.
    #[must_use]
    pub const fn with_root_privileges(mut self, is_root: bool) -> Self {
        self.is_root = is_root;
        self
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Discover, filter, and run every selected case.
    ///
    /// Only catalog failures and leftover-restore failures abort the run;
    /// everything else ends up in a case report.
    pub fn run(&self, options: &RunOptions) -> Result<RunSummary> {
        if self.dangerous.is_enabled() && self.dangerous.restore_leftover()? {
            self.log_binary(EventType::BinaryRestored, self.dangerous.binary(), "leftover backup");
        }

        let cases = catalog::select(
            catalog::discover(&self.config.fixtures.root)?,
            options.filter.as_deref(),
        );

        let mut start = LogEntry::new(EventType::RunStart, Severity::Info);
        start.path = Some(self.config.fixtures.root.display().to_string());
        start.config_hash = self.config.stable_hash().ok();
        start.details = Some(format!(
            "{} case(s), phases={:?}, update={}, dangerous={}",
            cases.len(),
            options.phases,
            self.config.run.update,
            self.config.run.dangerous
        ));
        self.log.write(&start);

        let runner = ProcessRunner::new()
            .with_forwarding(options.forward_output)
            .with_cancel_flag(Arc::clone(&self.cancel));

        // One barrier per run: it is a one-shot signal.
        let barrier = PhaseBarrier::new();
        let run_bootlist = options.phases.includes(Phase::Bootlist) && !cases.is_empty();
        let run_metamenu = options.phases.includes(Phase::Metamenu);

        let (reports, release) = thread::scope(|scope| {
            let bootlist = run_bootlist.then(|| {
                scope.spawn(|| {
                    let _guard = barrier.enter_bootlist();
                    self.run_group(Phase::Bootlist, &cases, &runner)
                })
            });
            let metamenu = run_metamenu.then(|| {
                scope.spawn(|| {
                    let release = barrier.wait_for_bootlist(self.config.run.phase_grace());
                    let mut entry = LogEntry::new(EventType::BarrierReleased, Severity::Info);
                    entry.phase = Some(Phase::Metamenu.to_string());
                    entry.details = Some(release.as_str().to_string());
                    self.log.write(&entry);
                    (self.run_group(Phase::Metamenu, &cases, &runner), release)
                })
            });

            let mut reports = bootlist
                .map(|h| join_group(h, Phase::Bootlist))
                .unwrap_or_default();
            let release = metamenu.map(|h| match h.join() {
                Ok((group, release)) => {
                    reports.extend(group);
                    Some(release)
                }
                Err(_) => {
                    reports.push(panicked(Phase::Metamenu));
                    None
                }
            });
            (reports, release.flatten())
        });

        let mut summary = RunSummary::from_reports(reports);
        summary.barrier = release;
        summary.cancelled = self.cancel.load(Ordering::Relaxed);

        let mut complete = LogEntry::new(EventType::RunComplete, Severity::Info);
        complete.ok = Some(summary.is_success());
        complete.details = Some(format!(
            "passed={} failed={} skipped={} updated={}",
            summary.passed, summary.failed, summary.skipped, summary.updated
        ));
        self.log.write(&complete);
        self.log.flush();
        Ok(summary)
    }

    fn run_group(
        &self,
        phase: Phase,
        cases: &BTreeMap<String, TestCase>,
        runner: &ProcessRunner,
    ) -> Vec<CaseReport> {
        if let Err(err) = self.check_preconditions() {
            return cases
                .values()
                .map(|case| self.finish(case, phase, Instant::now(), Err(err_clone(&err))))
                .collect();
        }

        let (work_tx, work_rx) = channel::unbounded::<&TestCase>();
        let (report_tx, report_rx) = channel::unbounded::<CaseReport>();
        for case in cases.values() {
            let _ = work_tx.send(case);
        }
        drop(work_tx);

        let workers = self.config.run.parallelism.clamp(1, cases.len().max(1));
        thread::scope(|scope| {
            for _ in 0..workers {
                let work_rx = work_rx.clone();
                let report_tx = report_tx.clone();
                scope.spawn(move || {
                    while let Ok(case) = work_rx.recv() {
                        let report = self.run_case(case, phase, runner);
                        if report_tx.send(report).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(report_tx);
        report_rx.into_iter().collect()
    }

    fn run_case(&self, case: &TestCase, phase: Phase, runner: &ProcessRunner) -> CaseReport {
        let start = Instant::now();
        if self.cancel.load(Ordering::Relaxed) {
            return self.finish(
                case,
                phase,
                start,
                Err(HarnessError::precondition("run cancelled before this case started")),
            );
        }
        let entry = RunLog::case_entry(
            EventType::CaseStart,
            Severity::Info,
            &case.relative_path,
            phase.as_str(),
        );
        self.log.write(&entry);
        let result = self.execute(case, phase, runner);
        self.finish(case, phase, start, result)
    }

    /// One case, one phase: sandbox, topology, generator, comparison.
    fn execute(
        &self,
        case: &TestCase,
        phase: Phase,
        runner: &ProcessRunner,
    ) -> Result<CaseOutcome> {
        let secure_boot = SecureBoot::from_str(&case.mode)?;
        // Only the bootlist phase consults the secure-boot tool.
        let hides_binary = secure_boot.is_dangerous() && phase == Phase::Bootlist;
        if hides_binary {
            self.dangerous.admit(self.is_root)?;
        }

        let sandbox = Sandbox::create(self.config.run.keep_sandboxes)?;
        let materialized = topology::build(
            &case.file(&self.config.fixtures.declaration_file),
            sandbox.path(),
            &case.full_name,
        )?;
        self.log_topology(case, phase, &sandbox, &materialized);
        let generator = &self.config.generator;
        staging::stage(sandbox.path(), &generator.checkout_root, &generator.checkout_files)?;
        staging::stage(sandbox.path(), &generator.source_root, &generator.staged_files)?;

        let input = match phase {
            Phase::Bootlist => None,
            Phase::Metamenu => {
                let recorded = case.file(Phase::Bootlist.reference_name());
                if !recorded.is_file() {
                    return Err(HarnessError::io(
                        &recorded,
                        std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "recorded bootlist missing (run the bootlist phase with --update)",
                        ),
                    ));
                }
                Some(recorded)
            }
        };
        let output = sandbox.file(phase.reference_name());
        let request = EnvRequest {
            phase,
            sandbox: sandbox.path(),
            input: input.as_deref(),
            output: &output,
            secure_boot,
            root_dataset: materialized.root_dataset.as_deref(),
            mock_dirs: &self.mock_dirs,
            secureboot_mock_dir: &self.secureboot_mock_dir,
            locale: &self.config.run.locale,
            sysconfdir_var: self.config.generator.sysconfdir_var(),
        };
        let env = compose(&request, self.host_env.iter().cloned());

        let invocation = Invocation {
            program: &self.generator,
            args: vec![
                OsString::from(&self.config.generator.output_flag),
                sandbox.file(&self.config.generator.output_name).into_os_string(),
            ],
            env: &env,
            workdir: sandbox.path(),
            deadline: self.config.generator.deadline(),
            wrapper: self.config.generator.wrapper(),
        };

        let hidden = if hides_binary {
            let hidden = self.dangerous.hide()?;
            if hidden.moved() {
                self.log_binary(EventType::BinaryRenamed, hidden.binary(), case.relative_path.as_str());
            }
            Some(hidden)
        } else {
            None
        };
        let outcome = runner.run(&invocation);
        if let Some(hidden) = hidden {
            let binary = hidden.binary().to_path_buf();
            if hidden.restore()? {
                self.log_binary(EventType::BinaryRestored, &binary, case.relative_path.as_str());
            }
        }
        let outcome = outcome?;
        if !output.is_file() {
            return Err(HarnessError::GeneratorFailed {
                status: format!("{} without writing {}", outcome.status, output.display()),
                stdout: outcome.stdout,
                stderr: outcome.stderr,
            });
        }

        let reference = case.file(phase.reference_name());
        if self.config.run.update {
            let written = golden::update(&output, &reference, sandbox.path())?;
            return Ok(CaseOutcome::Updated(written));
        }
        match golden::compare(&output, &reference, sandbox.path())? {
            Comparison::Match => Ok(CaseOutcome::Matched),
            Comparison::Mismatch(mismatch) => Ok(CaseOutcome::Mismatched(mismatch)),
        }
    }

    /// Turn an outcome into a report and log it.
    fn finish(
        &self,
        case: &TestCase,
        phase: Phase,
        start: Instant,
        result: Result<CaseOutcome>,
    ) -> CaseReport {
        let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        let key = case.relative_path.as_str();
        let (verdict, error_code) = match result {
            Ok(CaseOutcome::Matched) => {
                let mut entry = RunLog::case_entry(EventType::CasePass, Severity::Info, key, phase.as_str());
                entry.ok = Some(true);
                entry.duration_ms = Some(duration_ms);
                self.log.write(&entry);
                (Verdict::Passed, None)
            }
            Ok(CaseOutcome::Updated(path)) => {
                let mut entry = RunLog::case_entry(
                    EventType::ReferenceUpdated,
                    Severity::Info,
                    key,
                    phase.as_str(),
                );
                entry.path = Some(path.display().to_string());
                entry.duration_ms = Some(duration_ms);
                self.log.write(&entry);
                (Verdict::Updated(path), None)
            }
            Ok(CaseOutcome::Mismatched(mismatch)) => {
                let mut entry = RunLog::case_entry(EventType::CaseFail, Severity::Warning, key, phase.as_str());
                entry.ok = Some(false);
                entry.duration_ms = Some(duration_ms);
                entry.path = Some(mismatch.reference_path.display().to_string());
                entry.details = Some(format!(
                    "actual sha256 {} reference sha256 {}",
                    mismatch.actual_digest,
                    mismatch.reference_digest.as_deref().unwrap_or("-")
                ));
                self.log.write(&entry);
                (Verdict::Failed(mismatch.to_string()), None)
            }
            Err(err) if err.is_skip() => {
                self.log.case_error(EventType::CaseSkip, key, phase.as_str(), duration_ms, &err);
                (Verdict::Skipped(precondition_details(&err)), Some(err.code()))
            }
            Err(err) => {
                self.log.case_error(EventType::CaseFail, key, phase.as_str(), duration_ms, &err);
                let kind = if err.is_setup() { "setup error" } else { "generator error" };
                (Verdict::Failed(format!("{kind}: {err}")), Some(err.code()))
            }
        };
        CaseReport {
            case: case.relative_path.clone(),
            phase,
            verdict,
            error_code: error_code.map(str::to_string),
            duration_ms,
        }
    }

    /// Group-wide checks. A failure skips every case in the group.
    fn check_preconditions(&self) -> Result<()> {
        for dir in self.mock_dirs.iter().chain([&self.secureboot_mock_dir]) {
            if !dir.is_dir() {
                return Err(HarnessError::precondition(format!(
                    "mock tool directory {} is missing",
                    dir.display()
                )));
            }
        }
        if !is_executable(&self.generator) {
            return Err(HarnessError::precondition(format!(
                "generator {} is not an executable file",
                self.generator.display()
            )));
        }
        if let Some(wrapper) = self.config.generator.wrapper() {
            let host_path = self
                .host_env
                .iter()
                .find(|(k, _)| k == VAR_PATH)
                .map(|(_, v)| v.as_os_str());
            if find_executable(wrapper, host_path).is_none() {
                return Err(HarnessError::precondition(format!(
                    "privilege wrapper {wrapper} not found on PATH"
                )));
            }
        }
        Ok(())
    }

    fn log_topology(
        &self,
        case: &TestCase,
        phase: Phase,
        sandbox: &Sandbox,
        materialized: &Materialized,
    ) {
        let mut entry = RunLog::case_entry(
            EventType::TopologyMaterialized,
            Severity::Info,
            &case.relative_path,
            phase.as_str(),
        );
        entry.path = sandbox
            .is_kept()
            .then(|| sandbox.path().display().to_string());
        entry.details = Some(format!(
            "pools={} datasets={} root={}",
            materialized.pool_names.join(","),
            materialized.dataset_count,
            materialized.root_dataset.as_deref().unwrap_or("-")
        ));
        self.log.write(&entry);

        if let Some(dangling) = &materialized.dangling_root {
            let mut warning = RunLog::case_entry(
                EventType::TopologyWarning,
                Severity::Warning,
                &case.relative_path,
                phase.as_str(),
            );
            warning.details = Some(format!(
                "active_root {dangling} names no declared dataset; root override omitted"
            ));
            self.log.write(&warning);
        }
    }

    fn log_binary(&self, event: EventType, binary: &Path, details: &str) {
        let mut entry = LogEntry::new(event, Severity::Warning);
        entry.path = Some(binary.display().to_string());
        entry.details = Some(details.to_string());
        self.log.write(&entry);
    }
}

impl std::fmt::Debug for Harness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Harness")
            .field("fixtures", &self.config.fixtures.root)
            .field("generator", &self.generator)
            .finish_non_exhaustive()
    }
}

/// Skip reasons read better without the error-code prefix.
fn precondition_details(err: &HarnessError) -> String {
    match err {
        HarnessError::Precondition { details } => details.clone(),
        other => other.to_string(),
    }
}

/// Preconditions are reported once per case; only their text is shared.
fn err_clone(err: &HarnessError) -> HarnessError {
    HarnessError::precondition(precondition_details(err))
}

fn join_group(
    handle: thread::ScopedJoinHandle<'_, Vec<CaseReport>>,
    phase: Phase,
) -> Vec<CaseReport> {
    handle.join().unwrap_or_else(|_| vec![panicked(phase)])
}

/// Placeholder report for a group whose thread panicked.
fn panicked(phase: Phase) -> CaseReport {
    CaseReport {
        case: String::new(),
        phase,
        verdict: Verdict::Failed(format!("{phase} group panicked")),
        error_code: Some("ZBH-5900".to_string()),
        duration_ms: 0,
    }
}
