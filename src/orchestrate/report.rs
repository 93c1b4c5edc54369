//! Per-case verdicts and the run summary.

#![allow(missing_docs)]

use std::path::PathBuf;

use serde::Serialize;

use crate::invoke::Phase;
use crate::orchestrate::barrier::Release;

/// Final judgment for one case in one phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", content = "detail", rename_all = "snake_case")]
pub enum Verdict {
    Passed,
    /// Setup error, generator error, or comparison mismatch, with diagnostics.
    Failed(String),
    /// Run-configuration precondition not met.
    Skipped(String),
    /// Update mode rewrote this reference.
    Updated(PathBuf),
}

impl Verdict {
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Passed => "PASS",
            Self::Failed(_) => "FAIL",
            Self::Skipped(_) => "SKIP",
            Self::Updated(_) => "UPDATED",
        }
    }

    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaseReport {
    /// Case key, `<mode>/<case>`.
    pub case: String,
    pub phase: Phase,
    #[serde(flatten)]
    pub verdict: Verdict,
    /// ZBH code of the error behind a failure or skip.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub duration_ms: u64,
}

impl CaseReport {
    /// Sub-test style name, `<phase>/<mode>/<case>`.
    #[must_use]
    pub fn display_name(&self) -> String {
        format!("{}/{}", self.phase, self.case)
    }
}

/// Aggregate outcome of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub updated: usize,
    /// How the metamenu group was released, when it ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub barrier: Option<Release>,
    pub cancelled: bool,
    pub reports: Vec<CaseReport>,
}

impl RunSummary {
    /// Build a summary; reports are ordered by phase, then case key.
    #[must_use]
    pub fn from_reports(mut reports: Vec<CaseReport>) -> Self {
        reports.sort_by(|a, b| (a.phase, &a.case).cmp(&(b.phase, &b.case)));
        let mut summary = Self::default();
        for report in &reports {
            match report.verdict {
                Verdict::Passed => summary.passed += 1,
                Verdict::Failed(_) => summary.failed += 1,
                Verdict::Skipped(_) => summary.skipped += 1,
                Verdict::Updated(_) => summary.updated += 1,
            }
        }
        summary.reports = reports;
        summary
    }

    /// True when no case failed. Skips do not count against a run.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.failed == 0 && !self.cancelled
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.reports.len()
    }

    pub fn failures(&self) -> impl Iterator<Item = &CaseReport> {
        self.reports.iter().filter(|r| r.verdict.is_failure())
    }

    /// Report for one case and phase, if it ran.
    #[must_use]
    pub fn find(&self, case: &str, phase: Phase) -> Option<&CaseReport> {
        self.reports
            .iter()
            .find(|r| r.case == case && r.phase == phase)
    }
}
