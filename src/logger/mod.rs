//! Run logging: a shared JSONL event log with graceful degradation.

#![allow(missing_docs)]

pub mod jsonl;

use std::path::Path;

use parking_lot::Mutex;

use crate::core::errors::HarnessError;
use crate::logger::jsonl::{EventType, JsonlWriter, LogEntry, Severity};

/// Thread-safe handle to the run log, shared by every worker.
pub struct RunLog {
    writer: Mutex<JsonlWriter>,
}

impl RunLog {
    /// Log to `path`, degrading to stderr if it cannot be opened.
    pub fn open(path: &Path) -> Self {
        Self {
            writer: Mutex::new(JsonlWriter::open(path.to_path_buf())),
        }
    }

    /// A log that drops every event.
    pub fn disabled() -> Self {
        Self {
            writer: Mutex::new(JsonlWriter::discard()),
        }
    }

    pub fn write(&self, entry: &LogEntry) {
        self.writer.lock().write_entry(entry);
    }

    pub fn flush(&self) {
        self.writer.lock().flush();
    }

    /// `normal`, `stderr` or `discard`.
    pub fn state(&self) -> String {
        self.writer.lock().state().to_string()
    }

    /// Entry for one case and phase, ready for further fields.
    pub fn case_entry(
        event: EventType,
        severity: Severity,
        case: &str,
        phase: &str,
    ) -> LogEntry {
        let mut entry = LogEntry::new(event, severity);
        entry.case = Some(case.to_string());
        entry.phase = Some(phase.to_string());
        entry
    }

    /// Record an error against a case, keeping its ZBH code.
    pub fn case_error(
        &self,
        event: EventType,
        case: &str,
        phase: &str,
        duration_ms: u64,
        err: &HarnessError,
    ) {
        let severity = if event == EventType::CaseSkip {
            Severity::Info
        } else {
            Severity::Warning
        };
        let mut entry = Self::case_entry(event, severity, case, phase);
        entry.ok = Some(false);
        entry.duration_ms = Some(duration_ms);
        entry.error_code = Some(err.code().to_string());
        entry.error_message = Some(err.to_string());
        self.write(&entry);
    }
}

impl std::fmt::Debug for RunLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLog").finish_non_exhaustive()
    }
}
