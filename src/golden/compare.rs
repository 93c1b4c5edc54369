//! Byte-exact comparison of normalized output against a golden reference.

#![allow(missing_docs)]

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::core::errors::{HarnessError, Result};
use crate::golden::normalize::normalize;

/// Lines of unchanged context kept around each change in the diff listing.
const DIFF_CONTEXT: usize = 3;
/// Above this many LCS cells the diff degrades to the first differing line.
const MAX_DIFF_CELLS: usize = 4_000_000;

/// Outcome of comparing one phase's output for one case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Comparison {
    Match,
    Mismatch(Box<Mismatch>),
}

impl Comparison {
    #[must_use]
    pub const fn is_match(&self) -> bool {
        matches!(self, Self::Match)
    }
}

/// Everything needed to diagnose a failed comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    pub reference_path: PathBuf,
    /// `-` reference / `+` actual line listing.
    pub diff: String,
    /// Normalized actual content.
    pub actual: String,
    /// Reference content; empty when the reference does not exist.
    pub reference: String,
    pub actual_digest: String,
    pub reference_digest: Option<String>,
}

impl Mismatch {
    #[must_use]
    pub const fn reference_missing(&self) -> bool {
        self.reference_digest.is_none()
    }
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reference_missing() {
            writeln!(
                f,
                "reference {} does not exist (run with --update to record it)",
                self.reference_path.display()
            )?;
            writeln!(f, "----- actual (sha256 {}) -----", self.actual_digest)?;
            return write!(f, "{}", self.actual);
        }
        writeln!(
            f,
            "output differs from reference {}",
            self.reference_path.display()
        )?;
        writeln!(f, "----- diff (-reference +actual) -----")?;
        write!(f, "{}", self.diff)?;
        writeln!(
            f,
            "----- reference (sha256 {}) -----",
            self.reference_digest.as_deref().unwrap_or("-")
        )?;
        write!(f, "{}", self.reference)?;
        writeln!(f, "----- actual (sha256 {}) -----", self.actual_digest)?;
        write!(f, "{}", self.actual)
    }
}

/// SHA-256 hex digest of `bytes`.
#[must_use]
pub fn digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Normalize `actual` and compare it byte-for-byte against `reference`.
///
/// A missing reference is a mismatch, not an error; a missing actual file is.
pub fn compare(actual: &Path, reference: &Path, sandbox: &Path) -> Result<Comparison> {
    let raw = fs::read(actual).map_err(|source| HarnessError::io(actual, source))?;
    let normalized = normalize(&raw, sandbox);

    let expected = match fs::read(reference) {
        Ok(bytes) => Some(bytes),
        Err(err) if err.kind() == io::ErrorKind::NotFound => None,
        Err(source) => return Err(HarnessError::io(reference, source)),
    };

    if expected.as_deref() == Some(normalized.as_slice()) {
        return Ok(Comparison::Match);
    }

    let actual_text = String::from_utf8_lossy(&normalized).into_owned();
    let reference_text = expected
        .as_deref()
        .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
        .unwrap_or_default();
    Ok(Comparison::Mismatch(Box::new(Mismatch {
        reference_path: reference.to_path_buf(),
        diff: line_diff(&reference_text, &actual_text),
        actual_digest: digest(&normalized),
        reference_digest: expected.as_deref().map(digest),
        actual: actual_text,
        reference: reference_text,
    })))
}

/// Overwrite `reference` with the normalized content of `actual`.
///
/// The write goes through a temp file in the same directory and a rename, so a
/// concurrent reader never sees a partial reference.
pub fn update(actual: &Path, reference: &Path, sandbox: &Path) -> Result<PathBuf> {
    let raw = fs::read(actual).map_err(|source| HarnessError::io(actual, source))?;
    let normalized = normalize(&raw, sandbox);

    let parent = reference
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|source| HarnessError::io(parent, source))?;

    let mut tmp =
        NamedTempFile::new_in(parent).map_err(|source| HarnessError::io(parent, source))?;
    tmp.write_all(&normalized)
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|source| HarnessError::io(tmp.path(), source))?;
    tmp.persist(reference)
        .map_err(|err| HarnessError::io(reference, err.error))?;
    Ok(reference.to_path_buf())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edit<'a> {
    Keep(&'a str),
    Remove(&'a str),
    Add(&'a str),
}

/// Line listing of the differences between `expected` and `actual`, with a
/// few lines of context and `@@ line N @@` markers between hunks.
#[must_use]
pub fn line_diff(expected: &str, actual: &str) -> String {
    let old: Vec<&str> = expected.lines().collect();
    let new: Vec<&str> = actual.lines().collect();
    if old.len().saturating_mul(new.len()) > MAX_DIFF_CELLS {
        return first_difference(expected, actual, &old, &new);
    }
    let edits = edit_script(&old, &new);

    let changed: Vec<usize> = edits
        .iter()
        .enumerate()
        .filter(|(_, e)| !matches!(e, Edit::Keep(_)))
        .map(|(i, _)| i)
        .collect();
    if changed.is_empty() {
        return same_lines(expected, actual);
    }

    let mut visible = vec![false; edits.len()];
    for &i in &changed {
        let lo = i.saturating_sub(DIFF_CONTEXT);
        let hi = (i + DIFF_CONTEXT).min(edits.len() - 1);
        for slot in &mut visible[lo..=hi] {
            *slot = true;
        }
    }

    let mut out = String::new();
    let mut old_line = 1usize;
    let mut in_hunk = false;
    for (i, edit) in edits.iter().enumerate() {
        if visible[i] {
            if !in_hunk {
                out.push_str(&format!("@@ line {old_line} @@\n"));
                in_hunk = true;
            }
            match edit {
                Edit::Keep(line) => out.push_str(&format!(" {line}\n")),
                Edit::Remove(line) => out.push_str(&format!("-{line}\n")),
                Edit::Add(line) => out.push_str(&format!("+{line}\n")),
            }
        } else {
            in_hunk = false;
        }
        if !matches!(edit, Edit::Add(_)) {
            old_line += 1;
        }
    }
    out
}

/// Same lines, different bytes: trailing newline or line endings.
fn same_lines(expected: &str, actual: &str) -> String {
    if expected == actual {
        String::new()
    } else {
        "(contents differ only in line endings or the final newline)\n".to_string()
    }
}

/// Report only the first differing line when the LCS table would be too large.
fn first_difference(expected: &str, actual: &str, old: &[&str], new: &[&str]) -> String {
    let Some(at) = old
        .iter()
        .zip(new)
        .position(|(a, b)| a != b)
        .or_else(|| (old.len() != new.len()).then(|| old.len().min(new.len())))
    else {
        return same_lines(expected, actual);
    };
    let mut out = format!(
        "@@ line {} @@ (first difference only; {} and {} lines exceed the diff limit)\n",
        at + 1,
        old.len(),
        new.len()
    );
    if let Some(line) = old.get(at) {
        out.push_str(&format!("-{line}\n"));
    }
    if let Some(line) = new.get(at) {
        out.push_str(&format!("+{line}\n"));
    }
    out
}

/// Longest-common-subsequence edit script. Callers bound the table size.
fn edit_script<'a>(old: &[&'a str], new: &[&'a str]) -> Vec<Edit<'a>> {
    let (n, m) = (old.len(), new.len());
    let mut lcs = vec![vec![0u32; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i][j] = if old[i] == new[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let mut edits = Vec::with_capacity(n.max(m));
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if old[i] == new[j] {
            edits.push(Edit::Keep(old[i]));
            i += 1;
            j += 1;
        } else if lcs[i + 1][j] >= lcs[i][j + 1] {
            edits.push(Edit::Remove(old[i]));
            i += 1;
        } else {
            edits.push(Edit::Add(new[j]));
            j += 1;
        }
    }
    edits.extend(old[i..].iter().map(|l| Edit::Remove(l)));
    edits.extend(new[j..].iter().map(|l| Edit::Add(l)));
    edits
}
