//! Rewrite volatile sandbox paths in generator output to a stable placeholder.
//!
//! References recorded in one run must stay valid in the next, which uses a
//! different temporary directory. Normalization is idempotent.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use memchr::memmem;
use regex::bytes::Regex;

/// Stable stand-in for the sandbox root.
pub const SANDBOX_PLACEHOLDER: &str = "@SANDBOX@";

/// Prefix of every sandbox directory name.
pub const SANDBOX_PREFIX: &str = "zbh-sandbox-";

/// Absolute path ending in a sandbox directory name, possibly belonging to
/// another case's sandbox that leaked into this output.
static LEFTOVER_SANDBOX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?-u)(?:/[^/\s\x00'\x22:=]+)*/zbh-sandbox-[A-Za-z0-9]+")
        .unwrap_or_else(|err| panic!("invalid sandbox pattern: {err}"))
});

/// Every spelling of `sandbox` that may appear in output, longest first.
fn sandbox_spellings(sandbox: &Path) -> Vec<Vec<u8>> {
    let mut spellings: Vec<PathBuf> = vec![sandbox.to_path_buf()];
    if let Ok(canonical) = std::fs::canonicalize(sandbox)
        && canonical != sandbox
    {
        spellings.push(canonical);
    }
    let mut bytes: Vec<Vec<u8>> = spellings
        .into_iter()
        .map(|p| p.to_string_lossy().into_owned().into_bytes())
        .filter(|b| b.len() > 1)
        .collect();
    bytes.sort_by_key(|b| std::cmp::Reverse(b.len()));
    bytes
}

/// Replace the sandbox path and any leftover sandbox paths with the placeholder.
#[must_use]
pub fn normalize(content: &[u8], sandbox: &Path) -> Vec<u8> {
    let mut current = content.to_vec();
    for needle in sandbox_spellings(sandbox) {
        current = replace_all(&current, &needle, SANDBOX_PLACEHOLDER.as_bytes());
    }
    LEFTOVER_SANDBOX
        .replace_all(&current, SANDBOX_PLACEHOLDER.as_bytes())
        .into_owned()
}

fn replace_all(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Vec<u8> {
    let finder = memmem::Finder::new(needle);
    let mut out = Vec::with_capacity(haystack.len());
    let mut last = 0;
    for start in finder.find_iter(haystack) {
        out.extend_from_slice(&haystack[last..start]);
        out.extend_from_slice(replacement);
        last = start + needle.len();
    }
    out.extend_from_slice(&haystack[last..]);
    out
}
