//! Architectural Enforcement
//!
//! Source scanners shared by the integration tests in `tests/`. They walk the
//! production crates and report lines that break the async rules:
//! - No sleep() calls outside retry backoff
//! - No blocking file, network or HTTP I/O

use std::path::{Path, PathBuf};

/// Production source directories, relative to the workspace root
pub const PRODUCTION_DIRS: &[&str] = &["parley/core/src", "parley/daemon/src"];

/// Workspace root, derived from this crate's manifest directory
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|_| PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../.."))
}

/// All `.rs` files under the production directories
///
/// # Panics
///
/// Panics if a production directory is missing, so a moved crate cannot make
/// the checks pass vacuously.
#[must_use]
pub fn production_files() -> Vec<PathBuf> {
    let root = workspace_root();
    let mut files = Vec::new();

    for dir in PRODUCTION_DIRS {
        let path = root.join(dir);
        assert!(path.is_dir(), "missing production directory {}", path.display());

        for entry in walkdir::WalkDir::new(&path)
            .into_iter()
            .filter_map(Result::ok)
        {
            if entry.path().extension().and_then(|s| s.to_str()) == Some("rs") {
                files.push(entry.into_path());
            }
        }
    }

    files.sort();
    files
}

/// Index of the first line of the file's `#[cfg(test)]` module, if any
///
/// Everything from there on is test code.
#[must_use]
pub fn test_module_start(lines: &[&str]) -> Option<usize> {
    lines.iter().enumerate().find_map(|(idx, line)| {
        if line.trim() != "#[cfg(test)]" {
            return None;
        }
        let next = lines.get(idx + 1)?.trim();
        next.starts_with("mod ").then_some(idx)
    })
}

/// Code part of a line, with any `//` comment removed
#[must_use]
pub fn code_part(line: &str) -> &str {
    let trimmed = line.trim_start();
    if trimmed.starts_with("//") {
        return "";
    }
    line.split("//").next().unwrap_or(line)
}

/// Whether `current_idx` sits in a function marked `#[test]` or `#[tokio::test]`
#[must_use]
pub fn is_in_test_function(lines: &[&str], current_idx: usize) -> bool {
    for i in (0..current_idx).rev() {
        let line = lines[i].trim();

        if line.starts_with("#[test]") || line.starts_with("#[tokio::test") {
            return true;
        }

        if (line.starts_with("fn ") || line.contains(" fn ")) && !line.contains("test") {
            return false;
        }

        if line.starts_with("mod ") || (line.starts_with("impl ") && line.contains('{')) {
            return false;
        }
    }
    false
}

/// Whether `current_idx` sits in an `async fn`
#[must_use]
pub fn is_in_async_function(lines: &[&str], current_idx: usize) -> bool {
    for i in (0..current_idx).rev() {
        let line = lines[i].trim();

        if line.contains("async fn ") {
            return true;
        }

        if (line.starts_with("fn ") || line.contains(" fn ")) && !line.contains("async") {
            return false;
        }

        if line.starts_with("mod ") || (line.starts_with("impl ") && line.contains('{')) {
            return false;
        }
    }
    false
}

/// A rule violation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// File the line is in
    pub path: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// What rule was broken
    pub reason: String,
    /// The offending source line
    pub source: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} - {}: {}",
            self.path.display(),
            self.line,
            self.reason,
            self.source.trim()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_test_module_start() {
        let lines = vec!["fn a() {}", "#[cfg(test)]", "mod tests {", "}"];
        assert_eq!(test_module_start(&lines), Some(1));
        assert_eq!(test_module_start(&["fn a() {}"]), None);
    }

    #[test]
    fn test_code_part_strips_comments() {
        assert_eq!(code_part("    // std::fs::read"), "");
        assert_eq!(code_part("let x = 1; // std::fs"), "let x = 1; ");
    }

    #[test]
    fn test_async_function_detection() {
        let lines = vec!["pub async fn run() {", "    work();", "}"];
        assert!(is_in_async_function(&lines, 1));

        let lines = vec!["fn print(chunk: Chunk) {", "    work();", "}"];
        assert!(!is_in_async_function(&lines, 1));
    }

    #[test]
    fn test_production_dirs_exist() {
        assert!(!production_files().is_empty());
    }
}
