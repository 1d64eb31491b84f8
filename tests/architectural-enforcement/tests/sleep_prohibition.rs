//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code in the daemon MUST NOT call sleep methods.
//! **Exceptions**: exponential backoff (retry logic only), periodic tasks built
//! on `tokio::time::interval`, test code.
//!
//! Waiting is done on I/O, channels, cancellation tokens or intervals.

use std::fs;
use std::path::Path;

use architectural_enforcement::{
    code_part, is_in_test_function, production_files, test_module_start, Violation,
};

/// Test that production code does not contain sleep() calls
#[test]
fn test_no_sleep_in_production_code() {
    let violations = find_sleep_violations(&SleepPolicy::default());

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Sleep calls found in production code!\n");

        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }

        eprintln!("\n✅ ACCEPTABLE sleep uses:");
        eprintln!("  - Exponential backoff in retry logic");
        eprintln!("  - Test code (#[test] or #[tokio::test] functions, #[cfg(test)] modules)");
        eprintln!("  - Periodic tasks using tokio::time::interval()");
        eprintln!("\n❌ FORBIDDEN:");
        eprintln!("  - Sleep in polling loops");
        eprintln!("  - Sleep as poor man's synchronization");
        eprintln!("  - Sleep to 'wait' for events (use async I/O!)");

        panic!(
            "\nFound {} sleep violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}

struct SleepPolicy {
    allow_backoff: bool,
    allow_tests: bool,
}

impl Default for SleepPolicy {
    fn default() -> Self {
        Self {
            allow_backoff: true,
            allow_tests: true,
        }
    }
}

fn find_sleep_violations(policy: &SleepPolicy) -> Vec<Violation> {
    let mut violations = Vec::new();
    for path in production_files() {
        check_file(&path, &mut violations, policy);
    }
    violations
}

fn check_file(path: &Path, violations: &mut Vec<Violation>, policy: &SleepPolicy) {
    let Ok(content) = fs::read_to_string(path) else {
        return;
    };

    let lines: Vec<&str> = content.lines().collect();
    violations.extend(scan(path, &lines, policy));
}

fn scan(path: &Path, lines: &[&str], policy: &SleepPolicy) -> Vec<Violation> {
    let test_start = test_module_start(lines).unwrap_or(lines.len());
    let mut found = Vec::new();

    for (idx, line) in lines.iter().enumerate() {
        let code = code_part(line);
        if !(code.contains("::sleep(") || code.contains(".sleep(")) {
            continue;
        }

        if policy.allow_tests && (idx >= test_start || is_in_test_function(lines, idx)) {
            continue;
        }

        if policy.allow_backoff && is_backoff_context(lines, idx) {
            continue;
        }

        if is_interval_pattern(lines, idx) {
            continue;
        }

        found.push(Violation {
            path: path.to_path_buf(),
            line: idx + 1,
            reason: "sleep call".to_string(),
            source: (*line).to_string(),
        });
    }

    found
}

/// Check if sleep is used for exponential backoff (acceptable for retry logic)
fn is_backoff_context(lines: &[&str], current_idx: usize) -> bool {
    let context_range = current_idx.saturating_sub(15)..std::cmp::min(current_idx + 5, lines.len());

    let mut has_backoff_calc = false;
    let mut has_retry_context = false;

    for line in &lines[context_range] {
        let line = line.to_lowercase();

        // Growing delay: shifts, powers, multipliers, or the retry config's helpers
        if line.contains("<<")
            || line.contains("pow")
            || line.contains("* 2")
            || line.contains("next_delay")
            || line.contains("jittered")
        {
            has_backoff_calc = true;
        }

        if line.contains("retry")
            || line.contains("reconnect")
            || line.contains("backoff")
            || line.contains("attempt")
        {
            has_retry_context = true;
        }
    }

    has_backoff_calc && has_retry_context
}

/// Check if this is the `tokio::time::interval` pattern (acceptable for periodic tasks)
fn is_interval_pattern(lines: &[&str], current_idx: usize) -> bool {
    let backward = current_idx.saturating_sub(20)..current_idx;
    if lines[backward]
        .iter()
        .any(|line| line.contains(".tick()") || line.contains("tokio::time::interval"))
    {
        return true;
    }

    let forward = current_idx..std::cmp::min(current_idx + 5, lines.len());
    lines[forward].iter().any(|line| line.contains(".tick()"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn violations(code: &[&str]) -> usize {
        scan(Path::new("sample.rs"), code, &SleepPolicy::default()).len()
    }

    #[test]
    fn test_sleep_violation_detection() {
        let code = ["async fn poll() {", "    tokio::time::sleep(Duration::from_millis(10)).await;", "}"];
        assert_eq!(violations(&code), 1);
    }

    #[test]
    fn test_backoff_detection() {
        let code = [
            "let backoff = config.jittered(delay);",
            "tracing::warn!(attempt = attempts, \"Attempt failed, backing off\");",
            "tokio::select! {",
            "    () = cancel.cancelled() => return Err(RetryError::Cancelled),",
            "    () = tokio::time::sleep(backoff) => {}",
            "}",
            "delay = config.next_delay(delay);",
        ];
        assert!(is_backoff_context(&code, 4));
        assert_eq!(violations(&code), 0);
    }

    #[test]
    fn test_test_module_is_exempt() {
        let code = [
            "fn production() {}",
            "#[cfg(test)]",
            "mod tests {",
            "    async fn helper() {",
            "        tokio::time::sleep(Duration::from_millis(10)).await;",
            "    }",
            "}",
        ];
        assert_eq!(violations(&code), 0);
    }

    #[test]
    fn test_commented_sleep_ignored() {
        let code = ["fn f() {", "    // tokio::time::sleep(d).await;", "}"];
        assert_eq!(violations(&code), 0);
    }
}
