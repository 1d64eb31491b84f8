//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: Production code in the daemon MUST NOT use blocking I/O.
//! **Required**: Use `tokio::fs`, `tokio::net`, `tokio::process`, not
//! `std::fs`, `std::net`, `std::process::Command`.

use std::fs;
use std::path::Path;

use architectural_enforcement::{
    code_part, is_in_async_function, is_in_test_function, production_files, test_module_start,
    Violation,
};

/// Test that production code does not use blocking I/O
#[test]
fn test_no_blocking_io_in_production_code() {
    let violations = find_blocking_io_violations();

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Blocking I/O calls found in production code!\n");

        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }

        eprintln!("\n❌ FORBIDDEN blocking I/O:");
        eprintln!("  - std::fs::read(), std::fs::write(), std::fs::File");
        eprintln!("  - std::net::TcpStream, std::net::TcpListener");
        eprintln!("  - std::process::Command::output()");
        eprintln!("  - reqwest::blocking::*");
        eprintln!("  - std::io::stdin()/stdout() inside async functions");
        eprintln!("\n✅ REQUIRED async I/O:");
        eprintln!("  - tokio::fs::read().await, tokio::fs::write().await");
        eprintln!("  - tokio::net::UnixStream::connect().await");
        eprintln!("  - reqwest::Client::post().send().await");

        panic!(
            "\nFound {} blocking I/O violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}

fn find_blocking_io_violations() -> Vec<Violation> {
    let mut violations = Vec::new();
    for path in production_files() {
        let Ok(content) = fs::read_to_string(&path) else {
            continue;
        };
        let lines: Vec<&str> = content.lines().collect();
        violations.extend(scan(&path, &lines));
    }
    violations
}

fn scan(path: &Path, lines: &[&str]) -> Vec<Violation> {
    let test_start = test_module_start(lines).unwrap_or(lines.len());
    let mut found = Vec::new();

    for (idx, line) in lines.iter().enumerate() {
        if idx >= test_start {
            break;
        }
        if is_in_test_function(lines, idx) {
            continue;
        }

        let code = code_part(line);
        let mut flag = |reason: &str| {
            found.push(Violation {
                path: path.to_path_buf(),
                line: idx + 1,
                reason: reason.to_string(),
                source: (*line).to_string(),
            });
        };

        if code.contains("std::fs::") || code.contains("use std::fs") {
            flag("Blocking file I/O");
        }

        if code.contains("std::net::") || code.contains("use std::net") {
            flag("Blocking network I/O");
        }

        if code.contains("std::process::Command") {
            flag("Blocking process I/O");
        }

        if code.contains("reqwest::blocking") {
            flag("Blocking HTTP client");
        }

        if (code.contains("std::io::stdin()") || code.contains("std::io::stdout()"))
            && is_in_async_function(lines, idx)
        {
            flag("Blocking stdin/stdout in async");
        }
    }

    found
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reasons(code: &[&str]) -> Vec<String> {
        scan(Path::new("sample.rs"), code)
            .into_iter()
            .map(|v| v.reason)
            .collect()
    }

    #[test]
    fn test_blocking_io_detection() {
        let code = [
            "async fn load() {",
            "    let contents = std::fs::read_to_string(\"file.txt\")?;",
            "}",
        ];
        assert_eq!(reasons(&code), vec!["Blocking file I/O".to_string()]);
    }

    #[test]
    fn test_stdout_only_flagged_in_async() {
        let sync = ["fn print_chunk(chunk: Chunk) {", "    let out = std::io::stdout().lock();", "}"];
        assert!(reasons(&sync).is_empty());

        let async_code = ["async fn run() {", "    let out = std::io::stdout().lock();", "}"];
        assert_eq!(reasons(&async_code).len(), 1);
    }

    #[test]
    fn test_test_module_is_exempt() {
        let code = [
            "#[cfg(test)]",
            "mod tests {",
            "    fn read() { std::fs::metadata(\"x\").unwrap(); }",
            "}",
        ];
        assert!(reasons(&code).is_empty());
    }

    #[test]
    fn test_tokio_fs_allowed() {
        let code = ["async fn save() {", "    tokio::fs::write(path, bytes).await?;", "}"];
        assert!(reasons(&code).is_empty());
    }
}
