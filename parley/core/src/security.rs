//! Security Module
//!
//! Input sanitization for user messages before they reach a provider.
//!
//! Security is enforced at the boundary where untrusted input enters the
//! daemon. Cleaning (length limits, control characters, line endings) is
//! applied; detection (sensitive data, prompt-injection phrases) only raises
//! warnings and never blocks the message.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Limits applied by the sanitizer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanitizerLimits {
    /// Maximum input length in characters (default: 100 000)
    pub max_input_chars: usize,
    /// Maximum number of lines (default: 10 000)
    pub max_lines: usize,
}

impl Default for SanitizerLimits {
    fn default() -> Self {
        Self {
            max_input_chars: 100_000,
            max_lines: 10_000,
        }
    }
}

/// Kind of sanitizer warning
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// Input cut to the maximum length
    Truncated,
    /// Input cut to the maximum line count
    LinesTruncated,
    /// Looks like a card number or SSN
    SensitiveData,
    /// Contains a known prompt-injection phrase
    PotentialInjection,
}

impl WarningKind {
    /// Wire name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Truncated => "truncated",
            Self::LinesTruncated => "lines_truncated",
            Self::SensitiveData => "sensitive_data",
            Self::PotentialInjection => "potential_injection",
        }
    }
}

impl fmt::Display for WarningKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One sanitizer finding
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanitizeWarning {
    /// What was found
    pub kind: WarningKind,
    /// Human-readable description
    pub message: String,
}

/// Cleaned input plus findings
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanitizeResult {
    /// Cleaned input
    pub input: String,
    /// Findings, in detection order
    pub warnings: Vec<SanitizeWarning>,
}

impl SanitizeResult {
    /// Whether a warning of `kind` was raised
    #[must_use]
    pub fn has_warning(&self, kind: WarningKind) -> bool {
        self.warnings.iter().any(|w| w.kind == kind)
    }

    fn warn(&mut self, kind: WarningKind, message: &str) {
        self.warnings.push(SanitizeWarning {
            kind,
            message: message.to_string(),
        });
    }
}

/// 13-19 digits, optionally separated by spaces or dashes
static CARD_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| compile(r"\b(?:\d[ -]*?){13,19}\b"));

/// ddd-dd-dddd
static SSN_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| compile(r"\b\d{3}-\d{2}-\d{4}\b"));

fn compile(pattern: &str) -> Option<Regex> {
    Regex::new(pattern)
        .map_err(|e| tracing::error!(pattern, error = %e, "Invalid sanitizer pattern"))
        .ok()
}

/// Known prompt-injection phrases (lowercase; matched case-insensitively)
const INJECTION_PHRASES: &[&str] = &[
    "ignore previous instructions",
    "ignore all previous",
    "disregard previous",
    "forget your instructions",
    "you are now",
    "system prompt",
    "reveal your prompt",
    "show me your instructions",
    "what are your instructions",
    "developer mode",
    "jailbreak",
    "dan mode",
];

/// User input sanitizer
#[derive(Clone, Debug, Default)]
pub struct Sanitizer {
    limits: SanitizerLimits,
}

impl Sanitizer {
    /// Create a sanitizer with the given limits
    #[must_use]
    pub fn new(limits: SanitizerLimits) -> Self {
        Self { limits }
    }

    /// Limits in use
    #[must_use]
    pub fn limits(&self) -> &SanitizerLimits {
        &self.limits
    }

    /// Clean `raw` and report findings
    #[must_use]
    pub fn sanitize(&self, raw: &str) -> SanitizeResult {
        let mut result = SanitizeResult::default();

        // 1. Length (characters, so multi-byte input is never split)
        let mut input: String = if raw.chars().count() > self.limits.max_input_chars {
            result.warn(
                WarningKind::Truncated,
                "Input was truncated to maximum length",
            );
            raw.chars().take(self.limits.max_input_chars).collect()
        } else {
            raw.to_string()
        };

        // 2. Line endings, before control stripping so CR still marks a break
        input = input.replace("\r\n", "\n").replace('\r', "\n");

        // 3. Control characters other than newline and tab
        input.retain(|c| !c.is_control() || c == '\n' || c == '\t');

        // 4. Line count
        if input.split('\n').count() > self.limits.max_lines {
            input = input
                .split('\n')
                .take(self.limits.max_lines)
                .collect::<Vec<_>>()
                .join("\n");
            result.warn(
                WarningKind::LinesTruncated,
                "Input was truncated to maximum line count",
            );
        }

        // 5. Detection only
        if detects_sensitive_data(&input) {
            result.warn(
                WarningKind::SensitiveData,
                "Input may contain sensitive information (credit card or SSN pattern detected)",
            );
        }
        if detects_injection(&input) {
            result.warn(
                WarningKind::PotentialInjection,
                "Input contains patterns similar to prompt injection attempts",
            );
        }

        result.input = input;
        result
    }
}

fn detects_sensitive_data(input: &str) -> bool {
    [&*CARD_PATTERN, &*SSN_PATTERN]
        .into_iter()
        .flatten()
        .any(|pattern| pattern.is_match(input))
}

fn detects_injection(input: &str) -> bool {
    let lower = input.to_lowercase();
    INJECTION_PHRASES.iter().any(|phrase| lower.contains(phrase))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_clean_input_passes_unchanged() {
        let result = Sanitizer::default().sanitize("What's the capital of France?\n\tThanks");
        assert_eq!(result.input, "What's the capital of France?\n\tThanks");
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_truncates_by_characters() {
        let sanitizer = Sanitizer::new(SanitizerLimits {
            max_input_chars: 3,
            max_lines: 10,
        });
        let result = sanitizer.sanitize("héllo");
        assert_eq!(result.input, "hél");
        assert!(result.has_warning(WarningKind::Truncated));
    }

    #[test]
    fn test_strips_control_characters() {
        let result = Sanitizer::default().sanitize("a\0b\x07c\x1b[31md\x08e");
        assert_eq!(result.input, "abc[31mde");
    }

    #[test]
    fn test_normalizes_line_endings() {
        let result = Sanitizer::default().sanitize("one\r\ntwo\rthree");
        assert_eq!(result.input, "one\ntwo\nthree");
    }

    #[test]
    fn test_truncates_lines() {
        let sanitizer = Sanitizer::new(SanitizerLimits {
            max_input_chars: 1000,
            max_lines: 2,
        });
        let result = sanitizer.sanitize("a\nb\nc\nd");
        assert_eq!(result.input, "a\nb");
        assert!(result.has_warning(WarningKind::LinesTruncated));
    }

    #[test]
    fn test_flags_card_number() {
        let result = Sanitizer::default().sanitize("my card is 4111 1111 1111 1111 ok");
        assert!(result.has_warning(WarningKind::SensitiveData));
        // Detection never alters the text
        assert!(result.input.contains("4111 1111 1111 1111"));
    }

    #[test]
    fn test_flags_ssn() {
        let result = Sanitizer::default().sanitize("ssn 123-45-6789");
        assert!(result.has_warning(WarningKind::SensitiveData));
    }

    #[test]
    fn test_short_numbers_not_flagged() {
        let result = Sanitizer::default().sanitize("call me at 555 1234 in 2024");
        assert!(!result.has_warning(WarningKind::SensitiveData));
    }

    #[test]
    fn test_flags_injection_case_insensitive() {
        for text in ["Please IGNORE previous instructions", "enable DAN mode now"] {
            let result = Sanitizer::default().sanitize(text);
            assert!(result.has_warning(WarningKind::PotentialInjection), "{text}");
        }
    }

    #[test]
    fn test_warning_wire_names() {
        let json = serde_json::to_string(&WarningKind::LinesTruncated).unwrap();
        assert_eq!(json, "\"lines_truncated\"");
    }
}
