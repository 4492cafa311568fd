//! Security detection rule library.
//!
//! Static catalogue of regex patterns matched against every message that
//! crosses the gateway, used to highlight security-relevant traffic in an
//! educational setting (leaked secrets, captured flags, injection payloads).
//! Each entry carries a snake_case name, a severity, and a regex string that
//! is compiled once at scanner construction.

use regex::{Regex, RegexSet};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum length of a matched excerpt kept in a finding.
///
/// Caps memory use when a rule matches inside a pathological payload.
const MAX_EXCERPT_LEN: usize = 100;

/// How alarming a matched rule is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Secrets or credentials exposed
    Critical,
    /// Exploitation succeeded or is likely
    High,
    /// Suspicious payload worth highlighting
    Medium,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
        }
    }
}

/// A single detection rule.
pub struct DetectionRule {
    /// Short snake_case identifier used in logs and findings.
    pub name: &'static str,
    /// How alarming a match is.
    pub severity: Severity,
    /// Regex string (compiled by [`RuleScanner`]).
    pub pattern: &'static str,
    /// Human-readable explanation shown alongside matches.
    pub description: &'static str,
}

/// The built-in rule table.
///
/// Kept as a static slice so the catalogue is available at zero runtime cost
/// until the scanner compiles it.
pub static RULES: &[DetectionRule] = &[
    DetectionRule {
        name: "api_key_leak",
        severity: Severity::Critical,
        pattern: r#"(?i)(sk-[a-zA-Z0-9]{32,}|api_?key[:=]\s*['"]?[a-zA-Z0-9_-]{20,})"#,
        description: "API key or secret token exposed in message",
    },
    DetectionRule {
        name: "flag_leak",
        severity: Severity::High,
        pattern: r"(?i)ARENA\{[^}]+\}",
        description: "Challenge flag discovered",
    },
    DetectionRule {
        name: "password_exposure",
        severity: Severity::Critical,
        pattern: r#"(?i)password[:=]\s*['"]?[a-zA-Z0-9_@!#$%^&*]{6,}"#,
        description: "Password leaked in message",
    },
    DetectionRule {
        name: "sql_injection",
        severity: Severity::Medium,
        pattern: r"(?i)(union\s+select|or\s+1\s*=\s*1|';--)",
        description: "Potential SQL injection payload detected",
    },
    DetectionRule {
        name: "command_injection",
        severity: Severity::High,
        pattern: r"(?i)(;\s*cat\s+|;\s*ls\s+|\|\s*cat\s+|\$\(.*\)|`.*`)",
        description: "Shell command injection attempt",
    },
    DetectionRule {
        name: "path_traversal",
        severity: Severity::Medium,
        pattern: r"(?i)\.\./|\.\.\\",
        description: "Path traversal attempt detected",
    },
];

/// A single match produced by the scanner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    /// The `name` of the [`DetectionRule`] that matched.
    pub rule: String,
    /// Severity inherited from the rule.
    pub severity: Severity,
    /// Matched substring, truncated to [`MAX_EXCERPT_LEN`].
    pub matched_excerpt: String,
    /// Byte offset of the match within the scanned text.
    pub offset: usize,
}

impl Finding {
    /// Synthetic finding attached to inbound bodies that failed envelope
    /// validation; not part of the rule table.
    pub fn protocol_violation(detail: &str) -> Self {
        Self {
            rule: "protocol_violation".to_string(),
            severity: Severity::Medium,
            matched_excerpt: truncate_excerpt(detail),
            offset: 0,
        }
    }
}

fn truncate_excerpt(text: &str) -> String {
    if text.len() <= MAX_EXCERPT_LEN {
        return text.to_string();
    }
    let mut end = MAX_EXCERPT_LEN;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

/// Errors from compiling the rule table.
#[derive(Debug, thiserror::Error)]
pub enum ScannerError {
    #[error("failed to compile detection rule: {0}")]
    RegexCompile(#[from] regex::Error),
}

/// Compiled scanner backed by a [`RegexSet`] for cheap multi-rule matching,
/// with individual [`Regex`] objects kept alongside for extracting match
/// positions and text.
pub struct RuleScanner {
    regex_set: RegexSet,
    /// Parallel vec in the same order as [`RULES`].
    individual: Vec<Regex>,
}

impl RuleScanner {
    /// Compile every rule in the table.
    pub fn new() -> Result<Self, ScannerError> {
        let patterns: Vec<&str> = RULES.iter().map(|r| r.pattern).collect();
        let regex_set = RegexSet::new(&patterns)?;
        let individual = patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            regex_set,
            individual,
        })
    }

    /// Scan `text` against every rule, returning findings sorted by offset.
    ///
    /// A single rule may match multiple times; every match produces its own
    /// finding.
    pub fn scan(&self, text: &str) -> Vec<Finding> {
        let mut findings: Vec<Finding> = Vec::new();

        for idx in self.regex_set.matches(text).into_iter() {
            let rule = &RULES[idx];
            for m in self.individual[idx].find_iter(text) {
                findings.push(Finding {
                    rule: rule.name.to_string(),
                    severity: rule.severity,
                    matched_excerpt: truncate_excerpt(m.as_str()),
                    offset: m.start(),
                });
            }
        }

        findings.sort_by_key(|f| f.offset);
        findings
    }

    /// Number of compiled rules.
    pub fn rule_count(&self) -> usize {
        self.individual.len()
    }
}
