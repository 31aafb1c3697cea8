//! Validation reports and verdicts.

use serde::{Deserialize, Serialize};

/// How much a failed check matters. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    /// Failure rejects the result; the worker gets another attempt.
    Blocking,
    /// Failure is irrecoverable and escalates immediately.
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Blocking => "blocking",
            Severity::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub check_name: String,
    pub passed: bool,
    pub detail: String,
    pub severity: Severity,
}

impl ValidationReport {
    /// Failed at blocking severity or above.
    pub fn blocks(&self) -> bool {
        !self.passed && self.severity >= Severity::Blocking
    }
}

/// Ordered reports from one gate run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub reports: Vec<ValidationReport>,
}

impl Verdict {
    pub fn new(reports: Vec<ValidationReport>) -> Self {
        Self { reports }
    }

    /// Accepted iff nothing at blocking severity or above failed.
    pub fn accepted(&self) -> bool {
        !self.reports.iter().any(ValidationReport::blocks)
    }

    /// A critical check failed; revising will not help.
    pub fn irrecoverable(&self) -> bool {
        self.reports
            .iter()
            .any(|r| !r.passed && r.severity == Severity::Critical)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ValidationReport> {
        self.reports.iter().filter(|r| !r.passed)
    }

    /// One-line summary of failed checks, e.g. `"schema (blocking): missing title"`.
    pub fn summary(&self) -> String {
        let failed: Vec<String> = self
            .failures()
            .map(|r| format!("{} ({}): {}", r.check_name, r.severity, r.detail))
            .collect();
        if failed.is_empty() {
            "all checks passed".to_string()
        } else {
            failed.join("; ")
        }
    }
}
