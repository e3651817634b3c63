use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle of one task/window submission.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Draft,
    Validating,
    ValidationFailed,
    Validated,
    Submitting,
    SubmissionFailed,
    Submitted,
    Accepted,
    Rejected,
}

impl SubmissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionStatus::Draft => "draft",
            SubmissionStatus::Validating => "validating",
            SubmissionStatus::ValidationFailed => "validation_failed",
            SubmissionStatus::Validated => "validated",
            SubmissionStatus::Submitting => "submitting",
            SubmissionStatus::SubmissionFailed => "submission_failed",
            SubmissionStatus::Submitted => "submitted",
            SubmissionStatus::Accepted => "accepted",
            SubmissionStatus::Rejected => "rejected",
        }
    }

    /// The remote platform holds a record for this submission.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            SubmissionStatus::Submitted | SubmissionStatus::Accepted | SubmissionStatus::Rejected
        )
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        }
    }
}

/// Which finding severities block submission.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    /// Errors and warnings block.
    #[default]
    Strict,
    /// Only errors block.
    Lenient,
    /// Nothing blocks; findings are downgraded to info.
    Advisory,
    /// No rules run. Recorded as a bypass.
    Skip,
}

impl ValidationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationMode::Strict => "strict",
            ValidationMode::Lenient => "lenient",
            ValidationMode::Advisory => "advisory",
            ValidationMode::Skip => "skip",
        }
    }
}

impl fmt::Display for ValidationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown validation mode `{0}` (expected strict, lenient, advisory or skip)")]
pub struct UnknownMode(pub String);

impl FromStr for ValidationMode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(ValidationMode::Strict),
            "lenient" => Ok(ValidationMode::Lenient),
            "advisory" => Ok(ValidationMode::Advisory),
            "skip" => Ok(ValidationMode::Skip),
            other => Err(UnknownMode(other.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleStatus {
    Passed,
    Failed,
    Warning,
    Skipped,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Passed,
    Warning,
    Failed,
    Skipped,
}

/// Remote verdict on a submission.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RemoteOutcome {
    Pending,
    Accepted,
    Rejected { reason: String },
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Running,
    Completed,
    CompletedWithFailures,
    Failed,
    Cancelled,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BatchStatus::Pending | BatchStatus::Running)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BatchTaskStatus {
    Pending,
    Success,
    Failed,
    Skipped,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RemoteIdPolicy {
    /// Every resubmission gets a fresh remote id.
    #[default]
    MintNew,
    /// The resubmission names the rejected remote id it replaces.
    Reuse,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!("Strict".parse::<ValidationMode>().unwrap(), ValidationMode::Strict);
        assert_eq!(" skip ".parse::<ValidationMode>().unwrap(), ValidationMode::Skip);
        assert!("loose".parse::<ValidationMode>().is_err());
    }

    #[test]
    fn status_serializes_snake_case() {
        let s = serde_json::to_string(&SubmissionStatus::ValidationFailed).unwrap();
        assert_eq!(s, "\"validation_failed\"");
        assert_eq!(SubmissionStatus::SubmissionFailed.as_str(), "submission_failed");
    }

    #[test]
    fn rejected_outcome_carries_reason() {
        let o = RemoteOutcome::Rejected { reason: "wrong period".into() };
        let s = serde_json::to_string(&o).unwrap();
        assert_eq!(s, r#"{"outcome":"rejected","reason":"wrong period"}"#);
    }
}
