use chrono::{DateTime, Utc};
use evs_core::{fileset_checksum, ReportStatus, RuleCheck, RuleStatus, Severity, ValidationMode, ValidationReport};
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::rule::{default_rules, Rule};
use crate::types::{Evaluation, ValidateInput, ValidationConfig};

/// Runs every rule against one bundle and folds the results into a report.
pub struct ValidationEngine {
    rules: Vec<Box<dyn Rule>>,
}

impl ValidationEngine {
    pub fn new(rules: Vec<Box<dyn Rule>>) -> Self {
        Self { rules }
    }

    pub fn from_config(cfg: &ValidationConfig) -> Result<Self, regex::Error> {
        Ok(Self::new(default_rules(cfg)?))
    }

    pub fn rule_codes(&self) -> Vec<&'static str> {
        let mut codes: Vec<_> = self.rules.iter().map(|r| r.code()).collect();
        codes.sort_unstable();
        codes
    }

    pub fn run(&self, input: &ValidateInput, mode: ValidationMode, now: DateTime<Utc>) -> ValidationReport {
        let mut report = ValidationReport {
            task_ref: input.task_ref.clone(),
            window: input.window.clone(),
            mode,
            status: ReportStatus::Skipped,
            completeness_score: 1.0,
            total_checks: 0,
            passed_checks: 0,
            failed_checks: 0,
            warnings: 0,
            checks: vec![],
            findings: vec![],
            ready_for_submission: true,
            bypassed: false,
            fileset_checksum: fileset_checksum(&input.files),
            validated_at: now,
        };

        if mode == ValidationMode::Skip {
            warn!(
                task_ref = %input.task_ref,
                window = %input.window,
                "validation bypassed: no rules run"
            );
            report.bypassed = true;
            return report;
        }

        // Rules are read-only; evaluate in parallel, then order by code.
        let mut results: Vec<(&dyn Rule, Evaluation)> = self
            .rules
            .par_iter()
            .map(|r| (r.as_ref(), r.eval(input)))
            .collect();
        results.sort_by_key(|(r, _)| r.code());

        let mut executed = 0usize;
        for (rule, eval) in results {
            let (status, message) = match eval {
                Evaluation::Passed => {
                    executed += 1;
                    report.passed_checks += 1;
                    (RuleStatus::Passed, "check passed".to_string())
                }
                Evaluation::Skipped(reason) => (RuleStatus::Skipped, reason),
                Evaluation::Findings(findings) => {
                    executed += 1;
                    let errors = findings.iter().filter(|f| f.severity == Severity::Error).count();
                    let status = if errors > 0 {
                        report.failed_checks += 1;
                        RuleStatus::Failed
                    } else {
                        report.warnings += 1;
                        RuleStatus::Warning
                    };
                    let message = match findings.as_slice() {
                        [only] => only.message.clone(),
                        [first, ..] => format!("{} issues, first: {}", findings.len(), first.message),
                        [] => String::new(),
                    };
                    report.findings.extend(findings.into_iter().map(|mut f| {
                        if mode == ValidationMode::Advisory {
                            f.severity = Severity::Info;
                        }
                        f
                    }));
                    (status, message)
                }
            };
            debug!(rule = rule.code(), status = ?status, "rule evaluated");
            report.checks.push(RuleCheck {
                code: rule.code().to_string(),
                name: rule.name().to_string(),
                status,
                severity: rule.severity(),
                message,
            });
        }

        report.total_checks = report.checks.len();
        if executed > 0 {
            report.completeness_score = report.passed_checks as f64 / executed as f64;
        }
        report.status = if report.failed_checks > 0 {
            ReportStatus::Failed
        } else if report.warnings > 0 {
            ReportStatus::Warning
        } else {
            ReportStatus::Passed
        };
        report.ready_for_submission = match mode {
            ValidationMode::Strict => report.failed_checks == 0 && report.warnings == 0,
            ValidationMode::Lenient => report.failed_checks == 0,
            ValidationMode::Advisory | ValidationMode::Skip => true,
        };
        report
    }
}
