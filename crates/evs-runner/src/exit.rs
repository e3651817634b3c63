use evs_core::{ReportStatus, SubmissionBatch, ValidationReport};

use crate::error::TaskError;

pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILED: i32 = 1;
pub const EXIT_WARNINGS: i32 = 2;
pub const EXIT_CONFIG: i32 = 3;
pub const EXIT_NOT_FOUND: i32 = 4;
pub const EXIT_AUTH: i32 = 5;

/// Batch exit code when every task failed.
pub const EXIT_ALL_FAILED: i32 = 2;

pub fn validation_exit_code(report: &ValidationReport) -> i32 {
    if !report.ready_for_submission {
        return EXIT_FAILED;
    }
    match report.status {
        ReportStatus::Passed | ReportStatus::Skipped => EXIT_OK,
        ReportStatus::Warning | ReportStatus::Failed => EXIT_WARNINGS,
    }
}

pub fn task_error_exit_code(err: &TaskError) -> i32 {
    match err {
        TaskError::Configuration { .. } => EXIT_CONFIG,
        TaskError::NotFound { .. } => EXIT_NOT_FOUND,
        TaskError::Authentication { .. } => EXIT_AUTH,
        _ => EXIT_FAILED,
    }
}

pub fn batch_exit_code(batch: &SubmissionBatch) -> i32 {
    if batch.submitted_tasks == batch.total_tasks {
        EXIT_OK
    } else if batch.submitted_tasks == 0 {
        EXIT_ALL_FAILED
    } else {
        EXIT_FAILED
    }
}
