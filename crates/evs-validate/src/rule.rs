use std::collections::BTreeSet;

use evs_core::{CollectionWindow, Severity, ValidationError};
use regex::Regex;

use crate::types::{is_text_extension, Evaluation, ValidateInput, ValidationCategory, ValidationConfig};

pub trait Rule: Send + Sync {
    fn code(&self) -> &'static str;
    fn name(&self) -> &'static str;
    fn category(&self) -> ValidationCategory;
    fn severity(&self) -> Severity;
    fn eval(&self, input: &ValidateInput) -> Evaluation;
}

/// Full rule set built from config. Fails only on a malformed task-ref pattern.
pub fn default_rules(cfg: &ValidationConfig) -> Result<Vec<Box<dyn Rule>>, regex::Error> {
    let rules: Vec<Box<dyn Rule>> = vec![
        Box::new(ChecksumPresentRule),
        Box::new(CollectionPlanCompleteRule),
        Box::new(ControlsCoverageRule),
        Box::new(FileSizeLimitsRule { max_bytes: cfg.max_file_size_bytes }),
        Box::new(FileTimestampsInWindowRule { grace_days: cfg.timestamp_grace_days }),
        Box::new(MinimumFileCountRule { recommended: cfg.min_recommended_files }),
        Box::new(NonEmptyContentRule),
        Box::new(NoPlaceholdersRule { markers: cfg.placeholder_markers.clone() }),
        Box::new(SourceDeclaredRule),
        Box::new(TextFormatRule),
        Box::new(ValidFileExtensionsRule::new(&cfg.allowed_extensions)),
        Box::new(ValidTaskRefRule::new(&cfg.task_ref_pattern)?),
        Box::new(WindowFormatRule),
    ];
    Ok(rules)
}

fn issue(
    code: &str,
    severity: Severity,
    message: impl Into<String>,
    field: Option<&str>,
    suggestion: Option<&str>,
) -> ValidationError {
    ValidationError {
        code: code.to_string(),
        severity,
        message: message.into(),
        field: field.map(str::to_string),
        suggestion: suggestion.map(str::to_string),
    }
}

pub struct ChecksumPresentRule;

impl Rule for ChecksumPresentRule {
    fn code(&self) -> &'static str {
        "CHECKSUM_PRESENT"
    }
    fn name(&self) -> &'static str {
        "Checksum Present"
    }
    fn category(&self) -> ValidationCategory {
        ValidationCategory::Metadata
    }
    fn severity(&self) -> Severity {
        Severity::Error
    }

    fn eval(&self, input: &ValidateInput) -> Evaluation {
        let findings = input
            .files
            .iter()
            .filter(|f| f.checksum_sha256.as_deref().map_or(true, str::is_empty))
            .map(|f| {
                issue(
                    self.code(),
                    Severity::Error,
                    format!("{} has no recorded checksum", f.filename),
                    Some("checksum_sha256"),
                    Some("Regenerate the evidence listing so checksums are computed"),
                )
            })
            .collect();
        Evaluation::from_findings(findings)
    }
}

pub struct CollectionPlanCompleteRule;

impl Rule for CollectionPlanCompleteRule {
    fn code(&self) -> &'static str {
        "COLLECTION_PLAN_COMPLETE"
    }
    fn name(&self) -> &'static str {
        "Collection Plan Complete"
    }
    fn category(&self) -> ValidationCategory {
        ValidationCategory::Completeness
    }
    fn severity(&self) -> Severity {
        Severity::Warning
    }

    fn eval(&self, input: &ValidateInput) -> Evaluation {
        let Some(plan) = &input.plan else {
            return Evaluation::Skipped("no collection plan metadata".to_string());
        };
        if plan.completeness >= 1.0 {
            return Evaluation::Passed;
        }
        Evaluation::Findings(vec![issue(
            self.code(),
            Severity::Warning,
            format!("collection plan reports {:.0}% complete", plan.completeness * 100.0),
            Some("completeness"),
            Some("Finish the outstanding collection plan items before submitting"),
        )])
    }
}

pub struct ControlsCoverageRule;

impl Rule for ControlsCoverageRule {
    fn code(&self) -> &'static str {
        "CONTROLS_COVERAGE"
    }
    fn name(&self) -> &'static str {
        "Required Controls Covered"
    }
    fn category(&self) -> ValidationCategory {
        ValidationCategory::Completeness
    }
    fn severity(&self) -> Severity {
        Severity::Error
    }

    fn eval(&self, input: &ValidateInput) -> Evaluation {
        if input.required_controls.is_empty() {
            return Evaluation::Skipped("task has no required controls mapped".to_string());
        }
        let covered: BTreeSet<&str> = input
            .files
            .iter()
            .flat_map(|f| f.controls_satisfied.iter().map(String::as_str))
            .collect();
        let findings = input
            .required_controls
            .iter()
            .filter(|c| !covered.contains(c.as_str()))
            .map(|c| {
                issue(
                    self.code(),
                    Severity::Error,
                    format!("no evidence file covers required control {c}"),
                    Some("controls_satisfied"),
                    Some("Collect evidence for the control or map an existing file to it"),
                )
            })
            .collect();
        Evaluation::from_findings(findings)
    }
}

pub struct FileSizeLimitsRule {
    pub max_bytes: u64,
}

impl Rule for FileSizeLimitsRule {
    fn code(&self) -> &'static str {
        "FILE_SIZE_LIMITS"
    }
    fn name(&self) -> &'static str {
        "File Size Limits"
    }
    fn category(&self) -> ValidationCategory {
        ValidationCategory::Format
    }
    fn severity(&self) -> Severity {
        Severity::Error
    }

    fn eval(&self, input: &ValidateInput) -> Evaluation {
        let findings = input
            .files
            .iter()
            .filter(|f| f.size_bytes > self.max_bytes)
            .map(|f| {
                issue(
                    self.code(),
                    Severity::Error,
                    format!("{} is {} bytes, limit is {}", f.filename, f.size_bytes, self.max_bytes),
                    Some("size_bytes"),
                    Some("Split or compress the file"),
                )
            })
            .collect();
        Evaluation::from_findings(findings)
    }
}

pub struct FileTimestampsInWindowRule {
    pub grace_days: u32,
}

impl Rule for FileTimestampsInWindowRule {
    fn code(&self) -> &'static str {
        "FILE_TIMESTAMPS_IN_WINDOW"
    }
    fn name(&self) -> &'static str {
        "File Timestamps In Window"
    }
    fn category(&self) -> ValidationCategory {
        ValidationCategory::Content
    }
    fn severity(&self) -> Severity {
        Severity::Warning
    }

    fn eval(&self, input: &ValidateInput) -> Evaluation {
        // Malformed windows are WINDOW_FORMAT's concern.
        let Ok(window) = CollectionWindow::parse(input.window.as_str()) else {
            return Evaluation::Skipped("window is not a recognised period".to_string());
        };
        let findings = input
            .files
            .iter()
            .filter_map(|f| f.modified_at.map(|ts| (f, ts)))
            .filter(|(_, ts)| !window.contains(*ts, self.grace_days))
            .map(|(f, ts)| {
                issue(
                    self.code(),
                    Severity::Warning,
                    format!(
                        "{} was last modified {} which is outside {} ({} to {})",
                        f.filename,
                        ts.format("%Y-%m-%d"),
                        input.window,
                        window.start,
                        window.end
                    ),
                    Some("modified_at"),
                    Some("Regenerate the evidence for the declared window"),
                )
            })
            .collect();
        Evaluation::from_findings(findings)
    }
}

pub struct MinimumFileCountRule {
    pub recommended: usize,
}

impl Rule for MinimumFileCountRule {
    fn code(&self) -> &'static str {
        "MINIMUM_FILE_COUNT"
    }
    fn name(&self) -> &'static str {
        "Minimum File Count"
    }
    fn category(&self) -> ValidationCategory {
        ValidationCategory::Completeness
    }
    fn severity(&self) -> Severity {
        Severity::Error
    }

    fn eval(&self, input: &ValidateInput) -> Evaluation {
        let n = input.files.len();
        if n == 0 {
            return Evaluation::Findings(vec![issue(
                self.code(),
                Severity::Error,
                "no evidence files found",
                None,
                Some("Generate evidence for this task and window first"),
            )]);
        }
        if n < self.recommended {
            return Evaluation::Findings(vec![issue(
                self.code(),
                Severity::Warning,
                format!("{n} evidence file(s), at least {} recommended", self.recommended),
                None,
                None,
            )]);
        }
        Evaluation::Passed
    }
}

pub struct NonEmptyContentRule;

impl Rule for NonEmptyContentRule {
    fn code(&self) -> &'static str {
        "NON_EMPTY_CONTENT"
    }
    fn name(&self) -> &'static str {
        "Non-Empty Content"
    }
    fn category(&self) -> ValidationCategory {
        ValidationCategory::Content
    }
    fn severity(&self) -> Severity {
        Severity::Error
    }

    fn eval(&self, input: &ValidateInput) -> Evaluation {
        let findings = input
            .files
            .iter()
            .filter(|f| f.size_bytes == 0)
            .map(|f| {
                issue(
                    self.code(),
                    Severity::Error,
                    format!("{} is empty", f.filename),
                    Some("size_bytes"),
                    Some("Remove the file or regenerate its content"),
                )
            })
            .collect();
        Evaluation::from_findings(findings)
    }
}

pub struct NoPlaceholdersRule {
    pub markers: Vec<String>,
}

impl Rule for NoPlaceholdersRule {
    fn code(&self) -> &'static str {
        "NO_PLACEHOLDERS"
    }
    fn name(&self) -> &'static str {
        "No Unresolved Placeholders"
    }
    fn category(&self) -> ValidationCategory {
        ValidationCategory::Content
    }
    fn severity(&self) -> Severity {
        Severity::Error
    }

    fn eval(&self, input: &ValidateInput) -> Evaluation {
        if input.contents.is_empty() || self.markers.is_empty() {
            return Evaluation::Skipped("no text content to scan".to_string());
        }
        let mut findings = vec![];
        for (filename, bytes) in &input.contents {
            let text = String::from_utf8_lossy(bytes);
            if let Some(marker) = self.markers.iter().find(|m| text.contains(m.as_str())) {
                findings.push(issue(
                    self.code(),
                    Severity::Error,
                    format!("{filename} contains unresolved placeholder `{marker}`"),
                    None,
                    Some("Fill in or remove the placeholder text"),
                ));
            }
        }
        Evaluation::from_findings(findings)
    }
}

pub struct SourceDeclaredRule;

impl Rule for SourceDeclaredRule {
    fn code(&self) -> &'static str {
        "SOURCE_DECLARED"
    }
    fn name(&self) -> &'static str {
        "Source Declared"
    }
    fn category(&self) -> ValidationCategory {
        ValidationCategory::Content
    }
    fn severity(&self) -> Severity {
        Severity::Warning
    }

    fn eval(&self, input: &ValidateInput) -> Evaluation {
        let findings = input
            .files
            .iter()
            .filter(|f| f.source.as_deref().map_or(true, |s| s.trim().is_empty()))
            .map(|f| {
                issue(
                    self.code(),
                    Severity::Warning,
                    format!("{} does not declare a producing source", f.filename),
                    Some("source"),
                    Some("Record the generating tool in .generation/metadata.yaml"),
                )
            })
            .collect();
        Evaluation::from_findings(findings)
    }
}

pub struct TextFormatRule;

impl TextFormatRule {
    fn check(ext: &str, bytes: &[u8]) -> Result<(), String> {
        match ext {
            "json" => serde_json::from_slice::<serde_json::Value>(bytes)
                .map(|_| ())
                .map_err(|e| format!("invalid JSON: {e}")),
            "yaml" | "yml" => serde_yaml::from_slice::<serde_yaml::Value>(bytes)
                .map(|_| ())
                .map_err(|e| format!("invalid YAML: {e}")),
            "csv" => {
                let text = std::str::from_utf8(bytes).map_err(|_| "CSV is not valid UTF-8".to_string())?;
                csv_column_check(text)
            }
            "md" | "markdown" => {
                let text = std::str::from_utf8(bytes).map_err(|_| "markdown is not valid UTF-8".to_string())?;
                if text.trim().is_empty() {
                    Err("markdown has no content".to_string())
                } else {
                    Ok(())
                }
            }
            _ => std::str::from_utf8(bytes)
                .map(|_| ())
                .map_err(|_| "text is not valid UTF-8".to_string()),
        }
    }
}

fn csv_fields(line: &str) -> usize {
    let mut fields = 1;
    let mut quoted = false;
    for c in line.chars() {
        match c {
            '"' => quoted = !quoted,
            ',' if !quoted => fields += 1,
            _ => {}
        }
    }
    fields
}

fn csv_column_check(text: &str) -> Result<(), String> {
    let mut rows = text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty());
    let Some((_, header)) = rows.next() else {
        return Err("CSV has no header row".to_string());
    };
    let width = csv_fields(header);
    for (idx, line) in rows {
        let n = csv_fields(line);
        if n != width {
            return Err(format!("CSV line {} has {n} columns, header has {width}", idx + 1));
        }
    }
    Ok(())
}

impl Rule for TextFormatRule {
    fn code(&self) -> &'static str {
        "TEXT_FORMAT"
    }
    fn name(&self) -> &'static str {
        "Text Format"
    }
    fn category(&self) -> ValidationCategory {
        ValidationCategory::Format
    }
    fn severity(&self) -> Severity {
        Severity::Error
    }

    fn eval(&self, input: &ValidateInput) -> Evaluation {
        let mut checked = 0;
        let mut findings = vec![];
        for file in &input.files {
            let Some(ext) = file.extension().filter(|e| is_text_extension(e)) else {
                continue;
            };
            let Some(bytes) = input.contents.get(&file.filename) else {
                continue;
            };
            checked += 1;
            if let Err(msg) = Self::check(&ext, bytes) {
                findings.push(issue(
                    self.code(),
                    Severity::Error,
                    format!("{}: {msg}", file.filename),
                    None,
                    Some("Fix the file so it parses in its declared format"),
                ));
            }
        }
        if checked == 0 {
            return Evaluation::Skipped("no text files loaded".to_string());
        }
        Evaluation::from_findings(findings)
    }
}

pub struct ValidFileExtensionsRule {
    allowed: BTreeSet<String>,
}

impl ValidFileExtensionsRule {
    pub fn new(allowed: &[String]) -> Self {
        Self {
            allowed: allowed
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }
}

impl Rule for ValidFileExtensionsRule {
    fn code(&self) -> &'static str {
        "VALID_FILE_EXTENSIONS"
    }
    fn name(&self) -> &'static str {
        "Valid File Extensions"
    }
    fn category(&self) -> ValidationCategory {
        ValidationCategory::Format
    }
    fn severity(&self) -> Severity {
        Severity::Warning
    }

    fn eval(&self, input: &ValidateInput) -> Evaluation {
        let findings = input
            .files
            .iter()
            .filter(|f| f.extension().map_or(true, |e| !self.allowed.contains(&e)))
            .map(|f| {
                issue(
                    self.code(),
                    Severity::Warning,
                    format!("{} has an extension outside the allow-list", f.filename),
                    Some("filename"),
                    Some("Convert the file to an accepted format"),
                )
            })
            .collect();
        Evaluation::from_findings(findings)
    }
}

pub struct ValidTaskRefRule {
    pattern: Regex,
}

impl ValidTaskRefRule {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self { pattern: Regex::new(pattern)? })
    }
}

impl Rule for ValidTaskRefRule {
    fn code(&self) -> &'static str {
        "VALID_TASK_REF"
    }
    fn name(&self) -> &'static str {
        "Valid Task Reference"
    }
    fn category(&self) -> ValidationCategory {
        ValidationCategory::Metadata
    }
    fn severity(&self) -> Severity {
        Severity::Error
    }

    fn eval(&self, input: &ValidateInput) -> Evaluation {
        if self.pattern.is_match(input.task_ref.as_str()) {
            return Evaluation::Passed;
        }
        Evaluation::Findings(vec![issue(
            self.code(),
            Severity::Error,
            format!("task reference `{}` does not match {}", input.task_ref, self.pattern),
            Some("task_ref"),
            Some("Use the task reference format ET-0001"),
        )])
    }
}

pub struct WindowFormatRule;

impl Rule for WindowFormatRule {
    fn code(&self) -> &'static str {
        "WINDOW_FORMAT"
    }
    fn name(&self) -> &'static str {
        "Window Format"
    }
    fn category(&self) -> ValidationCategory {
        ValidationCategory::Metadata
    }
    fn severity(&self) -> Severity {
        Severity::Warning
    }

    fn eval(&self, input: &ValidateInput) -> Evaluation {
        match CollectionWindow::parse(input.window.as_str()) {
            Ok(_) => Evaluation::Passed,
            Err(e) => Evaluation::Findings(vec![issue(
                self.code(),
                Severity::Warning,
                e.to_string(),
                Some("window"),
                Some("Use YYYY, YYYY-QN, YYYY-MM or YYYY-MM-DD"),
            )]),
        }
    }
}
