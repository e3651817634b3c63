use std::collections::BTreeMap;

use evs_core::{CollectionPlan, EvidenceFileRef, TaskRef, TaskWindow, ValidationError, ValidationMode, Window};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ValidationCategory {
    Completeness,
    Format,
    Content,
    Metadata,
}

/// Tunables for the rule set. Lives under `[validation]` in the workspace config.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ValidationConfig {
    pub default_mode: ValidationMode,
    pub max_file_size_bytes: u64,
    pub allowed_extensions: Vec<String>,
    pub placeholder_markers: Vec<String>,
    pub task_ref_pattern: String,
    pub timestamp_grace_days: u32,
    pub min_recommended_files: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            default_mode: ValidationMode::Strict,
            max_file_size_bytes: 50 * 1024 * 1024,
            allowed_extensions: ["md", "csv", "json", "pdf", "xlsx", "txt", "yaml", "yml"]
                .into_iter()
                .map(String::from)
                .collect(),
            placeholder_markers: ["[PLACEHOLDER]", "TODO:", "TBD", "FIXME", "{{", "<INSERT"]
                .into_iter()
                .map(String::from)
                .collect(),
            task_ref_pattern: r"^ET-\d{4}$".to_string(),
            timestamp_grace_days: 45,
            min_recommended_files: 1,
        }
    }
}

/// Everything a rule may look at. Rules only read it.
#[derive(Clone, Debug)]
pub struct ValidateInput {
    pub task_ref: TaskRef,
    pub window: Window,
    pub files: Vec<EvidenceFileRef>,
    /// Bytes of text-like files, keyed by filename. Binary formats are never loaded.
    pub contents: BTreeMap<String, Vec<u8>>,
    pub required_controls: Vec<String>,
    pub plan: Option<CollectionPlan>,
}

impl ValidateInput {
    pub fn new(key: &TaskWindow, files: Vec<EvidenceFileRef>) -> Self {
        Self {
            task_ref: key.task_ref.clone(),
            window: key.window.clone(),
            files,
            contents: BTreeMap::new(),
            required_controls: vec![],
            plan: None,
        }
    }

    pub fn with_content(mut self, filename: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.contents.insert(filename.into(), bytes.into());
        self
    }

    pub fn with_required_controls(mut self, controls: Vec<String>) -> Self {
        self.required_controls = controls;
        self
    }

    pub fn with_plan(mut self, plan: Option<CollectionPlan>) -> Self {
        self.plan = plan;
        self
    }
}

/// Result of one rule against one input.
#[derive(Clone, Debug, PartialEq)]
pub enum Evaluation {
    Passed,
    Skipped(String),
    Findings(Vec<ValidationError>),
}

impl Evaluation {
    pub fn from_findings(findings: Vec<ValidationError>) -> Self {
        if findings.is_empty() {
            Evaluation::Passed
        } else {
            Evaluation::Findings(findings)
        }
    }
}

/// Extensions whose content is loaded for format and placeholder checks.
pub fn is_text_extension(ext: &str) -> bool {
    matches!(ext, "md" | "markdown" | "csv" | "json" | "yaml" | "yml" | "txt")
}
