use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use evs_client::RetryPolicy;
use evs_core::{RemoteIdPolicy, TaskRequirements, TaskWindow};
use evs_validate::{ValidationConfig, ValidationEngine};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("no bearer credential: set the {0} environment variable")]
    MissingCredential(String),
    #[error("malformed batch file {path}: {message}")]
    BatchFile { path: PathBuf, message: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub project: ProjectConfig,
    pub remote: RemoteConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub resubmission: ResubmissionConfig,
    /// Required controls per task reference, e.g. `[tasks."ET-0001"]`.
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskRequirements>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub data_dir: String,
    pub submitted_by: String,
    /// How long a task/window stays claimed when its holder dies mid-operation.
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: u64,
}

fn default_lease_ttl() -> u64 {
    15 * 60
}

/// Upper bounds for values that feed date and duration arithmetic.
const MAX_LEASE_TTL_SECS: u64 = 7 * 24 * 60 * 60;
const MAX_GRACE_DAYS: u32 = 366;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub base_url: String,
    pub token_env: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_request_timeout() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    10
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub concurrency: usize,
    pub continue_on_error: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            continue_on_error: true,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResubmissionConfig {
    pub remote_id_policy: RemoteIdPolicy,
}

impl Config {
    pub fn default_for_user(submitted_by: &str) -> Self {
        Self {
            project: ProjectConfig {
                data_dir: ".evs/data".to_string(),
                submitted_by: submitted_by.to_string(),
                lease_ttl_secs: default_lease_ttl(),
            },
            remote: RemoteConfig {
                base_url: "https://compliance.example.com/api/v1".to_string(),
                token_env: "EVS_TOKEN".to_string(),
                request_timeout_secs: default_request_timeout(),
                connect_timeout_secs: default_connect_timeout(),
            },
            retry: RetryPolicy::default(),
            validation: ValidationConfig::default(),
            batch: BatchConfig::default(),
            resubmission: ResubmissionConfig::default(),
            tasks: BTreeMap::new(),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let cfg: Config = toml::from_str(&s).with_context(|| format!("parse {}", path.display()))?;
        Ok(cfg)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let s = toml::to_string_pretty(self).with_context(|| "serialize toml")?;
        std::fs::write(path, s).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    pub fn config_path(root: &Path) -> PathBuf {
        root.join(".evs").join("evs.toml")
    }

    /// `project.data_dir` with `~` expanded; relative paths hang off `root`.
    pub fn data_dir(&self, root: &Path) -> PathBuf {
        let expanded = PathBuf::from(shellexpand::tilde(&self.project.data_dir).to_string());
        if expanded.is_absolute() {
            expanded
        } else {
            root.join(expanded)
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.remote.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.remote.connect_timeout_secs)
    }

    /// Reject values nothing downstream can work with.
    pub fn check(&self) -> Result<(), ConfigError> {
        let invalid = |m: &str| Err(ConfigError::Invalid(m.to_string()));
        if self.project.data_dir.trim().is_empty() {
            return invalid("project.data_dir is empty");
        }
        if self.remote.base_url.trim().is_empty() {
            return invalid("remote.base_url is empty");
        }
        if self.remote.request_timeout_secs == 0 || self.remote.connect_timeout_secs == 0 {
            return invalid("remote timeouts must be at least one second");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return invalid("retry.jitter must be between 0.0 and 1.0");
        }
        if self.batch.concurrency == 0 {
            return invalid("batch.concurrency must be at least 1");
        }
        if !(1..=MAX_LEASE_TTL_SECS).contains(&self.project.lease_ttl_secs) {
            return invalid("project.lease_ttl_secs must be between 1 second and 7 days");
        }
        if self.validation.timestamp_grace_days > MAX_GRACE_DAYS {
            return invalid("validation.timestamp_grace_days must be at most 366");
        }
        ValidationEngine::from_config(&self.validation)
            .map_err(|e| ConfigError::Invalid(format!("validation.task_ref_pattern: {e}")))?;
        Ok(())
    }

    pub fn bearer_token(&self) -> Result<String, ConfigError> {
        std::env::var(&self.remote.token_env)
            .ok()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingCredential(self.remote.token_env.clone()))
    }
}

/// A list of tasks for `batch-submit --file`.
///
/// ```yaml
/// name: q4-soc2
/// window: 2025-Q4
/// tasks:
///   - ET-0001
///   - task_ref: ET-0002
///     window: 2025-Q3
/// ```
#[derive(Clone, Debug, Deserialize)]
pub struct BatchFile {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub window: Option<String>,
    pub tasks: Vec<BatchFileTask>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum BatchFileTask {
    Ref(String),
    Full {
        task_ref: String,
        #[serde(default)]
        window: Option<String>,
    },
}

impl BatchFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let err = |message: String| ConfigError::BatchFile {
            path: path.to_path_buf(),
            message,
        };
        let text = std::fs::read_to_string(path).map_err(|e| err(e.to_string()))?;
        serde_yaml::from_str(&text).map_err(|e| err(e.to_string()))
    }

    /// Resolve entries against the file default window, then `fallback_window`.
    pub fn task_windows(&self, fallback_window: Option<&str>) -> Result<Vec<TaskWindow>, ConfigError> {
        let default = self.window.as_deref().or(fallback_window);
        self.tasks
            .iter()
            .map(|t| {
                let (task_ref, window) = match t {
                    BatchFileTask::Ref(r) => (r.as_str(), None),
                    BatchFileTask::Full { task_ref, window } => (task_ref.as_str(), window.as_deref()),
                };
                let window = window.or(default).ok_or_else(|| {
                    ConfigError::Invalid(format!("batch entry {task_ref} has no window and no default window was given"))
                })?;
                Ok(TaskWindow::new(task_ref, window))
            })
            .collect()
    }
}
