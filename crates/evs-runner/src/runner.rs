use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use evs_client::{HttpTransport, SubmissionClient};
use evs_storage::{FsEvidenceSource, FsSubmissionStore};
use evs_validate::ValidationEngine;
use tracing::{debug, warn};

use crate::batch::BatchOrchestrator;
use crate::config::{Config, ConfigError};
use crate::controller::TaskController;

/// Everything wired from `<root>/.evs/evs.toml`.
pub struct Runner {
    pub root: PathBuf,
    pub cfg: Config,
    pub controller: Arc<TaskController>,
    pub batches: BatchOrchestrator,
}

fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

impl Runner {
    pub fn open(root: &Path) -> Result<Self> {
        let root = root.to_path_buf();
        let cfg_path = Config::config_path(&root);
        let cfg = if cfg_path.exists() {
            Config::load_from(&cfg_path)?
        } else {
            let cfg = Config::default_for_user(&current_user());
            cfg.save_to(&cfg_path)?;
            cfg
        };
        cfg.check()?;

        let data_dir = cfg.data_dir(&root);
        let engine = ValidationEngine::from_config(&cfg.validation)
            .map_err(|e| ConfigError::Invalid(format!("validation.task_ref_pattern: {e}")))?;
        let mut controller = TaskController::new(
            Arc::new(FsSubmissionStore::new(data_dir.clone())),
            Arc::new(FsEvidenceSource::new(data_dir)),
            Arc::new(cfg.tasks.clone()),
            Arc::new(engine),
            cfg.project.submitted_by.clone(),
        )
        .with_remote_id_policy(cfg.resubmission.remote_id_policy)
        .with_lease_ttl(cfg.project.lease_ttl_secs)
        .with_max_content_bytes(cfg.validation.max_file_size_bytes);

        // Validation and status work offline; submit reports the missing credential.
        match cfg.bearer_token() {
            Ok(token) => {
                let transport =
                    HttpTransport::new(&cfg.remote.base_url, &token, cfg.request_timeout(), cfg.connect_timeout())?;
                let client = SubmissionClient::new(Arc::new(transport), cfg.retry.clone(), cfg.request_timeout());
                controller = controller.with_client(client);
            }
            Err(e) => debug!(error = %e, "remote client disabled"),
        }

        let controller = Arc::new(controller);
        let batches = BatchOrchestrator::new(controller.clone(), cfg.project.submitted_by.clone());
        Ok(Self {
            root,
            cfg,
            controller,
            batches,
        })
    }

    /// Write a default config and create the data directory. Existing config is kept.
    pub fn init(root: &Path) -> Result<PathBuf> {
        let cfg_path = Config::config_path(root);
        let cfg = if cfg_path.exists() {
            warn!(path = %cfg_path.display(), "config already exists, leaving it unchanged");
            Config::load_from(&cfg_path)?
        } else {
            let cfg = Config::default_for_user(&current_user());
            cfg.save_to(&cfg_path)?;
            cfg
        };
        let data_dir = cfg.data_dir(root);
        std::fs::create_dir_all(data_dir.join("evidence"))?;
        std::fs::create_dir_all(data_dir.join("submissions"))?;
        Ok(cfg_path)
    }
}
