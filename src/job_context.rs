use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// State shared by every invocation of the tool within one job.
///
/// Each field is written at most once per job. The context is stored as JSON
/// in a job-scoped state file so that separate processes (one per job phase)
/// observe the same values. `None` means "not yet set".
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct JobContext {
    #[serde(default)]
    upload_performed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    workflow_started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    analysis_key: Option<String>,
    #[serde(skip)]
    path: Option<PathBuf>,
    #[serde(skip)]
    failure: Option<String>,
}

impl JobContext {
    /// Context that lives only as long as this process.
    pub(crate) fn in_memory() -> Self {
        Self::default()
    }

    /// Loads the job state file, starting fresh when it does not exist yet.
    pub(crate) fn load(path: &Path) -> Result<Self> {
        let mut context = match fs::read_to_string(path) {
            Ok(content) => serde_json::from_str::<JobContext>(&content)
                .with_context(|| format!("failed to parse job state {}", path.display()))?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Self::default(),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read job state {}", path.display()));
            }
        };
        context.path = Some(path.to_path_buf());
        Ok(context)
    }

    pub(crate) fn save(&self) -> Result<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create job state directory {}", parent.display())
            })?;
        }
        let content = serde_json::to_string_pretty(self).context("failed to serialize job state")?;
        fs::write(path, content)
            .with_context(|| format!("failed to write job state {}", path.display()))
    }

    pub(crate) fn upload_performed(&self) -> bool {
        self.upload_performed
    }

    pub(crate) fn mark_upload_performed(&mut self) {
        self.upload_performed = true;
    }

    /// Returns the recorded workflow start time, recording `candidate` if this
    /// is the first phase of the job.
    pub(crate) fn record_workflow_started_at(&mut self, candidate: &str) -> Result<String> {
        if let Some(started_at) = &self.workflow_started_at {
            return Ok(started_at.clone());
        }
        self.workflow_started_at = Some(candidate.to_string());
        self.save()?;
        Ok(candidate.to_string())
    }

    pub(crate) fn analysis_key(&self) -> Option<&str> {
        self.analysis_key.as_deref()
    }

    pub(crate) fn set_analysis_key(&mut self, key: String) -> Result<()> {
        self.analysis_key = Some(key);
        self.save()
    }

    /// Records that the job must be reported as failed.
    pub(crate) fn mark_failed(&mut self, message: String) {
        self.failure.get_or_insert(message);
    }

    pub(crate) fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }
}
