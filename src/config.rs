use std::fmt;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::ValueEnum;

use crate::error::UploadError;

/// The only server for which status reports are transmitted.
pub(crate) const PUBLIC_SERVER_URL: &str = "https://github.com";
const DEFAULT_API_URL: &str = "https://api.github.com";

/// Reads one environment value; empty values count as unset.
pub(crate) type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

pub(crate) fn env_lookup(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

/// Integration context selecting the payload shape and endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub(crate) enum Mode {
    /// Running inside a CI workflow job.
    Actions,
    /// Invoked directly, outside of any workflow job.
    Standalone,
}

/// `owner/name` of a repository.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct RepositoryNwo {
    pub(crate) owner: String,
    pub(crate) name: String,
}

impl RepositoryNwo {
    pub(crate) fn parse(value: &str) -> Result<Self> {
        match value.split_once('/') {
            Some((owner, name))
                if !owner.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(Self {
                    owner: owner.to_string(),
                    name: name.to_string(),
                })
            }
            _ => anyhow::bail!("invalid repository '{value}': expected OWNER/NAME"),
        }
    }
}

impl fmt::Display for RepositoryNwo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Process-level settings read from the environment.
#[derive(Clone, Debug)]
pub(crate) struct Settings {
    pub(crate) server_url: String,
    pub(crate) api_url: String,
    pub(crate) token: Option<String>,
    pub(crate) test_mode: bool,
    pub(crate) local_run: bool,
    pub(crate) state_dir: PathBuf,
}

impl Settings {
    pub(crate) fn from_lookup(lookup: Lookup<'_>) -> Self {
        let state_dir = lookup("SARIF_UPLOAD_STATE_DIR")
            .or_else(|| lookup("RUNNER_TEMP"))
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);
        Self {
            server_url: lookup("GITHUB_SERVER_URL").unwrap_or_else(|| PUBLIC_SERVER_URL.to_string()),
            api_url: lookup("GITHUB_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            token: lookup("GITHUB_TOKEN"),
            test_mode: flag(lookup, "SARIF_UPLOAD_TEST_MODE"),
            local_run: flag(lookup, "SARIF_UPLOAD_LOCAL_RUN"),
            state_dir,
        }
    }

    pub(crate) fn is_public_server(&self) -> bool {
        self.server_url.trim_end_matches('/') == PUBLIC_SERVER_URL
    }

    /// State file shared by every invocation within one job.
    pub(crate) fn job_state_path(&self, identity: &WorkflowIdentity) -> PathBuf {
        let job = identity
            .job_name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect::<String>();
        self.state_dir
            .join(format!(
                "sarif-upload-job-{}-{}-{job}.json",
                identity.run_id, identity.run_attempt
            ))
    }
}

fn flag(lookup: Lookup<'_>, name: &str) -> bool {
    lookup(name)
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Reads a value the surrounding job must provide.
pub(crate) fn required(lookup: Lookup<'_>, name: &str) -> Result<String> {
    lookup(name).ok_or_else(|| UploadError::MissingIdentity(name.to_string()).into())
}

/// Identity of the workflow job this process runs in.
#[derive(Clone, Debug)]
pub(crate) struct WorkflowIdentity {
    pub(crate) repository: RepositoryNwo,
    pub(crate) run_id: u64,
    /// Re-runs keep the run id; each attempt is a fresh job.
    pub(crate) run_attempt: u32,
    pub(crate) workflow_name: String,
    pub(crate) job_name: String,
    pub(crate) git_ref: String,
    pub(crate) sha: String,
}

impl WorkflowIdentity {
    pub(crate) fn from_lookup(lookup: Lookup<'_>) -> Result<Self> {
        let repository = RepositoryNwo::parse(&required(lookup, "GITHUB_REPOSITORY")?)?;
        let run_id = required(lookup, "GITHUB_RUN_ID")?;
        let run_id = run_id
            .parse()
            .with_context(|| format!("GITHUB_RUN_ID is not a number: {run_id}"))?;
        let run_attempt = match lookup("GITHUB_RUN_ATTEMPT") {
            Some(attempt) => attempt
                .parse()
                .with_context(|| format!("GITHUB_RUN_ATTEMPT is not a number: {attempt}"))?,
            None => 1,
        };
        Ok(Self {
            repository,
            run_id,
            run_attempt,
            workflow_name: required(lookup, "GITHUB_WORKFLOW")?,
            job_name: required(lookup, "GITHUB_JOB")?,
            git_ref: required(lookup, "GITHUB_REF")?,
            sha: required(lookup, "GITHUB_SHA")?,
        })
    }
}
