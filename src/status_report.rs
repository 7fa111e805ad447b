use anyhow::{Context, Result};
use clap::ValueEnum;
use reqwest::Method;
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, error, warn};

use crate::api::{ApiClient, ensure_success, repo_path};
use crate::config::{RepositoryNwo, Settings, WorkflowIdentity};
use crate::error::UploadError;
use crate::job_context::JobContext;
use crate::upload::UploadStatusReport;

/// Phase of the job a status report describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub(crate) enum ActionName {
    Start,
    Autobuild,
    Finish,
    Upload,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub(crate) enum ActionStatus {
    Starting,
    Aborted,
    Success,
    Failure,
}

impl ActionStatus {
    pub(crate) fn is_terminal(self) -> bool {
        !matches!(self, ActionStatus::Starting)
    }
}

/// Identity and outcome of one phase of one job.
#[derive(Clone, Debug, Serialize)]
pub(crate) struct StatusReportBase {
    pub(crate) workflow_run_id: u64,
    pub(crate) workflow_name: String,
    pub(crate) job_name: String,
    pub(crate) analysis_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) matrix_vars: Option<String>,
    pub(crate) commit_oid: String,
    #[serde(rename = "ref")]
    pub(crate) git_ref: String,
    pub(crate) action_name: ActionName,
    pub(crate) action_oid: String,
    pub(crate) started_at: String,
    pub(crate) action_started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) completed_at: Option<String>,
    pub(crate) status: ActionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) cause: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) exception: Option<String>,
}

/// Report for a successful upload phase, carrying its measurements.
#[derive(Clone, Debug, Serialize)]
pub(crate) struct UploadCompletedReport {
    #[serde(flatten)]
    pub(crate) base: StatusReportBase,
    #[serde(flatten)]
    pub(crate) upload: UploadStatusReport,
}

/// Current time as an RFC 3339 timestamp.
pub(crate) fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .context("format timestamp")
}

/// Composes status reports for the phases of one job.
pub(crate) struct StatusReportBuilder<'a> {
    identity: &'a WorkflowIdentity,
    analysis_key: String,
    commit_oid: String,
    matrix_vars: Option<String>,
}

impl<'a> StatusReportBuilder<'a> {
    pub(crate) fn new(
        identity: &'a WorkflowIdentity,
        analysis_key: String,
        commit_oid: String,
        matrix_vars: Option<String>,
    ) -> Self {
        Self {
            identity,
            analysis_key,
            commit_oid,
            matrix_vars,
        }
    }

    /// Builds the report for one phase transition.
    ///
    /// The workflow-level `started_at` is taken from the job context; the
    /// first phase of a job records its own start time there.
    pub(crate) fn build(
        &self,
        context: &mut JobContext,
        action_name: ActionName,
        status: ActionStatus,
        action_started_at: &str,
        cause: Option<&str>,
        exception: Option<&str>,
    ) -> Result<StatusReportBase> {
        let started_at = context.record_workflow_started_at(action_started_at)?;
        let completed_at = if status.is_terminal() {
            Some(now_rfc3339()?)
        } else {
            None
        };
        Ok(StatusReportBase {
            workflow_run_id: self.identity.run_id,
            workflow_name: self.identity.workflow_name.clone(),
            job_name: self.identity.job_name.clone(),
            analysis_key: self.analysis_key.clone(),
            matrix_vars: self.matrix_vars.clone(),
            commit_oid: self.commit_oid.clone(),
            git_ref: self.identity.git_ref.clone(),
            action_name,
            action_oid: env!("CARGO_PKG_VERSION").to_string(),
            started_at,
            action_started_at: action_started_at.to_string(),
            completed_at,
            status,
            cause: cause.map(str::to_string),
            exception: exception.map(str::to_string),
        })
    }
}

/// Transmits status reports to the code scanning API.
pub(crate) struct StatusReporter<'a> {
    client: &'a dyn ApiClient,
    settings: &'a Settings,
    repository: &'a RepositoryNwo,
}

impl<'a> StatusReporter<'a> {
    pub(crate) fn new(
        client: &'a dyn ApiClient,
        settings: &'a Settings,
        repository: &'a RepositoryNwo,
    ) -> Self {
        Self {
            client,
            settings,
            repository,
        }
    }

    /// Sends `report`; returns `false` when the job must be treated as failed.
    ///
    /// Nothing is sent for servers other than the public one, nor for local
    /// runs. Unless `ignore_failures` is set, HTTP 403 and 404 mark the job as
    /// failed. Every other failure is logged and the job continues.
    pub(crate) fn send(
        &self,
        context: &mut JobContext,
        report: &impl Serialize,
        ignore_failures: bool,
    ) -> Result<bool> {
        if !self.settings.is_public_server() {
            debug!(server = %self.settings.server_url, "not sending status report to this server");
            return Ok(true);
        }
        if self.settings.local_run {
            debug!("not sending status report for a local run");
            return Ok(true);
        }
        let body = serde_json::to_value(report).context("serialize status report")?;
        debug!(%body, "sending status report");
        let path = repo_path(self.repository, "code-scanning/analysis/status");
        let outcome = self
            .client
            .request(Method::PUT, &path, Some(&body))
            .and_then(|response| ensure_success(&Method::PUT, &path, response));
        let err = match outcome {
            Ok(_) => return Ok(true),
            Err(err) => err,
        };
        if ignore_failures {
            debug!("ignoring status report failure: {err:#}");
            return Ok(true);
        }
        let status = err
            .downcast_ref::<UploadError>()
            .and_then(UploadError::http_status);
        let message = match status {
            Some(403) => format!(
                "the token is not permitted to report code scanning status for {}: {err}",
                self.repository
            ),
            Some(404) => format!(
                "code scanning is not enabled or not authorized for {}: {err}",
                self.repository
            ),
            _ => {
                warn!("failed to send status report: {err:#}");
                return Ok(true);
            }
        };
        error!("{message}");
        context.mark_failed(message);
        Ok(false)
    }
}
