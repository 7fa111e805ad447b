use std::path::Path;

use anyhow::{Context, Result};
use opentelemetry::KeyValue;
use reqwest::Method;
use serde::Serialize;
use tracing::info;

use crate::api::{ApiClient, ensure_success, repo_path};
use crate::config::{Mode, RepositoryNwo};
use crate::error::UploadError;
use crate::fingerprint::FingerprintEnricher;
use crate::job_context::JobContext;
use crate::payload::{BuiltPayload, PayloadIdentity, UploadPayload, build_payload};
use crate::sarif::{combine, find_sarif_files, load_sarif_files};
use crate::telemetry::{Telemetry, with_span};
use crate::validate::SchemaValidator;

/// Measurements of a completed upload.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub(crate) struct UploadStatusReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) raw_upload_size_bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) zipped_upload_size_bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) num_results_in_sarif: Option<usize>,
}

/// Claims the single upload allowed per job.
///
/// In actions mode the first claim sets the job's sentinel and persists it;
/// any later claim in the same job fails with `DuplicateUploadAttempt`.
/// Standalone mode has no job to scope the sentinel to and is never checked.
/// Returns whether the sentinel was set.
pub(crate) fn claim_upload(context: &mut JobContext, mode: Mode) -> Result<bool> {
    if mode == Mode::Standalone {
        return Ok(false);
    }
    if context.upload_performed() {
        return Err(UploadError::DuplicateUploadAttempt.into());
    }
    context.mark_upload_performed();
    context.save()?;
    Ok(true)
}

/// Sends built payloads to the code scanning API.
pub(crate) struct Uploader<'a> {
    client: &'a dyn ApiClient,
    repository: &'a RepositoryNwo,
    test_mode: bool,
}

impl<'a> Uploader<'a> {
    pub(crate) fn new(
        client: &'a dyn ApiClient,
        repository: &'a RepositoryNwo,
        test_mode: bool,
    ) -> Self {
        Self {
            client,
            repository,
            test_mode,
        }
    }

    /// Uploads the payload once; errors propagate without retry.
    ///
    /// In test mode no request is made and the report is returned as if the
    /// upload had succeeded.
    pub(crate) fn upload(&self, built: &BuiltPayload) -> Result<UploadStatusReport> {
        let report = UploadStatusReport {
            raw_upload_size_bytes: Some(built.raw_upload_size_bytes),
            zipped_upload_size_bytes: Some(built.zipped_upload_size_bytes),
            num_results_in_sarif: Some(built.num_results_in_sarif),
        };
        if self.test_mode {
            info!("test mode is enabled, skipping SARIF upload");
            return Ok(report);
        }
        let (method, path) = match &built.payload {
            UploadPayload::Actions(_) => (
                Method::PUT,
                repo_path(self.repository, "code-scanning/analysis"),
            ),
            UploadPayload::Standalone(_) => (
                Method::POST,
                repo_path(self.repository, "code-scanning/sarifs"),
            ),
        };
        let body = serde_json::to_value(&built.payload).context("serialize upload payload")?;
        let response = self.client.request(method.clone(), &path, Some(&body))?;
        ensure_success(&method, &path, response)?;
        info!(
            raw_bytes = built.raw_upload_size_bytes,
            zipped_bytes = built.zipped_upload_size_bytes,
            results = built.num_results_in_sarif,
            "uploaded SARIF"
        );
        Ok(report)
    }
}

/// Collaborators used by one upload attempt.
pub(crate) struct UploadInputs<'a> {
    pub(crate) sarif_path: &'a Path,
    pub(crate) checkout_path: &'a Path,
    pub(crate) validator: &'a dyn SchemaValidator,
    pub(crate) enricher: &'a dyn FingerprintEnricher,
}

/// Runs the upload pipeline: guard, discover, validate, combine, build, send.
pub(crate) fn upload_sarif(
    context: &mut JobContext,
    inputs: &UploadInputs<'_>,
    identity: PayloadIdentity,
    uploader: &Uploader<'_>,
    telemetry: Option<&Telemetry>,
) -> Result<UploadStatusReport> {
    claim_upload(context, identity.mode())?;
    let files = find_sarif_files(inputs.sarif_path)?;
    info!(count = files.len(), "uploading SARIF files");
    let documents = with_span(
        telemetry,
        "validate",
        &[KeyValue::new("sarif_upload.files", files.len() as i64)],
        || load_sarif_files(&files, inputs.validator),
    )?;
    let combined = with_span(telemetry, "combine", &[], || combine(documents))?;
    let built = with_span(telemetry, "payload", &[], || {
        build_payload(&combined, inputs.enricher, inputs.checkout_path, identity)
    })?;
    with_span(telemetry, "upload", &[], || uploader.upload(&built))
}
