use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use base64::prelude::*;
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Serialize;
use serde_sarif::sarif::Sarif;

use crate::config::Mode;
use crate::fingerprint::FingerprintEnricher;
use crate::sarif::{count_results, tool_names};

/// Upload body for analyses produced inside a workflow job.
#[derive(Clone, Debug, Serialize)]
pub(crate) struct ActionsPayload {
    pub(crate) commit_oid: String,
    #[serde(rename = "ref")]
    pub(crate) git_ref: String,
    pub(crate) analysis_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) analysis_name: Option<String>,
    pub(crate) sarif: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) workflow_run_id: Option<u64>,
    pub(crate) checkout_uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) environment: Option<String>,
    pub(crate) started_at: String,
    pub(crate) tool_names: Vec<String>,
}

/// Upload body for analyses submitted outside of a workflow job.
#[derive(Clone, Debug, Serialize)]
pub(crate) struct StandalonePayload {
    pub(crate) commit_sha: String,
    #[serde(rename = "ref")]
    pub(crate) git_ref: String,
    pub(crate) sarif: String,
    pub(crate) checkout_uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) tool_name: Option<String>,
}

/// Wire payload; serialized without a tag, as one of the two record shapes.
#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub(crate) enum UploadPayload {
    Actions(ActionsPayload),
    Standalone(StandalonePayload),
}

/// Identity fields of the payload, chosen once per invocation.
#[derive(Clone, Debug)]
pub(crate) enum PayloadIdentity {
    Actions {
        commit_oid: String,
        git_ref: String,
        analysis_key: String,
        analysis_name: Option<String>,
        workflow_run_id: Option<u64>,
        environment: Option<String>,
        started_at: String,
    },
    Standalone {
        commit_sha: String,
        git_ref: String,
    },
}

impl PayloadIdentity {
    pub(crate) fn mode(&self) -> Mode {
        match self {
            PayloadIdentity::Actions { .. } => Mode::Actions,
            PayloadIdentity::Standalone { .. } => Mode::Standalone,
        }
    }
}

/// Payload plus the measurements reported after a successful upload.
#[derive(Clone, Debug)]
pub(crate) struct BuiltPayload {
    pub(crate) payload: UploadPayload,
    /// Byte length of the fingerprinted JSON.
    pub(crate) raw_upload_size_bytes: usize,
    /// Length of the base64 text, not of the gzip bytes.
    pub(crate) zipped_upload_size_bytes: usize,
    pub(crate) num_results_in_sarif: usize,
}

/// Serializes, fingerprints, compresses and wraps a combined document.
pub(crate) fn build_payload(
    combined: &Sarif,
    enricher: &dyn FingerprintEnricher,
    checkout_path: &Path,
    identity: PayloadIdentity,
) -> Result<BuiltPayload> {
    let sarif_json = serde_json::to_string(combined).context("serialize combined SARIF")?;
    let fingerprinted = enricher
        .enrich(&sarif_json, checkout_path)
        .context("failed to add fingerprints to SARIF")?;
    let raw_upload_size_bytes = fingerprinted.len();
    let sarif = gzip_base64(&fingerprinted)?;
    let zipped_upload_size_bytes = sarif.len();
    let tool_names = tool_names(combined);
    let checkout_uri = checkout_uri(checkout_path)?;

    let payload = match identity {
        PayloadIdentity::Actions {
            commit_oid,
            git_ref,
            analysis_key,
            analysis_name,
            workflow_run_id,
            environment,
            started_at,
        } => UploadPayload::Actions(ActionsPayload {
            commit_oid,
            git_ref,
            analysis_key,
            analysis_name,
            sarif,
            workflow_run_id,
            checkout_uri,
            environment,
            started_at,
            tool_names,
        }),
        PayloadIdentity::Standalone {
            commit_sha,
            git_ref,
        } => UploadPayload::Standalone(StandalonePayload {
            commit_sha,
            git_ref,
            sarif,
            checkout_uri,
            tool_name: tool_names.into_iter().next(),
        }),
    };

    Ok(BuiltPayload {
        payload,
        raw_upload_size_bytes,
        zipped_upload_size_bytes,
        num_results_in_sarif: count_results(combined),
    })
}

/// Gzip-compresses `text` and encodes the result as standard base64.
pub(crate) fn gzip_base64(text: &str) -> Result<String> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(text.as_bytes())
        .context("gzip SARIF payload")?;
    let compressed = encoder.finish().context("finish gzip stream")?;
    Ok(BASE64_STANDARD.encode(compressed))
}

/// `file://` URI of the checkout directory.
pub(crate) fn checkout_uri(checkout_path: &Path) -> Result<String> {
    let absolute = std::path::absolute(checkout_path)
        .with_context(|| format!("failed to resolve {}", checkout_path.display()))?;
    let url = reqwest::Url::from_file_path(&absolute)
        .map_err(|()| anyhow!("cannot express {} as a file URI", absolute.display()))?;
    Ok(url.to_string())
}
