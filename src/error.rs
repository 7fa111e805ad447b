use std::path::PathBuf;

use thiserror::Error;

use crate::validate::Violation;

/// Failures that abort an upload or a status report.
///
/// Every variant travels inside `anyhow::Error`; callers that need to react to
/// a specific failure use `downcast_ref::<UploadError>()`.
#[derive(Debug, Error)]
pub(crate) enum UploadError {
    #[error(
        "unable to upload \"{}\" as it is not valid SARIF:\n{}",
        .path.display(),
        violation_paths(.violations)
    )]
    SchemaViolation {
        path: PathBuf,
        violations: Vec<Violation>,
    },
    #[error("cannot upload files with different SARIF versions: {expected} and {found}")]
    VersionMismatch { expected: String, found: String },
    #[error("an upload has already been performed in this job; only one upload per job is supported")]
    DuplicateUploadAttempt,
    #[error("no SARIF files found to upload in \"{}\"", .0.display())]
    NoFilesFound(PathBuf),
    #[error("{method} {url} failed with HTTP {status}: {body}")]
    HttpStatus {
        method: String,
        url: String,
        status: u16,
        body: String,
    },
    #[error("required environment variable {0} is not set")]
    MissingIdentity(String),
}

impl UploadError {
    /// HTTP status carried by the error, if it came from a response.
    pub(crate) fn http_status(&self) -> Option<u16> {
        match self {
            UploadError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

fn violation_paths(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|violation| format!("- {}", violation.instance_path))
        .collect::<Vec<_>>()
        .join("\n")
}
