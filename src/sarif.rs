use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;
use serde_sarif::sarif::Sarif;
use tracing::{debug, info};

use crate::error::UploadError;
use crate::validate::{SchemaValidator, validate};

/// Resolves the SARIF files designated by `path`.
///
/// A file is returned as-is. A directory is searched recursively for files
/// with a `.sarif` extension, sorted so that combination order is stable.
pub(crate) fn find_sarif_files(path: &Path) -> Result<Vec<PathBuf>> {
    let metadata = fs::metadata(path)
        .with_context(|| format!("path does not exist: {}", path.display()))?;
    if !metadata.is_dir() {
        return Ok(vec![path.to_path_buf()]);
    }
    let mut files = Vec::new();
    let walker = ignore::WalkBuilder::new(path)
        .standard_filters(false)
        .follow_links(false)
        .build();
    for entry in walker {
        let entry =
            entry.with_context(|| format!("failed to walk directory {}", path.display()))?;
        if !entry.file_type().is_some_and(|file_type| file_type.is_file()) {
            continue;
        }
        let is_sarif = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("sarif"));
        if is_sarif {
            files.push(entry.into_path());
        }
    }
    if files.is_empty() {
        return Err(UploadError::NoFilesFound(path.to_path_buf()).into());
    }
    files.sort();
    Ok(files)
}

/// Reads and validates every file, then deserializes them.
///
/// No document is returned unless all files pass schema validation.
pub(crate) fn load_sarif_files(
    paths: &[PathBuf],
    validator: &dyn SchemaValidator,
) -> Result<Vec<Sarif>> {
    let mut parsed = Vec::with_capacity(paths.len());
    for path in paths {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let value: Value = serde_json::from_str(&content)
            .with_context(|| format!("{} is not valid JSON", path.display()))?;
        validate(validator, path, &value)?;
        debug!(file = %path.display(), "SARIF file is valid");
        parsed.push((path, value));
    }

    let mut documents = Vec::with_capacity(parsed.len());
    for (path, value) in parsed {
        let document: Sarif = serde_path_to_error::deserialize(value)
            .with_context(|| format!("failed to parse SARIF {}", path.display()))?;
        documents.push(document);
    }
    info!(count = documents.len(), "validated SARIF files");
    Ok(documents)
}

/// Merges documents into one, keeping run order across and within inputs.
///
/// Every document must carry the version of the first one.
pub(crate) fn combine(documents: Vec<Sarif>) -> Result<Sarif> {
    let mut documents = documents.into_iter();
    let Some(first) = documents.next() else {
        anyhow::bail!("no SARIF documents to combine");
    };
    let version = first.version;
    let mut runs = first.runs;
    for document in documents {
        if document.version != version {
            return Err(UploadError::VersionMismatch {
                expected: version_label(&version),
                found: version_label(&document.version),
            }
            .into());
        }
        runs.extend(document.runs);
    }
    Ok(Sarif::builder().version(version).runs(runs).build())
}

fn version_label(version: &Value) -> String {
    match version.as_str() {
        Some(version) => version.to_string(),
        None => version.to_string(),
    }
}

/// Number of results across all runs.
pub(crate) fn count_results(document: &Sarif) -> usize {
    document
        .runs
        .iter()
        .map(|run| run.results.as_ref().map_or(0, Vec::len))
        .sum()
}

/// Distinct driver names, in order of first appearance.
pub(crate) fn tool_names(document: &Sarif) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for run in &document.runs {
        let name = &run.tool.driver.name;
        if !names.contains(name) {
            names.push(name.clone());
        }
    }
    names
}
