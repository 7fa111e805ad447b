//! Stable fingerprints for SARIF results.
//!
//! Fingerprints let the code scanning service track a finding across scans
//! even when unrelated edits shift its line number.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use reqwest::Url;
use sha2::{Digest, Sha256};
use tracing::debug;

pub(crate) const PRIMARY_LOCATION_LINE_HASH: &str = "primaryLocationLineHash";

/// Injects fingerprints into the results of a serialized SARIF document.
///
/// Implementations must be idempotent: results that already carry a
/// fingerprint are left unchanged.
pub(crate) trait FingerprintEnricher {
    fn enrich(&self, sarif_json: &str, checkout_path: &Path) -> Result<String>;
}

/// Fingerprints each result by the content of its primary location's line.
///
/// The hash covers the rule id, the artifact URI and the trimmed line text,
/// followed by `:<n>` where `n` counts identical hashes within the document.
/// Results whose source line cannot be read are left without a fingerprint.
pub(crate) struct LineHashEnricher;

impl FingerprintEnricher for LineHashEnricher {
    fn enrich(&self, sarif_json: &str, checkout_path: &Path) -> Result<String> {
        let mut document: Value =
            serde_json::from_str(sarif_json).context("parse SARIF for fingerprinting")?;
        let mut sources = SourceCache::new(checkout_path);
        let mut occurrences = existing_occurrences(&document);
        if let Some(runs) = document.get_mut("runs").and_then(Value::as_array_mut) {
            for run in runs {
                let Some(results) = run.get_mut("results").and_then(Value::as_array_mut) else {
                    continue;
                };
                for result in results {
                    fingerprint_result(result, &mut sources, &mut occurrences);
                }
            }
        }
        serde_json::to_string(&document).context("serialize fingerprinted SARIF")
    }
}

/// Highest occurrence already assigned to each hash in the document.
fn existing_occurrences(document: &Value) -> HashMap<String, usize> {
    let mut occurrences: HashMap<String, usize> = HashMap::new();
    let runs = document.get("runs").and_then(Value::as_array);
    for run in runs.into_iter().flatten() {
        let results = run.get("results").and_then(Value::as_array);
        for result in results.into_iter().flatten() {
            let Some((hash, occurrence)) = result
                .pointer(&format!("/partialFingerprints/{PRIMARY_LOCATION_LINE_HASH}"))
                .and_then(Value::as_str)
                .and_then(|fingerprint| fingerprint.rsplit_once(':'))
            else {
                continue;
            };
            let Ok(occurrence) = occurrence.parse::<usize>() else {
                continue;
            };
            let highest = occurrences.entry(hash.to_string()).or_insert(0);
            *highest = (*highest).max(occurrence);
        }
    }
    occurrences
}

fn fingerprint_result(
    result: &mut Value,
    sources: &mut SourceCache,
    occurrences: &mut HashMap<String, usize>,
) {
    let already_fingerprinted = result
        .pointer(&format!("/partialFingerprints/{PRIMARY_LOCATION_LINE_HASH}"))
        .is_some();
    if already_fingerprinted {
        return;
    }
    let Some(uri) = result
        .pointer("/locations/0/physicalLocation/artifactLocation/uri")
        .and_then(Value::as_str)
        .map(str::to_string)
    else {
        return;
    };
    let Some(line) = result
        .pointer("/locations/0/physicalLocation/region/startLine")
        .and_then(Value::as_u64)
    else {
        return;
    };
    let Some(text) = sources.line(&uri, line) else {
        debug!(%uri, line, "source line unavailable, result left without fingerprint");
        return;
    };
    let rule_id = result
        .get("ruleId")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let hash = line_hash(rule_id, &uri, text.trim());
    let occurrence = occurrences.entry(hash.clone()).or_insert(0);
    *occurrence += 1;
    let fingerprint = format!("{hash}:{occurrence}");

    let Some(result) = result.as_object_mut() else {
        return;
    };
    let fingerprints = result
        .entry("partialFingerprints")
        .or_insert_with(|| Value::Object(Map::new()));
    if let Some(fingerprints) = fingerprints.as_object_mut() {
        fingerprints.insert(
            PRIMARY_LOCATION_LINE_HASH.to_string(),
            Value::String(fingerprint),
        );
    }
}

/// SHA-256 of `rule_id:uri:line`, truncated to 16 hex characters.
fn line_hash(rule_id: &str, uri: &str, line: &str) -> String {
    let input = format!("{rule_id}:{uri}:{line}");
    let hash = Sha256::digest(input.as_bytes());
    hex::encode(&hash[..8])
}

/// Source files read during one enrichment pass, keyed by artifact URI.
struct SourceCache {
    root: Option<(PathBuf, Url)>,
    files: HashMap<String, Option<Vec<String>>>,
}

impl SourceCache {
    fn new(root: &Path) -> Self {
        let root = std::path::absolute(root).ok().and_then(|root| {
            let url = Url::from_directory_path(&root).ok()?;
            Some((root, url))
        });
        Self {
            root,
            files: HashMap::new(),
        }
    }

    /// Text of the 1-based `line` of the artifact at `uri`.
    fn line(&mut self, uri: &str, line: u64) -> Option<&str> {
        let root = self.root.as_ref();
        let lines = self
            .files
            .entry(uri.to_string())
            .or_insert_with(|| {
                let (root, root_url) = root?;
                let path = resolve_artifact(root, root_url, uri)?;
                let content = fs::read_to_string(path).ok()?;
                Some(content.lines().map(str::to_string).collect())
            })
            .as_ref()?;
        let index = usize::try_from(line).ok()?.checked_sub(1)?;
        lines.get(index).map(String::as_str)
    }
}

/// Local path of `uri`, resolved against the checkout; `None` outside of it.
fn resolve_artifact(root: &Path, root_url: &Url, uri: &str) -> Option<PathBuf> {
    let path = root_url.join(uri).ok()?.to_file_path().ok()?;
    if !path.starts_with(root) {
        debug!(%uri, "artifact lies outside the checkout");
        return None;
    }
    Some(path)
}
