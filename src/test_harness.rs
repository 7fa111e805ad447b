//! Fixtures shared by unit tests.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use reqwest::Method;
use serde_json::{Value, json};
use serde_sarif::sarif::Sarif;

use crate::api::{ApiClient, ApiResponse};
use crate::config::{RepositoryNwo, Settings, WorkflowIdentity};

/// Canned outcome for one mocked request.
#[derive(Clone, Debug)]
pub(crate) enum MockReply {
    Status(u16, String),
    TransportError(String),
}

/// Request observed by `MockApiClient`.
#[derive(Clone, Debug)]
pub(crate) struct RecordedRequest {
    pub(crate) method: Method,
    pub(crate) path: String,
    pub(crate) body: Option<Value>,
}

/// `ApiClient` that records requests and replays canned replies in order.
///
/// Once the replies run out every request succeeds with `200 {}`.
pub(crate) struct MockApiClient {
    replies: RefCell<VecDeque<MockReply>>,
    requests: RefCell<Vec<RecordedRequest>>,
}

impl MockApiClient {
    pub(crate) fn new() -> Self {
        Self::with_replies(Vec::new())
    }

    pub(crate) fn with_replies(replies: Vec<MockReply>) -> Self {
        Self {
            replies: RefCell::new(replies.into()),
            requests: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.borrow().clone()
    }
}

impl ApiClient for MockApiClient {
    fn request(&self, method: Method, path: &str, body: Option<&Value>) -> Result<ApiResponse> {
        self.requests.borrow_mut().push(RecordedRequest {
            method,
            path: path.to_string(),
            body: body.cloned(),
        });
        let reply = self
            .replies
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| MockReply::Status(200, "{}".to_string()));
        match reply {
            MockReply::Status(status, body) => Ok(ApiResponse { status, body }),
            MockReply::TransportError(message) => Err(anyhow::anyhow!(message)),
        }
    }
}

/// SARIF document with one run per `(tool name, result count)` pair.
pub(crate) fn sarif_value(version: &str, runs: &[(&str, usize)]) -> Value {
    let runs: Vec<Value> = runs
        .iter()
        .map(|(tool, result_count)| {
            let results: Vec<Value> = (0..*result_count)
                .map(|index| {
                    json!({
                        "ruleId": format!("{tool}/rule-{index}"),
                        "message": { "text": format!("finding {index}") },
                        "locations": [{
                            "physicalLocation": {
                                "artifactLocation": { "uri": "src/lib.rs" },
                                "region": { "startLine": index + 1 }
                            }
                        }]
                    })
                })
                .collect();
            json!({
                "tool": { "driver": { "name": tool } },
                "results": results
            })
        })
        .collect();
    json!({ "version": version, "runs": runs })
}

pub(crate) fn parse_sarif(value: Value) -> Sarif {
    serde_json::from_value(value).expect("parse SARIF fixture")
}

pub(crate) fn write_sarif(dir: &Path, name: &str, value: &Value) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, serde_json::to_vec_pretty(value).expect("serialize fixture"))
        .expect("write SARIF fixture");
    path
}

/// Environment of a workflow job on the public server.
pub(crate) fn workflow_env() -> HashMap<&'static str, String> {
    HashMap::from([
        ("GITHUB_REPOSITORY", "octo/widgets".to_string()),
        ("GITHUB_RUN_ID", "4242".to_string()),
        ("GITHUB_WORKFLOW", "Code scanning".to_string()),
        ("GITHUB_JOB", "analyze".to_string()),
        ("GITHUB_REF", "refs/heads/main".to_string()),
        (
            "GITHUB_SHA",
            "0123456789abcdef0123456789abcdef01234567".to_string(),
        ),
    ])
}

pub(crate) fn workflow_identity() -> WorkflowIdentity {
    WorkflowIdentity {
        repository: RepositoryNwo {
            owner: "octo".to_string(),
            name: "widgets".to_string(),
        },
        run_id: 4242,
        run_attempt: 1,
        workflow_name: "Code scanning".to_string(),
        job_name: "analyze".to_string(),
        git_ref: "refs/heads/main".to_string(),
        sha: "0123456789abcdef0123456789abcdef01234567".to_string(),
    }
}

pub(crate) fn settings() -> Settings {
    Settings {
        server_url: "https://github.com".to_string(),
        api_url: "https://api.github.com".to_string(),
        token: Some("token".to_string()),
        test_mode: false,
        local_run: false,
        state_dir: std::env::temp_dir(),
    }
}
