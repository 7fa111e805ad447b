use anyhow::{Context, Result};
use reqwest::Method;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::config::{RepositoryNwo, WorkflowIdentity};
use crate::error::UploadError;
use crate::job_context::JobContext;

/// Raw response from the code scanning API.
#[derive(Clone, Debug)]
pub(crate) struct ApiResponse {
    pub(crate) status: u16,
    pub(crate) body: String,
}

impl ApiResponse {
    pub(crate) fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Authenticated REST transport.
///
/// `path` is either relative to the API root (starting with `/`) or an
/// absolute URL returned by a previous response. Transport failures are
/// returned as errors; HTTP error statuses are returned as responses.
/// Implementations do not retry.
pub(crate) trait ApiClient {
    fn request(&self, method: Method, path: &str, body: Option<&Value>) -> Result<ApiResponse>;
}

/// `ApiClient` backed by a blocking `reqwest` client.
pub(crate) struct HttpApiClient {
    client: reqwest::blocking::Client,
    api_url: reqwest::Url,
    token: Option<String>,
}

impl HttpApiClient {
    pub(crate) fn new(api_url: &str, token: Option<String>) -> Result<Self> {
        let api_url = reqwest::Url::parse(api_url).context("parse API URL")?;
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("sarif-upload/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build HTTP client")?;
        Ok(Self {
            client,
            api_url,
            token,
        })
    }

    fn resolve(&self, path: &str) -> Result<reqwest::Url> {
        if path.starts_with("https://") || path.starts_with("http://") {
            return reqwest::Url::parse(path).with_context(|| format!("parse URL {path}"));
        }
        let base = self.api_url.as_str().trim_end_matches('/');
        reqwest::Url::parse(&format!("{base}{path}"))
            .with_context(|| format!("parse URL {base}{path}"))
    }
}

impl ApiClient for HttpApiClient {
    fn request(&self, method: Method, path: &str, body: Option<&Value>) -> Result<ApiResponse> {
        let url = self.resolve(path)?;
        debug!(%method, %url, "sending API request");
        let mut request = self
            .client
            .request(method.clone(), url.clone())
            .header(ACCEPT, "application/vnd.github+json");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .with_context(|| format!("{method} {url} failed"))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .with_context(|| format!("failed to read response body from {url}"))?;
        Ok(ApiResponse { status, body })
    }
}

/// Path of a repository-scoped endpoint.
pub(crate) fn repo_path(repository: &RepositoryNwo, suffix: &str) -> String {
    format!("/repos/{}/{}/{suffix}", repository.owner, repository.name)
}

/// Converts a non-2xx response into `UploadError::HttpStatus`.
pub(crate) fn ensure_success(
    method: &Method,
    path: &str,
    response: ApiResponse,
) -> Result<ApiResponse> {
    if response.is_success() {
        return Ok(response);
    }
    Err(UploadError::HttpStatus {
        method: method.to_string(),
        url: path.to_string(),
        status: response.status,
        body: response.body,
    }
    .into())
}

fn get_json<T: DeserializeOwned>(client: &dyn ApiClient, path: &str) -> Result<T> {
    let response = client.request(Method::GET, path, None)?;
    let response = ensure_success(&Method::GET, path, response)?;
    let mut deserializer = serde_json::Deserializer::from_str(&response.body);
    serde_path_to_error::deserialize(&mut deserializer)
        .with_context(|| format!("unexpected response from GET {path}"))
}

#[derive(Debug, Deserialize)]
struct WorkflowRun {
    workflow_url: String,
}

#[derive(Debug, Deserialize)]
struct Workflow {
    path: String,
}

/// Key identifying the analysis produced by this job: `<workflow path>:<job>`.
///
/// Resolved through the API once per job and cached in the job context.
pub(crate) fn resolve_analysis_key(
    client: &dyn ApiClient,
    identity: &WorkflowIdentity,
    context: &mut JobContext,
) -> Result<String> {
    if let Some(key) = context.analysis_key() {
        return Ok(key.to_string());
    }
    let run_path = repo_path(
        &identity.repository,
        &format!("actions/runs/{}", identity.run_id),
    );
    let run: WorkflowRun = get_json(client, &run_path)?;
    let workflow: Workflow = get_json(client, &run.workflow_url)?;
    let key = format!("{}:{}", workflow.path, identity.job_name);
    debug!(analysis_key = %key, "resolved analysis key");
    context.set_analysis_key(key.clone())?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_harness::{MockApiClient, MockReply, workflow_identity};

    #[test]
    fn analysis_key_follows_workflow_url() {
        let client = MockApiClient::with_replies(vec![
            MockReply::Status(
                200,
                r#"{"id":4242,"workflow_url":"https://api.github.com/repos/octo/widgets/actions/workflows/7"}"#
                    .to_string(),
            ),
            MockReply::Status(
                200,
                r#"{"id":7,"path":".github/workflows/scan.yml"}"#.to_string(),
            ),
        ]);
        let mut context = JobContext::in_memory();

        let key = resolve_analysis_key(&client, &workflow_identity(), &mut context)
            .expect("resolve key");

        assert_eq!(key, ".github/workflows/scan.yml:analyze");
        let requests = client.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].method, Method::GET);
        assert_eq!(requests[0].path, "/repos/octo/widgets/actions/runs/4242");
        assert_eq!(
            requests[1].path,
            "https://api.github.com/repos/octo/widgets/actions/workflows/7"
        );
        assert_eq!(context.analysis_key(), Some(key.as_str()));
    }

    #[test]
    fn analysis_key_is_cached_in_context() {
        let client = MockApiClient::new();
        let mut context = JobContext::in_memory();
        context
            .set_analysis_key("cached.yml:analyze".to_string())
            .expect("set key");

        let key = resolve_analysis_key(&client, &workflow_identity(), &mut context)
            .expect("resolve key");

        assert_eq!(key, "cached.yml:analyze");
        assert!(client.requests().is_empty());
    }

    #[test]
    fn analysis_key_fails_on_error_status() {
        let client = MockApiClient::with_replies(vec![MockReply::Status(
            404,
            r#"{"message":"Not Found"}"#.to_string(),
        )]);
        let mut context = JobContext::in_memory();

        let error = resolve_analysis_key(&client, &workflow_identity(), &mut context)
            .expect_err("run not found");

        assert_eq!(
            error
                .downcast_ref::<UploadError>()
                .and_then(UploadError::http_status),
            Some(404)
        );
        assert!(context.analysis_key().is_none());
    }

    #[test]
    fn ensure_success_accepts_any_2xx() {
        let response = ApiResponse {
            status: 202,
            body: String::new(),
        };

        assert!(ensure_success(&Method::POST, "/x", response).is_ok());
    }

    #[test]
    fn http_client_resolves_relative_and_absolute_paths() {
        let client = HttpApiClient::new("https://ghe.example.com/api/v3/", None).expect("client");

        assert_eq!(
            client.resolve("/repos/o/r").expect("relative").as_str(),
            "https://ghe.example.com/api/v3/repos/o/r"
        );
        assert_eq!(
            client
                .resolve("https://api.github.com/repos/o/r/actions/workflows/1")
                .expect("absolute")
                .as_str(),
            "https://api.github.com/repos/o/r/actions/workflows/1"
        );
    }
}
