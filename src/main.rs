mod api;
mod config;
mod error;
mod fingerprint;
mod git;
mod job_context;
mod payload;
mod sarif;
mod status_report;
mod telemetry;
#[cfg(test)]
mod test_harness;
mod upload;
mod validate;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use opentelemetry::KeyValue;
use tracing::{error, info};

use crate::api::{ApiClient, HttpApiClient, resolve_analysis_key};
use crate::config::{Mode, RepositoryNwo, Settings, WorkflowIdentity, env_lookup, required};
use crate::fingerprint::LineHashEnricher;
use crate::job_context::JobContext;
use crate::payload::PayloadIdentity;
use crate::status_report::{
    ActionName, ActionStatus, StatusReportBuilder, StatusReporter, UploadCompletedReport,
    now_rfc3339,
};
use crate::telemetry::{Telemetry, current_trace_id, init_logging, with_span};
use crate::upload::{UploadInputs, Uploader, upload_sarif};
use crate::validate::{JsonSchemaValidator, SchemaValidator};

/// CLI arguments for sarif-upload execution.
#[derive(Parser, Debug)]
#[command(
    name = "sarif-upload",
    about = "Validate, combine, fingerprint and upload SARIF results to code scanning.",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// Subcommands supported by the CLI.
#[derive(Subcommand, Debug)]
enum Command {
    /// Upload one SARIF file or every SARIF file under a directory.
    Upload(UploadArgs),
    /// Send a status report for one phase of the current job.
    Status(StatusArgs),
}

/// Options shared by every command that talks about a job.
#[derive(Args, Debug, Clone)]
struct JobArgs {
    #[arg(long, value_name = "OWNER/NAME", help = "Overrides GITHUB_REPOSITORY.")]
    repository: Option<String>,
    #[arg(long = "ref", value_name = "REF", help = "Overrides GITHUB_REF.")]
    git_ref: Option<String>,
    #[arg(
        long,
        value_name = "SHA",
        help = "Commit the analysis belongs to. Defaults to HEAD of the checkout."
    )]
    commit: Option<String>,
    #[arg(long, value_name = "PATH", default_value = ".")]
    checkout_path: PathBuf,
    #[arg(
        long,
        value_name = "JSON",
        help = "Matrix variables of the job, reported with status reports."
    )]
    matrix: Option<String>,
    #[arg(
        long,
        value_name = "URL",
        help = "OTLP HTTP collector URL (recommended: http://localhost:4318/)."
    )]
    otel: Option<String>,
}

/// Arguments for uploading SARIF results.
#[derive(Args, Debug, Clone)]
struct UploadArgs {
    #[arg(long, value_name = "PATH")]
    sarif: PathBuf,
    #[arg(long, value_enum, default_value_t = Mode::Actions)]
    mode: Mode,
    #[arg(
        long,
        value_name = "JSON",
        help = "Environment of the analysis, sent with the upload in actions mode."
    )]
    environment: Option<String>,
    #[arg(long, value_name = "NAME")]
    analysis_name: Option<String>,
    #[arg(
        long,
        value_name = "PATH",
        help = "JSON schema to validate SARIF files against instead of the built-in one."
    )]
    sarif_schema: Option<PathBuf>,
    #[command(flatten)]
    job: JobArgs,
}

/// Arguments for sending a single status report.
#[derive(Args, Debug, Clone)]
struct StatusArgs {
    #[arg(long, value_enum)]
    action: ActionName,
    #[arg(long, value_enum)]
    status: ActionStatus,
    #[arg(
        long,
        value_name = "TIMESTAMP",
        help = "RFC 3339 start time of the phase. Defaults to now."
    )]
    started_at: Option<String>,
    #[arg(long)]
    cause: Option<String>,
    #[arg(long)]
    exception: Option<String>,
    #[arg(long, help = "Never fail the job because the report was rejected.")]
    ignore_failures: bool,
    #[command(flatten)]
    job: JobArgs,
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:?}");
            std::process::ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let (name, otel) = match &cli.command {
        Command::Upload(args) => ("upload", args.job.otel.clone()),
        Command::Status(args) => ("status", args.job.otel.clone()),
    };
    let telemetry = match &otel {
        Some(url) => Some(Telemetry::new(url)?),
        None => None,
    };
    init_logging();
    let result = with_span(
        telemetry.as_ref(),
        &format!("sarif-upload {name}"),
        &[KeyValue::new("sarif_upload.command", name)],
        || {
            if let Some(trace_id) = current_trace_id() {
                eprintln!("trace-id={trace_id}");
            }
            match cli.command {
                Command::Upload(args) => match args.mode {
                    Mode::Actions => run_actions_upload(&args, telemetry.as_ref()),
                    Mode::Standalone => run_standalone_upload(&args, telemetry.as_ref()),
                },
                Command::Status(args) => run_status(&args, telemetry.as_ref()),
            }
        },
    );
    if let Some(telemetry) = telemetry {
        if let Err(err) = telemetry.shutdown() {
            error!("telemetry shutdown failed: {err}");
        }
    }
    result
}

/// Environment lookup with the command line taking precedence.
fn overlay_lookup(job: &JobArgs, name: &str) -> Option<String> {
    let overridden = match name {
        "GITHUB_REPOSITORY" => job.repository.clone(),
        "GITHUB_REF" => job.git_ref.clone(),
        "GITHUB_SHA" => job.commit.clone(),
        _ => None,
    };
    overridden.or_else(|| env_lookup(name))
}

/// State and identity of the workflow job this process runs in.
struct Job {
    settings: Settings,
    identity: WorkflowIdentity,
    context: JobContext,
}

impl Job {
    fn load(args: &JobArgs) -> Result<Self> {
        let lookup = |name: &str| overlay_lookup(args, name);
        let settings = Settings::from_lookup(&lookup);
        let identity = WorkflowIdentity::from_lookup(&lookup)?;
        let context = JobContext::load(&settings.job_state_path(&identity))?;
        Ok(Self {
            settings,
            identity,
            context,
        })
    }

    fn client(&self) -> Result<HttpApiClient> {
        HttpApiClient::new(&self.settings.api_url, self.settings.token.clone())
    }

    /// Analysis key and commit that reports and uploads of this job refer to.
    fn analysis_target(
        &mut self,
        client: &dyn ApiClient,
        args: &JobArgs,
    ) -> Result<(String, String)> {
        let analysis_key = resolve_analysis_key(client, &self.identity, &mut self.context)
            .context("failed to resolve the analysis key")?;
        let commit_oid = match &args.commit {
            Some(commit) => commit.clone(),
            None => git::commit_oid_or(&args.checkout_path, &self.identity.sha),
        };
        Ok((analysis_key, commit_oid))
    }
}

fn schema_validator(args: &UploadArgs) -> Result<JsonSchemaValidator> {
    match &args.sarif_schema {
        Some(path) => JsonSchemaValidator::from_path(path),
        None => JsonSchemaValidator::sarif_2_1_0(),
    }
}

fn job_failed(context: &JobContext) -> anyhow::Error {
    anyhow::anyhow!(
        "{}",
        context.failure().unwrap_or("status report was rejected")
    )
}

fn send_report(
    reporter: &StatusReporter<'_>,
    context: &mut JobContext,
    report: &impl serde::Serialize,
    ignore_failures: bool,
    telemetry: Option<&Telemetry>,
) -> Result<()> {
    let accepted = with_span(telemetry, "status_report", &[], || {
        reporter.send(context, report, ignore_failures)
    })?;
    if !accepted {
        return Err(job_failed(context));
    }
    Ok(())
}

fn run_actions_upload(args: &UploadArgs, telemetry: Option<&Telemetry>) -> Result<()> {
    let validator = schema_validator(args)?;
    let mut job = Job::load(&args.job)?;
    let client = job.client()?;
    upload_with_status_reports(&mut job, &client, args, &validator, telemetry)
}

/// Uploads between an `upload/starting` report and its terminal report.
fn upload_with_status_reports(
    job: &mut Job,
    client: &dyn ApiClient,
    args: &UploadArgs,
    validator: &dyn SchemaValidator,
    telemetry: Option<&Telemetry>,
) -> Result<()> {
    let (analysis_key, commit_oid) = job.analysis_target(client, &args.job)?;
    let action_started_at = now_rfc3339()?;
    let builder = StatusReportBuilder::new(
        &job.identity,
        analysis_key.clone(),
        commit_oid.clone(),
        args.job.matrix.clone(),
    );
    let reporter = StatusReporter::new(client, &job.settings, &job.identity.repository);

    let starting = builder.build(
        &mut job.context,
        ActionName::Upload,
        ActionStatus::Starting,
        &action_started_at,
        None,
        None,
    )?;
    send_report(&reporter, &mut job.context, &starting, false, telemetry)?;

    let started_at = job
        .context
        .record_workflow_started_at(&action_started_at)?;
    let identity = PayloadIdentity::Actions {
        commit_oid,
        git_ref: job.identity.git_ref.clone(),
        analysis_key,
        analysis_name: args.analysis_name.clone(),
        workflow_run_id: Some(job.identity.run_id),
        environment: args.environment.clone(),
        started_at,
    };
    let inputs = UploadInputs {
        sarif_path: &args.sarif,
        checkout_path: &args.job.checkout_path,
        validator,
        enricher: &LineHashEnricher,
    };
    let uploader = Uploader::new(client, &job.identity.repository, job.settings.test_mode);

    match upload_sarif(&mut job.context, &inputs, identity, &uploader, telemetry) {
        Ok(upload) => {
            info!(
                results = ?upload.num_results_in_sarif,
                bytes = ?upload.zipped_upload_size_bytes,
                "uploaded SARIF"
            );
            let base = builder.build(
                &mut job.context,
                ActionName::Upload,
                ActionStatus::Success,
                &action_started_at,
                None,
                None,
            )?;
            let report = UploadCompletedReport { base, upload };
            send_report(&reporter, &mut job.context, &report, false, telemetry)
        }
        Err(err) => {
            let report = builder.build(
                &mut job.context,
                ActionName::Upload,
                ActionStatus::Failure,
                &action_started_at,
                Some(&err.to_string()),
                Some(&format!("{err:?}")),
            )?;
            if let Err(report_err) =
                send_report(&reporter, &mut job.context, &report, false, telemetry)
            {
                error!("{report_err:#}");
            }
            Err(err)
        }
    }
}

fn run_standalone_upload(args: &UploadArgs, telemetry: Option<&Telemetry>) -> Result<()> {
    let validator = schema_validator(args)?;
    let lookup = |name: &str| overlay_lookup(&args.job, name);
    let settings = Settings::from_lookup(&lookup);
    let repository = RepositoryNwo::parse(&required(&lookup, "GITHUB_REPOSITORY")?)?;
    let git_ref = required(&lookup, "GITHUB_REF")?;
    let commit_sha = match lookup("GITHUB_SHA") {
        Some(commit) => commit,
        None => git::current_commit_id(&args.job.checkout_path)?,
    };
    let client = HttpApiClient::new(&settings.api_url, settings.token.clone())?;
    let uploader = Uploader::new(&client, &repository, settings.test_mode);
    let inputs = UploadInputs {
        sarif_path: &args.sarif,
        checkout_path: &args.job.checkout_path,
        validator: &validator,
        enricher: &LineHashEnricher,
    };
    let mut context = JobContext::in_memory();
    let upload = upload_sarif(
        &mut context,
        &inputs,
        PayloadIdentity::Standalone {
            commit_sha,
            git_ref,
        },
        &uploader,
        telemetry,
    )?;
    info!(
        results = ?upload.num_results_in_sarif,
        bytes = ?upload.zipped_upload_size_bytes,
        "uploaded SARIF"
    );
    Ok(())
}

fn run_status(args: &StatusArgs, telemetry: Option<&Telemetry>) -> Result<()> {
    let mut job = Job::load(&args.job)?;
    let client = job.client()?;
    let (analysis_key, commit_oid) = job.analysis_target(&client, &args.job)?;
    let action_started_at = match &args.started_at {
        Some(started_at) => started_at.clone(),
        None => now_rfc3339()?,
    };
    let builder = StatusReportBuilder::new(
        &job.identity,
        analysis_key,
        commit_oid,
        args.job.matrix.clone(),
    );
    let report = builder.build(
        &mut job.context,
        args.action,
        args.status,
        &action_started_at,
        args.cause.as_deref(),
        args.exception.as_deref(),
    )?;
    let reporter = StatusReporter::new(&client, &job.settings, &job.identity.repository);
    send_report(
        &reporter,
        &mut job.context,
        &report,
        args.ignore_failures,
        telemetry,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_harness::{
        MockApiClient, MockReply, sarif_value, settings, workflow_identity, write_sarif,
    };
    use reqwest::Method;
    use std::ffi::OsString;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).expect("parse CLI")
    }

    #[test]
    fn upload_defaults_to_actions_mode_and_current_directory() {
        let cli = parse(&["sarif-upload", "upload", "--sarif", "results"]);

        let Command::Upload(args) = cli.command else {
            panic!("expected upload command");
        };
        assert_eq!(args.mode, Mode::Actions);
        assert_eq!(args.sarif, PathBuf::from("results"));
        assert_eq!(args.job.checkout_path, PathBuf::from("."));
        assert!(args.sarif_schema.is_none());
    }

    #[test]
    fn upload_accepts_overrides() {
        let cli = parse(&[
            "sarif-upload",
            "upload",
            "--sarif",
            "a.sarif",
            "--mode",
            "standalone",
            "--repository",
            "octo/widgets",
            "--ref",
            "refs/heads/topic",
            "--commit",
            "feedface",
            "--matrix",
            r#"{"os":"linux"}"#,
        ]);

        let Command::Upload(args) = cli.command else {
            panic!("expected upload command");
        };
        assert_eq!(args.mode, Mode::Standalone);
        assert_eq!(args.job.repository.as_deref(), Some("octo/widgets"));
        assert_eq!(args.job.git_ref.as_deref(), Some("refs/heads/topic"));
        assert_eq!(args.job.commit.as_deref(), Some("feedface"));
        assert_eq!(args.job.matrix.as_deref(), Some(r#"{"os":"linux"}"#));
    }

    #[test]
    fn status_requires_action_and_status() {
        assert!(Cli::try_parse_from(["sarif-upload", "status", "--action", "start"]).is_err());

        let cli = parse(&[
            "sarif-upload",
            "status",
            "--action",
            "finish",
            "--status",
            "failure",
            "--cause",
            "boom",
            "--ignore-failures",
        ]);

        let Command::Status(args) = cli.command else {
            panic!("expected status command");
        };
        assert_eq!(args.action, ActionName::Finish);
        assert_eq!(args.status, ActionStatus::Failure);
        assert_eq!(args.cause.as_deref(), Some("boom"));
        assert!(args.exception.is_none());
        assert!(args.ignore_failures);
    }

    #[test]
    fn command_line_overrides_environment() {
        let cli = parse(&[
            "sarif-upload",
            "upload",
            "--sarif",
            "a.sarif",
            "--repository",
            "octo/override",
        ]);
        let Command::Upload(args) = cli.command else {
            panic!("expected upload command");
        };

        assert_eq!(
            overlay_lookup(&args.job, "GITHUB_REPOSITORY").as_deref(),
            Some("octo/override")
        );
    }

    fn upload_args(sarif: &std::path::Path, checkout: &std::path::Path) -> UploadArgs {
        let cli = Cli::try_parse_from([
            OsString::from("sarif-upload"),
            OsString::from("upload"),
            OsString::from("--sarif"),
            sarif.as_os_str().to_owned(),
            OsString::from("--commit"),
            OsString::from("0123456789abcdef0123456789abcdef01234567"),
            OsString::from("--checkout-path"),
            checkout.as_os_str().to_owned(),
        ])
        .expect("parse CLI");
        let Command::Upload(args) = cli.command else {
            panic!("expected upload command");
        };
        args
    }

    fn job_with_known_analysis_key() -> Job {
        let mut context = JobContext::in_memory();
        context
            .set_analysis_key(".github/workflows/scan.yml:analyze".to_string())
            .expect("set analysis key");
        Job {
            settings: settings(),
            identity: workflow_identity(),
            context,
        }
    }

    fn status_bodies(client: &MockApiClient) -> Vec<serde_json::Value> {
        client
            .requests()
            .into_iter()
            .filter(|request| request.path.ends_with("/code-scanning/analysis/status"))
            .filter_map(|request| request.body)
            .collect()
    }

    #[test]
    fn rejected_starting_report_prevents_upload() {
        let dir = tempfile::tempdir().expect("temp dir");
        let sarif = write_sarif(dir.path(), "a.sarif", &sarif_value("2.1.0", &[("lint", 1)]));
        let client = MockApiClient::with_replies(vec![MockReply::Status(404, String::new())]);
        let validator = JsonSchemaValidator::sarif_2_1_0().expect("schema");
        let mut job = job_with_known_analysis_key();

        let result = upload_with_status_reports(
            &mut job,
            &client,
            &upload_args(&sarif, dir.path()),
            &validator,
            None,
        );

        assert!(result.is_err());
        let requests = client.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].body.as_ref().expect("body")["status"], "starting");
        assert!(!job.context.upload_performed());
    }

    #[test]
    fn success_report_carries_upload_measurements() {
        let dir = tempfile::tempdir().expect("temp dir");
        let sarif = write_sarif(dir.path(), "a.sarif", &sarif_value("2.1.0", &[("lint", 2)]));
        let client = MockApiClient::new();
        let validator = JsonSchemaValidator::sarif_2_1_0().expect("schema");
        let mut job = job_with_known_analysis_key();

        upload_with_status_reports(
            &mut job,
            &client,
            &upload_args(&sarif, dir.path()),
            &validator,
            None,
        )
        .expect("upload");

        let requests = client.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[1].method, Method::PUT);
        assert_eq!(requests[1].path, "/repos/octo/widgets/code-scanning/analysis");
        let reports = status_bodies(&client);
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0]["status"], "starting");
        assert_eq!(reports[1]["status"], "success");
        assert_eq!(reports[1]["num_results_in_sarif"], 2);
        assert!(reports[1]["raw_upload_size_bytes"].as_u64().is_some());
        assert!(reports[1]["completed_at"].is_string());
    }

    #[test]
    fn failed_upload_reports_cause_and_exception() {
        let dir = tempfile::tempdir().expect("temp dir");
        let missing = dir.path().join("missing.sarif");
        let client = MockApiClient::new();
        let validator = JsonSchemaValidator::sarif_2_1_0().expect("schema");
        let mut job = job_with_known_analysis_key();

        let result = upload_with_status_reports(
            &mut job,
            &client,
            &upload_args(&missing, dir.path()),
            &validator,
            None,
        );

        assert!(result.is_err());
        let reports = status_bodies(&client);
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[1]["status"], "failure");
        assert!(
            reports[1]["cause"]
                .as_str()
                .expect("cause")
                .contains("missing.sarif")
        );
        assert!(reports[1]["exception"].is_string());
        assert!(reports[1].get("num_results_in_sarif").is_none());
    }
}
