//! Workflow runs against a real subprocess, using `sh` as the external tool.
#![cfg(unix)]

use std::path::PathBuf;
use std::time::Duration;

use retouch_core::executor::{ExecutorAdapter, ExecutorPolicy, ToolCommand, ToolExecutor};
use retouch_core::provider::{
    CommandGenerator, GenerateRequest, InferenceError, Providers, ScriptedProviders,
};
use retouch_core::session::{RunStatus, SessionState, Stage, VerificationResult};
use retouch_core::workflow::{RetryPolicy, WorkflowEngine};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Generator emitting `sh -c` scripts; the first `failures` attempts exit 1.
#[derive(Clone)]
struct ShellGenerator {
    failures: std::sync::Arc<std::sync::atomic::AtomicU32>,
}

impl ShellGenerator {
    fn failing(times: u32) -> Self {
        Self {
            failures: std::sync::Arc::new(std::sync::atomic::AtomicU32::new(times)),
        }
    }
}

impl CommandGenerator for ShellGenerator {
    async fn generate(&self, request: GenerateRequest) -> Result<ToolCommand, InferenceError> {
        use std::sync::atomic::Ordering;

        let remaining = self.failures.load(Ordering::SeqCst);
        let script = if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            "echo 'Error parsing filterchain' >&2; exit 1".to_string()
        } else {
            // The output path is passed as $1, never spliced into the script.
            "cp \"$0\" \"$1\"".to_string()
        };
        Ok(ToolCommand::new(
            "sh",
            [
                "-c".to_string(),
                script,
                request.input.to_string_lossy().into_owned(),
                request.output.to_string_lossy().into_owned(),
            ],
            request.output,
        ))
    }
}

fn sh_executor(timeout: Duration) -> ToolExecutor {
    ToolExecutor::new(
        "sh",
        ExecutorPolicy {
            timeout,
            output_buffer_bytes: 64 * 1024,
        },
    )
}

fn source(dir: &TempDir) -> PathBuf {
    let image = dir.path().join("photo.png");
    std::fs::write(&image, b"fake png").unwrap();
    image
}

#[tokio::test]
async fn real_tool_failures_drive_generation_loop() {
    let dir = TempDir::new().unwrap();
    let image = source(&dir);
    let scripted = ScriptedProviders::new();
    let providers = Providers {
        analyzer: scripted.clone(),
        planner: scripted.clone(),
        generator: ShellGenerator::failing(2),
        verifier: scripted.clone(),
    };

    let session = SessionState::new(&image, "sharpen", &dir.path().join("out"));
    let report = WorkflowEngine::new(providers, sh_executor(Duration::from_secs(10)), RetryPolicy::new(3))
        .run(session, &CancellationToken::new())
        .await;

    assert_eq!(report.status, RunStatus::Succeeded, "reason: {}", report.reason);
    assert_eq!(report.generation_retries, 2);
    let output = report.output_image.unwrap();
    assert_eq!(std::fs::read(&output).unwrap(), b"fake png");

    let executes = report
        .session
        .trail()
        .iter()
        .filter(|e| e.stage == Stage::Execute)
        .count();
    assert_eq!(executes, 3);
}

#[tokio::test]
async fn hostile_argument_is_passed_as_data() {
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("pwned");
    let exec = sh_executor(Duration::from_secs(10));

    // An argument containing shell syntax is passed verbatim as data.
    let hostile = format!("x; touch {}", marker.display());
    let out = dir.path().join("out.txt");
    let cmd = ToolCommand::new(
        "sh",
        [
            "-c".to_string(),
            "printf '%s' \"$0\" > \"$1\"".to_string(),
            hostile.clone(),
            out.to_string_lossy().into_owned(),
        ],
        &out,
    );

    let result = exec.execute(&cmd).await.unwrap();
    assert!(result.succeeded, "stderr: {}", result.stderr);
    assert!(!marker.exists());
    assert_eq!(std::fs::read_to_string(&out).unwrap(), hostile);
}

#[tokio::test]
async fn hung_tool_times_out_and_exhausts_budget() {
    let dir = TempDir::new().unwrap();
    let image = source(&dir);
    let providers = ScriptedProviders::new();
    providers.push_command(Ok(ToolCommand::new("sh", ["-c", "sleep 30"], dir.path().join("o.png"))));
    providers.push_command(Ok(ToolCommand::new("sh", ["-c", "sleep 30"], dir.path().join("o.png"))));

    let session = SessionState::new(&image, "blur", &dir.path().join("out"));
    let report = WorkflowEngine::new(
        Providers::uniform(providers),
        sh_executor(Duration::from_millis(200)),
        RetryPolicy::new(1),
    )
    .run(session, &CancellationToken::new())
    .await;

    assert_eq!(report.status, RunStatus::FailedExecution);
    assert_eq!(report.generation_retries, 1);
    let last = report.session.execution().unwrap();
    assert_eq!(last.exit_code, -1);
    assert!(last.stderr.contains("timed out"));
}

#[tokio::test]
async fn unresolvable_tool_fails_preflight() {
    let dir = TempDir::new().unwrap();
    let image = source(&dir);
    let providers = ScriptedProviders::new();
    let executor = ToolExecutor::new("sh", ExecutorPolicy::default())
        .with_binary(dir.path().join("missing-binary"));

    let report = WorkflowEngine::new(Providers::uniform(providers.clone()), executor, RetryPolicy::new(3))
        .run(
            SessionState::new(&image, "x", dir.path()),
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(report.status, RunStatus::FailedConfiguration);
    assert_eq!(providers.call_count(), 0);
}

#[tokio::test]
async fn replanned_command_cannot_reuse_previous_output() {
    let dir = TempDir::new().unwrap();
    let image = source(&dir);
    let session = SessionState::new(&image, "warmer", &dir.path().join("out"));
    let target = session.output_target().to_path_buf();
    let target_arg = target.to_string_lossy().into_owned();

    let providers = ScriptedProviders::new();
    providers.push_command(Ok(ToolCommand::new(
        "sh",
        ["-c", "printf first > \"$0\"", target_arg.as_str()],
        &target,
    )));
    providers.push_verdict(Ok(VerificationResult::rejected("not warm enough")));
    for _ in 0..2 {
        providers.push_command(Ok(ToolCommand::new("sh", ["-c", "exit 0"], &target)));
    }

    let report = WorkflowEngine::new(
        Providers::uniform(providers.clone()),
        sh_executor(Duration::from_secs(10)),
        RetryPolicy::new(1),
    )
    .run(session, &CancellationToken::new())
    .await;

    assert_eq!(report.status, RunStatus::FailedExecution, "reason: {}", report.reason);
    assert_eq!(report.verification_retries, 1);
    assert_eq!(report.generation_retries, 1);
    assert_eq!(providers.verify_calls(), 1);
    let last = report.session.execution().unwrap();
    assert!(!last.succeeded);
    assert!(last.stderr.contains("output file was not created"));
    assert!(!target.exists());
}
