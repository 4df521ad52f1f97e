//! Workflow engine: drives one session through the transition table.

use std::future::Future;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::graph::{self, Outcome, Route};
use super::retry::{LoopKind, RetryPolicy};
use crate::artifact::AuditRecord;
use crate::config::WorkflowConfig;
use crate::executor::ExecutorAdapter;
use crate::media;
use crate::provider::{
    AnalyzeRequest, Analyzer, CommandGenerator, GenerateRequest, InferenceError, PlanRequest,
    Planner, Providers, Verifier, VerifyRequest,
};
use crate::session::{
    ExecutionResult, RunStatus, SessionPatch, SessionState, Stage, TransitionEvent,
    VerificationResult,
};

// ---------------------------------------------------------------------------
// Options and report
// ---------------------------------------------------------------------------

/// Engine-wide limits that are not part of the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    /// Upper bound on any single provider call.
    pub provider_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from_config(&WorkflowConfig::default())
    }
}

impl EngineOptions {
    pub fn from_config(config: &WorkflowConfig) -> Self {
        Self {
            provider_timeout: Duration::from_secs(config.provider_timeout_seconds),
        }
    }
}

/// What the caller gets back from a run: the terminal status, a readable
/// reason and the final session record.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub session_id: Uuid,
    pub status: RunStatus,
    pub reason: String,
    pub output_image: Option<PathBuf>,
    pub transitions: usize,
    pub generation_retries: u32,
    pub verification_retries: u32,
    pub duration_ms: u64,
    /// Last tool run and verdict, kept for diagnosing failed runs.
    pub last_execution: Option<ExecutionResult>,
    pub last_verification: Option<VerificationResult>,
    #[serde(skip)]
    pub session: SessionState,
}

impl RunReport {
    fn from_session(session: SessionState, duration: Duration) -> Self {
        let output_image = match session.status() {
            RunStatus::Succeeded => session.execution().and_then(|e| e.output_image.clone()),
            _ => None,
        };
        Self {
            session_id: session.session_id(),
            status: session.status(),
            reason: session.reason().unwrap_or_default().to_string(),
            output_image,
            transitions: session.transitions(),
            generation_retries: session.generation_retries(),
            verification_retries: session.verification_retries(),
            duration_ms: duration.as_millis() as u64,
            last_execution: session.execution().cloned(),
            last_verification: session.verification().cloned(),
            session,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }
}

/// Result of running one stage handler, before routing.
struct StepResult {
    outcome: Outcome,
    patch: SessionPatch,
    summary: String,
    /// Failure detail used in the terminal reason.
    detail: String,
}

impl StepResult {
    fn success(patch: SessionPatch, summary: impl Into<String>) -> Self {
        let summary = summary.into();
        Self {
            outcome: Outcome::Success,
            patch,
            detail: summary.clone(),
            summary,
        }
    }

    fn soft_failure(patch: SessionPatch, summary: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::SoftFailure,
            patch,
            summary: summary.into(),
            detail: detail.into(),
        }
    }

    fn error(stage: Stage, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self {
            outcome: Outcome::Error,
            patch: SessionPatch::new(),
            summary: format!("{stage} failed: {detail}"),
            detail,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Runs sessions through Analyze -> Plan -> Generate -> Execute -> Verify.
///
/// The engine holds no per-run state, so one engine can drive many
/// sessions concurrently.
pub struct WorkflowEngine<A, P, G, V, X> {
    providers: Providers<A, P, G, V>,
    executor: X,
    policy: RetryPolicy,
    options: EngineOptions,
    audit: Option<UnboundedSender<AuditRecord>>,
}

impl<A, P, G, V, X> WorkflowEngine<A, P, G, V, X>
where
    A: Analyzer,
    P: Planner,
    G: CommandGenerator,
    V: Verifier,
    X: ExecutorAdapter,
{
    pub fn new(providers: Providers<A, P, G, V>, executor: X, policy: RetryPolicy) -> Self {
        Self {
            providers,
            executor,
            policy,
            options: EngineOptions::default(),
            audit: None,
        }
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// Stream audit records (one per executed stage, plus the outcome).
    pub fn with_audit_sink(mut self, sink: UnboundedSender<AuditRecord>) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Drive `session` to a terminal status.
    pub async fn run(&self, session: SessionState, cancel: &CancellationToken) -> RunReport {
        let span = info_span!("edit_run", session_id = %session.session_id());
        self.run_inner(session, cancel).instrument(span).await
    }

    async fn run_inner(&self, mut session: SessionState, cancel: &CancellationToken) -> RunReport {
        let start = Instant::now();
        info!(
            image = %session.source_image().display(),
            instruction = %session.instruction(),
            max_retries = self.policy.max_retries,
            budget = ?self.policy.budget,
            "edit run started"
        );

        if let Err(reason) = self.preflight(&session) {
            warn!(%reason, "preflight failed");
            self.seal(&mut session, RunStatus::FailedConfiguration, reason);
            return self.finish(session, start);
        }

        let mut stage = graph::INITIAL;
        loop {
            if cancel.is_cancelled() {
                info!(%stage, "cancellation requested");
                self.seal(
                    &mut session,
                    RunStatus::Cancelled,
                    format!("cancelled before {stage}"),
                );
                break;
            }

            info!(
                %stage,
                generation_retries = session.generation_retries(),
                verification_retries = session.verification_retries(),
                "entering stage"
            );

            let step = match stage {
                Stage::Analyze => self.analyze(&session).await,
                Stage::Plan => self.plan(&session).await,
                Stage::Generate => self.generate(&session).await,
                Stage::Execute => self.execute(&session).await,
                Stage::Verify => self.verify(&session).await,
            };

            let route = graph::route(
                stage,
                step.outcome,
                &self.policy,
                session.generation_retries(),
                session.verification_retries(),
            );

            let event = TransitionEvent::new(stage, step.summary.clone());
            let mut patch = step.patch.event(event.clone());

            let next = match route {
                Route::Next(next) => Some(next),
                Route::LoopBack { target, kind } => {
                    warn!(%stage, to = %target, ?kind, detail = %step.detail, "looping back");
                    patch = match kind {
                        LoopKind::Generation => patch.bump_generation_retries(),
                        LoopKind::Verification => patch.bump_verification_retries(),
                    };
                    Some(target)
                }
                Route::Finish(status) => {
                    let reason = self.terminal_reason(status, &session, &step.detail);
                    patch = patch.terminal(status, reason);
                    None
                }
            };

            if let Err(e) = session.apply(patch) {
                error!(%stage, error = %e, "rejected session update");
                self.seal(
                    &mut session,
                    RunStatus::FailedInference,
                    format!("invalid {stage} result: {e}"),
                );
                break;
            }
            self.emit(AuditRecord::transition(session.session_id(), &event));

            match next {
                Some(next) => stage = next,
                None => break,
            }
        }

        self.finish(session, start)
    }

    fn finish(&self, session: SessionState, start: Instant) -> RunReport {
        let report = RunReport::from_session(session, start.elapsed());
        info!(
            status = %report.status,
            reason = %report.reason,
            transitions = report.transitions,
            generation_retries = report.generation_retries,
            verification_retries = report.verification_retries,
            duration_ms = report.duration_ms,
            "edit run finished"
        );
        self.emit(AuditRecord::outcome(
            report.session_id,
            report.status,
            report.reason.clone(),
            report.output_image.clone(),
        ));
        report
    }

    fn seal(&self, session: &mut SessionState, status: RunStatus, reason: String) {
        if let Err(e) = session.apply(SessionPatch::new().terminal(status, reason)) {
            // Only possible if the session was already terminal.
            debug!(error = %e, "session already sealed");
        }
    }

    fn emit(&self, record: AuditRecord) {
        if let Some(tx) = &self.audit {
            if tx.send(record).is_err() {
                debug!("audit sink closed; dropping record");
            }
        }
    }

    fn terminal_reason(&self, status: RunStatus, session: &SessionState, detail: &str) -> String {
        match status {
            RunStatus::FailedExecution => format!(
                "tool failed after {} generation retries: {detail}",
                session.generation_retries()
            ),
            RunStatus::FailedVerification => format!(
                "result rejected after {} verification retries: {detail}",
                session.verification_retries()
            ),
            _ => detail.to_string(),
        }
    }

    /// Checks that need no inference call: source image, credentials, tool.
    fn preflight(&self, session: &SessionState) -> Result<(), String> {
        media::ensure_supported(session.source_image()).map_err(|e| e.to_string())?;
        self.providers
            .preflight()
            .map_err(|e| format!("provider not ready: {e}"))?;
        self.executor.preflight().map_err(|e| e.to_string())?;
        Ok(())
    }

    async fn call<T>(
        &self,
        fut: impl Future<Output = Result<T, InferenceError>>,
    ) -> Result<T, InferenceError> {
        match tokio::time::timeout(self.options.provider_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(InferenceError::Timeout {
                seconds: self.options.provider_timeout.as_secs(),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Stage handlers. Each reads the session and returns a patch; none of
    // them mutates the session directly.
    // -----------------------------------------------------------------------

    async fn analyze(&self, session: &SessionState) -> StepResult {
        let request = AnalyzeRequest {
            image: session.source_image().to_path_buf(),
            instruction: session.instruction().to_string(),
        };
        match self.call(self.providers.analyzer.analyze(request)).await {
            Ok(notes) => {
                let summary = format!("analyzed: {}", clip(&notes.description, 80));
                debug!(focus = ?notes.focus_areas, adjustments = ?notes.suggested_adjustments, "analysis ready");
                StepResult::success(SessionPatch::new().analysis(notes), summary)
            }
            Err(e) => StepResult::error(Stage::Analyze, format!("analysis failed: {e}")),
        }
    }

    async fn plan(&self, session: &SessionState) -> StepResult {
        let prior_feedback = session
            .verification()
            .filter(|v| !v.verified)
            .map(|v| v.feedback.clone());
        let request = PlanRequest {
            instruction: session.instruction().to_string(),
            analysis: session.analysis().cloned().unwrap_or_default(),
            previous_plan: prior_feedback.as_ref().and(session.plan().cloned()),
            prior_feedback,
        };

        match self.call(self.providers.planner.plan(request)).await {
            Ok(plan) if plan.is_empty() => {
                StepResult::error(Stage::Plan, InferenceError::EmptyPlan.to_string())
            }
            Ok(plan) => {
                let summary = format!("{} step(s): {}", plan.steps.len(), plan.operations());
                StepResult::success(SessionPatch::new().plan(plan), summary)
            }
            Err(e) => StepResult::error(Stage::Plan, format!("planning failed: {e}")),
        }
    }

    async fn generate(&self, session: &SessionState) -> StepResult {
        let Some(plan) = session.plan().cloned() else {
            return StepResult::error(Stage::Generate, "no edit plan to generate from");
        };

        // Only an execution failure leaves a failed result behind; a replan
        // after a mismatch starts from a clean, successful execution.
        let failed = session.execution().filter(|e| !e.succeeded);
        let request = GenerateRequest {
            plan,
            input: session.source_image().to_path_buf(),
            output: session.output_target().to_path_buf(),
            prior_command: failed.and(session.command().cloned()),
            prior_stderr: failed.map(|e| e.stderr.clone()),
        };

        match self.call(self.providers.generator.generate(request)).await {
            Ok(command) if command.is_empty() => {
                StepResult::error(Stage::Generate, InferenceError::EmptyCommand.to_string())
            }
            Ok(command) => {
                let summary = command.display_line();
                debug!(command = %summary, "command generated");
                StepResult::success(SessionPatch::new().command(command), summary)
            }
            Err(e) => StepResult::error(Stage::Generate, format!("command generation failed: {e}")),
        }
    }

    async fn execute(&self, session: &SessionState) -> StepResult {
        let Some(command) = session.command() else {
            return StepResult::error(Stage::Execute, "no command to execute");
        };

        match self.executor.execute(command).await {
            Ok(result) if result.succeeded && result.output_image.is_some() => {
                let summary = format!("exit {} in {}ms", result.exit_code, result.duration_ms);
                StepResult::success(SessionPatch::new().execution(result), summary)
            }
            Ok(result) => {
                let detail = last_line(&result.stderr)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("exit code {}", result.exit_code));
                let summary = format!("failed with exit {}: {}", result.exit_code, clip(&detail, 120));
                warn!(exit_code = result.exit_code, stderr = %clip(&result.stderr, 400), "tool run failed");
                StepResult::soft_failure(SessionPatch::new().execution(result), summary, detail)
            }
            Err(e) => StepResult::error(Stage::Execute, e.to_string()),
        }
    }

    async fn verify(&self, session: &SessionState) -> StepResult {
        let Some(result) = session.execution().and_then(|e| e.output_image.clone()) else {
            return StepResult::error(Stage::Verify, "no result image to verify");
        };
        let request = VerifyRequest {
            original: session.source_image().to_path_buf(),
            result,
            instruction: session.instruction().to_string(),
            plan: session.plan().cloned().unwrap_or_default(),
        };

        match self.call(self.providers.verifier.verify(request)).await {
            Ok(verdict) if verdict.verified => {
                let summary = format!("verified ({:?}): {}", verdict.confidence, clip(&verdict.feedback, 120));
                let detail = verdict.feedback.clone();
                let mut step = StepResult::success(SessionPatch::new().verification(verdict), summary);
                step.detail = detail;
                step
            }
            Ok(verdict) => {
                let summary = format!("mismatch: {}", clip(&verdict.feedback, 120));
                let detail = verdict.feedback.clone();
                StepResult::soft_failure(SessionPatch::new().verification(verdict), summary, detail)
            }
            Err(e) => StepResult::error(Stage::Verify, format!("verification failed: {e}")),
        }
    }
}

fn clip(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut clipped: String = text.chars().take(max_chars).collect();
    clipped.push_str("...");
    clipped
}

fn last_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).rev().find(|l| !l.is_empty())
}
