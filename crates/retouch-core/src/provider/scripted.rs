//! Deterministic providers that replay queued responses.
//!
//! Used by tests and dry runs. When a queue is empty the provider falls back
//! to a fixed, successful default so a scenario only has to script the calls
//! it cares about.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{
    AnalyzeRequest, Analyzer, CommandGenerator, GenerateRequest, InferenceError, PlanRequest,
    Planner, Verifier, VerifyRequest,
};
use crate::executor::ToolCommand;
use crate::session::{AnalysisNotes, EditPlan, EditStep, VerificationResult};

/// One recorded provider invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    Analyze,
    Plan { feedback: Option<String> },
    Generate { prior_stderr: Option<String> },
    Verify,
}

#[derive(Debug, Default)]
struct Script {
    analyses: VecDeque<Result<AnalysisNotes, InferenceError>>,
    plans: VecDeque<Result<EditPlan, InferenceError>>,
    commands: VecDeque<Result<ToolCommand, InferenceError>>,
    verdicts: VecDeque<Result<VerificationResult, InferenceError>>,
    calls: Vec<ProviderCall>,
    unavailable: Option<String>,
    cancel_after_plan: Option<CancellationToken>,
    latency: Option<Duration>,
}

/// Scripted backend implementing all four capabilities. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct ScriptedProviders {
    script: Arc<Mutex<Script>>,
}

impl ScriptedProviders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_analysis(&self, result: Result<AnalysisNotes, InferenceError>) -> &Self {
        self.lock().analyses.push_back(result);
        self
    }

    pub fn push_plan(&self, result: Result<EditPlan, InferenceError>) -> &Self {
        self.lock().plans.push_back(result);
        self
    }

    pub fn push_command(&self, result: Result<ToolCommand, InferenceError>) -> &Self {
        self.lock().commands.push_back(result);
        self
    }

    pub fn push_verdict(&self, result: Result<VerificationResult, InferenceError>) -> &Self {
        self.lock().verdicts.push_back(result);
        self
    }

    /// Fail every preflight check with `reason`.
    pub fn unavailable(self, reason: impl Into<String>) -> Self {
        self.lock().unavailable = Some(reason.into());
        self
    }

    /// Cancel `token` as soon as the first plan has been returned.
    pub fn cancel_after_plan(self, token: CancellationToken) -> Self {
        self.lock().cancel_after_plan = Some(token);
        self
    }

    /// Sleep before answering each call.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.lock().latency = Some(latency);
        self
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    pub fn plan_calls(&self) -> usize {
        self.count(|c| matches!(c, ProviderCall::Plan { .. }))
    }

    pub fn generate_calls(&self) -> usize {
        self.count(|c| matches!(c, ProviderCall::Generate { .. }))
    }

    pub fn verify_calls(&self) -> usize {
        self.count(|c| matches!(c, ProviderCall::Verify))
    }

    fn count(&self, pred: impl Fn(&ProviderCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|c| pred(*c)).count()
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check(&self) -> Result<(), InferenceError> {
        match &self.lock().unavailable {
            Some(reason) => Err(InferenceError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }

    async fn pause(&self) {
        let latency = self.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

/// The plan used when none is queued.
pub fn default_plan() -> EditPlan {
    EditPlan {
        understanding: Some("black and white with strong contrast".to_string()),
        steps: vec![
            EditStep::new("grayscale", "remove color"),
            EditStep::new("contrast_adjust", "boost contrast")
                .with_param("amount", "strong".into()),
        ],
    }
}

/// Deterministic ffmpeg invocation derived only from the plan and paths.
pub fn command_for(request: &GenerateRequest) -> ToolCommand {
    let filters = request
        .plan
        .steps
        .iter()
        .map(|s| s.operation.as_str())
        .collect::<Vec<_>>()
        .join(",");
    ToolCommand::new(
        "ffmpeg",
        [
            "-y".to_string(),
            "-i".to_string(),
            request.input.to_string_lossy().into_owned(),
            "-vf".to_string(),
            filters,
            request.output.to_string_lossy().into_owned(),
        ],
        request.output.clone(),
    )
}

impl Analyzer for ScriptedProviders {
    fn preflight(&self) -> Result<(), InferenceError> {
        self.check()
    }

    async fn analyze(&self, _request: AnalyzeRequest) -> Result<AnalysisNotes, InferenceError> {
        self.pause().await;
        let mut script = self.lock();
        script.calls.push(ProviderCall::Analyze);
        script.analyses.pop_front().unwrap_or_else(|| {
            Ok(AnalysisNotes {
                description: "scripted scene".to_string(),
                ..AnalysisNotes::default()
            })
        })
    }
}

impl Planner for ScriptedProviders {
    fn preflight(&self) -> Result<(), InferenceError> {
        self.check()
    }

    async fn plan(&self, request: PlanRequest) -> Result<EditPlan, InferenceError> {
        self.pause().await;
        let mut script = self.lock();
        script.calls.push(ProviderCall::Plan {
            feedback: request.prior_feedback,
        });
        let result = script.plans.pop_front().unwrap_or_else(|| Ok(default_plan()));
        if let Some(token) = script.cancel_after_plan.take() {
            token.cancel();
        }
        result
    }
}

impl CommandGenerator for ScriptedProviders {
    fn preflight(&self) -> Result<(), InferenceError> {
        self.check()
    }

    async fn generate(&self, request: GenerateRequest) -> Result<ToolCommand, InferenceError> {
        self.pause().await;
        let mut script = self.lock();
        script.calls.push(ProviderCall::Generate {
            prior_stderr: request.prior_stderr.clone(),
        });
        script
            .commands
            .pop_front()
            .unwrap_or_else(|| Ok(command_for(&request)))
    }
}

impl Verifier for ScriptedProviders {
    fn preflight(&self) -> Result<(), InferenceError> {
        self.check()
    }

    async fn verify(&self, _request: VerifyRequest) -> Result<VerificationResult, InferenceError> {
        self.pause().await;
        let mut script = self.lock();
        script.calls.push(ProviderCall::Verify);
        script
            .verdicts
            .pop_front()
            .unwrap_or_else(|| Ok(VerificationResult::accepted("edit matches the request")))
    }
}
