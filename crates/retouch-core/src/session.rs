//! Session state threaded through a single edit run.
//!
//! The workflow engine is the only writer. Stage handlers read the state and
//! return a [`SessionPatch`]; the engine applies it in one step with
//! [`SessionState::apply`], which enforces the record's invariants and bumps
//! the version.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::executor::ToolCommand;

/// One of the five states of the edit workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Analyze,
    Plan,
    Generate,
    Execute,
    Verify,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Analyze,
        Stage::Plan,
        Stage::Generate,
        Stage::Execute,
        Stage::Verify,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Stage::Analyze => "analyze",
            Stage::Plan => "plan",
            Stage::Generate => "generate",
            Stage::Execute => "execute",
            Stage::Verify => "verify",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Overall status of an edit run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    FailedExecution,
    FailedVerification,
    FailedConfiguration,
    FailedInference,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    pub fn label(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::FailedExecution => "failed-execution",
            RunStatus::FailedVerification => "failed-verification",
            RunStatus::FailedConfiguration => "failed-configuration",
            RunStatus::FailedInference => "failed-inference",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Analyzer output: what is in the image and what should change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisNotes {
    pub description: String,
    pub focus_areas: Vec<String>,
    pub suggested_adjustments: Vec<String>,
    pub technical_notes: String,
}

/// A single planned edit operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditStep {
    pub operation: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
}

impl EditStep {
    pub fn new(operation: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            description: description.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }
}

/// Ordered edit steps produced by the planner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EditPlan {
    #[serde(default)]
    pub understanding: Option<String>,
    pub steps: Vec<EditStep>,
}

impl EditPlan {
    pub fn new(steps: Vec<EditStep>) -> Self {
        Self {
            understanding: None,
            steps,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Comma-separated operation names, for logs and prompts.
    pub fn operations(&self) -> String {
        self.steps
            .iter()
            .map(|s| s.operation.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Outcome of one external tool invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub succeeded: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub output_image: Option<PathBuf>,
    pub duration_ms: u64,
}

impl ExecutionResult {
    /// A failed attempt that never produced process output, e.g. a rejected command.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            exit_code: -1,
            stdout: String::new(),
            stderr: reason.into(),
            output_image: None,
            duration_ms: 0,
        }
    }
}

/// How sure the verifier is about its verdict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    #[default]
    Low,
}

/// Verifier output. `verified == false` is a normal outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub verified: bool,
    #[serde(default)]
    pub confidence: Confidence,
    pub feedback: String,
}

impl VerificationResult {
    pub fn accepted(feedback: impl Into<String>) -> Self {
        Self {
            verified: true,
            confidence: Confidence::High,
            feedback: feedback.into(),
        }
    }

    pub fn rejected(feedback: impl Into<String>) -> Self {
        Self {
            verified: false,
            confidence: Confidence::Medium,
            feedback: feedback.into(),
        }
    }
}

/// One entry in the run's audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub stage: Stage,
    pub timestamp: DateTime<Utc>,
    pub summary: String,
}

impl TransitionEvent {
    pub fn new(stage: Stage, summary: impl Into<String>) -> Self {
        Self {
            stage,
            timestamp: Utc::now(),
            summary: summary.into(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session is sealed with status {status}; no further updates allowed")]
    Sealed { status: RunStatus },

    #[error("a command cannot be recorded without a non-empty edit plan")]
    CommandWithoutPlan,

    #[error("verification requires a successful execution result")]
    VerificationWithoutExecution,

    #[error("status update must be terminal, got {status}")]
    NonTerminalStatus { status: RunStatus },
}

/// A set of field updates produced by one stage handler.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    analysis: Option<AnalysisNotes>,
    plan: Option<EditPlan>,
    command: Option<ToolCommand>,
    execution: Option<ExecutionResult>,
    verification: Option<VerificationResult>,
    bump_generation_retries: bool,
    bump_verification_retries: bool,
    terminal: Option<(RunStatus, String)>,
    event: Option<TransitionEvent>,
}

impl SessionPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn analysis(mut self, notes: AnalysisNotes) -> Self {
        self.analysis = Some(notes);
        self
    }

    pub fn plan(mut self, plan: EditPlan) -> Self {
        self.plan = Some(plan);
        self
    }

    pub fn command(mut self, command: ToolCommand) -> Self {
        self.command = Some(command);
        self
    }

    pub fn execution(mut self, result: ExecutionResult) -> Self {
        self.execution = Some(result);
        self
    }

    pub fn verification(mut self, result: VerificationResult) -> Self {
        self.verification = Some(result);
        self
    }

    pub fn bump_generation_retries(mut self) -> Self {
        self.bump_generation_retries = true;
        self
    }

    pub fn bump_verification_retries(mut self) -> Self {
        self.bump_verification_retries = true;
        self
    }

    pub fn terminal(mut self, status: RunStatus, reason: impl Into<String>) -> Self {
        self.terminal = Some((status, reason.into()));
        self
    }

    pub fn event(mut self, event: TransitionEvent) -> Self {
        self.event = Some(event);
        self
    }
}

/// The single record threaded through one edit run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    session_id: Uuid,
    source_image: PathBuf,
    instruction: String,
    output_target: PathBuf,
    analysis: Option<AnalysisNotes>,
    plan: Option<EditPlan>,
    command: Option<ToolCommand>,
    execution: Option<ExecutionResult>,
    verification: Option<VerificationResult>,
    generation_retries: u32,
    verification_retries: u32,
    status: RunStatus,
    reason: Option<String>,
    version: u64,
    trail: Vec<TransitionEvent>,
}

impl SessionState {
    /// Create a fresh session. The result image path is fixed here for the
    /// whole run: `<output_dir>/edited_<id8>.<source extension>`.
    pub fn new(
        source_image: impl Into<PathBuf>,
        instruction: impl Into<String>,
        output_dir: &Path,
    ) -> Self {
        let session_id = Uuid::new_v4();
        let source_image = source_image.into();
        let output_target = output_target_for(session_id, &source_image, output_dir);

        Self {
            session_id,
            source_image,
            instruction: instruction.into(),
            output_target,
            analysis: None,
            plan: None,
            command: None,
            execution: None,
            verification: None,
            generation_retries: 0,
            verification_retries: 0,
            status: RunStatus::Running,
            reason: None,
            version: 0,
            trail: Vec::new(),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn source_image(&self) -> &Path {
        &self.source_image
    }

    pub fn instruction(&self) -> &str {
        &self.instruction
    }

    pub fn output_target(&self) -> &Path {
        &self.output_target
    }

    pub fn analysis(&self) -> Option<&AnalysisNotes> {
        self.analysis.as_ref()
    }

    pub fn plan(&self) -> Option<&EditPlan> {
        self.plan.as_ref()
    }

    pub fn command(&self) -> Option<&ToolCommand> {
        self.command.as_ref()
    }

    pub fn execution(&self) -> Option<&ExecutionResult> {
        self.execution.as_ref()
    }

    pub fn verification(&self) -> Option<&VerificationResult> {
        self.verification.as_ref()
    }

    pub fn generation_retries(&self) -> u32 {
        self.generation_retries
    }

    pub fn verification_retries(&self) -> u32 {
        self.verification_retries
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn trail(&self) -> &[TransitionEvent] {
        &self.trail
    }

    /// Number of stage executions recorded so far.
    pub fn transitions(&self) -> usize {
        self.trail.len()
    }

    /// Apply a patch atomically. Either every field in the patch is written
    /// or none is. Returns the new version.
    pub fn apply(&mut self, patch: SessionPatch) -> Result<u64, SessionError> {
        if self.status.is_terminal() {
            return Err(SessionError::Sealed {
                status: self.status,
            });
        }

        if patch.command.is_some() {
            let plan = patch.plan.as_ref().or(self.plan.as_ref());
            if plan.map_or(true, EditPlan::is_empty) {
                return Err(SessionError::CommandWithoutPlan);
            }
        }

        if patch.verification.is_some() {
            let execution = patch.execution.as_ref().or(self.execution.as_ref());
            if !execution.is_some_and(|e| e.succeeded) {
                return Err(SessionError::VerificationWithoutExecution);
            }
        }

        if let Some((status, _)) = &patch.terminal {
            if !status.is_terminal() {
                return Err(SessionError::NonTerminalStatus { status: *status });
            }
        }

        if let Some(notes) = patch.analysis {
            self.analysis = Some(notes);
        }
        if let Some(plan) = patch.plan {
            self.plan = Some(plan);
        }
        if let Some(command) = patch.command {
            self.command = Some(command);
        }
        if let Some(execution) = patch.execution {
            self.execution = Some(execution);
        }
        if let Some(verification) = patch.verification {
            self.verification = Some(verification);
        }
        if patch.bump_generation_retries {
            self.generation_retries += 1;
        }
        if patch.bump_verification_retries {
            self.verification_retries += 1;
        }
        if let Some(event) = patch.event {
            self.trail.push(event);
        }
        if let Some((status, reason)) = patch.terminal {
            self.status = status;
            self.reason = Some(reason);
        }

        self.version += 1;
        Ok(self.version)
    }
}

fn output_target_for(session_id: Uuid, source: &Path, output_dir: &Path) -> PathBuf {
    let ext = source
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty())
        .unwrap_or("png");
    let id = session_id.simple().to_string();
    output_dir.join(format!("edited_{}.{ext}", &id[..8]))
}
