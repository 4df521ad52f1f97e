//! Capability provider contracts.
//!
//! The engine talks to inference backends only through the four traits in
//! this module. Each call is a stateless request/response; the engine owns
//! all session state and retry decisions.

mod chat;
pub mod parse;
mod prompts;
pub mod scripted;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::executor::ToolCommand;
use crate::media::MediaError;
use crate::session::{AnalysisNotes, EditPlan, VerificationResult};

pub use chat::ChatProvider;
pub use scripted::ScriptedProviders;

/// A provider failed to produce a usable response.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("provider call timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("provider returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("provider request failed: {0}")]
    Transport(String),

    #[error("provider rejected credentials: {0}")]
    Authentication(String),

    #[error("malformed provider response: {0}")]
    MalformedResponse(String),

    #[error("planner returned an empty edit plan")]
    EmptyPlan,

    #[error("command generator returned an empty command")]
    EmptyCommand,

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("cannot read image for provider: {0}")]
    Media(#[from] MediaError),
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AnalyzeRequest {
    pub image: PathBuf,
    pub instruction: String,
}

#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub instruction: String,
    pub analysis: AnalysisNotes,
    /// Verifier feedback from the previous cycle; `None` on the first pass.
    pub prior_feedback: Option<String>,
    pub previous_plan: Option<EditPlan>,
}

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub plan: EditPlan,
    pub input: PathBuf,
    pub output: PathBuf,
    /// The command that just failed, on an execution-error loop-back.
    pub prior_command: Option<ToolCommand>,
    pub prior_stderr: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VerifyRequest {
    pub original: PathBuf,
    pub result: PathBuf,
    pub instruction: String,
    pub plan: EditPlan,
}

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

/// Describes the source image relative to the instruction.
pub trait Analyzer: Send + Sync {
    /// Cheap readiness check run before any inference call.
    fn preflight(&self) -> Result<(), InferenceError> {
        Ok(())
    }

    fn analyze(
        &self,
        request: AnalyzeRequest,
    ) -> impl Future<Output = Result<AnalysisNotes, InferenceError>> + Send;
}

/// Turns the instruction and analysis into an ordered, non-empty edit plan.
pub trait Planner: Send + Sync {
    fn preflight(&self) -> Result<(), InferenceError> {
        Ok(())
    }

    fn plan(
        &self,
        request: PlanRequest,
    ) -> impl Future<Output = Result<EditPlan, InferenceError>> + Send;
}

/// Produces a structured tool invocation for an edit plan.
pub trait CommandGenerator: Send + Sync {
    fn preflight(&self) -> Result<(), InferenceError> {
        Ok(())
    }

    fn generate(
        &self,
        request: GenerateRequest,
    ) -> impl Future<Output = Result<ToolCommand, InferenceError>> + Send;
}

/// Judges whether the result image satisfies the instruction.
///
/// `verified == false` is an ordinary outcome, not an error.
pub trait Verifier: Send + Sync {
    fn preflight(&self) -> Result<(), InferenceError> {
        Ok(())
    }

    fn verify(
        &self,
        request: VerifyRequest,
    ) -> impl Future<Output = Result<VerificationResult, InferenceError>> + Send;
}

impl<T: Analyzer> Analyzer for Arc<T> {
    fn preflight(&self) -> Result<(), InferenceError> {
        (**self).preflight()
    }

    fn analyze(
        &self,
        request: AnalyzeRequest,
    ) -> impl Future<Output = Result<AnalysisNotes, InferenceError>> + Send {
        (**self).analyze(request)
    }
}

impl<T: Planner> Planner for Arc<T> {
    fn preflight(&self) -> Result<(), InferenceError> {
        (**self).preflight()
    }

    fn plan(
        &self,
        request: PlanRequest,
    ) -> impl Future<Output = Result<EditPlan, InferenceError>> + Send {
        (**self).plan(request)
    }
}

impl<T: CommandGenerator> CommandGenerator for Arc<T> {
    fn preflight(&self) -> Result<(), InferenceError> {
        (**self).preflight()
    }

    fn generate(
        &self,
        request: GenerateRequest,
    ) -> impl Future<Output = Result<ToolCommand, InferenceError>> + Send {
        (**self).generate(request)
    }
}

impl<T: Verifier> Verifier for Arc<T> {
    fn preflight(&self) -> Result<(), InferenceError> {
        (**self).preflight()
    }

    fn verify(
        &self,
        request: VerifyRequest,
    ) -> impl Future<Output = Result<VerificationResult, InferenceError>> + Send {
        (**self).verify(request)
    }
}

/// The four capability providers used by one engine.
#[derive(Debug, Clone)]
pub struct Providers<A, P, G, V> {
    pub analyzer: A,
    pub planner: P,
    pub generator: G,
    pub verifier: V,
}

impl<T: Clone> Providers<T, T, T, T> {
    /// Use one backend for every capability.
    pub fn uniform(provider: T) -> Self {
        Self {
            analyzer: provider.clone(),
            planner: provider.clone(),
            generator: provider.clone(),
            verifier: provider,
        }
    }
}

impl<A, P, G, V> Providers<A, P, G, V>
where
    A: Analyzer,
    P: Planner,
    G: CommandGenerator,
    V: Verifier,
{
    /// Run every provider's readiness check, stopping at the first failure.
    pub fn preflight(&self) -> Result<(), InferenceError> {
        self.analyzer.preflight()?;
        self.planner.preflight()?;
        self.generator.preflight()?;
        self.verifier.preflight()
    }
}
