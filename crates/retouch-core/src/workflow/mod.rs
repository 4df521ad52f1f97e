//! The self-correcting edit workflow.

mod engine;
pub mod graph;
pub mod retry;

pub use engine::{EngineOptions, RunReport, WorkflowEngine};
pub use retry::{can_retry, LoopKind, RetryPolicy};
