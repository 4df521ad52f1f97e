//! Executor adapter: runs generated commands against the external image tool.
//!
//! Commands are structured argument vectors and are never handed to a shell.
//! A non-zero exit or a timeout is a normal [`ExecutionResult`] with
//! `succeeded == false`; only a tool that cannot be located or started at all
//! is an [`ExecutorError`].

pub mod process;
mod scripted;
mod tool;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::ExecutionResult;

pub use scripted::{ScriptedExecutor, ScriptedRun};
pub use tool::{ExecutorPolicy, ToolExecutor};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("tool binary '{tool}' not found: {detail}")]
    ToolMissing { tool: String, detail: String },

    #[error("failed to invoke '{program}': {source}")]
    SpawnFailed {
        program: String,
        source: std::io::Error,
    },

    #[error("cannot prepare output location '{path}': {source}")]
    OutputLocation {
        path: String,
        source: std::io::Error,
    },
}

/// A fully resolved tool invocation: program name, argument vector, and the
/// result image path the arguments write to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
    pub output: PathBuf,
}

impl ToolCommand {
    pub fn new<I, S>(program: impl Into<String>, args: I, output: impl Into<PathBuf>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            output: output.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.program.trim().is_empty() || self.args.is_empty()
    }

    /// Human-readable command line for logs. Never executed.
    pub fn display_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(quote_for_display)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn quote_for_display(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+%@".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Runs a [`ToolCommand`] and normalizes its outcome.
pub trait ExecutorAdapter: Send + Sync {
    /// Verify the tool can be located before any work starts.
    fn preflight(&self) -> Result<(), ExecutorError> {
        Ok(())
    }

    fn execute(
        &self,
        command: &ToolCommand,
    ) -> impl Future<Output = Result<ExecutionResult, ExecutorError>> + Send;
}

impl<T: ExecutorAdapter> ExecutorAdapter for Arc<T> {
    fn preflight(&self) -> Result<(), ExecutorError> {
        (**self).preflight()
    }

    fn execute(
        &self,
        command: &ToolCommand,
    ) -> impl Future<Output = Result<ExecutionResult, ExecutorError>> + Send {
        (**self).execute(command)
    }
}
