use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{ExecutorAdapter, ExecutorError, ToolCommand};
use crate::session::ExecutionResult;

/// Pre-scripted outcome for one `execute` call.
#[derive(Debug, Clone)]
pub enum ScriptedRun {
    /// Exit 0 and report the command's output path as the result image.
    Succeed,
    /// Non-zero exit with the given stderr.
    Fail { exit_code: i32, stderr: String },
    /// Adapter-level failure: the tool cannot be started.
    Missing,
}

#[derive(Debug, Default)]
struct Inner {
    runs: VecDeque<ScriptedRun>,
    seen: Vec<ToolCommand>,
    preflight_missing: bool,
}

/// Executor test double: replays queued outcomes and records every command.
///
/// When the queue is empty every call succeeds. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct ScriptedExecutor {
    inner: Arc<Mutex<Inner>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_runs(runs: impl IntoIterator<Item = ScriptedRun>) -> Self {
        let exec = Self::new();
        exec.lock().runs.extend(runs);
        exec
    }

    pub fn push(&self, run: ScriptedRun) {
        self.lock().runs.push_back(run);
    }

    /// Make `preflight` report the tool as missing.
    pub fn missing_tool(self) -> Self {
        self.lock().preflight_missing = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.lock().seen.len()
    }

    pub fn commands(&self) -> Vec<ToolCommand> {
        self.lock().seen.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ScriptedRun {
    pub fn fail(exit_code: i32, stderr: impl Into<String>) -> Self {
        ScriptedRun::Fail {
            exit_code,
            stderr: stderr.into(),
        }
    }
}

impl ExecutorAdapter for ScriptedExecutor {
    fn preflight(&self) -> Result<(), ExecutorError> {
        if self.lock().preflight_missing {
            return Err(ExecutorError::ToolMissing {
                tool: "scripted".to_string(),
                detail: "scripted preflight failure".to_string(),
            });
        }
        Ok(())
    }

    async fn execute(&self, command: &ToolCommand) -> Result<ExecutionResult, ExecutorError> {
        let run = {
            let mut inner = self.lock();
            inner.seen.push(command.clone());
            inner.runs.pop_front().unwrap_or(ScriptedRun::Succeed)
        };

        match run {
            ScriptedRun::Succeed => Ok(ExecutionResult {
                succeeded: true,
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
                output_image: Some(command.output.clone()),
                duration_ms: 1,
            }),
            ScriptedRun::Fail { exit_code, stderr } => Ok(ExecutionResult {
                succeeded: false,
                exit_code,
                stdout: String::new(),
                stderr,
                output_image: None,
                duration_ms: 1,
            }),
            ScriptedRun::Missing => Err(ExecutorError::ToolMissing {
                tool: command.program.clone(),
                detail: "scripted missing tool".to_string(),
            }),
        }
    }
}
