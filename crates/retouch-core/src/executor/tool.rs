use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::process::{run_captured, ProcessExit};
use super::{ExecutorAdapter, ExecutorError, ToolCommand};
use crate::config::ExecutorConfig;
use crate::session::ExecutionResult;

/// Limits applied to every tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorPolicy {
    pub timeout: Duration,
    pub output_buffer_bytes: usize,
}

impl ExecutorPolicy {
    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_seconds),
            output_buffer_bytes: config.output_buffer_bytes,
        }
    }
}

impl Default for ExecutorPolicy {
    fn default() -> Self {
        Self::from_config(&ExecutorConfig::default())
    }
}

/// Executor backed by a real binary on disk.
#[derive(Debug, Clone)]
pub struct ToolExecutor {
    tool: String,
    binary_override: Option<PathBuf>,
    policy: ExecutorPolicy,
}

impl ToolExecutor {
    pub fn new(tool: impl Into<String>, policy: ExecutorPolicy) -> Self {
        Self {
            tool: tool.into(),
            binary_override: None,
            policy,
        }
    }

    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self {
            tool: config.tool.clone(),
            binary_override: config.binary.as_ref().map(PathBuf::from),
            policy: ExecutorPolicy::from_config(config),
        }
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary_override = Some(binary.into());
        self
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    pub fn policy(&self) -> ExecutorPolicy {
        self.policy
    }

    /// Locate the tool binary: the explicit override if set, else `PATH`.
    pub fn resolve_binary(&self) -> Result<PathBuf, ExecutorError> {
        if let Some(path) = &self.binary_override {
            if path.is_file() {
                return Ok(path.clone());
            }
            return Err(ExecutorError::ToolMissing {
                tool: self.tool.clone(),
                detail: format!("configured binary '{}' is not a file", path.display()),
            });
        }

        which::which(&self.tool).map_err(|e| ExecutorError::ToolMissing {
            tool: self.tool.clone(),
            detail: e.to_string(),
        })
    }

    fn accepts_program(&self, program: &str) -> bool {
        if program == self.tool {
            return true;
        }
        let name = Path::new(program).file_name().and_then(|n| n.to_str());
        let own = Path::new(&self.tool).file_name().and_then(|n| n.to_str());
        name.is_some() && name == own
    }
}

impl ExecutorAdapter for ToolExecutor {
    fn preflight(&self) -> Result<(), ExecutorError> {
        let binary = self.resolve_binary()?;
        debug!(tool = %self.tool, binary = %binary.display(), "tool binary resolved");
        Ok(())
    }

    async fn execute(&self, command: &ToolCommand) -> Result<ExecutionResult, ExecutorError> {
        if !self.accepts_program(&command.program) {
            warn!(
                program = %command.program,
                expected = %self.tool,
                "rejecting command for a program other than the configured tool"
            );
            return Ok(ExecutionResult::rejected(format!(
                "command must invoke '{}', got '{}'",
                self.tool, command.program
            )));
        }
        if command.args.is_empty() {
            return Ok(ExecutionResult::rejected("command has no arguments"));
        }

        let binary = self.resolve_binary()?;

        if let Some(parent) = command.output.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ExecutorError::OutputLocation {
                    path: parent.display().to_string(),
                    source: e,
                })?;
        }
        remove_stale_output(&command.output).await?;

        info!(command = %command.display_line(), "running tool");

        let captured = run_captured(
            &binary,
            &command.args,
            self.policy.timeout,
            self.policy.output_buffer_bytes,
        )
        .await
        .map_err(|e| ExecutorError::SpawnFailed {
            program: binary.display().to_string(),
            source: e,
        })?;

        let duration_ms = captured.duration.as_millis() as u64;
        let result = match captured.exit {
            ProcessExit::TimedOut => ExecutionResult {
                succeeded: false,
                exit_code: -1,
                stdout: captured.stdout,
                stderr: append_line(
                    captured.stderr,
                    &format!("timed out after {}s", self.policy.timeout.as_secs()),
                ),
                output_image: None,
                duration_ms,
            },
            ProcessExit::Exited(code) if code != 0 => ExecutionResult {
                succeeded: false,
                exit_code: code,
                stdout: captured.stdout,
                stderr: captured.stderr,
                output_image: None,
                duration_ms,
            },
            ProcessExit::Exited(code) => {
                if tokio::fs::try_exists(&command.output).await.unwrap_or(false) {
                    ExecutionResult {
                        succeeded: true,
                        exit_code: code,
                        stdout: captured.stdout,
                        stderr: captured.stderr,
                        output_image: Some(command.output.clone()),
                        duration_ms,
                    }
                } else {
                    ExecutionResult {
                        succeeded: false,
                        exit_code: code,
                        stdout: captured.stdout,
                        stderr: append_line(captured.stderr, "output file was not created"),
                        output_image: None,
                        duration_ms,
                    }
                }
            }
        };

        info!(
            succeeded = result.succeeded,
            exit_code = result.exit_code,
            duration_ms,
            "tool finished"
        );
        Ok(result)
    }
}

/// A result left by an earlier attempt must not count as this attempt's output.
async fn remove_stale_output(path: &Path) -> Result<(), ExecutorError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!(path = %path.display(), "removed previous output");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ExecutorError::OutputLocation {
            path: path.display().to_string(),
            source: e,
        }),
    }
}

fn append_line(mut text: String, line: &str) -> String {
    if !text.is_empty() && !text.ends_with('\n') {
        text.push('\n');
    }
    text.push_str(line);
    text
}
