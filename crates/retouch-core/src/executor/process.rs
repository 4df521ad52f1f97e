//! Bounded subprocess execution with full output capture.
//!
//! The child runs in its own process group on Unix so a timeout can take
//! down anything it forked.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Grace period between SIGTERM and SIGKILL.
const TERMINATE_GRACE: Duration = Duration::from_millis(300);

/// How long to wait for pipe readers after the child is gone.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// How a captured process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    /// Exited on its own. Signal deaths report `-1`.
    Exited(i32),
    /// Killed after exceeding the timeout.
    TimedOut,
}

/// Everything observed from one process run.
#[derive(Debug, Clone)]
pub struct CapturedOutput {
    pub exit: ProcessExit,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

/// Run `program` with `args`, capturing stdout/stderr up to `max_bytes` each.
///
/// Returns `Err` only when the process cannot be spawned.
pub async fn run_captured(
    program: &Path,
    args: &[String],
    timeout: Duration,
    max_bytes: usize,
) -> std::io::Result<CapturedOutput> {
    let mut child = spawn(program, args)?;
    let start = Instant::now();

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("stdout not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| std::io::Error::other("stderr not captured"))?;

    let stdout_task = tokio::spawn(read_capped(stdout, max_bytes));
    let stderr_task = tokio::spawn(read_capped(stderr, max_bytes));

    let exit = tokio::select! {
        status = child.wait() => {
            let status = status?;
            ProcessExit::Exited(status.code().unwrap_or(-1))
        }
        _ = tokio::time::sleep(timeout) => {
            warn!(program = %program.display(), timeout_ms = timeout.as_millis() as u64, "tool timed out, terminating");
            terminate_process(&mut child).await;
            ProcessExit::TimedOut
        }
    };

    let stdout = drain(stdout_task).await;
    let stderr = drain(stderr_task).await;
    let duration = start.elapsed();

    debug!(
        program = %program.display(),
        ?exit,
        duration_ms = duration.as_millis() as u64,
        stdout_bytes = stdout.len(),
        stderr_bytes = stderr.len(),
        "process finished"
    );

    Ok(CapturedOutput {
        exit,
        stdout,
        stderr,
        duration,
    })
}

fn spawn(program: &Path, args: &[String]) -> std::io::Result<Child> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    {
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    command.spawn()
}

async fn drain(task: tokio::task::JoinHandle<String>) -> String {
    match tokio::time::timeout(DRAIN_TIMEOUT, task).await {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            warn!(error = %e, "output reader task failed");
            String::new()
        }
        Err(_) => {
            warn!("output pipe still open after process exit; dropping reader");
            String::new()
        }
    }
}

async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> String {
    let mut kept: Vec<u8> = Vec::new();
    let mut buf = [0u8; 8192];
    let mut truncated = false;

    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = limit.saturating_sub(kept.len());
                if n <= room {
                    kept.extend_from_slice(&buf[..n]);
                } else {
                    kept.extend_from_slice(&buf[..room]);
                    truncated = true;
                }
            }
        }
    }

    let mut text = String::from_utf8_lossy(&kept).into_owned();
    if truncated {
        text.push_str(TRUNCATION_MARKER);
    }
    text
}

async fn terminate_process(child: &mut Child) {
    #[cfg(unix)]
    {
        let Some(pid) = child.id() else {
            let _ = child.kill().await;
            return;
        };
        let pgid = -(pid as i32);

        if unsafe { libc::kill(pgid, libc::SIGTERM) } != 0 {
            let errno = std::io::Error::last_os_error().raw_os_error();
            if errno == Some(libc::ESRCH) {
                debug!(pid, "process group already exited before SIGTERM");
                return;
            }
            warn!(pid, ?errno, "failed sending SIGTERM to process group; falling back to child.kill");
            let _ = child.kill().await;
            return;
        }

        tokio::time::sleep(TERMINATE_GRACE).await;

        if let Ok(Some(_)) = child.try_wait() {
            return;
        }

        if unsafe { libc::kill(pgid, libc::SIGKILL) } != 0 {
            let errno = std::io::Error::last_os_error().raw_os_error();
            if errno == Some(libc::ESRCH) {
                debug!(pid, "process group exited before SIGKILL escalation");
                return;
            }
            warn!(pid, ?errno, "failed sending SIGKILL to process group");
        }
        let _ = child.kill().await;
    }

    #[cfg(not(unix))]
    {
        let _ = child.kill().await;
    }
}
