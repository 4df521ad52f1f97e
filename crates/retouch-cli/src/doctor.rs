use std::path::Path;

use retouch_core::config::{resolve_api_key, RetouchConfig, API_KEY_VAR};
use retouch_core::executor::ToolExecutor;
use serde::Serialize;
use tracing::{debug, warn};

/// Readiness of everything an `edit` run needs before its first stage.
#[derive(Debug, Serialize)]
pub struct DoctorReport {
    pub tool: ToolCheck,
    pub credential: CredentialCheck,
    pub output_dir: OutputDirCheck,
    pub overall_ready: bool,
}

#[derive(Debug, Serialize)]
pub struct ToolCheck {
    pub tool: String,
    pub binary: Option<String>,
    pub error: Option<String>,
}

/// Credential presence only; the value itself is never reported.
#[derive(Debug, Serialize)]
pub struct CredentialCheck {
    pub present: bool,
    pub variables: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct OutputDirCheck {
    pub path: String,
    pub writable: bool,
    pub error: Option<String>,
}

impl DoctorReport {
    /// Run all checks against `config`, reading the environment through `lookup`.
    pub fn run<F>(config: &RetouchConfig, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let tool = check_tool(config);
        let credential = CredentialCheck {
            present: resolve_api_key(&config.provider, lookup).is_some(),
            variables: vec![API_KEY_VAR.to_string(), config.provider.api_key_env.clone()],
        };
        let output_dir = check_output_dir(Path::new(&config.executor.output_dir));
        let overall_ready = tool.binary.is_some() && credential.present && output_dir.writable;

        Self {
            tool,
            credential,
            output_dir,
            overall_ready,
        }
    }

    /// Reasons the system is not ready. Empty if `overall_ready` is true.
    pub fn not_ready_reasons(&self) -> Vec<String> {
        let mut reasons = Vec::new();

        if self.tool.binary.is_none() {
            reasons.push(format!("tool \"{}\" cannot be located", self.tool.tool));
        }
        if !self.credential.present {
            reasons.push(format!(
                "no provider credential in {}",
                self.credential.variables.join(" or ")
            ));
        }
        if !self.output_dir.writable {
            reasons.push(format!(
                "output directory \"{}\" is not writable",
                self.output_dir.path
            ));
        }

        reasons
    }
}

fn check_tool(config: &RetouchConfig) -> ToolCheck {
    let executor = ToolExecutor::from_config(&config.executor);
    match executor.resolve_binary() {
        Ok(path) => {
            debug!(tool = %config.executor.tool, binary = %path.display(), "tool found");
            ToolCheck {
                tool: config.executor.tool.clone(),
                binary: Some(path.display().to_string()),
                error: None,
            }
        }
        Err(e) => {
            warn!(tool = %config.executor.tool, error = %e, "tool not found");
            ToolCheck {
                tool: config.executor.tool.clone(),
                binary: None,
                error: Some(e.to_string()),
            }
        }
    }
}

/// Create the directory if needed and prove a file can be written into it.
fn check_output_dir(dir: &Path) -> OutputDirCheck {
    let probe = dir.join(".retouch-doctor");
    let result = std::fs::create_dir_all(dir)
        .and_then(|_| std::fs::write(&probe, b""))
        .and_then(|_| std::fs::remove_file(&probe));

    OutputDirCheck {
        path: dir.display().to_string(),
        writable: result.is_ok(),
        error: result.err().map(|e| e.to_string()),
    }
}

pub fn print_human_report(report: &DoctorReport) {
    println!("Retouch Doctor Report");
    println!("=====================");
    println!();

    println!("Tool:");
    match &report.tool.binary {
        Some(binary) => println!("  \u{2713} {} ({binary})", report.tool.tool),
        None => {
            println!("  \u{2717} {} not found", report.tool.tool);
            if let Some(err) = &report.tool.error {
                println!("    error: {err}");
            }
        }
    }
    println!();

    println!("Provider credential:");
    if report.credential.present {
        println!("  \u{2713} present");
    } else {
        println!(
            "  \u{2717} missing (checked {})",
            report.credential.variables.join(", ")
        );
    }
    println!();

    println!("Output directory:");
    if report.output_dir.writable {
        println!("  \u{2713} {} is writable", report.output_dir.path);
    } else {
        println!("  \u{2717} {} is not writable", report.output_dir.path);
        if let Some(err) = &report.output_dir.error {
            println!("    error: {err}");
        }
    }
    println!();

    if report.overall_ready {
        println!("Overall: READY");
    } else {
        println!(
            "Overall: NOT READY ({})",
            report.not_ready_reasons().join("; ")
        );
    }
}
