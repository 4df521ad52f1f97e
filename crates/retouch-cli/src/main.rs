mod doctor;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use retouch_core::artifact::{AuditRecord, AuditWriter};
use retouch_core::config::{self, RetouchConfig};
use retouch_core::executor::ToolExecutor;
use retouch_core::media;
use retouch_core::provider::{ChatProvider, Providers};
use retouch_core::session::{RunStatus, SessionState};
use retouch_core::workflow::{EngineOptions, RetryPolicy, RunReport, WorkflowEngine};

use doctor::DoctorReport;

#[derive(Parser)]
#[command(name = "retouch", version, about = "Natural-language image editing with self-correction")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Edit an image according to a natural-language instruction.
    Edit {
        /// Source image to edit.
        #[arg(long)]
        image: PathBuf,
        /// What to change, in plain words.
        #[arg(long)]
        instruction: String,
        /// Retry ceiling for each correction loop.
        #[arg(long)]
        max_retries: Option<u32>,
        /// Path to retouch.toml config file.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Directory for the result image.
        #[arg(long)]
        output_dir: Option<PathBuf>,
        /// Append the transition trail to this JSONL file.
        #[arg(long)]
        audit_log: Option<PathBuf>,
        /// Print the run report as JSON.
        #[arg(long)]
        json: bool,
        /// Emit logs as JSON lines on stderr.
        #[arg(long)]
        log_json: bool,
    },
    /// Check that the tool, credential and output directory are usable.
    Doctor {
        /// Output results as JSON instead of human-readable text.
        #[arg(long)]
        json: bool,
        /// Path to retouch.toml config file.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Some(Command::Edit {
            image,
            instruction,
            max_retries,
            config,
            output_dir,
            audit_log,
            json,
            log_json,
        }) => {
            init_tracing(log_json);
            let mut cfg = load(config.as_deref())?;
            if let Some(n) = max_retries {
                cfg.workflow.max_retries = n;
            }
            if let Some(dir) = output_dir {
                cfg.executor.output_dir = dir.display().to_string();
            }
            run_edit(&cfg, &image, &instruction, audit_log.as_deref(), json).await
        }
        Some(Command::Doctor { json, config }) => {
            init_tracing(false);
            let cfg = load(config.as_deref())?;
            Ok(run_doctor(&cfg, json))
        }
        None => {
            println!("retouch v{}", env!("CARGO_PKG_VERSION"));
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Logs go to stderr so stdout stays parseable with `--json`.
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.with_target(false).init();
    }
}

/// File config, then environment overrides. CLI flags are applied by the caller.
fn load(path: Option<&Path>) -> Result<RetouchConfig> {
    let path = path.unwrap_or_else(|| Path::new(config::DEFAULT_CONFIG_FILE));
    let mut cfg = config::load_config(path)
        .with_context(|| format!("failed to load config from {}", path.display()))?;
    config::apply_env_overrides(&mut cfg, |k| std::env::var(k).ok());
    Ok(cfg)
}

async fn run_edit(
    cfg: &RetouchConfig,
    image: &Path,
    instruction: &str,
    audit_log: Option<&Path>,
    json_output: bool,
) -> Result<ExitCode> {
    let chat = ChatProvider::from_env(&cfg.provider, cfg.executor.tool.clone())
        .context("failed to set up inference provider")?;
    let executor = ToolExecutor::from_config(&cfg.executor);
    let mut engine = WorkflowEngine::new(
        Providers::uniform(chat),
        executor,
        RetryPolicy::from_config(&cfg.workflow),
    )
    .with_options(EngineOptions::from_config(&cfg.workflow));

    let audit_task = match audit_log {
        Some(path) => {
            let mut writer = AuditWriter::create(path)
                .with_context(|| format!("failed to open audit log {}", path.display()))?;
            let (tx, mut rx) = mpsc::unbounded_channel::<AuditRecord>();
            engine = engine.with_audit_sink(tx);
            Some(tokio::spawn(async move {
                while let Some(record) = rx.recv().await {
                    if let Err(e) = writer.write_record(&record) {
                        tracing::warn!(error = %e, "failed to append audit record");
                    }
                }
            }))
        }
        None => None,
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, cancelling run");
                cancel.cancel();
            }
        });
    }

    if !json_output {
        print_header(image, instruction);
    }

    let session = SessionState::new(image, instruction, Path::new(&cfg.executor.output_dir));
    let report = engine.run(session, &cancel).await;

    // Dropping the engine closes the audit channel so the writer drains and exits.
    drop(engine);
    if let Some(task) = audit_task {
        task.await.context("audit writer task failed")?;
    }

    if json_output {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("failed to serialize run report")?
        );
    } else {
        print_timeline(&report);
    }

    Ok(ExitCode::from(exit_status(report.status)))
}

fn exit_status(status: RunStatus) -> u8 {
    match status {
        RunStatus::Succeeded => 0,
        RunStatus::FailedExecution => 2,
        RunStatus::FailedVerification => 3,
        RunStatus::FailedConfiguration => 4,
        RunStatus::FailedInference => 5,
        RunStatus::Cancelled => 130,
        // A report always carries a terminal status.
        RunStatus::Running => 1,
    }
}

fn print_header(image: &Path, instruction: &str) {
    println!("Image:       {}", image.display());
    if let Ok(info) = media::inspect_source(image) {
        println!("             {}x{} {}", info.width, info.height, info.format);
    }
    println!("Instruction: {instruction}");
    println!("{}", "=".repeat(40));
}

fn print_timeline(report: &RunReport) {
    let trail = report.session.trail();
    let total = trail.len();
    let start = trail.first().map(|e| e.timestamp);

    for (i, event) in trail.iter().enumerate() {
        let offset = start
            .map(|s| (event.timestamp - s).num_milliseconds() as f64 / 1000.0)
            .unwrap_or_default();
        println!(
            "[{}/{}] {:<10} +{:>6.1}s  {}",
            i + 1,
            total,
            event.stage.label(),
            offset,
            event.summary
        );
    }

    println!();

    match report.status {
        RunStatus::Succeeded => {
            println!("Status: SUCCEEDED");
            if let Some(output) = &report.output_image {
                println!("Output: {}", output.display());
            }
            if let Some(verification) = report.session.verification() {
                println!("Verifier: {}", verification.feedback);
            }
        }
        status => {
            println!("Status: {}", status.label().to_uppercase());
            println!("Reason: {}", report.reason);
        }
    }

    println!(
        "Retries: {} generation, {} verification",
        report.generation_retries, report.verification_retries
    );
    println!("Total Duration: {:.1}s", report.duration_ms as f64 / 1000.0);
}

fn run_doctor(cfg: &RetouchConfig, json_output: bool) -> ExitCode {
    let report = DoctorReport::run(cfg, |k| std::env::var(k).ok());

    if json_output {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("failed to serialize doctor report: {e}");
                return ExitCode::from(1);
            }
        }
    } else {
        doctor::print_human_report(&report);
    }

    if report.overall_ready {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}
