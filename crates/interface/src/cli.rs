//! CLI - Command Line Interface
//!
//! Available Commands:
//! - flowtest run cases.json   - Replay a case file against the chat API
//! - flowtest ping             - Send a probe message
//! - flowtest check-config     - Validate and print the configuration
//!
//! 全局选项 `-c/--config` 指定配置文件，`-v/--verbose` 打开 debug 日志。

use anyhow::Context;
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use std::fs::OpenOptions;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{Level, info, warn};

use flowtest_core::{
    ChatflowClient, ConfigError, FlowtestConfig, LoggingConfig, ResponseMode, RunStatus,
};
use flowtest_persistence::JsonlResultSink;
use flowtest_runtime::{ControllerOptions, ExecutionController, HttpClientFactory};

use crate::loader::load_cases;
use crate::progress::{HELP, InteractiveCommand, ProgressDisplay, apply_command, render_summary};

/// Default configuration file
pub const DEFAULT_CONFIG: &str = "flowtest.yaml";

/// Progress refresh interval
const REFRESH_INTERVAL: Duration = Duration::from_millis(500);

/// CLI Errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CliError {
    #[error("Logging setup failed: {0}")]
    Logging(String),

    #[error("Connection check failed: {0}")]
    ConnectionFailed(String),

    #[error("Run ended with an error: {0}")]
    RunFailed(String),
}

/// Flowtest CLI
#[derive(Parser, Debug)]
#[command(name = "flowtest")]
#[command(author, version, about, long_about = None)]
pub(crate) struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG)]
    pub config: PathBuf,

    /// Verbose output (debug logging)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Commands {
    /// Replay a case file against the chat API
    Run(RunArgs),

    /// Send a probe message to check the connection
    Ping(PingArgs),

    /// Validate the configuration and print it with the key masked
    CheckConfig,
}

#[derive(Args, Debug)]
pub(crate) struct RunArgs {
    /// Case file (JSON array)
    pub cases: PathBuf,

    /// Result file, defaults to a timestamped file under `output.dir`
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Response mode override (blocking | streaming)
    #[arg(long, value_parser = parse_mode)]
    pub mode: Option<ResponseMode>,

    /// Read pause / resume / stop / status commands from stdin
    #[arg(short, long)]
    pub interactive: bool,

    /// Hide the progress bar
    #[arg(short, long)]
    pub quiet: bool,
}

#[derive(Args, Debug)]
pub(crate) struct PingArgs {
    /// Response mode override (blocking | streaming)
    #[arg(long, value_parser = parse_mode)]
    pub mode: Option<ResponseMode>,
}

fn parse_mode(value: &str) -> Result<ResponseMode, String> {
    value.parse().map_err(|e: ConfigError| e.to_string())
}

/// Parse CLI arguments and execute commands
pub async fn run_cli() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = FlowtestConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    init_logging(&config.logging, cli.verbose)?;

    match cli.command {
        Commands::Run(args) => cmd_run(args, config).await,
        Commands::Ping(args) => cmd_ping(args, config).await,
        Commands::CheckConfig => cmd_check_config(&cli.config, &config),
    }
}

/// 安装全局 tracing subscriber（进程内只调用一次）
pub(crate) fn init_logging(config: &LoggingConfig, verbose: bool) -> Result<(), CliError> {
    let level = if verbose {
        Level::DEBUG
    } else {
        parse_level(&config.level)?
    };
    let builder = tracing_subscriber::fmt().with_max_level(level).with_target(false);

    let result = match &config.file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| CliError::Logging(e.to_string()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| CliError::Logging(format!("{}: {}", path.display(), e)))?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
        }
        None => builder.with_writer(std::io::stderr).try_init(),
    };
    result.map_err(|e| CliError::Logging(e.to_string()))
}

pub(crate) fn parse_level(level: &str) -> Result<Level, CliError> {
    level
        .trim()
        .parse()
        .map_err(|_| CliError::Logging(format!("invalid log level '{}'", level)))
}

async fn cmd_run(args: RunArgs, config: FlowtestConfig) -> anyhow::Result<()> {
    let cases = load_cases(&args.cases).await?;
    let total = cases.len();

    let mut api = config.api.clone();
    if let Some(mode) = args.mode {
        api.response_mode = mode;
    }

    let output = args
        .output
        .clone()
        .unwrap_or_else(|| config.output.result_path(Local::now()));
    let sink = JsonlResultSink::create(&output)
        .await
        .with_context(|| format!("cannot write results to {}", output.display()))?;

    let controller = ExecutionController::new(
        Arc::new(HttpClientFactory),
        Arc::new(sink),
        ControllerOptions::from_config(&config.execution),
    );
    let run_id = controller.start(cases, api)?;
    info!(run_id = %run_id, total, "Run started");

    let mut display = if args.quiet {
        ProgressDisplay::hidden()
    } else {
        ProgressDisplay::new(total)
    };
    monitor(&controller, &mut display, args.interactive).await;
    display.finish();

    let snapshot = controller.wait().await;
    println!("{}", render_summary(&snapshot, &output));

    if snapshot.status == RunStatus::Error {
        let message = snapshot.error_message.unwrap_or_default();
        return Err(CliError::RunFailed(message).into());
    }
    Ok(())
}

/// Drives the progress display until the run reaches a terminal state.
///
/// Ctrl-C stops the run; in interactive mode stdin lines are applied as
/// run commands.
async fn monitor(
    controller: &ExecutionController,
    display: &mut ProgressDisplay,
    interactive: bool,
) {
    let mut snapshots = std::pin::pin!(controller.subscribe(REFRESH_INTERVAL));
    let mut ctrl_c = std::pin::pin!(tokio::signal::ctrl_c());
    let mut interrupted = false;

    let (mut commands, mut stdin_open) = if interactive {
        display.println(HELP);
        (spawn_stdin_reader(), true)
    } else {
        (mpsc::unbounded_channel().1, false)
    };

    loop {
        tokio::select! {
            snapshot = snapshots.next() => match snapshot {
                Some(snapshot) => display.update(&snapshot),
                None => break,
            },
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                display.println("Interrupted, stopping run");
                if let Err(e) = controller.stop() {
                    warn!(error = %e, "Failed to stop run");
                }
            }
            line = commands.recv(), if stdin_open => match line {
                Some(line) => handle_line(controller, display, &line),
                None => stdin_open = false,
            },
        }
    }
}

fn handle_line(controller: &ExecutionController, display: &ProgressDisplay, line: &str) {
    if line.trim().is_empty() {
        return;
    }
    let result = line
        .parse::<InteractiveCommand>()
        .map_err(|e| e.to_string())
        .and_then(|command| apply_command(controller, command).map_err(|e| e.to_string()));
    match result {
        Ok(lines) => lines.iter().for_each(|l| display.println(l)),
        Err(e) => display.println(format!("! {}", e)),
    }
}

/// Reads stdin on a dedicated thread so the runtime never blocks on it.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    let spawned = std::thread::Builder::new()
        .name("flowtest-stdin".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
    if let Err(e) = spawned {
        warn!(error = %e, "Interactive input unavailable");
    }
    rx
}

async fn cmd_ping(args: PingArgs, config: FlowtestConfig) -> anyhow::Result<()> {
    let mut api = config.api;
    if let Some(mode) = args.mode {
        api.response_mode = mode;
    }
    let client = ChatflowClient::new(api)?;
    println!(
        "Pinging {} ({} mode)...",
        client.info().endpoint,
        client.config().response_mode
    );

    let (ok, message) = client.test_connection().await;
    if !ok {
        return Err(CliError::ConnectionFailed(message).into());
    }
    println!("{}", message);
    Ok(())
}

fn cmd_check_config(path: &Path, config: &FlowtestConfig) -> anyhow::Result<()> {
    let client = ChatflowClient::new(config.api.clone())?;
    let view = serde_json::json!({
        "name": config.api.name,
        "api": client.info(),
        "execution": config.execution,
        "logging": config.logging,
        "output": config.output,
    });
    println!("Configuration OK: {}", path.display());
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}
