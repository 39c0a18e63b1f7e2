use std::{path::PathBuf, process::ExitCode, time::Duration};

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use plumb_exec::{DEFAULT_CHUNK_SIZE, prelude::*};
use plumb_model::ProcessStatus;
use plumb_observe::{LoggerConfig, LoggerFormat, LoggerLevel, init_logger};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "plumb")]
#[command(version = VERSION)]
#[command(about = "Run a batch of commands connected by named pipes")]
struct Cli {
    /// Batch description (YAML)
    batch: PathBuf,
    /// Log filter, e.g. `info` or `warn,plumb.exec=debug`
    #[arg(long, default_value = "info")]
    log_level: LoggerLevel,
    /// Log output format: text or json
    #[arg(long, default_value = "text")]
    log_format: LoggerFormat,
    /// Parent directory for the batch's FIFO directory
    #[arg(long)]
    fifo_dir: Option<PathBuf>,
    /// Relay buffer size in bytes
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,
    /// Milliseconds between SIGTERM and SIGKILL when a batch is aborted
    #[arg(long, default_value_t = 2000)]
    kill_grace_ms: u64,
    /// Print the completion report as JSON
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn exec_config(&self) -> ExecConfig {
        let mut cfg = ExecConfig::default()
            .with_relay_chunk_size(self.chunk_size)
            .with_kill_grace(Duration::from_millis(self.kill_grace_ms));
        if let Some(dir) = &self.fifo_dir {
            cfg = cfg.with_fifo_dir(dir);
        }
        cfg
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(&cli) {
        Ok(report) => {
            if let Err(e) = print_report(&report, cli.json) {
                eprintln!("plumb: {e:#}");
                return ExitCode::from(2);
            }
            if report.success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            }
        }
        Err(e) => {
            eprintln!("plumb: {e:#}");
            ExitCode::from(2)
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<BatchReport> {
    let logger = LoggerConfig::default()
        .with_level(cli.log_level.clone())
        .with_format(cli.log_format);
    init_logger(&logger).context("logger setup")?;

    let batch = BatchSpec::from_path(&cli.batch)
        .with_context(|| format!("loading {}", cli.batch.display()))?;
    info!(batch = %cli.batch.display(), processes = batch.len(), "batch loaded");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("tokio runtime")?;
    let orchestrator = Orchestrator::new(cli.exec_config());

    runtime.block_on(orchestrator.run(&batch)).map_err(|e| {
        let e = anyhow::Error::new(e);
        error!(error = %format_args!("{e:#}"), "batch aborted");
        e
    })
}

fn print_report(report: &BatchReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    for p in &report.processes {
        let outcome = match (p.status, p.exit_code) {
            (ProcessStatus::NotStarted, _) => "not started".to_string(),
            (ProcessStatus::Killed, _) => "killed".to_string(),
            (_, Some(code)) => format!("exit {code}"),
            (_, None) => "unknown".to_string(),
        };
        println!("[{}] {}: {}", p.index, p.label, outcome);
    }
    Ok(())
}
