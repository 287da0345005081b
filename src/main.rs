use anyhow::{Context, Result, bail};
use bkrotate::config::{self, AppConfig};
use bkrotate::context::AppContext;
use bkrotate::core::{Clock, HistoryStore, JobStatus, Orchestrator, job_statuses};
use bkrotate::logging::{self, LogConfig};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tracing::warn;

#[derive(Parser)]
#[command(name = "bkrotate")]
#[command(about = "Rotating rsync backups to local or removable volumes", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up every job that is due
    Run {
        /// Ignore the job frequencies and back up everything
        #[arg(short, long)]
        force: bool,
    },
    /// Show when each job last ran and when it is due again
    Status {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Serialize)]
struct GlobalArgs {
    /// Additional configuration file, read after the system one
    #[serde(skip)]
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[serde(skip)]
    #[arg(long, global = true)]
    ignore_system_config: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    history_file: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(short, long, global = true)]
    verbose: bool,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(long, global = true)]
    json_logs: bool,
}

impl GlobalArgs {
    fn config_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        if !self.ignore_system_config {
            files.push(PathBuf::from(config::SYSTEM_CONFIG_PATH));
        }
        if let Some(path) = &self.config {
            if !path.is_file() {
                bail!("Configuration file {} does not exist", path.display());
            }
            files.push(path.clone());
        }
        Ok(files)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(&cli.global.config_files()?, Some(&cli.global))
        .context("Failed to load configuration")?;

    logging::init(&LogConfig {
        json: config.json_logs,
        verbose: config.verbose,
        file: config.log_file.clone(),
    })?;

    let jobs = config.job_configs().context("Invalid configuration")?;
    let mut history =
        HistoryStore::load(&config.history_file).context("Failed to read backup history")?;

    match cli.command {
        Commands::Run { force } => {
            if jobs.is_empty() {
                warn!("No backup jobs configured");
            }

            let ctx = AppContext::new(config);
            let summary = Orchestrator::from_context(ctx)
                .run(&jobs, &mut history, force)
                .context("Failed to write backup history")?;

            if summary.failed() > 0 {
                bail!("{} of {} backup jobs failed", summary.failed(), jobs.len());
            }
        }
        Commands::Status { json } => {
            let ctx = AppContext::new(config);
            let statuses = job_statuses(&jobs, &history, ctx.clock.now());
            print_status(&statuses, json)?;
        }
    }

    Ok(())
}

fn print_status(statuses: &[JobStatus], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(statuses)?);
        return Ok(());
    }

    if statuses.is_empty() {
        println!("No backup jobs configured");
        return Ok(());
    }

    for status in statuses {
        let last = status
            .last_backup
            .map_or_else(|| "never".to_string(), |t| t.format("%Y-%m-%d %H:%M").to_string());
        let next = if status.due {
            "now".to_string()
        } else {
            status.next_due.format("%Y-%m-%d %H:%M").to_string()
        };
        println!(
            "{:<16} {:<12} last: {:<16}  next: {:<16}  {}",
            status.name,
            status.strategy.as_str(),
            last,
            next,
            status.destination.display()
        );
    }
    Ok(())
}
