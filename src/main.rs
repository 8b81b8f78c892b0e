//! # Unveil — scheduled guest notification dispatch
//!
//! Usage:
//!   unveil init                    # Write default config and create the database
//!   unveil serve                   # Start the HTTP gateway (timer calls /api/v1/dispatch/run)
//!   unveil run-once                # Run one dispatch batch and print its summary
//!   unveil sweep                   # Resume jobs stuck in `sending`
//!   unveil jobs --status failed    # List jobs
//!   unveil cancel <job-id>         # Cancel a job that has not started

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use unveil_core::config::UnveilConfig;
use unveil_core::types::JobStatus;
use unveil_scheduler::{DispatchEngine, SchedulerDb};

#[derive(Parser)]
#[command(
    name = "unveil",
    version,
    about = "📣 Unveil — scheduled, audience-targeted notifications for event guests"
)]
struct Cli {
    /// Config file (defaults to ~/.unveil/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP gateway
    Serve {
        /// Override gateway.port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run one dispatch batch and print the summary as JSON
    RunOnce,
    /// Run only the stale-job reconciliation sweep
    Sweep,
    /// List jobs, optionally filtered by status
    Jobs {
        #[arg(short, long)]
        status: Option<String>,
    },
    /// Cancel a scheduled job
    Cancel { job_id: String },
    /// Write a default config (if missing) and create the database
    Init,
}

fn init_logging(verbose: bool, json: bool) {
    let filter = if verbose {
        "unveil=debug,unveil_scheduler=debug,unveil_channels=debug,unveil_gateway=debug,tower_http=debug"
    } else {
        "unveil=info,unveil_scheduler=info,unveil_channels=info,unveil_gateway=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config
        .as_deref()
        .map(|p| PathBuf::from(shellexpand::tilde(p).to_string()))
        .or_else(|| std::env::var("UNVEIL_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(UnveilConfig::default_path)
}

fn load_config(path: &Path) -> Result<UnveilConfig> {
    if path.exists() {
        Ok(UnveilConfig::load_from(path)?)
    } else {
        tracing::warn!("⚠️ No config at {}; using defaults", path.display());
        Ok(UnveilConfig::default().with_env_overrides())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json);

    let path = config_path(&cli);

    match cli.command {
        Command::Init => {
            if path.exists() {
                println!("⚠️  Config already exists: {}", path.display());
            } else {
                UnveilConfig::default().save_to(&path)?;
                println!("✅ Config written: {}", path.display());
            }
            let config = load_config(&path)?;
            SchedulerDb::open(&config.database_path())?;
            println!("✅ Database ready: {}", config.database_path().display());
        }
        Command::Serve { port } => {
            let mut config = load_config(&path)?;
            if let Some(port) = port {
                config.gateway.port = port;
            }
            println!("📣 Unveil v{}", env!("CARGO_PKG_VERSION"));
            println!(
                "   🌐 Gateway:  http://{}:{}",
                config.gateway.host, config.gateway.port
            );
            println!("   🗄️  Database: {}", config.database_path().display());
            println!();
            unveil_gateway::start(config).await?;
        }
        Command::RunOnce => {
            let engine = DispatchEngine::from_config(load_config(&path)?)?;
            let summary = engine.run_batch(chrono::Utc::now()).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Sweep => {
            let engine = DispatchEngine::from_config(load_config(&path)?)?;
            let summary = engine.sweep_stale(chrono::Utc::now()).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Jobs { status } => {
            let status = status
                .as_deref()
                .map(str::parse::<JobStatus>)
                .transpose()?;
            let config = load_config(&path)?;
            let db = SchedulerDb::open(&config.database_path())?;
            let jobs = db.list_jobs(status)?;
            if jobs.is_empty() {
                println!("No jobs.");
            }
            for job in jobs {
                println!(
                    "{}  {:<9}  {}  event={}  ok={} failed={}",
                    job.id,
                    job.status,
                    job.send_at.to_rfc3339(),
                    job.event_id,
                    job.success_count,
                    job.failure_count
                );
            }
        }
        Command::Cancel { job_id } => {
            let engine = DispatchEngine::from_config(load_config(&path)?)?;
            let job = engine.cancel_job(&job_id)?;
            println!("🛑 Job {} is now {}", job.id, job.status);
        }
    }

    Ok(())
}
