//! Tidings CLI - operate the notification queue.
//!
//! Runs the worker pool against Redis, looks up job status and lists
//! dead-lettered jobs.

mod error;
mod logging;

use clap::{Parser, Subcommand};
use colored::Colorize;
use error::{CliError, CliResult};
use std::path::PathBuf;
use std::sync::Arc;
use tidings_queue::{
    ContentGenerator, DeliveryChannel, JobId, JobLogStore, JobStatusView, LogChannel,
    MessageQueue, QueueService, RedisJobLogStore, RedisQueue, TidingsConfig, TracingObserver,
    Worker,
};
use tracing::info as log_info;

#[derive(Parser)]
#[command(
    name = "tidings",
    author,
    version,
    about = "Notification job queue operator",
    propagate_version = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (.toml or .json); environment variables still apply
    #[arg(short, long, global = true, env = "TIDINGS_CONFIG")]
    config: Option<PathBuf>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker pool until Ctrl-C
    Run {
        /// Number of concurrent consumers (overrides the configuration)
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Show the status of a job
    Status {
        /// Job id
        job_id: String,
    },

    /// List dead-lettered jobs, newest first
    #[command(name = "dead-letters")]
    DeadLetters {
        /// Maximum number of jobs (clamped to 1..=100)
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },

    /// Show broker job counts
    Counts,
}

fn success(msg: &str) {
    eprintln!("  {} {}", "✓".green().bold(), msg.green());
}

fn info(msg: &str) {
    eprintln!("  {} {}", "→".cyan(), msg);
}

fn load_config(path: Option<&PathBuf>) -> CliResult<TidingsConfig> {
    let config = match path {
        Some(path) => TidingsConfig::load(path)?,
        None => TidingsConfig::from_env()?,
    };
    Ok(config)
}

async fn connect(config: &TidingsConfig) -> CliResult<(Arc<dyn MessageQueue>, Arc<dyn JobLogStore>)> {
    let queue: Arc<dyn MessageQueue> = Arc::new(RedisQueue::connect(config).await?);
    let store: Arc<dyn JobLogStore> = Arc::new(RedisJobLogStore::connect(config).await?);
    Ok((queue, store))
}

#[cfg(feature = "smtp")]
fn delivery_channel() -> CliResult<Arc<dyn DeliveryChannel>> {
    use tidings_queue::{SmtpChannel, SmtpSettings};

    match SmtpSettings::from_env()? {
        Some(settings) => Ok(Arc::new(SmtpChannel::new(&settings)?)),
        None => Ok(Arc::new(LogChannel::new())),
    }
}

#[cfg(not(feature = "smtp"))]
fn delivery_channel() -> CliResult<Arc<dyn DeliveryChannel>> {
    Ok(Arc::new(LogChannel::new()))
}

async fn run_worker(config: TidingsConfig, concurrency: Option<usize>) -> CliResult<()> {
    if concurrency == Some(0) {
        return Err(CliError::InvalidArgument(
            "--concurrency must be at least 1".to_string(),
        ));
    }

    let (queue, store) = connect(&config).await?;
    let channel = delivery_channel()?;

    let mut worker = Worker::new(
        queue,
        store,
        ContentGenerator::new()?,
        channel.clone(),
        &config.worker,
    )
    .with_observer(Arc::new(TracingObserver));
    if let Some(concurrency) = concurrency {
        worker = worker.with_concurrency(concurrency);
    }

    let handle = Arc::new(worker).start()?;
    log_info!(
        queue = %config.queue_name,
        channel = channel.name(),
        concurrency = concurrency.unwrap_or(config.worker.concurrency),
        "Worker started"
    );
    info(&format!(
        "Consuming '{}' via {} channel. Press Ctrl-C to stop.",
        config.queue_name,
        channel.name()
    ));

    tokio::signal::ctrl_c().await?;

    info("Shutting down...");
    handle.shutdown(config.worker.shutdown_timeout()).await?;
    success("Worker stopped");
    Ok(())
}

async fn show_status(config: TidingsConfig, job_id: String) -> CliResult<()> {
    let (queue, store) = connect(&config).await?;
    let service = QueueService::new(queue, store, &config);

    let record = service.get_status(&JobId::from(job_id)).await?;
    println!("{}", serde_json::to_string_pretty(&JobStatusView::from(record))?);
    Ok(())
}

async fn list_dead_letters(config: TidingsConfig, limit: usize) -> CliResult<()> {
    let (queue, store) = connect(&config).await?;
    let service = QueueService::new(queue, store, &config);

    let views: Vec<JobStatusView> = service
        .list_dead_lettered(limit)
        .await?
        .into_iter()
        .map(JobStatusView::from)
        .collect();
    println!("{}", serde_json::to_string_pretty(&views)?);
    Ok(())
}

async fn show_counts(config: TidingsConfig) -> CliResult<()> {
    let (queue, store) = connect(&config).await?;
    let service = QueueService::new(queue, store, &config);

    let counts = service.queue_counts().await?;
    println!("{}", serde_json::to_string_pretty(&counts)?);
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }
    logging::init(&logging::LogSettings::from_env(), cli.verbose);

    let result: CliResult<()> = match load_config(cli.config.as_ref()) {
        Ok(config) => match cli.command {
            Commands::Run { concurrency } => run_worker(config, concurrency).await,
            Commands::Status { job_id } => show_status(config, job_id).await,
            Commands::DeadLetters { limit } => list_dead_letters(config, limit).await,
            Commands::Counts => show_counts(config).await,
        },
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        eprintln!("\n  {} {}\n", "Error:".red().bold(), e);
        std::process::exit(e.exit_code());
    }
}
