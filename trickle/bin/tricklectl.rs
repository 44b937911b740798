//! Command-line utility for managing the trickle drip mailer
//!
//! This tool provides operational control over the pipeline, including:
//! - Queue inspection and cancellation
//! - Dead-letter listing and manual requeue
//! - Analytics counts and rate limit checks
//! - Running a single scheduler or processor pass on demand

#![allow(clippy::items_after_statements, clippy::single_match_else)]

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use trickle::Trickle;
use trickle_common::{ContentId, DeadLetterId, EventType, JobId, JobStatus};
use trickle_delivery::RateLimitDecision;
use trickle_store::{BackingStore, QueueJob, QueueStore};

/// Command-line utility for managing the trickle drip mailer
#[derive(Parser, Debug)]
#[command(name = "tricklectl")]
#[command(about = "Manage the trickle drip mailer", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the daemon configuration (defaults to the daemon's own lookup)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Queue inspection and cancellation
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    /// Jobs that exhausted their retries
    DeadLetter {
        #[command(subcommand)]
        action: DeadLetterAction,
    },
    /// Analytics aggregates
    Events {
        #[command(subcommand)]
        action: EventsAction,
    },
    /// Subscription rate limiting
    RateLimit {
        #[command(subcommand)]
        action: RateLimitAction,
    },
    /// Drip scheduler
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
    /// Queue processor
    Process {
        #[command(subcommand)]
        action: ProcessAction,
    },
    /// Show the configured sending flags
    Sending,
}

#[derive(Subcommand, Debug)]
enum QueueAction {
    /// Show job counts per status
    Stats,
    /// List jobs, highest priority first
    List {
        /// Filter by status
        #[arg(long, value_enum)]
        status: Option<StatusFilter>,

        /// Maximum number of jobs to show
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Cancel a pending job
    Cancel {
        /// Job ID to cancel
        job_id: i64,

        /// Reason recorded on the job
        #[arg(long, default_value = "Cancelled by operator")]
        reason: String,
    },
}

#[derive(Subcommand, Debug)]
enum DeadLetterAction {
    /// List dead letters, newest first
    List {
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Show one dead letter with its error history
    Show {
        /// Dead letter ID
        id: i64,
    },
    /// Put a dead letter back on the queue with a clean attempt count
    Requeue {
        /// Dead letter ID
        id: i64,
    },
}

#[derive(Subcommand, Debug)]
enum EventsAction {
    /// Count events of one type for a newsletter
    Count {
        /// Newsletter (content) ID
        newsletter: i64,

        /// sent, opened, clicked, bounced or unsubscribed
        event_type: EventType,
    },
}

#[derive(Subcommand, Debug)]
enum RateLimitAction {
    /// Record a subscription attempt for an identity and show the decision
    Check {
        /// Email address or client address
        identity: String,
    },
}

#[derive(Subcommand, Debug)]
enum ScheduleAction {
    /// Run one scheduling pass now
    Tick,
}

#[derive(Subcommand, Debug)]
enum ProcessAction {
    /// Run one processor pass now
    Tick {
        /// Skip the maintenance pass that normally follows
        #[arg(long)]
        skip_maintenance: bool,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum StatusFilter {
    Pending,
    Processing,
    Sent,
    Failed,
    Cancelled,
}

impl From<StatusFilter> for JobStatus {
    fn from(filter: StatusFilter) -> Self {
        match filter {
            StatusFilter::Pending => Self::Pending,
            StatusFilter::Processing => Self::Processing,
            StatusFilter::Sent => Self::Sent,
            StatusFilter::Failed => Self::Failed,
            StatusFilter::Cancelled => Self::Cancelled,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => trickle::config::find_config_file()?,
    };
    let mut trickle = trickle::config::load(&config_path)?;
    let store = trickle.init().await?;

    match cli.command {
        Commands::Queue { action } => match action {
            QueueAction::Stats => cmd_queue_stats(store.as_ref()).await?,
            QueueAction::List { status, limit } => {
                cmd_queue_list(store.as_ref(), status.map(JobStatus::from), limit).await?;
            }
            QueueAction::Cancel { job_id, reason } => {
                store.cancel(JobId(job_id), &reason, Utc::now()).await?;
                println!("Job {job_id} cancelled");
            }
        },
        Commands::DeadLetter { action } => cmd_dead_letter(&trickle, action).await?,
        Commands::Events { action } => match action {
            EventsAction::Count {
                newsletter,
                event_type,
            } => {
                let count = trickle
                    .analytics()?
                    .count(ContentId(newsletter), event_type)
                    .await?;
                println!("{count} {event_type} event(s) for newsletter {newsletter}");
            }
        },
        Commands::RateLimit { action } => match action {
            RateLimitAction::Check { identity } => {
                match trickle.rate_limiter()?.check(&identity, Utc::now()).await? {
                    RateLimitDecision::Allowed { remaining } => {
                        println!("Allowed, {remaining} attempt(s) left in this window");
                    }
                    RateLimitDecision::Limited {
                        retry_after_secs,
                        message,
                    } => {
                        println!("Limited for {}: {message}", format_duration(retry_after_secs));
                    }
                }
            }
        },
        Commands::Schedule {
            action: ScheduleAction::Tick,
        } => {
            let report = trickle.scheduler.tick(&trickle.sending, Utc::now()).await?;
            println!("Scanned:    {}", report.scanned);
            println!("Enqueued:   {}", report.enqueued);
            println!("Caught up:  {}", report.caught_up);
            println!("Skipped:    {}", report.skipped);
            println!("Corrected:  {}", report.corrected);
            println!("Failed:     {}", report.failed);
        }
        Commands::Process {
            action: ProcessAction::Tick { skip_maintenance },
        } => {
            let now = Utc::now();
            let report = trickle.processor.tick(&trickle.sending, now).await?;
            println!("Claimed:        {}", report.claimed);
            println!("Sent:           {}", report.sent);
            println!("Retried:        {}", report.retried);
            println!("Dead-lettered:  {}", report.dead_lettered);
            println!("Cancelled:      {}", report.cancelled);
            println!("Errors:         {}", report.errors);

            if !skip_maintenance {
                let report = trickle.processor.maintain(&trickle.sending, now).await?;
                println!();
                println!("Released:       {}", report.released);
                println!("Purged jobs:    {}", report.purged_jobs);
                println!("Purged logs:    {}", report.purged_logs);
                println!("Purged limits:  {}", report.purged_rate_limits);
            }
        }
        Commands::Sending => {
            let sending = &trickle.sending;
            println!("Configuration:          {}", config_path.display());
            println!("Pause all sending:      {}", sending.pause_all_sending);
            println!("Demo mode:              {}", sending.demo_mode);
            println!("Re-consent required:    {}", sending.reconsent_required);
            println!("Max attempts:           {}", sending.max_attempts);
            println!("Scheduler batch size:   {}", sending.scheduler_batch_size);
            println!("Processor batch size:   {}", sending.processor_batch_size);
            println!("Stuck timeout:          {}m", sending.stuck_timeout_minutes);
        }
    }

    Ok(())
}

/// Show job counts per status
async fn cmd_queue_stats(store: &dyn BackingStore) -> anyhow::Result<()> {
    let stats = store.stats().await?;

    println!("=== Queue Statistics ===\n");
    println!("Pending:       {}", stats.pending);
    println!("Processing:    {}", stats.processing);
    println!("Sent:          {}", stats.sent);
    println!("Failed:        {}", stats.failed);
    println!("Cancelled:     {}", stats.cancelled);
    println!("Dead letters:  {}", stats.dead_letters);

    Ok(())
}

/// List jobs in the queue
async fn cmd_queue_list(
    store: &dyn BackingStore,
    status: Option<JobStatus>,
    limit: usize,
) -> anyhow::Result<()> {
    let jobs = store.list_jobs(status, limit).await?;

    println!(
        "{:<8} {:<11} {:<4} {:<8} {:<22} {:<12} {:<30}",
        "JOB ID", "STATUS", "PRI", "ATTEMPTS", "SCHEDULED", "TEMPLATE", "RECIPIENT"
    );
    println!("{}", "-".repeat(100));

    for job in &jobs {
        print_job(job);
    }

    println!("\nTotal: {} job(s)", jobs.len());

    Ok(())
}

fn print_job(job: &QueueJob) {
    println!(
        "{:<8} {:<11} {:<4} {:<8} {:<22} {:<12} {:<30}",
        job.id.get(),
        job.status.as_str(),
        job.priority.get(),
        job.attempts,
        format_timestamp(job.scheduled_at),
        job.template,
        job.recipient
    );
}

/// Dead letter listing, inspection and requeue
async fn cmd_dead_letter(trickle: &Trickle, action: DeadLetterAction) -> anyhow::Result<()> {
    let service = trickle.dead_letters()?;

    match action {
        DeadLetterAction::List { limit } => {
            let letters = service.list(limit).await?;

            println!(
                "{:<8} {:<8} {:<12} {:<8} {:<22} {:<10}",
                "ID", "JOB ID", "SUBSCRIBER", "ATTEMPTS", "MOVED", "REQUEUED"
            );
            println!("{}", "-".repeat(72));

            for letter in &letters {
                let requeued = letter
                    .requeued_job_id
                    .map_or_else(|| "-".to_string(), |id| format!("as {id}"));
                println!(
                    "{:<8} {:<8} {:<12} {:<8} {:<22} {:<10}",
                    letter.id.get(),
                    letter.job_id.get(),
                    letter.subscriber_id.get(),
                    letter.attempts,
                    format_timestamp(letter.moved_at),
                    requeued
                );
            }

            println!("\nTotal: {} dead letter(s)", letters.len());
        }
        DeadLetterAction::Show { id } => {
            let letter = service.get(DeadLetterId(id)).await?;

            println!("Dead letter: {}", letter.id);
            println!("Original job: {}", letter.job_id);
            println!("Subscriber: {} <{}>", letter.subscriber_id, letter.recipient);
            println!("Template: {}", letter.template);
            println!("Subject: {}", letter.subject);
            if let Some(content) = letter.content_id {
                println!("Content: {content}");
            }
            println!("Attempts: {}", letter.attempts);
            println!("Created: {}", format_timestamp(letter.created_at));
            println!("Moved: {}", format_timestamp(letter.moved_at));
            if let (Some(at), Some(job)) = (letter.requeued_at, letter.requeued_job_id) {
                println!("Requeued: {} as job {job}", format_timestamp(at));
            }

            if !letter.error_log.is_empty() {
                println!();
                println!("Error History:");
                for (i, line) in letter.error_log.iter().enumerate() {
                    println!("  {}. {line}", i + 1);
                }
            }
        }
        DeadLetterAction::Requeue { id } => {
            let job_id = service.requeue(DeadLetterId(id), Utc::now()).await?;
            println!("Dead letter {id} requeued as job {job_id}");
        }
    }

    Ok(())
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Format duration in human-readable form
fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        let mins = secs / 60;
        let rem_secs = secs % 60;
        format!("{mins}m {rem_secs}s")
    } else if secs < 86400 {
        let hours = secs / 3600;
        let rem_mins = (secs % 3600) / 60;
        format!("{hours}h {rem_mins}m")
    } else {
        let days = secs / 86400;
        let rem_hours = (secs % 86400) / 3600;
        format!("{days}d {rem_hours}h")
    }
}
