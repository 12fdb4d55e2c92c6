use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use tutor_cadence::clock::{Clock, SystemClock};
use tutor_cadence::deficit::{focus_score, rank_by_focus};
use tutor_cadence::import::import_csv;
use tutor_cadence::models::RawLessonObservation;
use tutor_cadence::ports::{OutboxNotifier, SpecOnlyImageRenderer};
use tutor_cadence::store::{PgStore, Store};
use tutor_cadence::{CadenceConfig, Pipeline};

#[derive(Parser)]
#[command(name = "tutor-cadence")]
#[command(
    about = "Parent follow-up messages and deficit tracking for tutoring lessons",
    long_about = None
)]
struct Cli {
    /// Config file (defaults to tutor-cadence.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Directory rendered messages are written to for the tutor to share
    #[arg(long, global = true, default_value = "outbox")]
    outbox: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load tutors and students for a demo run
    Seed,
    /// Import lessons from a CSV export
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Ingest lessons from a JSON file (one object or an array)
    Ingest {
        #[arg(long)]
        json: PathBuf,
    },
    /// Dispatch every job that is due now
    Sweep,
    /// Sweep periodically until interrupted
    Serve,
    /// Opt a student out and cancel their unsent messages
    Cancel {
        #[arg(long)]
        student: String,
    },
    /// Mark a deficit pattern as resolved
    Resolve {
        #[arg(long)]
        student: String,
        #[arg(long)]
        topic: String,
    },
    /// Reopen a resolved deficit pattern
    Reopen {
        #[arg(long)]
        student: String,
        #[arg(long)]
        topic: String,
    },
    /// List open deficit patterns by focus score
    Deficits {
        #[arg(long)]
        student: Option<String>,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// List message jobs
    Jobs {
        #[arg(long)]
        student: Option<String>,
    },
    /// Show one job with its rendered message
    Show {
        #[arg(long)]
        id: Uuid,
    },
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("tutor_cadence=info,warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = CadenceConfig::load(cli.config.as_deref()).context("failed to load config")?;

    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a production Postgres instance")?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;
    let store = Arc::new(PgStore::new(pool));

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let pipeline = Pipeline::new(
        &config,
        store.clone(),
        store.clone(),
        Arc::new(SpecOnlyImageRenderer),
        Arc::new(OutboxNotifier::new(&cli.outbox, clock.clone())),
        clock,
    )
    .context("invalid configuration")?;

    match cli.command {
        Commands::InitDb => {
            store.init_db().await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            store.seed().await?;
            println!("Seed data inserted.");
        }
        Commands::Import { csv } => {
            let file = std::fs::File::open(&csv)
                .with_context(|| format!("failed to open {}", csv.display()))?;
            let summary = import_csv(&pipeline, file).await?;
            println!(
                "Ingested {} lessons from {} ({} rejected).",
                summary.ingested,
                csv.display(),
                summary.rejected
            );
        }
        Commands::Ingest { json } => {
            let content = std::fs::read_to_string(&json)
                .with_context(|| format!("failed to read {}", json.display()))?;
            let lessons: Vec<RawLessonObservation> = match serde_json::from_str(&content) {
                Ok(many) => many,
                Err(_) => vec![serde_json::from_str(&content).with_context(|| {
                    format!("{} is not a lesson or lesson list", json.display())
                })?],
            };
            for raw in lessons {
                let outcome = pipeline.ingest_lesson(raw).await?;
                println!(
                    "Lesson {} for {}: {} deficit updates, {} jobs.",
                    outcome.lesson.lesson_id,
                    outcome.lesson.student_id,
                    outcome.deficit_updates.len(),
                    outcome.scheduled_jobs.len()
                );
            }
        }
        Commands::Sweep => {
            let outcome = pipeline.sweep(pipeline.now()).await?;
            println!(
                "Dispatched {}, failed {}, cancelled {}.",
                outcome.dispatched.len(),
                outcome.failed.len(),
                outcome.cancelled.len()
            );
            for job in &outcome.failed {
                println!(
                    "- {} attempt {}: {}",
                    job.key,
                    job.attempts,
                    job.last_error.as_deref().unwrap_or("unknown error")
                );
            }
        }
        Commands::Serve => {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(config.sweep_interval_secs.max(1)));
            tracing::info!(interval_secs = config.sweep_interval_secs, "sweeper started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = pipeline.sweep(pipeline.now()).await {
                            tracing::error!(error = %err, "sweep failed");
                        }
                        if let Err(err) = pipeline.apply_decay().await {
                            tracing::error!(error = %err, "deficit decay failed");
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("shutting down sweeper");
                        break;
                    }
                }
            }
        }
        Commands::Cancel { student } => {
            if !store.set_opted_out(&student, true).await? {
                anyhow::bail!("unknown student {student}");
            }
            let cancelled = pipeline.cancel_student(&student).await?;
            println!("Cancelled {} jobs for {student}.", cancelled.len());
        }
        Commands::Resolve { student, topic } => {
            let pattern = pipeline.resolve_deficit(&student, &topic).await?;
            println!("Resolved {} for {}.", pattern.topic, pattern.student_id);
        }
        Commands::Reopen { student, topic } => {
            let pattern = pipeline.reopen_deficit(&student, &topic).await?;
            println!(
                "Reopened {} for {} ({} occurrences).",
                pattern.topic, pattern.student_id, pattern.occurrence_count
            );
        }
        Commands::Deficits { student, limit } => {
            let now = pipeline.now();
            let mut patterns: Vec<_> = store
                .deficits(student.as_deref())
                .await?
                .into_iter()
                .filter(|p| !p.resolved)
                .collect();
            if patterns.is_empty() {
                println!("No open deficit patterns.");
                return Ok(());
            }
            rank_by_focus(&mut patterns, now);

            println!("Open deficit patterns by focus score:");
            for pattern in patterns.iter().take(limit) {
                println!(
                    "- {} / {} score {:.2} across {} lessons: {}",
                    pattern.student_id,
                    pattern.topic,
                    focus_score(pattern, now),
                    pattern.occurrence_count,
                    pattern.suggested_action
                );
            }
        }
        Commands::Jobs { student } => {
            let jobs = store.jobs(student.as_deref()).await?;
            if jobs.is_empty() {
                println!("No message jobs.");
                return Ok(());
            }
            for job in jobs {
                println!(
                    "- {} {} scheduled {} attempts {}{}",
                    job.key,
                    job.status,
                    job.scheduled_for.format("%Y-%m-%d %H:%M UTC"),
                    job.attempts,
                    job.last_error
                        .map(|e| format!(" ({e})"))
                        .unwrap_or_default()
                );
            }
        }
        Commands::Show { id } => {
            let job = store
                .job_by_id(id)
                .await?
                .with_context(|| format!("no message job with id {id}"))?;
            println!("{} ({}, {} attempts)", job.key, job.status, job.attempts);
            match job.payload {
                Some(content) => {
                    println!();
                    println!("{}", content.title);
                    println!("{}", content.body);
                }
                None => println!("Not rendered yet."),
            }
        }
    }

    Ok(())
}
