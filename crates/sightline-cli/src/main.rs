use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use sightline_core::{
    Collaborators, EmbeddingStore, IdentityId, IdentityMatcher, JpegSnapshotEncoder,
    RecognitionPipeline, VisitCooldownTracker,
};
use sightline_store::Database;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod replay;

use config::Config;

#[derive(Parser)]
#[command(name = "sightline", about = "Sightline face identity and visit log")]
struct Cli {
    /// TOML config file; SIGHTLINE_* environment variables take precedence
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run recorded detections through the recognition pipeline
    Replay {
        /// JSON-lines replay log
        file: PathBuf,
        /// Wall-clock time of the first frame (RFC 3339); defaults to now
        #[arg(long)]
        start: Option<DateTime<Utc>>,
    },
    /// List known identities, most recently seen first
    People,
    /// Set or clear an identity's display name
    Rename {
        /// Identity ID
        id: String,
        /// New name; omit to clear
        name: Option<String>,
    },
    /// Show logged visits, most recent first
    Visits {
        /// Only visits of this identity
        #[arg(long)]
        person: Option<String>,
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries command output; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Replay { file, start } => run_replay(&config, &file, start).await,
        Commands::People => people(&config),
        Commands::Rename { id, name } => rename(&config, &id, name.as_deref()),
        Commands::Visits { person, limit } => visits(&config, person.as_deref(), limit),
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn open_db(config: &Config) -> Result<Database> {
    Database::open(&config.db_path)
        .with_context(|| format!("opening database {}", config.db_path.display()))
}

fn parse_id(raw: &str) -> Result<IdentityId> {
    raw.parse()
        .with_context(|| format!("{raw:?} is not a valid identity id"))
}

async fn run_replay(config: &Config, file: &std::path::Path, start: Option<DateTime<Utc>>) -> Result<()> {
    let frames = replay::load(file)?;
    let total = frames.len();
    let db = Arc::new(open_db(config)?);

    let store = EmbeddingStore::from_source(&*db).context("loading known identities")?;
    tracing::info!(known = store.len(), frames = total, "replay starting");

    let (source, detector) = replay::split(frames, start.unwrap_or_else(Utc::now))?;
    let pipeline = Arc::new(RecognitionPipeline::new(
        IdentityMatcher::new(store, config.similarity_threshold),
        VisitCooldownTracker::new(config.cooldown()),
        Collaborators {
            detector,
            registrar: db.clone(),
            visits: db,
            encoder: Arc::new(JpegSnapshotEncoder::new(config.snapshot_quality)),
        },
    ));

    let (engine, mut reports) =
        engine::spawn_engine(pipeline, Box::new(source), config.poll_interval())?;

    let mut seen = 0;
    while seen < total {
        tokio::select! {
            report = reports.recv() => {
                let Some(report) = report else { break };
                println!("{}", serde_json::to_string(&report)?);
                seen += 1;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted; stopping after the current frame");
                break;
            }
        }
    }

    drop(reports);
    let stats = tokio::task::spawn_blocking(move || engine.stop()).await??;
    tracing::info!(frames = stats.frames, "replay finished");
    Ok(())
}

fn people(config: &Config) -> Result<()> {
    let db = open_db(config)?;
    let identities = db.list_identities()?;
    if identities.is_empty() {
        println!("No identities registered");
        return Ok(());
    }
    for identity in identities {
        println!(
            "{}  {:<20}  visits={:<5}  last_seen={}",
            identity.id,
            identity.name.as_deref().unwrap_or("-"),
            identity.visit_count,
            identity.last_seen.to_rfc3339(),
        );
    }
    Ok(())
}

fn rename(config: &Config, id: &str, name: Option<&str>) -> Result<()> {
    let id = parse_id(id)?;
    let db = open_db(config)?;
    if !db.rename_identity(id, name)? {
        bail!("no identity with id {id}");
    }
    match name.map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) => println!("{id} is now {name:?}"),
        None => println!("{id} name cleared"),
    }
    Ok(())
}

fn visits(config: &Config, person: Option<&str>, limit: usize) -> Result<()> {
    let person = person.map(parse_id).transpose()?;
    let db = open_db(config)?;
    for visit in db.recent_visits(limit, person)? {
        let snapshot = match visit.snapshot_len() {
            Some(len) => format!("{len} bytes"),
            None => "none".to_string(),
        };
        println!(
            "#{:<6} {}  {}  snapshot={}",
            visit.id,
            visit.timestamp.to_rfc3339(),
            visit.identity,
            snapshot,
        );
    }
    Ok(())
}
