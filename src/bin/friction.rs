#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use friction_engine::cache::SqliteEvaluationCache;
use friction_engine::compare::{self, MatchBasis};
use friction_engine::config::EngineConfig;
use friction_engine::event::DecisionEvent;
use friction_engine::oracle::{CacheOnlyOracle, CachedOracle};
use friction_engine::pipeline;
use friction_engine::profile::{self, FirmwareProfile};
use friction_engine::sink;
use friction_engine::synthetic;

#[derive(Parser)]
#[command(name = "friction", version, about = "Firmware and friction measurement CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a synthetic decision-event stream as JSONL
    Synth {
        #[arg(long, default_value = "small_untimed")]
        case: String,
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        actors: Option<usize>,
        #[arg(long)]
        events_per_actor: Option<usize>,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// List the built-in synthetic cases
    Cases,
    /// Run the batch pipeline over a JSONL event file
    Analyze {
        #[arg(long)]
        events: PathBuf,
        #[arg(long)]
        out_dir: PathBuf,
        /// JSON configuration; missing fields use defaults
        #[arg(long)]
        config: Option<PathBuf>,
        /// Fill missing outcomes from this evaluation cache
        #[arg(long)]
        cache: Option<PathBuf>,
        #[arg(long, default_value = "reference")]
        oracle_id: String,
    },
    /// Compare two actors' firmware profiles for one period
    Compare {
        #[arg(long)]
        profiles: PathBuf,
        #[arg(long)]
        actor_a: String,
        #[arg(long)]
        actor_b: String,
        #[arg(long)]
        period: usize,
        #[arg(long)]
        config: Option<PathBuf>,
        /// Lower edge of the shared skill band
        #[arg(long, conflicts_with = "age")]
        skill_band: Option<f64>,
        /// Shared age in years
        #[arg(long)]
        age: Option<u32>,
    },
    /// Export the evaluation cache to JSONL
    CacheExport {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        out: PathBuf,
    },
    /// Prune the evaluation cache (by age and/or size)
    CachePrune {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        max_age_days: Option<u64>,
        #[arg(long)]
        max_rows: Option<usize>,
    },
}

fn load_config(path: Option<PathBuf>) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    Ok(match path {
        Some(p) => EngineConfig::load(p)?,
        None => EngineConfig::default(),
    })
}

fn pick_profile<'a>(
    profiles: &'a [FirmwareProfile],
    actor: &str,
    period: usize,
) -> Result<&'a FirmwareProfile, Box<dyn std::error::Error>> {
    profile::latest_profile(profiles, actor, period)
        .ok_or_else(|| format!("no profile for actor {actor} in period {period}").into())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Synth {
            case,
            out,
            actors,
            events_per_actor,
            seed,
        } => {
            let mut case = synthetic::find_case(&case).ok_or_else(|| format!("unknown case: {case}"))?;
            if let Some(n) = actors {
                case.actors = n;
            }
            if let Some(n) = events_per_actor {
                case.events_per_actor = n;
            }
            if let Some(s) = seed {
                case.seed = s;
            }
            let events = synthetic::generate(&case);
            let written = sink::write_all(out, events)?;
            println!("wrote {written} events");
        }
        Commands::Cases => {
            for case in synthetic::synthetic_cases() {
                println!("{}", case.name);
            }
        }
        Commands::Analyze {
            events,
            out_dir,
            config,
            cache,
            oracle_id,
        } => {
            let cfg = load_config(config)?;
            let events: Vec<DecisionEvent> = sink::read_jsonl(events)?;
            let output = match cache {
                Some(db) => {
                    let cache = SqliteEvaluationCache::new(db)?;
                    let oracle = CachedOracle::new(
                        Arc::new(CacheOnlyOracle::new(oracle_id)),
                        Arc::new(cache),
                        Duration::from_millis(cfg.oracle_timeout_ms),
                    );
                    let (output, resolution) = pipeline::run_batch_with_oracle(events, &oracle, &cfg).await?;
                    println!(
                        "resolved {} of {} missing outcomes",
                        resolution.resolved, resolution.requested
                    );
                    output
                }
                None => pipeline::run_batch(events, &cfg)?,
            };
            let counts = pipeline::write_artifacts(&output, &out_dir)?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
        }
        Commands::Compare {
            profiles,
            actor_a,
            actor_b,
            period,
            config,
            skill_band,
            age,
        } => {
            let cfg = load_config(config)?;
            let profiles: Vec<FirmwareProfile> = sink::read_jsonl(profiles)?;
            let a = pick_profile(&profiles, &actor_a, period)?;
            let b = pick_profile(&profiles, &actor_b, period)?;
            let basis = match (skill_band, age) {
                (_, Some(years)) => MatchBasis::Age { years },
                (Some(lower), None) => MatchBasis::SkillBand { lower },
                (None, None) => return Err("compare requires --skill-band or --age".into()),
            };
            let comparison = compare::compare(a, b, basis, &cfg)?;
            println!("{}", serde_json::to_string_pretty(&comparison)?);
        }
        Commands::CacheExport { db, out } => {
            let path = db.unwrap_or_else(SqliteEvaluationCache::default_path);
            let cache = SqliteEvaluationCache::new(path)?;
            let rows = cache.export_jsonl(out).await?;
            println!("exported {rows} rows");
        }
        Commands::CachePrune {
            db,
            max_age_days,
            max_rows,
        } => {
            if max_age_days.is_none() && max_rows.is_none() {
                return Err("cache-prune requires --max-age-days and/or --max-rows".into());
            }
            if matches!(max_rows, Some(0)) {
                return Err("--max-rows must be >= 1".into());
            }
            let path = db.unwrap_or_else(SqliteEvaluationCache::default_path);
            let cache = SqliteEvaluationCache::new(path)?;
            let _lock = cache.lock_exclusive()?;
            let stats = cache.prune(max_age_days, max_rows).await?;
            println!(
                "pruned {} rows; {} rows remain",
                stats.deleted, stats.remaining
            );
        }
    }

    Ok(())
}
