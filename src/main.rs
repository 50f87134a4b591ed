//! tracemark CLI
//!
//! Command-line interface for building and querying trace checkpoint
//! indexes:
//! - Generate or import trace files
//! - Build indexes (Ctrl-C cancels)
//! - Seek by rank or timestamp
//! - Inspect index state and checkpoints

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracemark::config::{generate_default_config, Config};
use tracemark::{
    index_path_for, AsyncIndexer, BuildOutcome, BuildTarget, CancelToken, CheckpointIndexer,
    FileTrace, SeekOutcome, TraceRecord, TraceSource, TraceWriter,
};

#[derive(Parser)]
#[command(name = "tracemark")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Checkpoint index for large time-ordered traces")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: standard locations)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Output format (table, json)
    #[arg(short, long, default_value = "table", global = true)]
    pub format: String,

    /// Override the checkpoint interval
    #[arg(long, global = true)]
    pub interval: Option<u64>,

    /// Override the index directory
    #[arg(long, global = true)]
    pub index_dir: Option<PathBuf>,

    /// Keep the index in memory only
    #[arg(long, global = true)]
    pub no_persist: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a synthetic trace
    Generate {
        /// Output trace file
        trace: PathBuf,
        /// Number of events
        #[arg(short = 'n', long, default_value_t = 100_000)]
        count: u64,
        /// First timestamp (default: now, in nanoseconds)
        #[arg(long)]
        start: Option<i64>,
        /// Timestamp increment between events
        #[arg(long, default_value_t = 1_000)]
        step: i64,
    },

    /// Convert `timestamp[,payload]` CSV rows into a trace
    Import {
        /// CSV file
        csv: PathBuf,
        /// Output trace file (appended to if it exists)
        trace: PathBuf,
        /// The CSV has no header row
        #[arg(long)]
        no_headers: bool,
    },

    /// Build (or reuse) the index of a trace
    Build {
        /// Trace file
        trace: PathBuf,
    },

    /// Print events starting at a rank or timestamp
    Seek {
        /// Trace file
        trace: PathBuf,
        /// Target timestamp
        #[arg(short, long, conflicts_with = "rank", required_unless_present = "rank")]
        timestamp: Option<i64>,
        /// Target rank
        #[arg(short, long)]
        rank: Option<u64>,
        /// Number of events to print
        #[arg(short = 'n', long, default_value_t = 10)]
        count: usize,
    },

    /// Show index state
    Info {
        /// Trace file
        trace: PathBuf,
    },

    /// List checkpoints
    Checkpoints {
        /// Trace file
        trace: PathBuf,
        /// Maximum number of checkpoints to print
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };
    if let Some(interval) = cli.interval {
        config.index.interval = interval;
    }
    if let Some(dir) = &cli.index_dir {
        config.index.index_dir = dir.to_string_lossy().to_string();
    }
    if cli.no_persist {
        config.index.persistent = false;
    }

    tracemark::logging::init(&config.logging)?;
    let json = match cli.format.as_str() {
        "json" => true,
        "table" => false,
        other => bail!("unknown output format {:?} (expected table or json)", other),
    };

    match cli.command {
        Commands::Generate {
            trace,
            count,
            start,
            step,
        } => {
            if step < 0 {
                bail!("step must not be negative");
            }
            let start = start
                .or_else(|| chrono::Utc::now().timestamp_nanos_opt())
                .unwrap_or(0);

            let mut writer = TraceWriter::open(&trace)
                .with_context(|| format!("opening {}", trace.display()))?;
            let first = writer.record_count();
            for i in 0..count {
                let timestamp = start + i as i64 * step;
                writer.append(&TraceRecord::new(timestamp, format!("event-{}", first + i)))?;
            }
            writer.sync()?;

            println!("Wrote {} events to {}", count, trace.display());
        }

        Commands::Import {
            csv,
            trace,
            no_headers,
        } => {
            let imported = tracemark::import_csv(&csv, &trace, !no_headers)
                .with_context(|| format!("importing {}", csv.display()))?;
            println!("Imported {} records into {}", imported, trace.display());
        }

        Commands::Build { trace } => {
            let index = AsyncIndexer::new(open_indexer(&config, &trace)?);
            index.indexer().refresh()?;

            let cancel = CancelToken::new();
            let watcher = {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        tracing::info!("Interrupted, stopping build");
                        cancel.cancel();
                    }
                })
            };
            let reporter = {
                let inner = Arc::clone(index.indexer());
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(Duration::from_secs(2));
                    ticker.tick().await;
                    loop {
                        ticker.tick().await;
                        let progress = inner.progress();
                        tracing::info!(
                            "Indexed {} events, {} checkpoints",
                            progress.scanned,
                            progress.checkpoints
                        );
                    }
                })
            };

            let outcome = index.spawn_build(BuildTarget::Unbounded, cancel).await?;
            watcher.abort();
            reporter.abort();
            let outcome = outcome?;

            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                match outcome {
                    BuildOutcome::Complete { events } => println!(
                        "Indexed {} events, {} checkpoints",
                        events,
                        index.indexer().checkpoint_count()
                    ),
                    BuildOutcome::Cancelled { scanned } | BuildOutcome::Reached { scanned } => {
                        println!("Build stopped after {} events", scanned)
                    }
                }
            }
        }

        Commands::Seek {
            trace,
            timestamp,
            rank,
            count,
        } => {
            let index = AsyncIndexer::new(open_indexer(&config, &trace)?);
            index.indexer().refresh()?;

            let outcome = match (timestamp, rank) {
                (Some(t), _) => index.seek(t).await?,
                (None, Some(r)) => index.seek_rank(r).await?,
                (None, None) => bail!("either --timestamp or --rank is required"),
            };

            let cursor = match outcome {
                SeekOutcome::Positioned(cursor) => cursor,
                SeekOutcome::EndOfTrace => {
                    if json {
                        println!("[]");
                    } else {
                        println!("Target lies past the end of the trace");
                    }
                    return Ok(());
                }
            };

            let anchor = cursor.anchor_rank();
            let skipped = cursor.skipped();
            let mut events = Vec::with_capacity(count);
            for item in cursor.take(count) {
                events.push(item?);
            }

            if json {
                let rows: Vec<_> = events
                    .iter()
                    .map(|(rank, record)| {
                        serde_json::json!({
                            "rank": rank,
                            "timestamp": record.timestamp,
                            "payload": String::from_utf8_lossy(&record.payload),
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                println!("{:<12} {:<22} {}", "Rank", "Timestamp", "Payload");
                println!("{}", "-".repeat(60));
                for (rank, record) in &events {
                    println!(
                        "{:<12} {:<22} {}",
                        rank,
                        record.timestamp,
                        preview(&record.payload)
                    );
                }
                println!();
                println!("Anchored at checkpoint rank {}, skipped {} events", anchor, skipped);
            }
        }

        Commands::Info { trace } => {
            let indexer = open_indexer(&config, &trace)?;
            indexer.refresh()?;

            let progress = indexer.progress();
            let signature = indexer.source().signature()?;
            let index_path = config
                .index
                .persistent
                .then(|| index_path_for(&config.index.index_dir(), &trace));

            if json {
                let info = serde_json::json!({
                    "trace": trace,
                    "index": index_path,
                    "interval": indexer.config().interval,
                    "progress": progress,
                    "signature": signature,
                });
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                println!("Trace:       {}", trace.display());
                match &index_path {
                    Some(path) => println!("Index:       {}", path.display()),
                    None => println!("Index:       (in memory)"),
                }
                println!("State:       {}", progress.state);
                match progress.total {
                    Some(total) => println!("Events:      {}", total),
                    None => println!("Events:      unknown (not built)"),
                }
                println!("Checkpoints: {}", progress.checkpoints);
                println!("Interval:    {}", indexer.config().interval);
                if let Some(signature) = signature {
                    println!("Trace size:  {} bytes", signature.len);
                    if let Some(modified) = signature.modified() {
                        println!("Modified:    {}", modified.format("%Y-%m-%d %H:%M:%S UTC"));
                    }
                }
            }
        }

        Commands::Checkpoints { trace, limit } => {
            let indexer = open_indexer(&config, &trace)?;
            indexer.refresh()?;
            indexer.build_index(BuildTarget::Unbounded, &CancelToken::new())?;

            let mut checkpoints = indexer.checkpoints()?;
            if let Some(limit) = limit {
                checkpoints.truncate(limit);
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&checkpoints)?);
            } else {
                println!("{:<8} {:<12} {:<22} {}", "#", "Rank", "Timestamp", "Offset");
                println!("{}", "-".repeat(60));
                for (i, cp) in checkpoints.iter().enumerate() {
                    println!("{:<8} {:<12} {:<22} {}", i, cp.rank, cp.timestamp, cp.location);
                }
            }
        }

        Commands::Config { output } => {
            let content = generate_default_config();
            match output {
                Some(path) => {
                    std::fs::write(&path, content)
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("Config written to {}", path.display());
                }
                None => print!("{}", content),
            }
        }
    }

    Ok(())
}

fn open_indexer(config: &Config, trace_path: &Path) -> anyhow::Result<CheckpointIndexer<FileTrace>> {
    let trace = FileTrace::open(trace_path)
        .with_context(|| format!("opening trace {}", trace_path.display()))?;
    let index_config = config.index.index_config();

    if config.index.persistent {
        let path = index_path_for(&config.index.index_dir(), trace_path);
        tracing::debug!("Index file: {:?}", path);
        Ok(CheckpointIndexer::persistent(trace, &path, index_config)?)
    } else {
        Ok(CheckpointIndexer::new(trace, index_config)?)
    }
}

/// Printable prefix of an event payload
fn preview(payload: &[u8]) -> String {
    const MAX: usize = 40;
    let text = String::from_utf8_lossy(payload);
    if text.chars().count() > MAX {
        format!("{}...", text.chars().take(MAX).collect::<String>())
    } else {
        text.into_owned()
    }
}
