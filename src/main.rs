//! brokerpoll - broker classification ingestion
//!
//! # Usage
//!
//! ```bash
//! # Drain the classification topic until it stays empty for 3 polls
//! brokerpoll ingest --max-empty-polls 3 --refresh-views
//!
//! # Replay a JSON-lines dump of classification records onto a topic
//! brokerpoll load --file classifications.jsonl
//!
//! # Promote pending sources from an alert dump
//! brokerpoll reconcile --alerts alerts.jsonl
//!
//! # Show table counts
//! brokerpoll stats
//! ```
//!
//! # Environment Variables
//!
//! - `BROKERPOLL_CONFIG`: Path to the TOML config (default: `./brokerpoll.toml`)
//! - `BROKERPOLL_DATA_DIR`: Overrides `source.data_dir`
//! - `RUST_LOG`: Logging level (default: info)

use anyhow::{Context, Result};
use clap::Parser;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use brokerpoll::config::BrokerpollConfig;
use brokerpoll::decode::{encode_record, Compression};
use brokerpoll::{
    open_database, reconcile, AlertIndex, ClassificationDecoder, ClassificationStore,
    ClassifierRegistry, Ingestor, MessageSource, PollLoop, ProcessLock, SourceTables, TopicLog,
    ViewMaintainer,
};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "brokerpoll")]
#[command(about = "Broker classification ingestion and partitioned storage")]
#[command(version)]
struct CliArgs {
    /// Path to the TOML config file
    #[arg(long, global = true, env = "BROKERPOLL_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory holding the database and lock file
    #[arg(long, global = true, env = "BROKERPOLL_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: SubCommand,
}

#[derive(clap::Subcommand, Debug)]
enum SubCommand {
    /// Consume classification messages until a stop condition fires
    Ingest {
        /// Topic to consume (repeatable; default from config)
        #[arg(long = "topic")]
        topics: Vec<String>,
        /// Consumer group
        #[arg(long)]
        group: Option<String>,
        /// Maximum messages per poll
        #[arg(long)]
        batch_size: Option<usize>,
        /// Poll timeout in seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Stop after this many seconds of wall time
        #[arg(long)]
        stop_after_secs: Option<u64>,
        /// Stop after this many messages
        #[arg(long)]
        max_messages: Option<u64>,
        /// Stop after more than this many consecutive empty polls
        #[arg(long)]
        max_empty_polls: Option<u32>,
        /// Rewind the consumer group to the start of every topic first
        #[arg(long)]
        reset: bool,
        /// Refresh materialized views when the run ends
        #[arg(long)]
        refresh_views: bool,
    },

    /// Append JSON-lines classification records from a file to a topic
    Load {
        #[arg(long)]
        file: PathBuf,
        /// Target topic (default: first configured topic)
        #[arg(long)]
        topic: Option<String>,
        /// Compress payloads with zstd at this level
        #[arg(long)]
        zstd: Option<i32>,
    },

    /// Promote pending sources from a JSON-lines alert file
    Reconcile {
        #[arg(long)]
        alerts: PathBuf,
    },

    /// Recompute the materialized views
    RefreshViews,

    /// Print table counts
    Stats,
}

// ============================================================================
// Runtime
// ============================================================================

/// Everything opened on the shared database. Holding it holds the lock.
struct Runtime {
    _lock: ProcessLock,
    db: sled::Db,
    store: ClassificationStore,
    registry: Arc<ClassifierRegistry>,
    tables: SourceTables,
}

impl Runtime {
    fn open(config: &BrokerpollConfig) -> Result<Self> {
        let data_dir = &config.source.data_dir;
        let lock = ProcessLock::acquire(data_dir)
            .with_context(|| format!("Failed to lock data directory {}", data_dir.display()))?;
        let db = open_database(data_dir).context("Failed to open database")?;
        let store = ClassificationStore::open(&db, &config.store.partition_ids())
            .context("Failed to open classification store")?;
        let registry = Arc::new(ClassifierRegistry::open(&db).context("Failed to open classifier registry")?);
        let tables = SourceTables::open(&db).context("Failed to open source tables")?;

        Ok(Self {
            _lock: lock,
            db,
            store,
            registry,
            tables,
        })
    }

    fn views(&self, config: &BrokerpollConfig) -> Result<ViewMaintainer> {
        let views = ViewMaintainer::open(
            &self.db,
            self.store.clone(),
            self.registry.clone(),
            self.tables.clone(),
        )
        .context("Failed to open views")?;
        Ok(views
            .with_retries(config.views.snapshot_retries)
            .with_lag_days(config.views.forced_source_lag_days))
    }

    fn refresh_views(&self, config: &BrokerpollConfig) -> Result<()> {
        for report in self.views(config)?.refresh_all()? {
            info!(
                view = %report.view,
                rows = report.rows,
                attempts = report.attempts,
                elapsed_ms = report.elapsed.as_millis(),
                "Refreshed view"
            );
        }
        Ok(())
    }
}

fn load_config(args: &CliArgs) -> Result<BrokerpollConfig> {
    let mut config = match &args.config {
        Some(path) => BrokerpollConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => BrokerpollConfig::load(),
    };
    if let Some(dir) = &args.data_dir {
        config.source.data_dir.clone_from(dir);
    }
    Ok(config)
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

// ============================================================================
// Subcommands
// ============================================================================

#[allow(clippy::too_many_arguments, clippy::fn_params_excessive_bools)]
async fn run_ingest(
    mut config: BrokerpollConfig,
    topics: Vec<String>,
    group: Option<String>,
    batch_size: Option<usize>,
    timeout_secs: Option<u64>,
    stop_after_secs: Option<u64>,
    max_messages: Option<u64>,
    max_empty_polls: Option<u32>,
    reset: bool,
    refresh_views: bool,
) -> Result<()> {
    // CLI flags win over the file.
    if !topics.is_empty() {
        config.source.topics = topics;
    }
    if let Some(group) = group {
        config.source.consumer_group = group;
    }
    if let Some(size) = batch_size {
        config.poll.batch_size = size;
    }
    if let Some(secs) = timeout_secs {
        config.poll.poll_timeout_ms = secs.saturating_mul(1000);
    }
    config.poll.stop_after_secs = stop_after_secs.or(config.poll.stop_after_secs);
    config.poll.max_messages = max_messages.or(config.poll.max_messages);
    config.poll.max_empty_polls = max_empty_polls.or(config.poll.max_empty_polls);
    config.validate().context("Invalid configuration")?;

    let runtime = Runtime::open(&config)?;
    let decoder = ClassificationDecoder::from_schema_path(config.source.schema_path.as_deref())
        .context("Failed to load classification schema")?;
    info!(schema = %decoder.schema(), "Schema loaded");

    let log = TopicLog::open(&runtime.db).context("Failed to open topic log")?;
    let mut consumer = log
        .subscribe(&config.source.topics, &config.source.consumer_group)
        .context("Failed to subscribe")?;
    if reset {
        for topic in &config.source.topics {
            consumer.reset_to_start(topic)?;
        }
    }

    let ingestor = Ingestor::new(decoder, runtime.registry.clone(), runtime.store.clone())
        .with_write_attempts(config.store.write_attempts);

    // Graceful shutdown via Ctrl+C
    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received Ctrl+C, stopping after the current batch");
        shutdown_token.cancel();
    });

    let report = PollLoop::new(ingestor, &config.poll, (), cancel_token)
        .run(&mut consumer)
        .await
        .context("Ingestion run failed")?;
    runtime.store.flush().await.context("Failed to flush database")?;

    println!(
        "stopped: {} | consumed {} | stored {} ({} classifications) | skipped {} | dead-lettered {} | {:.1}s",
        report.reason,
        report.progress.consumed,
        report.progress.stored,
        report.progress.classifications,
        report.progress.skipped,
        report.progress.dead_lettered,
        report.elapsed.as_secs_f64()
    );

    if refresh_views || config.views.refresh_after_ingest {
        runtime.refresh_views(&config)?;
    }
    Ok(())
}

fn run_load(
    config: &BrokerpollConfig,
    file: &Path,
    topic: Option<String>,
    zstd: Option<i32>,
) -> Result<()> {
    let topic = topic
        .or_else(|| config.source.topics.first().cloned())
        .context("No topic given and none configured")?;
    let compression = zstd.map_or(Compression::None, Compression::Zstd);

    let runtime = Runtime::open(config)?;
    let log = TopicLog::open(&runtime.db).context("Failed to open topic log")?;
    let decoder = ClassificationDecoder::from_schema_path(config.source.schema_path.as_deref())
        .context("Failed to load classification schema")?;

    let reader = BufReader::new(
        File::open(file).with_context(|| format!("Failed to open {}", file.display()))?,
    );
    let mut published = 0usize;
    let mut rejected = 0usize;
    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read {}", file.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let record = match decoder.decode_payload(line.as_bytes()) {
            Ok(record) => record,
            Err(e) => {
                warn!(line = index + 1, error = %e, "Skipping invalid record");
                rejected += 1;
                continue;
            }
        };
        let payload = encode_record(&record, compression).context("Failed to encode record")?;
        log.publish(&topic, &payload)?;
        published += 1;
    }
    runtime.db.flush().context("Failed to flush database")?;

    println!("published {published} records to '{topic}' ({rejected} rejected)");
    Ok(())
}

fn run_reconcile(config: &BrokerpollConfig, alerts: &Path) -> Result<()> {
    let feed = AlertIndex::from_json_lines(alerts)?;
    let runtime = Runtime::open(config)?;
    let report = reconcile(&runtime.store, &runtime.tables, &feed)?;
    runtime.db.flush().context("Failed to flush database")?;

    println!(
        "promoted {} of {} pending sources ({} new objects, {} forced sources)",
        report.promoted, report.pending_before, report.new_objects, report.forced_sources
    );
    if !report.is_complete() {
        println!("{} sources still pending: {:?}", report.missing.len(), report.missing);
    }
    Ok(())
}

fn run_stats(config: &BrokerpollConfig) -> Result<()> {
    let runtime = Runtime::open(config)?;
    let stats = runtime.store.stats();

    println!("classifiers:        {}", runtime.registry.len());
    for identity in runtime.registry.identities()? {
        let key = &identity.key;
        println!(
            "  {:>6}  {} {} / {} [{}]",
            identity.classifier_id,
            key.broker_name,
            key.broker_version,
            key.classifier_name,
            key.classifier_params
        );
    }
    println!("broker messages:    {}", stats.messages);
    println!("classifications:    {}", stats.classifications);
    for (partition, rows) in &stats.partitions {
        println!("  {:<40} {rows}", partition.to_string());
    }
    println!("pending sources:    {}", stats.pending_sources);
    println!("dead letters:       {}", stats.dead_letters);
    println!("objects:            {}", runtime.tables.object_count());
    println!("sources:            {}", runtime.tables.source_count());
    println!("forced sources:     {}", runtime.tables.forced_count());
    println!("alerts:             {}", runtime.tables.alert_count());

    let views = runtime.views(config)?;
    let snapshot = views.prev_source_counts();
    println!(
        "prevsourcecounts:   {} rows (generation {}, current {})",
        snapshot.len(),
        snapshot.generation,
        runtime.tables.generation()?
    );
    Ok(())
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_json);

    let config = load_config(&args)?;

    match args.command {
        SubCommand::Ingest {
            topics,
            group,
            batch_size,
            timeout_secs,
            stop_after_secs,
            max_messages,
            max_empty_polls,
            reset,
            refresh_views,
        } => {
            run_ingest(
                config,
                topics,
                group,
                batch_size,
                timeout_secs,
                stop_after_secs,
                max_messages,
                max_empty_polls,
                reset,
                refresh_views,
            )
            .await
        }
        SubCommand::Load { file, topic, zstd } => run_load(&config, &file, topic, zstd),
        SubCommand::Reconcile { alerts } => run_reconcile(&config, &alerts),
        SubCommand::RefreshViews => {
            let runtime = Runtime::open(&config)?;
            runtime.refresh_views(&config)
        }
        SubCommand::Stats => run_stats(&config),
    }
}
