// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Row Relay CLI
//!
//! Relays new rows of a SQLite table through a broker queue into a log.
//!
//! # Usage
//!
//! ```bash
//! # Publisher and consumer in one process against a local RabbitMQ
//! rowrelay --source data/source.db --log data/relay_log.csv
//!
//! # Only the publisher, resuming from a watermark checkpoint
//! rowrelay --mode publisher --checkpoint data/watermark.json
//!
//! # Everything in-process, no broker needed
//! rowrelay --broker memory:// --interval-ms 1000
//!
//! # Inspect the log
//! rowrelay --log data/relay_log.csv series value
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use rowrelay::{
    key_options, keyed_series, open_log, series, AckMode, Broker, Config, DurableConsumer,
    LogStore, MemoryBroker, RelayPipeline, RelayPublisher, SqliteSource,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum ServiceMode {
    All,
    Publisher,
    Consumer,
}

#[derive(Parser, Debug)]
#[command(name = "rowrelay")]
#[command(about = "Row Relay - SQLite rows to a broker queue to a schema-union log", long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, env = "ROWRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Service mode: all, publisher, or consumer
    #[arg(long, value_enum, default_value_t = ServiceMode::All)]
    mode: ServiceMode,

    /// Broker URL (amqp://... or memory://)
    #[arg(short, long)]
    broker: Option<String>,

    /// Queue name
    #[arg(short, long)]
    queue: Option<String>,

    /// Source database path (SQLite file)
    #[arg(short, long)]
    source: Option<PathBuf>,

    /// Source table
    #[arg(short, long)]
    table: Option<String>,

    /// Ordering column of the source table
    #[arg(long)]
    key_column: Option<String>,

    /// Poll interval in milliseconds
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Records relayed per tick at most
    #[arg(long)]
    batch_size: Option<usize>,

    /// Watermark checkpoint file
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Log path (.csv, or .db/.sqlite for a SQLite log)
    #[arg(short, long)]
    log: Option<PathBuf>,

    /// Acknowledgement mode: auto or after_append
    #[arg(long)]
    ack_mode: Option<AckMode>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show log statistics
    Stats,
    /// List log columns
    Columns,
    /// Print the (timestamp, value) series of one field
    Series {
        /// Field to plot
        field: String,

        /// Timestamp column (default: from configuration)
        #[arg(long)]
        timestamp_column: Option<String>,
    },
    /// List distinct values of the key column
    Keys {
        #[arg(long, default_value = "key")]
        key_column: String,
    },
    /// Print the numeric series of one key
    Points {
        /// Key to select
        key: String,

        #[arg(long, default_value = "key")]
        key_column: String,

        #[arg(long, default_value = "value")]
        value_column: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    // Handle subcommands
    if let Some(cmd) = args.command {
        return handle_command(cmd, &config);
    }

    tracing::info!("Row Relay starting...");
    tracing::info!("  Mode: {:?}", args.mode);
    tracing::info!("  Broker: {}", config.broker.url);
    tracing::info!("  Queue: {}", config.broker.queue);
    if args.mode != ServiceMode::Consumer {
        tracing::info!(
            "  Source: {} (table {}, ordered by {})",
            config.publisher.source_path.display(),
            config.publisher.table,
            config.publisher.key_column
        );
    }
    if args.mode != ServiceMode::Publisher {
        tracing::info!(
            "  Log: {} (ack {})",
            config.consumer.log_path.display(),
            config.consumer.ack_mode
        );
    }

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown requested, finishing in-flight work");
                shutdown.cancel();
            }
        });
    }

    if config.broker.is_memory() {
        if args.mode != ServiceMode::All {
            tracing::warn!("The memory broker only connects loops inside this process");
        }
        let broker = Arc::new(MemoryBroker::new());
        run_service(args.mode, &config, broker, shutdown).await
    } else {
        run_amqp(args.mode, &config, shutdown).await
    }
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    if let Some(url) = &args.broker {
        config.broker.url = url.clone();
    }
    if let Some(queue) = &args.queue {
        config.broker.queue = queue.clone();
    }
    if let Some(source) = &args.source {
        config.publisher.source_path = source.clone();
    }
    if let Some(table) = &args.table {
        config.publisher.table = table.clone();
    }
    if let Some(column) = &args.key_column {
        config.publisher.key_column = column.clone();
    }
    if let Some(ms) = args.interval_ms {
        config.publisher.interval_ms = ms;
    }
    if let Some(size) = args.batch_size {
        config.publisher.batch_size = size;
    }
    if let Some(path) = &args.checkpoint {
        config.publisher.checkpoint_path = Some(path.clone());
    }
    if let Some(path) = &args.log {
        config.consumer.log_path = path.clone();
    }
    if let Some(mode) = args.ack_mode {
        config.consumer.ack_mode = mode;
    }

    config.validate()?;
    Ok(config)
}

#[cfg(feature = "amqp")]
async fn run_amqp(mode: ServiceMode, config: &Config, shutdown: CancellationToken) -> Result<()> {
    use std::time::Duration;

    const MAX_BACKOFF: Duration = Duration::from_secs(30);

    // The broker may come up after us; keep trying until it does
    let mut backoff = config.consumer.retry_backoff().max(Duration::from_millis(100));
    let broker = loop {
        match rowrelay::AmqpBroker::connect(&config.broker).await {
            Ok(broker) => break broker,
            Err(e) => {
                tracing::warn!(
                    "Broker {} unreachable ({}), retrying in {:?}",
                    config.broker.url,
                    e,
                    backoff
                );
            }
        }
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    };

    run_service(mode, config, Arc::new(broker), shutdown).await
}

#[cfg(not(feature = "amqp"))]
async fn run_amqp(_mode: ServiceMode, config: &Config, _shutdown: CancellationToken) -> Result<()> {
    anyhow::bail!(
        "broker {} needs the `amqp` feature; use memory:// or rebuild with it",
        config.broker.url
    )
}

fn build_source(config: &Config) -> SqliteSource {
    SqliteSource::new(
        &config.publisher.source_path,
        &config.publisher.table,
        &config.publisher.key_column,
    )
}

async fn run_service<B>(
    mode: ServiceMode,
    config: &Config,
    broker: Arc<B>,
    shutdown: CancellationToken,
) -> Result<()>
where
    B: Broker + 'static,
{
    match mode {
        ServiceMode::All => {
            let log = Arc::new(Mutex::new(open_log(&config.consumer)?));
            let pipeline =
                RelayPipeline::connect(config, broker, build_source(config), log).await?;
            let (published, consumed) = pipeline.run(shutdown).await?;
            tracing::info!("Publisher: {:?}", published);
            tracing::info!("Consumer: {:?}", consumed);
        }
        ServiceMode::Publisher => {
            let publisher = RelayPublisher::new(
                config.publisher.clone(),
                config.broker.queue.clone(),
                build_source(config),
                broker,
            );
            let stats = publisher.run(shutdown).await?;
            tracing::info!("Publisher: {:?}", stats);
        }
        ServiceMode::Consumer => {
            let log = Arc::new(Mutex::new(open_log(&config.consumer)?));
            let consumer = DurableConsumer::subscribe(
                broker.as_ref(),
                config.consumer.clone(),
                config.broker.queue.clone(),
                log,
            )
            .await?;
            let stats = consumer.run(shutdown.clone()).await?;
            tracing::info!("Consumer: {:?}", stats);
            if !shutdown.is_cancelled() {
                anyhow::bail!("subscription to '{}' ended", config.broker.queue);
            }
        }
    }

    Ok(())
}

fn handle_command(cmd: Commands, config: &Config) -> Result<()> {
    let log = open_log(&config.consumer)?;

    match cmd {
        Commands::Stats => {
            let columns = log.columns()?;
            println!("Log: {}", log.location());
            println!("  Format: {:?}", config.consumer.resolved_format());
            println!("  Rows: {}", log.row_count()?);
            println!("  Columns: {}", columns.len());
        }
        Commands::Columns => {
            for (idx, column) in log.columns()?.iter().enumerate() {
                println!("  {:>3}  {}", idx, column);
            }
        }
        Commands::Series {
            field,
            timestamp_column,
        } => {
            let ts = timestamp_column.unwrap_or_else(|| config.consumer.timestamp_column.clone());
            let table = log.read_table()?;
            let points = series(&table, &ts, &field);
            println!("{} point(s) for '{}':", points.len(), field);
            for point in &points {
                println!("  {}\t{}", point.timestamp, point.value);
            }
        }
        Commands::Keys { key_column } => {
            let table = log.read_table()?;
            for key in key_options(&table, &key_column) {
                println!("  {}", key);
            }
        }
        Commands::Points {
            key,
            key_column,
            value_column,
        } => {
            let table = log.read_table()?;
            let points = keyed_series(
                &table,
                &config.consumer.timestamp_column,
                &key_column,
                &value_column,
                &key,
            );
            println!("{} point(s) for {}={}:", points.len(), key_column, key);
            for (ts, value) in &points {
                match value {
                    Some(v) => println!("  {}\t{}", ts, v),
                    None => println!("  {}\t-", ts),
                }
            }
        }
    }

    Ok(())
}
