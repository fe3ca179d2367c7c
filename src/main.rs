//! Ring Archiver
//!
//! Command line front end: archive local files into a container, pull a
//! single entry out of a stored container, or print the state of every
//! storage system group.

use anyhow::Context;
use clap::{Parser, Subcommand};
use prometheus::{Encoder, Registry, TextEncoder};
use std::path::PathBuf;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ring_archiver::{
    ArchiveConfig, ArchiveEntry, ArchiveEvent, Archiver, ArchiverContext, ArchiverMetrics, Error,
    Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Ring Archiver - failover-aware archival into ZIP/TAR containers
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (.yaml, .yml or .json)
    #[arg(long, short, env = "ARCHIVER_CONFIG", default_value = "archiver.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Print Prometheus metrics to stderr before exiting
    #[arg(long)]
    metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build a container from local files and wait for the outcome
    Archive {
        /// Target storage system group
        #[arg(long, short)]
        group: String,

        /// Container object name
        #[arg(long)]
        container: String,

        /// Files to archive, as `PATH` or `NAME=PATH`
        #[arg(required = true)]
        files: Vec<String>,
    },

    /// Materialize one entry of a stored container into the cache
    Extract {
        /// Storage system holding the container
        #[arg(long, short)]
        system: String,

        /// Container object name
        #[arg(long)]
        container: String,

        /// Entry name inside the container
        #[arg(long, short)]
        entry: String,
    },

    /// Print the state of every storage system group as JSON
    Status,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!(
        version = ring_archiver::VERSION,
        config = %args.config.display(),
        "Starting Ring Archiver"
    );

    let config = ArchiveConfig::load(&args.config)
        .with_context(|| format!("loading configuration {}", args.config.display()))?;
    let registry = Registry::new();
    let metrics = ArchiverMetrics::new()?;
    metrics.register(&registry)?;

    let archiver =
        Archiver::from_config(&config, metrics).context("initializing storage groups")?;

    let result = match args.command {
        Command::Archive {
            group,
            container,
            files,
        } => archive(&archiver, group, container, files).await,
        Command::Extract {
            system,
            container,
            entry,
        } => extract(&archiver, system, container, entry).await,
        Command::Status => status(&archiver),
    };

    archiver.shutdown().await;
    if args.metrics {
        dump_metrics(&registry)?;
    }
    if let Err(e) = &result {
        error!(error = %e, "Command failed");
    }
    Ok(result?)
}

// =============================================================================
// Commands
// =============================================================================

async fn archive(
    archiver: &Archiver,
    group: String,
    container: String,
    files: Vec<String>,
) -> Result<()> {
    let entries = files
        .iter()
        .map(|arg| parse_entry(arg))
        .collect::<Result<Vec<_>>>()?;

    let mut events = archiver.subscribe();
    archiver
        .submit(ArchiverContext::new(group, container.clone(), entries))
        .await?;

    loop {
        let event = events
            .recv()
            .await
            .map_err(|e| Error::Internal(format!("event stream closed: {}", e)))?;
        if event.container() != container {
            continue;
        }
        println!("{}", serde_json::to_string_pretty(&event)?);
        return match event {
            ArchiveEvent::Stored { .. } => Ok(()),
            ArchiveEvent::Failed { error, .. } => Err(Error::Internal(format!(
                "archival of {} failed: {}",
                container, error
            ))),
        };
    }
}

async fn extract(
    archiver: &Archiver,
    system: String,
    container: String,
    entry: String,
) -> Result<()> {
    let extraction = archiver.extraction().clone();
    let path = tokio::task::spawn_blocking(move || {
        extraction.request_entry(&system, &container, &entry)
    })
    .await
    .map_err(|e| Error::Internal(format!("extraction aborted: {}", e)))??;
    println!("{}", path.display());
    Ok(())
}

fn status(archiver: &Archiver) -> Result<()> {
    let groups: Vec<_> = archiver
        .groups()
        .snapshots()
        .iter()
        .map(|g| g.as_ref().clone())
        .collect();
    println!("{}", serde_json::to_string_pretty(&groups)?);
    Ok(())
}

/// `NAME=PATH`, or a bare path named after its file name
fn parse_entry(arg: &str) -> Result<ArchiveEntry> {
    if let Some((name, path)) = arg.split_once('=') {
        return Ok(ArchiveEntry::from_path(name, path));
    }
    let path = PathBuf::from(arg);
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::InvalidName {
            name: arg.to_string(),
        })?
        .to_string();
    Ok(ArchiveEntry::from_path(name, path))
}

fn dump_metrics(registry: &Registry) -> Result<()> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&registry.gather(), &mut buffer)?;
    eprint!("{}", String::from_utf8_lossy(&buffer));
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // Logs go to stderr, command output to stdout
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
