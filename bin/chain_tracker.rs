//! # Chain Tracker
//!
//! Command-line entry point for the MIG chain tracker.
//!
//! ## Usage
//!
//! ```bash
//! # follow new logs (or blocks, picked from the registered handlers)
//! cargo run --bin chain_tracker -- track realtime
//! cargo run --bin chain_tracker -- track realtime blocks --pending-blocks
//!
//! # replay a range, then run the behaviors' finished hooks
//! cargo run --bin chain_tracker -- track historical events --from-block 19000000 --to-block 19010000
//!
//! # describe the built-in behaviors
//! cargo run --bin chain_tracker -- behaviors transfer
//!
//! # import the events of a contract ABI into the signature file
//! cargo run --bin chain_tracker -- data add-abi ./abi/erc20.json
//! ```
//!
//! Configuration is read from `Config.toml` (see `--config`) with `TRACKER_*`
//! environment overrides. Fatal errors exit non-zero.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use mig_chain_tracker::abi::SignatureBook;
use mig_chain_tracker::behavior::{describe_behaviors, list_behaviors};
use mig_chain_tracker::settings::{Settings, DEFAULT_CONFIG_PATH};
use mig_chain_tracker::tracker::{HistoricalMode, RealtimeMode, Tracker};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "chain_tracker", about = "Track EVM chain activity with pluggable behaviors")]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Verbose output (info level unless RUST_LOG is set)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Serve Prometheus metrics on this address (needs the `observability` feature)
    #[arg(long, global = true)]
    metrics_addr: Option<std::net::SocketAddr>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Track chain activity
    Track {
        #[command(subcommand)]
        target: TrackTarget,
    },
    /// List built-in behaviors, or describe those matching TERM
    Behaviors { term: Option<String> },
    /// Manage the event signature file
    Data {
        #[command(subcommand)]
        action: DataAction,
    },
}

#[derive(Subcommand, Debug)]
enum TrackTarget {
    /// Listen to new chain activity
    Realtime {
        #[command(subcommand)]
        mode: Option<RealtimeKind>,
    },
    /// Replay a block range
    Historical {
        #[command(subcommand)]
        mode: Option<HistoricalKind>,
        #[command(flatten)]
        range: RangeArgs,
    },
}

#[derive(Subcommand, Debug)]
enum RealtimeKind {
    /// Subscribe to logs matching the global filter
    Events,
    /// Subscribe to new heads and process full blocks
    Blocks {
        /// Poll the pending block instead of subscribing to new heads
        #[arg(long)]
        pending_blocks: bool,
    },
}

#[derive(Subcommand, Debug)]
enum HistoricalKind {
    /// Query logs in steps of --step-blocks
    Events,
    /// Fetch and process every block
    Blocks,
}

#[derive(Args, Debug)]
struct RangeArgs {
    /// First block (required here or in the config)
    #[arg(long, global = true)]
    from_block: Option<u64>,
    /// Last block, defaults to latest; below --from-block loops backwards
    #[arg(long, global = true)]
    to_block: Option<u64>,
    /// Blocks per log query in events mode
    #[arg(long, global = true)]
    step_blocks: Option<u64>,
    /// Fetch blocks concurrently in batches (ascending only)
    #[arg(long, global = true)]
    batch_fetch_blocks: bool,
    /// Continue with realtime listening once the range is done
    #[arg(long, global = true)]
    continue_realtime: bool,
}

#[derive(Subcommand, Debug)]
enum DataAction {
    /// Add every event of a contract ABI file to the signature file
    AddAbi {
        abi: PathBuf,
        /// Signature file, defaults to the one in the config
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "info" } else { "warn" };

    #[cfg(feature = "observability")]
    {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    }

    #[cfg(not(feature = "observability"))]
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();
}

fn init_metrics(addr: Option<std::net::SocketAddr>) -> Result<()> {
    let Some(addr) = addr else {
        return Ok(());
    };
    #[cfg(feature = "observability")]
    {
        mig_chain_tracker::metrics::init_prometheus_exporter(addr)?;
        log::info!("Serving metrics on {}", addr);
    }
    #[cfg(not(feature = "observability"))]
    log::warn!(
        "--metrics-addr {} ignored, built without the observability feature",
        addr
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Behaviors { term } => {
            match term {
                None => print!("{}", list_behaviors()),
                Some(term) => match describe_behaviors(&term) {
                    Some(text) => print!("{}", text),
                    None => println!("No behavior matches '{}'", term),
                },
            }
            Ok(())
        }
        Command::Data {
            action: DataAction::AddAbi { abi, output },
        } => {
            let output = match output {
                Some(path) => path,
                None => PathBuf::from(Settings::load(&cli.config)?.abi.event_signatures_path),
            };
            let raw = std::fs::read_to_string(&abi)
                .with_context(|| format!("Failed to read ABI file {}", abi.display()))?;
            let mut book = SignatureBook::load(&output)?;
            let added = book.add_contract_abi(&raw)?;
            book.save(&output)?;
            println!(
                "{} {} new event signatures ({} total) in {}",
                "Added".green(),
                added,
                book.len(),
                output.display()
            );
            Ok(())
        }
        Command::Track { target } => {
            init_metrics(cli.metrics_addr)?;
            let mut settings = Settings::load(&cli.config)
                .with_context(|| format!("Failed to load {}", cli.config.display()))?;

            match target {
                TrackTarget::Realtime { mode } => {
                    let mode = match mode {
                        None => RealtimeMode::Auto,
                        Some(RealtimeKind::Events) => RealtimeMode::Events,
                        Some(RealtimeKind::Blocks { pending_blocks: true }) => RealtimeMode::PendingBlocks,
                        Some(RealtimeKind::Blocks { pending_blocks: false }) => RealtimeMode::Blocks,
                    };
                    let mut tracker = Tracker::connect(settings).await?;
                    tracker.run_realtime(mode).await
                }
                TrackTarget::Historical { mode, range } => {
                    let historical = &mut settings.historical;
                    if range.from_block.is_some() {
                        historical.from_block = range.from_block;
                    }
                    if range.to_block.is_some() {
                        historical.to_block = range.to_block;
                    }
                    if let Some(step) = range.step_blocks {
                        historical.step_blocks = step;
                    }
                    historical.batch_fetch_blocks |= range.batch_fetch_blocks;
                    historical.continue_to_realtime |= range.continue_realtime;

                    let mode = match mode {
                        None => HistoricalMode::Auto,
                        Some(HistoricalKind::Events) => HistoricalMode::Events,
                        Some(HistoricalKind::Blocks) => HistoricalMode::Blocks,
                    };
                    let mut tracker = Tracker::connect(settings).await?;
                    let report = tracker.run_historical(mode).await?;
                    println!(
                        "{} {} blocks, {} logs, {} log queries",
                        "Done:".green().bold(),
                        report.blocks,
                        report.logs,
                        report.queries
                    );
                    Ok(())
                }
            }
        }
    }
}
