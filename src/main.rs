mod config;
mod data;
mod engine;
mod error;
mod strategies;
mod structure;
mod types;

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use config::BacktestConfig;
use engine::{BacktestEngine, ChannelSink, JsonTradeStore};
use error::BacktestError;

#[derive(Parser)]
#[command(name = "ict-backtester")]
#[command(version = "0.1.0")]
#[command(about = "Deterministic backtester for ICT market-structure strategies", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a backtest described by a TOML run file
    Backtest {
        /// Run configuration file
        #[arg(short, long, default_value = "backtest.toml")]
        config: PathBuf,

        /// Override the configured start date (YYYY-MM-DD HH:MM:SS)
        #[arg(long)]
        start: Option<String>,

        /// Override the configured end date (YYYY-MM-DD HH:MM:SS)
        #[arg(long)]
        end: Option<String>,

        /// Write the full JSON report here
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Parse and validate a run file without simulating
    Check {
        /// Run configuration file
        #[arg(short, long, default_value = "backtest.toml")]
        config: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to initialize logging: {e}");
    }

    let outcome = match cli.command {
        Commands::Backtest {
            config,
            start,
            end,
            report,
        } => run_backtest(config, start, end, report),
        Commands::Check { config } => check_config(config),
    };

    if let Err(e) = outcome {
        error!("{e:#}");
        let code = match e.downcast_ref::<BacktestError>() {
            Some(BacktestError::DetectorInvariant(_)) => 2,
            _ => 1,
        };
        std::process::exit(code);
    }
}

fn run_backtest(
    config_path: PathBuf,
    start: Option<String>,
    end: Option<String>,
    report_path: Option<PathBuf>,
) -> Result<()> {
    let mut config = BacktestConfig::from_file(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    if let Some(start) = start {
        config.start_date = start;
    }
    if let Some(end) = end {
        config.end_date = end;
    }
    config.validate()?;

    info!(
        "backtest: {} on {} from {} to {}",
        config.strategy, config.instrument, config.start_date, config.end_date
    );

    let trade_store = config.trade_store.clone().map(JsonTradeStore::new);
    let publish_to = if config.publish.live {
        config.publish.out_file.clone()
    } else {
        None
    };

    let mut engine = BacktestEngine::from_files(config)?;

    // bundled snapshot consumer: a detached writer thread draining the
    // channel; the simulation never waits on it
    let writer_handle = match publish_to {
        Some(path) => {
            let (sink, receiver) = ChannelSink::bounded(64);
            engine = engine.with_publisher(Box::new(sink));
            let handle = std::thread::spawn(move || -> Result<()> {
                let file = std::fs::File::create(&path)
                    .with_context(|| format!("creating {}", path.display()))?;
                let mut writer = std::io::BufWriter::new(file);
                for payload in receiver.iter() {
                    let line = serde_json::to_string(&payload)?;
                    writeln!(writer, "{line}")?;
                }
                writer.flush()?;
                Ok(())
            });
            Some(handle)
        }
        None => None,
    };

    let report = engine.run()?;
    report.print_summary();

    if let Some(store) = trade_store {
        engine.persist_trades(&store)?;
    }
    if let Some(path) = report_path {
        report.write_json(&path)?;
    }

    if let Some(handle) = writer_handle {
        drop(engine); // closes the snapshot channel so the writer drains out
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("snapshot writer failed: {e:#}"),
            Err(_) => warn!("snapshot writer panicked"),
        }
    }

    Ok(())
}

fn check_config(config_path: PathBuf) -> Result<()> {
    let config = BacktestConfig::from_file(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    info!(
        "{} run on {} parses cleanly ({} to {})",
        config.strategy, config.instrument, config.start_date, config.end_date
    );
    println!("OK");
    Ok(())
}
