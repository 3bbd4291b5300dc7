use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use humansize::{format_size, BINARY};
use ingest::{
    config::IngestConfig,
    pipeline::Pipeline,
    schedule::run_scheduled,
    state::{JsonStateStore, StateStore},
};
use log::{error, info, warn, LevelFilter};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// HLS ingest daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Run a pass now and then every scan interval (default)
    Run,
    /// Run a single pass and exit
    Once,
    /// Print the persisted unit usage and exit
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins unless --verbose asks for debug output
    let mut logger = env_logger::Builder::from_default_env();
    logger.format_timestamp_secs();
    if args.verbose {
        logger.filter_level(LevelFilter::Debug);
    } else if std::env::var_os("RUST_LOG").is_none() {
        logger.filter_level(LevelFilter::Info);
    }
    logger.init();

    let cfg = IngestConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;

    match args.command.unwrap_or(Command::Run) {
        Command::Status => print_status(&cfg),
        Command::Once => {
            log_config(&cfg);
            let pipeline = Pipeline::from_config(cfg).context("Failed to set up pipeline")?;
            let report = pipeline.run_pass().await.context("Pass failed")?;
            info!(
                "Pass done: {} discovered, {} completed, {} failed, {} skipped",
                report.discovered, report.completed, report.failed, report.skipped
            );
            if report.failed > 0 {
                anyhow::bail!("{} job(s) failed", report.failed);
            }
            Ok(())
        }
        Command::Run => {
            log_config(&cfg);
            let every = Duration::from_secs(cfg.scan_interval_secs.max(1));
            let pipeline = Arc::new(Pipeline::from_config(cfg).context("Failed to set up pipeline")?);

            info!("HLS ingest daemon starting, passes every {}s", every.as_secs());
            tokio::select! {
                _ = run_scheduled(pipeline, every) => {}
                res = tokio::signal::ctrl_c() => {
                    if let Err(e) = res {
                        error!("Failed to listen for shutdown signal: {}", e);
                    }
                    info!("Shutdown requested, exiting");
                }
            }
            Ok(())
        }
    }
}

fn log_config(cfg: &IngestConfig) {
    info!("Configuration loaded:");
    info!("  Staging dir: {}", cfg.staging_dir.display());
    info!("  Work dir: {}", cfg.work_dir.display());
    info!("  State file: {}", cfg.state_file.display());
    info!("  Capacity ceiling: {}", format_size(cfg.capacity_ceiling_bytes, BINARY));
    info!("  Unit owner: {}", cfg.git.owner);

    if !cfg.staging_dir.exists() {
        warn!("Staging dir does not exist: {}", cfg.staging_dir.display());
    }
    if cfg.git.token.is_none() {
        warn!("No GITHUB_TOKEN set, new units cannot be created");
    }
    if cfg.telegram.is_none() {
        info!("Notifications disabled (TELEGRAM_TOKEN / TELEGRAM_CHAT_ID not set)");
    }
}

fn print_status(cfg: &IngestConfig) -> Result<()> {
    let store = JsonStateStore::new(cfg.state_file.clone(), cfg.initial_unit_id());
    let state = store.load().context("Failed to load state")?;

    println!("State file: {}", store.path().display());
    println!("Current unit: {}", state.current_unit_id);
    println!("Next ordinal: {}", state.next_unit_ordinal);
    println!();
    println!("{:<20} {:>12} {:>8} {:>7}", "UNIT", "USED", "FILES", "FULL");
    for (id, unit) in &state.units {
        let pct = unit.used_bytes as f64 * 100.0 / cfg.capacity_ceiling_bytes.max(1) as f64;
        let marker = if *id == state.current_unit_id { " *" } else { "" };
        println!(
            "{:<20} {:>12} {:>8} {:>6.1}%{}",
            id,
            format_size(unit.used_bytes, BINARY),
            unit.file_count,
            pct,
            marker
        );
    }
    println!();
    println!("Total files: {}", state.total_files());

    for violation in state.check_invariants(cfg.capacity_ceiling_bytes, &cfg.unit_prefix) {
        println!("warning: {}", violation);
    }
    Ok(())
}
