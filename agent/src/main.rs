//! vanity-fleet - Command Line Interface
//!
//! Runs the vanity-key mining binary once on every accelerator of this host
//! and prints the aggregated outcome.
//!
//! ## Commands
//!
//! - `run` - One dispatch round across all devices
//! - `devices` - Show the enumerated device inventory
//! - `status` - Show host capabilities and configuration
//! - `init-config` - Write a default configuration file
//!
//! ## Exit status
//!
//! `run` exits 0 unless at least one device's binary could not be launched.
//! A binary that runs and exits nonzero is a normal, reported outcome.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fleet_agent::observability::default_log_dir;
use fleet_agent::{
    init_production_logging, init_simple_logging, Dispatcher, FleetConfig, HostCapabilities,
    RuntimeContext, Summary,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Fan a mining binary out across every GPU on this host
#[derive(Parser, Debug)]
#[command(name = "vanity-fleet")]
#[command(about = "Distributed vanity-key mining across local accelerators", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (default: ~/.vanity-fleet/fleet.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one dispatch round on every device
    Run {
        /// Path to the mining binary
        #[arg(short, long)]
        binary: Option<PathBuf>,

        /// Iterations per device
        #[arg(short = 'n', long)]
        iterations: Option<u64>,

        /// Per-device timeout in seconds
        #[arg(short, long)]
        timeout_secs: Option<u64>,

        /// Print only the JSON summary
        #[arg(long)]
        json: bool,

        /// Log level (trace, debug, info, warn, error)
        #[arg(short, long)]
        log_level: Option<String>,
    },

    /// Show the device inventory
    Devices,

    /// Show host capabilities and configuration
    Status,

    /// Write a default configuration file
    InitConfig {
        /// Destination (default: ~/.vanity-fleet/fleet.toml)
        #[arg(short, long)]
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => FleetConfig::default_path()?,
    };

    match cli.command {
        Commands::Run {
            binary,
            iterations,
            timeout_secs,
            json,
            log_level,
        } => {
            let mut config = FleetConfig::load_or_default(&config_path)
                .with_context(|| format!("Failed to load {}", config_path.display()))?;

            if let Some(binary) = binary {
                config.miner.binary_path = binary;
            }
            if let Some(iterations) = iterations {
                config.miner.iterations = iterations;
            }
            if timeout_secs.is_some() {
                config.miner.timeout_secs = timeout_secs;
            }
            if let Some(level) = log_level {
                config.logging.level = level;
            }

            if config.logging.log_to_file {
                init_production_logging(&config.logging.level, config.logging.log_dir.clone())?;
            } else {
                init_simple_logging(&config.logging.level)?;
            }

            cmd_run(config, json).await
        }

        Commands::Devices => {
            let config = FleetConfig::load_or_default(&config_path)?;
            init_simple_logging(&config.logging.level)?;
            cmd_devices(config).await?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Status => {
            // No logging for status (pure display)
            cmd_status(config_path)?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::InitConfig { path, force } => {
            init_simple_logging("info")?;
            cmd_init_config(path.unwrap_or(config_path), force)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// One dispatch round; Ctrl+C cancels it and still prints the partial summary
async fn cmd_run(config: FleetConfig, json: bool) -> Result<ExitCode> {
    let context =
        RuntimeContext::init(&config).context("Failed to initialize runtime context")?;
    let mut dispatcher = Dispatcher::new(context, config.worker_settings());

    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                warn!("Received shutdown signal (Ctrl+C), cancelling dispatch");
                cancel.cancel();
            }
        })
    };

    let outcome = dispatcher
        .dispatch_with_cancel(config.miner.iterations, config.timeout(), cancel)
        .await;

    ctrl_c.abort();
    dispatcher.shutdown();

    let summary = outcome.context("Dispatch failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }

    let launch_failures = summary.launch_failures();
    if launch_failures > 0 {
        warn!(launch_failures, "Mining binary could not be launched on some devices");
        return Ok(ExitCode::FAILURE);
    }

    Ok(ExitCode::SUCCESS)
}

fn print_summary(summary: &Summary) {
    for result in summary.successful() {
        println!("GPU {} output:", result.device_id);
        println!("{}", result.output);
    }

    println!("Dispatch {}", summary.dispatch_id);
    if summary.degraded {
        println!("   ⚠ No GPUs found, ran on a single logical slot");
    }
    if summary.partial {
        println!("   ⚠ Cancelled, results are partial");
    }
    println!("   Devices used: {}", summary.total_gpus_used);
    println!("   Successes:    {}", summary.successes);
    println!("   Failures:     {}", summary.failures);
    println!("   Iterations:   {}", summary.total_iterations);

    for result in summary.results.iter().filter(|r| !r.success) {
        let reason = result
            .failure
            .as_ref()
            .map(|f| f.message.as_str())
            .unwrap_or("unknown failure");
        println!("   ✗ GPU {}: {}", result.device_id, reason);
        if !result.error.is_empty() {
            println!("     stderr: {}", result.error.trim_end());
        }
    }
}

async fn cmd_devices(config: FleetConfig) -> Result<()> {
    let context =
        RuntimeContext::init(&config).context("Failed to initialize runtime context")?;
    let dispatcher = Dispatcher::new(context, config.worker_settings());

    let inventory = dispatcher.enumerate_devices().await;
    dispatcher.shutdown();
    let inventory = inventory?;

    println!("Source: {:?}", config.inventory.source);
    if inventory.degraded {
        println!("⚠ No GPUs found, dispatch will use a single logical slot");
    }
    for device in &inventory.devices {
        println!("   {}", device);
    }

    Ok(())
}

fn cmd_status(config_path: PathBuf) -> Result<()> {
    let host = HostCapabilities::detect();

    println!("Host: {}", host.hostname.as_deref().unwrap_or("unknown"));
    println!("   OS/Arch:   {}/{}", host.os, host.arch);
    println!("   CPU Cores: {}", host.cpu_cores);
    println!("   RAM:       {} MB", host.ram_mb);

    println!("\nConfig: {}", config_path.display());
    if !config_path.exists() {
        println!("   (not found, using defaults; run 'vanity-fleet init-config')");
    }

    let config = FleetConfig::load_or_default(&config_path)?;
    let binary = &config.miner.binary_path;
    println!(
        "   Binary:     {} ({})",
        binary.display(),
        if binary.exists() { "present" } else { "missing" }
    );
    println!("   Iterations: {}", config.miner.iterations);
    match config.miner.timeout_secs {
        Some(secs) => println!("   Timeout:    {}s", secs),
        None => println!("   Timeout:    none"),
    }
    let log_dir = config.logging.log_dir.clone().unwrap_or_else(default_log_dir);
    println!("   Logs:       {}", log_dir.display());

    Ok(())
}

fn cmd_init_config(path: PathBuf, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }

    FleetConfig::default().save(&path)?;
    info!(path = %path.display(), "Default configuration written");
    println!("✓ Configuration saved to: {}", path.display());

    Ok(())
}
