//! CLI Entry Point for station-ctl
//!
//! Provides command-line access to the session controller without the
//! station GUI:
//! - Checking a configuration file
//! - Listing the ports each power rail can see
//! - Running a scripted session against the configured drivers
//!
//! # Usage
//!
//! Validate a configuration:
//! ```bash
//! station-ctl --config config/station.toml check
//! ```
//!
//! Run a session and trip the interlock at the end:
//! ```bash
//! station-ctl simulate --trip
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use station_ctl::config::{StationConfig, DEFAULT_CONFIG_PATH};
use station_ctl::hardware::registry::StationRegistry;
use station_ctl::logging::{self, LogSettings, OutputFormat};
use station_ctl::sensor::{sensor_channel, spawn_sensor_bridge};
use station_ctl::{spawn_session, PowerRole};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "station-ctl")]
#[command(about = "Module test station session controller", long_about = None)]
struct Cli {
    /// Station configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Compact)]
    log_format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate the configuration, then print a summary
    Check {
        /// Print the effective configuration (file plus environment) as TOML
        #[arg(long)]
        effective: bool,
    },

    /// List the ports visible to each power rail
    Ports,

    /// Run a session against the configured drivers and print snapshots
    Simulate {
        /// Board to claim (defaults to the configured default board)
        #[arg(long)]
        board: Option<String>,

        /// Trip the interlock through the sensor bridge before shutting down
        #[arg(long)]
        trip: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = StationConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    logging::init(&LogSettings::for_station(&config, cli.log_format)?)?;

    match cli.command {
        Commands::Check { effective } => check(&config, effective),
        Commands::Ports => ports(&config).await,
        Commands::Simulate { board, trip } => simulate(&config, board, trip).await,
    }
}

fn check(config: &StationConfig, effective: bool) -> Result<()> {
    if effective {
        print!("{}", config.to_toml_string()?);
        return Ok(());
    }

    let summary = serde_json::json!({
        "station": config.application.name,
        "boards": config.boards.iter().map(|b| &b.name).collect::<Vec<_>>(),
        "default_board": config.default_board(),
        "hv_driver": config.power.hv.driver.driver_name(),
        "lv_driver": config.power.lv.driver.driver_name(),
        "expert_mode": config.session.start_in_expert_mode,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn ports(config: &StationConfig) -> Result<()> {
    let registry = StationRegistry::from_config(config)?;
    for role in PowerRole::ALL {
        let ports = registry
            .connector(role)
            .list_ports()
            .await
            .with_context(|| format!("Failed to list {role} ports"))?;
        println!("{role}:");
        for port in ports {
            println!("  {port}");
        }
    }
    Ok(())
}

async fn simulate(config: &StationConfig, board: Option<String>, trip: bool) -> Result<()> {
    let registry = StationRegistry::from_config(config)?;
    let (session, task) = spawn_session(config, &registry);

    session.enter_expert_mode().await?;
    let statuses = session.refresh_statuses().await?;
    println!("{}", serde_json::to_string_pretty(&statuses)?);

    if let Some(board) = board.or_else(|| config.default_board().map(str::to_string)) {
        if let Err(err) = session.claim(&board).await {
            eprintln!("Claim of {board} rejected: {err}");
        }
    }

    for (role, result) in session.connect_defaults().await? {
        match result {
            Ok(status) => println!("{role}: {status}"),
            Err(err) => eprintln!("{role}: {err}"),
        }
    }
    println!("{}", serde_json::to_string_pretty(&session.snapshot().await?)?);

    if trip {
        let (signal, conditions) = sensor_channel(1);
        let bridge = spawn_sensor_bridge(session.clone(), "cli", conditions);
        signal.critical();
        drop(signal);
        bridge.await?;
        println!("{}", serde_json::to_string_pretty(&session.snapshot().await?)?);
    }

    session.shutdown().await?;
    task.await?;
    Ok(())
}
