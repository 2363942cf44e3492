//! CLI Entry Point for drill_sorter
//!
//! Provides command-line interface for:
//! - Running the sorter against the caliper and robot serial ports
//! - Listing the serial ports visible on this machine
//! - Classifying a single reading against the lookup table
//!
//! # Usage
//!
//! ```bash
//! drill_sorter run --caliper /dev/ttyUSB0 --robot /dev/ttyUSB1
//! drill_sorter ports
//! drill_sorter classify 199
//! ```
//!
//! While running, stdin accepts `zero <mm>`, `clear`, `table`, `status` and `quit`.

use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{info, warn};

use drill_sorter::app::{spawn_console, ConsoleCommand, SorterApp};
use drill_sorter::classify::{Classifier, LookupTable};
use drill_sorter::config::{SorterConfig, DEFAULT_CONFIG_PATH};
use drill_sorter::logging;
use drill_sorter::measurement::{format_millimetres, parse_reading};
use drill_sorter::transport::Transport;

#[derive(Parser)]
#[command(name = "drill_sorter")]
#[command(about = "Sort drill bits by size with a serial caliper and robot", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to both devices and sort until Ctrl-C or `quit`
    Run {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Caliper port, overriding the configuration
        #[arg(long)]
        caliper: Option<String>,

        /// Robot port, overriding the configuration
        #[arg(long)]
        robot: Option<String>,
    },

    /// List serial ports
    Ports,

    /// Classify a raw reading (hundredths of a millimetre)
    Classify {
        /// Reading to classify
        #[arg(allow_hyphen_values = true)]
        reading: String,

        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            caliper,
            robot,
        } => run(&config, caliper, robot).await,
        Commands::Ports => list_ports(),
        Commands::Classify { reading, config } => classify(&reading, &config),
    }
}

fn load_config(path: &Path) -> Result<SorterConfig> {
    let config = SorterConfig::load_from(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn load_lookup(config: &SorterConfig) -> Result<LookupTable> {
    let path = &config.lookup.table;
    let table = LookupTable::load(path)
        .with_context(|| format!("Failed to load lookup table {}", path.display()))?;
    if table.is_empty() {
        warn!(path = %path.display(), "Lookup table is empty; nothing will be captured");
    }
    Ok(table)
}

async fn run(config_path: &Path, caliper: Option<String>, robot: Option<String>) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(path) = caliper {
        config.caliper.path = path;
    }
    if let Some(path) = robot {
        config.robot.path = path;
    }
    logging::init_from_config(&config)?;

    let table = load_lookup(&config)?;
    info!(
        name = %config.application.name,
        entries = table.len(),
        caliper = %config.caliper.path,
        robot = %config.robot.path,
        "Starting sorter"
    );

    let transport = native_transport()?;
    let mut app = SorterApp::new(&config, transport, Arc::new(table));
    app.connect().await.context("Failed to open devices")?;

    let (tx, rx) = mpsc::unbounded_channel();
    // Detached: the process exits on quit even while stdin is still open
    spawn_console(BufReader::new(std::io::stdin()), tx.clone())
        .context("Failed to start console reader")?;
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = tx.send(ConsoleCommand::Quit);
        }
    });

    app.run(rx).await?;
    Ok(())
}

#[cfg(feature = "instrument_serial")]
fn native_transport() -> Result<Arc<dyn Transport>> {
    Ok(Arc::new(drill_sorter::transport::NativeTransport::new()))
}

#[cfg(not(feature = "instrument_serial"))]
fn native_transport() -> Result<Arc<dyn Transport>> {
    Err(drill_sorter::error::SorterError::SerialFeatureDisabled.into())
}

#[cfg(feature = "instrument_serial")]
fn list_ports() -> Result<()> {
    let ports = drill_sorter::transport::NativeTransport::available_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{}\t{}", port.port_name, port.port_type);
    }
    Ok(())
}

#[cfg(not(feature = "instrument_serial"))]
fn list_ports() -> Result<()> {
    Err(drill_sorter::error::SorterError::SerialFeatureDisabled.into())
}

fn classify(reading: &str, config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let table = load_lookup(&config)?;

    let value = parse_reading(reading)
        .with_context(|| format!("'{reading}' is not a reading"))?;
    match table.classify(value) {
        Some(classification) => println!(
            "{} mm -> {} (table {} mm)",
            format_millimetres(value),
            classification.label,
            format_millimetres(classification.key)
        ),
        None => println!("{} mm -> no match (empty table)", format_millimetres(value)),
    }
    Ok(())
}
