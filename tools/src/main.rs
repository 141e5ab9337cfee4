//! powerhouse - sample battery and backlight telemetry from attached Apple
//! devices

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::error;
use tracing_subscriber::EnvFilter;

mod config;
mod list;
mod measure;

use config::Config;

#[derive(Parser, Debug)]
#[command(name = "powerhouse")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbosity of logging output (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Change logging format to JSON
    #[arg(long, global = true)]
    log_as_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List attached devices
    List,

    /// Stream metric records from an attached device until interrupted
    Measure {
        /// Stop after this long (e.g. "90s", "5m")
        #[arg(long, value_parser = humantime::parse_duration)]
        duration: Option<Duration>,

        /// Time between samples
        #[arg(long, value_parser = humantime::parse_duration)]
        interval: Option<Duration>,

        /// UDID of the device to measure (defaults to the first attached)
        #[arg(long)]
        udid: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e:#}");
            return ExitCode::FAILURE;
        }
    };

    let level = cli.log_level.as_deref().unwrap_or(&config.log.level);
    init_logging(level, cli.log_as_json || config.log.json);

    let result = match cli.command {
        Commands::List => list::run().await,
        Commands::Measure {
            duration,
            interval,
            udid,
        } => measure::run(&config, duration, interval, udid).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes logging on stderr, leaving stdout to the record stream
fn init_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
