use clap::Parser;
use env_logger::{Builder, WriteStyle};
use log::error;
use msm::config::{AppConfig, DEFAULT_CONFIG_PATH};
use msm::sensors::SensorRegistry;
use std::io;
use std::path::PathBuf;

/// Publish host metrics to MQTT for Home Assistant.
#[derive(Parser, Debug)]
#[command(name = "msm", version, about)]
struct Cli {
    /// List all known sensors and exit
    #[arg(long)]
    list: bool,

    /// Comma separated list of sensors to enable
    #[arg(long, value_delimiter = ',')]
    sensors: Vec<String>,

    /// Configuration file
    #[arg(default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration first (without logging)
    let mut config = AppConfig::load(&cli.config).map_err(|e| {
        eprintln!("Failed to load configuration: {e:#}");
        e
    })?;

    // Initialise logger with a configured log level
    Builder::new()
        .filter_level(config.get_log_level())
        .write_style(WriteStyle::Always)
        .format_timestamp_secs()
        .init();

    if !cli.sensors.is_empty() {
        config.sensors = cli.sensors;
    }

    if cli.list {
        let registry = SensorRegistry::build(&config.sensor_dirs);
        msm::write_sensor_list(&registry, &mut io::stdout().lock())?;
        return Ok(());
    }

    if let Err(e) = msm::run(config).await {
        error!("Application error: {}", e);
        return Err(e);
    }
    Ok(())
}
