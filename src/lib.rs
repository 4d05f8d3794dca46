//! Publishes host metrics and script-defined sensors to an MQTT broker using
//! the Home Assistant discovery conventions.

pub mod broker;
pub mod collectors;
pub mod config;
pub mod daemon;
pub mod error;
pub mod homeassistant;
pub mod sensors;

use crate::broker::{lookup, MqttPublisher};
use crate::config::AppConfig;
use crate::daemon::Daemon;
use crate::sensors::SensorRegistry;
use anyhow::Context;
use log::{debug, error, info};
use std::io::{self, Write};
use std::sync::Arc;

pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    info!("Starting application as {}", config.client_id);

    match start(config).await {
        Ok(_) => info!("Application stopped"),
        Err(e) => {
            error!("Application error: {e:#}");
            // Print chain of error causes
            let mut source = e.source();
            while let Some(e) = source {
                error!("Caused by: {e}");
                source = e.source();
            }
            return Err(e).context("Application failed to run");
        }
    }

    Ok(())
}

async fn start(config: AppConfig) -> anyhow::Result<()> {
    let host = lookup::resolve_broker(&config.mqtt_broker, config.mqtt_broker_port).await;
    let publisher = MqttPublisher::connect(&config, &host)
        .await
        .context("Failed to connect to the MQTT broker")?;

    debug!("Loading sensors from {:?}", config.sensor_dirs);
    let sensors = SensorRegistry::build(&config.sensor_dirs).filter(&config.sensors);

    let mut daemon = Daemon::new(config, sensors, Arc::new(publisher));
    daemon.run().await
}

/// Writes every known sensor id with its description, sorted by id.
pub fn write_sensor_list<W: Write>(registry: &SensorRegistry, out: &mut W) -> io::Result<()> {
    writeln!(
        out,
        "Listing all known sensors. Their names can be used to configure the enabled sensors in the configuration file."
    )?;
    writeln!(out, "{:<20} : {}", "Name", "Description")?;
    writeln!(out, "{}", "=".repeat(72))?;
    for (id, description) in registry.list() {
        writeln!(out, "{:<20} : {}", id, description)?;
    }
    Ok(())
}
