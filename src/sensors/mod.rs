//! Sensors: built-in probes and script-defined probes behind one contract.

pub mod rate;
pub mod registry;

pub use rate::RateSensor;
pub use registry::{SensorDefinition, SensorRegistry};

use crate::collectors::network::Direction;
use crate::collectors::{cpu, disk, memory, network, BYTES_IN_GIGABYTE};
use crate::error::SensorError;
use log::debug;
use std::sync::Arc;
use std::time::Instant;
use systemstat::{Platform, System};
use tokio::process::Command;

const SHELL: &str = "bash";

/// The built-in probes.
#[derive(Debug, Clone)]
pub enum Builtin {
    CpuCores,
    CpuUsage,
    MemoryUsage,
    AvailableMemory,
    OccupiedMemory,
    TotalMemory,
    RootFsUsage,
    NetUsage(Direction),
    NetRate(Arc<RateSensor>),
}

impl Builtin {
    pub async fn read(&self) -> Result<String, SensorError> {
        match self {
            Builtin::CpuCores => cpu::collect_count().map(|count| count.to_string()),
            Builtin::CpuUsage => cpu::collect_usage().await.map(|p| format!("{p:.3}")),
            Builtin::MemoryUsage => {
                memory::collect_ram(&System::new()).map(|ram| format!("{:.3}", ram.percent()))
            }
            Builtin::AvailableMemory => {
                memory::collect_ram(&System::new()).map(|ram| gigabytes(ram.available, 1))
            }
            Builtin::OccupiedMemory => {
                memory::collect_ram(&System::new()).map(|ram| gigabytes(ram.used, 1))
            }
            Builtin::TotalMemory => {
                memory::collect_ram(&System::new()).map(|ram| gigabytes(ram.total, 1))
            }
            Builtin::RootFsUsage => disk::collect_usage("/").map(|p| format!("{p:.3}")),
            Builtin::NetUsage(direction) => {
                network::collect_counter(&System::new(), *direction).map(|b| gigabytes(b, 3))
            }
            Builtin::NetRate(sensor) => sensor.read_mbits().await,
        }
    }
}

fn gigabytes(bytes: u64, precision: usize) -> String {
    format!("{:.*}", precision, bytes as f64 / BYTES_IN_GIGABYTE)
}

/// How a sensor produces its value.
#[derive(Debug, Clone)]
pub enum Probe {
    Builtin(Builtin),
    /// Shell command text; its trimmed standard output is the value.
    Script(String),
}

#[derive(Debug, Clone)]
pub struct Sensor {
    pub id: String,
    pub name: String,
    pub description: String,
    pub device_class: String,
    pub unit: String,
    pub state_class: String,
    pub icon: String,
    pub probe: Probe,
}

/// A value produced by one execution of a sensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reading {
    pub id: String,
    pub device_class: String,
    pub value: String,
}

impl Sensor {
    /// The background sampler this sensor depends on, if any.
    pub fn rate_sensor(&self) -> Option<&Arc<RateSensor>> {
        match &self.probe {
            Probe::Builtin(Builtin::NetRate(sensor)) => Some(sensor),
            _ => None,
        }
    }

    pub async fn execute(&self) -> Result<Reading, SensorError> {
        let start = Instant::now();
        let value = match &self.probe {
            Probe::Builtin(builtin) => builtin.read().await?,
            Probe::Script(script) => run_script(&self.id, script).await?,
        };
        debug!("{} took: {} ms", self.id, start.elapsed().as_millis());

        Ok(Reading {
            id: self.id.clone(),
            device_class: self.device_class.clone(),
            value,
        })
    }
}

async fn run_script(id: &str, script: &str) -> Result<String, SensorError> {
    let output = Command::new(SHELL)
        .arg("-c")
        .arg(script)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| SensorError::Spawn {
            id: id.to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(SensorError::Script {
            id: id.to_string(),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
