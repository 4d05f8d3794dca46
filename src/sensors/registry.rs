use crate::collectors::cpu;
use crate::collectors::network::Direction;
use crate::sensors::{Builtin, Probe, RateSensor, Sensor};
use anyhow::{bail, Context, Result};
use config::{Config, File, FileFormat};
use indexmap::IndexMap;
use log::{debug, error, warn};
use serde::Deserialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

/// A script sensor as declared in a YAML definition file.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct SensorDefinition {
    #[serde(default)]
    pub device_class: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub script: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub state_class: String,
    #[serde(default)]
    pub icon: String,
}

impl SensorDefinition {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let definition: SensorDefinition = Config::builder()
            .add_source(File::from(path).format(FileFormat::Yaml))
            .build()
            .with_context(|| format!("Failed to read sensor definition {}", path.display()))?
            .try_deserialize()
            .with_context(|| format!("Failed to parse sensor definition {}", path.display()))?;

        if definition.id.trim().is_empty() {
            bail!("Sensor definition {} has no id", path.display());
        }
        if definition.script.trim().is_empty() {
            bail!("Sensor definition {} has no script", path.display());
        }
        Ok(definition)
    }
}

impl From<SensorDefinition> for Sensor {
    fn from(definition: SensorDefinition) -> Self {
        let icon = if definition.icon.is_empty() && definition.id.starts_with("cpu_") {
            cpu::icon()
        } else {
            definition.icon
        };
        let name = if definition.name.is_empty() {
            definition.id.clone()
        } else {
            definition.name
        };

        Sensor {
            id: definition.id,
            name,
            description: definition.description,
            device_class: definition.device_class,
            unit: definition.unit,
            state_class: definition.state_class,
            icon,
            probe: Probe::Script(definition.script),
        }
    }
}

/// YAML files directly inside `dir`, sorted by file name.
fn definition_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                match e.io_error().map(|io| io.kind()) {
                    Some(ErrorKind::NotFound) => {
                        debug!("Sensor directory {} does not exist", dir.display())
                    }
                    _ => warn!("Skipping sensor directory {}: {}", dir.display(), e),
                }
                continue;
            }
        };

        let is_yaml = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext == "yml" || ext == "yaml");
        if entry.file_type().is_file() && is_yaml {
            files.push(entry.into_path());
        }
    }
    files
}

/// Every known sensor, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct SensorRegistry {
    sensors: IndexMap<String, Sensor>,
}

impl SensorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in sensors, overlaid with definitions from `dirs` in order.
    /// Later directories win on id collisions.
    pub fn build(dirs: &[PathBuf]) -> Self {
        let mut registry = Self::builtin();
        for dir in dirs {
            registry.load_dir(dir);
        }
        registry
    }

    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for sensor in builtin_sensors() {
            registry.insert(sensor);
        }
        registry
    }

    /// Loads every definition file in `dir`. Broken files are logged and
    /// skipped.
    pub fn load_dir(&mut self, dir: &Path) -> usize {
        let files = definition_files(dir);
        debug!(
            "Loading sensor definitions from {}: {:?}",
            dir.display(),
            files
        );

        let mut loaded = 0;
        for file in files {
            match SensorDefinition::from_file(&file) {
                Ok(definition) => {
                    self.insert(definition.into());
                    loaded += 1;
                }
                Err(e) => error!("{e:#}"),
            }
        }
        loaded
    }

    pub fn insert(&mut self, sensor: Sensor) {
        self.sensors.insert(sensor.id.clone(), sensor);
    }

    pub fn get(&self, id: &str) -> Option<&Sensor> {
        self.sensors.get(id)
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sensor> {
        self.sensors.values()
    }

    /// Splits `selected` into known ids and unknown names.
    fn select<'a>(&self, selected: &'a [String]) -> (Vec<&'a str>, Vec<&'a str>) {
        selected
            .iter()
            .map(|name| name.trim())
            .filter(|name| !name.is_empty())
            .partition(|name| self.sensors.contains_key(*name))
    }

    /// Keeps only the sensors named in `selected`. An empty selection keeps
    /// everything; unknown names are logged and dropped.
    pub fn filter(mut self, selected: &[String]) -> Self {
        if selected.is_empty() {
            return self;
        }

        let (known, unknown) = self.select(selected);
        for name in unknown {
            warn!("Unknown sensor: {name}");
        }

        let mut sensors = IndexMap::with_capacity(known.len());
        for id in known {
            if let Some(sensor) = self.sensors.shift_remove(id) {
                sensors.insert(id.to_string(), sensor);
            }
        }
        Self { sensors }
    }

    /// `(id, description)` pairs sorted by id.
    pub fn list(&self) -> Vec<(&str, &str)> {
        let mut entries: Vec<(&str, &str)> = self
            .sensors
            .values()
            .map(|s| (s.id.as_str(), s.description.as_str()))
            .collect();
        entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
        entries
    }

    /// Starts the background samplers of the sensors that own one.
    pub fn start_samplers(&self) {
        for sensor in self.iter() {
            if let Some(rate) = sensor.rate_sensor() {
                rate.start();
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn builtin(
    id: &str,
    name: &str,
    description: &str,
    device_class: &str,
    unit: &str,
    state_class: &str,
    icon: &str,
    builtin: Builtin,
) -> Sensor {
    Sensor {
        id: id.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        device_class: device_class.to_string(),
        unit: unit.to_string(),
        state_class: state_class.to_string(),
        icon: icon.to_string(),
        probe: Probe::Builtin(builtin),
    }
}

fn builtin_sensors() -> Vec<Sensor> {
    let cpu_icon = cpu::icon();
    vec![
        builtin(
            "cpu_cores",
            "CPU Cores",
            "Number of available cpu cores",
            "",
            "",
            "",
            "mdi:numeric",
            Builtin::CpuCores,
        ),
        builtin(
            "cpu_usage",
            "CPU Usage",
            "CPU Usage averaged over all CPU cores in percent",
            "",
            "%",
            "measurement",
            &cpu_icon,
            Builtin::CpuUsage,
        ),
        builtin(
            "net_rx_usage",
            "Network RX usage",
            "Total data received over the network in GB",
            "data_size",
            "GB",
            "",
            "mdi:download-network-outline",
            Builtin::NetUsage(Direction::Rx),
        ),
        builtin(
            "net_tx_usage",
            "Network TX usage",
            "Total data sent over the network in GB",
            "data_size",
            "GB",
            "",
            "mdi:upload-network-outline",
            Builtin::NetUsage(Direction::Tx),
        ),
        builtin(
            "net_rx",
            "Network RX",
            "Data received over the network in Mbit/s",
            "data_rate",
            "Mbit/s",
            "",
            "mdi:download-network-outline",
            Builtin::NetRate(Arc::new(RateSensor::network("net_rx", Direction::Rx))),
        ),
        builtin(
            "net_tx",
            "Network TX",
            "Data sent over the network in Mbit/s",
            "data_rate",
            "Mbit/s",
            "",
            "mdi:upload-network-outline",
            Builtin::NetRate(Arc::new(RateSensor::network("net_tx", Direction::Tx))),
        ),
        builtin(
            "root_fs_usage",
            "Root FS usage",
            "Root filesystem usage in percent",
            "",
            "%",
            "measurement",
            "mdi:harddisk",
            Builtin::RootFsUsage,
        ),
        builtin(
            "available_memory",
            "Available Memory",
            "Available memory in GB",
            "data_size",
            "GB",
            "",
            "mdi:memory",
            Builtin::AvailableMemory,
        ),
        builtin(
            "occupied_memory",
            "Occupied Memory",
            "Occupied memory in GB",
            "data_size",
            "GB",
            "",
            "mdi:memory",
            Builtin::OccupiedMemory,
        ),
        builtin(
            "total_memory",
            "Total Memory",
            "Total memory in GB",
            "data_size",
            "GB",
            "",
            "mdi:memory",
            Builtin::TotalMemory,
        ),
        builtin(
            "memory_usage",
            "Memory usage",
            "Memory usage in percent",
            "",
            "%",
            "measurement",
            "mdi:memory",
            Builtin::MemoryUsage,
        ),
    ]
}
