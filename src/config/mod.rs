use anyhow::{bail, Context, Result};
use config::{Config, File, FileFormat};
use log::{debug, LevelFilter};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/msm/config.yml";
pub const DEFAULT_EXPIRE_AFTER: u64 = 60;

/// Sensor definition directories: shipped defaults, their OS-specific
/// subdirectory, then the site overrides.
pub fn default_sensor_dirs() -> Vec<PathBuf> {
    let base = PathBuf::from("default/sensors");
    vec![
        base.clone(),
        base.join(std::env::consts::OS),
        PathBuf::from("/etc/msm/sensors"),
    ]
}

fn default_client_id() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| "msm".to_string())
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "kebab-case", default)]
pub struct AppConfig {
    pub client_id: String,
    pub mqtt_broker: String,
    pub mqtt_broker_port: u16,
    pub mqtt_user: Option<String>,
    pub mqtt_password: Option<String>,
    pub prefix: String,
    /// Enabled sensor ids; empty enables every known sensor.
    pub sensors: Vec<String>,
    /// Seconds between metric publications.
    pub update_period: u64,
    /// Seconds after which Home Assistant marks a sensor unavailable.
    pub expire_after: u64,
    pub log_verbosity: String,
    pub sensor_dirs: Vec<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            client_id: default_client_id(),
            mqtt_broker: "localhost".to_string(),
            mqtt_broker_port: 1883,
            mqtt_user: None,
            mqtt_password: None,
            prefix: "mqtt-system-monitor".to_string(),
            sensors: Vec::new(),
            update_period: 10,
            expire_after: DEFAULT_EXPIRE_AFTER,
            log_verbosity: "info".to_string(),
            sensor_dirs: default_sensor_dirs(),
        }
    }
}

impl AppConfig {
    /// Reads `path`, falling back to the defaults when the file does not
    /// exist.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::from_file(path)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_path = path.as_ref();
        debug!("Loading configuration from {}", config_path.display());

        let config = Config::builder()
            .add_source(File::from(config_path).format(FileFormat::Yaml))
            .build()
            .context(format!("Failed to load config from {}", config_path.display()))?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize config")?;

        app_config.validate()?;
        Ok(app_config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.update_period == 0 {
            bail!("update-period must be at least 1 second");
        }
        if self.expire_after < 2 {
            bail!("expire-after must be at least 2 seconds");
        }
        if self.client_id.trim().is_empty() {
            bail!("client-id must not be empty");
        }
        Ok(())
    }

    pub fn get_log_level(&self) -> LevelFilter {
        match self.log_verbosity.to_lowercase().as_str() {
            "trace" => LevelFilter::Trace,
            "debug" => LevelFilter::Debug,
            "info" => LevelFilter::Info,
            "warn" | "warning" => LevelFilter::Warn,
            "error" => LevelFilter::Error,
            "off" => LevelFilter::Off,
            _ => LevelFilter::Info,
        }
    }

    pub fn state_topic(&self) -> String {
        format!("{}/{}/state", self.prefix, self.client_id)
    }

    pub fn sensor_topic(&self, device_class: &str, sensor_id: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            self.prefix, self.client_id, device_class, sensor_id
        )
    }
}
