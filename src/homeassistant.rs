//! Home Assistant MQTT discovery payloads.

use crate::config::AppConfig;
use crate::sensors::Sensor;
use serde::Serialize;
use std::time::Duration;

pub const DISCOVERY_PREFIX: &str = "homeassistant";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DeviceInfo {
    pub name: String,
    pub model: String,
    pub identifiers: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DiscoveryConfig {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub device_class: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub unit_of_measurement: String,
    pub device: DeviceInfo,
    pub expire_after: u64,
    pub state_topic: String,
    pub unique_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub object_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub state_class: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub icon: String,
}

/// A discovery payload and the topic it is published to.
#[derive(Debug, Clone, PartialEq)]
pub struct Announcement {
    pub topic: String,
    pub config: DiscoveryConfig,
}

impl Announcement {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.config)
    }
}

/// How often announcements must be repeated so they never reach their
/// expiry.
pub fn refresh_interval(expire_after: u64) -> Duration {
    Duration::from_secs(expire_after.saturating_sub(1).max(1))
}

fn device_info(config: &AppConfig) -> DeviceInfo {
    DeviceInfo {
        name: config.client_id.clone(),
        model: config.client_id.clone(),
        identifiers: config.client_id.clone(),
    }
}

/// The connectivity binary sensor that represents the host itself.
pub fn device_announcement(config: &AppConfig) -> Announcement {
    Announcement {
        topic: format!(
            "{}/binary_sensor/{}/config",
            DISCOVERY_PREFIX, config.client_id
        ),
        config: DiscoveryConfig {
            name: config.client_id.clone(),
            device_class: "connectivity".to_string(),
            unit_of_measurement: "None".to_string(),
            device: device_info(config),
            expire_after: config.expire_after,
            state_topic: config.state_topic(),
            unique_id: config.client_id.clone(),
            object_id: String::new(),
            state_class: String::new(),
            icon: String::new(),
        },
    }
}

pub fn sensor_announcement(config: &AppConfig, sensor: &Sensor) -> Announcement {
    let unique_id = format!("{}_{}", config.client_id, sensor.id);
    Announcement {
        topic: format!("{}/sensor/{}/config", DISCOVERY_PREFIX, unique_id),
        config: DiscoveryConfig {
            name: sensor.name.clone(),
            device_class: sensor.device_class.clone(),
            unit_of_measurement: sensor.unit.clone(),
            device: device_info(config),
            expire_after: config.expire_after,
            state_topic: config.sensor_topic(&sensor.device_class, &sensor.id),
            object_id: unique_id.clone(),
            unique_id,
            state_class: sensor.state_class.clone(),
            icon: sensor.icon.clone(),
        },
    }
}
