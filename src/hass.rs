use serde::Serialize;

use crate::config::Configuration;
use crate::device::{AcDevice, Devices};
use crate::topics;

const MANUFACTURER: &str = "Broadlink";

/// Home-Assistant MQTT binary sensor reporting whether a controller answers.
#[derive(Debug, Serialize)]
pub struct Entity {
    pub name: String,
    pub unique_id: String,
    pub object_id: String,
    pub state_topic: String,
    pub json_attributes_topic: String,
    pub availability_topic: String,
    pub payload_on: &'static str,
    pub payload_off: &'static str,
    pub device_class: &'static str,
    pub device: Device,
}

#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub name: String,
    pub identifiers: Vec<String>,
    pub connections: Vec<(String, String)>,
    pub manufacturer: String,
    pub model: String,
    pub sw_version: String,
}

pub fn entity(device: &AcDevice, config: &Configuration) -> Entity {
    let id = device.id();
    let prefix = &config.mqtt.topic_prefix;

    Entity {
        name: device.descriptor.name.clone(),
        unique_id: format!("broadlink_ac_{id}"),
        object_id: format!("broadlink_ac_{id}"),
        state_topic: topics::device_availability(prefix, &id),
        json_attributes_topic: topics::device_state(prefix, &id),
        availability_topic: topics::bridge_availability(prefix),
        payload_on: topics::ONLINE,
        payload_off: topics::OFFLINE,
        device_class: "connectivity",
        device: Device {
            name: device.descriptor.name.clone(),
            identifiers: vec![id],
            connections: vec![("mac".to_string(), colon_mac(&device.descriptor.mac))],
            manufacturer: MANUFACTURER.to_string(),
            model: device.model.clone(),
            sw_version: env!("CARGO_PKG_VERSION").to_string(),
        },
    }
}

/// `(topic, payload)` pairs announcing every device to Home Assistant.
pub fn discovery_messages(
    discovery_prefix: &str,
    devices: &Devices,
    config: &Configuration,
) -> serde_json::Result<Vec<(String, Vec<u8>)>> {
    devices
        .values()
        .map(|device| {
            let payload = serde_json::to_vec(&entity(device, config))?;
            Ok((topics::discovery_config(discovery_prefix, &device.id()), payload))
        })
        .collect()
}

#[derive(Serialize)]
struct ManualConfig {
    mqtt: ManualMqtt,
}

#[derive(Serialize)]
struct ManualMqtt {
    binary_sensor: Vec<Entity>,
}

/// YAML block for a manual `configuration.yaml` entry.
pub fn manual_config(devices: &Devices, config: &Configuration) -> Result<String, serde_yaml::Error> {
    let binary_sensor = devices.values().map(|device| entity(device, config)).collect();
    serde_yaml::to_string(&ManualConfig {
        mqtt: ManualMqtt { binary_sensor },
    })
}

fn colon_mac(mac: &str) -> String {
    let hex = crate::device::normalize_mac(mac);
    hex.as_bytes()
        .chunks(2)
        .map(|pair| String::from_utf8_lossy(pair).into_owned())
        .collect::<Vec<_>>()
        .join(":")
}
