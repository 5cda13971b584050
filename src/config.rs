use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use error_stack::{Report, Result, ResultExt};
use serde::Deserialize;

use crate::device::{parse_devices_json, DeviceDescriptor};
use crate::error::{ArgumentError, ConfigError};

pub const DEFAULT_MQTT_HOST: &str = "localhost";
pub const DEFAULT_MQTT_PORT: u16 = 1883;
const CLIENT_ID_PREFIX: &str = "broadlink_to_mqtt-";

pub const ENV_AUTO_DISCOVERY_TOPIC: &str = "MQTT_AUTO_DISCOVERY_TOPIC";
pub const ENV_MQTT_HOST: &str = "MQTT_HOST";
pub const ENV_MQTT_PORT: &str = "MQTT_PORT";
pub const ENV_MQTT_USERNAME: &str = "MQTT_USERNAME";
pub const ENV_MQTT_PASSWORD: &str = "MQTT_PASSWORD";
pub const ENV_DEVICES: &str = "DEVICES";

// On-disk layout

#[derive(Debug, Deserialize)]
struct ConfigFile {
    service: ServiceSection,
    mqtt: MqttSection,
    #[serde(default)]
    devices: Option<Vec<DeviceDescriptor>>,
}

#[derive(Debug, Deserialize)]
struct ServiceSection {
    daemon_mode: bool,
    update_interval: f64,
    self_discovery: bool,
    #[serde(default)]
    bind_to_ip: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MqttSection {
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    passwd: Option<String>,
    #[serde(default)]
    client_id: Option<String>,
    topic_prefix: String,
    #[serde(default)]
    auto_discovery_topic: Option<String>,
    #[serde(default)]
    auto_discovery_topic_retain: bool,
}

// Merged configuration

#[derive(Debug, Clone, PartialEq)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub topic_prefix: String,
    pub auto_discovery_topic: Option<String>,
    pub auto_discovery_topic_retain: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Configuration {
    pub daemon_mode: bool,
    pub update_interval: Duration,
    pub self_discovery: bool,
    pub bind_to_ip: Option<IpAddr>,
    pub mqtt: MqttConfig,
    pub devices: Vec<DeviceDescriptor>,
}

/// Values that may replace file settings, coming either from the command line
/// or from the environment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overrides {
    pub mqtt_host: Option<String>,
    pub mqtt_port: Option<u16>,
    pub mqtt_user: Option<String>,
    pub mqtt_password: Option<String>,
    pub auto_discovery_topic: Option<String>,
    pub devices: Option<Vec<DeviceDescriptor>>,
}

pub fn load_config(path: &Path) -> Result<Configuration, ConfigError> {
    let origin = path.display().to_string();
    let text = std::fs::read_to_string(path).change_context_lazy(|| ConfigError::Read(origin.clone()))?;

    parse_config(&text, &origin)
}

pub fn parse_config(text: &str, origin: &str) -> Result<Configuration, ConfigError> {
    let file: ConfigFile =
        serde_yaml::from_str(text).change_context_lazy(|| ConfigError::Invalid(origin.to_string()))?;

    let update_interval = Duration::try_from_secs_f64(file.service.update_interval)
        .change_context(ConfigError::InvalidUpdateInterval(file.service.update_interval))?;

    let bind_to_ip = match non_empty(file.service.bind_to_ip) {
        Some(ip) => Some(
            ip.parse::<IpAddr>()
                .change_context_lazy(|| ConfigError::InvalidBindAddress(ip.clone()))?,
        ),
        None => None,
    };

    let mqtt = file.mqtt;
    Ok(Configuration {
        daemon_mode: file.service.daemon_mode,
        update_interval,
        self_discovery: file.service.self_discovery,
        bind_to_ip,
        mqtt: MqttConfig {
            host: non_empty(mqtt.host).unwrap_or_else(|| DEFAULT_MQTT_HOST.to_string()),
            port: mqtt.port.unwrap_or(DEFAULT_MQTT_PORT),
            user: non_empty(mqtt.user),
            password: non_empty(mqtt.passwd),
            client_id: non_empty(mqtt.client_id).unwrap_or_else(default_client_id),
            topic_prefix: normalize_topic_prefix(&mqtt.topic_prefix),
            auto_discovery_topic: non_empty(mqtt.auto_discovery_topic),
            auto_discovery_topic_retain: mqtt.auto_discovery_topic_retain,
        },
        devices: file.devices.unwrap_or_default(),
    })
}

/// Make sure a non-empty prefix ends with `/` so topics can be formed by concatenation.
pub fn normalize_topic_prefix(prefix: &str) -> String {
    if prefix.is_empty() || prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{prefix}/")
    }
}

fn default_client_id() -> String {
    format!("{CLIENT_ID_PREFIX}{}", chrono::Utc::now().timestamp_millis())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

impl Overrides {
    /// Collect overrides from environment variables. `lookup` is normally
    /// `std::env::var(..).ok()`.
    pub fn from_env<F>(lookup: F) -> Result<Overrides, ArgumentError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| non_empty(lookup(key));

        let mqtt_port = match get(ENV_MQTT_PORT) {
            Some(port) => Some(parse_port(&port)?),
            None => None,
        };

        let devices = match get(ENV_DEVICES) {
            Some(json) => Some(parse_devices_json(&json)?),
            None => None,
        };

        Ok(Overrides {
            mqtt_host: get(ENV_MQTT_HOST),
            mqtt_port,
            mqtt_user: get(ENV_MQTT_USERNAME),
            mqtt_password: get(ENV_MQTT_PASSWORD),
            auto_discovery_topic: get(ENV_AUTO_DISCOVERY_TOPIC),
            devices,
        })
    }

    /// Field by field, keep `self` where set, otherwise take `lower`.
    pub fn or(self, lower: Overrides) -> Overrides {
        Overrides {
            mqtt_host: self.mqtt_host.or(lower.mqtt_host),
            mqtt_port: self.mqtt_port.or(lower.mqtt_port),
            mqtt_user: self.mqtt_user.or(lower.mqtt_user),
            mqtt_password: self.mqtt_password.or(lower.mqtt_password),
            auto_discovery_topic: self.auto_discovery_topic.or(lower.auto_discovery_topic),
            devices: self.devices.or(lower.devices),
        }
    }
}

pub fn parse_port(port: &str) -> Result<u16, ArgumentError> {
    port.trim()
        .parse::<u16>()
        .map_err(|e| Report::new(ArgumentError::InvalidMqttPort(port.to_string())).attach_printable(e))
}

impl Configuration {
    pub fn apply_overrides(&mut self, overrides: Overrides) {
        if let Some(host) = overrides.mqtt_host {
            self.mqtt.host = host;
        }
        if let Some(port) = overrides.mqtt_port {
            self.mqtt.port = port;
        }
        if let Some(user) = overrides.mqtt_user {
            self.mqtt.user = Some(user);
        }
        if let Some(password) = overrides.mqtt_password {
            self.mqtt.password = Some(password);
        }
        if let Some(topic) = overrides.auto_discovery_topic {
            self.mqtt.auto_discovery_topic = Some(topic);
        }
        if let Some(devices) = overrides.devices.filter(|d| !d.is_empty()) {
            self.devices = devices;
        }

        self.mqtt.topic_prefix = normalize_topic_prefix(&self.mqtt.topic_prefix);
    }
}
