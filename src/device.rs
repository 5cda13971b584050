use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};

use error_stack::{Result, ResultExt};
use serde::{de, Deserialize, Deserializer, Serialize};

use crate::error::ArgumentError;

pub const DEFAULT_DEVICE_PORT: u16 = 80;

/// Static description of one air-conditioner controller, as written in the
/// `devices` section of the config file or passed as JSON on the command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub name: String,
    pub ip: IpAddr,
    #[serde(default = "default_device_port")]
    pub port: u16,
    #[serde(deserialize_with = "mac_from_scalar")]
    pub mac: String,
}

fn default_device_port() -> u16 {
    DEFAULT_DEVICE_PORT
}

const MAC_DIGITS: usize = 12;

/// A MAC made only of digits arrives as a number from YAML or JSON. Leading
/// zeros the number lost are restored.
fn mac_from_scalar<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Text(String),
        Number(u64),
    }

    match Scalar::deserialize(deserializer)? {
        Scalar::Text(text) => Ok(text),
        Scalar::Number(number) => {
            let mac = format!("{number:0width$}", width = MAC_DIGITS);
            if mac.len() > MAC_DIGITS {
                return Err(de::Error::custom(format!("MAC address {number} has more than {MAC_DIGITS} digits")));
            }
            Ok(mac)
        }
    }
}

impl DeviceDescriptor {
    pub fn address(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// MAC address as lower case hex without separators; used as the device key
    /// and as the MQTT topic segment.
    pub fn device_id(&self) -> String {
        normalize_mac(&self.mac)
    }
}

pub fn normalize_mac(mac: &str) -> String {
    mac.chars()
        .filter(|c| c.is_ascii_hexdigit())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// A device the bridge can talk to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcDevice {
    pub descriptor: DeviceDescriptor,
    pub device_type: u16,
    pub model: String,
}

impl AcDevice {
    pub fn id(&self) -> String {
        self.descriptor.device_id()
    }
}

pub type Devices = BTreeMap<String, AcDevice>;

/// Parse the `--devices` / `DEVICES` JSON array.
pub fn parse_devices_json(json: &str) -> Result<Vec<DeviceDescriptor>, ArgumentError> {
    serde_json::from_str::<Vec<DeviceDescriptor>>(json)
        .change_context_lazy(|| ArgumentError::InvalidDevicesJson(json.to_string()))
}

#[derive(Serialize)]
struct DevicesSection<'a> {
    devices: &'a [DeviceDescriptor],
}

/// Render descriptors as a `devices:` YAML fragment ready to paste into the config file.
pub fn devices_yaml(devices: &[DeviceDescriptor]) -> std::result::Result<String, serde_yaml::Error> {
    serde_yaml::to_string(&DevicesSection { devices })
}
