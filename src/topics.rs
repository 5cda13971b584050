//! MQTT topic layout. `prefix` is the normalized topic prefix (empty or ending in `/`).

pub const ONLINE: &str = "online";
pub const OFFLINE: &str = "offline";

pub fn bridge_availability(prefix: &str) -> String {
    format!("{prefix}bridge/availability")
}

pub fn bridge_version(prefix: &str) -> String {
    format!("{prefix}bridge/version")
}

pub fn device_availability(prefix: &str, device_id: &str) -> String {
    format!("{prefix}{device_id}/availability")
}

pub fn device_state(prefix: &str, device_id: &str) -> String {
    format!("{prefix}{device_id}/state")
}

pub fn discovery_config(discovery_prefix: &str, device_id: &str) -> String {
    format!(
        "{}/binary_sensor/{device_id}/config",
        discovery_prefix.trim_end_matches('/')
    )
}
