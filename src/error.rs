use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config file '{0}'")]
    Read(String),

    #[error("Invalid config file '{0}'")]
    Invalid(String),

    #[error("Invalid update interval: {0}")]
    InvalidUpdateInterval(f64),

    #[error("Invalid bind address: {0}")]
    InvalidBindAddress(String),
}

#[derive(Debug, Error)]
pub enum ArgumentError {
    #[error("Invalid JSON in devices argument:\n{0}")]
    InvalidDevicesJson(String),

    #[error("Invalid MQTT port: {0}")]
    InvalidMqttPort(String),

    #[error("Path Not found for Datadir: {0}")]
    DataDirNotFound(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("UDP socket error while {0}")]
    Socket(&'static str),

    #[error("Cannot determine local IPv4 address")]
    NoLocalAddress,

    #[error("Device address {0} is not IPv4")]
    NotIpv4(String),
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("{0}")]
    Context(String),

    #[error("MQTT connection failed: {0}")]
    MqttConnection(String),

    #[error("Not connected to MQTT broker")]
    NotConnected,

    #[error("Device discovery failed")]
    Discovery,

    #[error("Serialization failed")]
    Serialization,

    #[error("Writing to standard output failed")]
    Output,

    #[error("Invalid device '{0}': {1}")]
    InvalidDevice(String, String),
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Invalid log file path: {0}")]
    InvalidLogFile(String),

    #[error("Cannot open log file '{0}'")]
    OpenLogFile(String),

    #[error("Logger already initialized")]
    Init,
}
