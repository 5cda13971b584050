use std::path::{Path, PathBuf};

use error_stack::{Report, Result};

use crate::config::{Configuration, Overrides};
use crate::device::parse_devices_json;
use crate::error::ArgumentError;
use crate::service::RunMode;

const CONFIG_FILE: &str = "config.yml";
const DEFAULT_CONFIG_FILE: &str = "default_config.yml";

// Long options also accepted in their historical underscore spelling
const UNDERSCORE_LONGS: &[&str] = &["mqtt_auto_discovery_topic", "data_dir"];

/// Rewrite `--data_dir` style arguments to the dashed form the parser knows.
/// Everything after a bare `--` is left alone.
pub fn normalize_args<I>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut options_ended = false;

    args.into_iter()
        .map(|arg| {
            if options_ended {
                return arg;
            }
            if arg == "--" {
                options_ended = true;
                return arg;
            }

            let Some(long) = arg.strip_prefix("--") else {
                return arg;
            };
            let (name, value) = match long.split_once('=') {
                Some((name, value)) => (name, Some(value)),
                None => (long, None),
            };
            if !UNDERSCORE_LONGS.contains(&name) {
                return arg;
            }

            let name = name.replace('_', "-");
            match value {
                Some(value) => format!("--{name}={value}"),
                None => format!("--{name}"),
            }
        })
        .collect()
}

/// Command line, as parsed in `main`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Options {
    pub dump_ha_config: bool,
    pub mqtt_auto_discovery_topic: Option<String>,
    pub background: bool,
    pub discover_dump: bool,
    pub mqtt_server: Option<String>,
    pub mqtt_port: Option<u16>,
    pub mqtt_user: Option<String>,
    pub mqtt_password: Option<String>,
    pub discover: bool,
    pub debug: bool,
    pub version: bool,
    pub data_dir: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub test: bool,
    pub devices: Option<String>,
}

impl Options {
    pub fn run_mode(&self) -> RunMode {
        if self.version {
            RunMode::Version
        } else if self.discover_dump {
            RunMode::DiscoverAndDump
        } else if self.test {
            RunMode::Test
        } else {
            RunMode::Run {
                dump_ha_config: self.dump_ha_config,
            }
        }
    }

    /// Overrides given on the command line. Fails on a malformed `--devices` list.
    pub fn overrides(&self) -> Result<Overrides, ArgumentError> {
        let devices = match self.devices.as_deref().filter(|d| !d.is_empty()) {
            Some(json) => Some(parse_devices_json(json)?),
            None => None,
        };

        Ok(Overrides {
            mqtt_host: non_empty(&self.mqtt_server),
            mqtt_port: self.mqtt_port.filter(|port| *port != 0),
            mqtt_user: non_empty(&self.mqtt_user),
            mqtt_password: non_empty(&self.mqtt_password),
            auto_discovery_topic: non_empty(&self.mqtt_auto_discovery_topic),
            devices,
        })
    }

    /// Locate the config file: `--config` when given, otherwise `config.yml` in
    /// the data directory, falling back to `default_config.yml`.
    pub fn config_path(&self, working_dir: &Path) -> Result<PathBuf, ArgumentError> {
        let data_dir = match &self.data_dir {
            Some(dir) if dir.exists() => dir.clone(),
            Some(dir) => return Err(Report::new(ArgumentError::DataDirNotFound(dir.display().to_string()))),
            None => working_dir.to_path_buf(),
        };

        match &self.config {
            Some(path) if path.exists() => Ok(path.clone()),
            Some(path) => Err(Report::new(ArgumentError::ConfigNotFound(path.display().to_string()))),
            None => {
                let config = data_dir.join(CONFIG_FILE);
                if config.exists() {
                    Ok(config)
                } else {
                    Ok(data_dir.join(DEFAULT_CONFIG_FILE))
                }
            }
        }
    }

    /// Flags that switch features on regardless of the file.
    pub fn apply_flags(&self, config: &mut Configuration) {
        if self.discover {
            config.self_discovery = true;
        }
        if self.background {
            config.daemon_mode = true;
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.clone().filter(|v| !v.is_empty())
}
