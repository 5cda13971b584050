mod bridge;
mod broadlink;
mod config;
mod device;
mod error;
mod hass;
mod logging;
mod options;
mod service;
mod signals;
mod topics;

use std::path::PathBuf;
use std::process::ExitCode;

use log::debug;
use rustop::opts;
use tokio_util::sync::CancellationToken;

use bridge::Bridge;
use config::Overrides;
use options::Options;
use service::{Outcome, RunMode, Service};

#[allow(dead_code)]
mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub fn get_version() -> String {
    format!("{} (built {})", built_info::PKG_VERSION, built_info::BUILT_TIME_UTC)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli_args = options::normalize_args(std::env::args().skip(1));
    let parsed = opts! {
        synopsis "Aircon To MQTT: publishes Broadlink air-conditioner controllers to an MQTT broker";
        command_name env!("CARGO_PKG_NAME");
        auto_shorts false;
        opt dumphaconfig:bool, desc:"Dump the devices as a HA manual config entry";
        opt mqtt_auto_discovery_topic:Option<String>,
            desc:"If specified, send the MQTT autodiscovery config for all devices to this topic [env MQTT_AUTO_DISCOVERY_TOPIC]";
        opt background:bool, short:'b', desc:"Run in background (daemon mode)";
        opt discoverdump:bool, short:'S', desc:"Discover devices and dump config";
        opt mqttserver:Option<String>, desc:"Mqtt Server [env MQTT_HOST]";
        opt mqttport:Option<u16>, desc:"Mqtt Port [env MQTT_PORT]";
        opt mqttuser:Option<String>, desc:"Mqtt User [env MQTT_USERNAME]";
        opt mqttpassword:Option<String>, desc:"Mqtt Password [env MQTT_PASSWORD]";
        opt discover:bool, short:'s', desc:"Discover devices";
        opt debug:bool, short:'d', desc:"Set logging level to debug";
        opt version:bool, short:'v', desc:"Print version";
        opt data_dir:Option<String>, desc:"Data folder -- defaults to the current directory";
        opt config:Option<String>, short:'c', desc:"Config file path -- defaults to <data_dir>/config.yml";
        opt logfile:Option<String>, short:'l', desc:"Logfile path";
        opt test:bool, short:'T', desc:"Send a test probe to the configured devices";
        opt devices:Option<String>, short:'D',
            desc:"Devices config in JSON format, example: [{\"ip\":\"<ip>\",\"mac\":\"<mac>\",\"name\":\"<name>\",\"port\":<port>}] [env DEVICES]";
    }
    .parse_args(cli_args.iter().map(String::as_str));

    let (args, _) = match parsed {
        Ok(parsed) => parsed,
        Err(rustop::Error::Help(help)) => {
            println!("{help}");
            return ExitCode::SUCCESS;
        }
        Err(e) => rustop::error_and_exit(&e),
    };

    let options = Options {
        dump_ha_config: args.dumphaconfig,
        mqtt_auto_discovery_topic: args.mqtt_auto_discovery_topic,
        background: args.background,
        discover_dump: args.discoverdump,
        mqtt_server: args.mqttserver,
        mqtt_port: args.mqttport,
        mqtt_user: args.mqttuser,
        mqtt_password: args.mqttpassword,
        discover: args.discover,
        debug: args.debug,
        version: args.version,
        data_dir: args.data_dir.map(PathBuf::from),
        config: args.config.map(PathBuf::from),
        log_file: args.logfile.map(PathBuf::from),
        test: args.test,
        devices: args.devices,
    };

    let cli_overrides = match options.overrides() {
        Ok(overrides) => overrides,
        Err(report) => {
            eprintln!("{}", report.current_context());
            return ExitCode::FAILURE;
        }
    };

    let mode = options.run_mode();
    if mode == RunMode::Version {
        println!("{}", service::version_line());
        return ExitCode::SUCCESS;
    }

    // Logging is not up yet, and RUST_LOG may come from .env
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Ignoring malformed .env file: {e}");
        }
    }
    let env_overrides = match Overrides::from_env(|key| std::env::var(key).ok()) {
        Ok(overrides) => overrides,
        Err(report) => {
            eprintln!("{}", report.current_context());
            return ExitCode::FAILURE;
        }
    };

    let working_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let config_path = match options.config_path(&working_dir) {
        Ok(path) => path,
        Err(report) => {
            eprintln!("{}", report.current_context());
            return ExitCode::FAILURE;
        }
    };

    // Held until exit so the file writer flushes
    let _log_guard = match logging::init_logging(options.debug, options.log_file.as_deref()) {
        Ok(guard) => guard,
        Err(report) => {
            eprintln!("{report:?}");
            return ExitCode::FAILURE;
        }
    };

    debug!("{} {} is starting up", env!("CARGO_PKG_NAME"), get_version());
    debug!("Loading config from {}", config_path.display());

    let mut config = match config::load_config(&config_path) {
        Ok(config) => config,
        Err(report) => {
            eprintln!("{report:?}");
            return ExitCode::FAILURE;
        }
    };
    config.apply_overrides(cli_overrides.or(env_overrides));
    options.apply_flags(&mut config);

    let shutdown = CancellationToken::new();
    let signal_listener = signals::spawn_signal_listener(shutdown.clone());

    let service = Service::new(Bridge::new(config.clone()), shutdown.clone());
    let result = service.run(mode, &config, &mut std::io::stdout()).await;

    shutdown.cancel();
    let _ = signal_listener.await;

    match result {
        Ok(Outcome::Completed) => ExitCode::SUCCESS,
        Ok(Outcome::NoDevicesFound) | Err(_) => ExitCode::FAILURE,
    }
}
