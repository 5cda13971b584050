use std::io::Write;

use error_stack::{Result, ResultExt};
use tokio_util::sync::CancellationToken;

use log::{debug, error, info};

use crate::{
    bridge::AcBridge,
    config::Configuration,
    device::{devices_yaml, DeviceDescriptor, Devices},
    error::BridgeError,
    get_version,
};

pub const NO_DEVICES_FOUND: &str =
    "No devices found, make sure you are on same network broadcast segment as device/s";
const START_COPY: &str = "*********** start copy below ************";
const STOP_COPY: &str = "*********** stop copy above ************";

/// What the process was asked to do; chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Version,
    DiscoverAndDump,
    Test,
    Run { dump_ha_config: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    NoDevicesFound,
}

pub fn version_line() -> String {
    format!("Monitor Version: {}", get_version())
}

pub struct Service<B: AcBridge> {
    bridge: B,
    shutdown: CancellationToken,
}

impl<B: AcBridge> Service<B> {
    pub fn new(bridge: B, shutdown: CancellationToken) -> Self {
        Service { bridge, shutdown }
    }

    /// Execute `mode`, then stop the bridge. The bridge is stopped exactly once,
    /// whether the mode completed, failed, or was interrupted.
    pub async fn run(mut self, mode: RunMode, config: &Configuration, out: &mut dyn Write) -> Result<Outcome, BridgeError> {
        let result = match mode {
            RunMode::Version => write_text(out, &version_line()).map(|_| Outcome::Completed),
            RunMode::DiscoverAndDump => self.discover_and_dump(out).await,
            RunMode::Test => self.test(config, out).await,
            RunMode::Run { dump_ha_config } => self.serve(config, dump_ha_config, out).await,
        };

        if let Err(report) = &result {
            error!("{}", report.current_context());
            debug!("{report:?}");
        }

        info!("Stopping");
        self.bridge.stop().await;
        result
    }

    async fn discover_and_dump(&mut self, out: &mut dyn Write) -> Result<Outcome, BridgeError> {
        let devices = self.bridge.discover().await?;

        if devices.is_empty() {
            write_text(out, NO_DEVICES_FOUND)?;
            return Ok(Outcome::NoDevicesFound);
        }

        let descriptors: Vec<DeviceDescriptor> = devices.values().map(|d| d.descriptor.clone()).collect();
        let yaml = devices_yaml(&descriptors).change_context(BridgeError::Serialization)?;

        write_text(out, START_COPY)?;
        write_text(out, &yaml)?;
        write_text(out, STOP_COPY)?;
        Ok(Outcome::Completed)
    }

    async fn test(&mut self, config: &Configuration, out: &mut dyn Write) -> Result<Outcome, BridgeError> {
        let report = self.bridge.test(config).await?;
        write_text(out, &report)?;
        Ok(Outcome::Completed)
    }

    async fn serve(&mut self, config: &Configuration, dump_ha_config: bool, out: &mut dyn Write) -> Result<Outcome, BridgeError> {
        info!("Starting Monitor...");
        self.bridge.connect_mqtt().await?;

        let devices = if config.self_discovery {
            self.bridge.discover().await?
        } else {
            self.bridge.make_device_objects(&config.devices)?
        };

        if dump_ha_config {
            let yaml = self.bridge.dump_homeassistant_config_from_devices(&devices)?;
            write_text(out, &yaml)?;
            return Ok(Outcome::Completed);
        }

        if config.mqtt.auto_discovery_topic.is_some() {
            self.bridge.publish_mqtt_auto_discovery(&devices).await?;
        }

        debug!("Starting main loop with {} device(s)", devices.len());
        while !self.shutdown.is_cancelled() {
            self.iteration(config, &devices).await?;

            if !config.daemon_mode {
                break;
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(config.update_interval) => {}
            }
        }

        Ok(Outcome::Completed)
    }

    /// One bridge iteration. A shutdown request does not interrupt it.
    async fn iteration(&mut self, config: &Configuration, devices: &Devices) -> Result<(), BridgeError> {
        let iteration = self.bridge.start(config, devices);
        tokio::pin!(iteration);

        tokio::select! {
            result = &mut iteration => result,
            _ = self.shutdown.cancelled() => {
                info!("Waiting for the current iteration to finish");
                iteration.await
            }
        }
    }
}

fn write_text(out: &mut dyn Write, text: &str) -> Result<(), BridgeError> {
    let text = text.trim_end_matches('\n');
    writeln!(out, "{text}").change_context(BridgeError::Output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::device::AcDevice;
    use error_stack::Report;
    use std::sync::{Arc, Mutex};
    use tokio::sync::Notify;
    use tokio::time::Duration;

    #[derive(Default)]
    struct MockBridge {
        calls: Arc<Mutex<Vec<String>>>,
        discovered: Devices,
        iteration_delay: Duration,
        iteration_started: Option<Arc<Notify>>,
        fail_start: bool,
        cancel_after: Option<(usize, CancellationToken)>,
        starts: usize,
    }

    impl MockBridge {
        fn record(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_string());
        }
    }

    impl AcBridge for MockBridge {
        async fn discover(&mut self) -> Result<Devices, BridgeError> {
            self.record("discover");
            Ok(self.discovered.clone())
        }

        fn make_device_objects(&mut self, descriptors: &[DeviceDescriptor]) -> Result<Devices, BridgeError> {
            self.record("make_device_objects");
            Ok(descriptors
                .iter()
                .map(|d| {
                    let device = AcDevice {
                        descriptor: d.clone(),
                        device_type: 0x4e2a,
                        model: "Air Conditioner".to_string(),
                    };
                    (device.id(), device)
                })
                .collect())
        }

        async fn connect_mqtt(&mut self) -> Result<(), BridgeError> {
            self.record("connect_mqtt");
            Ok(())
        }

        async fn publish_mqtt_auto_discovery(&mut self, _devices: &Devices) -> Result<(), BridgeError> {
            self.record("publish_mqtt_auto_discovery");
            Ok(())
        }

        fn dump_homeassistant_config_from_devices(&self, devices: &Devices) -> Result<String, BridgeError> {
            self.record("dump_homeassistant_config");
            Ok(format!("ha config for {} device(s)\n", devices.len()))
        }

        async fn start(&mut self, _config: &Configuration, _devices: &Devices) -> Result<(), BridgeError> {
            self.record("start");
            self.starts += 1;
            if let Some(notify) = &self.iteration_started {
                notify.notify_one();
            }
            tokio::time::sleep(self.iteration_delay).await;
            self.record("start finished");

            if let Some((count, token)) = &self.cancel_after {
                if self.starts >= *count {
                    token.cancel();
                }
            }
            if self.fail_start {
                return Err(Report::new(BridgeError::Context("device exploded".to_string())));
            }
            Ok(())
        }

        async fn test(&mut self, _config: &Configuration) -> Result<String, BridgeError> {
            self.record("test");
            Ok("Bedroom: replied".to_string())
        }

        async fn stop(&mut self) {
            self.record("stop");
        }
    }

    fn config(daemon_mode: bool, extra: &str) -> Configuration {
        parse_config(
            &format!(
                r#"
service:
  daemon_mode: {daemon_mode}
  update_interval: 0.01
  self_discovery: false
mqtt:
  topic_prefix: aircon
{extra}
devices:
  - name: Bedroom
    ip: 192.168.1.20
    mac: 34ea34aabbcc
"#
            ),
            "test",
        )
        .unwrap()
    }

    fn calls(calls: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
        calls.lock().unwrap().clone()
    }

    async fn run(bridge: MockBridge, shutdown: CancellationToken, mode: RunMode, config: &Configuration) -> (Result<Outcome, BridgeError>, String) {
        let mut out = Vec::new();
        let result = Service::new(bridge, shutdown).run(mode, config, &mut out).await;
        (result, String::from_utf8(out).unwrap())
    }

    #[tokio::test]
    async fn test_version_mode() {
        let bridge = MockBridge::default();
        let log = bridge.calls.clone();

        let (result, out) = run(bridge, CancellationToken::new(), RunMode::Version, &config(false, "")).await;

        assert_eq!(result.unwrap(), Outcome::Completed);
        assert!(out.contains(env!("CARGO_PKG_VERSION")));
        assert_eq!(calls(&log), ["stop"]);
    }

    #[tokio::test]
    async fn test_discover_and_dump_without_devices() {
        let bridge = MockBridge::default();
        let log = bridge.calls.clone();

        let (result, out) = run(bridge, CancellationToken::new(), RunMode::DiscoverAndDump, &config(false, "")).await;

        assert_eq!(result.unwrap(), Outcome::NoDevicesFound);
        assert!(out.contains(NO_DEVICES_FOUND));
        assert_eq!(calls(&log), ["discover", "stop"]);
    }

    #[tokio::test]
    async fn test_discover_and_dump() {
        let config = config(false, "");
        let mut bridge = MockBridge::default();
        bridge.discovered = bridge.make_device_objects(&config.devices).unwrap();

        let (result, out) = run(bridge, CancellationToken::new(), RunMode::DiscoverAndDump, &config).await;

        assert_eq!(result.unwrap(), Outcome::Completed);
        let start = out.find(START_COPY).unwrap();
        let stop = out.find(STOP_COPY).unwrap();
        let fragment = &out[start + START_COPY.len()..stop];
        assert!(fragment.contains("devices:"));
        assert!(fragment.contains("name: Bedroom"));
    }

    #[tokio::test]
    async fn test_test_mode() {
        let bridge = MockBridge::default();
        let log = bridge.calls.clone();

        let (result, out) = run(bridge, CancellationToken::new(), RunMode::Test, &config(false, "")).await;

        assert_eq!(result.unwrap(), Outcome::Completed);
        assert!(out.contains("Bedroom: replied"));
        assert_eq!(calls(&log), ["test", "stop"]);
    }

    #[tokio::test]
    async fn test_single_pass_without_daemon_mode() {
        let bridge = MockBridge::default();
        let log = bridge.calls.clone();

        let mode = RunMode::Run { dump_ha_config: false };
        let (result, _) = run(bridge, CancellationToken::new(), mode, &config(false, "")).await;

        assert_eq!(result.unwrap(), Outcome::Completed);
        assert_eq!(
            calls(&log),
            ["connect_mqtt", "make_device_objects", "start", "start finished", "stop"]
        );
    }

    #[tokio::test]
    async fn test_self_discovery_and_auto_discovery() {
        let mut config = config(false, "  auto_discovery_topic: homeassistant");
        config.self_discovery = true;

        let bridge = MockBridge::default();
        let log = bridge.calls.clone();

        let mode = RunMode::Run { dump_ha_config: false };
        let (result, _) = run(bridge, CancellationToken::new(), mode, &config).await;

        assert!(result.is_ok());
        assert_eq!(
            calls(&log),
            ["connect_mqtt", "discover", "publish_mqtt_auto_discovery", "start", "start finished", "stop"]
        );
    }

    #[tokio::test]
    async fn test_dump_ha_config() {
        let bridge = MockBridge::default();
        let log = bridge.calls.clone();

        let mode = RunMode::Run { dump_ha_config: true };
        let (result, out) = run(bridge, CancellationToken::new(), mode, &config(true, "")).await;

        assert_eq!(result.unwrap(), Outcome::Completed);
        assert!(out.contains("ha config for 1 device(s)"));
        assert_eq!(
            calls(&log),
            ["connect_mqtt", "make_device_objects", "dump_homeassistant_config", "stop"]
        );
    }

    #[tokio::test]
    async fn test_daemon_mode_repeats_until_shutdown() {
        let shutdown = CancellationToken::new();
        let bridge = MockBridge {
            cancel_after: Some((3, shutdown.clone())),
            ..Default::default()
        };
        let log = bridge.calls.clone();

        let mode = RunMode::Run { dump_ha_config: false };
        let (result, _) = run(bridge, shutdown, mode, &config(true, "")).await;

        assert!(result.is_ok());
        let log = calls(&log);
        assert_eq!(log.iter().filter(|c| *c == "start").count(), 3);
        assert_eq!(log.iter().filter(|c| *c == "stop").count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_iteration() {
        let shutdown = CancellationToken::new();
        let started = Arc::new(Notify::new());
        let bridge = MockBridge {
            iteration_delay: Duration::from_millis(200),
            iteration_started: Some(started.clone()),
            ..Default::default()
        };
        let log = bridge.calls.clone();

        let canceller = shutdown.clone();
        tokio::spawn(async move {
            started.notified().await;
            canceller.cancel();
        });

        let mode = RunMode::Run { dump_ha_config: false };
        let (result, _) = run(bridge, shutdown, mode, &config(true, "")).await;

        assert!(result.is_ok());
        assert_eq!(
            calls(&log),
            ["connect_mqtt", "make_device_objects", "start", "start finished", "stop"]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sigterm_stops_daemon_once() {
        use nix::sys::signal::{raise, Signal};

        let shutdown = CancellationToken::new();
        let listener = crate::signals::spawn_signal_listener(shutdown.clone());
        let started = Arc::new(Notify::new());
        let bridge = MockBridge {
            iteration_delay: Duration::from_millis(500),
            iteration_started: Some(started.clone()),
            ..Default::default()
        };
        let log = bridge.calls.clone();

        tokio::spawn(async move {
            started.notified().await;
            raise(Signal::SIGTERM).unwrap();
        });

        let mode = RunMode::Run { dump_ha_config: false };
        let (result, _) = run(bridge, shutdown.clone(), mode, &config(true, "")).await;

        assert!(result.is_ok());
        assert!(shutdown.is_cancelled());
        assert_eq!(
            calls(&log),
            ["connect_mqtt", "make_device_objects", "start", "start finished", "stop"]
        );
        tokio::time::timeout(Duration::from_secs(1), listener)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_iteration_still_stops_once() {
        let bridge = MockBridge {
            fail_start: true,
            ..Default::default()
        };
        let log = bridge.calls.clone();

        let mode = RunMode::Run { dump_ha_config: false };
        let (result, _) = run(bridge, CancellationToken::new(), mode, &config(true, "")).await;

        let report = result.unwrap_err();
        assert!(matches!(report.current_context(), BridgeError::Context(_)));
        let log = calls(&log);
        assert_eq!(log.iter().filter(|c| *c == "start").count(), 1);
        assert_eq!(log.last().map(String::as_str), Some("stop"));
        assert_eq!(log.iter().filter(|c| *c == "stop").count(), 1);
    }

    #[tokio::test]
    async fn test_no_iteration_after_early_shutdown() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let bridge = MockBridge::default();
        let log = bridge.calls.clone();

        let mode = RunMode::Run { dump_ha_config: false };
        let (result, _) = run(bridge, shutdown, mode, &config(true, "")).await;

        assert!(result.is_ok());
        assert_eq!(calls(&log), ["connect_mqtt", "make_device_objects", "stop"]);
    }
}
