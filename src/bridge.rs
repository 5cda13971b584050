use std::collections::HashMap;

use error_stack::{Report, Result, ResultExt};
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use log::{debug, error, info, warn};

use crate::{
    broadlink::{self, HelloReply, AC_DEVICE_TYPES},
    config::Configuration,
    device::{AcDevice, DeviceDescriptor, Devices},
    error::BridgeError,
    get_version, hass, topics,
};

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const MQTT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MQTT_CLOSE_TIMEOUT: Duration = Duration::from_secs(3);
const MQTT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(2);
const MQTT_ERROR_DELAY: Duration = Duration::from_secs(5);

/// Device and MQTT operations the service drives.
pub trait AcBridge {
    /// Find controllers on the local network, keyed by device id.
    async fn discover(&mut self) -> Result<Devices, BridgeError>;

    /// Turn statically configured descriptors into device handles.
    fn make_device_objects(&mut self, descriptors: &[DeviceDescriptor]) -> Result<Devices, BridgeError>;

    async fn connect_mqtt(&mut self) -> Result<(), BridgeError>;

    async fn publish_mqtt_auto_discovery(&mut self, devices: &Devices) -> Result<(), BridgeError>;

    /// Home-Assistant manual configuration for `devices`, as YAML text.
    fn dump_homeassistant_config_from_devices(&self, devices: &Devices) -> Result<String, BridgeError>;

    /// Run one service iteration: poll every device and publish what changed.
    async fn start(&mut self, config: &Configuration, devices: &Devices) -> Result<(), BridgeError>;

    /// Send one probe to every configured device and describe the outcome.
    async fn test(&mut self, config: &Configuration) -> Result<String, BridgeError>;

    /// Release the MQTT session. Safe to call when never connected.
    async fn stop(&mut self);
}

struct MqttSession {
    client: AsyncClient,
    worker: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Snapshot published on a device's state topic.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceState {
    pub name: String,
    pub mac: String,
    pub ip: String,
    pub port: u16,
    pub model: String,
    pub device_type: u16,
    pub online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked: Option<bool>,
}

impl DeviceState {
    pub fn new(device: &AcDevice, reply: Option<&HelloReply>) -> Self {
        DeviceState {
            name: device.descriptor.name.clone(),
            mac: device.id(),
            ip: device.descriptor.ip.to_string(),
            port: device.descriptor.port,
            model: device.model.clone(),
            device_type: device.device_type,
            online: reply.is_some(),
            locked: reply.map(|r| r.locked),
        }
    }

    pub fn availability(&self) -> &'static str {
        if self.online {
            topics::ONLINE
        } else {
            topics::OFFLINE
        }
    }
}

pub struct Bridge {
    config: Configuration,
    session: Option<MqttSession>,
    published: HashMap<String, Vec<u8>>,
}

impl Bridge {
    pub fn new(config: Configuration) -> Self {
        Bridge {
            config,
            session: None,
            published: HashMap::new(),
        }
    }

    fn device_from_reply(reply: &HelloReply) -> AcDevice {
        let mac = reply.mac_string();
        let name = if reply.name.is_empty() {
            mac.clone()
        } else {
            reply.name.clone()
        };

        AcDevice {
            descriptor: DeviceDescriptor {
                name,
                ip: reply.address.ip(),
                port: reply.address.port(),
                mac,
            },
            device_type: reply.device_type,
            model: broadlink::model_name(reply.device_type),
        }
    }

    /// Queue a message for the broker. The request queue stops draining while
    /// the broker is unreachable, so waiting for room is bounded.
    async fn publish(&self, topic: &str, retain: bool, payload: Vec<u8>) -> Result<(), BridgeError> {
        let session = self.session.as_ref().ok_or(BridgeError::NotConnected)?;
        let context = || BridgeError::Context(format!("Publishing to topic {topic}"));

        debug!("Publishing to topic {topic}: {}", String::from_utf8_lossy(&payload));
        tokio::time::timeout(
            MQTT_PUBLISH_TIMEOUT,
            session.client.publish(topic, QoS::AtLeastOnce, retain, payload),
        )
        .await
        .change_context_lazy(context)?
        .change_context_lazy(context)
    }

    async fn publish_device_state(&mut self, prefix: &str, id: &str, state: &DeviceState) -> Result<(), BridgeError> {
        let payload = serde_json::to_vec(state).change_context(BridgeError::Serialization)?;

        self.publish_if_modified(topics::device_availability(prefix, id), state.availability().into())
            .await?;
        self.publish_if_modified(topics::device_state(prefix, id), payload).await
    }

    async fn publish_if_modified(&mut self, topic: String, payload: Vec<u8>) -> Result<(), BridgeError> {
        if self.published.get(&topic) == Some(&payload) {
            return Ok(());
        }

        self.publish(&topic, true, payload.clone()).await?;
        self.published.insert(topic, payload);
        Ok(())
    }

    async fn mqtt_event_worker(
        mut event_loop: EventLoop,
        connected: oneshot::Sender<std::result::Result<(), String>>,
        cancel: CancellationToken,
    ) {
        let mut connected = Some(connected);

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = event_loop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    debug!("MQTT connection acknowledged: {ack:?}");
                    if let Some(connected) = connected.take() {
                        let _ = connected.send(Ok(()));
                    }
                }

                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    debug!("MQTT disconnect sent");
                    break;
                }

                Ok(_) => {}

                Err(e) => {
                    if let Some(connected) = connected.take() {
                        let _ = connected.send(Err(e.to_string()));
                        break;
                    }

                    // The event loop reconnects on the next poll
                    error!("MQTT connection error: {e}");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(MQTT_ERROR_DELAY) => {}
                    }
                }
            }
        }

        info!("MQTT event loop finished");
    }
}

impl AcBridge for Bridge {
    async fn discover(&mut self) -> Result<Devices, BridgeError> {
        let replies = broadlink::discover(self.config.bind_to_ip, DISCOVERY_TIMEOUT)
            .await
            .change_context(BridgeError::Discovery)?;

        let devices: Devices = replies
            .iter()
            .filter(|reply| {
                if !reply.is_air_conditioner() {
                    debug!(
                        "Skipping {} at {}: device type 0x{:04x} is not an air conditioner",
                        reply.name, reply.address, reply.device_type
                    );
                }
                reply.is_air_conditioner()
            })
            .map(Bridge::device_from_reply)
            .map(|device| (device.id(), device))
            .collect();

        info!("Discovered {} device(s)", devices.len());
        Ok(devices)
    }

    fn make_device_objects(&mut self, descriptors: &[DeviceDescriptor]) -> Result<Devices, BridgeError> {
        if descriptors.is_empty() {
            warn!("No devices configured");
        }

        let mut devices = Devices::new();
        for descriptor in descriptors {
            let id = descriptor.device_id();
            if id.is_empty() {
                return Err(Report::new(BridgeError::InvalidDevice(
                    descriptor.name.clone(),
                    format!("invalid mac address '{}'", descriptor.mac),
                )));
            }

            let device = AcDevice {
                descriptor: descriptor.clone(),
                device_type: AC_DEVICE_TYPES[0],
                model: broadlink::model_name(AC_DEVICE_TYPES[0]),
            };

            if devices.insert(id.clone(), device).is_some() {
                warn!("Device {id} configured more than once, using the last entry");
            }
        }

        Ok(devices)
    }

    async fn connect_mqtt(&mut self) -> Result<(), BridgeError> {
        let mqtt = &self.config.mqtt;
        let into_context =
            || BridgeError::Context(format!("Connecting to MQTT broker '{}:{}'", mqtt.host, mqtt.port));

        let availability_topic = topics::bridge_availability(&mqtt.topic_prefix);
        let last_will = LastWill::new(&availability_topic, topics::OFFLINE, QoS::AtLeastOnce, true);

        let mut mqtt_options = MqttOptions::new(&mqtt.client_id, &mqtt.host, mqtt.port);
        mqtt_options
            .set_keep_alive(Duration::from_secs(30))
            .set_last_will(last_will);
        if let Some(user) = &mqtt.user {
            mqtt_options.set_credentials(user, mqtt.password.clone().unwrap_or_default());
        }

        info!("Connecting to MQTT broker {}:{} as {}", mqtt.host, mqtt.port, mqtt.client_id);
        let (client, event_loop) = AsyncClient::new(mqtt_options, 10);
        let cancel = CancellationToken::new();
        let (connected_tx, connected_rx) = oneshot::channel();
        let worker = tokio::spawn(Bridge::mqtt_event_worker(event_loop, connected_tx, cancel.clone()));

        let failure = match tokio::time::timeout(MQTT_CONNECT_TIMEOUT, connected_rx).await {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(reason))) => Some(reason),
            Ok(Err(_)) => Some("event loop stopped".to_string()),
            Err(_) => Some(format!("no answer within {MQTT_CONNECT_TIMEOUT:?}")),
        };

        if let Some(reason) = failure {
            cancel.cancel();
            let _ = worker.await;
            return Err(Report::new(BridgeError::MqttConnection(reason)).change_context(into_context()));
        }

        client
            .publish(&availability_topic, QoS::AtLeastOnce, true, topics::ONLINE)
            .await
            .change_context_lazy(into_context)?;
        client
            .publish(
                topics::bridge_version(&mqtt.topic_prefix),
                QoS::AtLeastOnce,
                true,
                get_version().as_bytes(),
            )
            .await
            .change_context_lazy(into_context)?;

        info!("Connected to MQTT broker");
        self.session = Some(MqttSession {
            client,
            worker,
            cancel,
        });
        Ok(())
    }

    async fn publish_mqtt_auto_discovery(&mut self, devices: &Devices) -> Result<(), BridgeError> {
        let Some(discovery_prefix) = self.config.mqtt.auto_discovery_topic.as_deref() else {
            return Ok(());
        };

        let messages = hass::discovery_messages(discovery_prefix, devices, &self.config)
            .change_context(BridgeError::Serialization)?;
        let retain = self.config.mqtt.auto_discovery_topic_retain;

        for (topic, payload) in messages {
            self.publish(&topic, retain, payload).await?;
        }

        info!("Published auto discovery for {} device(s) under {discovery_prefix}", devices.len());
        Ok(())
    }

    fn dump_homeassistant_config_from_devices(&self, devices: &Devices) -> Result<String, BridgeError> {
        hass::manual_config(devices, &self.config).change_context(BridgeError::Serialization)
    }

    async fn start(&mut self, config: &Configuration, devices: &Devices) -> Result<(), BridgeError> {
        let prefix = &config.mqtt.topic_prefix;

        for (id, device) in devices {
            let reply = match broadlink::probe(config.bind_to_ip, device.descriptor.address(), PROBE_TIMEOUT).await {
                Ok(reply) => reply,
                Err(e) => {
                    warn!("Probing {} ({}) failed: {e:?}", device.descriptor.name, device.descriptor.address());
                    None
                }
            };

            let state = DeviceState::new(device, reply.as_ref());
            debug!("Device {id} state: {state:?}");

            // Unpublished state is retried on the next iteration
            if let Err(e) = self.publish_device_state(prefix, id, &state).await {
                warn!("Cannot publish state of {id}: {}", e.current_context());
                debug!("{e:?}");
            }
        }

        Ok(())
    }

    async fn test(&mut self, config: &Configuration) -> Result<String, BridgeError> {
        let devices = self.make_device_objects(&config.devices)?;
        if devices.is_empty() {
            return Ok("No devices configured to test".to_string());
        }

        let mut lines = Vec::new();
        for device in devices.values() {
            let address = device.descriptor.address();
            let line = match broadlink::probe(config.bind_to_ip, address, PROBE_TIMEOUT).await {
                Ok(Some(reply)) => format!(
                    "{} ({address}): replied as '{}', type 0x{:04x}, mac {}",
                    device.descriptor.name,
                    reply.name,
                    reply.device_type,
                    reply.mac_string()
                ),
                Ok(None) => format!("{} ({address}): no reply", device.descriptor.name),
                Err(e) => format!("{} ({address}): probe failed: {}", device.descriptor.name, e.current_context()),
            };
            lines.push(line);
        }

        Ok(lines.join("\n"))
    }

    async fn stop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        info!("Closing MQTT session");
        let availability_topic = topics::bridge_availability(&self.config.mqtt.topic_prefix);
        let close = async {
            session
                .client
                .publish(availability_topic, QoS::AtLeastOnce, true, topics::OFFLINE)
                .await?;
            session.client.disconnect().await
        };

        match tokio::time::timeout(MQTT_CLOSE_TIMEOUT, close).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("Failed to close MQTT session: {e}");
                session.cancel.cancel();
            }
            Err(_) => {
                warn!("MQTT broker did not take the disconnect in time, dropping the session");
                session.cancel.cancel();
            }
        }

        let mut worker = session.worker;
        if tokio::time::timeout(MQTT_CLOSE_TIMEOUT, &mut worker).await.is_err() {
            warn!("MQTT event loop did not finish in time, cancelling");
            session.cancel.cancel();
            let _ = worker.await;
        }
    }
}
