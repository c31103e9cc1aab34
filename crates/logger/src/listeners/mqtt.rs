//! Publish readings to an MQTT broker following the Homie convention
//!
//! Every publish round sends the device attributes followed by one node per
//! sensor seen so far, under `<mqtt_base_topic>/<mqtt_device>`:
//!
//! ```text
//! homie/arexx-logger/$nodes                         sensor_2,sensor_3
//! homie/arexx-logger/sensor_2/$properties           temperature
//! homie/arexx-logger/sensor_2/temperature/$unit     °C
//! homie/arexx-logger/sensor_2/temperature           20.00
//! ```
//!
//! Rounds are throttled to one per publish interval; readings arriving in
//! between only update the latest value of their sensor.

use super::{ListenerContext, ListenerParams, port_param, string_param};
use anyhow::Context;
use common::{DataListener, DataPoint, Error, Result};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 1883;
pub const DEFAULT_PUBLISH_INTERVAL: Duration = Duration::from_secs(4);

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const REQUEST_CAPACITY: usize = 256;

/// Sink for outgoing MQTT messages
pub trait MqttPublish: Send + Sync {
    fn publish(&self, topic: &str, payload: String) -> anyhow::Result<()>;
}

impl MqttPublish for AsyncClient {
    fn publish(&self, topic: &str, payload: String) -> anyhow::Result<()> {
        self.try_publish(topic, QoS::AtMostOnce, false, payload)
            .with_context(|| format!("Failed to queue message for '{}'", topic))
    }
}

/// Homie device attributes
#[derive(Debug, Clone, PartialEq)]
pub struct HomieDevice {
    pub base_topic: String,
    pub device: String,
    pub device_name: String,
    pub convention_version: String,
}

impl Default for HomieDevice {
    fn default() -> Self {
        Self {
            base_topic: "homie".to_string(),
            device: "arexx-logger".to_string(),
            device_name: "Arexx Multilogger".to_string(),
            convention_version: "3.0".to_string(),
        }
    }
}

impl HomieDevice {
    pub fn topic_root(&self) -> String {
        format!("{}/{}", self.base_topic, self.device)
    }

    fn from_params(params: &ListenerParams) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            base_topic: string_param(params, "mqtt_base_topic", &defaults.base_topic)?,
            device: string_param(params, "mqtt_device", &defaults.device)?,
            device_name: string_param(params, "mqtt_device_name", &defaults.device_name)?,
            convention_version: string_param(
                params,
                "homie_convention_version",
                &defaults.convention_version,
            )?,
        })
    }
}

/// Topic and payload pairs for one publish round, sensors ordered by id
pub fn homie_messages(
    device: &HomieDevice,
    latest: &BTreeMap<u16, Arc<DataPoint>>,
) -> Vec<(String, String)> {
    let root = device.topic_root();
    let nodes: Vec<String> = latest.keys().map(|id| format!("sensor_{}", id)).collect();

    let mut messages = vec![
        (format!("{}/$homie", root), device.convention_version.clone()),
        (format!("{}/$name", root), device.device_name.clone()),
        (format!("{}/$nodes", root), nodes.join(",")),
        (format!("{}/$state", root), "ready".to_string()),
    ];

    for (id, point) in latest {
        let sensor = &point.sensor;
        let node = format!("{}/sensor_{}", root, id);
        let kind = sensor.kind().as_str();
        let property = kind.to_lowercase();

        messages.push((format!("{}/$type", node), sensor.model().to_string()));
        messages.push((format!("{}/$name", node), sensor.name().to_string()));
        messages.push((format!("{}/$properties", node), property.clone()));
        messages.push((
            format!("{}/{}/$name", node, property),
            format!("{} {}", sensor.name(), kind),
        ));
        messages.push((format!("{}/{}/$datatype", node, property), "float".to_string()));
        messages.push((format!("{}/{}/$unit", node, property), sensor.unit().to_string()));
        messages.push((format!("{}/{}", node, property), format!("{:.2}", point.cooked())));
    }

    messages
}

pub struct MqttListener {
    device: HomieDevice,
    publisher: Arc<dyn MqttPublish>,
    interval: Duration,
    latest: Mutex<BTreeMap<u16, Arc<DataPoint>>>,
    last_publish: Mutex<Option<Instant>>,
    connection: Option<JoinHandle<()>>,
}

impl MqttListener {
    pub const TAG: &'static str = "MQTTListener";

    /// Listener publishing through `publisher`
    pub fn new(device: HomieDevice, publisher: Arc<dyn MqttPublish>, interval: Duration) -> Self {
        Self {
            device,
            publisher,
            interval,
            latest: Mutex::new(BTreeMap::new()),
            last_publish: Mutex::new(None),
            connection: None,
        }
    }

    /// Connect to the broker at `host:port`, driving the connection on `runtime`
    pub fn connect(
        device: HomieDevice,
        client_id: &str,
        host: &str,
        port: u16,
        interval: Duration,
        runtime: &Handle,
    ) -> Self {
        info!("Connecting to mqtt broker at {}:{}", host, port);
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(KEEP_ALIVE);

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let task = runtime.spawn(drive_connection(eventloop));

        let mut listener = Self::new(device, Arc::new(client), interval);
        listener.connection = Some(task);
        listener
    }

    pub fn from_params(
        params: &ListenerParams,
        context: &ListenerContext,
    ) -> Result<Arc<dyn DataListener>> {
        let runtime = context.runtime.as_ref().ok_or_else(|| {
            Error::Configuration(format!("{} needs an async runtime", Self::TAG))
        })?;

        let host = string_param(params, "host", DEFAULT_HOST)?;
        let port = port_param(params, "port", DEFAULT_PORT)?;
        let client_id = string_param(params, "client_id", "arexx-logger")?;
        let interval = interval_param(params, "publish_interval_secs", DEFAULT_PUBLISH_INTERVAL)?;
        let device = HomieDevice::from_params(params)?;

        Ok(Arc::new(Self::connect(device, &client_id, &host, port, interval, runtime)))
    }

    /// Claim the current publish slot, `false` while throttled
    fn claim_slot(&self, now: Instant) -> bool {
        let mut last = self.last_publish.lock().unwrap_or_else(PoisonError::into_inner);
        match *last {
            Some(previous) if now.duration_since(previous) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

async fn drive_connection(mut eventloop: EventLoop) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!("Connected to mqtt broker with result code {:?}", ack.code);
            }
            Ok(event) => debug!("MQTT event: {:?}", event),
            Err(e) => {
                warn!("MQTT connection error: {}", e);
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

/// Whole-second interval parameter, `default` when absent
fn interval_param(params: &ListenerParams, key: &str, default: Duration) -> Result<Duration> {
    match params.get(key) {
        None => Ok(default),
        Some(toml::Value::Integer(n)) => u64::try_from(*n)
            .map(Duration::from_secs)
            .map_err(|_| Error::Configuration(format!("Parameter '{}' must not be negative", key))),
        Some(other) => Err(Error::Configuration(format!(
            "Parameter '{}' must be a number of seconds, got {}",
            key,
            other.type_str()
        ))),
    }
}

impl DataListener for MqttListener {
    fn name(&self) -> &str {
        Self::TAG
    }

    fn on_new_data(&self, point: Arc<DataPoint>) -> anyhow::Result<()> {
        let messages = {
            let mut latest = self.latest.lock().unwrap_or_else(PoisonError::into_inner);
            latest.insert(point.sensor_id, point);
            if !self.claim_slot(Instant::now()) {
                return Ok(());
            }
            homie_messages(&self.device, &latest)
        };

        debug!("Publishing MQTT messages with topic root {}", self.device.topic_root());
        for (topic, payload) in messages {
            self.publisher.publish(&topic, payload)?;
        }
        Ok(())
    }
}

impl Drop for MqttListener {
    fn drop(&mut self) {
        if let Some(task) = self.connection.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::create_test_point;

    #[derive(Default)]
    struct RecordingPublisher {
        messages: Mutex<Vec<(String, String)>>,
    }

    impl RecordingPublisher {
        fn take(&self) -> Vec<(String, String)> {
            std::mem::take(&mut *self.messages.lock().unwrap())
        }
    }

    impl MqttPublish for RecordingPublisher {
        fn publish(&self, topic: &str, payload: String) -> anyhow::Result<()> {
            self.messages.lock().unwrap().push((topic.to_string(), payload));
            Ok(())
        }
    }

    fn listener(interval: Duration) -> (MqttListener, Arc<RecordingPublisher>) {
        let publisher = Arc::new(RecordingPublisher::default());
        let listener = MqttListener::new(HomieDevice::default(), publisher.clone(), interval);
        (listener, publisher)
    }

    fn payload<'a>(messages: &'a [(String, String)], topic: &str) -> Option<&'a str> {
        messages
            .iter()
            .find(|(t, _)| t == topic)
            .map(|(_, p)| p.as_str())
    }

    #[test]
    fn test_homie_messages() {
        let mut latest = BTreeMap::new();
        latest.insert(3, Arc::new(create_test_point(3, 0)));
        latest.insert(2, Arc::new(create_test_point(2, 2560)));

        let messages = homie_messages(&HomieDevice::default(), &latest);
        assert_eq!(messages.len(), 4 + 2 * 7);
        assert_eq!(messages[0], ("homie/arexx-logger/$homie".to_string(), "3.0".to_string()));
        assert_eq!(payload(&messages, "homie/arexx-logger/$nodes"), Some("sensor_2,sensor_3"));
        assert_eq!(payload(&messages, "homie/arexx-logger/$state"), Some("ready"));

        let node = "homie/arexx-logger/sensor_2";
        assert_eq!(payload(&messages, &format!("{}/$type", node)), Some("Unknown"));
        assert_eq!(payload(&messages, &format!("{}/$properties", node)), Some("temperature"));
        assert_eq!(
            payload(&messages, &format!("{}/temperature/$name", node)),
            Some("Unknown Temperature")
        );
        assert_eq!(payload(&messages, &format!("{}/temperature/$datatype", node)), Some("float"));
        assert_eq!(payload(&messages, &format!("{}/temperature/$unit", node)), Some("°C"));
        assert_eq!(payload(&messages, &format!("{}/temperature", node)), Some("20.00"));

        assert_eq!(
            payload(&messages, "homie/arexx-logger/sensor_3/$properties"),
            Some("humidity")
        );
    }

    #[test]
    fn test_custom_topic_root() {
        let p: ListenerParams = "mqtt_base_topic = \"devices\"\nmqtt_device = \"cellar\"".parse().unwrap();
        let device = HomieDevice::from_params(&p).unwrap();
        assert_eq!(device.topic_root(), "devices/cellar");
        assert_eq!(device.convention_version, "3.0");
    }

    #[test]
    fn test_publishes_at_most_once_per_interval() {
        let (listener, publisher) = listener(Duration::from_secs(3600));

        listener.on_new_data(Arc::new(create_test_point(2, 2560))).unwrap();
        assert_eq!(publisher.take().len(), 4 + 7);

        listener.on_new_data(Arc::new(create_test_point(4, 1280))).unwrap();
        assert!(publisher.take().is_empty());
    }

    #[test]
    fn test_round_includes_every_sensor_seen() {
        let (listener, publisher) = listener(Duration::ZERO);

        listener.on_new_data(Arc::new(create_test_point(2, 2560))).unwrap();
        listener.on_new_data(Arc::new(create_test_point(2, 1280))).unwrap();
        listener.on_new_data(Arc::new(create_test_point(4, 0))).unwrap();

        let rounds = publisher.take();
        assert_eq!(rounds.len(), 3 * 4 + 7 + 7 + 2 * 7);
        let last_round = &rounds[rounds.len() - (4 + 2 * 7)..];
        assert_eq!(payload(last_round, "homie/arexx-logger/$nodes"), Some("sensor_2,sensor_4"));
        assert_eq!(payload(last_round, "homie/arexx-logger/sensor_2/temperature"), Some("10.00"));
    }

    #[test]
    fn test_interval_param() {
        let p: ListenerParams = "every = 10\nnegative = -1\ntext = \"4\"".parse().unwrap();
        assert_eq!(interval_param(&p, "every", DEFAULT_PUBLISH_INTERVAL).unwrap(), Duration::from_secs(10));
        assert_eq!(interval_param(&p, "missing", DEFAULT_PUBLISH_INTERVAL).unwrap(), Duration::from_secs(4));
        assert!(interval_param(&p, "negative", DEFAULT_PUBLISH_INTERVAL).is_err());
        assert!(interval_param(&p, "text", DEFAULT_PUBLISH_INTERVAL).is_err());
    }

    #[test]
    fn test_requires_runtime() {
        let result = MqttListener::from_params(&ListenerParams::new(), &ListenerContext::default());
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[tokio::test]
    async fn test_connect_without_broker_queues_messages() {
        let p: ListenerParams = "host = \"127.0.0.1\"\nport = 1".parse().unwrap();
        let listener = MqttListener::from_params(&p, &ListenerContext::with_runtime(Handle::current())).unwrap();

        assert_eq!(listener.name(), "MQTTListener");
        listener.on_new_data(Arc::new(create_test_point(2, 2560))).unwrap();
    }
}
