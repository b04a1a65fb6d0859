//! Registers as a Homie v5 device.
//!
//! Every register is a node of a single device, with `value`, `timed-out` and `last-seen`
//! properties. The registry doesn't talk to the broker itself: it queues up publishes for the
//! service loop to send out and tells it when the device as a whole needs to be published again.
mod value;

use std::collections::BTreeMap;

use homie5::client::{Publish, QoS, Subscription};
use homie5::device_description::{DeviceDescriptionBuilder, HomieDeviceDescription};
use homie5::{Homie5DeviceProtocol, HomieDeviceStatus, HomieID};
use tracing::{debug, warn};

use crate::bridge::WriteRequest;
use crate::registry::{
    DeviceId, DeviceRegistry, DeviceSnapshot, DeviceSpec, DeviceUpdate, ExistingDevice,
    RegistryError,
};
use crate::value::DeviceValue;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not publish to the MQTT broker")]
    Publish(#[source] rumqttc::v5::ClientError),
    #[error("could not subscribe at the MQTT broker")]
    Subscribe(#[source] rumqttc::v5::ClientError),
    #[error("could not produce the Homie device description")]
    Description(#[source] Box<dyn std::error::Error + Send + Sync>),
}

struct Node {
    id: HomieID,
    spec: DeviceSpec,
    value: Option<DeviceValue>,
    timed_out: bool,
    last_seen: Option<jiff::Timestamp>,
}

pub struct HomieRegistry {
    protocol: Homie5DeviceProtocol,
    name: String,
    capacity: usize,
    nodes: Vec<Node>,
    by_key: BTreeMap<String, DeviceId>,
    by_node: BTreeMap<HomieID, DeviceId>,
    outbox: Vec<Publish>,
    description_dirty: bool,
}

impl HomieRegistry {
    pub fn new(protocol: Homie5DeviceProtocol, name: String, capacity: usize) -> Self {
        Self {
            protocol,
            name,
            capacity,
            nodes: Vec::new(),
            by_key: BTreeMap::new(),
            by_node: BTreeMap::new(),
            outbox: Vec::new(),
            description_dirty: true,
        }
    }

    /// Publishes queued since the last call.
    pub fn take_publishes(&mut self) -> Vec<Publish> {
        std::mem::take(&mut self.outbox)
    }

    /// Whether nodes were added or changed since the device was last published.
    pub fn needs_republish(&self) -> bool {
        self.description_dirty
    }

    pub fn description(&self) -> HomieDeviceDescription {
        let mut description = DeviceDescriptionBuilder::new().name(self.name.as_str());
        for node in &self.nodes {
            description = description.add_node(node.id.clone(), value::node_description(&node.spec));
        }
        description.build()
    }

    /// Publish the whole device: its state, description, all known values and subscriptions.
    pub async fn publish_device(&mut self, mqtt: &rumqttc::v5::AsyncClient) -> Result<(), Error> {
        let description = self.description();
        self.description_dirty = false;
        // Anything queued is superseded by the values published below.
        self.outbox.clear();
        for step in homie5::homie_device_publish_steps() {
            match step {
                homie5::DevicePublishStep::DeviceStateInit => {
                    let p = self.protocol.publish_state(HomieDeviceStatus::Init);
                    mqtt.homie_publish(p).await.map_err(Error::Publish)?;
                }
                homie5::DevicePublishStep::DeviceDescription => {
                    let p = self
                        .protocol
                        .publish_description(&description)
                        .map_err(|e| Error::Description(Box::new(e)))?;
                    mqtt.homie_publish(p).await.map_err(Error::Publish)?;
                }
                homie5::DevicePublishStep::PropertyValues => {
                    for index in 0..self.nodes.len() {
                        self.queue_node(index);
                    }
                    for p in self.take_publishes() {
                        mqtt.homie_publish(p).await.map_err(Error::Publish)?;
                    }
                    // Keep the values ahead of `$state = ready`.
                    tokio::task::yield_now().await;
                }
                homie5::DevicePublishStep::SubscribeProperties => {
                    // An empty subscription makes the event loop report `EmptySubscription`.
                    let mut p = self
                        .protocol
                        .subscribe_props(&description)
                        .map_err(|e| Error::Description(Box::new(e)))?
                        .peekable();
                    if p.peek().is_some() {
                        mqtt.homie_subscribe(p).await.map_err(Error::Subscribe)?;
                    }
                }
                homie5::DevicePublishStep::DeviceStateReady => {
                    debug!("device becomes ready...");
                    let p = self.protocol.publish_state(HomieDeviceStatus::Ready);
                    mqtt.homie_publish(p).await.map_err(Error::Publish)?;
                }
            }
        }
        Ok(())
    }

    /// Turn an incoming MQTT message into a write request, if it is a `set` for one of our nodes.
    pub fn decode_set(&self, msg: &rumqttc::v5::mqttbytes::v5::Publish) -> Option<WriteRequest> {
        let topic = std::str::from_utf8(&msg.topic).ok()?;
        let Ok(homie5::Homie5Message::PropertySet { property, set_value }) =
            homie5::parse_mqtt_message(topic, &msg.payload)
        else {
            return None;
        };
        if property.device_id() != self.protocol.device_ref().device_id() {
            return None;
        }
        if property.prop_id() != &value::VALUE {
            debug!(message = "ignoring set of a read-only property", topic);
            return None;
        }
        let node = self.by_node.get(property.node_id()).and_then(|id| self.node(*id))?;
        match value::decode_set(&node.spec, &set_value) {
            Some(value) => Some(WriteRequest { register: node.spec.key.clone(), value }),
            None => {
                warn!(message = "unusable value for register", register = node.spec.key, set_value);
                None
            }
        }
    }

    fn node(&self, id: DeviceId) -> Option<&Node> {
        self.nodes.get(usize::try_from(id).ok()?)
    }

    fn node_mut(&mut self, id: DeviceId) -> Option<&mut Node> {
        self.nodes.get_mut(usize::try_from(id).ok()?)
    }

    fn queue_node(&mut self, index: usize) {
        let Some(node) = self.nodes.get(index) else { return };
        let mut publishes = Vec::with_capacity(3);
        if let Some(v) = &node.value {
            let payload = value::payload(&node.spec, v);
            publishes.push(self.protocol.publish_value(&node.id, &value::VALUE, payload, true));
        }
        let timed_out = node.timed_out.to_string();
        publishes.push(self.protocol.publish_value(&node.id, &value::TIMED_OUT, timed_out, true));
        if let Some(last_seen) = node.last_seen {
            let last_seen = last_seen.to_string();
            publishes.push(self.protocol.publish_value(&node.id, &value::LAST_SEEN, last_seen, true));
        }
        self.outbox.extend(publishes);
    }

    fn queue_property(&mut self, id: DeviceId, property: &HomieID, payload: String) {
        let Some(node) = self.node(id) else { return };
        let publish = self.protocol.publish_value(&node.id, property, payload, true);
        self.outbox.push(publish);
    }
}

impl DeviceRegistry for HomieRegistry {
    fn find(&self, key: &str) -> Option<ExistingDevice> {
        let id = *self.by_key.get(key)?;
        Some(ExistingDevice { id, spec: self.node(id)?.spec.clone() })
    }

    fn create(&mut self, spec: &DeviceSpec) -> Result<DeviceId, RegistryError> {
        if self.nodes.len() >= self.capacity {
            return Err(RegistryError::CapacityExhausted(self.capacity));
        }
        let id = DeviceId::try_from(self.nodes.len())
            .map_err(|_| RegistryError::CapacityExhausted(self.capacity))?;
        let rejected = |_| RegistryError::Rejected(spec.key.clone());
        let mut node_id = HomieID::try_from(value::node_id_for(&spec.key)).map_err(rejected)?;
        if self.by_node.contains_key(&node_id) {
            node_id = HomieID::try_from(format!("{node_id}-{id}")).map_err(rejected)?;
        }
        self.by_key.insert(spec.key.clone(), id);
        self.by_node.insert(node_id.clone(), id);
        self.nodes.push(Node {
            id: node_id,
            spec: spec.clone(),
            value: None,
            timed_out: false,
            last_seen: None,
        });
        self.description_dirty = true;
        Ok(id)
    }

    fn snapshot(&self, id: DeviceId) -> Option<DeviceSnapshot> {
        let node = self.node(id)?;
        Some(DeviceSnapshot { value: node.value.clone(), timed_out: node.timed_out })
    }

    fn update(&mut self, id: DeviceId, update: DeviceUpdate) {
        let Ok(index) = usize::try_from(id) else { return };
        let Some(node) = self.nodes.get_mut(index) else { return };
        if let Some(spec) = update.reconfigure {
            node.spec = spec;
            self.description_dirty = true;
        }
        if update.log_change {
            debug!(message = "value changed", register = node.spec.key, value = update.value.text);
        }
        node.value = Some(update.value);
        node.timed_out = false;
        node.last_seen = Some(jiff::Timestamp::now());
        self.queue_node(index);
    }

    fn touch(&mut self, id: DeviceId) {
        let Some(node) = self.node_mut(id) else { return };
        let now = jiff::Timestamp::now();
        node.last_seen = Some(now);
        self.queue_property(id, &value::LAST_SEEN, now.to_string());
    }

    fn set_timed_out(&mut self, id: DeviceId, timed_out: bool) {
        let Some(node) = self.node_mut(id) else { return };
        node.timed_out = timed_out;
        self.queue_property(id, &value::TIMED_OUT, timed_out.to_string());
    }
}

pub(crate) trait MqttClientExt {
    type PublishError;
    type SubscribeError;
    async fn homie_publish(&self, p: Publish) -> Result<(), Self::PublishError>;
    async fn homie_subscribe(
        &self,
        subs: impl Iterator<Item = Subscription> + Send,
    ) -> Result<(), Self::SubscribeError>;
}

impl MqttClientExt for rumqttc::v5::AsyncClient {
    type PublishError = rumqttc::v5::ClientError;
    type SubscribeError = rumqttc::v5::ClientError;
    async fn homie_publish(&self, p: Publish) -> Result<(), Self::PublishError> {
        self.publish(p.topic, convert_qos(p.qos), p.retain, p.payload).await
    }

    async fn homie_subscribe(
        &self,
        subs: impl Iterator<Item = Subscription> + Send,
    ) -> Result<(), Self::SubscribeError> {
        self.subscribe_many(
            subs.map(|sub| rumqttc::v5::mqttbytes::v5::Filter::new(sub.topic, convert_qos(sub.qos))),
        )
        .await
    }
}

pub fn convert_qos(homie: QoS) -> rumqttc::v5::mqttbytes::QoS {
    match homie {
        QoS::AtMostOnce => rumqttc::v5::mqttbytes::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::v5::mqttbytes::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::v5::mqttbytes::QoS::ExactlyOnce,
    }
}
