//! Mock implementations for testing
//!
//! [`MockTransport`] stands in for the MQTT client. It records publishes,
//! lets tests script connection state and broker acknowledgements, and can
//! simulate devices that answer commands on their state topic.

use crate::protocol::{agent_id_from_command_topic, state_topic, PublishAck, QosLevel};
use crate::transport::mqtt::{BrokerTarget, ConnectReason, ConnectionState, MqttError};
use crate::transport::{InboundHandler, Transport};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// One message handed to the mock transport
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QosLevel,
    pub retain: bool,
}

impl PublishedMessage {
    pub fn payload_json(&self) -> Option<Value> {
        serde_json::from_slice(&self.payload).ok()
    }
}

/// Simulated devices answering on `agent/{id}/state`
struct DeviceResponder {
    inbound: Arc<dyn InboundHandler>,
    default_delay: Duration,
    // None means the agent never answers
    agent_delays: HashMap<String, Option<Duration>>,
}

impl DeviceResponder {
    fn delay_for(&self, agent_id: &str) -> Option<Duration> {
        self.agent_delays
            .get(agent_id)
            .copied()
            .unwrap_or(Some(self.default_delay))
    }
}

/// Mock transport for testing
pub struct MockTransport {
    state: Mutex<ConnectionState>,
    published: Arc<Mutex<Vec<PublishedMessage>>>,
    ack: Mutex<PublishAck>,
    publish_error: Mutex<Option<String>>,
    publish_delay: Mutex<Option<Duration>>,
    connect_failures: AtomicU32,
    connect_calls: AtomicU32,
    device: Mutex<Option<DeviceResponder>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self {
            state: Mutex::new(ConnectionState::Disconnected),
            published: Arc::new(Mutex::new(Vec::new())),
            ack: Mutex::new(PublishAck::Acknowledged),
            publish_error: Mutex::new(None),
            publish_delay: Mutex::new(None),
            connect_failures: AtomicU32::new(0),
            connect_calls: AtomicU32::new(0),
            device: Mutex::new(None),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connected transport whose devices reply after `delay`
    pub fn with_device(inbound: Arc<dyn InboundHandler>, delay: Duration) -> Self {
        let transport = Self::new();
        transport.set_connected(true);
        *lock(&transport.device) = Some(DeviceResponder {
            inbound,
            default_delay: delay,
            agent_delays: HashMap::new(),
        });
        transport
    }

    pub fn set_connected(&self, connected: bool) {
        *lock(&self.state) = if connected {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };
    }

    /// Acknowledgement returned by every subsequent publish
    pub fn set_ack(&self, ack: PublishAck) {
        *lock(&self.ack) = ack;
    }

    /// Make subsequent publishes fail with a transport error
    pub fn set_publish_error(&self, error: Option<&str>) {
        *lock(&self.publish_error) = error.map(str::to_string);
    }

    /// Hold each publish this long before the acknowledgement is returned
    pub fn set_publish_delay(&self, delay: Option<Duration>) {
        *lock(&self.publish_delay) = delay;
    }

    /// Fail the next `count` connect attempts
    pub fn fail_next_connects(&self, count: u32) {
        self.connect_failures.store(count, Ordering::SeqCst);
    }

    pub fn connect_calls(&self) -> u32 {
        self.connect_calls.load(Ordering::SeqCst)
    }

    /// Per-agent reply delay; `None` silences the agent
    pub fn set_agent_delay(&self, agent_id: &str, delay: Option<Duration>) {
        if let Some(device) = lock(&self.device).as_mut() {
            device.agent_delays.insert(agent_id.to_string(), delay);
        }
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.published).clone()
    }

    fn schedule_device_reply(&self, topic: &str, payload: &[u8]) {
        let device = lock(&self.device);
        let Some(device) = device.as_ref() else {
            return;
        };
        let Some(agent_id) = agent_id_from_command_topic(topic) else {
            return;
        };
        let Some(delay) = device.delay_for(agent_id) else {
            return;
        };
        let Ok(reply_topic) = state_topic(agent_id) else {
            return;
        };

        let verb = serde_json::from_slice::<Value>(payload)
            .ok()
            .and_then(|command| command.get("command").cloned())
            .unwrap_or(Value::Null);
        let reply = json!({"state": verb, "status": "ok"}).to_string();
        let inbound = Arc::clone(&device.inbound);

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inbound.on_message(&reply_topic, reply.as_bytes(), false);
        });
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<BrokerTarget, MqttError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let target = BrokerTarget::new("localhost", 1883);

        let remaining = self.connect_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.connect_failures.store(remaining - 1, Ordering::SeqCst);
            let reason = ConnectReason::ServerUnavailable;
            *lock(&self.state) = ConnectionState::Failed(reason.clone());
            return Err(MqttError::ConnectionFailed { target, reason });
        }

        *lock(&self.state) = ConnectionState::Connected;
        Ok(target)
    }

    async fn disconnect(&self) -> Result<(), MqttError> {
        *lock(&self.state) = ConnectionState::Disconnected;
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QosLevel,
        retain: bool,
    ) -> Result<PublishAck, MqttError> {
        let state = lock(&self.state).clone();
        if state != ConnectionState::Connected {
            return Err(MqttError::NotConnected { state });
        }

        if let Some(error) = lock(&self.publish_error).clone() {
            return Err(MqttError::PublishFailed(error.into()));
        }

        lock(&self.published).push(PublishedMessage {
            topic: topic.to_string(),
            payload: payload.clone(),
            qos,
            retain,
        });

        let ack = lock(&self.ack).clone();
        if !matches!(ack, PublishAck::Rejected(_)) {
            self.schedule_device_reply(topic, &payload);
        }

        let delay = *lock(&self.publish_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(ack)
    }

    fn is_connected(&self) -> bool {
        *lock(&self.state) == ConnectionState::Connected
    }

    fn connection_state(&self) -> ConnectionState {
        lock(&self.state).clone()
    }
}
