//! Command publishing
//!
//! Turns a verb (or an arbitrary JSON object) into a message on the agent's
//! command topic. Publishing never waits for the device; see
//! [`super::coordinator`] for confirmation.

use crate::error::{DispatchError, NestResult};
use crate::observability::metrics::metrics;
use crate::protocol::{command_topic, Command, CommandPayload, CommandVerb, PublishAck, QosLevel};
use crate::transport::Transport;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// Publishes commands through a [`Transport`]
#[derive(Clone)]
pub struct CommandPublisher {
    transport: Arc<dyn Transport>,
    default_qos: QosLevel,
}

impl CommandPublisher {
    pub fn new(transport: Arc<dyn Transport>, default_qos: QosLevel) -> Self {
        Self {
            transport,
            default_qos,
        }
    }

    pub fn default_qos(&self) -> QosLevel {
        self.default_qos
    }

    /// Publish `{"command": verb}` to `agent/{agent_id}/commands`
    ///
    /// Returns once the transport has an outcome for the publish. A broker
    /// rejection becomes [`DispatchError::CommandDeliveryError`]; an
    /// unacknowledged publish still counts as sent.
    pub async fn send_command(
        &self,
        agent_id: &str,
        verb: CommandVerb,
        qos: Option<QosLevel>,
    ) -> NestResult<Command> {
        let topic = command_topic(agent_id)?;
        let qos = qos.unwrap_or(self.default_qos);
        let payload = CommandPayload {
            command: verb.clone(),
        }
        .to_bytes()?;

        let ack = self.publish_checked(&topic, payload, qos).await?;

        Ok(Command {
            agent_id: agent_id.to_string(),
            verb,
            qos,
            published_at: Utc::now(),
            ack,
        })
    }

    /// Publish an arbitrary JSON object to the agent's command topic
    ///
    /// Only JSON objects are accepted; devices expect a keyed payload.
    pub async fn send_payload(
        &self,
        agent_id: &str,
        payload: &Value,
        qos: Option<QosLevel>,
    ) -> NestResult<PublishAck> {
        let topic = command_topic(agent_id)?;
        if !payload.is_object() {
            return Err(DispatchError::delivery_failed(
                "command payload must be a JSON object",
            ));
        }
        let bytes = serde_json::to_vec(payload)?;
        self.publish_checked(&topic, bytes, qos.unwrap_or(self.default_qos))
            .await
    }

    async fn publish_checked(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QosLevel,
    ) -> NestResult<PublishAck> {
        let ack = self.transport.publish(topic, payload, qos, false).await?;

        match ack {
            PublishAck::Rejected(reason) => {
                warn!(topic = %topic, reason = %reason, "Broker rejected command");
                Err(DispatchError::delivery_failed(reason))
            }
            ack => {
                debug!(topic = %topic, qos = ?qos, ack = ?ack, "Command published");
                metrics().command_dispatched();
                Ok(ack)
            }
        }
    }
}
