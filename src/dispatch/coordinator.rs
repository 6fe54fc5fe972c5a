//! Command confirmation
//!
//! Publishes a command and suspends the caller until the device reports its
//! state or the deadline passes. The result is always one of four outcomes;
//! a missing confirmation is `Pending`, not an error.

use super::inbound::StateDispatcher;
use super::publisher::CommandPublisher;
use crate::config::DispatchSection;
use crate::dispatch_span;
use crate::error::{DispatchError, NestResult};
use crate::observability::metrics::metrics;
use crate::protocol::{AgentTopics, CommandVerb, DispatchResult, QosLevel, StateUpdate};
use crate::transport::Transport;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

/// Sends commands and correlates them with the device's next state report
#[derive(Clone)]
pub struct ConfirmationCoordinator {
    transport: Arc<dyn Transport>,
    dispatcher: Arc<StateDispatcher>,
    publisher: CommandPublisher,
    default_timeout: Duration,
}

impl ConfirmationCoordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        dispatcher: Arc<StateDispatcher>,
        config: &DispatchSection,
    ) -> Self {
        let publisher = CommandPublisher::new(Arc::clone(&transport), config.default_qos);
        Self {
            transport,
            dispatcher,
            publisher,
            default_timeout: config.confirm_timeout(),
        }
    }

    pub fn publisher(&self) -> &CommandPublisher {
        &self.publisher
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Latest cached state for `agent_id`
    pub fn latest_state(&self, agent_id: &str) -> Option<StateUpdate> {
        self.dispatcher.latest_state(agent_id)
    }

    /// Caller-facing entry point; `timeout_ms` defaults to the configured timeout
    pub async fn dispatch_command(
        &self,
        agent_id: &str,
        verb: impl Into<CommandVerb>,
        timeout_ms: Option<u64>,
    ) -> NestResult<DispatchResult> {
        let timeout = timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);
        self.send_and_confirm(agent_id, verb.into(), timeout).await
    }

    /// Publish `verb` to `agent_id` and wait up to `timeout` for its state
    ///
    /// The wait is registered, and the topic's cached state dropped, before
    /// the publish goes out, so a reply racing the publish is still matched.
    /// The deadline is fixed at the start of the call.
    pub async fn send_and_confirm(
        &self,
        agent_id: &str,
        verb: CommandVerb,
        timeout: Duration,
    ) -> NestResult<DispatchResult> {
        let topics = AgentTopics::for_agent(agent_id)?;
        let span = dispatch_span!(agent_id = %agent_id, verb = %verb);

        async move {
            let started = Instant::now();
            let deadline = started + timeout;

            if !self.transport.is_connected() {
                warn!("Not connected, command not sent");
                metrics().command_not_connected();
                return Ok(DispatchResult::not_connected(agent_id));
            }

            // A switch reply carrying the other state answers an earlier command
            let pending = if verb.is_switch() {
                self.dispatcher
                    .register_wait_for_state(&topics.state, verb.as_str())
            } else {
                self.dispatcher.register_wait(&topics.state)
            };

            let publish = self.publisher.send_command(agent_id, verb, Some(self.qos()));
            match tokio::time::timeout_at(deadline, publish).await {
                Ok(Ok(command)) => {
                    debug!(ack = ?command.ack, "Awaiting confirmation on {}", topics.state);
                }
                Ok(Err(DispatchError::NotConnected)) => {
                    warn!("Connection dropped before publish");
                    metrics().command_not_connected();
                    return Ok(DispatchResult::not_connected(agent_id));
                }
                Ok(Err(e)) => {
                    let detail = e.sanitized_message();
                    warn!(error = %detail, "Command delivery failed");
                    metrics().command_delivery_failed();
                    return Ok(DispatchResult::delivery_failed(agent_id, detail));
                }
                // Delivery unknown, same as an unacknowledged publish
                Err(_) => {
                    debug!("Deadline passed before the publish was acknowledged");
                }
            }

            match pending.wait_until(deadline).await {
                Some(update) => {
                    let elapsed = started.elapsed();
                    info!(
                        elapsed_ms = elapsed.as_millis() as u64,
                        state = ?update.state_field(),
                        "Command confirmed"
                    );
                    metrics().command_confirmed(elapsed);
                    Ok(DispatchResult::confirmed(agent_id, update))
                }
                None => {
                    info!(
                        timeout_ms = timeout.as_millis() as u64,
                        "No confirmation before deadline"
                    );
                    metrics().command_pending();
                    Ok(DispatchResult::pending(agent_id))
                }
            }
        }
        .instrument(span)
        .await
    }

    fn qos(&self) -> QosLevel {
        self.publisher.default_qos()
    }
}
