//! Impure I/O operations for MQTT client
//!
//! This module owns the single broker connection: it creates the rumqttc
//! client, runs the event loop on a background task, and turns what the loop
//! sees into connection state, publish outcomes and inbound deliveries.

use super::ack_tracker::AckTracker;
use super::connection::{
    configure_mqtt_options, generate_client_id, to_mqtt_qos, BrokerTarget, ConnectReason,
    ConnectionState, MqttError,
};
use super::health_monitor::{ConnectionEvent, HealthMonitor};
use super::message_handler::{EventRoute, MessageHandler};
use crate::config::{MqttCredentials, MqttSection};
use crate::error::sanitize_error_message;
use crate::mqtt_span;
use crate::observability::metrics::metrics;
use crate::protocol::{PublishAck, QosLevel, STATE_SUBSCRIPTION};
use crate::transport::{InboundHandler, Transport};
use async_trait::async_trait;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, EventLoop};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Capacity of the rumqttc request channel
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// How long `disconnect` waits for the event loop to flush DISCONNECT
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Background event loop for one connection attempt
struct LoopSession {
    target: BrokerTarget,
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Everything the event loop task needs, detached from the client
struct EventLoopContext {
    generation: u64,
    current_generation: Arc<AtomicU64>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    client: AsyncClient,
    acks: Arc<AckTracker>,
    inbound: Arc<dyn InboundHandler>,
}

/// MQTT transport client for robot command dispatch
pub struct MqttClient {
    config: MqttSection,
    credentials: Option<MqttCredentials>,
    client_id: String,
    inbound: Arc<dyn InboundHandler>,
    client: Mutex<Option<AsyncClient>>,
    acks: Arc<AckTracker>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    // Bumped on every new loop so a torn-down loop cannot touch shared state
    generation: Arc<AtomicU64>,
    session: std::sync::Mutex<Option<LoopSession>>,
    lifecycle_lock: Mutex<()>,
}

impl MqttClient {
    /// Create a disconnected client; `inbound` receives every state message
    pub fn new(
        config: MqttSection,
        credentials: Option<MqttCredentials>,
        inbound: Arc<dyn InboundHandler>,
    ) -> Self {
        let client_id = generate_client_id(&config.client_id_prefix);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        MqttClient {
            config,
            credentials,
            client_id,
            inbound,
            client: Mutex::new(None),
            acks: Arc::new(AckTracker::new()),
            state_tx: Arc::new(state_tx),
            generation: Arc::new(AtomicU64::new(0)),
            session: std::sync::Mutex::new(None),
            lifecycle_lock: Mutex::new(()),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Broker the current session was opened against
    pub fn active_target(&self) -> Option<BrokerTarget> {
        self.lock_session()
            .as_ref()
            .map(|session| session.target.clone())
    }

    fn lock_session(&self) -> std::sync::MutexGuard<'_, Option<LoopSession>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply an event to the shared state through the pure transition table
    fn transition(
        state_tx: &watch::Sender<ConnectionState>,
        event: ConnectionEvent,
    ) -> ConnectionState {
        let mut next = ConnectionState::Disconnected;
        state_tx.send_modify(|state| {
            let updated = HealthMonitor::determine_next_state(state, event);
            HealthMonitor::log_state_transition(state, &updated);
            next = updated.clone();
            *state = updated;
        });
        next
    }

    /// Wait for the handshake to settle (ConnAck or failure) with timeout
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), ConnectReason> {
        let settled = tokio::time::timeout(
            timeout,
            state_rx.wait_for(|state| !matches!(state, ConnectionState::Connecting)),
        )
        .await;

        match settled {
            Ok(Ok(state)) => match &*state {
                ConnectionState::Connected => Ok(()),
                ConnectionState::Failed(reason) => Err(reason.clone()),
                _ => Err(ConnectReason::Closed(
                    "closed during handshake".to_string(),
                )),
            },
            Ok(Err(_)) => Err(ConnectReason::Closed("state channel closed".to_string())),
            Err(_) => Err(ConnectReason::Timeout),
        }
    }

    /// Connect to the primary broker, then once to the fallback
    ///
    /// There is no retry beyond the fallback; longer-term reconnection is the
    /// supervisor's job.
    pub async fn connect(&self) -> Result<BrokerTarget, MqttError> {
        let _lifecycle = self.lifecycle_lock.lock().await;

        if HealthMonitor::can_publish(&self.connection_state()) {
            if let Some(target) = self.active_target() {
                return Ok(target);
            }
        }
        self.teardown_session().await;
        if self.connection_state() == ConnectionState::Connected {
            Self::transition(&self.state_tx, ConnectionEvent::ClosedByClient);
        }

        let targets = BrokerTarget::candidates(&self.config);
        let mut last_failure = None;

        for (index, target) in targets.into_iter().enumerate() {
            if index > 0 {
                warn!(broker = %target, "Primary broker failed, trying fallback");
                metrics().mqtt_fallback_attempt();
            }
            metrics().mqtt_connection_attempt();

            let span = mqtt_span!(operation = "connect", broker = %target, client_id = %self.client_id);
            match self.connect_to(&target).instrument(span).await {
                Ok(()) => {
                    metrics().mqtt_connection_established();
                    info!(broker = %target, client_id = %self.client_id, "Connected to MQTT broker");
                    return Ok(target);
                }
                Err(reason) => {
                    metrics().mqtt_connection_failed();
                    warn!(broker = %target, reason = %reason, "MQTT connection attempt failed");
                    last_failure = Some((target, reason));
                }
            }
        }

        let (target, reason) = last_failure.unwrap_or_else(|| {
            (
                BrokerTarget::new(&self.config.broker_host, self.config.port),
                ConnectReason::Closed("no broker targets configured".to_string()),
            )
        });
        error!(broker = %target, reason = %reason, "Giving up on MQTT connection");
        Err(MqttError::ConnectionFailed { target, reason })
    }

    /// One handshake against one target
    async fn connect_to(&self, target: &BrokerTarget) -> Result<(), ConnectReason> {
        let mqtt_options = configure_mqtt_options(
            &self.client_id,
            target,
            &self.config,
            self.credentials.as_ref(),
        );
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        Self::transition(&self.state_tx, ConnectionEvent::ConnectStarted);
        *self.client.lock().await = Some(client.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let context = EventLoopContext {
            generation,
            current_generation: self.generation.clone(),
            state_tx: self.state_tx.clone(),
            client,
            acks: self.acks.clone(),
            inbound: self.inbound.clone(),
        };
        let handle = tokio::spawn(
            context
                .run(event_loop, shutdown_rx)
                .instrument(mqtt_span!(operation = "event_loop", broker = %target)),
        );

        *self.lock_session() = Some(LoopSession {
            target: target.clone(),
            handle,
            shutdown_tx,
        });

        let confirmation = Self::wait_for_connection_confirmation(
            self.state_tx.subscribe(),
            self.config.connect_timeout(),
        )
        .await;

        if let Err(reason) = &confirmation {
            self.teardown_session().await;
            self.state_tx
                .send_replace(ConnectionState::Failed(reason.clone()));
        }
        confirmation
    }

    /// Stop the current loop without a graceful DISCONNECT
    async fn teardown_session(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let session = self.lock_session().take();
        if let Some(session) = session {
            let _ = session.shutdown_tx.send(true);
            session.handle.abort();
        }
        *self.client.lock().await = None;
        self.acks.fail_all();
    }

    /// Graceful close; outstanding publishes are resolved, not flushed
    pub async fn disconnect(&self) -> Result<(), MqttError> {
        let _lifecycle = self.lifecycle_lock.lock().await;

        Self::transition(&self.state_tx, ConnectionEvent::ClosedByClient);
        self.acks.fail_all();

        let client = self.client.lock().await.take();
        let session = self.lock_session().take();

        let Some(LoopSession {
            mut handle,
            shutdown_tx,
            ..
        }) = session
        else {
            debug!("Disconnect requested without an active session");
            return Ok(());
        };

        if let Some(client) = client {
            if let Err(e) = client.try_disconnect() {
                debug!("DISCONNECT could not be queued: {}", e);
            }
        }

        match tokio::time::timeout(DISCONNECT_GRACE, &mut handle).await {
            Ok(Ok(())) => info!("Event loop task shut down gracefully"),
            Ok(Err(e)) if !e.is_cancelled() => warn!("Event loop task ended with error: {}", e),
            Ok(Err(_)) => {}
            Err(_) => {
                warn!("Event loop task didn't shut down gracefully, forcing abort");
                let _ = shutdown_tx.send(true);
                handle.abort();
            }
        }
        self.generation.fetch_add(1, Ordering::SeqCst);

        info!("MQTT client disconnected");
        Ok(())
    }

    /// Get current connection state
    pub fn connection_state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    /// Check connection state before operations
    fn check_connection_state(&self) -> Result<(), MqttError> {
        let current_state = self.connection_state();
        if !HealthMonitor::can_publish(&current_state) {
            return Err(MqttError::NotConnected {
                state: current_state,
            });
        }
        Ok(())
    }

    /// Publish and wait for the broker's verdict
    ///
    /// Safe to cancel: the request is queued without yielding, so a dropped
    /// call only abandons the wait for its acknowledgement.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QosLevel,
        retain: bool,
    ) -> Result<PublishAck, MqttError> {
        self.check_connection_state()?;

        let ticket = {
            let guard = self.client.lock().await;
            let client = guard.as_ref().ok_or_else(|| MqttError::NotConnected {
                state: self.connection_state(),
            })?;

            // Reservation and request must enter their queues in the same order
            let ticket = self.acks.enqueue(qos);
            if let Err(e) = client.try_publish(topic, to_mqtt_qos(qos), retain, payload) {
                self.acks.abandon(ticket.id());
                metrics().mqtt_publish_failed();
                return Err(MqttError::PublishFailed(Box::new(e)));
            }
            ticket
        };

        metrics().mqtt_message_published();
        let ack = ticket.wait(self.config.ack_timeout()).await;
        debug!(topic = %topic, qos = u8::from(qos), ack = ?ack, "Publish settled");
        Ok(ack)
    }
}

impl EventLoopContext {
    fn is_current(&self) -> bool {
        self.current_generation.load(Ordering::SeqCst) == self.generation
    }

    async fn run(self, mut event_loop: EventLoop, mut shutdown_rx: watch::Receiver<bool>) {
        debug!("Starting MQTT event loop");

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!("Shutdown signal received, stopping event loop");
                        break;
                    }
                }

                event_result = event_loop.poll() => {
                    if !self.is_current() {
                        break;
                    }
                    match event_result {
                        Ok(event) => {
                            let route = MessageHandler::route_mqtt_event(&event);
                            if !self.process_event_route(route) {
                                break;
                            }
                        }
                        Err(e) => {
                            self.handle_event_loop_error(&e);
                            break;
                        }
                    }
                }
            }
        }

        debug!("MQTT event loop stopped");
    }

    /// Returns true to continue loop, false to break
    fn process_event_route(&self, route: EventRoute) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged => {
                let state =
                    MqttClient::transition(&self.state_tx, ConnectionEvent::ConnAckReceived);
                if state == ConnectionState::Connected {
                    // try_subscribe: the request channel is drained by this very loop
                    if let Err(e) = self.client.try_subscribe(STATE_SUBSCRIPTION, QoS::AtLeastOnce)
                    {
                        error!("Failed to subscribe to {}: {}", STATE_SUBSCRIPTION, e);
                    }
                }
                true
            }
            EventRoute::MessageReceived {
                topic,
                payload,
                retain,
            } => {
                tracing::debug!(target: "mqtt_transport", "Received MQTT message on topic: {}", topic);
                metrics().mqtt_message_received();
                self.inbound.on_message(&topic, &payload, retain);
                true
            }
            EventRoute::Disconnected => {
                MqttClient::transition(&self.state_tx, ConnectionEvent::DisconnectedByBroker);
                metrics().mqtt_connection_lost();
                self.acks.fail_all();
                false
            }
            EventRoute::PublishSent { pkid } => {
                self.acks.on_publish_sent(pkid);
                true
            }
            EventRoute::PublishAcked { pkid, outcome } => {
                self.acks.on_publish_acked(pkid, outcome);
                true
            }
            EventRoute::SubscriptionConfirmed { packet_id } => {
                tracing::debug!(target: "mqtt_transport", "Subscription confirmed: {}", packet_id);
                true
            }
            EventRoute::DisconnectSent => {
                tracing::debug!(target: "mqtt_transport", "DISCONNECT sent");
                false
            }
            EventRoute::InfrastructureEvent(event_str) => {
                tracing::debug!(target: "mqtt_transport", "MQTT event: {}", event_str);
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    fn handle_event_loop_error(&self, error: &rumqttc::v5::ConnectionError) {
        let reason = ConnectReason::from_connection_error(error);
        let previous = self.state_tx.borrow().clone();
        MqttClient::transition(&self.state_tx, ConnectionEvent::NetworkError(reason));
        if previous == ConnectionState::Connected {
            metrics().mqtt_connection_lost();
        }
        self.acks.fail_all();

        error!(
            "MQTT event loop error: {}",
            sanitize_error_message(&error.to_string())
        );
    }
}

/// Implementation of Transport trait for MqttClient
#[async_trait]
impl Transport for MqttClient {
    async fn connect(&self) -> Result<BrokerTarget, MqttError> {
        MqttClient::connect(self).await
    }

    async fn disconnect(&self) -> Result<(), MqttError> {
        MqttClient::disconnect(self).await
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QosLevel,
        retain: bool,
    ) -> Result<PublishAck, MqttError> {
        MqttClient::publish(self, topic, payload, qos, retain).await
    }

    fn is_connected(&self) -> bool {
        matches!(self.connection_state(), ConnectionState::Connected)
    }

    fn connection_state(&self) -> ConnectionState {
        MqttClient::connection_state(self)
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        // Async disconnect is not possible here; only stop the background task
        if let Some(session) = self.lock_session().take() {
            let _ = session.shutdown_tx.send(true);
            session.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullHandler;

    impl InboundHandler for NullHandler {
        fn on_message(&self, _topic: &str, _payload: &[u8], _retained: bool) {}
    }

    fn unreachable_config() -> MqttSection {
        MqttSection {
            broker_host: "127.0.0.1".to_string(),
            port: 1,
            fallback_host: None,
            connect_timeout_ms: 500,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_success() {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = state_tx.send(ConnectionState::Connected);
        });

        let result =
            MqttClient::wait_for_connection_confirmation(state_rx, Duration::from_millis(500))
                .await;
        assert!(result.is_ok(), "Should successfully wait for connection");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_connection_confirmation_timeout() {
        let (_state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        let result =
            MqttClient::wait_for_connection_confirmation(state_rx, Duration::from_millis(10)).await;
        assert_eq!(result, Err(ConnectReason::Timeout));
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_refused() {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = state_tx.send(ConnectionState::Failed(ConnectReason::NotAuthorized));
        });

        let result =
            MqttClient::wait_for_connection_confirmation(state_rx, Duration::from_millis(500))
                .await;
        assert_eq!(result, Err(ConnectReason::NotAuthorized));
    }

    #[tokio::test]
    async fn test_new_client_is_disconnected() {
        let client = MqttClient::new(MqttSection::default(), None, Arc::new(NullHandler));

        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
        assert!(!Transport::is_connected(&client));
        assert!(client.active_target().is_none());
        assert!(client.client_id().starts_with("nest-dispatch-"));
    }

    #[tokio::test]
    async fn test_publish_fails_fast_without_connection() {
        let client = MqttClient::new(MqttSection::default(), None, Arc::new(NullHandler));

        let result = client
            .publish(
                "agent/robot1/commands",
                br#"{"command":"on"}"#.to_vec(),
                QosLevel::AtLeastOnce,
                false,
            )
            .await;

        assert!(matches!(
            result,
            Err(MqttError::NotConnected {
                state: ConnectionState::Disconnected
            })
        ));
    }

    #[tokio::test]
    async fn test_disconnect_without_connection() {
        let client = MqttClient::new(MqttSection::default(), None, Arc::new(NullHandler));
        assert!(client.disconnect().await.is_ok());
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_reports_reason() {
        let client = MqttClient::new(unreachable_config(), None, Arc::new(NullHandler));

        let result = client.connect().await;
        match result {
            Err(MqttError::ConnectionFailed { target, reason }) => {
                assert_eq!(target, BrokerTarget::new("127.0.0.1", 1));
                assert!(matches!(
                    reason,
                    ConnectReason::NetworkUnreachable(_) | ConnectReason::Timeout
                ));
            }
            other => panic!("expected ConnectionFailed, got {other:?}"),
        }
        assert!(matches!(
            client.connection_state(),
            ConnectionState::Failed(_)
        ));
        assert!(client.active_target().is_none());
    }
}
