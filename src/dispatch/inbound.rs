//! Inbound state demultiplexing
//!
//! Every message the transport delivers lands here. Payloads are decoded,
//! cached per topic (latest wins) and handed to the waits registered for that
//! exact topic. Cache and wait registry sit behind one lock, so registering a
//! wait and dispatching a message can never interleave into a lost update.

use crate::observability::metrics::metrics;
use crate::protocol::{decode_state_payload, state_topic, StateUpdate};
use crate::transport::InboundHandler;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

type WaitId = u64;

struct Waiter {
    id: WaitId,
    // Reported state this wait accepts; None accepts any update
    expected_state: Option<String>,
    tx: oneshot::Sender<StateUpdate>,
}

impl Waiter {
    /// An update that reports a different `state` belongs to another command
    fn accepts(&self, update: &StateUpdate) -> bool {
        match (&self.expected_state, update.state_field()) {
            (Some(expected), Some(reported)) => expected == reported,
            _ => true,
        }
    }
}

#[derive(Default)]
struct DispatcherState {
    latest: HashMap<String, StateUpdate>,
    waits: HashMap<String, Vec<Waiter>>,
    next_wait_id: WaitId,
}

/// Topic-keyed latest-state cache plus pending confirmation registry
#[derive(Default)]
pub struct StateDispatcher {
    state: Mutex<DispatcherState>,
}

impl StateDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, DispatcherState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register interest in the next non-retained update on `topic`
    ///
    /// The cached value for the topic is dropped in the same critical
    /// section, so anything seen afterwards is newer than this call.
    pub fn register_wait(self: &Arc<Self>, topic: &str) -> PendingWait {
        self.register(topic, None)
    }

    /// Like [`register_wait`](Self::register_wait), but updates whose `state`
    /// field is present and differs from `expected_state` are not accepted
    pub fn register_wait_for_state(
        self: &Arc<Self>,
        topic: &str,
        expected_state: &str,
    ) -> PendingWait {
        self.register(topic, Some(expected_state.to_string()))
    }

    fn register(self: &Arc<Self>, topic: &str, expected_state: Option<String>) -> PendingWait {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut state = self.lock();
            state.next_wait_id += 1;
            let id = state.next_wait_id;
            state.latest.remove(topic);
            state
                .waits
                .entry(topic.to_string())
                .or_default()
                .push(Waiter {
                    id,
                    expected_state,
                    tx,
                });
            id
        };

        PendingWait {
            dispatcher: Arc::clone(self),
            topic: topic.to_string(),
            id,
            rx,
        }
    }

    fn deregister(&self, topic: &str, id: WaitId) {
        let mut state = self.lock();
        if let Some(waiters) = state.waits.get_mut(topic) {
            waiters.retain(|waiter| waiter.id != id);
            if waiters.is_empty() {
                state.waits.remove(topic);
            }
        }
    }

    /// Decode, cache and fan out one inbound message
    ///
    /// Retained messages predate any command in flight, so they refresh the
    /// cache without resolving waits.
    pub fn handle_message(&self, topic: &str, payload: &[u8], retained: bool) {
        let decoded = match decode_state_payload(topic, payload) {
            Ok(value) => value,
            Err(e) => {
                warn!("Dropping inbound message: {}", e);
                metrics().state_decode_failed();
                return;
            }
        };

        let update = StateUpdate {
            topic: topic.to_string(),
            payload: decoded,
            received_at: Utc::now(),
            retained,
        };

        let resolved = {
            let mut state = self.lock();
            state.latest.insert(topic.to_string(), update.clone());
            if retained {
                Vec::new()
            } else {
                Self::take_accepting(&mut state, topic, &update)
            }
        };

        debug!(
            topic = %topic,
            retained,
            waiters = resolved.len(),
            "State update received"
        );

        for waiter in resolved {
            let _ = waiter.tx.send(update.clone());
        }
    }

    /// Remove and return the waits on `topic` that accept `update`
    fn take_accepting(
        state: &mut DispatcherState,
        topic: &str,
        update: &StateUpdate,
    ) -> Vec<Waiter> {
        let Some(waiters) = state.waits.remove(topic) else {
            return Vec::new();
        };

        let (accepted, remaining): (Vec<_>, Vec<_>) =
            waiters.into_iter().partition(|waiter| waiter.accepts(update));
        if !remaining.is_empty() {
            debug!(
                topic = %topic,
                reported = ?update.state_field(),
                "Update does not match pending commands"
            );
            state.waits.insert(topic.to_string(), remaining);
        }
        accepted
    }

    /// Most recent update seen on `topic`
    pub fn latest(&self, topic: &str) -> Option<StateUpdate> {
        self.lock().latest.get(topic).cloned()
    }

    /// Most recent state reported by `agent_id`; None for unknown or invalid ids
    pub fn latest_state(&self, agent_id: &str) -> Option<StateUpdate> {
        let topic = state_topic(agent_id).ok()?;
        self.latest(&topic)
    }

    /// Number of waits currently registered on `topic`
    pub fn pending_waits(&self, topic: &str) -> usize {
        self.lock().waits.get(topic).map_or(0, Vec::len)
    }
}

impl InboundHandler for StateDispatcher {
    fn on_message(&self, topic: &str, payload: &[u8], retained: bool) {
        self.handle_message(topic, payload, retained);
    }
}

/// A registered confirmation wait
///
/// Dropping it, whether after resolution, expiry or an early return,
/// removes the registration, so a late message cannot reach it.
pub struct PendingWait {
    dispatcher: Arc<StateDispatcher>,
    topic: String,
    id: WaitId,
    rx: oneshot::Receiver<StateUpdate>,
}

impl PendingWait {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Suspend until a matching update arrives or `timeout` elapses
    pub async fn wait(self, timeout: Duration) -> Option<StateUpdate> {
        self.wait_until(Instant::now() + timeout).await
    }

    /// Suspend until a matching update arrives or `deadline` passes
    pub async fn wait_until(mut self, deadline: Instant) -> Option<StateUpdate> {
        match tokio::time::timeout_at(deadline, &mut self.rx).await {
            Ok(Ok(update)) => Some(update),
            Ok(Err(_)) => None,
            // Delivered in the instant the deadline fired
            Err(_) => self.rx.try_recv().ok(),
        }
    }
}

impl Drop for PendingWait {
    fn drop(&mut self) {
        self.dispatcher.deregister(&self.topic, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPIC: &str = "agent/robot1/state";

    #[tokio::test]
    async fn test_update_resolves_registered_wait() {
        let dispatcher = Arc::new(StateDispatcher::new());
        let pending = dispatcher.register_wait(TOPIC);

        dispatcher.handle_message(TOPIC, br#"{"state":"on","status":"ok"}"#, false);

        let update = pending.wait(Duration::from_millis(100)).await.unwrap();
        assert_eq!(update.state_field(), Some("on"));
        assert_eq!(dispatcher.pending_waits(TOPIC), 0);
    }

    #[tokio::test]
    async fn test_update_on_other_topic_is_ignored() {
        let dispatcher = Arc::new(StateDispatcher::new());
        let pending = dispatcher.register_wait(TOPIC);

        dispatcher.handle_message("agent/robot2/state", br#"{"state":"on"}"#, false);

        assert_eq!(dispatcher.pending_waits(TOPIC), 1);
        assert!(dispatcher.latest("agent/robot2/state").is_some());
        drop(pending);
        assert_eq!(dispatcher.pending_waits(TOPIC), 0);
    }

    #[tokio::test]
    async fn test_registration_invalidates_cache() {
        let dispatcher = Arc::new(StateDispatcher::new());
        dispatcher.handle_message(TOPIC, br#"{"state":"off"}"#, false);
        assert!(dispatcher.latest(TOPIC).is_some());

        let _pending = dispatcher.register_wait(TOPIC);
        assert!(dispatcher.latest(TOPIC).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_wait_is_deregistered() {
        let dispatcher = Arc::new(StateDispatcher::new());
        let pending = dispatcher.register_wait(TOPIC);

        assert!(pending.wait(Duration::from_millis(50)).await.is_none());
        assert_eq!(dispatcher.pending_waits(TOPIC), 0);

        // A late reply only refreshes the cache
        dispatcher.handle_message(TOPIC, br#"{"state":"on"}"#, false);
        assert_eq!(dispatcher.latest(TOPIC).unwrap().state_field(), Some("on"));
    }

    #[tokio::test]
    async fn test_concurrent_waits_on_same_topic_all_resolve() {
        let dispatcher = Arc::new(StateDispatcher::new());
        let first = dispatcher.register_wait(TOPIC);
        let second = dispatcher.register_wait(TOPIC);
        assert_eq!(dispatcher.pending_waits(TOPIC), 2);

        dispatcher.handle_message(TOPIC, br#"{"state":"on"}"#, false);

        assert!(first.wait(Duration::from_millis(100)).await.is_some());
        assert!(second.wait(Duration::from_millis(100)).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retained_message_does_not_confirm() {
        let dispatcher = Arc::new(StateDispatcher::new());
        let pending = dispatcher.register_wait(TOPIC);

        dispatcher.handle_message(TOPIC, br#"{"state":"off"}"#, true);

        assert!(pending.wait(Duration::from_millis(50)).await.is_none());
        let cached = dispatcher.latest(TOPIC).unwrap();
        assert!(cached.retained);
        assert_eq!(cached.state_field(), Some("off"));
    }

    #[tokio::test]
    async fn test_malformed_payload_dropped() {
        let dispatcher = Arc::new(StateDispatcher::new());
        let _pending = dispatcher.register_wait(TOPIC);

        dispatcher.handle_message(TOPIC, b"{not json", false);

        assert!(dispatcher.latest(TOPIC).is_none());
        assert_eq!(dispatcher.pending_waits(TOPIC), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mismatched_state_does_not_resolve_wait() {
        let dispatcher = Arc::new(StateDispatcher::new());
        let pending = dispatcher.register_wait_for_state(TOPIC, "off");

        dispatcher.handle_message(TOPIC, br#"{"state":"on"}"#, false);

        assert_eq!(dispatcher.pending_waits(TOPIC), 1);
        assert_eq!(dispatcher.latest(TOPIC).unwrap().state_field(), Some("on"));

        dispatcher.handle_message(TOPIC, br#"{"state":"off","status":"ok"}"#, false);

        let update = pending.wait(Duration::from_millis(100)).await.unwrap();
        assert_eq!(update.state_field(), Some("off"));
        assert_eq!(dispatcher.pending_waits(TOPIC), 0);
    }

    #[tokio::test]
    async fn test_update_without_state_field_resolves_expecting_wait() {
        let dispatcher = Arc::new(StateDispatcher::new());
        let pending = dispatcher.register_wait_for_state(TOPIC, "on");

        dispatcher.handle_message(TOPIC, br#"{"status":"ok"}"#, false);

        let update = pending.wait(Duration::from_millis(100)).await.unwrap();
        assert_eq!(update.payload["status"], "ok");
    }

    #[tokio::test]
    async fn test_one_update_resolves_only_matching_waits() {
        let dispatcher = Arc::new(StateDispatcher::new());
        let wants_on = dispatcher.register_wait_for_state(TOPIC, "on");
        let wants_off = dispatcher.register_wait_for_state(TOPIC, "off");
        let wants_any = dispatcher.register_wait(TOPIC);

        dispatcher.handle_message(TOPIC, br#"{"state":"on"}"#, false);

        assert!(wants_on.wait(Duration::from_millis(100)).await.is_some());
        assert!(wants_any.wait(Duration::from_millis(100)).await.is_some());
        assert_eq!(dispatcher.pending_waits(TOPIC), 1);
        drop(wants_off);
        assert_eq!(dispatcher.pending_waits(TOPIC), 0);
    }

    #[test]
    fn test_latest_state_by_agent() {
        let dispatcher = StateDispatcher::new();
        dispatcher.handle_message(TOPIC, br#"{"state":"on","battery":87}"#, false);

        let update = dispatcher.latest_state("robot1").unwrap();
        assert_eq!(update.payload["battery"], 87);
        assert!(dispatcher.latest_state("robot2").is_none());
        assert!(dispatcher.latest_state("bad/id").is_none());
    }

    #[tokio::test]
    async fn test_dispatch_through_inbound_handler() {
        let dispatcher = Arc::new(StateDispatcher::new());
        let handler: Arc<dyn InboundHandler> = dispatcher.clone();
        let pending = dispatcher.register_wait(TOPIC);

        handler.on_message(TOPIC, br#"{"state":"off"}"#, false);

        let update = pending.wait(Duration::from_millis(100)).await.unwrap();
        assert_eq!(update.state_field(), Some("off"));
    }
}
