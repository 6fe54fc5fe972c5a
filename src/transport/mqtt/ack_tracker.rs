//! Correlates outgoing publishes with broker acknowledgements
//!
//! rumqttc assigns packet ids inside the event loop, so a publish is first
//! queued in request order and only bound to its packet id once the loop
//! reports `Outgoing::Publish(pkid)`. PUBACK/PUBREC then resolve the bound
//! entry.

use crate::protocol::{PublishAck, QosLevel};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

struct QueuedPublish {
    id: u64,
    qos: QosLevel,
    tx: oneshot::Sender<PublishAck>,
}

#[derive(Default)]
struct AckState {
    next_id: u64,
    queued: VecDeque<QueuedPublish>,
    in_flight: HashMap<u16, oneshot::Sender<PublishAck>>,
}

/// Publish acknowledgement registry shared by the client and its event loop
#[derive(Default)]
pub struct AckTracker {
    state: Mutex<AckState>,
}

/// Caller's handle on one publish outcome
#[derive(Debug)]
pub struct AckTicket {
    id: u64,
    rx: oneshot::Receiver<PublishAck>,
}

impl AckTicket {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the broker's verdict; silence within `ack_timeout` means the
    /// message left the client but its fate is unknown
    pub async fn wait(self, ack_timeout: Duration) -> PublishAck {
        match tokio::time::timeout(ack_timeout, self.rx).await {
            Ok(Ok(ack)) => ack,
            Ok(Err(_)) => PublishAck::Unacknowledged,
            Err(_) => {
                debug!(ticket = self.id, "No broker acknowledgement before timeout");
                PublishAck::Unacknowledged
            }
        }
    }
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AckState> {
        // A poisoned registry still holds valid senders
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reserve a slot for a publish about to be handed to the client
    ///
    /// Must be called in the same critical section as the client publish so
    /// queue order matches request order.
    pub fn enqueue(&self, qos: QosLevel) -> AckTicket {
        let (tx, rx) = oneshot::channel();
        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.queued.push_back(QueuedPublish { id, qos, tx });
        AckTicket { id, rx }
    }

    /// Drop a reservation whose publish never reached the client
    pub fn abandon(&self, id: u64) {
        self.lock().queued.retain(|entry| entry.id != id);
    }

    /// The event loop wrote the oldest queued publish with this packet id
    pub fn on_publish_sent(&self, pkid: u16) {
        let mut state = self.lock();
        let Some(entry) = state.queued.pop_front() else {
            warn!(pkid, "Outgoing publish with no queued reservation");
            return;
        };

        match entry.qos {
            QosLevel::AtMostOnce => {
                let _ = entry.tx.send(PublishAck::Unacknowledged);
            }
            QosLevel::AtLeastOnce | QosLevel::ExactlyOnce => {
                state.in_flight.insert(pkid, entry.tx);
            }
        }
    }

    /// PUBACK (QoS 1) or PUBREC (QoS 2) arrived
    pub fn on_publish_acked(&self, pkid: u16, outcome: PublishAck) {
        match self.lock().in_flight.remove(&pkid) {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => debug!(pkid, "Acknowledgement for untracked packet"),
        }
    }

    /// Resolve everything on connection loss: publishes still queued never
    /// left the client, in-flight ones may or may not have reached the broker
    pub fn fail_all(&self) {
        let mut state = self.lock();
        for entry in state.queued.drain(..) {
            let _ = entry
                .tx
                .send(PublishAck::Rejected("connection closed before send".to_string()));
        }
        for (_, tx) in state.in_flight.drain() {
            let _ = tx.send(PublishAck::Unacknowledged);
        }
    }

    pub fn outstanding(&self) -> usize {
        let state = self.lock();
        state.queued.len() + state.in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_puback_resolves_matching_publish() {
        let tracker = AckTracker::new();
        let first = tracker.enqueue(QosLevel::AtLeastOnce);
        let second = tracker.enqueue(QosLevel::AtLeastOnce);

        tracker.on_publish_sent(1);
        tracker.on_publish_sent(2);
        tracker.on_publish_acked(2, PublishAck::Rejected("NotAuthorized".to_string()));
        tracker.on_publish_acked(1, PublishAck::Acknowledged);

        assert_eq!(first.wait(WINDOW).await, PublishAck::Acknowledged);
        assert_eq!(
            second.wait(WINDOW).await,
            PublishAck::Rejected("NotAuthorized".to_string())
        );
        assert_eq!(tracker.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_qos0_is_unacknowledged_once_sent() {
        let tracker = AckTracker::new();
        let ticket = tracker.enqueue(QosLevel::AtMostOnce);
        tracker.on_publish_sent(0);

        assert_eq!(ticket.wait(WINDOW).await, PublishAck::Unacknowledged);
        assert_eq!(tracker.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_ack_times_out_as_unacknowledged() {
        let tracker = AckTracker::new();
        let ticket = tracker.enqueue(QosLevel::AtLeastOnce);
        tracker.on_publish_sent(5);

        assert_eq!(
            ticket.wait(Duration::from_secs(1)).await,
            PublishAck::Unacknowledged
        );
    }

    #[tokio::test]
    async fn test_abandoned_reservation_does_not_shift_queue() {
        let tracker = AckTracker::new();
        let failed = tracker.enqueue(QosLevel::AtLeastOnce);
        let sent = tracker.enqueue(QosLevel::AtLeastOnce);

        tracker.abandon(failed.id());
        tracker.on_publish_sent(3);
        tracker.on_publish_acked(3, PublishAck::Acknowledged);

        assert_eq!(sent.wait(WINDOW).await, PublishAck::Acknowledged);
    }

    #[tokio::test]
    async fn test_fail_all_on_connection_loss() {
        let tracker = AckTracker::new();
        let in_flight = tracker.enqueue(QosLevel::ExactlyOnce);
        let queued = tracker.enqueue(QosLevel::AtLeastOnce);
        tracker.on_publish_sent(9);

        tracker.fail_all();

        assert_eq!(in_flight.wait(WINDOW).await, PublishAck::Unacknowledged);
        assert!(matches!(
            queued.wait(WINDOW).await,
            PublishAck::Rejected(_)
        ));
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn test_unexpected_events_are_ignored() {
        let tracker = AckTracker::new();
        tracker.on_publish_sent(1);
        tracker.on_publish_acked(42, PublishAck::Acknowledged);
        assert_eq!(tracker.outstanding(), 0);
    }
}
