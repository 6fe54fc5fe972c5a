//! Pure message routing logic for MQTT events
//!
//! This module turns raw rumqttc events into routing decisions for the event
//! loop, including the broker acknowledgements used for publish outcomes.

use crate::protocol::PublishAck;
use rumqttc::v5::mqttbytes::v5::{Packet, PubAckReason, PubRecReason};
use rumqttc::v5::Event;
use rumqttc::Outgoing;

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.to_vec(),
                    retain: publish.retain,
                },
                Packet::Disconnect(_) => EventRoute::Disconnected,
                Packet::PubAck(puback) => EventRoute::PublishAcked {
                    pkid: puback.pkid,
                    outcome: Self::puback_outcome(&puback.reason),
                },
                Packet::PubRec(pubrec) => EventRoute::PublishAcked {
                    pkid: pubrec.pkid,
                    outcome: Self::pubrec_outcome(&pubrec.reason),
                },
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Publish(pkid)) => EventRoute::PublishSent { pkid: *pkid },
            Event::Outgoing(Outgoing::Disconnect) => EventRoute::DisconnectSent,
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Reason codes below 0x80 are successes; "no matching subscribers" still
    /// means the broker accepted the message
    pub fn puback_outcome(reason: &PubAckReason) -> PublishAck {
        match reason {
            PubAckReason::Success | PubAckReason::NoMatchingSubscribers => PublishAck::Acknowledged,
            other => PublishAck::Rejected(format!("{other:?}")),
        }
    }

    /// PUBREC is the broker's receipt for QoS 2
    pub fn pubrec_outcome(reason: &PubRecReason) -> PublishAck {
        match reason {
            PubRecReason::Success | PubRecReason::NoMatchingSubscribers => PublishAck::Acknowledged,
            other => PublishAck::Rejected(format!("{other:?}")),
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Connection acknowledged - ready to publish/subscribe
    ConnectionAcknowledged,
    /// Message received on subscribed topic
    MessageReceived {
        topic: String,
        payload: Vec<u8>,
        retain: bool,
    },
    /// MQTT broker disconnected
    Disconnected,
    /// A queued publish was written to the socket with this packet id
    PublishSent { pkid: u16 },
    /// Broker acknowledgement for an earlier publish
    PublishAcked { pkid: u16, outcome: PublishAck },
    /// Subscription confirmed
    SubscriptionConfirmed { packet_id: u16 },
    /// Our DISCONNECT went out
    DisconnectSent,
    /// Infrastructure event (PingResp, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}
