//! Device addressing for robot agents
//!
//! Maps a logical agent identifier to the topic pair the agent listens and
//! reports on. Everything here is pure: no state, no I/O.
//!
//! - commands: `agent/{id}/commands`
//! - state:    `agent/{id}/state`

use thiserror::Error;

/// Root segment shared by every agent topic
pub const AGENT_TOPIC_ROOT: &str = "agent";

/// Wildcard filter covering the state topic of every agent
pub const STATE_SUBSCRIPTION: &str = "agent/+/state";

const COMMANDS_SEGMENT: &str = "commands";
const STATE_SEGMENT: &str = "state";

/// Command/state topic pair for a single agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentTopics {
    pub agent_id: String,
    pub command: String,
    pub state: String,
}

impl AgentTopics {
    /// Derive the topic pair for `agent_id`, rejecting malformed identifiers
    pub fn for_agent(agent_id: &str) -> Result<Self, AddressError> {
        validate_agent_id(agent_id)?;
        Ok(Self {
            agent_id: agent_id.to_string(),
            command: format!("{AGENT_TOPIC_ROOT}/{agent_id}/{COMMANDS_SEGMENT}"),
            state: format!("{AGENT_TOPIC_ROOT}/{agent_id}/{STATE_SEGMENT}"),
        })
    }
}

/// Build the command topic for `agent_id`
pub fn command_topic(agent_id: &str) -> Result<String, AddressError> {
    AgentTopics::for_agent(agent_id).map(|topics| topics.command)
}

/// Build the state topic for `agent_id`
pub fn state_topic(agent_id: &str) -> Result<String, AddressError> {
    AgentTopics::for_agent(agent_id).map(|topics| topics.state)
}

/// Extract the agent id from `agent/{id}/state`
pub fn agent_id_from_state_topic(topic: &str) -> Option<&str> {
    agent_id_from_topic(topic, STATE_SEGMENT)
}

/// Extract the agent id from `agent/{id}/commands`
pub fn agent_id_from_command_topic(topic: &str) -> Option<&str> {
    agent_id_from_topic(topic, COMMANDS_SEGMENT)
}

fn agent_id_from_topic<'a>(topic: &'a str, suffix: &str) -> Option<&'a str> {
    let mut segments = topic.split('/');
    match (segments.next(), segments.next(), segments.next(), segments.next()) {
        (Some(AGENT_TOPIC_ROOT), Some(id), Some(last), None)
            if last == suffix && validate_agent_id(id).is_ok() =>
        {
            Some(id)
        }
        _ => None,
    }
}

/// MQTT topic filter matching with `+` (single level) and `#` (multi level)
pub fn topic_matches_filter(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Agent ids must match `[a-zA-Z0-9._-]+`, which keeps MQTT separators and
/// wildcards out of generated topics
pub fn validate_agent_id(agent_id: &str) -> Result<(), AddressError> {
    if agent_id.is_empty() {
        return Err(AddressError::EmptyAgentId);
    }

    for ch in agent_id.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '.' && ch != '_' && ch != '-' {
            return Err(AddressError::InvalidAgentIdChar(ch));
        }
    }

    Ok(())
}

/// Addressing errors
#[derive(Debug, Error, PartialEq)]
pub enum AddressError {
    #[error("Agent ID cannot be empty")]
    EmptyAgentId,
    #[error("Agent ID contains invalid character: '{0}'")]
    InvalidAgentIdChar(char),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn state_topic_always_matches_subscription(id in "[a-zA-Z0-9._-]{1,64}") {
            let topics = AgentTopics::for_agent(&id).unwrap();
            prop_assert!(topic_matches_filter(STATE_SUBSCRIPTION, &topics.state));
            prop_assert!(!topic_matches_filter(STATE_SUBSCRIPTION, &topics.command));
        }

        #[test]
        fn agent_id_recoverable_from_topics(id in "[a-zA-Z0-9._-]{1,64}") {
            let topics = AgentTopics::for_agent(&id).unwrap();
            prop_assert_eq!(agent_id_from_state_topic(&topics.state), Some(id.as_str()));
            prop_assert_eq!(agent_id_from_command_topic(&topics.command), Some(id.as_str()));
        }

        #[test]
        fn invalid_agent_ids_rejected(id in "[^a-zA-Z0-9._-]{1}[a-zA-Z0-9._-]*") {
            prop_assert!(AgentTopics::for_agent(&id).is_err(), "Invalid agent ID should fail: {}", id);
        }
    }

    #[test]
    fn test_topic_pair_for_robot() {
        let topics = AgentTopics::for_agent("robot1").unwrap();
        assert_eq!(topics.command, "agent/robot1/commands");
        assert_eq!(topics.state, "agent/robot1/state");
        assert_eq!(topics.agent_id, "robot1");

        assert_eq!(command_topic("esp32").unwrap(), "agent/esp32/commands");
        assert_eq!(state_topic("esp32").unwrap(), "agent/esp32/state");
    }

    #[test]
    fn test_wildcard_characters_rejected() {
        assert_eq!(
            AgentTopics::for_agent("robot+"),
            Err(AddressError::InvalidAgentIdChar('+'))
        );
        assert_eq!(
            AgentTopics::for_agent("#"),
            Err(AddressError::InvalidAgentIdChar('#'))
        );
        assert_eq!(
            AgentTopics::for_agent("a/b"),
            Err(AddressError::InvalidAgentIdChar('/'))
        );
        assert_eq!(AgentTopics::for_agent(""), Err(AddressError::EmptyAgentId));
        assert!(AgentTopics::for_agent("robot 1").is_err());
    }

    #[test]
    fn test_agent_id_from_foreign_topics() {
        assert_eq!(agent_id_from_state_topic("robot/robot1/position"), None);
        assert_eq!(agent_id_from_state_topic("agent/robot1/state/extra"), None);
        assert_eq!(agent_id_from_state_topic("agent//state"), None);
        assert_eq!(agent_id_from_state_topic("agent/robot1/commands"), None);
        assert_eq!(agent_id_from_command_topic("agent/robot1/state"), None);
    }

    #[test]
    fn test_topic_filter_matching() {
        assert!(topic_matches_filter("agent/+/state", "agent/r1/state"));
        assert!(!topic_matches_filter("agent/+/state", "agent/r1/x/state"));
        assert!(!topic_matches_filter("agent/+/state", "agent/r1"));
        assert!(topic_matches_filter("agent/#", "agent/r1/state"));
        assert!(topic_matches_filter("#", "anything/at/all"));
        assert!(topic_matches_filter("a/b", "a/b"));
        assert!(!topic_matches_filter("a/b", "a/c"));
    }
}
