//! End-to-end dispatch scenarios against the mock transport
//!
//! Devices are simulated by `MockTransport::with_device`, which answers each
//! command on the agent's state topic after a configurable delay. Time is
//! paused so deadline assertions are exact.

use futures::future::join_all;
use nest_dispatch::config::DispatchSection;
use nest_dispatch::dispatch::{ConfirmationCoordinator, StateDispatcher};
use nest_dispatch::protocol::{CommandVerb, DispatchOutcome, QosLevel};
use nest_dispatch::testing::MockTransport;
use nest_dispatch::InboundHandler;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

fn device_setup(
    delay_ms: u64,
) -> (Arc<StateDispatcher>, Arc<MockTransport>, ConfirmationCoordinator) {
    let dispatcher = Arc::new(StateDispatcher::new());
    let transport = Arc::new(MockTransport::with_device(
        dispatcher.clone(),
        Duration::from_millis(delay_ms),
    ));
    let coordinator = ConfirmationCoordinator::new(
        transport.clone(),
        dispatcher.clone(),
        &DispatchSection::default(),
    );
    (dispatcher, transport, coordinator)
}

#[tokio::test(start_paused = true)]
async fn test_robot_turns_on_and_confirms() {
    let (_dispatcher, transport, coordinator) = device_setup(500);

    let result = coordinator
        .dispatch_command("robot1", "on", None)
        .await
        .unwrap();

    assert_eq!(result.outcome, DispatchOutcome::Confirmed);
    assert_eq!(result.state, Some(json!({"state": "on", "status": "ok"})));

    let published = transport.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].topic, "agent/robot1/commands");
    assert_eq!(published[0].payload_json(), Some(json!({"command": "on"})));
    assert_eq!(published[0].qos, QosLevel::AtLeastOnce);
}

#[tokio::test(start_paused = true)]
async fn test_silent_robot_is_pending_within_one_poll_interval() {
    let (_dispatcher, transport, coordinator) = device_setup(0);
    transport.set_agent_delay("robot1", None);

    let started = Instant::now();
    let result = coordinator
        .dispatch_command("robot1", "on", Some(3000))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(result.outcome, DispatchOutcome::Pending);
    assert!(result.state.is_none());
    assert!(elapsed >= Duration::from_millis(3000));
    assert!(elapsed <= Duration::from_millis(3000) + POLL_INTERVAL);
}

#[tokio::test(start_paused = true)]
async fn test_slow_robot_reply_after_deadline_is_pending() {
    let (dispatcher, _transport, coordinator) = device_setup(4000);

    let result = coordinator
        .dispatch_command("robot1", "off", Some(3000))
        .await
        .unwrap();

    assert_eq!(result.outcome, DispatchOutcome::Pending);
    assert_eq!(dispatcher.pending_waits("agent/robot1/state"), 0);
}

#[tokio::test]
async fn test_disconnected_makes_no_network_call() {
    let (_dispatcher, transport, coordinator) = device_setup(10);
    transport.set_connected(false);

    let result = coordinator
        .dispatch_command("robot1", "on", None)
        .await
        .unwrap();

    assert_eq!(result.outcome, DispatchOutcome::NotConnected);
    assert!(transport.published().is_empty());
    assert!(!coordinator.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_late_update_does_not_leak_into_next_wait() {
    let (dispatcher, transport, coordinator) = device_setup(0);
    transport.set_agent_delay("robot1", None);

    let first = coordinator
        .dispatch_command("robot1", "on", Some(1000))
        .await
        .unwrap();
    assert_eq!(first.outcome, DispatchOutcome::Pending);

    // Reply to the first command arrives after its wait expired
    dispatcher.on_message("agent/robot1/state", br#"{"state":"on"}"#, false);

    let second = coordinator
        .dispatch_command("robot1", "off", Some(1000))
        .await
        .unwrap();

    assert_eq!(second.outcome, DispatchOutcome::Pending);
    assert!(second.state.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_late_update_during_next_wait_does_not_confirm_it() {
    let (dispatcher, transport, coordinator) = device_setup(0);
    transport.set_agent_delay("robot1", None);

    let first = coordinator
        .dispatch_command("robot1", "on", Some(1000))
        .await
        .unwrap();
    assert_eq!(first.outcome, DispatchOutcome::Pending);

    let second = tokio::spawn({
        let coordinator = coordinator.clone();
        async move { coordinator.dispatch_command("robot1", "off", Some(1000)).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Reply to the first command arrives while the second is waiting
    dispatcher.on_message("agent/robot1/state", br#"{"state":"on"}"#, false);

    let second = second.await.unwrap().unwrap();
    assert_eq!(second.outcome, DispatchOutcome::Pending);
    assert!(second.state.is_none());
    assert_eq!(
        coordinator.latest_state("robot1").unwrap().state_field(),
        Some("on")
    );
}

#[tokio::test(start_paused = true)]
async fn test_matching_reply_after_stale_one_confirms() {
    let (dispatcher, transport, coordinator) = device_setup(0);
    transport.set_agent_delay("robot1", None);

    let injector = dispatcher.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        injector.on_message("agent/robot1/state", br#"{"state":"on"}"#, false);
        tokio::time::sleep(Duration::from_millis(50)).await;
        injector.on_message("agent/robot1/state", br#"{"state":"off"}"#, false);
    });

    let started = Instant::now();
    let result = coordinator
        .dispatch_command("robot1", "off", Some(1000))
        .await
        .unwrap();

    assert_eq!(result.outcome, DispatchOutcome::Confirmed);
    assert_eq!(result.state_field(), Some("off"));
    assert!(started.elapsed() < Duration::from_millis(200));
}

#[tokio::test(start_paused = true)]
async fn test_slow_broker_ack_respects_timeout() {
    let (_dispatcher, transport, coordinator) = device_setup(0);
    transport.set_agent_delay("robot1", None);
    transport.set_publish_delay(Some(Duration::from_millis(1000)));

    let started = Instant::now();
    let result = coordinator
        .dispatch_command("robot1", "on", Some(200))
        .await
        .unwrap();

    assert_eq!(result.outcome, DispatchOutcome::Pending);
    assert!(started.elapsed() <= Duration::from_millis(200) + POLL_INTERVAL);
}

#[tokio::test(start_paused = true)]
async fn test_stale_cached_state_is_not_a_confirmation() {
    let (dispatcher, transport, coordinator) = device_setup(0);
    dispatcher.on_message("agent/robot1/state", br#"{"state":"off"}"#, false);
    transport.set_agent_delay("robot1", None);

    let result = coordinator
        .dispatch_command("robot1", "off", Some(500))
        .await
        .unwrap();

    assert_eq!(result.outcome, DispatchOutcome::Pending);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_dispatches_match_their_own_agents() {
    let (_dispatcher, transport, coordinator) = device_setup(0);
    // robot2 answers before robot1 even though robot1 was commanded first
    transport.set_agent_delay("robot1", Some(Duration::from_millis(800)));
    transport.set_agent_delay("robot2", Some(Duration::from_millis(100)));

    let robot1 = coordinator.dispatch_command("robot1", "on", Some(3000));
    let robot2 = coordinator.dispatch_command("robot2", "off", Some(3000));
    let (first, second) = tokio::join!(robot1, robot2);

    let first = first.unwrap();
    let second = second.unwrap();
    assert_eq!(first.outcome, DispatchOutcome::Confirmed);
    assert_eq!(first.agent_id, "robot1");
    assert_eq!(first.state_field(), Some("on"));
    assert_eq!(second.outcome, DispatchOutcome::Confirmed);
    assert_eq!(second.agent_id, "robot2");
    assert_eq!(second.state_field(), Some("off"));
}

#[tokio::test(start_paused = true)]
async fn test_fleet_dispatch_with_one_silent_robot() {
    let (_dispatcher, transport, coordinator) = device_setup(200);
    transport.set_agent_delay("robot3", None);

    let agents = ["robot1", "robot2", "robot3", "robot4"];
    let results = join_all(
        agents
            .iter()
            .map(|agent| coordinator.dispatch_command(agent, CommandVerb::On, Some(1000))),
    )
    .await;

    for (agent, result) in agents.iter().zip(results) {
        let result = result.unwrap();
        assert_eq!(result.agent_id, *agent);
        if *agent == "robot3" {
            assert_eq!(result.outcome, DispatchOutcome::Pending);
        } else {
            assert_eq!(result.outcome, DispatchOutcome::Confirmed);
        }
    }
    assert_eq!(transport.published().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_retained_state_never_confirms() {
    let (dispatcher, transport, coordinator) = device_setup(0);
    transport.set_agent_delay("robot1", None);

    let handle = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.dispatch_command("robot1", "on", Some(1000)).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    dispatcher.on_message("agent/robot1/state", br#"{"state":"on"}"#, true);

    let result = handle.await.unwrap().unwrap();
    assert_eq!(result.outcome, DispatchOutcome::Pending);
    assert!(coordinator.latest_state("robot1").unwrap().retained);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_reply_is_dropped_and_wait_continues() {
    let (dispatcher, transport, coordinator) = device_setup(0);
    transport.set_agent_delay("robot1", None);

    let handle = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.dispatch_command("robot1", "on", Some(2000)).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    dispatcher.on_message("agent/robot1/state", b"not json", false);
    tokio::time::sleep(Duration::from_millis(100)).await;
    dispatcher.on_message("agent/robot1/state", br#"{"state":"on"}"#, false);

    let result = handle.await.unwrap().unwrap();
    assert_eq!(result.outcome, DispatchOutcome::Confirmed);
    assert_eq!(result.state_field(), Some("on"));
}

#[tokio::test]
async fn test_dispatch_result_serializes_for_callers() {
    let (_dispatcher, transport, coordinator) = device_setup(10);
    transport.set_connected(false);

    let result = coordinator
        .dispatch_command("robot1", "on", None)
        .await
        .unwrap();

    assert_eq!(
        serde_json::to_value(&result).unwrap(),
        json!({"agent_id": "robot1", "outcome": "not_connected"})
    );
}
