use approx::assert_abs_diff_eq;
use mongodb_sdam::apm::{Listener, TopologyEvent};
use mongodb_sdam::topology::monitor::Monitor;
use mongodb_sdam::topology::server::ServerType;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::support::{self, host, MockConnector};

fn monitor_for(name: &str, connector: &Arc<MockConnector>) -> (Monitor, Arc<Mutex<Vec<TopologyEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let listener = Arc::new(Listener::new());
    listener
        .add_hook(Box::new(move |event: &TopologyEvent| sink.lock().unwrap().push(event.clone())))
        .unwrap();

    let options = support::test_options(&[name]);
    let monitor = Monitor::new(host(name), connector.clone(), &options, listener);
    (monitor, events)
}

fn kinds(events: &Arc<Mutex<Vec<TopologyEvent>>>) -> Vec<&'static str> {
    events
        .lock()
        .unwrap()
        .iter()
        .map(|event| match *event {
            TopologyEvent::ServerHeartbeatStarted { .. } => "started",
            TopologyEvent::ServerHeartbeatSucceeded { .. } => "succeeded",
            TopologyEvent::ServerHeartbeatFailed { .. } => "failed",
            _ => "other",
        })
        .collect()
}

#[test]
fn successful_check_describes_server() {
    support::init_tracing();
    let connector = MockConnector::new();
    connector.reply(&host("a"), support::primary("rs", &["a", "b"]));

    let (mut monitor, events) = monitor_for("a", &connector);
    let description = monitor.check(ServerType::Unknown, None);

    assert_eq!(description.server_type, ServerType::RSPrimary);
    assert_eq!(description.set_name, Some("rs".to_owned()));
    assert_eq!(description.hosts, vec![host("a"), host("b")]);
    assert!(description.error.is_none());
    assert!(description.round_trip_time.is_some());
    assert_eq!(kinds(&events), vec!["started", "succeeded"]);
}

#[test]
fn unreachable_unknown_server_is_not_retried() {
    let connector = MockConnector::new();
    connector.refuse(&host("a"));

    let (mut monitor, events) = monitor_for("a", &connector);
    let description = monitor.check(ServerType::Unknown, None);

    assert_eq!(description.server_type, ServerType::Unknown);
    assert!(description.error.is_some());
    assert_eq!(connector.connects(&host("a")), 1);
    assert_eq!(kinds(&events), vec!["started", "failed"]);
}

#[test]
fn known_server_is_retried_once_on_a_new_connection() {
    let connector = MockConnector::new();
    connector.reply(&host("a"), support::standalone());

    let (mut monitor, events) = monitor_for("a", &connector);
    assert_eq!(monitor.check(ServerType::Unknown, None).server_type, ServerType::Standalone);
    assert_eq!(connector.connects(&host("a")), 1);

    connector.fail_heartbeats(&host("a"), 1);
    let description = monitor.check(ServerType::Standalone, None);

    assert_eq!(description.server_type, ServerType::Standalone);
    assert_eq!(connector.connects(&host("a")), 2);
    assert_eq!(
        kinds(&events),
        vec!["started", "succeeded", "started", "failed", "started", "succeeded"]
    );
}

#[test]
fn failed_retry_resets_round_trip_time() {
    let connector = MockConnector::new();
    connector.reply(&host("a"), support::standalone());

    let (mut monitor, _) = monitor_for("a", &connector);
    monitor.check(ServerType::Unknown, None);
    assert!(monitor.round_trip_time().is_some());

    connector.fail_heartbeats(&host("a"), 2);
    let description = monitor.check(ServerType::Standalone, None);

    assert_eq!(description.server_type, ServerType::Unknown);
    assert!(description.error.is_some());
    assert_eq!(description.round_trip_time, None);
    assert_eq!(monitor.round_trip_time(), None);
}

#[test]
fn round_trip_time_is_a_moving_average() {
    let connector = MockConnector::new();
    connector.reply(&host("a"), support::standalone());
    connector.set_latency(&host("a"), Duration::from_millis(50));

    let (mut monitor, _) = monitor_for("a", &connector);
    monitor.check(ServerType::Unknown, None);
    let first = monitor.round_trip_time().unwrap();
    assert!(first >= 50.0, "first sample was {}", first);

    connector.set_latency(&host("a"), Duration::from_millis(0));
    let description = monitor.check(ServerType::Standalone, None);
    let second = monitor.round_trip_time().unwrap();

    // The fast sample only carries a fifth of the weight.
    assert_abs_diff_eq!(second, 0.8 * first, epsilon = 5.0);
    assert_eq!(description.round_trip_time, Some(second));
}

#[test]
fn heartbeat_events_carry_the_reply() {
    let connector = MockConnector::new();
    connector.reply(&host("a"), support::mongos());

    let (mut monitor, events) = monitor_for("a", &connector);
    monitor.check(ServerType::Unknown, None);

    let events = events.lock().unwrap();
    match events[1] {
        TopologyEvent::ServerHeartbeatSucceeded { ref address, ref reply, .. } => {
            assert_eq!(*address, host("a"));
            assert!(reply.contains_key("msg"));
        }
        ref other => panic!("expected a succeeded heartbeat, got {:?}", other),
    }
}
