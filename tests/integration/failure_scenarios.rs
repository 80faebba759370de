//! Failure tests for the forwarding path
//!
//! These tests verify that the node degrades gracefully:
//! - Brokers that fail for a while, or for good
//! - Malformed events
//! - Switches that cannot be applied

use std::sync::Arc;

use assert_matches::assert_matches;
use serde_json::Value;
use tierflow::broker::{BrokerConnection, BrokerConnector};
use tierflow::cep::CepEngine;
use tierflow::control::ControlCommand;
use tierflow::error::{BrokerError, TopologyError};
use tierflow::{BrokerConnectionConfig, EventMap, Grouping, GroupingConfiguration};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

async fn forward_stats(t: &TestNode) -> Value {
    let response = t.node.execute(ControlCommand::GetStats).await.unwrap();
    serde_json::from_str(&response).unwrap()
}

#[tokio::test]
async fn test_broker_recovering_after_errors() {
    let mock_server = MockServer::start().await;

    // First two posts fail, then the broker is back
    Mock::given(method("POST"))
        .and(path("/api/message/cloud_cpu"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/message/cloud_cpu"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let t = start_http_node(&node_config());
    t.node
        .execute(ControlCommand::SendEvent {
            url: mock_server.uri(),
            topic: "cloud_cpu".to_string(),
            event: r#"{"metricValue": 3.5}"#.to_string(),
        })
        .await
        .unwrap();
    wait_idle(t.node.forwarder()).await;

    let stats = forward_stats(&t).await;
    assert_eq!(stats["statistics"]["forward_success"], 1);
    assert_eq!(stats["statistics"]["forward_failure"], 0);
    assert_eq!(stats["forwarder"]["retried"], 2);
}

#[tokio::test]
async fn test_unreachable_broker_is_given_up() {
    let t = start_http_node(&node_config());
    t.node
        .execute(ControlCommand::SendEvent {
            url: "tcp://127.0.0.1:1".to_string(),
            topic: "cloud_cpu".to_string(),
            event: r#"{"metricValue": 3.5}"#.to_string(),
        })
        .await
        .unwrap();
    wait_idle(t.node.forwarder()).await;

    let stats = forward_stats(&t).await;
    assert_eq!(stats["statistics"]["forward_failure"], 1);
    assert_eq!(stats["forwarder"]["dropped"], 1);
    assert_eq!(stats["forwarder"]["pending"], 0);
}

#[tokio::test]
async fn test_broker_refusing_connections() {
    struct Refusing;

    #[async_trait::async_trait]
    impl BrokerConnector for Refusing {
        async fn connect(
            &self,
            url: &str,
            _username: Option<&str>,
            _password: Option<&str>,
        ) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
            Err(BrokerError::ConnectionFailed {
                url: url.to_string(),
                reason: "connection refused".to_string(),
            })
        }
    }

    let t = start_node(&node_config(), Arc::new(Refusing));
    t.node
        .execute(ControlCommand::SendEvent {
            url: CLOUD_BROKER.to_string(),
            topic: "cloud_cpu".to_string(),
            event: r#"{"metricValue": 1}"#.to_string(),
        })
        .await
        .unwrap();
    t.node
        .execute(r#"SEND-LOCAL-EVENT cpu {"metricValue": 1}"#.parse().unwrap())
        .await
        .unwrap();
    wait_idle(t.node.forwarder()).await;

    // Local publishes never depend on remote brokers
    let snapshot = t.node.stats().snapshot();
    assert_eq!(snapshot.forward_failure, 1);
    assert_eq!(snapshot.local_publish_success, 1);
}

#[tokio::test]
async fn test_malformed_events_are_rejected() {
    let t = start_node(&node_config(), Arc::new(RecordingConnector::default()));

    for event in [
        r#"{"level": 1}"#,
        r#"{"metricValue": "high"}"#,
        r#"[1, 2, 3]"#,
        "not json",
    ] {
        let result = t
            .node
            .execute(ControlCommand::SendLocalEvent {
                topic: "cpu".to_string(),
                event: event.to_string(),
            })
            .await;
        assert!(result.is_err(), "event should be rejected: {event}");
    }
    assert_eq!(t.node.forwarder().pending(), 0);
}

#[tokio::test]
async fn test_rule_output_with_errors_is_not_enqueued() {
    let t = start_node(&node_config(), Arc::new(RecordingConnector::default()));
    t.node
        .topology()
        .put_configuration(pass_through("PER_HOST", "cpu", "host_cpu"))
        .unwrap();
    t.node.topology().set_active_grouping("PER_HOST").unwrap();

    let subscribers = t.node.topology().subscribers();
    let subscriber = subscribers.values().flatten().next().unwrap();
    let mut broken = EventMap::new(1.0);
    broken.insert("metricValue", Value::String("NaN".to_string()));
    subscriber.update(broken);

    assert_eq!(t.node.forwarder().pending(), 0);
    assert_eq!(t.node.stats().snapshot().local_publish_failure, 1);
}

#[tokio::test]
async fn test_failed_switch_keeps_previous_grouping_reachable() {
    let t = start_node(&node_config(), Arc::new(RecordingConnector::default()));
    let topology = t.node.topology();
    topology
        .put_configuration(pass_through("PER_CLOUD", "host_cpu", "cloud_cpu"))
        .unwrap();

    let mut broken = pass_through("PER_HOST", "cpu", "host_cpu");
    broken
        .connections
        .insert("host_cpu".to_string(), ["PER_CLOUD".to_string()].into());
    topology.put_configuration(broken).unwrap();

    topology.set_active_grouping("PER_CLOUD").unwrap();
    assert_matches!(
        topology.set_active_grouping("PER_HOST"),
        Err(TopologyError::MissingConnection { target, .. }) if target == "PER_CLOUD"
    );
    assert_eq!(topology.active_grouping(), Some(Grouping::PerCloud));

    // Fixing the configuration makes the switch go through
    let fixed = pass_through("PER_HOST", "cpu", "host_cpu")
        .with_forward("host_cpu", BrokerConnectionConfig::new("PER_CLOUD", CLOUD_BROKER));
    topology.put_configuration(fixed).unwrap();
    topology.set_active_grouping("PER_HOST").unwrap();
    assert!(t.consumers.is_consuming("cpu"));
}

#[tokio::test]
async fn test_events_for_removed_grouping_do_not_fire() {
    let t = start_node(&node_config(), Arc::new(RecordingConnector::default()));
    let topology = t.node.topology();
    topology
        .put_configuration(pass_through("PER_CLOUD", "host_cpu", "cloud_cpu"))
        .unwrap();
    topology
        .put_configuration(GroupingConfiguration::new("PER_HOST").with_rule("host_cpu", "SELECT * FROM cpu"))
        .unwrap();
    topology.set_active_grouping("PER_HOST").unwrap();
    topology.set_active_grouping("PER_CLOUD").unwrap();

    t.cep.handle_event("cpu", EventMap::new(1.0)).unwrap();
    assert_eq!(t.node.forwarder().pending(), 0);
}
