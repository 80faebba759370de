//! Control-channel commands executed against a running node

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use pretty_assertions::assert_eq;
use serde_json::Value;
use tierflow::control::ControlCommand;
use tierflow::grouping::encode_base64_json;
use tierflow::{BrokerConnectionConfig, GroupingConfiguration, ShutdownMode};

use crate::helpers::*;

async fn run(t: &TestNode, line: &str) -> String {
    let command: ControlCommand = line.parse().unwrap();
    t.node.execute(command).await.unwrap()
}

fn recording_node() -> (TestNode, Arc<RecordingConnector>) {
    let connector = Arc::new(RecordingConnector::default());
    (start_node(&node_config(), connector.clone()), connector)
}

#[tokio::test]
async fn test_grouping_configuration_lifecycle() {
    let (t, _) = recording_node();
    let host = pass_through("PER_HOST", "cpu", "host_cpu")
        .with_forward("host_cpu", BrokerConnectionConfig::new("PER_CLOUD", CLOUD_BROKER));
    let cloud = pass_through("PER_CLOUD", "host_cpu", "cloud_cpu");

    assert_eq!(run(&t, &format!("SET-GROUPING-CONFIG {}", host.encode().unwrap())).await, "OK PER_HOST");
    assert_eq!(run(&t, &format!("SET-GROUPING-CONFIG {}", cloud.encode().unwrap())).await, "OK PER_CLOUD");
    assert_eq!(run(&t, "LIST-GROUPING-CONFIGS").await, r#"["PER_CLOUD","PER_HOST"]"#);

    let fetched = GroupingConfiguration::decode(&run(&t, "GET-GROUPING-CONFIG per_host").await).unwrap();
    assert_eq!(fetched.rules, host.rules);
    assert_eq!(fetched.broker_connections, host.broker_connections);

    assert_eq!(run(&t, "GET-ACTIVE-GROUPING").await, "NONE");
    assert_eq!(
        run(&t, "SET-ACTIVE-GROUPING PER_HOST").await,
        "OK Added([PerCloud, PerHost])"
    );
    assert_eq!(run(&t, "GET-ACTIVE-GROUPING").await, "PER_HOST");
    assert_eq!(run(&t, "SET-ACTIVE-GROUPING PER_HOST").await, "OK Unchanged");

    assert_eq!(run(&t, "CLEAR-GROUPING-CONFIGS").await, "OK");
    assert_eq!(run(&t, "LIST-GROUPING-CONFIGS").await, "[]");
    assert_eq!(run(&t, "GET-ACTIVE-GROUPING").await, "NONE");
    assert!(t.cep.subscriber_names().is_empty());
}

#[tokio::test]
async fn test_invalid_requests_fail() {
    let (t, _) = recording_node();

    for line in [
        "GET-GROUPING-CONFIG PER_ZONE",
        "SET-ACTIVE-GROUPING PER_HOST",
        "SET-ACTIVE-GROUPING GLOBAL",
        "SET-ACTIVE-GROUPING PER_RACK",
        "SET-GROUPING-CONFIG bm90IGpzb24=",
        "SET-CONSTANTS %%%",
    ] {
        let command: ControlCommand = line.parse().unwrap();
        assert!(t.node.execute(command).await.is_err(), "command should fail: {line}");
    }
}

#[tokio::test]
async fn test_constants_and_broker_connection_need_active_grouping() {
    let (t, _) = recording_node();
    let constants = encode_base64_json(&HashMap::from([("threshold".to_string(), 0.8)])).unwrap();
    let moved = encode_base64_json(&BrokerConnectionConfig::new("PER_CLOUD", "ssl://10.0.0.7:61616")).unwrap();

    assert_eq!(run(&t, &format!("SET-CONSTANTS {constants}")).await, "IGNORED");
    assert_eq!(run(&t, &format!("SET-BROKER-CONNECTION {moved}")).await, "IGNORED");

    let host = pass_through("PER_HOST", "cpu", "host_cpu")
        .with_forward("host_cpu", BrokerConnectionConfig::new("PER_CLOUD", CLOUD_BROKER));
    t.node.topology().put_configuration(host).unwrap();
    run(&t, "SET-ACTIVE-GROUPING PER_HOST").await;

    assert_eq!(run(&t, &format!("SET-CONSTANTS {constants}")).await, "OK");
    assert_eq!(t.cep.constants()["threshold"], 0.8);

    assert_eq!(run(&t, &format!("SET-BROKER-CONNECTION {moved}")).await, "OK");
    let subscribers = t.node.topology().subscribers();
    let urls: Vec<String> = subscribers
        .values()
        .flatten()
        .flat_map(|s| s.forward_to_groupings().iter().map(|c| c.url.clone()).collect::<Vec<_>>())
        .collect();
    assert_eq!(urls, vec!["ssl://10.0.0.7:61616"]);
}

#[tokio::test]
async fn test_send_event_reaches_remote_broker() {
    let (t, connector) = recording_node();

    assert_eq!(
        run(&t, r#"SEND-EVENT tcp://10.0.0.9:61616 cloud_cpu {"metricValue": 7, "host": "a b"}"#).await,
        "OK"
    );
    wait_idle(t.node.forwarder()).await;

    let sent = connector.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "tcp://10.0.0.9:61616");
    assert_eq!(sent[0].1.topic, "cloud_cpu");
    let body: Value = serde_json::from_str(&sent[0].1.body).unwrap();
    assert_eq!(body["host"], "a b");
    assert_eq!(t.node.stats().snapshot().forward_success, 1);
}

#[tokio::test]
async fn test_cache_commands() {
    let (t, _) = recording_node();

    run(&t, r#"SEND-LOCAL-EVENT cpu {"metricValue": 1}"#).await;
    run(&t, "CACHE EXCLUDE heartbeat").await;
    run(&t, r#"SEND-LOCAL-EVENT heartbeat {"metricValue": 1}"#).await;
    run(&t, r#"SEND-LOCAL-EVENT mem {"metricValue": 2}"#).await;
    wait_idle(t.node.forwarder()).await;

    let listed: Vec<Value> = serde_json::from_str(&run(&t, "CACHE LIST").await).unwrap();
    let destinations: Vec<&str> = listed.iter().filter_map(|e| e["destination"].as_str()).collect();
    assert_eq!(destinations, vec!["cpu", "mem"]);
    assert_eq!(listed[1]["counter"], 1);

    assert_eq!(run(&t, "CACHE CLEAR").await, "OK");
    assert!(t.node.cache().is_empty());
    assert_eq!(t.node.cache().counter(), 2);

    run(&t, "CACHE INCLUDE heartbeat").await;
    assert!(t.node.cache().excluded_destinations().is_empty());

    assert_eq!(run(&t, "CACHE CLEAR RESET").await, "OK");
    assert_eq!(t.node.cache().counter(), 0);
}

#[tokio::test]
async fn test_stats_commands() {
    let (t, _) = recording_node();
    run(&t, r#"SEND-LOCAL-EVENT cpu {"metricValue": 1}"#).await;
    wait_idle(t.node.forwarder()).await;

    let stats: Value = serde_json::from_str(&run(&t, "GET-STATS").await).unwrap();
    assert_eq!(stats["statistics"]["local_publish_success"], 1);
    assert_eq!(stats["forwarder"]["completed"], 1);

    assert_eq!(run(&t, "CLEAR-STATS").await, "OK");
    assert_eq!(t.node.stats().snapshot().local_publish_success, 0);
}

#[tokio::test]
async fn test_concurrent_commands_are_all_delivered() {
    let (t, _) = recording_node();

    let commands = (0..50).map(|i| {
        t.node.execute(ControlCommand::SendLocalEvent {
            topic: format!("cpu_{}", i % 5),
            event: format!(r#"{{"metricValue": {i}}}"#),
        })
    });
    let results = join_all(commands).await;
    assert!(results.iter().all(|r| r.is_ok()));

    wait_idle(t.node.forwarder()).await;
    assert_eq!(t.node.stats().snapshot().local_publish_success, 50);
    assert_eq!(t.cep.received(), 50);
}

#[tokio::test]
async fn test_exit_and_shutdown() {
    let (t, _) = recording_node();
    assert_eq!(run(&t, "EXIT").await, "BYE");

    run(&t, r#"SEND-LOCAL-EVENT cpu {"metricValue": 1}"#).await;
    let remaining = t.node.shutdown(ShutdownMode::Drain).await.unwrap();
    assert!(remaining <= 1);
    assert_eq!(t.node.forwarder().pending(), 0);
    assert!(t.node.forwarder().stats().await.is_err());
}
