//! Rule output through the forward queue
//!
//! Events enter the engine, pass-through rules fire, subscribers enqueue one
//! local publish plus one forward per configured target, and the forwarder
//! delivers them with the configured retry bounds.

use std::sync::Arc;

use tierflow::actors::forwarder::EventForwarder;
use tierflow::broker::ConsumerRegistry;
use tierflow::cep::{CepEngine, InMemoryEngine};
use tierflow::config::ForwarderConfig;
use tierflow::stats::ForwardStatistics;
use tierflow::{BrokerConnectionConfig, EventMap, ForwarderHandle, ShutdownMode, TopologyManager};

use crate::helpers::*;

struct Pipeline {
    manager: TopologyManager,
    cep: Arc<InMemoryEngine>,
    stats: Arc<ForwardStatistics>,
    forwarder: ForwarderHandle,
}

fn pipeline(forwarder: ForwarderHandle) -> Pipeline {
    let cep = Arc::new(InMemoryEngine::new());
    let stats = Arc::new(ForwardStatistics::new());
    let manager = TopologyManager::new(
        cep.clone(),
        Arc::new(ConsumerRegistry::new()),
        forwarder.clone(),
        stats.clone(),
    );
    manager
        .put_configuration(pass_through("PER_CLOUD", "host_cpu", "cloud_cpu"))
        .unwrap();
    manager
        .put_configuration(
            pass_through("PER_HOST", "cpu", "host_cpu")
                .with_forward("host_cpu", BrokerConnectionConfig::new("PER_CLOUD", CLOUD_BROKER)),
        )
        .unwrap();
    manager.set_active_grouping("PER_HOST").unwrap();

    Pipeline {
        manager,
        cep,
        stats,
        forwarder,
    }
}

fn spawned(config: ForwarderConfig, publisher: Arc<ScriptedPublisher>) -> Pipeline {
    pipeline(ForwarderHandle::spawn(&config, local_broker(), publisher))
}

#[tokio::test(start_paused = true)]
async fn test_rule_output_is_published_and_forwarded() {
    let publisher = ScriptedPublisher::new();
    let p = spawned(forwarder_config(Some(3), None), publisher.clone());

    p.cep.handle_event("cpu", EventMap::new(0.42)).unwrap();
    wait_idle(&p.forwarder).await;

    let mut attempts = publisher.attempts();
    attempts.sort();
    assert_eq!(
        attempts,
        vec![
            (CLOUD_BROKER.to_string(), "host_cpu".to_string()),
            (LOCAL_BROKER.to_string(), "host_cpu".to_string()),
        ]
    );

    let snapshot = p.stats.snapshot();
    assert_eq!(snapshot.local_publish_success, 1);
    assert_eq!(snapshot.forward_success, 1);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried_until_delivered() {
    let publisher = ScriptedPublisher::new();
    publisher.fail(CLOUD_BROKER, 2);
    let p = spawned(forwarder_config(Some(3), None), publisher.clone());

    p.cep.handle_event("cpu", EventMap::new(1.0)).unwrap();
    wait_idle(&p.forwarder).await;

    assert_eq!(publisher.attempts_to(CLOUD_BROKER), 3);
    let snapshot = p.stats.snapshot();
    assert_eq!(snapshot.forward_success, 1);
    assert_eq!(snapshot.forward_failure, 0);

    let stats = p.forwarder.stats().await.unwrap();
    assert_eq!(stats.retried, 2);
    assert_eq!(stats.completed, 2);
}

#[tokio::test(start_paused = true)]
async fn test_persistent_failure_drops_after_max_retries() {
    let publisher = ScriptedPublisher::new();
    publisher.fail(CLOUD_BROKER, u32::MAX);
    let p = spawned(forwarder_config(Some(2), None), publisher.clone());

    p.cep.handle_event("cpu", EventMap::new(1.0)).unwrap();
    wait_idle(&p.forwarder).await;

    assert_eq!(publisher.attempts_to(CLOUD_BROKER), 3);
    let snapshot = p.stats.snapshot();
    assert_eq!(snapshot.forward_failure, 1);
    assert_eq!(snapshot.forward_success, 0);
    assert_eq!(snapshot.local_publish_success, 1);
}

#[tokio::test(start_paused = true)]
async fn test_persistent_failure_drops_after_max_duration() {
    let publisher = ScriptedPublisher::new();
    publisher.fail(CLOUD_BROKER, u32::MAX);
    let config = ForwarderConfig {
        loop_delay_ms: 100,
        max_retries: None,
        max_duration_ms: Some(1_000),
    };
    let p = spawned(config, publisher.clone());

    p.cep.handle_event("cpu", EventMap::new(1.0)).unwrap();
    wait_idle(&p.forwarder).await;

    assert!(publisher.attempts_to(CLOUD_BROKER) > 1);
    assert_eq!(p.stats.snapshot().forward_failure, 1);
    assert_eq!(p.forwarder.stats().await.unwrap().dropped, 1);
}

#[tokio::test(start_paused = true)]
async fn test_queued_forward_follows_moved_aggregator() {
    let publisher = ScriptedPublisher::new();
    let (handle, queue) = ForwarderHandle::channel(local_broker());
    let p = pipeline(handle);

    // Queued while the forwarder is not running yet
    p.cep.handle_event("cpu", EventMap::new(1.0)).unwrap();
    assert_eq!(p.forwarder.pending(), 2);

    let moved = "ssl://10.0.0.7:61616";
    assert!(
        p.manager
            .update_broker_connection(BrokerConnectionConfig::new("PER_CLOUD", moved))
            .unwrap()
    );

    tokio::spawn(EventForwarder::new(&forwarder_config(Some(3), None), publisher.clone(), queue).run());
    wait_idle(&p.forwarder).await;

    assert_eq!(publisher.attempts_to(moved), 1);
    assert_eq!(publisher.attempts_to(CLOUD_BROKER), 0);
}

#[tokio::test(start_paused = true)]
async fn test_queued_forward_goes_local_when_node_becomes_aggregator() {
    let publisher = ScriptedPublisher::new();
    let (handle, queue) = ForwarderHandle::channel(local_broker());
    let p = pipeline(handle);

    p.cep.handle_event("cpu", EventMap::new(1.0)).unwrap();
    p.manager.set_active_grouping("PER_CLOUD").unwrap();

    tokio::spawn(EventForwarder::new(&forwarder_config(Some(3), None), publisher.clone(), queue).run());
    wait_idle(&p.forwarder).await;

    assert_eq!(publisher.attempts_to(LOCAL_BROKER), 2);
    assert_eq!(publisher.attempts_to(CLOUD_BROKER), 0);
    assert_eq!(p.stats.snapshot().forward_success, 1);
}

#[tokio::test(start_paused = true)]
async fn test_drain_on_shutdown_delivers_queued_tasks() {
    let publisher = ScriptedPublisher::new();
    let (handle, queue) = ForwarderHandle::channel(local_broker());
    let p = pipeline(handle);

    p.cep.handle_event("cpu", EventMap::new(1.0)).unwrap();
    p.cep.handle_event("cpu", EventMap::new(2.0)).unwrap();

    tokio::spawn(EventForwarder::new(&forwarder_config(Some(3), None), publisher.clone(), queue).run());
    let remaining = p.forwarder.shutdown(ShutdownMode::Drain).await.unwrap();

    assert_eq!(remaining, 4);
    assert_eq!(publisher.attempts().len(), 4);
    assert_eq!(p.forwarder.pending(), 0);
    assert_eq!(p.stats.snapshot().forward_success, 2);
}
