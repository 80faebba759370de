//! Grouping switches across the whole hierarchy
//!
//! Configured: GLOBAL, PER_CLOUD, PER_HOST, PER_INSTANCE. PER_REGION and
//! PER_ZONE have no configuration and must be skipped.

use std::collections::BTreeSet;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use tierflow::broker::ConsumerRegistry;
use tierflow::cep::InMemoryEngine;
use tierflow::stats::ForwardStatistics;
use tierflow::{
    BrokerConnectionConfig, ForwarderHandle, Grouping, SwitchOutcome, TopologyEvent, TopologyManager,
};

use crate::helpers::*;

struct Scenario {
    manager: TopologyManager,
    cep: Arc<InMemoryEngine>,
    consumers: Arc<ConsumerRegistry>,
}

fn scenario() -> Scenario {
    let cep = Arc::new(InMemoryEngine::new());
    let consumers = Arc::new(ConsumerRegistry::new());
    let (forwarder, _queue) = ForwarderHandle::channel(local_broker());
    let manager = TopologyManager::new(
        cep.clone(),
        consumers.clone(),
        forwarder,
        Arc::new(ForwardStatistics::new()),
    );

    let global = BrokerConnectionConfig::new("GLOBAL", "ssl://10.0.0.100:61616");
    let cloud = BrokerConnectionConfig::new("PER_CLOUD", CLOUD_BROKER);
    let host = BrokerConnectionConfig::new("PER_HOST", "ssl://10.0.1.1:61616");

    for configuration in [
        pass_through("GLOBAL", "cloud_cpu", "global_cpu"),
        pass_through("PER_CLOUD", "host_cpu", "cloud_cpu").with_forward("cloud_cpu", global),
        pass_through("PER_HOST", "cpu", "host_cpu").with_forward("host_cpu", cloud),
        pass_through("PER_INSTANCE", "app_cpu", "instance_cpu").with_forward("instance_cpu", host),
    ] {
        manager.put_configuration(configuration).unwrap();
    }

    Scenario {
        manager,
        cep,
        consumers,
    }
}

/// (grouping, topic, statement, forward urls) of every live subscriber
fn wiring(manager: &TopologyManager) -> BTreeSet<(Grouping, String, String, Vec<String>)> {
    manager
        .subscribers()
        .into_iter()
        .flat_map(|(grouping, subscribers)| {
            subscribers.into_iter().map(move |s| {
                let urls = s.forward_to_groupings().iter().map(|c| c.url.clone()).collect();
                (grouping, s.topic().to_string(), s.statement().to_string(), urls)
            })
        })
        .collect()
}

fn chain(manager: &TopologyManager) -> Vec<Grouping> {
    manager.subscribers().keys().copied().collect()
}

#[test]
fn test_switch_sequence_adds_and_removes_in_order() {
    let s = scenario();

    assert_eq!(
        s.manager.set_active_grouping("PER_HOST").unwrap(),
        SwitchOutcome::Added(vec![Grouping::PerCloud, Grouping::PerHost])
    );
    assert_eq!(chain(&s.manager), vec![Grouping::PerCloud, Grouping::PerHost]);

    assert_eq!(
        s.manager.set_active_grouping("PER_INSTANCE").unwrap(),
        SwitchOutcome::Added(vec![Grouping::PerInstance])
    );
    assert_eq!(
        chain(&s.manager),
        vec![Grouping::PerCloud, Grouping::PerHost, Grouping::PerInstance]
    );

    assert_eq!(
        s.manager.set_active_grouping("PER_CLOUD").unwrap(),
        SwitchOutcome::Removed(vec![Grouping::PerInstance, Grouping::PerHost])
    );
    assert_eq!(chain(&s.manager), vec![Grouping::PerCloud]);
    assert_eq!(s.manager.active_grouping(), Some(Grouping::PerCloud));
}

#[test]
fn test_global_is_never_part_of_the_chain() {
    let s = scenario();
    s.manager.set_active_grouping("PER_INSTANCE").unwrap();

    assert!(!chain(&s.manager).contains(&Grouping::Global));
    assert!(!s.consumers.is_consuming("cloud_cpu"));
}

#[test]
fn test_only_active_grouping_forwards() {
    let s = scenario();
    s.manager.set_active_grouping("PER_INSTANCE").unwrap();

    let forwarding: Vec<Grouping> = wiring(&s.manager)
        .into_iter()
        .filter(|(_, _, _, urls)| !urls.is_empty())
        .map(|(grouping, ..)| grouping)
        .collect();
    assert_eq!(forwarding, vec![Grouping::PerInstance]);

    s.manager.set_active_grouping("PER_CLOUD").unwrap();
    let forwarding: Vec<(Grouping, Vec<String>)> = wiring(&s.manager)
        .into_iter()
        .map(|(grouping, _, _, urls)| (grouping, urls))
        .collect();
    assert_eq!(
        forwarding,
        vec![(Grouping::PerCloud, vec!["ssl://10.0.0.100:61616".to_string()])]
    );
}

#[test]
fn test_switch_to_active_grouping_changes_nothing() {
    let s = scenario();
    s.manager.set_active_grouping("PER_HOST").unwrap();
    let before = wiring(&s.manager);
    let names = s.cep.subscriber_names();
    let mut events = s.manager.subscribe();

    assert_eq!(s.manager.set_active_grouping("PER_HOST").unwrap(), SwitchOutcome::Unchanged);
    assert_eq!(wiring(&s.manager), before);
    assert_eq!(s.cep.subscriber_names(), names);
    assert!(events.try_recv().is_err());
}

#[test]
fn test_switch_away_and_back_restores_wiring() {
    let s = scenario();
    s.manager.set_active_grouping("PER_HOST").unwrap();
    let wiring_before = wiring(&s.manager);
    let consumers_before = s.consumers.destinations();
    let statements_before = s.cep.subscriber_names().len();

    s.manager.set_active_grouping("PER_INSTANCE").unwrap();
    assert_ne!(wiring(&s.manager), wiring_before);
    s.manager.set_active_grouping("PER_HOST").unwrap();

    assert_eq!(wiring(&s.manager), wiring_before);
    assert_eq!(s.consumers.destinations(), consumers_before);
    assert_eq!(s.cep.subscriber_names().len(), statements_before);

    s.manager.set_active_grouping("PER_CLOUD").unwrap();
    s.manager.set_active_grouping("PER_HOST").unwrap();
    assert_eq!(wiring(&s.manager), wiring_before);
    assert_eq!(s.consumers.destinations(), consumers_before);
}

#[test]
fn test_notifications_follow_switches() {
    let s = scenario();
    let mut events = s.manager.subscribe();

    s.manager.set_active_grouping("PER_HOST").unwrap();
    s.manager.set_active_grouping("PER_CLOUD").unwrap();
    s.manager.clear_groupings();

    assert_eq!(
        events.try_recv().unwrap(),
        TopologyEvent::ActiveGroupingChanged {
            previous: None,
            current: Grouping::PerHost,
            aggregator: false,
        }
    );
    assert_eq!(
        events.try_recv().unwrap(),
        TopologyEvent::ActiveGroupingChanged {
            previous: Some(Grouping::PerHost),
            current: Grouping::PerCloud,
            aggregator: false,
        }
    );
    assert_eq!(events.try_recv().unwrap(), TopologyEvent::Cleared);
}

#[test]
fn test_reactivation_after_clear() {
    let s = scenario();
    s.manager.set_active_grouping("PER_INSTANCE").unwrap();
    s.manager.clear_groupings();
    assert!(chain(&s.manager).is_empty());

    assert_eq!(
        s.manager.set_active_grouping("PER_HOST").unwrap(),
        SwitchOutcome::Added(vec![Grouping::PerCloud, Grouping::PerHost])
    );
}
