//! Grouping topology manager
//!
//! Tracks the grouping configurations known to this node, the active
//! grouping, the statement subscribers of every grouping in the active chain
//! and their forward wiring.
//!
//! ## Switching
//!
//! The active chain is every configured level from the top of the hierarchy
//! (GLOBAL excluded, it is synthetic) down to the active grouping. A switch
//! moves the end of that chain:
//!
//! ```text
//! none         → PER_HOST      add    [PER_CLOUD, PER_HOST]
//! PER_HOST     → PER_INSTANCE  add    [PER_INSTANCE]
//! PER_INSTANCE → PER_CLOUD     remove [PER_INSTANCE, PER_HOST]
//! ```
//!
//! Only the subscribers of the active grouping forward; every other level of
//! the chain publishes locally only.
//!
//! A whole switch runs under one lock. A failure half-way is not rolled back:
//! the chain is left in an indeterminate state and the caller retries the
//! switch (or clears the groupings). Only the level that failed is undone; a
//! retry replaces the levels an earlier attempt already registered.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, trace, warn};

use crate::actors::forwarder::ForwarderHandle;
use crate::actors::messages::TopologyEvent;
use crate::broker::{ConsumerBridge, TrustStore, broker_host};
use crate::cep::CepEngine;
use crate::error::TopologyError;
use crate::grouping::{BrokerConnectionConfig, Grouping, GroupingConfiguration};
use crate::stats::ForwardStatistics;
use crate::subscriber::StatementSubscriber;

/// What a call to [`TopologyManager::set_active_grouping`] did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchOutcome {
    /// The grouping was already active
    Unchanged,

    /// Levels added, in hierarchy order
    Added(Vec<Grouping>),

    /// Levels removed, in reverse hierarchy order
    Removed(Vec<Grouping>),
}

#[derive(Default)]
struct TopologyState {
    configurations: BTreeMap<Grouping, GroupingConfiguration>,
    active: Option<Grouping>,
    subscribers: BTreeMap<Grouping, Vec<Arc<StatementSubscriber>>>,
}

impl TopologyState {
    /// Levels of the active chain, in hierarchy order
    fn chain(&self) -> Vec<Grouping> {
        self.subscribers.keys().copied().collect()
    }
}

pub struct TopologyManager {
    cep: Arc<dyn CepEngine>,
    consumers: Arc<dyn ConsumerBridge>,
    trust_store: Option<Arc<dyn TrustStore>>,
    forwarder: ForwarderHandle,
    stats: Arc<ForwardStatistics>,

    /// Grouping this node is aggregator for
    aggregator: Option<Grouping>,

    events: broadcast::Sender<TopologyEvent>,
    state: Mutex<TopologyState>,
    subscriber_sequence: AtomicU64,
}

impl TopologyManager {
    pub fn new(
        cep: Arc<dyn CepEngine>,
        consumers: Arc<dyn ConsumerBridge>,
        forwarder: ForwarderHandle,
        stats: Arc<ForwardStatistics>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            cep,
            consumers,
            trust_store: None,
            forwarder,
            stats,
            aggregator: None,
            events,
            state: Mutex::new(TopologyState::default()),
            subscriber_sequence: AtomicU64::new(0),
        }
    }

    pub fn with_trust_store(mut self, trust_store: Arc<dyn TrustStore>) -> Self {
        self.trust_store = Some(trust_store);
        self
    }

    pub fn with_aggregator(mut self, aggregator: Option<Grouping>) -> Self {
        self.aggregator = aggregator;
        self
    }

    /// Receive topology change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.events.subscribe()
    }

    /// Store a configuration, replacing any previous one of the same grouping
    ///
    /// When the grouping is active its forward wiring is rebuilt from the new
    /// configuration right away.
    pub fn put_configuration(&self, configuration: GroupingConfiguration) -> Result<Grouping, TopologyError> {
        let grouping = configuration.level()?;
        let mut state = self.state.lock();
        debug!(
            "grouping configuration stored: grouping={grouping}, topics={}",
            configuration.rules.len()
        );
        state.configurations.insert(grouping, configuration);

        if state.active == Some(grouping) {
            self.rewire_forwards(&state, grouping)?;
            self.refresh_certificates(&state, grouping)?;
        }
        Ok(grouping)
    }

    /// Decode and store a configuration received over the control channel
    pub fn put_encoded_configuration(&self, encoded: &str) -> anyhow::Result<Grouping> {
        let configuration = GroupingConfiguration::decode(encoded)?;
        Ok(self.put_configuration(configuration)?)
    }

    /// Replace the broker connection of a target grouping in the active configuration
    ///
    /// Used when the aggregator of the target grouping moved to another node.
    /// Queued forward tasks pick the new connection up on their next attempt.
    pub fn update_broker_connection(&self, connection: BrokerConnectionConfig) -> Result<bool, TopologyError> {
        let target = connection.grouping.clone().unwrap_or_default();
        let mut state = self.state.lock();
        let Some(active) = state.active else {
            warn!("no active grouping, broker connection ignored: target={target}");
            return Ok(false);
        };
        let Some(configuration) = state.configurations.get_mut(&active) else {
            return Ok(false);
        };

        info!("broker connection updated: grouping={active}, target={target}, url={}", connection.url);
        configuration.broker_connections.insert(target, connection);
        self.rewire_forwards(&state, active)?;
        self.refresh_certificates(&state, active)?;
        Ok(true)
    }

    pub fn configuration_names(&self) -> Vec<String> {
        self.state
            .lock()
            .configurations
            .keys()
            .map(|g| g.to_string())
            .collect()
    }

    pub fn configuration(&self, name: &str) -> Option<GroupingConfiguration> {
        let grouping = name.parse::<Grouping>().ok()?;
        self.state.lock().configurations.get(&grouping).cloned()
    }

    pub fn active_grouping(&self) -> Option<Grouping> {
        self.state.lock().active
    }

    /// Subscribers per grouping of the active chain
    pub fn subscribers(&self) -> BTreeMap<Grouping, Vec<Arc<StatementSubscriber>>> {
        self.state.lock().subscribers.clone()
    }

    /// Make `name` the active grouping
    #[instrument(skip(self))]
    pub fn set_active_grouping(&self, name: &str) -> Result<SwitchOutcome, TopologyError> {
        let grouping: Grouping = name.parse()?;
        if grouping == Grouping::Global {
            return Err(TopologyError::GlobalNotActivatable(grouping));
        }

        let mut state = self.state.lock();
        if !state.configurations.contains_key(&grouping) {
            return Err(TopologyError::UnknownGrouping(grouping.to_string()));
        }

        let previous = state.active;
        if previous == Some(grouping) {
            debug!("grouping already active: grouping={grouping}");
            return Ok(SwitchOutcome::Unchanged);
        }

        let outcome = match previous {
            Some(old) if grouping < old => SwitchOutcome::Removed(self.remove_till(&mut state, grouping)?),
            _ => SwitchOutcome::Added(self.add_till(&mut state, grouping)?),
        };
        drop(state);

        info!("active grouping changed: previous={previous:?}, current={grouping}, outcome={outcome:?}");
        self.notify(TopologyEvent::ActiveGroupingChanged {
            previous,
            current: grouping,
            aggregator: self.aggregator == Some(grouping),
        });
        Ok(outcome)
    }

    /// Add every configured level after the active grouping up to `grouping`
    ///
    /// Returns the added levels; nothing is added when `grouping` is not more
    /// granular than the active grouping.
    pub fn add_groupings_till(&self, grouping: Grouping) -> Result<Vec<Grouping>, TopologyError> {
        let mut state = self.state.lock();
        if state.active.is_some_and(|active| grouping <= active) {
            return Ok(Vec::new());
        }
        self.add_till(&mut state, grouping)
    }

    /// Remove every level after `grouping` down to the active grouping
    ///
    /// Returns the removed levels; nothing is removed when `grouping` is not
    /// less granular than the active grouping.
    pub fn remove_groupings_till(&self, grouping: Grouping) -> Result<Vec<Grouping>, TopologyError> {
        let mut state = self.state.lock();
        if state.active.is_none_or(|active| grouping >= active) {
            return Ok(Vec::new());
        }
        self.remove_till(&mut state, grouping)
    }

    fn add_till(&self, state: &mut TopologyState, grouping: Grouping) -> Result<Vec<Grouping>, TopologyError> {
        let from = state.active;
        let levels: Vec<Grouping> = Grouping::ALL
            .into_iter()
            .filter(|level| *level != Grouping::Global)
            .filter(|level| from.is_none_or(|from| *level > from) && *level <= grouping)
            .filter(|level| state.configurations.contains_key(level))
            .collect();
        debug!("adding groupings: from={from:?}, levels={levels:?}");

        // Fail before touching the engine when the new wiring is incomplete
        if let Some(configuration) = state.configurations.get(&grouping) {
            forwards_of(configuration, grouping)?;
        }

        if let Some(old) = from {
            clear_forwards(state, old);
        }

        for level in &levels {
            let configuration = state
                .configurations
                .get(level)
                .cloned()
                .ok_or_else(|| TopologyError::UnknownGrouping(level.to_string()))?;
            // Left over from an earlier switch that failed part-way
            if state.subscribers.contains_key(level) {
                self.detach_grouping(state, *level);
            }
            let subscribers = self.apply_grouping(&configuration, *level)?;
            state.subscribers.insert(*level, subscribers);
        }

        state.active = Some(grouping);
        self.rewire_forwards(state, grouping)?;
        self.refresh_certificates(state, grouping)?;
        Ok(levels)
    }

    fn remove_till(&self, state: &mut TopologyState, grouping: Grouping) -> Result<Vec<Grouping>, TopologyError> {
        let levels: Vec<Grouping> = state
            .chain()
            .into_iter()
            .rev()
            .filter(|level| *level > grouping)
            .collect();
        debug!("removing groupings: till={grouping}, levels={levels:?}");

        for level in &levels {
            self.detach_grouping(state, *level);
        }

        state.active = Some(grouping);
        self.rewire_forwards(state, grouping)?;
        self.refresh_certificates(state, grouping)?;
        Ok(levels)
    }

    /// Merge one grouping into the engine and create its subscribers
    fn apply_grouping(
        &self,
        configuration: &GroupingConfiguration,
        grouping: Grouping,
    ) -> Result<Vec<Arc<StatementSubscriber>>, TopologyError> {
        let cep_error = |source| TopologyError::Cep { grouping, source };

        self.cep
            .add_event_types(&configuration.event_type_names)
            .map_err(cep_error)?;
        self.cep.set_constants(&configuration.constants).map_err(cep_error)?;
        self.cep
            .add_function_definitions(&configuration.function_definitions)
            .map_err(cep_error)?;

        let mut subscribers: Vec<Arc<StatementSubscriber>> = Vec::new();
        for (topic, rules) in &configuration.rules {
            for rule in rules {
                let name = format!(
                    "Subscriber_{}",
                    self.subscriber_sequence.fetch_add(1, Ordering::Relaxed)
                );
                let subscriber = Arc::new(StatementSubscriber::new(
                    name,
                    grouping,
                    topic,
                    rule,
                    self.forwarder.clone(),
                    self.stats.clone(),
                ));
                if let Err(source) = self.cep.add_statement_subscriber(subscriber.clone()) {
                    // A level is registered whole or not at all
                    for registered in &subscribers {
                        self.cep.remove_statement_subscriber(registered);
                    }
                    return Err(cep_error(source));
                }
                trace!("subscriber registered: subscriber={}, grouping={grouping}, topic={topic}", subscriber.name());
                subscribers.push(subscriber);
            }
        }

        for event_type in &configuration.event_type_names {
            self.consumers.add_consumer_of(event_type);
        }
        debug!("grouping added: grouping={grouping}, subscribers={}", subscribers.len());
        Ok(subscribers)
    }

    /// Detach a grouping's subscribers and consumers no other level needs
    fn detach_grouping(&self, state: &mut TopologyState, grouping: Grouping) {
        for subscriber in state.subscribers.remove(&grouping).unwrap_or_default() {
            subscriber.clear_forwards();
            self.cep.remove_statement_subscriber(&subscriber);
        }

        let still_needed: BTreeSet<&String> = state
            .subscribers
            .keys()
            .filter_map(|level| state.configurations.get(level))
            .flat_map(|c| c.event_type_names.iter())
            .collect();
        if let Some(configuration) = state.configurations.get(&grouping) {
            for event_type in &configuration.event_type_names {
                if !still_needed.contains(event_type) {
                    self.consumers.remove_consumer_of(event_type);
                }
            }
        }
        debug!("grouping removed: grouping={grouping}");
    }

    /// Point the subscribers of `grouping` at the broker connections it declares
    fn rewire_forwards(&self, state: &TopologyState, grouping: Grouping) -> Result<(), TopologyError> {
        let Some(configuration) = state.configurations.get(&grouping) else {
            return Ok(());
        };
        let forwards = forwards_of(configuration, grouping)?;

        for subscriber in state.subscribers.get(&grouping).into_iter().flatten() {
            let connections = forwards.get(subscriber.topic()).cloned().unwrap_or_default();
            trace!(
                "forwards set: subscriber={}, topic={}, targets={}",
                subscriber.name(),
                subscriber.topic(),
                connections.len()
            );
            subscriber.set_forward_to_groupings(connections);
        }
        Ok(())
    }

    /// Trust the brokers the active grouping forwards to
    fn refresh_certificates(&self, state: &TopologyState, grouping: Grouping) -> Result<(), TopologyError> {
        let Some(configuration) = state.configurations.get(&grouping) else {
            return Ok(());
        };
        let certificates: Vec<(String, &str)> = configuration
            .broker_connections
            .values()
            .filter_map(|c| {
                let pem = c.certificate.as_deref()?;
                Some((broker_host(&c.url)?, pem))
            })
            .collect();
        if certificates.is_empty() {
            return Ok(());
        }

        let Some(trust_store) = &self.trust_store else {
            warn!("no trust store available, certificates not installed: grouping={grouping}");
            return Ok(());
        };
        for (host, pem) in certificates {
            trust_store.add_or_replace_certificate(&host, pem)?;
            debug!("certificate trusted: grouping={grouping}, host={host}");
        }
        Ok(())
    }

    /// Merge constants into the active grouping and the engine
    ///
    /// Returns false when no grouping is active.
    pub fn set_constants(&self, constants: HashMap<String, f64>) -> Result<bool, TopologyError> {
        let mut state = self.state.lock();
        let Some(active) = state.active else {
            warn!("no active grouping, constants ignored");
            return Ok(false);
        };

        self.cep
            .set_constants(&constants)
            .map_err(|source| TopologyError::Cep { grouping: active, source })?;
        if let Some(configuration) = state.configurations.get_mut(&active) {
            configuration.constants.extend(constants);
        }
        debug!("constants updated: grouping={active}");
        Ok(true)
    }

    /// Remove every grouping from the engine, keeping the configurations
    #[instrument(skip(self))]
    pub fn clear_groupings(&self) {
        let mut state = self.state.lock();
        for level in state.chain().into_iter().rev() {
            self.detach_grouping(&mut state, level);
        }
        self.cep.clear_state();
        state.active = None;
        drop(state);

        info!("groupings cleared");
        self.notify(TopologyEvent::Cleared);
    }

    /// Clear the groupings and forget every configuration
    pub fn clear_configurations(&self) {
        self.clear_groupings();
        self.state.lock().configurations.clear();
        debug!("grouping configurations cleared");
    }

    fn notify(&self, event: TopologyEvent) {
        // No receiver is fine
        let _ = self.events.send(event);
    }
}

/// Broker connections per topic declared by `configuration`
fn forwards_of(
    configuration: &GroupingConfiguration,
    grouping: Grouping,
) -> Result<BTreeMap<String, Vec<BrokerConnectionConfig>>, TopologyError> {
    let mut forwards = BTreeMap::new();
    for (topic, targets) in &configuration.connections {
        let mut connections = Vec::with_capacity(targets.len());
        for target in targets {
            let mut connection = configuration
                .broker_connections
                .get(target)
                .cloned()
                .ok_or_else(|| TopologyError::MissingConnection {
                    grouping,
                    target: target.clone(),
                })?;
            connection.grouping.get_or_insert_with(|| target.clone());
            if connection.username.is_none() {
                connection.username = configuration.broker_username.clone();
                connection.password = configuration.broker_password.clone();
            }
            connections.push(connection);
        }
        forwards.insert(topic.clone(), connections);
    }
    Ok(forwards)
}

fn clear_forwards(state: &TopologyState, grouping: Grouping) {
    for subscriber in state.subscribers.get(&grouping).into_iter().flatten() {
        subscriber.clear_forwards();
    }
}
