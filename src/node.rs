//! Node wiring
//!
//! Builds every component of a node from its configuration and executes
//! control-channel commands against them.
//!
//! ```text
//!                  ┌──────────────────┐
//!   control ─────▶ │ TopologyManager  │ ──▶ CEP engine ──▶ StatementSubscribers
//!                  └──────────────────┘                          │
//!                                                                ▼
//!                        BypassPublisher ◀──────────────── EventForwarder
//!                         │          │
//!                 EventCache      BrokerConnector
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info};

use crate::actors::forwarder::ForwarderHandle;
use crate::actors::messages::{ForwardTask, ForwarderStats, ShutdownMode};
use crate::actors::stats_printer::StatsPrinterHandle;
use crate::broker::{BrokerConnector, ConsumerBridge, ConsumerRegistry, HttpBrokerConnector, TrustStore};
use crate::cache::EventCache;
use crate::cep::{CepEngine, InMemoryEngine};
use crate::config::NodeConfig;
use crate::control::{CacheCommand, ControlCommand};
use crate::event::{EventMap, EventPayload};
use crate::grouping::{BrokerConnectionConfig, Grouping, decode_base64_json};
use crate::publisher::BypassPublisher;
use crate::stats::{ForwardStatistics, StatisticsSnapshot};
use crate::topology::TopologyManager;

/// External collaborators of a node
pub struct NodeComponents {
    pub cep: Arc<dyn CepEngine>,
    pub connector: Arc<dyn BrokerConnector>,
    pub trust_store: Option<Arc<dyn TrustStore>>,
    pub consumers: Arc<dyn ConsumerBridge>,
}

impl NodeComponents {
    /// In-memory engine and consumer registry, HTTP broker connector
    pub fn from_config(config: &NodeConfig) -> Result<Self> {
        let http = Arc::new(
            HttpBrokerConnector::new(&config.http_broker).context("failed to create broker connector")?,
        );
        Ok(Self {
            cep: Arc::new(InMemoryEngine::new()),
            connector: http.clone(),
            trust_store: Some(http),
            consumers: Arc::new(ConsumerRegistry::new()),
        })
    }
}

/// Response of `GET-STATS`
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatistics {
    pub statistics: StatisticsSnapshot,
    pub forwarder: ForwarderStats,
}

pub struct Node {
    topology: Arc<TopologyManager>,
    forwarder: ForwarderHandle,
    publisher: Arc<BypassPublisher>,
    cache: Arc<EventCache>,
    stats: Arc<ForwardStatistics>,
    stats_printer: Option<StatsPrinterHandle>,
}

impl Node {
    /// Start a node with the default components
    pub fn start(config: &NodeConfig) -> Result<Self> {
        Self::start_with(config, NodeComponents::from_config(config)?)
    }

    /// Start a node (spawns the forwarder and, if enabled, the stats printer)
    pub fn start_with(config: &NodeConfig, components: NodeComponents) -> Result<Self> {
        let aggregator = config
            .aggregator_grouping
            .as_deref()
            .map(str::parse::<Grouping>)
            .transpose()
            .context("invalid aggregator grouping")?;

        let cache = Arc::new(EventCache::from_config(&config.cache));
        let stats = Arc::new(ForwardStatistics::new());

        let local = &config.local_broker;
        let publisher = Arc::new(
            BypassPublisher::new(&local.url, components.cep.clone(), components.connector)
                .with_bypass(local.bypass_local_broker)
                .with_cache(cache.clone()),
        );
        let forwarder = ForwarderHandle::spawn(
            &config.forwarder,
            BrokerConnectionConfig::local(&local.url, local.username.clone(), local.password.clone()),
            publisher.clone(),
        );

        let mut topology = TopologyManager::new(
            components.cep,
            components.consumers,
            forwarder.clone(),
            stats.clone(),
        )
        .with_aggregator(aggregator);
        if let Some(trust_store) = components.trust_store {
            topology = topology.with_trust_store(trust_store);
        }

        let stats_printer = config
            .stats
            .enabled
            .then(|| StatsPrinterHandle::spawn(stats.clone(), config.stats.clone()));

        info!(
            "node started: local_broker={}, bypass={}, aggregator={aggregator:?}",
            local.url, local.bypass_local_broker
        );
        Ok(Self {
            topology: Arc::new(topology),
            forwarder,
            publisher,
            cache,
            stats,
            stats_printer,
        })
    }

    pub fn topology(&self) -> &Arc<TopologyManager> {
        &self.topology
    }

    pub fn forwarder(&self) -> &ForwarderHandle {
        &self.forwarder
    }

    pub fn cache(&self) -> &Arc<EventCache> {
        &self.cache
    }

    pub fn stats(&self) -> &Arc<ForwardStatistics> {
        &self.stats
    }

    /// Synthetic task counted like rule output
    fn counted_task(&self, topic: &str, event: EventMap, forward: bool) -> ForwardTask {
        let (ok, failed) = (self.stats.clone(), self.stats.clone());
        ForwardTask::new(topic, EventPayload::Raw(event))
            .on_success(move |_| {
                if forward {
                    ok.count_forward(true)
                } else {
                    ok.count_local_publish(true)
                }
            })
            .on_failure(move |_| {
                if forward {
                    failed.count_forward(false)
                } else {
                    failed.count_local_publish(false)
                }
            })
    }

    /// Execute one control command and return the response line
    pub async fn execute(&self, command: ControlCommand) -> Result<String> {
        debug!("executing control command: {command:?}");
        let response = match command {
            ControlCommand::SetGroupingConfig(encoded) => {
                let grouping = self.topology.put_encoded_configuration(&encoded)?;
                format!("OK {grouping}")
            }
            ControlCommand::ListGroupingConfigs => serde_json::to_string(&self.topology.configuration_names())?,
            ControlCommand::GetGroupingConfig(name) => self
                .topology
                .configuration(&name)
                .with_context(|| format!("grouping specified does not exist: {name}"))?
                .encode()?,
            ControlCommand::ClearGroupingConfigs => {
                self.topology.clear_configurations();
                "OK".to_string()
            }
            ControlCommand::GetActiveGrouping => self
                .topology
                .active_grouping()
                .map(|g| g.to_string())
                .unwrap_or_else(|| "NONE".to_string()),
            ControlCommand::SetActiveGrouping(name) => {
                let outcome = self.topology.set_active_grouping(&name)?;
                format!("OK {outcome:?}")
            }
            ControlCommand::SetBrokerConnection(encoded) => {
                let connection: BrokerConnectionConfig = decode_base64_json(&encoded)?;
                acknowledge(self.topology.update_broker_connection(connection)?)
            }
            ControlCommand::SetConstants(encoded) => {
                let constants: HashMap<String, f64> = decode_base64_json(&encoded)?;
                acknowledge(self.topology.set_constants(constants)?)
            }
            ControlCommand::SendLocalEvent { topic, event } => {
                let event = EventMap::parse(&event)?;
                self.forwarder
                    .add_local_publish_task(self.counted_task(&topic, event, false))?;
                "OK".to_string()
            }
            ControlCommand::SendEvent { url, topic, event } => {
                let event = EventMap::parse(&event)?;
                let connection = BrokerConnectionConfig {
                    url,
                    ..Default::default()
                };
                self.forwarder
                    .add_event_forward_task(connection, self.counted_task(&topic, event, true))?;
                "OK".to_string()
            }
            ControlCommand::GetStats => serde_json::to_string(&NodeStatistics {
                statistics: self.stats.snapshot(),
                forwarder: self.forwarder.stats().await?,
            })?,
            ControlCommand::ClearStats => {
                self.stats.reset();
                "OK".to_string()
            }
            ControlCommand::Cache(CacheCommand::List) => serde_json::to_string(&self.cache.entries())?,
            ControlCommand::Cache(CacheCommand::Clear { reset }) => {
                self.cache.clear_cache(reset);
                "OK".to_string()
            }
            ControlCommand::Cache(CacheCommand::Exclude(destination)) => {
                self.cache.exclude_destination(&destination);
                "OK".to_string()
            }
            ControlCommand::Cache(CacheCommand::Include(destination)) => {
                self.cache.include_destination(&destination);
                "OK".to_string()
            }
            ControlCommand::Exit => "BYE".to_string(),
        };
        Ok(response)
    }

    /// Stop the actors and close broker connections
    ///
    /// Returns the number of forward tasks that were still queued.
    pub async fn shutdown(&self, mode: ShutdownMode) -> Result<usize> {
        if let Some(printer) = &self.stats_printer {
            printer.shutdown().await?;
        }
        let remaining = self.forwarder.shutdown(mode).await?;
        self.publisher.close().await;
        info!("node stopped: remaining_tasks={remaining}");
        Ok(remaining)
    }
}

fn acknowledge(applied: bool) -> String {
    let response = if applied { "OK" } else { "IGNORED" };
    response.to_string()
}
