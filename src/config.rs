use std::time::Duration;

use serde::Deserialize;
use tracing::trace;

/// Node configuration
///
/// Every section is optional; a missing section falls back to its defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub local_broker: LocalBrokerConfig,

    #[serde(default)]
    pub forwarder: ForwarderConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub stats: StatsConfig,

    #[serde(default)]
    pub http_broker: HttpBrokerConfig,

    /// Grouping this node runs as aggregator for (announced on switch)
    pub aggregator_grouping: Option<String>,
}

/// The broker running next to this node
#[derive(Debug, Clone, Deserialize)]
pub struct LocalBrokerConfig {
    #[serde(default = "default_local_broker_url")]
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,

    /// Hand local events straight to the CEP engine instead of going through the broker
    #[serde(default = "default_true")]
    pub bypass_local_broker: bool,
}

impl Default for LocalBrokerConfig {
    fn default() -> Self {
        Self {
            url: default_local_broker_url(),
            username: None,
            password: None,
            bypass_local_broker: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForwarderConfig {
    /// Pause between two processed tasks (throttle), 0 disables it
    #[serde(default = "default_loop_delay")]
    pub loop_delay_ms: u64,

    /// Failed attempts after which a task is dropped (None = unlimited)
    pub max_retries: Option<u32>,

    /// Age after which a task is dropped (None = unlimited)
    pub max_duration_ms: Option<u64>,
}

impl ForwarderConfig {
    pub fn loop_delay(&self) -> Duration {
        Duration::from_millis(self.loop_delay_ms)
    }

    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration_ms.map(Duration::from_millis)
    }
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            loop_delay_ms: default_loop_delay(),
            max_retries: None,
            max_duration_ms: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Ring capacity, 0 disables the cache
    #[serde(default = "default_cache_size")]
    pub size: usize,

    #[serde(default)]
    pub exclude_destinations: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            size: default_cache_size(),
            exclude_destinations: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_true")]
    pub as_json: bool,

    #[serde(default)]
    pub as_csv: bool,

    #[serde(default = "default_stats_secs")]
    pub init_delay_secs: u64,

    #[serde(default = "default_stats_secs")]
    pub rate_secs: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            as_json: true,
            as_csv: false,
            init_delay_secs: default_stats_secs(),
            rate_secs: default_stats_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpBrokerConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// REST port used for `tcp://` and `ssl://` broker urls
    pub rest_port: Option<u16>,
}

impl Default for HttpBrokerConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            rest_port: None,
        }
    }
}

fn default_local_broker_url() -> String {
    "ssl://127.0.0.1:61616".to_string()
}

fn default_true() -> bool {
    true
}

fn default_loop_delay() -> u64 {
    100
}

fn default_cache_size() -> usize {
    100
}

fn default_stats_secs() -> u64 {
    30
}

fn default_timeout_secs() -> u64 {
    30
}

pub fn read_config_file(path: &str) -> anyhow::Result<NodeConfig> {
    let file_content = std::fs::read_to_string(path)?;
    serde_json::from_str(&file_content)
        .map_err(|e| anyhow::anyhow!("Invalid configuration file provided: {e}"))
        .inspect(|config| trace!("loaded config: {config:?}"))
}
