//! Grouping levels and per-grouping configuration
//!
//! Groupings form a fixed hierarchy ordered from most aggregated to least:
//!
//! ```text
//! GLOBAL → PER_CLOUD → PER_REGION → PER_ZONE → PER_HOST → PER_INSTANCE
//! ```
//!
//! The declaration order of [`Grouping`] is that hierarchy, so `Ord` on the
//! enum is what every topology diff is computed from.
//!
//! Configurations arrive over the control channel as Base64-wrapped JSON and
//! always replace a previous configuration of the same name as a whole.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::{CodecError, TopologyError};

/// One level of the aggregation hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Grouping {
    Global,
    PerCloud,
    PerRegion,
    PerZone,
    PerHost,
    PerInstance,
}

impl Grouping {
    /// All levels in hierarchy order
    pub const ALL: [Grouping; 6] = [
        Grouping::Global,
        Grouping::PerCloud,
        Grouping::PerRegion,
        Grouping::PerZone,
        Grouping::PerHost,
        Grouping::PerInstance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Grouping::Global => "GLOBAL",
            Grouping::PerCloud => "PER_CLOUD",
            Grouping::PerRegion => "PER_REGION",
            Grouping::PerZone => "PER_ZONE",
            Grouping::PerHost => "PER_HOST",
            Grouping::PerInstance => "PER_INSTANCE",
        }
    }

    /// Position in the hierarchy (0 = most aggregated)
    pub fn rank(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for Grouping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Grouping {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        Grouping::ALL
            .into_iter()
            .find(|g| g.as_str().eq_ignore_ascii_case(name))
            .ok_or_else(|| TopologyError::UnknownLevel(name.to_string()))
    }
}

/// Where a forward target currently lives
///
/// The aggregator role can move to another node, so forward tasks re-read the
/// live value before every attempt instead of trusting this snapshot.
#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BrokerConnectionConfig {
    /// Grouping this connection forwards to (None for the local broker)
    pub grouping: Option<String>,
    pub url: String,
    pub certificate: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl BrokerConnectionConfig {
    pub fn new(grouping: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            grouping: Some(grouping.into()),
            url: url.into(),
            ..Default::default()
        }
    }

    /// Descriptor for the local broker
    pub fn local(url: impl Into<String>, username: Option<String>, password: Option<String>) -> Self {
        Self {
            grouping: None,
            url: url.into(),
            certificate: None,
            username,
            password,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_certificate(mut self, pem: impl Into<String>) -> Self {
        self.certificate = Some(pem.into());
        self
    }

    /// Whether url and credentials are the same as in `other`
    pub fn same_endpoint(&self, other: &BrokerConnectionConfig) -> bool {
        self.url == other.url && self.username == other.username && self.password == other.password
    }
}

// Certificates and passwords stay out of the logs
impl fmt::Debug for BrokerConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConnectionConfig")
            .field("grouping", &self.grouping)
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "********"))
            .finish()
    }
}

/// A CEP function definition shipped with a grouping
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub expression: String,
    #[serde(default)]
    pub arguments: Vec<String>,
}

/// Everything a node needs to run one grouping level
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct GroupingConfiguration {
    pub name: String,

    /// Event types (topics) this grouping declares
    #[serde(default)]
    pub event_type_names: BTreeSet<String>,

    #[serde(default)]
    pub constants: HashMap<String, f64>,

    #[serde(default)]
    pub function_definitions: BTreeSet<FunctionDefinition>,

    /// Rule bodies per output topic
    #[serde(default)]
    pub rules: BTreeMap<String, BTreeSet<String>>,

    /// Groupings each topic must be forwarded to
    #[serde(default)]
    pub connections: BTreeMap<String, BTreeSet<String>>,

    /// Broker of every grouping this one talks to, keyed by grouping name
    #[serde(default)]
    pub broker_connections: BTreeMap<String, BrokerConnectionConfig>,

    #[serde(default)]
    pub broker_username: Option<String>,

    #[serde(default)]
    pub broker_password: Option<String>,
}

impl GroupingConfiguration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Hierarchy level this configuration belongs to
    pub fn level(&self) -> Result<Grouping, TopologyError> {
        self.name.parse()
    }

    pub fn with_event_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_type_names.extend(types.into_iter().map(Into::into));
        self
    }

    pub fn with_rule(mut self, topic: impl Into<String>, rule: impl Into<String>) -> Self {
        self.rules.entry(topic.into()).or_default().insert(rule.into());
        self
    }

    pub fn with_constant(mut self, name: impl Into<String>, value: f64) -> Self {
        self.constants.insert(name.into(), value);
        self
    }

    pub fn with_function(mut self, function: FunctionDefinition) -> Self {
        self.function_definitions.insert(function);
        self
    }

    /// Forward `topic` to the broker of `grouping`
    pub fn with_forward(mut self, topic: impl Into<String>, connection: BrokerConnectionConfig) -> Self {
        let target = connection.grouping.clone().unwrap_or_default();
        self.connections.entry(topic.into()).or_default().insert(target.clone());
        self.broker_connections.insert(target, connection);
        self
    }

    /// Decode a configuration received over the control channel
    pub fn decode(encoded: &str) -> Result<Self, CodecError> {
        decode_base64_json(encoded)
    }

    pub fn encode(&self) -> Result<String, CodecError> {
        encode_base64_json(self)
    }
}

impl fmt::Debug for GroupingConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupingConfiguration")
            .field("name", &self.name)
            .field("event_type_names", &self.event_type_names)
            .field("constants", &self.constants)
            .field("function_definitions", &self.function_definitions)
            .field("rules", &self.rules)
            .field("connections", &self.connections)
            .field("broker_connections", &self.broker_connections)
            .field("broker_username", &self.broker_username)
            .finish()
    }
}

/// Decode a Base64-wrapped JSON object graph
pub fn decode_base64_json<T: DeserializeOwned>(encoded: &str) -> Result<T, CodecError> {
    let bytes = STANDARD.decode(encoded.trim())?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Encode a value as Base64-wrapped JSON
pub fn encode_base64_json<T: Serialize>(value: &T) -> Result<String, CodecError> {
    let json = serde_json::to_vec(value)?;
    Ok(STANDARD.encode(json))
}
