//! Message broker seams
//!
//! Only a handful of broker operations are needed here:
//!
//! - open/close a connection, optionally with credentials ([`BrokerConnector`])
//! - send a non-persistent text message with string properties to a topic
//!   ([`BrokerConnection`])
//! - stop consuming a topic once no active grouping needs it ([`ConsumerBridge`])
//! - trust the certificate of a downstream broker ([`TrustStore`])
//!
//! [`http::HttpBrokerConnector`] implements the connector and the trust store
//! on top of a broker REST endpoint.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Url;
use tracing::debug;

use crate::error::BrokerError;

pub mod http;

pub use http::HttpBrokerConnector;

/// A message on its way to a broker topic
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    pub body: String,
    pub properties: BTreeMap<String, String>,
    pub persistent: bool,
}

#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Open a connection to the broker at `url`
    async fn connect(
        &self,
        url: &str,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<Arc<dyn BrokerConnection>, BrokerError>;

    /// Bumped whenever connections opened earlier went stale
    fn generation(&self) -> u64 {
        0
    }
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<(), BrokerError>;

    async fn close(&self);
}

/// Certificates trusted when connecting to downstream brokers
pub trait TrustStore: Send + Sync {
    fn add_or_replace_certificate(&self, alias: &str, pem: &str) -> Result<(), BrokerError>;

    fn aliases(&self) -> Vec<String>;
}

/// Consumers the local broker bridge keeps for the CEP engine
pub trait ConsumerBridge: Send + Sync {
    fn add_consumer_of(&self, destination: &str);

    fn remove_consumer_of(&self, destination: &str);
}

/// Consumer bridge that only tracks which destinations are consumed
#[derive(Debug, Default)]
pub struct ConsumerRegistry {
    destinations: RwLock<BTreeSet<String>>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn destinations(&self) -> BTreeSet<String> {
        self.destinations.read().clone()
    }

    pub fn is_consuming(&self, destination: &str) -> bool {
        self.destinations.read().contains(destination)
    }
}

impl ConsumerBridge for ConsumerRegistry {
    fn add_consumer_of(&self, destination: &str) {
        if self.destinations.write().insert(destination.to_string()) {
            debug!("consumer added: destination={destination}");
        }
    }

    fn remove_consumer_of(&self, destination: &str) {
        if self.destinations.write().remove(destination) {
            debug!("consumer removed: destination={destination}");
        }
    }
}

/// The `host:port` part of a broker url
///
/// Connection strings may carry query parameters or a path, so two urls name
/// the same broker instance when this part matches.
pub fn broker_address(url: &str) -> Option<String> {
    let parsed = Url::parse(url.trim()).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let port = parsed.port_or_known_default()?;
    Some(format!("{host}:{port}"))
}

/// Host of a broker url (used as trust store alias)
pub fn broker_host(url: &str) -> Option<String> {
    Url::parse(url.trim())
        .ok()?
        .host_str()
        .map(|h| h.to_ascii_lowercase())
}

/// Whether two urls address the same broker instance
pub fn same_broker(a: &str, b: &str) -> bool {
    match (broker_address(a), broker_address(b)) {
        (Some(a), Some(b)) => a == b,
        _ => a.trim() == b.trim(),
    }
}
