//! Local-bypass publisher
//!
//! Decides per publish whether the destination is the broker next to this
//! node. If it is, the event goes straight into the local CEP engine without
//! any network I/O; otherwise a (cached) broker connection is used.
//!
//! "Same broker" compares the `host:port` of both urls, ignoring scheme
//! options and query parameters. An empty url means the local broker.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::broker::{BrokerConnection, BrokerConnector, OutboundMessage, same_broker};
use crate::cache::EventCache;
use crate::cep::CepEngine;
use crate::error::PublishError;
use crate::event::EventPayload;
use crate::grouping::BrokerConnectionConfig;

#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Deliver `payload` to `topic` on the broker described by `connection`
    async fn publish(
        &self,
        connection: &BrokerConnectionConfig,
        topic: &str,
        payload: &EventPayload,
    ) -> Result<(), PublishError>;
}

type ConnectionKey = (String, Option<String>);

pub struct BypassPublisher {
    local_url: String,

    /// When false even local publishes go through a broker connection
    bypass: bool,

    cep: Arc<dyn CepEngine>,
    connector: Arc<dyn BrokerConnector>,
    cache: Option<Arc<EventCache>>,

    /// Open connections per (url, username), with the connector generation
    /// they were opened under
    connections: Mutex<HashMap<ConnectionKey, (u64, Arc<dyn BrokerConnection>)>>,
}

impl BypassPublisher {
    pub fn new(
        local_url: impl Into<String>,
        cep: Arc<dyn CepEngine>,
        connector: Arc<dyn BrokerConnector>,
    ) -> Self {
        Self {
            local_url: local_url.into(),
            bypass: true,
            cep,
            connector,
            cache: None,
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_bypass(mut self, bypass: bool) -> Self {
        self.bypass = bypass;
        self
    }

    /// Record events consumed through the bypass in `cache`
    pub fn with_cache(mut self, cache: Arc<EventCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn is_local(&self, url: &str) -> bool {
        url.trim().is_empty() || same_broker(url, &self.local_url)
    }

    pub async fn open_connections(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Close every cached connection
    pub async fn close(&self) {
        let connections: Vec<_> = self.connections.lock().await.drain().collect();
        for ((url, _), (_, connection)) in connections {
            debug!("closing broker connection: url={url}");
            connection.close().await;
        }
    }

    fn ingest_locally(&self, topic: &str, payload: &EventPayload) -> Result<(), PublishError> {
        trace!("local bypass: topic={topic}");
        if let Some(cache) = &self.cache {
            cache.cache_event(topic, payload);
        }
        match payload {
            EventPayload::Raw(event) => self.cep.handle_event(topic, event.clone())?,
            EventPayload::Keyed(map) => self.cep.handle_map(topic, map.clone())?,
            EventPayload::Text(text) => self.cep.handle_text(topic, text)?,
        }
        Ok(())
    }

    async fn connection_for(
        &self,
        url: &str,
        connection: &BrokerConnectionConfig,
    ) -> Result<Arc<dyn BrokerConnection>, PublishError> {
        let key = (url.to_string(), connection.username.clone());
        let generation = self.connector.generation();
        let mut connections = self.connections.lock().await;
        if let Some((opened, open)) = connections.get(&key) {
            if *opened == generation {
                return Ok(open.clone());
            }
        }
        // Opened before the trusted certificates changed
        if let Some((_, stale)) = connections.remove(&key) {
            debug!("reopening stale broker connection: url={url}");
            stale.close().await;
        }

        debug!("opening broker connection: url={url}, username={:?}", connection.username);
        let open = self
            .connector
            .connect(url, connection.username.as_deref(), connection.password.as_deref())
            .await?;
        connections.insert(key, (generation, open.clone()));
        Ok(open)
    }

    async fn send_remote(
        &self,
        connection: &BrokerConnectionConfig,
        topic: &str,
        payload: &EventPayload,
    ) -> Result<(), PublishError> {
        let url = match connection.url.trim() {
            "" => self.local_url.as_str(),
            url => url,
        };
        let message = OutboundMessage {
            topic: topic.to_string(),
            body: payload.to_json()?,
            properties: payload.properties(),
            persistent: false,
        };

        let open = self.connection_for(url, connection).await?;
        if let Err(e) = open.send(&message).await {
            // The next attempt reconnects
            warn!("evicting broker connection after send failure: url={url}");
            self.connections
                .lock()
                .await
                .remove(&(url.to_string(), connection.username.clone()));
            open.close().await;
            return Err(e.into());
        }
        trace!("event sent: url={url}, topic={topic}");
        Ok(())
    }
}

#[async_trait]
impl EventPublisher for BypassPublisher {
    async fn publish(
        &self,
        connection: &BrokerConnectionConfig,
        topic: &str,
        payload: &EventPayload,
    ) -> Result<(), PublishError> {
        payload.validate()?;

        if self.bypass && self.is_local(&connection.url) {
            return self.ingest_locally(topic, payload);
        }
        self.send_remote(connection, topic, payload).await
    }
}
