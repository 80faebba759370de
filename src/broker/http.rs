//! Broker connector over the broker's REST endpoint
//!
//! Messages are posted to
//!
//! ```text
//! POST {endpoint}/api/message/{topic}?type=topic&persistent=false&{properties}
//! ```
//!
//! with the JSON event as body and basic auth when credentials are given.
//! `tcp://` and `ssl://` broker urls are mapped to `http://` and `https://`
//! on the configured REST port (or the url's own port when none is set).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Certificate, Client, Url};
use tracing::{debug, trace};

use crate::config::HttpBrokerConfig;
use crate::error::BrokerError;

use super::{BrokerConnection, BrokerConnector, OutboundMessage, TrustStore};

const PEM_MARKER: &str = "-----BEGIN CERTIFICATE-----";

pub struct HttpBrokerConnector {
    timeout: Duration,
    rest_port: Option<u16>,
    client: RwLock<Client>,

    /// Trusted certificates (PEM) per broker host
    certificates: RwLock<BTreeMap<String, String>>,

    /// Client rebuilds so far
    generation: AtomicU64,
}

impl HttpBrokerConnector {
    pub fn new(config: &HttpBrokerConfig) -> Result<Self, BrokerError> {
        let timeout = Duration::from_secs(config.timeout_secs);
        Ok(Self {
            timeout,
            rest_port: config.rest_port,
            client: RwLock::new(build_client(timeout, &BTreeMap::new())?),
            certificates: RwLock::new(BTreeMap::new()),
            generation: AtomicU64::new(0),
        })
    }

    /// REST endpoint of the broker at `url`
    pub fn endpoint(&self, url: &str) -> Result<Url, BrokerError> {
        let parsed = Url::parse(url.trim()).map_err(|_| BrokerError::UnsupportedUrl(url.to_string()))?;
        let scheme = match parsed.scheme() {
            "tcp" | "http" => "http",
            "ssl" | "https" => "https",
            _ => return Err(BrokerError::UnsupportedUrl(url.to_string())),
        };
        let host = parsed
            .host_str()
            .ok_or_else(|| BrokerError::UnsupportedUrl(url.to_string()))?;

        let broker_port = matches!(parsed.scheme(), "tcp" | "ssl");
        let port = match (broker_port, self.rest_port, parsed.port()) {
            (true, Some(rest_port), _) => Some(rest_port),
            (_, _, port) => port,
        };
        let endpoint = match port {
            Some(port) => format!("{scheme}://{host}:{port}"),
            None => format!("{scheme}://{host}"),
        };
        Url::parse(&endpoint).map_err(|_| BrokerError::UnsupportedUrl(url.to_string()))
    }
}

fn build_client(timeout: Duration, certificates: &BTreeMap<String, String>) -> Result<Client, BrokerError> {
    let mut builder = Client::builder().timeout(timeout);
    for (host, pem) in certificates {
        let certificate = parse_certificate(host, pem)?;
        builder = builder.add_root_certificate(certificate);
    }
    builder.build().map_err(|e| BrokerError::Certificate {
        host: "*".to_string(),
        reason: e.to_string(),
    })
}

fn parse_certificate(host: &str, pem: &str) -> Result<Certificate, BrokerError> {
    if !pem.contains(PEM_MARKER) {
        return Err(BrokerError::Certificate {
            host: host.to_string(),
            reason: "no PEM certificate found".to_string(),
        });
    }
    Certificate::from_pem(pem.as_bytes()).map_err(|e| BrokerError::Certificate {
        host: host.to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl BrokerConnector for HttpBrokerConnector {
    async fn connect(
        &self,
        url: &str,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let endpoint = self.endpoint(url)?;
        debug!("using broker endpoint: url={url}, endpoint={endpoint}");
        Ok(Arc::new(HttpBrokerConnection {
            client: self.client.read().clone(),
            endpoint,
            username: username.map(str::to_string),
            password: password.map(str::to_string),
        }))
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

impl TrustStore for HttpBrokerConnector {
    fn add_or_replace_certificate(&self, alias: &str, pem: &str) -> Result<(), BrokerError> {
        parse_certificate(alias, pem)?;

        let mut certificates = self.certificates.write();
        if certificates.get(alias).is_some_and(|existing| existing == pem) {
            trace!("certificate unchanged: alias={alias}");
            return Ok(());
        }

        let mut updated = certificates.clone();
        updated.insert(alias.to_string(), pem.to_string());
        let client = build_client(self.timeout, &updated)?;

        *certificates = updated;
        *self.client.write() = client;
        self.generation.fetch_add(1, Ordering::Release);
        debug!("certificate added or replaced: alias={alias}");
        Ok(())
    }

    fn aliases(&self) -> Vec<String> {
        self.certificates.read().keys().cloned().collect()
    }
}

pub struct HttpBrokerConnection {
    client: Client,
    endpoint: Url,
    username: Option<String>,
    password: Option<String>,
}

impl HttpBrokerConnection {
    fn message_url(&self, message: &OutboundMessage) -> Result<Url, BrokerError> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| BrokerError::UnsupportedUrl(self.endpoint.to_string()))?
            .pop_if_empty()
            .extend(["api", "message", message.topic.as_str()]);

        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("type", "topic")
                .append_pair("persistent", if message.persistent { "true" } else { "false" });
            for (name, value) in &message.properties {
                query.append_pair(name, value);
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl BrokerConnection for HttpBrokerConnection {
    async fn send(&self, message: &OutboundMessage) -> Result<(), BrokerError> {
        let url = self.message_url(message)?;
        trace!("posting message: url={url}");

        let mut request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(message.body.clone());
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_deref());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                BrokerError::ConnectionFailed {
                    url: self.endpoint.to_string(),
                    reason: e.to_string(),
                }
            } else {
                BrokerError::SendFailed {
                    topic: message.topic.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(BrokerError::SendFailed {
                topic: message.topic.clone(),
                reason: format!("broker responded with {status}"),
            });
        }
        Ok(())
    }

    async fn close(&self) {
        trace!("closing http broker connection: endpoint={}", self.endpoint);
    }
}
