//! Error types for the grouping/forwarding engine
//!
//! Each seam gets its own error enum so callers can tell a malformed event
//! (never worth retrying) from a broker that is simply not reachable right now.

use thiserror::Error;

use crate::grouping::Grouping;

/// An event that is structurally wrong
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("event does not contain a 'metricValue'")]
    MissingMetricValue,

    #[error("event contains a non-numeric 'metricValue': {0}")]
    NonNumericMetricValue(String),

    #[error("event contains NaN or infinite 'metricValue': {0}")]
    NonFiniteMetricValue(f64),

    #[error("event field '{field}' has an invalid value: {value}")]
    InvalidField { field: String, value: String },

    #[error("event text is not a JSON object: {0}")]
    Malformed(String),
}

/// Errors raised by a broker connector or connection
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("failed to connect to broker {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    #[error("failed to send message to topic {topic}: {reason}")]
    SendFailed { topic: String, reason: String },

    #[error("unsupported broker url: {0}")]
    UnsupportedUrl(String),

    #[error("invalid certificate for {host}: {reason}")]
    Certificate { host: String, reason: String },
}

/// Errors raised by the CEP engine
#[derive(Error, Debug)]
pub enum CepError {
    #[error("invalid statement '{statement}': {reason}")]
    InvalidStatement { statement: String, reason: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Errors raised while publishing or forwarding a single event
#[derive(Error, Debug)]
pub enum PublishError {
    /// The event itself is wrong, retrying cannot help
    #[error("event contains errors: {0}")]
    Validation(#[from] ValidationError),

    #[error("transport error: {0}")]
    Transport(#[from] BrokerError),

    #[error("local cep ingestion failed: {0}")]
    Cep(CepError),

    #[error("failed to encode event: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl PublishError {
    /// Whether another attempt could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            PublishError::Validation(_) | PublishError::Encoding(_) => false,
            PublishError::Cep(CepError::Validation(_)) => false,
            PublishError::Cep(_) | PublishError::Transport(_) => true,
        }
    }
}

impl From<CepError> for PublishError {
    fn from(err: CepError) -> Self {
        match err {
            CepError::Validation(e) => PublishError::Validation(e),
            other => PublishError::Cep(other),
        }
    }
}

/// Errors raised by the control-channel codec
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("invalid payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by grouping switches
///
/// A failed switch leaves the topology in an indeterminate mixture of old and
/// new groupings; callers retry the whole switch.
#[derive(Error, Debug)]
pub enum TopologyError {
    #[error("unknown grouping level: {0}")]
    UnknownLevel(String),

    #[error("grouping specified does not exist: {0}")]
    UnknownGrouping(String),

    #[error("grouping {0} is synthetic and cannot be activated")]
    GlobalNotActivatable(Grouping),

    #[error("failed to apply grouping {grouping}: {source}")]
    Cep {
        grouping: Grouping,
        #[source]
        source: CepError,
    },

    #[error("grouping {grouping} declares forward to {target} but has no broker connection for it")]
    MissingConnection { grouping: Grouping, target: String },

    #[error("failed to update trusted certificates: {0}")]
    Certificate(#[from] BrokerError),
}

/// Errors raised while parsing a control-channel command
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("empty command")]
    Empty,

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("{command}: missing argument <{argument}>")]
    MissingArgument {
        command: &'static str,
        argument: &'static str,
    },
}
