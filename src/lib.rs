//! Hierarchical event grouping and forwarding
//!
//! A node runs the CEP rules of every grouping level in its active chain,
//! publishes rule output to its local broker and forwards it to the broker of
//! the next aggregation level.

pub mod actors;
pub mod broker;
pub mod cache;
pub mod cep;
pub mod config;
pub mod control;
pub mod error;
pub mod event;
pub mod grouping;
pub mod node;
pub mod publisher;
pub mod stats;
pub mod subscriber;
pub mod topology;

pub use actors::forwarder::ForwarderHandle;
pub use actors::messages::{ShutdownMode, TopologyEvent};
pub use event::{EventMap, EventPayload};
pub use grouping::{BrokerConnectionConfig, Grouping, GroupingConfiguration};
pub use node::Node;
pub use topology::{SwitchOutcome, TopologyManager};
