//! Complex-event-processing engine seam
//!
//! The rule engine itself lives outside this crate. The topology manager
//! merges grouping definitions into it and registers one statement subscriber
//! per rule; the local-bypass publisher feeds events straight into it.
//!
//! The engine calls [`StatementSubscriber::update`] synchronously on its own
//! thread whenever a rule matches, so subscribers must never block.
//!
//! [`StatementSubscriber::update`]: crate::subscriber::StatementSubscriber::update

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::CepError;
use crate::event::EventMap;
use crate::grouping::FunctionDefinition;
use crate::subscriber::StatementSubscriber;

pub mod memory;

pub use memory::InMemoryEngine;

pub trait CepEngine: Send + Sync {
    /// Declare event types (one per topic the engine consumes)
    fn add_event_types(&self, event_types: &BTreeSet<String>) -> Result<(), CepError>;

    /// Merge constants into the engine (existing names are overwritten)
    fn set_constants(&self, constants: &HashMap<String, f64>) -> Result<(), CepError>;

    fn add_function_definitions(
        &self,
        functions: &BTreeSet<FunctionDefinition>,
    ) -> Result<(), CepError>;

    /// Compile the subscriber's statement and attach the subscriber to its output
    fn add_statement_subscriber(&self, subscriber: Arc<StatementSubscriber>)
    -> Result<(), CepError>;

    /// Detach a subscriber and destroy its statement
    fn remove_statement_subscriber(&self, subscriber: &StatementSubscriber);

    /// Drop every statement and definition
    fn clear_state(&self);

    /// Ingest a typed event published to `destination`
    fn handle_event(&self, destination: &str, event: EventMap) -> Result<(), CepError>;

    /// Ingest a flattened key/value event
    fn handle_map(&self, destination: &str, map: Map<String, Value>) -> Result<(), CepError> {
        self.handle_event(destination, EventMap::from_map(map)?)
    }

    /// Ingest an event serialized as JSON text
    fn handle_text(&self, destination: &str, text: &str) -> Result<(), CepError> {
        self.handle_event(destination, EventMap::parse(text)?)
    }
}
