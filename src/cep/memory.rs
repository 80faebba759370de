//! In-memory reference engine
//!
//! Records merged definitions and registered subscribers, and supports one
//! statement form, the pass-through:
//!
//! ```text
//! SELECT * FROM <EventType>
//! ```
//!
//! Every event ingested on `<EventType>` is handed to the subscribers of such
//! statements. Any other statement is accepted and registered but never fires.
//! Useful for tests and for nodes that only relay events upwards.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

use parking_lot::{Mutex, RwLock};
use regex::Regex;
use tracing::{debug, trace};

use crate::error::CepError;
use crate::event::EventMap;
use crate::grouping::FunctionDefinition;
use crate::subscriber::StatementSubscriber;

use super::CepEngine;

/// Ingested events kept for inspection
const MAX_HISTORY: usize = 1000;

static PASS_THROUGH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*select\s+\*\s+from\s+([A-Za-z_][A-Za-z0-9_.\-]*)\s*;?\s*$")
        .expect("pass-through pattern is valid")
});

struct Statement {
    /// Event type the statement selects from, if it is a pass-through
    source: Option<String>,
    subscriber: Arc<StatementSubscriber>,
}

#[derive(Default)]
pub struct InMemoryEngine {
    event_types: RwLock<BTreeSet<String>>,
    constants: RwLock<HashMap<String, f64>>,
    functions: RwLock<BTreeSet<FunctionDefinition>>,
    statements: RwLock<Vec<Statement>>,
    history: Mutex<VecDeque<(String, EventMap)>>,
    received: AtomicU64,
}

impl InMemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_types(&self) -> BTreeSet<String> {
        self.event_types.read().clone()
    }

    pub fn constants(&self) -> HashMap<String, f64> {
        self.constants.read().clone()
    }

    pub fn function_definitions(&self) -> BTreeSet<FunctionDefinition> {
        self.functions.read().clone()
    }

    /// Names of the registered subscribers, in registration order
    pub fn subscriber_names(&self) -> Vec<String> {
        self.statements
            .read()
            .iter()
            .map(|s| s.subscriber.name().to_string())
            .collect()
    }

    pub fn subscribers(&self) -> Vec<Arc<StatementSubscriber>> {
        self.statements
            .read()
            .iter()
            .map(|s| s.subscriber.clone())
            .collect()
    }

    /// Events ingested so far (most recent last)
    pub fn history(&self) -> Vec<(String, EventMap)> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

impl CepEngine for InMemoryEngine {
    fn add_event_types(&self, event_types: &BTreeSet<String>) -> Result<(), CepError> {
        debug!("adding event types: {event_types:?}");
        self.event_types.write().extend(event_types.iter().cloned());
        Ok(())
    }

    fn set_constants(&self, constants: &HashMap<String, f64>) -> Result<(), CepError> {
        debug!("setting constants: {constants:?}");
        self.constants
            .write()
            .extend(constants.iter().map(|(k, v)| (k.clone(), *v)));
        Ok(())
    }

    fn add_function_definitions(
        &self,
        functions: &BTreeSet<FunctionDefinition>,
    ) -> Result<(), CepError> {
        debug!("adding {} function definitions", functions.len());
        self.functions.write().extend(functions.iter().cloned());
        Ok(())
    }

    fn add_statement_subscriber(
        &self,
        subscriber: Arc<StatementSubscriber>,
    ) -> Result<(), CepError> {
        let statement = subscriber.statement().trim();
        if statement.is_empty() {
            return Err(CepError::InvalidStatement {
                statement: statement.to_string(),
                reason: "empty statement".to_string(),
            });
        }

        let source = PASS_THROUGH
            .captures(statement)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string());
        debug!(
            "adding statement subscriber: subscriber={}, topic={}, source={source:?}",
            subscriber.name(),
            subscriber.topic()
        );

        let mut statements = self.statements.write();
        statements.retain(|s| s.subscriber.name() != subscriber.name());
        statements.push(Statement { source, subscriber });
        Ok(())
    }

    fn remove_statement_subscriber(&self, subscriber: &StatementSubscriber) {
        debug!("removing statement subscriber: {}", subscriber.name());
        self.statements
            .write()
            .retain(|s| s.subscriber.name() != subscriber.name());
    }

    fn clear_state(&self) {
        debug!("clearing engine state");
        self.statements.write().clear();
        self.event_types.write().clear();
        self.constants.write().clear();
        self.functions.write().clear();
    }

    fn handle_event(&self, destination: &str, event: EventMap) -> Result<(), CepError> {
        event.validate()?;
        self.received.fetch_add(1, Ordering::Relaxed);

        {
            let mut history = self.history.lock();
            if history.len() >= MAX_HISTORY {
                history.pop_front();
            }
            history.push_back((destination.to_string(), event.clone()));
        }

        // Collect matches first so no lock is held while subscribers run
        let matching: Vec<Arc<StatementSubscriber>> = self
            .statements
            .read()
            .iter()
            .filter(|s| s.source.as_deref() == Some(destination))
            .map(|s| s.subscriber.clone())
            .collect();

        trace!(
            "event ingested: destination={destination}, matching_statements={}",
            matching.len()
        );
        for subscriber in matching {
            subscriber.update(event.clone());
        }
        Ok(())
    }
}
