//! Statement subscriber - listener bound to one CEP rule
//!
//! The CEP engine calls [`StatementSubscriber::update`] on its own thread for
//! every rule output. The subscriber never blocks there: it validates the
//! event, queues one local publish and one forward per configured target
//! grouping, and returns.
//!
//! The forward set is replaced as a whole by the topology manager (a
//! copy-on-write `Arc<Vec<_>>`), so the forwarder always reads a complete set.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{error, trace, warn};

use crate::actors::forwarder::ForwarderHandle;
use crate::actors::messages::ForwardTask;
use crate::event::{EventMap, EventPayload};
use crate::grouping::{BrokerConnectionConfig, Grouping};
use crate::stats::ForwardStatistics;

pub struct StatementSubscriber {
    name: String,
    grouping: Grouping,
    topic: String,
    statement: String,
    forward_to_groupings: RwLock<Arc<Vec<BrokerConnectionConfig>>>,
    forwarder: ForwarderHandle,
    stats: Arc<ForwardStatistics>,
}

impl StatementSubscriber {
    pub fn new(
        name: impl Into<String>,
        grouping: Grouping,
        topic: impl Into<String>,
        statement: impl Into<String>,
        forwarder: ForwarderHandle,
        stats: Arc<ForwardStatistics>,
    ) -> Self {
        Self {
            name: name.into(),
            grouping,
            topic: topic.into(),
            statement: statement.into(),
            forward_to_groupings: RwLock::new(Arc::new(Vec::new())),
            forwarder,
            stats,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Grouping whose rule this subscriber listens to
    pub fn grouping(&self) -> Grouping {
        self.grouping
    }

    /// Topic rule output is published to
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn statement(&self) -> &str {
        &self.statement
    }

    /// Current forward targets (snapshot)
    pub fn forward_to_groupings(&self) -> Arc<Vec<BrokerConnectionConfig>> {
        self.forward_to_groupings.read().clone()
    }

    pub fn set_forward_to_groupings(&self, connections: Vec<BrokerConnectionConfig>) {
        *self.forward_to_groupings.write() = Arc::new(connections);
    }

    pub fn clear_forwards(&self) {
        self.set_forward_to_groupings(Vec::new());
    }

    /// Handle one rule output
    pub fn update(self: &Arc<Self>, event: EventMap) {
        if let Err(e) = event.validate() {
            error!(
                "event contains errors, not published: subscriber={}, topic={}, error={e}, payload={event:?}",
                self.name, self.topic
            );
            self.stats.count_local_publish(false);
            return;
        }
        trace!("rule output: subscriber={}, topic={}", self.name, self.topic);

        let payload = EventPayload::Raw(event);

        let (ok, failed) = (self.stats.clone(), self.stats.clone());
        let task = ForwardTask::new(&self.topic, payload.clone())
            .with_sender(self.clone())
            .on_success(move |_| ok.count_local_publish(true))
            .on_failure(move |_| failed.count_local_publish(false));
        if let Err(e) = self.forwarder.add_local_publish_task(task) {
            warn!("{e:#}: subscriber={}", self.name);
        }

        for connection in self.forward_to_groupings().iter() {
            let (ok, failed) = (self.stats.clone(), self.stats.clone());
            let task = ForwardTask::new(&self.topic, payload.clone())
                .with_sender(self.clone())
                .on_success(move |_| ok.count_forward(true))
                .on_failure(move |_| failed.count_forward(false));
            if let Err(e) = self.forwarder.add_event_forward_task(connection.clone(), task) {
                warn!("{e:#}: subscriber={}, grouping={:?}", self.name, connection.grouping);
            }
        }
    }
}

impl fmt::Debug for StatementSubscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatementSubscriber")
            .field("name", &self.name)
            .field("grouping", &self.grouping)
            .field("topic", &self.topic)
            .field("statement", &self.statement)
            .field("forward_to_groupings", &self.forward_to_groupings())
            .finish()
    }
}
