//! Message types for actor communication
//!
//! ## Design Principles
//!
//! 1. **Tasks**: units of forwarding work, queued on an unbounded channel so
//!    producers (statement subscribers running on the CEP thread) never block
//! 2. **Commands**: request/response messages sent to a specific actor via mpsc
//! 3. **Events**: broadcast notifications about topology changes

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::event::EventPayload;
use crate::grouping::{BrokerConnectionConfig, Grouping};
use crate::stats::StatisticsSnapshot;
use crate::subscriber::StatementSubscriber;

/// Callback fired once when a task completes or is dropped
pub type TaskCallback = Box<dyn FnOnce(&TaskReport) + Send>;

/// A queued unit of work: deliver this event to this destination
///
/// Created by a statement subscriber on every rule match (or by the control
/// channel for synthetic events). The connection is a snapshot taken at
/// enqueue time; the forwarder re-resolves it against the sender's live
/// forward wiring before every attempt.
pub struct ForwardTask {
    /// Subscriber that produced the event (None for synthetic events)
    pub sender: Option<Arc<StatementSubscriber>>,

    /// Whether the task targets the local broker
    pub local: bool,

    /// Destination valid when the task was queued
    pub connection: BrokerConnectionConfig,

    pub topic: String,
    pub payload: EventPayload,

    pub on_success: Option<TaskCallback>,
    pub on_failure: Option<TaskCallback>,

    pub created: Instant,

    /// Failed attempts so far
    pub retries: u32,

    /// When each failed attempt happened
    pub last_retries: Vec<Instant>,
}

impl ForwardTask {
    pub fn new(topic: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            sender: None,
            local: true,
            connection: BrokerConnectionConfig::default(),
            topic: topic.into(),
            payload,
            on_success: None,
            on_failure: None,
            created: Instant::now(),
            retries: 0,
            last_retries: Vec::new(),
        }
    }

    pub fn with_sender(mut self, sender: Arc<StatementSubscriber>) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn on_success(mut self, callback: impl FnOnce(&TaskReport) + Send + 'static) -> Self {
        self.on_success = Some(Box::new(callback));
        self
    }

    pub fn on_failure(mut self, callback: impl FnOnce(&TaskReport) + Send + 'static) -> Self {
        self.on_failure = Some(Box::new(callback));
        self
    }

    /// Name of the sending subscriber, for logs
    pub fn sender_name(&self) -> &str {
        self.sender.as_deref().map(|s| s.name()).unwrap_or("-")
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    fn report(&self, outcome: TaskOutcome) -> TaskReport {
        TaskReport {
            topic: self.topic.clone(),
            retries: self.retries,
            total_duration: self.age(),
            outcome,
        }
    }

    /// Fire the success callback and hand back the report
    pub fn complete(mut self) -> TaskReport {
        let report = self.report(TaskOutcome::Completed);
        if let Some(callback) = self.on_success.take() {
            callback(&report);
        }
        report
    }

    /// Fire the failure callback and hand back the report
    pub fn drop_with(mut self, reason: DropReason) -> TaskReport {
        let report = self.report(TaskOutcome::Dropped(reason));
        if let Some(callback) = self.on_failure.take() {
            callback(&report);
        }
        report
    }
}

impl fmt::Debug for ForwardTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwardTask")
            .field("sender", &self.sender_name())
            .field("local", &self.local)
            .field("connection", &self.connection)
            .field("topic", &self.topic)
            .field("payload", &self.payload)
            .field("retries", &self.retries)
            .finish()
    }
}

/// How a task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Dropped(DropReason),
}

/// Why a task was given up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    MaxRetriesExceeded,
    MaxDurationExceeded,
    InvalidEvent,
    ShuttingDown,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DropReason::MaxRetriesExceeded => "max retries exceeded",
            DropReason::MaxDurationExceeded => "max duration exceeded",
            DropReason::InvalidEvent => "event contains errors",
            DropReason::ShuttingDown => "forwarder shutting down",
        })
    }
}

/// Passed to task callbacks
#[derive(Debug, Clone, PartialEq)]
pub struct TaskReport {
    pub topic: String,
    pub retries: u32,
    pub total_duration: Duration,
    pub outcome: TaskOutcome,
}

impl TaskReport {
    pub fn is_success(&self) -> bool {
        self.outcome == TaskOutcome::Completed
    }
}

/// What happens to queued tasks on shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownMode {
    /// Attempt every queued task once more, without re-enqueueing
    #[default]
    Drain,

    /// Drop every queued task
    Discard,
}

/// Commands that can be sent to the EventForwarder
#[derive(Debug)]
pub enum ForwarderCommand {
    /// Get forwarding bookkeeping
    GetStats {
        respond_to: oneshot::Sender<ForwarderStats>,
    },

    /// Stop accepting tasks, drain or discard the queue, then exit
    ///
    /// Responds with the number of tasks that were still queued.
    Shutdown {
        mode: ShutdownMode,
        respond_to: oneshot::Sender<usize>,
    },
}

/// Duration/latency bookkeeping of the forwarder
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ForwarderStats {
    pub completed: u64,
    pub dropped: u64,

    /// Failed attempts that were re-enqueued
    pub retried: u64,

    /// Tasks currently queued (retries included)
    pub pending: usize,

    /// Sum of enqueue-to-completion times of completed tasks
    pub total_duration_ms: u128,

    pub max_duration_ms: u128,
}

impl ForwarderStats {
    pub fn average_duration_ms(&self) -> u128 {
        if self.completed == 0 {
            0
        } else {
            self.total_duration_ms / self.completed as u128
        }
    }
}

/// Commands that can be sent to the StatsPrinter
#[derive(Debug)]
pub enum StatsPrinterCommand {
    /// Log the statistics right away and return the printed snapshot
    PrintNow {
        respond_to: oneshot::Sender<StatisticsSnapshot>,
    },

    Shutdown,
}

/// Event published when the topology of this node changed
///
/// Consumed by node-status logic and by the control plane, which is told
/// about grouping changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyEvent {
    ActiveGroupingChanged {
        previous: Option<Grouping>,
        current: Grouping,

        /// Whether this node is the configured aggregator of `current`
        aggregator: bool,
    },

    /// Every grouping was removed
    Cleared,
}
