//! EventForwarder - single-consumer publish/forward queue
//!
//! One worker drains every local-publish and forward task of the node, one at
//! a time. Producers only enqueue (unbounded, never blocking), so rule
//! evaluation latency is decoupled from broker latency.
//!
//! ## Task State Machine
//!
//! ```text
//! Queued → Attempting → Completed
//!              │
//!              ├──→ Retrying → (tail of queue) → Attempting
//!              └──→ Dropped
//! ```
//!
//! Drop checks, in this order:
//!
//! 1. on dequeue: task older than `max_duration` → "max duration exceeded"
//! 2. validation error while publishing → "event contains errors" (no retry)
//! 3. after a failed attempt: `max_duration` again, then `retries > max_retries`
//!
//! A draining shutdown applies 1 and 2 as well; any other failure of the
//! final attempt is reported as "forwarder shutting down".
//!
//! Remote tasks are re-resolved against the sender's live forward wiring
//! before every attempt, since the aggregator of the target grouping may have
//! moved while the task was queued.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, instrument, trace, warn};

use crate::config::ForwarderConfig;
use crate::grouping::BrokerConnectionConfig;
use crate::publisher::EventPublisher;

use super::messages::{DropReason, ForwardTask, ForwarderCommand, ForwarderStats, ShutdownMode};

/// Receiving side of a forwarder, consumed by [`EventForwarder::new`]
pub struct ForwarderQueue {
    tasks: mpsc::UnboundedReceiver<ForwardTask>,
    retry_tx: mpsc::UnboundedSender<ForwardTask>,
    command_rx: mpsc::Receiver<ForwarderCommand>,
    pending: Arc<AtomicUsize>,
    local_broker: BrokerConnectionConfig,
}

impl ForwarderQueue {
    /// Take the next queued task without waiting
    #[cfg(test)]
    pub(crate) fn try_next(&mut self) -> Option<ForwardTask> {
        self.tasks.try_recv().ok()
    }
}

/// Actor owning the forward queue
pub struct EventForwarder {
    queue: ForwarderQueue,

    publisher: Arc<dyn EventPublisher>,

    /// Pause after each processed task
    loop_delay: Duration,

    max_retries: Option<u32>,
    max_duration: Option<Duration>,

    stats: ForwarderStats,
}

impl EventForwarder {
    pub fn new(config: &ForwarderConfig, publisher: Arc<dyn EventPublisher>, queue: ForwarderQueue) -> Self {
        Self {
            queue,
            publisher,
            loop_delay: config.loop_delay(),
            max_retries: config.max_retries,
            max_duration: config.max_duration(),
            stats: ForwarderStats::default(),
        }
    }

    /// Run the worker loop until shut down or every handle is gone
    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!(
            "starting event forwarder: max_retries={:?}, max_duration={:?}, loop_delay={:?}",
            self.max_retries, self.max_duration, self.loop_delay
        );

        loop {
            tokio::select! {
                biased;

                cmd = self.queue.command_rx.recv() => {
                    match cmd {
                        Some(ForwarderCommand::GetStats { respond_to }) => {
                            let _ = respond_to.send(self.current_stats());
                        }
                        Some(ForwarderCommand::Shutdown { mode, respond_to }) => {
                            let remaining = self.shutdown(mode).await;
                            let _ = respond_to.send(remaining);
                            break;
                        }
                        None => {
                            warn!("all forwarder handles dropped, shutting down");
                            self.shutdown(ShutdownMode::Discard).await;
                            break;
                        }
                    }
                }

                Some(task) = self.queue.tasks.recv() => {
                    self.process(task).await;
                    if !self.loop_delay.is_zero() {
                        tokio::time::sleep(self.loop_delay).await;
                    }
                }
            }
        }

        debug!("event forwarder stopped");
    }

    fn current_stats(&self) -> ForwarderStats {
        ForwarderStats {
            pending: self.queue.pending.load(Ordering::SeqCst),
            ..self.stats.clone()
        }
    }

    fn duration_exceeded(&self, task: &ForwardTask) -> bool {
        self.max_duration.is_some_and(|max| task.age() > max)
    }

    fn retries_exceeded(&self, task: &ForwardTask) -> bool {
        self.max_retries.is_some_and(|max| task.retries > max)
    }

    /// Process one task: attempt it, then complete, retry or drop it
    async fn process(&mut self, mut task: ForwardTask) {
        if self.duration_exceeded(&task) {
            self.drop_task(task, DropReason::MaxDurationExceeded);
            return;
        }

        let connection = self.resolve_connection(&task);
        trace!(
            "attempting task: subscriber={}, topic={}, url={}, retry={}",
            task.sender_name(),
            task.topic,
            connection.url,
            task.retries
        );

        match self.publisher.publish(&connection, &task.topic, &task.payload).await {
            Ok(()) => self.complete_task(task),
            Err(e) if !e.is_retryable() => {
                error!(
                    "{e}: subscriber={}, topic={}, payload={:?}",
                    task.sender_name(),
                    task.topic,
                    task.payload
                );
                self.drop_task(task, DropReason::InvalidEvent);
            }
            Err(e) => {
                task.retries += 1;
                task.last_retries.push(tokio::time::Instant::now());
                warn!(
                    "attempt failed: subscriber={}, topic={}, url={}, retry={}, error={e}",
                    task.sender_name(),
                    task.topic,
                    connection.url,
                    task.retries
                );

                if self.duration_exceeded(&task) {
                    self.drop_task(task, DropReason::MaxDurationExceeded);
                } else if self.retries_exceeded(&task) {
                    self.drop_task(task, DropReason::MaxRetriesExceeded);
                } else {
                    self.stats.retried += 1;
                    self.requeue(task);
                }
            }
        }
    }

    /// Destination to use for this attempt
    ///
    /// Local tasks always go to their snapshot. Remote tasks follow the
    /// sender's live wiring: cleared wiring means this node became the
    /// aggregator of the target grouping, so the event is published locally.
    fn resolve_connection(&self, task: &ForwardTask) -> BrokerConnectionConfig {
        let Some(sender) = task.sender.as_deref() else {
            return task.connection.clone();
        };
        if task.local {
            return task.connection.clone();
        }

        let live = sender.forward_to_groupings();
        if live.is_empty() {
            warn!(
                "forward configuration changed, publishing to local broker: subscriber={}, topic={}, grouping={:?}, payload={:?}",
                sender.name(),
                task.topic,
                task.connection.grouping,
                task.payload
            );
            return self.queue.local_broker.clone();
        }

        match live.iter().find(|c| c.grouping == task.connection.grouping) {
            Some(current) if !current.same_endpoint(&task.connection) => {
                warn!(
                    "forward configuration changed: subscriber={}, topic={}, grouping={:?}, old_url={}, new_url={}, payload={:?}",
                    sender.name(),
                    task.topic,
                    current.grouping,
                    task.connection.url,
                    current.url,
                    task.payload
                );
                current.clone()
            }
            Some(_) => task.connection.clone(),
            None => {
                warn!(
                    "no forward configured for grouping, keeping queued destination: subscriber={}, topic={}, grouping={:?}",
                    sender.name(),
                    task.topic,
                    task.connection.grouping
                );
                task.connection.clone()
            }
        }
    }

    fn complete_task(&mut self, task: ForwardTask) {
        self.queue.pending.fetch_sub(1, Ordering::SeqCst);
        let report = task.complete();
        let millis = report.total_duration.as_millis();
        self.stats.completed += 1;
        self.stats.total_duration_ms += millis;
        self.stats.max_duration_ms = self.stats.max_duration_ms.max(millis);
        trace!(
            "task completed: topic={}, retries={}, duration_ms={millis}",
            report.topic, report.retries
        );
    }

    fn drop_task(&mut self, task: ForwardTask, reason: DropReason) {
        self.queue.pending.fetch_sub(1, Ordering::SeqCst);
        self.stats.dropped += 1;
        error!(
            "{reason}, dropping event: subscriber={}, topic={}, url={}, retries={}, age={:?}, payload={:?}",
            task.sender_name(),
            task.topic,
            task.connection.url,
            task.retries,
            task.age(),
            task.payload
        );
        task.drop_with(reason);
    }

    /// Append a failed task to the tail of the queue
    fn requeue(&mut self, task: ForwardTask) {
        if let Err(mpsc::error::SendError(task)) = self.queue.retry_tx.send(task) {
            self.drop_task(task, DropReason::ShuttingDown);
        }
    }

    /// Close the queue and drain or discard what is left
    async fn shutdown(&mut self, mode: ShutdownMode) -> usize {
        self.queue.tasks.close();
        let mut remaining = 0;

        while let Ok(task) = self.queue.tasks.try_recv() {
            remaining += 1;
            match mode {
                ShutdownMode::Discard => self.drop_task(task, DropReason::ShuttingDown),
                ShutdownMode::Drain if self.duration_exceeded(&task) => {
                    self.drop_task(task, DropReason::MaxDurationExceeded);
                }
                ShutdownMode::Drain => {
                    let connection = self.resolve_connection(&task);
                    match self.publisher.publish(&connection, &task.topic, &task.payload).await {
                        Ok(()) => self.complete_task(task),
                        Err(e) if !e.is_retryable() => {
                            error!("{e}: subscriber={}, topic={}", task.sender_name(), task.topic);
                            self.drop_task(task, DropReason::InvalidEvent);
                        }
                        Err(e) => {
                            debug!("final attempt failed: topic={}, error={e}", task.topic);
                            self.drop_task(task, DropReason::ShuttingDown);
                        }
                    }
                }
            }
        }

        debug!("forwarder shut down: mode={mode:?}, remaining={remaining}");
        remaining
    }
}

/// Handle for feeding and controlling the EventForwarder
///
/// Cheap to clone; every statement subscriber owns one.
#[derive(Clone)]
pub struct ForwarderHandle {
    tasks: mpsc::UnboundedSender<ForwardTask>,
    sender: mpsc::Sender<ForwarderCommand>,
    pending: Arc<AtomicUsize>,
    local_broker: BrokerConnectionConfig,
}

impl ForwarderHandle {
    /// Create a handle and the queue a forwarder will consume
    ///
    /// Tasks added before the forwarder runs simply wait in the queue.
    pub fn channel(local_broker: BrokerConnectionConfig) -> (Self, ForwarderQueue) {
        let (task_tx, task_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let pending = Arc::new(AtomicUsize::new(0));

        let handle = Self {
            tasks: task_tx.clone(),
            sender: cmd_tx,
            pending: pending.clone(),
            local_broker: local_broker.clone(),
        };
        let queue = ForwarderQueue {
            tasks: task_rx,
            retry_tx: task_tx,
            command_rx: cmd_rx,
            pending,
            local_broker,
        };
        (handle, queue)
    }

    /// Spawn a new forwarder actor
    pub fn spawn(
        config: &ForwarderConfig,
        local_broker: BrokerConnectionConfig,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        let (handle, queue) = Self::channel(local_broker);
        let actor = EventForwarder::new(config, publisher, queue);
        tokio::spawn(actor.run());
        handle
    }

    /// Descriptor used for local publish tasks
    pub fn local_broker(&self) -> &BrokerConnectionConfig {
        &self.local_broker
    }

    /// Queue a publish to the local broker, using the local credentials
    pub fn add_local_publish_task(&self, mut task: ForwardTask) -> Result<()> {
        task.local = true;
        task.connection = self.local_broker.clone();
        self.enqueue(task)
    }

    /// Queue a forward to the broker of another grouping
    pub fn add_event_forward_task(&self, connection: BrokerConnectionConfig, mut task: ForwardTask) -> Result<()> {
        task.local = false;
        task.connection = connection;
        self.enqueue(task)
    }

    fn enqueue(&self, task: ForwardTask) -> Result<()> {
        self.pending.fetch_add(1, Ordering::SeqCst);
        match self.tasks.send(task) {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(task)) => {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                let topic = task.topic.clone();
                task.drop_with(DropReason::ShuttingDown);
                Err(anyhow!("forwarder is not running, task for topic {topic} dropped"))
            }
        }
    }

    /// Tasks queued or being attempted
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub async fn stats(&self) -> Result<ForwarderStats> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ForwarderCommand::GetStats { respond_to: tx })
            .await
            .context("failed to send GetStats command")?;
        rx.await.context("failed to receive response")
    }

    /// Shut the forwarder down, returning the number of tasks still queued
    pub async fn shutdown(&self, mode: ShutdownMode) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ForwarderCommand::Shutdown { mode, respond_to: tx })
            .await
            .context("failed to send Shutdown command")?;
        rx.await.context("failed to receive response")
    }
}
