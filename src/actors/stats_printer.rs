//! StatsPrinter - logs the publish/forward counters at a fixed rate
//!
//! ```text
//! init delay → tick → snapshot → log as JSON and/or CSV → tick → ...
//!                 ↑
//!                 └─── Commands (PrintNow, Shutdown)
//! ```
//!
//! The CSV header is logged once, before the first value line.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, interval_at};
use tracing::{debug, error, info, instrument, warn};

use crate::config::StatsConfig;
use crate::stats::{ForwardStatistics, StatisticsSnapshot};

use super::messages::StatsPrinterCommand;

pub struct StatsPrinter {
    stats: Arc<ForwardStatistics>,
    config: StatsConfig,
    command_rx: mpsc::Receiver<StatsPrinterCommand>,
    header_printed: bool,
}

impl StatsPrinter {
    pub fn new(
        stats: Arc<ForwardStatistics>,
        config: StatsConfig,
        command_rx: mpsc::Receiver<StatsPrinterCommand>,
    ) -> Self {
        Self {
            stats,
            config,
            command_rx,
            header_printed: false,
        }
    }

    #[instrument(skip(self))]
    pub async fn run(mut self) {
        let rate = Duration::from_secs(self.config.rate_secs.max(1));
        let start = Instant::now() + Duration::from_secs(self.config.init_delay_secs);
        debug!("starting stats printer: rate={rate:?}");

        let mut ticker = interval_at(start, rate);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.print();
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(StatsPrinterCommand::PrintNow { respond_to }) => {
                            let _ = respond_to.send(self.print());
                        }
                        Some(StatsPrinterCommand::Shutdown) => {
                            debug!("received shutdown command");
                            break;
                        }
                        None => {
                            warn!("command channel closed, shutting down");
                            break;
                        }
                    }
                }
            }
        }
    }

    fn print(&mut self) -> StatisticsSnapshot {
        let snapshot = self.stats.snapshot();

        if self.config.as_json {
            match serde_json::to_string(&snapshot) {
                Ok(json) => info!("statistics: {json}"),
                Err(e) => error!("failed to serialize statistics: {e}"),
            }
        }
        if self.config.as_csv {
            let (header, values) = snapshot.to_csv();
            if !self.header_printed {
                info!("statistics csv: {header}");
                self.header_printed = true;
            }
            info!("statistics csv: {values}");
        }
        snapshot
    }
}

#[derive(Clone)]
pub struct StatsPrinterHandle {
    sender: mpsc::Sender<StatsPrinterCommand>,
}

impl StatsPrinterHandle {
    pub fn spawn(stats: Arc<ForwardStatistics>, config: StatsConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let actor = StatsPrinter::new(stats, config, cmd_rx);
        tokio::spawn(actor.run());
        Self { sender: cmd_tx }
    }

    /// Log the statistics right away
    pub async fn print_now(&self) -> Result<StatisticsSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(StatsPrinterCommand::PrintNow { respond_to: tx })
            .await
            .context("failed to send PrintNow command")?;
        rx.await.context("failed to receive response")
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(StatsPrinterCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")?;
        Ok(())
    }
}
