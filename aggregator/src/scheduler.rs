use crate::aggregator::Aggregator;
use crate::config::RefreshConfig;
use crate::metrics_defs::REFRESH_DURATION;
use crate::types::{SourceDescriptor, SourceKind};
use serde::Serialize;
use shared::histogram;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshSummary {
    pub refreshed: usize,
    pub failed: usize,
    pub duration_ms: u64,
}

#[derive(Debug)]
pub enum Command {
    // Refresh every source now instead of waiting for the next tick.
    // The worker replies with the summary once the refresh settles.
    RefreshAll(oneshot::Sender<RefreshSummary>),
    // Stop the worker after the current refresh, if any.
    Shutdown,
}

/// Handle to the loader worker. All full refreshes run on the worker, so two
/// of them never overlap.
#[derive(Clone)]
pub struct Scheduler {
    tx: mpsc::Sender<Command>,
}

impl Scheduler {
    /// Spawns the worker. It refreshes once immediately and then every
    /// `interval_secs`.
    pub fn spawn(aggregator: Aggregator, config: RefreshConfig) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel::<Command>(16);
        let handle = tokio::spawn(run_worker(aggregator, config, rx));
        (Scheduler { tx }, handle)
    }

    /// Returns `None` if the worker has stopped.
    pub async fn refresh_all(&self) -> Option<RefreshSummary> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(Command::RefreshAll(reply_tx)).await.ok()?;
        reply_rx.await.ok()
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }
}

async fn run_worker(aggregator: Aggregator, config: RefreshConfig, mut rx: mpsc::Receiver<Command>) {
    let mut interval = tokio::time::interval(Duration::from_secs(config.interval_secs));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            // The first tick completes immediately.
            _ = interval.tick() => {
                refresh_all(&aggregator, config.batch_size).await;
            }
            cmd = rx.recv() => match cmd {
                Some(Command::RefreshAll(reply)) => {
                    let summary = refresh_all(&aggregator, config.batch_size).await;
                    let _ = reply.send(summary);
                    interval.reset();
                }
                Some(Command::Shutdown) | None => break,
            },
        }
    }

    tracing::info!("Refresh worker stopped");
}

/// Refreshes every registered source. Sources removed while the refresh runs
/// are skipped and not counted. Sheet and CSV sources go in batches of
/// `batch_size` fetched concurrently; a batch fully settles before the next
/// starts. Documents follow one at a time.
pub async fn refresh_all(aggregator: &Aggregator, batch_size: usize) -> RefreshSummary {
    let start = Instant::now();
    let (documents, tabular): (Vec<SourceDescriptor>, Vec<SourceDescriptor>) = aggregator
        .registry()
        .list_all()
        .into_iter()
        .partition(|source| source.kind() == SourceKind::Document);

    let mut summary = RefreshSummary::default();

    for batch in tabular.chunks(batch_size.max(1)) {
        let mut tasks = JoinSet::new();
        for source in batch {
            let aggregator = aggregator.clone();
            let name = source.name.clone();
            tasks.spawn(async move { aggregator.refresh(&name).await.map(|r| r.is_fresh()) });
        }

        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(Some(true)) => summary.refreshed += 1,
                Ok(Some(false)) => summary.failed += 1,
                // Removed since the listing was taken
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(error = %e, "Refresh task did not complete");
                    summary.failed += 1;
                }
            }
        }
    }

    for source in documents {
        match aggregator.refresh(&source.name).await {
            Some(recorded) if recorded.is_fresh() => summary.refreshed += 1,
            Some(_) => summary.failed += 1,
            None => {}
        }
    }

    let elapsed = start.elapsed();
    summary.duration_ms = elapsed.as_millis() as u64;
    histogram!(REFRESH_DURATION).record(elapsed.as_secs_f64());

    tracing::info!(
        refreshed = summary.refreshed,
        failed = summary.failed,
        duration_ms = summary.duration_ms,
        "Refreshed all sources"
    );
    summary
}
