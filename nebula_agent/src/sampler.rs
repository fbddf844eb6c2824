//! Background sampler: collects a snapshot at a fixed interval, keeps the bounded
//! history, persists best-effort and publishes to the hub.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::history::History;
use crate::hub::Hub;
use crate::metrics::MetricsSource;
use crate::store::{MetricsEntry, MetricsStore};
use crate::types::Snapshot;

pub struct Sampler {
    source: Arc<Mutex<Box<dyn MetricsSource>>>,
    history: Arc<History>,
    hub: Hub,
    store: Option<Arc<dyn MetricsStore>>,
    retention: Option<Duration>,
    period: Duration,
}

impl Sampler {
    pub fn new(
        source: Box<dyn MetricsSource>,
        history: Arc<History>,
        hub: Hub,
        period: Duration,
    ) -> Self {
        Self {
            source: Arc::new(Mutex::new(source)),
            history,
            hub,
            store: None,
            retention: None,
            period,
        }
    }

    /// Persist every snapshot to `store`, pruning entries older than `retention`.
    pub fn with_store(mut self, store: Arc<dyn MetricsStore>, retention: Option<Duration>) -> Self {
        self.store = Some(store);
        self.retention = retention;
        self
    }

    /// Start ticking. The first sample is taken immediately.
    pub fn spawn(self, cancel: CancellationToken) -> SamplerHandle {
        let token = cancel.clone();
        let task = tokio::spawn(self.run(token));
        SamplerHandle { task, cancel }
    }

    async fn run(self, cancel: CancellationToken) {
        info!(period_ms = self.period.as_millis() as u64, "sampler running");
        let mut ticker = interval(self.period);
        // a slow collection delays the schedule instead of bursting to catch up
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_prune: Option<Instant> = None;

        loop {
            if cancel.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Some(snapshot) = self.collect().await else {
                continue;
            };
            self.history.push(snapshot.clone());
            self.persist(&snapshot, &mut last_prune);
            self.hub.publish_json("metrics", &snapshot);
        }
        info!("sampler stopped");
    }

    async fn collect(&self) -> Option<Snapshot> {
        let source = self.source.clone();
        let mut snapshot = match tokio::task::spawn_blocking(move || source.lock().collect()).await
        {
            Ok(s) => s,
            Err(e) => {
                error!("metrics collection task failed: {e}");
                return None;
            }
        };
        // History stays strictly ordered even if the wall clock steps back.
        if let Some(last) = self.history.last_timestamp() {
            if snapshot.timestamp <= last {
                snapshot.timestamp = last + chrono::Duration::microseconds(1);
            }
        }
        Some(snapshot)
    }

    // Fire-and-forget: store errors are logged, never propagated into the tick.
    fn persist(&self, snapshot: &Snapshot, last_prune: &mut Option<Instant>) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let entry = MetricsEntry::from(snapshot);
        let prune = self.retention.filter(|r| {
            let every = (*r / 60).max(Duration::from_secs(1));
            let due = last_prune.map_or(true, |t| t.elapsed() >= every);
            if due {
                *last_prune = Some(Instant::now());
            }
            due
        });
        tokio::task::spawn_blocking(move || {
            if let Err(e) = store.add_metrics_entry(&entry) {
                warn!("failed to persist metrics entry: {e:#}");
            }
            if let Some(retention) = prune {
                match store.prune_older_than(retention) {
                    Ok(0) => {}
                    Ok(n) => debug!(removed = n, "pruned stored metrics"),
                    Err(e) => warn!("failed to prune stored metrics: {e:#}"),
                }
            }
        });
    }
}

pub struct SamplerHandle {
    task: JoinHandle<()>,
    cancel: CancellationToken,
}

impl SamplerHandle {
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Cooperative stop: an in-flight collection finishes, the next tick never starts.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!("sampler task failed: {e}");
        }
    }
}
