//! Periodic GC driver.

use crate::gc::{GarbageCollector, GcKind, GcRunSummary};
use stash_core::config::GcConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Runs every GC kind on a fixed interval until told to stop.
pub struct GcScheduler {
    collector: Arc<GarbageCollector>,
    interval: Duration,
    max_batches_per_tick: u32,
}

impl GcScheduler {
    pub fn new(collector: Arc<GarbageCollector>, config: &GcConfig) -> Self {
        Self {
            collector,
            interval: config.interval(),
            max_batches_per_tick: config.max_batches_per_tick.max(1),
        }
    }

    /// One pass over every GC kind. A failing kind is logged and does not
    /// stop the others.
    pub async fn tick(&self) -> Vec<GcRunSummary> {
        let mut summaries = Vec::with_capacity(GcKind::ALL.len());
        for kind in GcKind::ALL {
            match self
                .collector
                .run_until_drained(kind, self.max_batches_per_tick)
                .await
            {
                Ok(summary) => summaries.push(summary),
                Err(e) => {
                    tracing::error!(kind = %kind, error = %e, "GC run failed");
                }
            }
        }
        summaries
    }

    /// Spawn the loop. It exits when `shutdown` flips to true or its sender
    /// is dropped.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tracing::info!(
                interval_secs = self.interval.as_secs(),
                max_batches_per_tick = self.max_batches_per_tick,
                "GC scheduler started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.tick().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("GC scheduler stopped");
        })
    }
}
