use std::{sync::Arc, time::Duration};

use tokio::{runtime::Handle, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::cache::Sweep;

/// Run one eviction pass over every target. Returns the total removed.
pub fn sweep_once(targets: &[Arc<dyn Sweep>], batch: usize) -> usize {
    targets
        .iter()
        .map(|target| {
            let removed = target.sweep_expired(batch);
            trace!(cache = target.name(), removed, "sweep pass");
            removed
        })
        .sum()
}

/// Background task evicting expired cache entries on a fixed interval.
#[derive(Debug)]
pub struct Sweeper {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl Sweeper {
    pub fn spawn(
        runtime: &Handle,
        targets: Vec<Arc<dyn Sweep>>,
        every: Duration,
        batch: usize,
    ) -> Self {
        let stop = CancellationToken::new();
        let task = runtime.spawn(sweep_loop(targets, every, batch, stop.clone()));
        debug!(interval_ms = every.as_millis() as u64, batch, "sweeper started");
        Self { stop, task }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the task to stop without waiting for it.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Stop and wait for the task to exit.
    pub async fn shutdown(self) {
        self.stop.cancel();
        if let Err(err) = self.task.await {
            debug!(error = %err, "sweeper task ended abnormally");
        }
    }
}

async fn sweep_loop(
    targets: Vec<Arc<dyn Sweep>>,
    every: Duration,
    batch: usize,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                let removed = sweep_once(&targets, batch);
                if removed > 0 {
                    debug!(removed, "evicted expired cache entries");
                }
            }
        }
    }
    debug!("sweeper stopped");
}
