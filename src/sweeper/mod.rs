use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::PruneConfig;
use crate::flow::FlowTracker;

/// Periodically finishes flows that have gone idle.
pub struct Sweeper {
    tracker: Arc<FlowTracker>,
    interval: Duration,
    idle_timeout: Duration,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Sweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sweeper")
            .field("interval", &self.interval)
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}

impl Sweeper {
    pub fn new(tracker: Arc<FlowTracker>, cfg: &PruneConfig) -> Self {
        Self {
            tracker,
            interval: cfg.interval,
            idle_timeout: cfg.idle_timeout,
            running: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
        }
    }

    /// Runs one pruning pass. Returns how many flows were finished.
    pub fn sweep_once(&self) -> usize {
        sweep(&self.tracker, self.idle_timeout)
    }

    /// Start the background sweep task.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return; // Already running.
        }

        let tracker = Arc::clone(&self.tracker);
        let idle_timeout = self.idle_timeout;
        let period = self.interval;
        let cancel = self.cancel.clone();

        info!(?period, ?idle_timeout, "sweeper started");

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("sweeper stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        sweep(&tracker, idle_timeout);
                    }
                }
            }
        });
    }

    /// Stop the background task.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

fn sweep(tracker: &FlowTracker, idle_timeout: Duration) -> usize {
    let pruned = tracker.prune(idle_timeout);
    if pruned > 0 {
        debug!(pruned, "finished idle flows");
    }
    pruned
}
