use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::MonotonicClock;
use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::flow::FlowTracker;
use crate::sink::{RecordSink, Sink};
use crate::source::parse::ParseError;
use crate::source::replay::ReplaySource;
use crate::source::EventSource;
use crate::sweeper::Sweeper;

/// Agent orchestrates all components: event source, tracker, sweeper, sink
/// and health metrics.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    tracker: Option<Arc<FlowTracker>>,
    sweeper: Option<Sweeper>,
    source: Option<ReplaySource>,
    sink: Option<RecordSink>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            tracker: None,
            sweeper: None,
            source: None,
            sink: None,
            cancel: CancellationToken::new(),
        })
    }

    /// The running tracker, once started.
    pub fn tracker(&self) -> Option<&Arc<FlowTracker>> {
        self.tracker.as_ref()
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    /// Start all components and begin tracking.
    pub async fn start(&mut self) -> Result<()> {
        // 0. Health server first so probes respond during startup.
        if self.cfg.health.enabled {
            self.health
                .start()
                .await
                .context("starting health metrics server")?;
        }

        // 1. Allocate the flow table.
        let tracker = Arc::new(
            FlowTracker::new(&self.cfg.tracker, Arc::new(MonotonicClock::new()))
                .context("creating flow tracker")?,
        );
        let layout = tracker.histogram_layout();
        debug!(
            lower_bounds = ?layout.lower_bounds().collect::<Vec<_>>(),
            "congestion window histogram buckets",
        );
        self.health.publish_occupancy(&tracker.occupancy());

        // 2. Sink owns the drain session.
        let mut sink = RecordSink::new(self.cfg.sink.clone(), tracker.open_reader());
        sink.start(self.cancel.child_token())
            .await
            .with_context(|| format!("starting {} sink", sink.name()))?;
        self.sink = Some(sink);

        // 3. Idle flow pruning.
        let sweeper = Sweeper::new(Arc::clone(&tracker), &self.cfg.prune);
        sweeper.start();
        self.sweeper = Some(sweeper);

        // 4. Event source feeding the tracker.
        let mut source = ReplaySource::new(self.cfg.source.path.clone());
        {
            let tracker = Arc::clone(&tracker);
            source.on_event(Box::new(move |event| {
                tracker.ingest(&event);
            }));
        }
        {
            let health = Arc::clone(&self.health);
            source.on_error(Box::new(move |err| {
                health.record_source_error(&err);
                if err.downcast_ref::<ParseError>().is_some() {
                    debug!(error = %err, "dropped undecodable event");
                } else {
                    warn!(error = %err, "event source error");
                }
            }));
        }
        source
            .start(self.cancel.child_token())
            .await
            .context("starting event source")?;
        self.source = Some(source);

        self.tracker = Some(Arc::clone(&tracker));
        self.spawn_stats_reporter(tracker);

        info!("agent fully started");
        Ok(())
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        // Signal all background tasks to stop.
        self.cancel.cancel();

        if let Some(sweeper) = &self.sweeper {
            sweeper.stop();
        }

        if let Some(source) = &mut self.source {
            if let Err(e) = source.stop().await {
                error!(error = %e, "error stopping event source");
            }
        }

        // Release a reader blocked on an empty queue, then wait for the drain.
        if let Some(tracker) = &self.tracker {
            tracker.close();
        }
        if let Some(sink) = &mut self.sink {
            if let Err(e) = sink.stop().await {
                error!(error = %e, sink = sink.name(), "error stopping sink");
            }
        }

        if let Some(tracker) = &self.tracker {
            publish_stats(&self.health, tracker);
        }

        self.health.stop().await?;

        Ok(())
    }

    /// Spawn background tracker stats reporter.
    fn spawn_stats_reporter(&self, tracker: Arc<FlowTracker>) {
        let cancel = self.cancel.clone();
        let health = Arc::clone(&self.health);
        let period = self.cfg.stats_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => publish_stats(&health, &tracker),
                }
            }
        });
    }
}

/// Moves the tracker's counter deltas and occupancy into the exported metrics.
fn publish_stats(health: &HealthMetrics, tracker: &FlowTracker) {
    let snapshot = tracker.stats().snapshot();
    let occupancy = tracker.occupancy();
    health.publish_stats(&snapshot);
    health.publish_occupancy(&occupancy);

    let total: u64 = snapshot.iter().map(|(_, n)| n).sum();
    if total == 0 {
        return;
    }

    info!(
        active = occupancy.active,
        finished = occupancy.finished,
        free = occupancy.free,
        "tracker stats",
    );
    for (kind, count) in &snapshot {
        debug!(kind = kind.as_str(), count, "  by kind");
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("started", &self.tracker.is_some())
            .finish_non_exhaustive()
    }
}
