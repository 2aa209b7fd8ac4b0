//! Connection table: pool, index, finished queue and the tracker service
//! that serializes access to them.

pub mod histogram;
pub mod index;
pub mod pool;
pub mod record;
pub mod stats;
pub mod table;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{DrainMode, TrackerConfig};
use crate::drain::Reader;
use crate::source::event::FlowEvent;

use histogram::HistogramLayout;
use record::{FlowIdentity, FlowSnapshot};
use stats::{StatKind, TrackerStats};
use table::{FlowTable, IngestOutcome, Occupancy};

/// Largest accepted pool capacity after rounding.
pub const MAX_CAPACITY: usize = 1 << 24;

/// Tracker construction failures.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("capacity must be greater than zero")]
    ZeroCapacity,

    #[error("capacity {requested} exceeds maximum {max}")]
    CapacityTooLarge { requested: usize, max: usize },

    #[error("histogram bucket count must be greater than zero")]
    ZeroHistogramBuckets,

    #[error("histogram bucket width must be greater than zero")]
    ZeroBucketWidth,

    #[error("index bucket count must be greater than zero")]
    ZeroIndexBuckets,

    #[error("failed to reserve {len} entries for {what}")]
    Allocation { what: &'static str, len: usize },
}

/// Shared flow tracker.
///
/// Producers call [`FlowTracker::ingest`] from any thread, the sweeper calls
/// [`FlowTracker::prune`], and consumers pull records through a [`Reader`].
/// A single lock guards the table; producers never wait inside it.
pub struct FlowTracker {
    table: Mutex<FlowTable>,
    ready: Condvar,
    mode: DrainMode,
    clock: Arc<dyn Clock>,
    stats: TrackerStats,
    closed: AtomicBool,
    /// Set on the first dropped SYN of an exhaustion episode.
    exhausted: AtomicBool,
}

impl FlowTracker {
    /// Allocates every slot, histogram and index bucket up front.
    pub fn new(cfg: &TrackerConfig, clock: Arc<dyn Clock>) -> Result<Self, TrackerError> {
        if cfg.capacity == 0 {
            return Err(TrackerError::ZeroCapacity);
        }
        let capacity = cfg
            .capacity
            .checked_next_power_of_two()
            .filter(|c| *c <= MAX_CAPACITY)
            .ok_or(TrackerError::CapacityTooLarge {
                requested: cfg.capacity,
                max: MAX_CAPACITY,
            })?;

        let layout = HistogramLayout::new(cfg.histogram.buckets, cfg.histogram.bucket_width)?;
        let index_buckets = cfg.index_buckets.unwrap_or(capacity);
        let table = FlowTable::new(capacity, index_buckets, layout, cfg.port, clock.now())?;

        info!(
            capacity,
            requested = cfg.capacity,
            index_buckets,
            port = cfg.port,
            mode = %cfg.mode,
            histogram_buckets = layout.buckets(),
            bucket_width = layout.width(),
            "flow tracker initialized",
        );

        Ok(Self {
            table: Mutex::new(table),
            ready: Condvar::new(),
            mode: cfg.mode,
            clock,
            stats: TrackerStats::new(),
            closed: AtomicBool::new(false),
            exhausted: AtomicBool::new(false),
        })
    }

    /// Applies one event. Never blocks beyond the table lock.
    pub fn ingest(&self, event: &FlowEvent) -> IngestOutcome {
        let now = self.clock.now();
        let outcome = self.table.lock().ingest(event, now);
        self.stats.record_ingest(&outcome);

        match outcome {
            IngestOutcome::PoolExhausted => {
                if !self.exhausted.swap(true, Ordering::Relaxed) {
                    warn!(flow = %event.identity, "flow pool exhausted, dropping new flows");
                }
            }
            IngestOutcome::Tracked { created, finished } => {
                if created && self.exhausted.swap(false, Ordering::Relaxed) {
                    debug!("flow pool has free slots again");
                }
                if finished.is_some() || self.mode == DrainMode::Live {
                    self.ready.notify_all();
                }
            }
            IngestOutcome::Filtered | IngestOutcome::Untracked => {}
        }

        outcome
    }

    /// Finishes every flow idle for longer than `idle_timeout`.
    pub fn prune(&self, idle_timeout: Duration) -> usize {
        let now = self.clock.now();
        let pruned = self.table.lock().prune(now, idle_timeout);
        if pruned > 0 {
            self.stats.record_n(StatKind::FinishedIdle, pruned as u64);
            self.ready.notify_all();
        }
        pruned
    }

    /// Opens a drain session. Record times are reported relative to the
    /// moment the session was opened.
    pub fn open_reader(self: &Arc<Self>) -> Reader {
        let now = self.clock.now();
        self.table.lock().reset_start(now);
        Reader::new(Arc::clone(self))
    }

    /// Wakes every blocked reader with an interrupted outcome.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.wake_readers();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Nudges blocked readers to re-check their wait condition.
    pub fn wake_readers(&self) {
        let _guard = self.table.lock();
        self.ready.notify_all();
    }

    pub fn occupancy(&self) -> Occupancy {
        self.table.lock().occupancy()
    }

    /// Copy of the active record for `identity` in either orientation.
    pub fn lookup(&self, identity: &FlowIdentity) -> Option<FlowSnapshot> {
        self.table.lock().lookup(identity)
    }

    pub fn stats(&self) -> &TrackerStats {
        &self.stats
    }

    pub fn mode(&self) -> DrainMode {
        self.mode
    }

    pub fn capacity(&self) -> usize {
        self.occupancy().capacity
    }

    pub fn histogram_layout(&self) -> HistogramLayout {
        *self.table.lock().layout()
    }

    pub(crate) fn now(&self) -> Duration {
        self.clock.now()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, FlowTable> {
        self.table.lock()
    }

    /// Releases the lock while waiting for a wakeup or `timeout`.
    pub(crate) fn wait_for(&self, guard: &mut MutexGuard<'_, FlowTable>, timeout: Duration) {
        // Timeouts and spurious wakeups are both handled by the caller's re-check.
        let _ = self.ready.wait_for(guard, timeout);
    }
}

impl std::fmt::Debug for FlowTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowTracker")
            .field("mode", &self.mode)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
