use std::sync::atomic::{AtomicU64, Ordering};

use super::table::{FinishCause, IngestOutcome, Pending};

/// Counted tracker occurrences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StatKind {
    EventsReceived = 0,
    EventsFiltered = 1,
    EventsUntracked = 2,
    PoolExhausted = 3,
    FlowsCreated = 4,
    FinishedFin = 5,
    FinishedRst = 6,
    FinishedIdle = 7,
    DrainedFinished = 8,
    DrainedLive = 9,
}

const STAT_KINDS: usize = 10;

impl StatKind {
    const ALL: [StatKind; STAT_KINDS] = [
        Self::EventsReceived,
        Self::EventsFiltered,
        Self::EventsUntracked,
        Self::PoolExhausted,
        Self::FlowsCreated,
        Self::FinishedFin,
        Self::FinishedRst,
        Self::FinishedIdle,
        Self::DrainedFinished,
        Self::DrainedLive,
    ];

    pub fn from_u8(v: u8) -> Option<Self> {
        Self::ALL.get(v as usize).copied()
    }

    pub const fn finished(cause: FinishCause) -> Self {
        match cause {
            FinishCause::Fin => Self::FinishedFin,
            FinishCause::Rst => Self::FinishedRst,
            FinishCause::Idle => Self::FinishedIdle,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EventsReceived => "events_received",
            Self::EventsFiltered => "events_filtered",
            Self::EventsUntracked => "events_untracked",
            Self::PoolExhausted => "pool_exhausted",
            Self::FlowsCreated => "flows_created",
            Self::FinishedFin => "finished_fin",
            Self::FinishedRst => "finished_rst",
            Self::FinishedIdle => "finished_idle",
            Self::DrainedFinished => "drained_finished",
            Self::DrainedLive => "drained_live",
        }
    }
}

/// Lock-free tracker counters.
///
/// `snapshot()` reads and resets every counter, so periodic publishers see
/// deltas.
pub struct TrackerStats {
    counts: [AtomicU64; STAT_KINDS],
}

impl TrackerStats {
    pub fn new() -> Self {
        Self {
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    pub fn record(&self, kind: StatKind) {
        self.record_n(kind, 1);
    }

    pub fn record_n(&self, kind: StatKind, n: u64) {
        if let Some(counter) = self.counts.get(kind as usize) {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Counts one ingest result.
    pub fn record_ingest(&self, outcome: &IngestOutcome) {
        self.record(StatKind::EventsReceived);
        match *outcome {
            IngestOutcome::Filtered => self.record(StatKind::EventsFiltered),
            IngestOutcome::Untracked => self.record(StatKind::EventsUntracked),
            IngestOutcome::PoolExhausted => self.record(StatKind::PoolExhausted),
            IngestOutcome::Tracked { created, finished } => {
                if created {
                    self.record(StatKind::FlowsCreated);
                }
                if let Some(cause) = finished {
                    self.record(StatKind::finished(cause));
                }
            }
        }
    }

    pub fn record_drain(&self, pending: Pending) {
        self.record(if pending.is_finished() {
            StatKind::DrainedFinished
        } else {
            StatKind::DrainedLive
        });
    }

    /// Atomically read and reset all counters, returning only non-zero entries.
    pub fn snapshot(&self) -> Vec<(StatKind, u64)> {
        self.counts
            .iter()
            .enumerate()
            .filter_map(|(i, counter)| {
                let v = counter.swap(0, Ordering::Relaxed);
                if v == 0 {
                    return None;
                }
                StatKind::from_u8(i as u8).map(|kind| (kind, v))
            })
            .collect()
    }
}

impl Default for TrackerStats {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TrackerStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackerStats").finish_non_exhaustive()
    }
}
