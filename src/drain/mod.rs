//! Pull-style consumer side of the tracker.

pub mod format;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::MutexGuard;
use tokio_util::sync::CancellationToken;

use crate::config::DrainMode;
use crate::flow::table::FlowTable;
use crate::flow::FlowTracker;

use format::RecordView;

/// Upper bound on a single condvar wait, so cancellation is noticed promptly.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Result of one drain call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// That many bytes of whole records were written.
    Record(usize),
    /// Nothing to report right now.
    NoData,
    /// The next record needs `needed` bytes. Nothing was consumed.
    BufferTooSmall { needed: usize },
    /// The wait was cancelled or the tracker closed.
    Interrupted,
}

/// A drain session over a [`FlowTracker`].
///
/// Finished records are consumed exactly once across all readers. In live
/// mode, active records are reported whenever they changed since their last
/// report.
pub struct Reader {
    tracker: Arc<FlowTracker>,
    /// Tracker generation at the last scan that found nothing to report.
    seen_generation: u64,
}

impl Reader {
    pub(crate) fn new(tracker: Arc<FlowTracker>) -> Self {
        Self {
            tracker,
            seen_generation: 0,
        }
    }

    pub fn tracker(&self) -> &Arc<FlowTracker> {
        &self.tracker
    }

    /// Writes the next record into `buf`, blocking until one is available,
    /// `cancel` fires, or the tracker is closed.
    pub fn read(&mut self, buf: &mut [u8], cancel: &CancellationToken) -> ReadOutcome {
        let tracker = Arc::clone(&self.tracker);
        let mut table = tracker.lock();
        self.read_locked(&mut table, buf, cancel)
    }

    /// Non-blocking variant of [`Reader::read`].
    pub fn try_read(&mut self, buf: &mut [u8]) -> ReadOutcome {
        let tracker = Arc::clone(&self.tracker);
        let mut table = tracker.lock();
        self.emit_or_mark(&mut table, buf)
            .unwrap_or(ReadOutcome::NoData)
    }

    /// Fills `buf` with as many whole records as fit.
    ///
    /// Blocks only for the first record. Stops at the first record that does
    /// not fit in the remaining space or when nothing more is pending.
    pub fn read_batch(&mut self, buf: &mut [u8], cancel: &CancellationToken) -> ReadOutcome {
        let tracker = Arc::clone(&self.tracker);
        let mut table = tracker.lock();

        let mut written = match self.read_locked(&mut table, buf, cancel) {
            ReadOutcome::Record(n) => n,
            other => return other,
        };
        while let Some(ReadOutcome::Record(n)) = self.emit_or_mark(&mut table, &mut buf[written..]) {
            written += n;
        }
        ReadOutcome::Record(written)
    }

    fn read_locked(
        &mut self,
        table: &mut MutexGuard<'_, FlowTable>,
        buf: &mut [u8],
        cancel: &CancellationToken,
    ) -> ReadOutcome {
        loop {
            if let Some(outcome) = self.emit_or_mark(table, buf) {
                return outcome;
            }
            while !self.has_news(table) {
                if cancel.is_cancelled() || self.tracker.is_closed() {
                    return ReadOutcome::Interrupted;
                }
                self.tracker.wait_for(table, WAIT_SLICE);
            }
        }
    }

    /// Emits the next pending record, or remembers the current generation
    /// when there is none.
    fn emit_or_mark(&mut self, table: &mut FlowTable, buf: &mut [u8]) -> Option<ReadOutcome> {
        let outcome = self.emit(table, buf);
        if outcome.is_none() {
            self.seen_generation = table.generation();
        }
        outcome
    }

    fn emit(&self, table: &mut FlowTable, buf: &mut [u8]) -> Option<ReadOutcome> {
        let pending = table.next_pending(self.is_live())?;
        let slot = pending.slot();

        let encoded = RecordView::new(
            table.record(slot),
            table.histogram(slot),
            table.start(),
            pending.is_finished(),
        )
        .encode_into(buf);

        Some(match encoded {
            Ok(n) => {
                table.commit(pending, self.tracker.now());
                self.tracker.stats().record_drain(pending);
                ReadOutcome::Record(n)
            }
            Err(needed) => ReadOutcome::BufferTooSmall { needed },
        })
    }

    fn has_news(&self, table: &FlowTable) -> bool {
        table.has_finished() || (self.is_live() && table.generation() > self.seen_generation)
    }

    fn is_live(&self) -> bool {
        self.tracker.mode() == DrainMode::Live
    }
}

impl std::fmt::Debug for Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader")
            .field("seen_generation", &self.seen_generation)
            .finish_non_exhaustive()
    }
}
