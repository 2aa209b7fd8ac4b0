use std::time::Duration;

use crate::source::event::{Direction, FlowEvent};

use super::histogram::HistogramLayout;
use super::index::FlowIndex;
use super::pool::FlowPool;
use super::record::{CongestionState, FlowIdentity, FlowRecord, FlowSnapshot, SlotId, SlotState};
use super::TrackerError;

/// Why a record left the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FinishCause {
    Fin,
    Rst,
    Idle,
}

impl FinishCause {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fin => "fin",
            Self::Rst => "rst",
            Self::Idle => "idle",
        }
    }
}

/// Result of applying one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Neither port matches the configured filter.
    Filtered,
    /// No record for the identity and the event carries no SYN.
    Untracked,
    /// SYN for a new flow while every slot is taken.
    PoolExhausted,
    /// The event was applied to a record.
    Tracked {
        created: bool,
        finished: Option<FinishCause>,
    },
}

/// Record chosen for the next drain, not yet committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pending {
    /// Head of the finished queue.
    Finished(SlotId),
    /// Active record with changes since its last report.
    Live(SlotId),
}

impl Pending {
    pub fn slot(self) -> SlotId {
        match self {
            Self::Finished(slot) | Self::Live(slot) => slot,
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(self, Self::Finished(_))
    }
}

/// Slot accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occupancy {
    pub capacity: usize,
    pub active: usize,
    pub finished: usize,
    pub free: usize,
}

/// All flow state guarded by the tracker lock: pool, index, finished queue,
/// live cursor and update markers.
///
/// Nothing here allocates after construction.
#[derive(Debug)]
pub struct FlowTable {
    pool: FlowPool,
    index: FlowIndex,
    finished_head: Option<SlotId>,
    finished_len: usize,
    live_cursor: usize,
    port_filter: u16,
    /// Bumped once per applied event; drives live-mode change detection.
    generation: u64,
    last_update: Duration,
    start: Duration,
}

impl FlowTable {
    pub fn new(
        capacity: usize,
        index_buckets: usize,
        layout: HistogramLayout,
        port_filter: u16,
        now: Duration,
    ) -> Result<Self, TrackerError> {
        let pool = FlowPool::new(capacity, layout)?;
        let index = FlowIndex::new(index_buckets)?;
        Ok(Self {
            pool,
            index,
            finished_head: None,
            finished_len: 0,
            // The scan starts one past the cursor, so slot 0 is looked at first.
            live_cursor: capacity - 1,
            port_filter,
            generation: 0,
            last_update: now,
            start: now,
        })
    }

    /// Applies one observation event.
    pub fn ingest(&mut self, event: &FlowEvent, now: Duration) -> IngestOutcome {
        if self.port_filter != 0 && !event.identity.has_port(self.port_filter) {
            return IngestOutcome::Filtered;
        }

        let (slot, created) = match self.index.lookup(&self.pool, &event.identity) {
            Some(slot) => (slot, false),
            None if !event.flags.syn() => return IngestOutcome::Untracked,
            None => {
                let Some(slot) = self.pool.allocate() else {
                    return IngestOutcome::PoolExhausted;
                };
                let record = self.pool.get_mut(slot);
                record.identity = event.identity;
                record.first_packet = now;
                self.index.insert(&mut self.pool, slot);
                (slot, true)
            }
        };

        self.generation += 1;
        let generation = self.generation;
        let layout = *self.pool.layout();
        let (record, histogram) = self.pool.entry_mut(slot);

        record.last_packet = now;
        record.updated_gen = generation;
        apply_counters(record, event);

        if let Some(sample) = event.congestion {
            record.congestion = CongestionState {
                cwnd: sample.cwnd,
                cwnd_clamp: sample.cwnd_clamp,
                ssthresh: sample.ssthresh,
                srtt: sample.srtt,
            };
            record.samples = record.samples.saturating_add(1);
            layout.record(histogram, sample.cwnd);
        }

        let finished = if event.flags.rst() {
            Some(FinishCause::Rst)
        } else if event.flags.fin() {
            Some(FinishCause::Fin)
        } else {
            None
        };
        if finished.is_some() {
            self.index.remove(&mut self.pool, slot);
            self.push_finished(slot);
        }

        self.last_update = now;
        IngestOutcome::Tracked { created, finished }
    }

    /// Moves every record idle for longer than `idle_timeout` to the finished
    /// queue. Returns how many were moved.
    pub fn prune(&mut self, now: Duration, idle_timeout: Duration) -> usize {
        let mut pruned = 0;
        for bucket in 0..self.index.bucket_count() {
            let mut cursor = self.index.head(bucket);
            while let Some(slot) = cursor {
                let record = self.pool.get(slot);
                cursor = record.chain_next;
                if now.saturating_sub(record.last_packet) > idle_timeout {
                    self.index.remove(&mut self.pool, slot);
                    self.push_finished(slot);
                    pruned += 1;
                }
            }
        }
        pruned
    }

    /// Picks the next record to report without changing any state.
    ///
    /// Finished records always win. In live mode, active records with
    /// unreported changes are scanned round-robin from the persisted cursor.
    pub fn next_pending(&self, live: bool) -> Option<Pending> {
        if let Some(slot) = self.finished_head {
            return Some(Pending::Finished(slot));
        }
        if !live {
            return None;
        }

        let capacity = self.pool.capacity();
        (1..=capacity)
            .map(|step| SlotId::new((self.live_cursor + step) % capacity))
            .find(|&slot| {
                let record = self.pool.get(slot);
                record.state == SlotState::Active && record.has_unreported_changes()
            })
            .map(Pending::Live)
    }

    /// Completes a report chosen by [`FlowTable::next_pending`].
    ///
    /// Finished records are unlinked and recycled; live records stay in place
    /// and only have their report marker advanced.
    pub fn commit(&mut self, pending: Pending, now: Duration) {
        match pending {
            Pending::Finished(slot) => {
                debug_assert_eq!(self.finished_head, Some(slot), "commit out of order");
                let record = self.pool.get_mut(slot);
                self.finished_head = record.link.take();
                self.finished_len -= 1;
                self.pool.release(slot);
            }
            Pending::Live(slot) => {
                let record = self.pool.get_mut(slot);
                record.reported_gen = record.updated_gen;
                record.last_reported = now;
                self.live_cursor = slot.index();
            }
        }
    }

    /// LIFO push onto the finished queue.
    fn push_finished(&mut self, slot: SlotId) {
        let record = self.pool.get_mut(slot);
        record.state = SlotState::Finished;
        record.link = self.finished_head;
        self.finished_head = Some(slot);
        self.finished_len += 1;
    }

    pub fn record(&self, slot: SlotId) -> &FlowRecord {
        self.pool.get(slot)
    }

    pub fn histogram(&self, slot: SlotId) -> &[u32] {
        self.pool.histogram(slot)
    }

    /// Copy of the active record for `identity`, if any.
    pub fn lookup(&self, identity: &FlowIdentity) -> Option<FlowSnapshot> {
        let slot = self.index.lookup(&self.pool, identity)?;
        Some(FlowSnapshot::capture(
            self.pool.get(slot),
            self.pool.histogram(slot),
        ))
    }

    pub fn occupancy(&self) -> Occupancy {
        let capacity = self.pool.capacity();
        let in_use = self.pool.in_use();
        Occupancy {
            capacity,
            active: in_use - self.finished_len,
            finished: self.finished_len,
            free: capacity - in_use,
        }
    }

    pub fn has_finished(&self) -> bool {
        self.finished_head.is_some()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn last_update(&self) -> Duration {
        self.last_update
    }

    pub fn start(&self) -> Duration {
        self.start
    }

    /// Restarts the reporting epoch used for "time since start".
    pub fn reset_start(&mut self, now: Duration) {
        self.start = now;
    }

    pub fn layout(&self) -> &HistogramLayout {
        self.pool.layout()
    }
}

fn apply_counters(record: &mut FlowRecord, event: &FlowEvent) {
    let counters = &mut record.counters;
    match event.direction {
        Direction::Receive => {
            counters.recv_packets = counters.recv_packets.saturating_add(1);
            counters.recv_bytes = counters.recv_bytes.saturating_add(u64::from(event.len));
            if event.seq < counters.last_recv_seq {
                counters.out_of_order = counters.out_of_order.saturating_add(1);
            } else {
                counters.last_recv_seq = event.seq;
            }
        }
        Direction::Transmit => {
            counters.snd_packets = counters.snd_packets.saturating_add(1);
            counters.snd_bytes = counters.snd_bytes.saturating_add(u64::from(event.len));
            counters.retransmits = event.retransmits;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::source::event::{CongestionSample, TcpFlags};

    const T0: Duration = Duration::from_secs(100);

    fn table(capacity: usize) -> FlowTable {
        let layout = HistogramLayout::new(10, 1).expect("valid layout");
        FlowTable::new(capacity, capacity, layout, 0, T0).expect("table allocates")
    }

    fn ident(n: u16) -> FlowIdentity {
        FlowIdentity::new(
            Ipv4Addr::new(10, 0, 0, 1),
            40_000 + n,
            Ipv4Addr::new(10, 0, 0, 2),
            80,
        )
    }

    fn cwnd(cwnd: u32) -> CongestionSample {
        CongestionSample {
            cwnd,
            cwnd_clamp: 1_000,
            ssthresh: 64,
            srtt: 200,
        }
    }

    fn drain_all(t: &mut FlowTable, live: bool) -> Vec<Pending> {
        let mut out = Vec::new();
        while let Some(p) = t.next_pending(live) {
            t.commit(p, T0);
            out.push(p);
        }
        out
    }

    #[test]
    fn test_non_syn_for_unknown_flow_is_ignored() {
        let mut t = table(4);
        let out = t.ingest(&FlowEvent::receive(ident(1), TcpFlags::NONE), T0);
        assert_eq!(out, IngestOutcome::Untracked);
        assert_eq!(t.occupancy().active, 0);
        assert_eq!(t.generation(), 0);
    }

    #[test]
    fn test_syn_creates_record() {
        let mut t = table(4);
        let out = t.ingest(&FlowEvent::receive(ident(1), TcpFlags::SYN).with_len(60), T0);
        assert_eq!(
            out,
            IngestOutcome::Tracked {
                created: true,
                finished: None
            }
        );

        let snap = t.lookup(&ident(1)).expect("flow indexed");
        assert_eq!(snap.identity, ident(1));
        assert_eq!(snap.first_packet, T0);
        assert_eq!(snap.counters.recv_packets, 1);
        assert_eq!(snap.counters.recv_bytes, 60);
        assert_eq!(snap.histogram, vec![0; 10]);
    }

    #[test]
    fn test_reverse_direction_updates_same_record() {
        let mut t = table(4);
        t.ingest(&FlowEvent::transmit(ident(1), TcpFlags::SYN), T0);
        let out = t.ingest(
            &FlowEvent::receive(ident(1).reversed(), TcpFlags::SYN).with_len(10),
            T0,
        );
        assert_eq!(
            out,
            IngestOutcome::Tracked {
                created: false,
                finished: None
            }
        );

        let snap = t.lookup(&ident(1)).expect("flow indexed");
        // Stored identity is the creating orientation.
        assert_eq!(snap.identity, ident(1));
        assert_eq!(snap.counters.snd_packets, 1);
        assert_eq!(snap.counters.recv_packets, 1);
        assert_eq!(t.occupancy().active, 1);
    }

    #[test]
    fn test_out_of_order_detection() {
        let mut t = table(4);
        let id = ident(1);
        t.ingest(&FlowEvent::receive(id, TcpFlags::SYN).with_seq(1000), T0);
        t.ingest(&FlowEvent::receive(id, TcpFlags::NONE).with_seq(2000), T0);
        t.ingest(&FlowEvent::receive(id, TcpFlags::NONE).with_seq(1500), T0);
        t.ingest(&FlowEvent::receive(id, TcpFlags::NONE).with_seq(2000), T0);
        t.ingest(&FlowEvent::receive(id, TcpFlags::NONE).with_seq(1999), T0);

        let snap = t.lookup(&id).expect("flow indexed");
        assert_eq!(snap.counters.out_of_order, 2);
        assert_eq!(snap.counters.last_recv_seq, 2000);
    }

    #[test]
    fn test_transmit_overwrites_retransmits() {
        let mut t = table(4);
        let id = ident(1);
        t.ingest(&FlowEvent::transmit(id, TcpFlags::SYN).with_retransmits(2), T0);
        t.ingest(&FlowEvent::transmit(id, TcpFlags::NONE).with_retransmits(5), T0);
        // Receive path never touches the retransmission total.
        t.ingest(&FlowEvent::receive(id, TcpFlags::NONE).with_retransmits(99), T0);

        let snap = t.lookup(&id).expect("flow indexed");
        assert_eq!(snap.counters.retransmits, 5);
        assert_eq!(snap.counters.snd_packets, 2);
    }

    #[test]
    fn test_histogram_counts_only_established_samples() {
        let mut t = table(4);
        let id = ident(1);
        t.ingest(&FlowEvent::receive(id, TcpFlags::SYN), T0);
        t.ingest(&FlowEvent::transmit(id, TcpFlags::NONE), T0);
        t.ingest(&FlowEvent::receive(id, TcpFlags::NONE).established(cwnd(3)), T0);
        t.ingest(&FlowEvent::transmit(id, TcpFlags::NONE).established(cwnd(3)), T0);
        t.ingest(&FlowEvent::transmit(id, TcpFlags::NONE).established(cwnd(50)), T0);

        let snap = t.lookup(&id).expect("flow indexed");
        assert_eq!(snap.samples, 3);
        assert_eq!(snap.histogram.iter().sum::<u32>(), 3);
        assert_eq!(snap.histogram[3], 2);
        assert_eq!(snap.histogram[9], 1);
        assert_eq!(snap.congestion.cwnd, 50);
        assert_eq!(snap.congestion.srtt, 200);
        assert_eq!(snap.counters.recv_packets + snap.counters.snd_packets, 5);
    }

    #[test]
    fn test_fin_moves_record_to_finished_queue() {
        let mut t = table(4);
        let id = ident(1);
        t.ingest(&FlowEvent::receive(id, TcpFlags::SYN), T0);
        let out = t.ingest(&FlowEvent::receive(id, TcpFlags::FIN), T0);
        assert_eq!(
            out,
            IngestOutcome::Tracked {
                created: false,
                finished: Some(FinishCause::Fin)
            }
        );

        assert!(t.lookup(&id).is_none());
        assert!(t.has_finished());
        let occ = t.occupancy();
        assert_eq!((occ.active, occ.finished, occ.free), (0, 1, 3));
    }

    #[test]
    fn test_rst_takes_precedence_over_fin() {
        let mut t = table(4);
        let id = ident(1);
        t.ingest(&FlowEvent::receive(id, TcpFlags::SYN), T0);
        let out = t.ingest(&FlowEvent::transmit(id, TcpFlags::FIN | TcpFlags::RST), T0);
        assert_eq!(
            out,
            IngestOutcome::Tracked {
                created: false,
                finished: Some(FinishCause::Rst)
            }
        );
    }

    #[test]
    fn test_transmit_syn_does_not_finish() {
        let mut t = table(4);
        let id = ident(1);
        t.ingest(&FlowEvent::transmit(id, TcpFlags::SYN), T0);
        t.ingest(&FlowEvent::transmit(id, TcpFlags::SYN), T0);
        assert!(!t.has_finished());
        assert!(t.lookup(&id).is_some());
    }

    #[test]
    fn test_new_syn_after_finish_creates_fresh_record() {
        let mut t = table(4);
        let id = ident(1);
        t.ingest(&FlowEvent::receive(id, TcpFlags::SYN), T0);
        t.ingest(&FlowEvent::receive(id, TcpFlags::FIN), T0);
        let out = t.ingest(&FlowEvent::receive(id, TcpFlags::SYN), T0);
        assert_eq!(
            out,
            IngestOutcome::Tracked {
                created: true,
                finished: None
            }
        );
        let occ = t.occupancy();
        assert_eq!((occ.active, occ.finished), (1, 1));
    }

    #[test]
    fn test_pool_exhaustion_drops_new_flows() {
        let mut t = table(4);
        for n in 0..4 {
            t.ingest(&FlowEvent::receive(ident(n), TcpFlags::SYN), T0);
        }
        let out = t.ingest(&FlowEvent::receive(ident(4), TcpFlags::SYN), T0);
        assert_eq!(out, IngestOutcome::PoolExhausted);
        assert!(t.lookup(&ident(4)).is_none());
        assert_eq!(t.occupancy().free, 0);

        // Existing flows still update.
        let out = t.ingest(&FlowEvent::receive(ident(0), TcpFlags::NONE), T0);
        assert!(matches!(out, IngestOutcome::Tracked { .. }));
    }

    #[test]
    fn test_port_filter() {
        let layout = HistogramLayout::new(1, 1).expect("valid layout");
        let mut t = FlowTable::new(4, 4, layout, 443, T0).expect("table allocates");

        let out = t.ingest(&FlowEvent::receive(ident(1), TcpFlags::SYN), T0);
        assert_eq!(out, IngestOutcome::Filtered);

        let https = FlowIdentity::new(Ipv4Addr::new(1, 1, 1, 1), 443, Ipv4Addr::new(2, 2, 2, 2), 5000);
        let out = t.ingest(&FlowEvent::receive(https, TcpFlags::SYN), T0);
        assert!(matches!(out, IngestOutcome::Tracked { created: true, .. }));

        let out = t.ingest(&FlowEvent::receive(https.reversed(), TcpFlags::NONE), T0);
        assert!(matches!(out, IngestOutcome::Tracked { created: false, .. }));
    }

    #[test]
    fn test_finished_queue_is_lifo() {
        let mut t = table(4);
        for n in 0..3 {
            t.ingest(&FlowEvent::receive(ident(n), TcpFlags::SYN), T0);
        }
        for n in 0..3 {
            t.ingest(&FlowEvent::receive(ident(n), TcpFlags::FIN), T0);
        }

        let order: Vec<FlowIdentity> = std::iter::from_fn(|| {
            let p = t.next_pending(false)?;
            let id = *t.record(p.slot()).identity();
            t.commit(p, T0);
            Some(id)
        })
        .collect();
        assert_eq!(order, vec![ident(2), ident(1), ident(0)]);
        assert_eq!(t.occupancy().free, 4);
    }

    #[test]
    fn test_batch_mode_ignores_active_records() {
        let mut t = table(4);
        t.ingest(&FlowEvent::receive(ident(1), TcpFlags::SYN), T0);
        assert_eq!(t.next_pending(false), None);
        assert!(matches!(t.next_pending(true), Some(Pending::Live(_))));
    }

    #[test]
    fn test_next_pending_has_no_side_effects() {
        let mut t = table(4);
        t.ingest(&FlowEvent::receive(ident(1), TcpFlags::SYN), T0);
        t.ingest(&FlowEvent::receive(ident(1), TcpFlags::FIN), T0);

        let first = t.next_pending(false);
        let second = t.next_pending(false);
        assert_eq!(first, second);
        assert_eq!(t.occupancy().finished, 1);
    }

    #[test]
    fn test_live_reports_once_per_change() {
        let mut t = table(4);
        let id = ident(1);
        t.ingest(&FlowEvent::receive(id, TcpFlags::SYN), T0);
        t.ingest(&FlowEvent::receive(id, TcpFlags::NONE), T0);

        let reported = drain_all(&mut t, true);
        assert_eq!(reported.len(), 1);
        assert!(!reported[0].is_finished());
        assert_eq!(t.next_pending(true), None);

        t.ingest(&FlowEvent::receive(id, TcpFlags::NONE), T0);
        assert_eq!(drain_all(&mut t, true).len(), 1);
        // Live reports never release the slot.
        assert_eq!(t.occupancy().active, 1);
    }

    #[test]
    fn test_live_scan_is_round_robin() {
        let mut t = table(4);
        for n in 0..3 {
            t.ingest(&FlowEvent::receive(ident(n), TcpFlags::SYN), T0);
        }
        let slots: Vec<usize> = drain_all(&mut t, true)
            .into_iter()
            .map(|p| p.slot().index())
            .collect();
        assert_eq!(slots.len(), 3);

        // Touch every flow again; the scan resumes after the last reported
        // slot rather than restarting at zero.
        for n in 0..3 {
            t.ingest(&FlowEvent::receive(ident(n), TcpFlags::NONE), T0);
        }
        let next = t.next_pending(true).expect("pending change");
        let last = *slots.last().expect("reported at least one");
        assert_ne!(next.slot().index(), last);
    }

    #[test]
    fn test_finished_records_win_over_live() {
        let mut t = table(4);
        t.ingest(&FlowEvent::receive(ident(1), TcpFlags::SYN), T0);
        t.ingest(&FlowEvent::receive(ident(2), TcpFlags::SYN), T0);
        t.ingest(&FlowEvent::receive(ident(2), TcpFlags::FIN), T0);

        assert!(matches!(t.next_pending(true), Some(Pending::Finished(_))));
    }

    #[test]
    fn test_prune_moves_idle_records() {
        let mut t = table(4);
        let idle = Duration::from_secs(120);
        t.ingest(&FlowEvent::receive(ident(1), TcpFlags::SYN), T0);
        t.ingest(&FlowEvent::receive(ident(2), TcpFlags::SYN), T0 + Duration::from_secs(100));

        // Exactly at the threshold is not yet idle.
        assert_eq!(t.prune(T0 + idle, idle), 0);

        assert_eq!(t.prune(T0 + idle + Duration::from_secs(1), idle), 1);
        assert!(t.lookup(&ident(1)).is_none());
        assert!(t.lookup(&ident(2)).is_some());

        let drained = drain_all(&mut t, false);
        assert_eq!(drained.len(), 1);
        assert_eq!(t.occupancy().free, 3);
    }

    #[test]
    fn test_prune_handles_shared_chain() {
        let layout = HistogramLayout::new(1, 1).expect("valid layout");
        let mut t = FlowTable::new(8, 1, layout, 0, T0).expect("table allocates");
        for n in 0..5 {
            t.ingest(&FlowEvent::receive(ident(n), TcpFlags::SYN), T0);
        }
        let later = T0 + Duration::from_secs(500);
        t.ingest(&FlowEvent::receive(ident(2), TcpFlags::NONE), later);

        assert_eq!(t.prune(later, Duration::from_secs(120)), 4);
        assert!(t.lookup(&ident(2)).is_some());
        assert_eq!(t.occupancy().finished, 4);
    }

    #[test]
    fn test_occupancy_never_exceeds_capacity() {
        let mut t = table(4);
        for round in 0..3u16 {
            for n in 0..6 {
                t.ingest(&FlowEvent::receive(ident(round * 10 + n), TcpFlags::SYN), T0);
                let occ = t.occupancy();
                assert!(occ.active + occ.finished <= occ.capacity);
                assert_eq!(occ.active + occ.finished + occ.free, occ.capacity);
            }
            for n in 0..6 {
                t.ingest(&FlowEvent::receive(ident(round * 10 + n), TcpFlags::RST), T0);
            }
            drain_all(&mut t, false);
        }
        assert_eq!(t.occupancy().free, 4);
    }
}
