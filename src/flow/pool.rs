use super::histogram::HistogramLayout;
use super::record::{FlowRecord, SlotId, SlotState};
use super::TrackerError;

/// Fixed-capacity arena of flow records with an intrusive free list.
///
/// All storage, including every record's histogram counts, is reserved in
/// [`FlowPool::new`]. Allocation and release afterwards only relink slots.
pub struct FlowPool {
    records: Box<[FlowRecord]>,
    /// `capacity * layout.buckets()` counters, one contiguous run per slot.
    histograms: Box<[u32]>,
    layout: HistogramLayout,
    free_head: Option<SlotId>,
    in_use: usize,
}

impl FlowPool {
    /// Reserves `capacity` slots. Reservation failures are reported instead
    /// of aborting the process.
    pub fn new(capacity: usize, layout: HistogramLayout) -> Result<Self, TrackerError> {
        if capacity == 0 {
            return Err(TrackerError::ZeroCapacity);
        }

        let mut records = Vec::new();
        records
            .try_reserve_exact(capacity)
            .map_err(|_| TrackerError::Allocation {
                what: "flow records",
                len: capacity,
            })?;
        for i in 0..capacity {
            records.push(FlowRecord {
                link: (i + 1 < capacity).then(|| SlotId::new(i + 1)),
                ..FlowRecord::default()
            });
        }

        let counters = capacity
            .checked_mul(layout.buckets())
            .ok_or(TrackerError::Allocation {
                what: "histogram arena",
                len: usize::MAX,
            })?;
        let mut histograms = Vec::new();
        histograms
            .try_reserve_exact(counters)
            .map_err(|_| TrackerError::Allocation {
                what: "histogram arena",
                len: counters,
            })?;
        histograms.resize(counters, 0);

        Ok(Self {
            records: records.into_boxed_slice(),
            histograms: histograms.into_boxed_slice(),
            layout,
            free_head: Some(SlotId::new(0)),
            in_use: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.records.len()
    }

    /// Number of slots not on the free list.
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    pub fn layout(&self) -> &HistogramLayout {
        &self.layout
    }

    /// Pops the free-list head. Returns `None` when the pool is exhausted.
    pub fn allocate(&mut self) -> Option<SlotId> {
        let slot = self.free_head?;
        let record = &mut self.records[slot.index()];
        self.free_head = record.link.take();
        record.state = SlotState::Active;
        self.in_use += 1;
        Some(slot)
    }

    /// Zeroes a record and its histogram and pushes it onto the free list.
    pub fn release(&mut self, slot: SlotId) {
        let buckets = self.layout.buckets();
        let start = slot.index() * buckets;
        if let Some(counts) = self.histograms.get_mut(start..start + buckets) {
            counts.fill(0);
        }

        let record = &mut self.records[slot.index()];
        debug_assert_ne!(record.state, SlotState::Free, "double release of {slot:?}");
        record.link = self.free_head;
        record.reset();
        self.free_head = Some(slot);
        self.in_use -= 1;
    }

    pub fn get(&self, slot: SlotId) -> &FlowRecord {
        &self.records[slot.index()]
    }

    pub fn get_mut(&mut self, slot: SlotId) -> &mut FlowRecord {
        &mut self.records[slot.index()]
    }

    /// Histogram counts belonging to `slot`.
    pub fn histogram(&self, slot: SlotId) -> &[u32] {
        let buckets = self.layout.buckets();
        let start = slot.index() * buckets;
        &self.histograms[start..start + buckets]
    }

    /// Record and histogram of `slot`, borrowed together.
    pub fn entry_mut(&mut self, slot: SlotId) -> (&mut FlowRecord, &mut [u32]) {
        let buckets = self.layout.buckets();
        let start = slot.index() * buckets;
        (
            &mut self.records[slot.index()],
            &mut self.histograms[start..start + buckets],
        )
    }

    /// Iterates over every slot in arena order.
    pub fn slots(&self) -> impl Iterator<Item = (SlotId, &FlowRecord)> {
        self.records
            .iter()
            .enumerate()
            .map(|(i, r)| (SlotId::new(i), r))
    }
}

impl std::fmt::Debug for FlowPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowPool")
            .field("capacity", &self.capacity())
            .field("in_use", &self.in_use)
            .field("layout", &self.layout)
            .finish()
    }
}
