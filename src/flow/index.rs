use super::pool::FlowPool;
use super::record::{FlowIdentity, SlotId};
use super::TrackerError;

/// Head and tail of one collision chain. The chain links themselves live in
/// the records (`chain_prev` / `chain_next`).
#[derive(Debug, Clone, Copy, Default)]
struct BucketEntry {
    head: Option<SlotId>,
    tail: Option<SlotId>,
}

/// Hash table from connection identity to the active record for it.
///
/// The hash is deliberately coarse: the high address bytes plus both ports.
/// It is symmetric, so both orientations of a flow land in the same bucket.
pub struct FlowIndex {
    buckets: Box<[BucketEntry]>,
}

impl FlowIndex {
    /// Creates an index with `buckets` empty chains.
    pub fn new(buckets: usize) -> Result<Self, TrackerError> {
        if buckets == 0 {
            return Err(TrackerError::ZeroIndexBuckets);
        }
        let mut entries = Vec::new();
        entries
            .try_reserve_exact(buckets)
            .map_err(|_| TrackerError::Allocation {
                what: "flow index",
                len: buckets,
            })?;
        entries.resize(buckets, BucketEntry::default());
        Ok(Self {
            buckets: entries.into_boxed_slice(),
        })
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Bucket for an identity.
    #[inline]
    pub fn bucket_of(&self, identity: &FlowIdentity) -> usize {
        let high = |addr: std::net::Ipv4Addr| (u32::from(addr) >> 24) as usize;
        let sum = high(identity.saddr)
            + high(identity.daddr)
            + usize::from(identity.sport)
            + usize::from(identity.dport);
        sum % self.buckets.len()
    }

    /// Returns the first chained record matching `identity` in either
    /// orientation.
    pub fn lookup(&self, pool: &FlowPool, identity: &FlowIdentity) -> Option<SlotId> {
        let mut cursor = self.buckets[self.bucket_of(identity)].head;
        while let Some(slot) = cursor {
            let record = pool.get(slot);
            if record.identity.matches(identity) {
                return Some(slot);
            }
            cursor = record.chain_next;
        }
        None
    }

    /// Appends `slot` to the tail of the chain for its stored identity.
    pub fn insert(&mut self, pool: &mut FlowPool, slot: SlotId) {
        let bucket = self.bucket_of(&pool.get(slot).identity);
        let entry = &mut self.buckets[bucket];

        match entry.tail {
            Some(tail) => pool.get_mut(tail).chain_next = Some(slot),
            None => entry.head = Some(slot),
        }

        let record = pool.get_mut(slot);
        record.chain_prev = entry.tail;
        record.chain_next = None;
        entry.tail = Some(slot);
    }

    /// Unlinks `slot` from its chain using the record's own links.
    pub fn remove(&mut self, pool: &mut FlowPool, slot: SlotId) {
        let bucket = self.bucket_of(&pool.get(slot).identity);
        let (prev, next) = {
            let record = pool.get_mut(slot);
            (record.chain_prev.take(), record.chain_next.take())
        };
        let entry = &mut self.buckets[bucket];

        match prev {
            Some(p) => pool.get_mut(p).chain_next = next,
            None => {
                debug_assert_eq!(entry.head, Some(slot), "unlinking a detached record");
                entry.head = next;
            }
        }
        match next {
            Some(n) => pool.get_mut(n).chain_prev = prev,
            None => entry.tail = prev,
        }
    }

    /// First record of a bucket's chain.
    pub fn head(&self, bucket: usize) -> Option<SlotId> {
        self.buckets.get(bucket).and_then(|e| e.head)
    }

    /// Collects the slots chained in `bucket`, head to tail.
    #[cfg(test)]
    pub(crate) fn chain(&self, pool: &FlowPool, bucket: usize) -> Vec<SlotId> {
        let mut out = Vec::new();
        let mut cursor = self.head(bucket);
        while let Some(slot) = cursor {
            out.push(slot);
            cursor = pool.get(slot).chain_next;
        }
        out
    }
}

impl std::fmt::Debug for FlowIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowIndex")
            .field("buckets", &self.buckets.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::super::histogram::HistogramLayout;
    use super::*;

    fn setup(capacity: usize, buckets: usize) -> (FlowPool, FlowIndex) {
        let layout = HistogramLayout::new(1, 1).expect("valid layout");
        (
            FlowPool::new(capacity, layout).expect("pool allocates"),
            FlowIndex::new(buckets).expect("index allocates"),
        )
    }

    fn add(pool: &mut FlowPool, index: &mut FlowIndex, identity: FlowIdentity) -> SlotId {
        let slot = pool.allocate().expect("slot available");
        pool.get_mut(slot).identity = identity;
        index.insert(pool, slot);
        slot
    }

    fn ident(last: u8, sport: u16) -> FlowIdentity {
        FlowIdentity::new(
            Ipv4Addr::new(10, 0, 0, last),
            sport,
            Ipv4Addr::new(10, 0, 0, 200),
            80,
        )
    }

    #[test]
    fn test_rejects_zero_buckets() {
        assert!(matches!(
            FlowIndex::new(0),
            Err(TrackerError::ZeroIndexBuckets)
        ));
    }

    #[test]
    fn test_hash_uses_high_bytes_and_ports() {
        let index = FlowIndex::new(4096).expect("index allocates");
        let id = FlowIdentity::new(Ipv4Addr::new(10, 9, 9, 9), 1000, Ipv4Addr::new(20, 1, 1, 1), 80);
        assert_eq!(index.bucket_of(&id), 10 + 20 + 1000 + 80);

        let small = FlowIndex::new(1000).expect("index allocates");
        assert_eq!(small.bucket_of(&id), 110);
    }

    #[test]
    fn test_hash_is_symmetric() {
        let index = FlowIndex::new(97).expect("index allocates");
        let id = ident(1, 40000);
        assert_eq!(index.bucket_of(&id), index.bucket_of(&id.reversed()));
    }

    #[test]
    fn test_lookup_both_orientations() {
        let (mut pool, mut index) = setup(4, 4);
        let id = ident(1, 40000);
        let slot = add(&mut pool, &mut index, id);

        assert_eq!(index.lookup(&pool, &id), Some(slot));
        assert_eq!(index.lookup(&pool, &id.reversed()), Some(slot));
        assert_eq!(index.lookup(&pool, &ident(2, 40000)), None);
    }

    #[test]
    fn test_collisions_chain_in_insertion_order() {
        // One bucket forces every flow into the same chain.
        let (mut pool, mut index) = setup(4, 1);
        let a = add(&mut pool, &mut index, ident(1, 1));
        let b = add(&mut pool, &mut index, ident(2, 2));
        let c = add(&mut pool, &mut index, ident(3, 3));

        assert_eq!(index.chain(&pool, 0), vec![a, b, c]);
        assert_eq!(index.lookup(&pool, &ident(2, 2)), Some(b));
    }

    #[test]
    fn test_remove_middle_head_and_tail() {
        let (mut pool, mut index) = setup(4, 1);
        let a = add(&mut pool, &mut index, ident(1, 1));
        let b = add(&mut pool, &mut index, ident(2, 2));
        let c = add(&mut pool, &mut index, ident(3, 3));

        index.remove(&mut pool, b);
        assert_eq!(index.chain(&pool, 0), vec![a, c]);
        assert_eq!(index.lookup(&pool, &ident(2, 2)), None);

        index.remove(&mut pool, a);
        assert_eq!(index.chain(&pool, 0), vec![c]);

        index.remove(&mut pool, c);
        assert!(index.chain(&pool, 0).is_empty());
        assert_eq!(index.head(0), None);

        // Chain is reusable after draining it completely.
        let d = add(&mut pool, &mut index, ident(4, 4));
        assert_eq!(index.chain(&pool, 0), vec![d]);
    }

    #[test]
    fn test_remove_clears_record_links() {
        let (mut pool, mut index) = setup(2, 1);
        let a = add(&mut pool, &mut index, ident(1, 1));
        let b = add(&mut pool, &mut index, ident(2, 2));

        index.remove(&mut pool, a);
        assert_eq!(pool.get(a).chain_prev, None);
        assert_eq!(pool.get(a).chain_next, None);
        assert_eq!(pool.get(b).chain_prev, None);
    }
}
