use super::TrackerError;

/// Shape of the per-flow congestion-window histogram.
///
/// Bucket `i` counts samples with `i * width <= cwnd < (i + 1) * width`,
/// except the last bucket which absorbs every larger window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistogramLayout {
    buckets: usize,
    width: u32,
}

impl HistogramLayout {
    /// Creates a layout with `buckets` buckets of `width` segments each.
    pub fn new(buckets: usize, width: u32) -> Result<Self, TrackerError> {
        if buckets == 0 {
            return Err(TrackerError::ZeroHistogramBuckets);
        }
        if width == 0 {
            return Err(TrackerError::ZeroBucketWidth);
        }
        Ok(Self { buckets, width })
    }

    pub fn buckets(&self) -> usize {
        self.buckets
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    /// Returns the bucket index for a congestion window.
    #[inline]
    pub fn bucket_index(&self, cwnd: u32) -> usize {
        let idx = (cwnd / self.width) as usize;
        idx.min(self.buckets - 1)
    }

    /// Records one sample into `counts`, which must hold `buckets` entries.
    #[inline]
    pub fn record(&self, counts: &mut [u32], cwnd: u32) {
        if let Some(bucket) = counts.get_mut(self.bucket_index(cwnd)) {
            *bucket = bucket.saturating_add(1);
        }
    }

    /// Lower bound of each bucket. The last bucket is unbounded above.
    pub fn lower_bounds(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.buckets).map(move |i| i as u64 * u64::from(self.width))
    }
}
