use std::fmt::{self, Write};
use std::time::Duration;

use crate::flow::record::FlowRecord;

/// Text rendering of one record as a single sink line.
///
/// Fields, space separated: time since session start, finished flag, source
/// address and port, destination address and port, flow duration, received
/// packets and bytes, sent packets and bytes, retransmissions, out-of-order
/// count, window clamp, slow-start threshold, smoothed RTT, last congestion
/// window, comma-separated histogram counts. Addresses are host-order
/// lowercase hex.
pub struct RecordView<'a> {
    record: &'a FlowRecord,
    histogram: &'a [u32],
    since_start: Duration,
    finished: bool,
}

impl<'a> RecordView<'a> {
    pub fn new(record: &'a FlowRecord, histogram: &'a [u32], start: Duration, finished: bool) -> Self {
        Self {
            record,
            histogram,
            since_start: record.last_packet().saturating_sub(start),
            finished,
        }
    }

    /// Exact number of bytes [`RecordView::encode_into`] would write.
    pub fn encoded_len(&self) -> usize {
        let mut counter = ByteCounter(0);
        // ByteCounter never fails.
        let _ = write!(counter, "{self}");
        counter.0
    }

    /// Writes the line into `buf`.
    ///
    /// Returns the number of bytes written, or `Err(needed)` without touching
    /// `buf` when the whole line does not fit.
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<usize, usize> {
        let needed = self.encoded_len();
        if needed > buf.len() {
            return Err(needed);
        }
        let mut writer = SliceWriter { buf, pos: 0 };
        write!(writer, "{self}").map_err(|_| needed)?;
        Ok(writer.pos)
    }
}

impl fmt::Display for RecordView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = self.record;
        let id = r.identity();
        let c = r.counters();
        let cc = r.congestion();

        write_secs(f, self.since_start)?;
        write!(
            f,
            " {} {:x} {} {:x} {} ",
            u8::from(self.finished),
            u32::from(id.saddr),
            id.sport,
            u32::from(id.daddr),
            id.dport,
        )?;
        write_secs(f, r.duration())?;
        write!(
            f,
            " {} {} {} {} {} {} {} {} {} {} ",
            c.recv_packets,
            c.recv_bytes,
            c.snd_packets,
            c.snd_bytes,
            c.retransmits,
            c.out_of_order,
            cc.cwnd_clamp,
            cc.ssthresh,
            cc.srtt,
            cc.cwnd,
        )?;

        let mut sep = "";
        for count in self.histogram {
            write!(f, "{sep}{count}")?;
            sep = ",";
        }
        f.write_char('\n')
    }
}

fn write_secs(f: &mut fmt::Formatter<'_>, d: Duration) -> fmt::Result {
    write!(f, "{}.{:09}", d.as_secs(), d.subsec_nanos())
}

struct ByteCounter(usize);

impl Write for ByteCounter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0 += s.len();
        Ok(())
    }
}

struct SliceWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl Write for SliceWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let end = self.pos + s.len();
        let dst = self.buf.get_mut(self.pos..end).ok_or(fmt::Error)?;
        dst.copy_from_slice(s.as_bytes());
        self.pos = end;
        Ok(())
    }
}
