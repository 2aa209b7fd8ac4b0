use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Handle to a slot in the flow pool.
///
/// Handles are only minted by [`FlowPool`](super::pool::FlowPool), so every
/// handle in circulation indexes a valid slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(u32);

impl SlotId {
    pub(crate) fn new(index: usize) -> Self {
        // Pool capacity is bounded by MAX_CAPACITY, which fits in u32.
        Self(index as u32)
    }

    /// Position of the slot in the pool arena.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Connection identity (IPv4 4-tuple).
///
/// Two identities denote the same flow when they match in either
/// orientation, see [`FlowIdentity::matches`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowIdentity {
    pub saddr: Ipv4Addr,
    pub daddr: Ipv4Addr,
    pub sport: u16,
    pub dport: u16,
}

impl FlowIdentity {
    pub const fn new(saddr: Ipv4Addr, sport: u16, daddr: Ipv4Addr, dport: u16) -> Self {
        Self {
            saddr,
            daddr,
            sport,
            dport,
        }
    }

    /// The same connection seen from the other end.
    pub const fn reversed(&self) -> Self {
        Self {
            saddr: self.daddr,
            daddr: self.saddr,
            sport: self.dport,
            dport: self.sport,
        }
    }

    /// Returns true if `other` is this flow in either orientation.
    #[inline]
    pub fn matches(&self, other: &FlowIdentity) -> bool {
        (self.saddr == other.saddr
            && self.daddr == other.daddr
            && self.sport == other.sport
            && self.dport == other.dport)
            || (self.saddr == other.daddr
                && self.daddr == other.saddr
                && self.sport == other.dport
                && self.dport == other.sport)
    }

    /// Returns true if either port equals `port`.
    #[inline]
    pub fn has_port(&self, port: u16) -> bool {
        self.sport == port || self.dport == port
    }
}

impl Default for FlowIdentity {
    fn default() -> Self {
        Self::new(Ipv4Addr::UNSPECIFIED, 0, Ipv4Addr::UNSPECIFIED, 0)
    }
}

impl fmt::Display for FlowIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.saddr, self.sport, self.daddr, self.dport
        )
    }
}

/// Lifecycle state of a pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotState {
    /// On the free list.
    #[default]
    Free,
    /// Reachable from exactly one index chain.
    Active,
    /// Reachable from the finished queue only, frozen until drained.
    Finished,
}

/// Packet, byte and loss counters accumulated for one flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowCounters {
    pub recv_packets: u32,
    pub snd_packets: u32,
    pub recv_bytes: u64,
    pub snd_bytes: u64,
    pub out_of_order: u32,
    /// Cumulative retransmissions as last reported by the connection.
    pub retransmits: u32,
    /// Highest in-order receive sequence number seen so far.
    pub last_recv_seq: u32,
}

/// Last sampled congestion-control state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CongestionState {
    pub cwnd: u32,
    pub cwnd_clamp: u32,
    pub ssthresh: u32,
    pub srtt: u32,
}

/// One connection's accumulated statistics, stored in place in a pool slot.
///
/// The histogram counts live in the pool's histogram arena, not here, so the
/// record itself stays fixed-size.
#[derive(Debug, Clone, Default)]
pub struct FlowRecord {
    pub(crate) identity: FlowIdentity,
    pub(crate) first_packet: Duration,
    pub(crate) last_packet: Duration,
    pub(crate) last_reported: Duration,
    /// Table generation of the last event applied to this record.
    pub(crate) updated_gen: u64,
    /// Value of `updated_gen` when the record was last reported live.
    pub(crate) reported_gen: u64,
    pub(crate) counters: FlowCounters,
    pub(crate) congestion: CongestionState,
    /// Number of congestion samples folded into the histogram.
    pub(crate) samples: u32,
    pub(crate) state: SlotState,
    pub(crate) chain_prev: Option<SlotId>,
    pub(crate) chain_next: Option<SlotId>,
    /// Free-list link while free, finished-queue link while finished.
    pub(crate) link: Option<SlotId>,
}

impl FlowRecord {
    pub fn identity(&self) -> &FlowIdentity {
        &self.identity
    }

    pub fn first_packet(&self) -> Duration {
        self.first_packet
    }

    pub fn last_packet(&self) -> Duration {
        self.last_packet
    }

    pub fn last_reported(&self) -> Duration {
        self.last_reported
    }

    pub fn counters(&self) -> &FlowCounters {
        &self.counters
    }

    pub fn congestion(&self) -> &CongestionState {
        &self.congestion
    }

    pub fn samples(&self) -> u32 {
        self.samples
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    /// Time between the first and the most recent packet.
    pub fn duration(&self) -> Duration {
        self.last_packet.saturating_sub(self.first_packet)
    }

    /// Returns true if an event landed after the last live report.
    pub(crate) fn has_unreported_changes(&self) -> bool {
        self.updated_gen > self.reported_gen
    }

    /// Zero every statistic, keeping the free-list link intact.
    pub(crate) fn reset(&mut self) {
        let link = self.link;
        *self = Self::default();
        self.link = link;
    }
}

/// Owned copy of an active record, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowSnapshot {
    pub identity: FlowIdentity,
    pub first_packet: Duration,
    pub last_packet: Duration,
    pub counters: FlowCounters,
    pub congestion: CongestionState,
    pub samples: u32,
    pub histogram: Vec<u32>,
}

impl FlowSnapshot {
    pub(crate) fn capture(record: &FlowRecord, histogram: &[u32]) -> Self {
        Self {
            identity: record.identity,
            first_packet: record.first_packet,
            last_packet: record.last_packet,
            counters: record.counters,
            congestion: record.congestion,
            samples: record.samples,
            histogram: histogram.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(a: [u8; 4], sport: u16, b: [u8; 4], dport: u16) -> FlowIdentity {
        FlowIdentity::new(Ipv4Addr::from(a), sport, Ipv4Addr::from(b), dport)
    }

    #[test]
    fn test_identity_matches_same_orientation() {
        let a = id([10, 0, 0, 1], 40000, [10, 0, 0, 2], 80);
        assert!(a.matches(&a));
    }

    #[test]
    fn test_identity_matches_reversed_orientation() {
        let a = id([10, 0, 0, 1], 40000, [10, 0, 0, 2], 80);
        assert!(a.matches(&a.reversed()));
        assert!(a.reversed().matches(&a));
    }

    #[test]
    fn test_identity_rejects_half_swapped() {
        let a = id([10, 0, 0, 1], 40000, [10, 0, 0, 2], 80);
        // Addresses swapped but ports not: a different connection.
        let b = id([10, 0, 0, 2], 40000, [10, 0, 0, 1], 80);
        assert!(!a.matches(&b));

        let c = id([10, 0, 0, 1], 40001, [10, 0, 0, 2], 80);
        assert!(!a.matches(&c));
    }

    #[test]
    fn test_identity_display() {
        let a = id([192, 168, 1, 7], 5555, [1, 2, 3, 4], 443);
        assert_eq!(a.to_string(), "192.168.1.7:5555 -> 1.2.3.4:443");
    }

    #[test]
    fn test_record_reset_keeps_link() {
        let mut r = FlowRecord {
            identity: id([1, 1, 1, 1], 1, [2, 2, 2, 2], 2),
            counters: FlowCounters {
                recv_packets: 9,
                ..Default::default()
            },
            state: SlotState::Finished,
            link: Some(SlotId::new(3)),
            chain_next: Some(SlotId::new(1)),
            ..Default::default()
        };
        r.reset();

        assert_eq!(r.counters, FlowCounters::default());
        assert_eq!(r.identity, FlowIdentity::default());
        assert_eq!(r.state, SlotState::Free);
        assert_eq!(r.chain_next, None);
        assert_eq!(r.link, Some(SlotId::new(3)));
    }

    #[test]
    fn test_duration_saturates() {
        let r = FlowRecord {
            first_packet: Duration::from_secs(5),
            last_packet: Duration::from_secs(3),
            ..Default::default()
        };
        assert_eq!(r.duration(), Duration::ZERO);
    }
}
