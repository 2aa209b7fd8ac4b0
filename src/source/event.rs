use std::fmt;

use crate::flow::record::FlowIdentity;

/// Which side of the connection observed the segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Direction {
    Receive = 0,
    Transmit = 1,
}

impl Direction {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Receive),
            1 => Some(Self::Transmit),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Receive => "rx",
            Self::Transmit => "tx",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// TCP header flags relevant to flow lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct TcpFlags(u8);

impl TcpFlags {
    pub const NONE: Self = Self(0);
    pub const FIN: Self = Self(0x01);
    pub const SYN: Self = Self(0x02);
    pub const RST: Self = Self(0x04);

    const KNOWN: u8 = 0x07;

    /// Builds flags from raw bits, discarding unknown bits.
    pub const fn from_bits_truncate(bits: u8) -> Self {
        Self(bits & Self::KNOWN)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub const fn syn(self) -> bool {
        self.contains(Self::SYN)
    }

    pub const fn fin(self) -> bool {
        self.contains(Self::FIN)
    }

    pub const fn rst(self) -> bool {
        self.contains(Self::RST)
    }

    /// FIN or RST.
    pub const fn terminates(self) -> bool {
        self.fin() || self.rst()
    }
}

impl std::ops::BitOr for TcpFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return f.write_str("-");
        }
        let mut sep = "";
        for (flag, name) in [(Self::SYN, "SYN"), (Self::FIN, "FIN"), (Self::RST, "RST")] {
            if self.contains(flag) {
                write!(f, "{sep}{name}")?;
                sep = "|";
            }
        }
        Ok(())
    }
}

/// Congestion-control state, only present while the connection is
/// established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CongestionSample {
    pub cwnd: u32,
    pub cwnd_clamp: u32,
    pub ssthresh: u32,
    pub srtt: u32,
}

/// One per-segment observation delivered by an event source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowEvent {
    pub identity: FlowIdentity,
    pub direction: Direction,
    pub flags: TcpFlags,
    /// Segment length in bytes.
    pub len: u32,
    /// Receive sequence number. Meaningful on the receive path only.
    pub seq: u32,
    /// Cumulative retransmissions of the connection. Transmit path only.
    pub retransmits: u32,
    /// Present iff the connection is established.
    pub congestion: Option<CongestionSample>,
}

impl FlowEvent {
    /// A receive-side event with no payload and no congestion sample.
    pub fn receive(identity: FlowIdentity, flags: TcpFlags) -> Self {
        Self::bare(identity, Direction::Receive, flags)
    }

    /// A transmit-side event with no payload and no congestion sample.
    pub fn transmit(identity: FlowIdentity, flags: TcpFlags) -> Self {
        Self::bare(identity, Direction::Transmit, flags)
    }

    fn bare(identity: FlowIdentity, direction: Direction, flags: TcpFlags) -> Self {
        Self {
            identity,
            direction,
            flags,
            len: 0,
            seq: 0,
            retransmits: 0,
            congestion: None,
        }
    }

    pub fn with_len(mut self, len: u32) -> Self {
        self.len = len;
        self
    }

    pub fn with_seq(mut self, seq: u32) -> Self {
        self.seq = seq;
        self
    }

    pub fn with_retransmits(mut self, retransmits: u32) -> Self {
        self.retransmits = retransmits;
        self
    }

    /// Marks the connection established with the given congestion state.
    pub fn established(mut self, sample: CongestionSample) -> Self {
        self.congestion = Some(sample);
        self
    }
}
