//! Decoding of fixed-size event samples.
//!
//! A sample is 48 little-endian bytes. The length check happens once per
//! sample, after which fixed-width fields are read with unaligned loads.

use std::net::Ipv4Addr;

use thiserror::Error;

use crate::flow::record::FlowIdentity;

use super::event::{CongestionSample, Direction, FlowEvent, TcpFlags};

/// Size of one encoded event sample in bytes.
pub const SAMPLE_SIZE: usize = 48;

const OFF_SADDR: usize = 0;
const OFF_DADDR: usize = 4;
const OFF_SPORT: usize = 8;
const OFF_DPORT: usize = 10;
const OFF_DIRECTION: usize = 12;
const OFF_FLAGS: usize = 13;
const OFF_ESTABLISHED: usize = 14;
const OFF_LEN: usize = 16;
const OFF_SEQ: usize = 20;
const OFF_RETRANS: usize = 24;
const OFF_CWND: usize = 28;
const OFF_CLAMP: usize = 32;
const OFF_SSTHRESH: usize = 36;
const OFF_SRTT: usize = 40;

/// Errors that can occur while decoding a sample.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("event too short: {size} bytes")]
    Truncated { size: usize },

    #[error("invalid direction byte {raw}")]
    InvalidDirection { raw: u8 },
}

/// Decode one sample into a [`FlowEvent`].
///
/// Unknown flag bits are ignored. Bytes past [`SAMPLE_SIZE`] are ignored.
pub fn parse_event(data: &[u8]) -> Result<FlowEvent, ParseError> {
    if data.len() < SAMPLE_SIZE {
        return Err(ParseError::Truncated { size: data.len() });
    }

    let direction_raw = read_u8(data, OFF_DIRECTION);
    let direction =
        Direction::from_u8(direction_raw).ok_or(ParseError::InvalidDirection { raw: direction_raw })?;

    let identity = FlowIdentity::new(
        Ipv4Addr::from(read_u32_le(data, OFF_SADDR)),
        read_u16_le(data, OFF_SPORT),
        Ipv4Addr::from(read_u32_le(data, OFF_DADDR)),
        read_u16_le(data, OFF_DPORT),
    );

    let congestion = (read_u8(data, OFF_ESTABLISHED) != 0).then(|| CongestionSample {
        cwnd: read_u32_le(data, OFF_CWND),
        cwnd_clamp: read_u32_le(data, OFF_CLAMP),
        ssthresh: read_u32_le(data, OFF_SSTHRESH),
        srtt: read_u32_le(data, OFF_SRTT),
    });

    Ok(FlowEvent {
        identity,
        direction,
        flags: TcpFlags::from_bits_truncate(read_u8(data, OFF_FLAGS)),
        len: read_u32_le(data, OFF_LEN),
        seq: read_u32_le(data, OFF_SEQ),
        retransmits: read_u32_le(data, OFF_RETRANS),
        congestion,
    })
}

/// Encode an event into the sample layout read by [`parse_event`].
pub fn encode_event(event: &FlowEvent) -> [u8; SAMPLE_SIZE] {
    let mut out = [0u8; SAMPLE_SIZE];
    let id = &event.identity;
    let congestion = event.congestion.unwrap_or_default();

    out[OFF_SADDR..OFF_SADDR + 4].copy_from_slice(&u32::from(id.saddr).to_le_bytes());
    out[OFF_DADDR..OFF_DADDR + 4].copy_from_slice(&u32::from(id.daddr).to_le_bytes());
    out[OFF_SPORT..OFF_SPORT + 2].copy_from_slice(&id.sport.to_le_bytes());
    out[OFF_DPORT..OFF_DPORT + 2].copy_from_slice(&id.dport.to_le_bytes());
    out[OFF_DIRECTION] = event.direction as u8;
    out[OFF_FLAGS] = event.flags.bits();
    out[OFF_ESTABLISHED] = u8::from(event.congestion.is_some());

    for (offset, value) in [
        (OFF_LEN, event.len),
        (OFF_SEQ, event.seq),
        (OFF_RETRANS, event.retransmits),
        (OFF_CWND, congestion.cwnd),
        (OFF_CLAMP, congestion.cwnd_clamp),
        (OFF_SSTHRESH, congestion.ssthresh),
        (OFF_SRTT, congestion.srtt),
    ] {
        out[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    out
}

// ---------------------------------------------------------------------------
// Fixed-offset readers
// ---------------------------------------------------------------------------

#[inline(always)]
fn read_u8(data: &[u8], offset: usize) -> u8 {
    debug_assert!(offset < data.len());
    // Safety: `parse_event` checks `data.len() >= SAMPLE_SIZE` and every
    // offset lies inside the sample.
    unsafe { *data.as_ptr().add(offset) }
}

#[inline(always)]
fn read_u16_le(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(read_fixed::<2>(data, offset))
}

#[inline(always)]
fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(read_fixed::<4>(data, offset))
}

#[inline(always)]
fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    debug_assert!(offset + N <= data.len());
    // Safety: as for `read_u8`, the sample length is checked up front.
    unsafe { (data.as_ptr().add(offset) as *const [u8; N]).read_unaligned() }
}
