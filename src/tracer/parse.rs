//! Decoding of raw perf buffer records into typed [`SocketEvent`] values.
//!
//! Each kernel queue carries exactly one record layout, so the loader is
//! handed the matching decoder when a receiver is registered. Length checks
//! happen once per record, then fixed-width reads use unaligned loads.

use thiserror::Error;

use super::event::{
    Direction, Protocol, SocketDataUploadEvent, SocketDetailEvent, SocketEvent,
};

/// Fixed header of `struct socket_data_upload_event`, before the buffer.
pub const DATA_HEADER_SIZE: usize = 48;

/// Maximum buffer bytes the kernel copies into one upload chunk.
pub const MAX_DATA_BUFFER_SIZE: usize = 2048;

/// Size of `struct socket_detail_event`.
pub const DETAIL_EVENT_SIZE: usize = 64;

/// Errors that can occur during record decoding.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("reading {event_name}: record too short: {size} bytes")]
    Truncated {
        event_name: &'static str,
        size: usize,
    },

    #[error("reading {event_name}: invalid direction byte {raw}")]
    InvalidDirection { event_name: &'static str, raw: u8 },

    #[error("reading {event_name}: unknown protocol {raw}")]
    UnknownProtocol { event_name: &'static str, raw: u8 },

    #[error("reading data upload event: buffer length {len} exceeds {max}")]
    BufferTooLarge { len: usize, max: usize },

    #[error("reading data upload event: buffer declares {declared} bytes but {available} present")]
    BufferTruncated { declared: usize, available: usize },
}

/// Decode a `socket_data_upload_event` record.
///
/// Layout (little endian):
/// `protocol u8 | have_reduce u8 | direction u8 | finished u8 | sequence u16 |
/// data_len u16 | timestamp u64 | conid u64 | random_id u64 | data_id u64 |
/// total_size u64 | buffer[data_len]`.
pub fn decode_data_event(data: &[u8]) -> Result<SocketEvent, ParseError> {
    const NAME: &str = "data upload event";
    ensure_len(data, DATA_HEADER_SIZE, NAME)?;

    let protocol = parse_protocol(read_u8(data, 0), NAME)?;
    let direction_raw = read_u8(data, 2);
    let direction = Direction::from_u8(direction_raw).ok_or(ParseError::InvalidDirection {
        event_name: NAME,
        raw: direction_raw,
    })?;

    let data_len = usize::from(read_u16_le(data, 6));
    if data_len > MAX_DATA_BUFFER_SIZE {
        return Err(ParseError::BufferTooLarge {
            len: data_len,
            max: MAX_DATA_BUFFER_SIZE,
        });
    }

    // The kernel record is fixed size; only the first data_len bytes are valid.
    let buffer = data
        .get(DATA_HEADER_SIZE..DATA_HEADER_SIZE + data_len)
        .ok_or(ParseError::BufferTruncated {
            declared: data_len,
            available: data.len() - DATA_HEADER_SIZE,
        })?;

    Ok(SocketEvent::Data(SocketDataUploadEvent {
        protocol,
        have_reduce_after_chunk: read_u8(data, 1) != 0,
        direction,
        finished: read_u8(data, 3) != 0,
        sequence: read_u16_le(data, 4),
        timestamp_ns: read_u64_le(data, 8),
        conid: read_u64_le(data, 16),
        random_id: read_u64_le(data, 24),
        data_id: read_u64_le(data, 32),
        total_size: read_u64_le(data, 40),
        buffer: buffer.to_vec(),
    }))
}

/// Decode a `socket_detail_event` record.
///
/// Layout (little endian):
/// `conid u64 | random_id u64 | data_id u64 | start_time u64 | end_time u64 |
/// rtt_us u32 | l4 u32 | l3 u32 | l2 u32 | protocol u8 | ssl u8 | pad[6]`.
pub fn decode_detail_event(data: &[u8]) -> Result<SocketEvent, ParseError> {
    const NAME: &str = "detail event";
    ensure_len(data, DETAIL_EVENT_SIZE, NAME)?;

    Ok(SocketEvent::Detail(SocketDetailEvent {
        conid: read_u64_le(data, 0),
        random_id: read_u64_le(data, 8),
        data_id: read_u64_le(data, 16),
        start_time_ns: read_u64_le(data, 24),
        end_time_ns: read_u64_le(data, 32),
        rtt_us: read_u32_le(data, 40),
        l4_package_count: read_u32_le(data, 44),
        l3_package_count: read_u32_le(data, 48),
        l2_package_count: read_u32_le(data, 52),
        protocol: parse_protocol(read_u8(data, 56), NAME)?,
        ssl: read_u8(data, 57) != 0,
    }))
}

fn parse_protocol(raw: u8, event_name: &'static str) -> Result<Protocol, ParseError> {
    Protocol::from_u8(raw).ok_or(ParseError::UnknownProtocol { event_name, raw })
}

fn ensure_len(data: &[u8], need: usize, event_name: &'static str) -> Result<(), ParseError> {
    if data.len() < need {
        Err(ParseError::Truncated {
            event_name,
            size: data.len(),
        })
    } else {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Byte-reading helpers
// ---------------------------------------------------------------------------

#[inline(always)]
fn read_u8(data: &[u8], offset: usize) -> u8 {
    debug_assert!(offset < data.len());
    // Safety: callers verify record lengths before reading fixed offsets.
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
fn read_u64_le(data: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(read_fixed::<8>(data, offset))
}

#[inline(always)]
fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    debug_assert!(offset + N <= data.len());
    // Safety: callers ensure `offset + N <= data.len()` via upfront length checks.
    unsafe { (data.as_ptr().add(offset) as *const [u8; N]).read_unaligned() }
}

// ---------------------------------------------------------------------------
// Record builders, shared with tests and benches
// ---------------------------------------------------------------------------

/// Encode a data upload record in the kernel layout.
pub fn encode_data_event(event: &SocketDataUploadEvent) -> Vec<u8> {
    let len = event.buffer.len().min(MAX_DATA_BUFFER_SIZE);
    let mut buf = Vec::with_capacity(DATA_HEADER_SIZE + len);
    buf.push(event.protocol as u8);
    buf.push(u8::from(event.have_reduce_after_chunk));
    buf.push(event.direction as u8);
    buf.push(u8::from(event.finished));
    buf.extend_from_slice(&event.sequence.to_le_bytes());
    buf.extend_from_slice(&(len as u16).to_le_bytes());
    buf.extend_from_slice(&event.timestamp_ns.to_le_bytes());
    buf.extend_from_slice(&event.conid.to_le_bytes());
    buf.extend_from_slice(&event.random_id.to_le_bytes());
    buf.extend_from_slice(&event.data_id.to_le_bytes());
    buf.extend_from_slice(&event.total_size.to_le_bytes());
    buf.extend_from_slice(&event.buffer[..len]);
    buf
}

/// Encode a detail record in the kernel layout.
pub fn encode_detail_event(event: &SocketDetailEvent) -> Vec<u8> {
    let mut buf = Vec::with_capacity(DETAIL_EVENT_SIZE);
    buf.extend_from_slice(&event.conid.to_le_bytes());
    buf.extend_from_slice(&event.random_id.to_le_bytes());
    buf.extend_from_slice(&event.data_id.to_le_bytes());
    buf.extend_from_slice(&event.start_time_ns.to_le_bytes());
    buf.extend_from_slice(&event.end_time_ns.to_le_bytes());
    buf.extend_from_slice(&event.rtt_us.to_le_bytes());
    buf.extend_from_slice(&event.l4_package_count.to_le_bytes());
    buf.extend_from_slice(&event.l3_package_count.to_le_bytes());
    buf.extend_from_slice(&event.l2_package_count.to_le_bytes());
    buf.push(event.protocol as u8);
    buf.push(u8::from(event.ssl));
    buf.extend_from_slice(&[0u8; 6]);
    buf
}
