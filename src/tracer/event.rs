use std::fmt;

/// EventKind identifies which kernel queue an event was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventKind {
    Data = 0,
    Detail = 1,
}

/// Number of EventKind variants, used for array sizing.
pub const EVENT_KIND_CARDINALITY: usize = 2;

impl EventKind {
    /// Returns the canonical metric/log label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Detail => "detail",
        }
    }

    /// Convert from a raw u8 value.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Data),
            1 => Some(Self::Detail),
            _ => None,
        }
    }

    /// Return all event kinds in numeric order.
    pub fn all() -> &'static [Self] {
        &[Self::Data, Self::Detail]
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Application protocol detected by the kernel side.
/// Values must match the kernel `enum connection_protocol`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Protocol {
    Unknown = 0,
    Http1 = 1,
    Http2 = 2,
}

impl Protocol {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Http1 => "http1",
            Self::Http2 => "http2",
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Unknown),
            1 => Some(Self::Http1),
            2 => Some(Self::Http2),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Socket data direction as seen by the traced process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Direction {
    Ingress = 1,
    Egress = 2,
}

impl Direction {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Ingress),
            2 => Some(Self::Egress),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ingress => f.write_str("ingress"),
            Self::Egress => f.write_str("egress"),
        }
    }
}

/// Builds the routing key shared by every event of one connection.
fn format_connection_id(conid: u64, random_id: u64) -> String {
    format!("{conid}_{random_id}")
}

/// One chunk of socket buffer data uploaded by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketDataUploadEvent {
    pub protocol: Protocol,
    /// Kernel dropped part of the buffer after this chunk.
    pub have_reduce_after_chunk: bool,
    pub direction: Direction,
    /// Last chunk of the current data id.
    pub finished: bool,
    pub sequence: u16,
    pub timestamp_ns: u64,
    pub conid: u64,
    pub random_id: u64,
    pub data_id: u64,
    /// Size of the complete buffer this chunk belongs to.
    pub total_size: u64,
    pub buffer: Vec<u8>,
}

impl SocketDataUploadEvent {
    /// Stable key identifying the connection this chunk belongs to.
    pub fn connection_id(&self) -> String {
        format_connection_id(self.conid, self.random_id)
    }
}

/// Per-request connection metadata emitted once a data id completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketDetailEvent {
    pub conid: u64,
    pub random_id: u64,
    pub data_id: u64,
    pub start_time_ns: u64,
    pub end_time_ns: u64,
    pub rtt_us: u32,
    pub l4_package_count: u32,
    pub l3_package_count: u32,
    pub l2_package_count: u32,
    pub protocol: Protocol,
    pub ssl: bool,
}

impl SocketDetailEvent {
    /// Stable key identifying the connection this record belongs to.
    pub fn connection_id(&self) -> String {
        format_connection_id(self.conid, self.random_id)
    }
}

/// Notification that a traced socket has been closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketCloseEvent {
    pub conid: u64,
    pub random_id: u64,
    pub pid: u32,
    pub socket_fd: u32,
    pub end_time_ns: u64,
}

impl SocketCloseEvent {
    pub fn connection_id(&self) -> String {
        format_connection_id(self.conid, self.random_id)
    }
}

/// A socket event routed through the partitioned queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Data(SocketDataUploadEvent),
    Detail(SocketDetailEvent),
}

impl SocketEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Data(_) => EventKind::Data,
            Self::Detail(_) => EventKind::Detail,
        }
    }

    pub fn connection_id(&self) -> String {
        match self {
            Self::Data(e) => e.connection_id(),
            Self::Detail(e) => e.connection_id(),
        }
    }
}

impl From<SocketDataUploadEvent> for SocketEvent {
    fn from(e: SocketDataUploadEvent) -> Self {
        Self::Data(e)
    }
}

impl From<SocketDetailEvent> for SocketEvent {
    fn from(e: SocketDetailEvent) -> Self {
        Self::Detail(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_event(conid: u64, random_id: u64) -> SocketDataUploadEvent {
        SocketDataUploadEvent {
            protocol: Protocol::Http1,
            have_reduce_after_chunk: false,
            direction: Direction::Egress,
            finished: true,
            sequence: 0,
            timestamp_ns: 1,
            conid,
            random_id,
            data_id: 7,
            total_size: 3,
            buffer: b"GET".to_vec(),
        }
    }

    fn detail_event(conid: u64, random_id: u64) -> SocketDetailEvent {
        SocketDetailEvent {
            conid,
            random_id,
            data_id: 7,
            start_time_ns: 1,
            end_time_ns: 2,
            rtt_us: 100,
            l4_package_count: 1,
            l3_package_count: 1,
            l2_package_count: 1,
            protocol: Protocol::Http1,
            ssl: false,
        }
    }

    #[test]
    fn test_connection_id_matches_across_variants() {
        let data = SocketEvent::from(data_event(42, 9));
        let detail = SocketEvent::from(detail_event(42, 9));
        assert_eq!(data.connection_id(), "42_9");
        assert_eq!(data.connection_id(), detail.connection_id());
    }

    #[test]
    fn test_connection_id_distinguishes_random_id() {
        assert_ne!(
            data_event(42, 1).connection_id(),
            data_event(42, 2).connection_id()
        );
    }

    #[test]
    fn test_close_event_uses_same_key() {
        let close = SocketCloseEvent {
            conid: 42,
            random_id: 9,
            pid: 1,
            socket_fd: 3,
            end_time_ns: 5,
        };
        assert_eq!(close.connection_id(), data_event(42, 9).connection_id());
    }

    #[test]
    fn test_event_kind_roundtrip() {
        for kind in EventKind::all() {
            assert_eq!(EventKind::from_u8(*kind as u8), Some(*kind));
        }
        assert!(EventKind::from_u8(2).is_none());
        assert_eq!(EventKind::all().len(), EVENT_KIND_CARDINALITY);
    }

    #[test]
    fn test_kind_of_event() {
        assert_eq!(SocketEvent::from(data_event(1, 1)).kind(), EventKind::Data);
        assert_eq!(
            SocketEvent::from(detail_event(1, 1)).kind(),
            EventKind::Detail
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(Direction::Ingress.to_string(), "ingress");
        assert_eq!(Protocol::Http2.to_string(), "http2");
        assert_eq!(EventKind::Detail.to_string(), "detail");
    }
}
