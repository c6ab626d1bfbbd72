pub mod channel;
pub mod event;
pub mod parse;
pub mod stats;

#[cfg(feature = "bpf")]
pub mod bpf;

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::queue::RouteHandle;

use self::event::SocketEvent;
use self::parse::ParseError;
use self::stats::ReaderStats;

/// Kernel queue carrying socket data upload records.
pub const SOCKET_DATA_UPLOAD_SOURCE: &str = "socket_data_upload_event_queue";

/// Kernel queue carrying socket detail records.
pub const SOCKET_DETAIL_SOURCE: &str = "socket_detail_data_queue";

/// Handle naming one kernel event source (a BPF map in the bpf loader).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventSource {
    name: Arc<str>,
}

impl EventSource {
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Turns one raw record from a source into a typed event.
pub type EventDecoder = fn(&[u8]) -> Result<SocketEvent, ParseError>;

/// Loader reads kernel event sources and feeds decoded events to a route step.
pub trait EventLoader: Send + Sync {
    /// Begin asynchronous reads from `source`.
    ///
    /// Every record is decoded with `decoder` and handed to `route`. Read
    /// tasks run until `cancel` fires. `per_cpu_buffer` is the buffer size in
    /// bytes allocated for each CPU.
    fn read_events_async(
        &self,
        source: &EventSource,
        per_cpu_buffer: usize,
        decoder: EventDecoder,
        route: RouteHandle,
        cancel: CancellationToken,
    ) -> Result<()>;
}

/// Decode one raw record and hand it to the route step.
///
/// Decode failures are counted and dropped.
pub(crate) async fn forward_record(
    raw: &[u8],
    decoder: EventDecoder,
    route: &RouteHandle,
    stats: &ReaderStats,
    source: &EventSource,
) {
    match decoder(raw) {
        Ok(event) => {
            stats.record(event.kind());
            route.deliver(event).await;
        }
        Err(e) => {
            tracing::debug!(source = %source, error = %e, "event decode error");
            stats.record_decode_error();
        }
    }
}
