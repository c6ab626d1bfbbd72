//! Default analyzer: tracks per-connection activity for one partition.
//!
//! Protocol decoding is handled elsewhere; this analyzer keeps the
//! connection-scoped bookkeeping every protocol needs (chunks, bytes by
//! direction, detail records) and releases it on close or after the
//! connection has been idle for the configured timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::AnalyzerConfig;
use crate::tracer::event::{
    Direction, Protocol, SocketCloseEvent, SocketDataUploadEvent, SocketDetailEvent,
};

use super::{Analyzer, AnalyzerFactory, ExtensionConfig};

/// Activity observed on one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionActivity {
    pub protocol: Protocol,
    pub data_chunks: u64,
    pub ingress_bytes: u64,
    pub egress_bytes: u64,
    pub details: u64,
    /// Last data id seen in a detail record.
    pub last_data_id: u64,
    pub last_seen: Instant,
}

impl ConnectionActivity {
    fn new(protocol: Protocol, now: Instant) -> Self {
        Self {
            protocol,
            data_chunks: 0,
            ingress_bytes: 0,
            egress_bytes: 0,
            details: 0,
            last_data_id: 0,
            last_seen: now,
        }
    }
}

type ConnectionMap = HashMap<String, ConnectionActivity>;

/// Floor for the sweep period; `tokio::time::interval` rejects zero.
const MIN_MAINTENANCE_INTERVAL: Duration = Duration::from_millis(1);

/// Connection-tracking analyzer owned by a single partition.
pub struct ConnectionAnalyzer {
    partition: usize,
    idle_timeout: Duration,
    maintenance_interval: Duration,
    connections: Arc<parking_lot::Mutex<ConnectionMap>>,
    extension: parking_lot::RwLock<Arc<ExtensionConfig>>,
}

impl ConnectionAnalyzer {
    pub fn new(partition: usize, cfg: &AnalyzerConfig) -> Self {
        Self {
            partition,
            idle_timeout: cfg.idle_timeout,
            maintenance_interval: cfg.maintenance_interval.max(MIN_MAINTENANCE_INTERVAL),
            connections: Arc::new(parking_lot::Mutex::new(HashMap::new())),
            extension: parking_lot::RwLock::new(Arc::new(ExtensionConfig::default())),
        }
    }

    /// Factory building one analyzer per partition.
    pub fn factory() -> AnalyzerFactory {
        Arc::new(|partition: usize, cfg: &AnalyzerConfig| {
            Arc::new(Self::new(partition, cfg)) as Arc<dyn Analyzer>
        })
    }

    pub fn connection(&self, connection_id: &str) -> Option<ConnectionActivity> {
        self.connections.lock().get(connection_id).cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Extension configuration currently in effect.
    pub fn extension_config(&self) -> Arc<ExtensionConfig> {
        Arc::clone(&self.extension.read())
    }

    /// Drop connections idle for longer than the configured timeout.
    /// Returns how many were removed.
    pub fn evict_idle(&self, now: Instant) -> usize {
        evict_idle(&self.connections, self.idle_timeout, now)
    }
}

fn evict_idle(
    connections: &parking_lot::Mutex<ConnectionMap>,
    idle_timeout: Duration,
    now: Instant,
) -> usize {
    let mut connections = connections.lock();
    let before = connections.len();
    connections
        .retain(|_, activity| now.saturating_duration_since(activity.last_seen) < idle_timeout);
    before - connections.len()
}

impl Analyzer for ConnectionAnalyzer {
    fn start(&self, cancel: CancellationToken) {
        let connections = Arc::clone(&self.connections);
        let idle_timeout = self.idle_timeout;
        let interval = self.maintenance_interval;
        let partition = self.partition;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let evicted = evict_idle(&connections, idle_timeout, Instant::now());
                        if evicted > 0 {
                            debug!(partition, evicted, "evicted idle connections");
                        }
                    }
                }
            }
        });
    }

    fn receive_socket_detail(&self, event: SocketDetailEvent) {
        let now = Instant::now();
        let mut connections = self.connections.lock();
        let activity = connections
            .entry(event.connection_id())
            .or_insert_with(|| ConnectionActivity::new(event.protocol, now));
        activity.details += 1;
        activity.last_data_id = event.data_id;
        activity.last_seen = now;
        if event.protocol != Protocol::Unknown {
            activity.protocol = event.protocol;
        }
    }

    fn receive_socket_data(&self, event: SocketDataUploadEvent) {
        let now = Instant::now();
        let mut connections = self.connections.lock();
        let activity = connections
            .entry(event.connection_id())
            .or_insert_with(|| ConnectionActivity::new(event.protocol, now));
        activity.data_chunks += 1;
        let len = event.buffer.len() as u64;
        match event.direction {
            Direction::Ingress => activity.ingress_bytes += len,
            Direction::Egress => activity.egress_bytes += len,
        }
        activity.last_seen = now;
        if event.protocol != Protocol::Unknown {
            activity.protocol = event.protocol;
        }
    }

    fn update_extension_config(&self, config: &ExtensionConfig) {
        *self.extension.write() = Arc::new(config.clone());
        debug!(
            partition = self.partition,
            rules = config.network_samplings.len(),
            "extension config updated"
        );
    }

    fn receive_socket_close(&self, event: &SocketCloseEvent) {
        // Only the partition that saw the connection holds state for it.
        if let Some(activity) = self.connections.lock().remove(&event.connection_id()) {
            debug!(
                partition = self.partition,
                conid = event.conid,
                data_chunks = activity.data_chunks,
                details = activity.details,
                "released closed connection"
            );
        }
    }
}
