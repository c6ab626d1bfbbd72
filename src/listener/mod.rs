//! Wires the socket event queue to the kernel loader and fans control
//! signals out to every partition's analyzer.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::analyze::context::SocketDataPartitionContext;
use crate::analyze::{Analyzer, AnalyzerFactory, ExtensionConfig};
use crate::config::AnalyzerConfig;
use crate::queue::EventQueue;
use crate::tracer::event::{SocketCloseEvent, SocketEvent};
use crate::tracer::parse::{decode_data_event, decode_detail_event};
use crate::tracer::{EventLoader, EventSource, SOCKET_DATA_UPLOAD_SOURCE, SOCKET_DETAIL_SOURCE};

/// Control-plane message delivered to every partition.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlSignal {
    ConfigUpdate(ExtensionConfig),
    Close(SocketCloseEvent),
}

impl ControlSignal {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigUpdate(_) => "config_update",
            Self::Close(_) => "close",
        }
    }
}

/// Kernel sources the listener reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketSources {
    pub data: EventSource,
    pub detail: EventSource,
}

impl Default for SocketSources {
    fn default() -> Self {
        Self {
            data: EventSource::new(SOCKET_DATA_UPLOAD_SOURCE),
            detail: EventSource::new(SOCKET_DETAIL_SOURCE),
        }
    }
}

/// Owns the socket data queue for one profiling session.
pub struct Listener {
    per_cpu_buffer: usize,
    analyzer_factory: AnalyzerFactory,
    socket_data_queue: Option<EventQueue<SocketDataPartitionContext>>,
}

impl Listener {
    pub fn new(per_cpu_buffer: usize, analyzer_factory: AnalyzerFactory) -> Self {
        Self {
            per_cpu_buffer,
            analyzer_factory,
            socket_data_queue: None,
        }
    }

    /// Build the queue with one analyzer-backed context per partition.
    pub fn init_socket_data_queue(
        &mut self,
        parallels: usize,
        queue_size: usize,
        cfg: &AnalyzerConfig,
    ) -> Result<()> {
        let factory = Arc::clone(&self.analyzer_factory);
        let queue = EventQueue::new(parallels, queue_size, |partition| {
            SocketDataPartitionContext::new(factory(partition, cfg))
        })
        .context("creating socket data queue")?;

        self.socket_data_queue = Some(queue);
        Ok(())
    }

    /// Register the data and detail receivers and start the queue.
    pub fn start_socket_data(
        &self,
        cancel: &CancellationToken,
        loader: &dyn EventLoader,
        sources: &SocketSources,
    ) -> Result<()> {
        let queue = self
            .socket_data_queue
            .as_ref()
            .context("socket data queue not initialized")?;

        // socket buffer data
        queue.register_receiver(
            sources.data.clone(),
            self.per_cpu_buffer,
            decode_data_event,
            Arc::new(SocketEvent::connection_id),
        );

        // socket detail
        queue.register_receiver(
            sources.detail.clone(),
            self.per_cpu_buffer,
            decode_detail_event,
            Arc::new(SocketEvent::connection_id),
        );

        queue.start(cancel, loader)?;

        info!(
            partitions = queue.partition_count(),
            per_cpu_buffer = self.per_cpu_buffer,
            "socket data listener started"
        );
        Ok(())
    }

    /// Push a configuration update to every partition's analyzer.
    pub fn handle_profiling_extension_config(&self, config: &ExtensionConfig) {
        for analyzer in self.analyzers() {
            analyzer.update_extension_config(config);
        }
    }

    /// Notify every partition's analyzer that a connection closed.
    pub fn handle_connection_close(&self, event: &SocketCloseEvent) {
        for analyzer in self.analyzers() {
            analyzer.receive_socket_close(event);
        }
    }

    pub fn handle_control(&self, signal: &ControlSignal) {
        debug!(signal = signal.as_str(), "broadcasting control signal");
        match signal {
            ControlSignal::ConfigUpdate(config) => self.handle_profiling_extension_config(config),
            ControlSignal::Close(event) => self.handle_connection_close(event),
        }
    }

    pub fn socket_data_queue(&self) -> Option<&EventQueue<SocketDataPartitionContext>> {
        self.socket_data_queue.as_ref()
    }

    /// Wait for partition workers to exit once the start token is cancelled.
    pub async fn wait_for_shutdown(&self) {
        if let Some(queue) = &self.socket_data_queue {
            queue.wait_for_shutdown().await;
        }
    }

    /// Analyzers of every partition; empty before initialization.
    fn analyzers(&self) -> impl Iterator<Item = &Arc<dyn Analyzer>> {
        self.socket_data_queue
            .iter()
            .flat_map(|queue| queue.partitions())
            .map(|partition| partition.consumer().analyzer())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::tracer::event::{SocketDataUploadEvent, SocketDetailEvent};

    #[derive(Default)]
    struct Counts {
        configs: AtomicUsize,
        closes: AtomicUsize,
    }

    struct CountingAnalyzer {
        counts: Arc<Counts>,
    }

    impl Analyzer for CountingAnalyzer {
        fn start(&self, _cancel: CancellationToken) {}
        fn receive_socket_detail(&self, _event: SocketDetailEvent) {}
        fn receive_socket_data(&self, _event: SocketDataUploadEvent) {}
        fn update_extension_config(&self, _config: &ExtensionConfig) {
            self.counts.configs.fetch_add(1, Ordering::SeqCst);
        }
        fn receive_socket_close(&self, _event: &SocketCloseEvent) {
            self.counts.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting_listener(parallels: usize) -> (Listener, Arc<Counts>) {
        let counts = Arc::new(Counts::default());
        let shared = Arc::clone(&counts);
        let factory: AnalyzerFactory = Arc::new(move |_partition: usize, _cfg: &AnalyzerConfig| {
            Arc::new(CountingAnalyzer {
                counts: Arc::clone(&shared),
            }) as Arc<dyn Analyzer>
        });

        let mut listener = Listener::new(4096, factory);
        listener
            .init_socket_data_queue(parallels, 8, &analyzer_config())
            .expect("init");
        (listener, counts)
    }

    fn analyzer_config() -> AnalyzerConfig {
        AnalyzerConfig {
            idle_timeout: Duration::from_secs(60),
            maintenance_interval: Duration::from_secs(10),
        }
    }

    fn close_event() -> SocketCloseEvent {
        SocketCloseEvent {
            conid: 1,
            random_id: 2,
            pid: 3,
            socket_fd: 4,
            end_time_ns: 5,
        }
    }

    #[test]
    fn test_config_update_reaches_every_partition() {
        let (listener, counts) = counting_listener(5);
        listener.handle_profiling_extension_config(&ExtensionConfig::default());
        assert_eq!(counts.configs.load(Ordering::SeqCst), 5);
        assert_eq!(counts.closes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_close_reaches_every_partition() {
        let (listener, counts) = counting_listener(3);
        listener.handle_connection_close(&close_event());
        assert_eq!(counts.closes.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_handle_control_dispatches() {
        let (listener, counts) = counting_listener(2);
        listener.handle_control(&ControlSignal::Close(close_event()));
        listener.handle_control(&ControlSignal::ConfigUpdate(ExtensionConfig::default()));
        assert_eq!(counts.closes.load(Ordering::SeqCst), 2);
        assert_eq!(counts.configs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_broadcast_before_init_is_noop() {
        let listener = Listener::new(4096, crate::analyze::connection::ConnectionAnalyzer::factory());
        listener.handle_profiling_extension_config(&ExtensionConfig::default());
        listener.handle_connection_close(&close_event());
        assert!(listener.socket_data_queue().is_none());
    }

    #[test]
    fn test_start_before_init_fails() {
        let listener = Listener::new(4096, crate::analyze::connection::ConnectionAnalyzer::factory());
        let loader = crate::tracer::channel::ChannelLoader::new(4);
        let err = listener
            .start_socket_data(&CancellationToken::new(), &loader, &SocketSources::default())
            .unwrap_err();
        assert!(err.to_string().contains("not initialized"));
    }

    #[test]
    fn test_control_signal_labels() {
        assert_eq!(ControlSignal::Close(close_event()).as_str(), "close");
        assert_eq!(
            ControlSignal::ConfigUpdate(ExtensionConfig::default()).as_str(),
            "config_update"
        );
    }
}
