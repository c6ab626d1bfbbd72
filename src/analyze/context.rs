use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::queue::PartitionConsumer;
use crate::tracer::event::SocketEvent;

use super::Analyzer;

/// Partition consumer feeding socket events into one private analyzer.
pub struct SocketDataPartitionContext {
    analyzer: Arc<dyn Analyzer>,
}

impl SocketDataPartitionContext {
    pub fn new(analyzer: Arc<dyn Analyzer>) -> Self {
        Self { analyzer }
    }

    pub fn analyzer(&self) -> &Arc<dyn Analyzer> {
        &self.analyzer
    }
}

impl PartitionConsumer for SocketDataPartitionContext {
    fn start(&self, cancel: CancellationToken) {
        self.analyzer.start(cancel);
    }

    fn consume(&self, event: SocketEvent) {
        match event {
            SocketEvent::Detail(detail) => self.analyzer.receive_socket_detail(detail),
            SocketEvent::Data(data) => self.analyzer.receive_socket_data(data),
        }
    }
}
