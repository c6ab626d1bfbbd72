pub mod connection;
pub mod context;

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::config::AnalyzerConfig;
use crate::tracer::event::{SocketCloseEvent, SocketDataUploadEvent, SocketDetailEvent};

/// Per-partition protocol analyzer.
///
/// Data and detail events arrive from the partition worker, serially and in
/// push order. Configuration updates and close notices are broadcast from
/// the control plane's thread, so implementations synchronise internally.
pub trait Analyzer: Send + Sync {
    /// Start periodic maintenance. Called once from the partition worker.
    fn start(&self, cancel: CancellationToken);

    fn receive_socket_detail(&self, event: SocketDetailEvent);

    fn receive_socket_data(&self, event: SocketDataUploadEvent);

    fn update_extension_config(&self, config: &ExtensionConfig);

    /// Every analyzer sees every close; each decides whether it owns the
    /// connection.
    fn receive_socket_close(&self, event: &SocketCloseEvent);
}

/// Builds the analyzer of one partition.
pub type AnalyzerFactory = Arc<dyn Fn(usize, &AnalyzerConfig) -> Arc<dyn Analyzer> + Send + Sync>;

/// Profiling extension configuration pushed by the control plane.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ExtensionConfig {
    /// Rules deciding which network requests are sampled.
    #[serde(default)]
    pub network_samplings: Vec<NetworkSamplingRule>,
}

/// One network sampling rule.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct NetworkSamplingRule {
    /// Only requests whose URI matches are sampled. None matches all.
    #[serde(default)]
    pub uri_regex: Option<String>,

    /// Sample requests slower than this.
    #[serde(default, with = "humantime_serde")]
    pub min_duration: Option<Duration>,

    #[serde(default)]
    pub when_4xx: bool,

    #[serde(default)]
    pub when_5xx: bool,

    #[serde(default)]
    pub settings: CollectSettings,
}

/// Body capture limits for a sampled request.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CollectSettings {
    #[serde(default)]
    pub require_complete_request: bool,
    #[serde(default)]
    pub max_request_size: u32,
    #[serde(default)]
    pub require_complete_response: bool,
    #[serde(default)]
    pub max_response_size: u32,
}
