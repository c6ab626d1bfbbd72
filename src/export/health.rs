use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, CounterVec, Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "socktrace";

/// Prometheus metrics for agent health and queue observability.
///
/// All metrics use the "socktrace" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Events decoded from kernel sources by kind (data/detail).
    pub events_received: CounterVec,
    /// Records that failed to decode.
    pub event_decode_errors: Counter,
    /// Records the kernel reported lost before they were read.
    pub perf_events_lost: Counter,
    /// Events accepted into a partition queue.
    pub partition_events_routed: CounterVec,
    /// Events handed to a partition consumer.
    pub partition_events_consumed: CounterVec,
    /// Events currently waiting in a partition queue.
    pub partition_queue_depth: GaugeVec,
    /// Capacity of each partition queue.
    pub partition_queue_capacity: GaugeVec,
    /// Number of partitions.
    pub partitions: Gauge,
    /// Control signals broadcast to every partition, by kind.
    pub control_broadcasts: CounterVec,
    /// BPF programs attached by type.
    pub bpf_programs_attached: GaugeVec,
    /// BPF programs that failed to attach by type.
    pub bpf_programs_failed: GaugeVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let events_received = CounterVec::new(
            Opts::new(
                "events_received_total",
                "Total socket events decoded from kernel sources by kind.",
            )
            .namespace(NAMESPACE),
            &["kind"],
        )?;
        let event_decode_errors = Counter::with_opts(
            Opts::new(
                "event_decode_errors_total",
                "Total kernel records that failed to decode.",
            )
            .namespace(NAMESPACE),
        )?;
        let perf_events_lost = Counter::with_opts(
            Opts::new(
                "perf_events_lost_total",
                "Total records lost in the kernel before they were read.",
            )
            .namespace(NAMESPACE),
        )?;
        let partition_events_routed = CounterVec::new(
            Opts::new(
                "partition_events_routed_total",
                "Total events accepted into a partition queue.",
            )
            .namespace(NAMESPACE),
            &["partition"],
        )?;
        let partition_events_consumed = CounterVec::new(
            Opts::new(
                "partition_events_consumed_total",
                "Total events handed to a partition consumer.",
            )
            .namespace(NAMESPACE),
            &["partition"],
        )?;
        let partition_queue_depth = GaugeVec::new(
            Opts::new(
                "partition_queue_depth",
                "Current number of events waiting in a partition queue.",
            )
            .namespace(NAMESPACE),
            &["partition"],
        )?;
        let partition_queue_capacity = GaugeVec::new(
            Opts::new(
                "partition_queue_capacity",
                "Capacity of a partition queue.",
            )
            .namespace(NAMESPACE),
            &["partition"],
        )?;
        let partitions = Gauge::with_opts(
            Opts::new("partitions", "Number of socket event partitions.").namespace(NAMESPACE),
        )?;
        let control_broadcasts = CounterVec::new(
            Opts::new(
                "control_broadcasts_total",
                "Total control signals broadcast to every partition by kind.",
            )
            .namespace(NAMESPACE),
            &["kind"],
        )?;
        let bpf_programs_attached = GaugeVec::new(
            Opts::new(
                "bpf_programs_attached",
                "Number of successfully attached BPF programs by type.",
            )
            .namespace(NAMESPACE),
            &["type"],
        )?;
        let bpf_programs_failed = GaugeVec::new(
            Opts::new(
                "bpf_programs_failed",
                "Number of BPF programs that failed to attach by type.",
            )
            .namespace(NAMESPACE),
            &["type"],
        )?;

        registry.register(Box::new(events_received.clone()))?;
        registry.register(Box::new(event_decode_errors.clone()))?;
        registry.register(Box::new(perf_events_lost.clone()))?;
        registry.register(Box::new(partition_events_routed.clone()))?;
        registry.register(Box::new(partition_events_consumed.clone()))?;
        registry.register(Box::new(partition_queue_depth.clone()))?;
        registry.register(Box::new(partition_queue_capacity.clone()))?;
        registry.register(Box::new(partitions.clone()))?;
        registry.register(Box::new(control_broadcasts.clone()))?;
        registry.register(Box::new(bpf_programs_attached.clone()))?;
        registry.register(Box::new(bpf_programs_failed.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            events_received,
            event_decode_errors,
            perf_events_lost,
            partition_events_routed,
            partition_events_consumed,
            partition_queue_depth,
            partition_queue_capacity,
            partitions,
            control_broadcasts,
            bpf_programs_attached,
            bpf_programs_failed,
        })
    }

    /// Render every registered metric in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    ///
    /// Returns the bound address, which differs from the configured one
    /// when port 0 is requested.
    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Whether the HTTP server has been started and not yet stopped.
    pub fn is_serving(&self) -> bool {
        self.shutdown.lock().is_some()
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "rendering metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
