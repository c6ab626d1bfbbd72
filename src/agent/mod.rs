use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::analyze::connection::ConnectionAnalyzer;
use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::listener::{ControlSignal, Listener, SocketSources};
use crate::tracer::stats::ReaderStats;
use crate::tracer::{EventLoader, EventSource};

/// Agent orchestrates the components: health server, socket listener,
/// kernel loader and background stats reporting.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    listener: Arc<Listener>,
    reader_stats: Arc<ReaderStats>,
    loader: Option<Arc<dyn EventLoader>>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent with health metrics and an initialized socket
    /// data queue.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        let mut listener = Listener::new(
            cfg.protocol_analyze.per_cpu_buffer,
            ConnectionAnalyzer::factory(),
        );
        listener
            .init_socket_data_queue(
                cfg.protocol_analyze.parallels,
                cfg.protocol_analyze.queue_size,
                &cfg.analyzer,
            )
            .context("initializing socket data queue")?;

        Ok(Self {
            cfg,
            health,
            listener: Arc::new(listener),
            reader_stats: Arc::new(ReaderStats::new()),
            loader: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Counters the loader's read tasks must record into.
    pub fn reader_stats(&self) -> Arc<ReaderStats> {
        Arc::clone(&self.reader_stats)
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    pub fn listener(&self) -> &Arc<Listener> {
        &self.listener
    }

    /// Sources named by the `bpf` configuration section.
    pub fn sources(&self) -> SocketSources {
        SocketSources {
            data: EventSource::new(&self.cfg.bpf.data_map),
            detail: EventSource::new(&self.cfg.bpf.detail_map),
        }
    }

    /// Start the health server, then begin reading socket events through
    /// `loader`.
    pub async fn start(&mut self, loader: Arc<dyn EventLoader>) -> Result<()> {
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        if let Some(queue) = self.listener.socket_data_queue() {
            self.health.partitions.set(queue.partition_count() as f64);
            for partition in queue.partitions() {
                self.health
                    .partition_queue_capacity
                    .with_label_values(&[&partition.index().to_string()])
                    .set(partition.capacity() as f64);
            }
        }

        if let Err(e) =
            self.listener
                .start_socket_data(&self.cancel, loader.as_ref(), &self.sources())
        {
            // Workers and any readers that did start exit on cancel.
            self.cancel.cancel();
            self.listener.wait_for_shutdown().await;
            if let Err(stop_err) = self.health.stop().await {
                warn!(error = %stop_err, "stopping health metrics server");
            }
            return Err(e.context("starting socket data listener"));
        }
        self.loader = Some(loader);

        self.spawn_stats_reporter();

        info!("agent fully started");

        Ok(())
    }

    /// Broadcast a control signal to every partition.
    pub fn handle_control(&self, signal: &ControlSignal) {
        self.health
            .control_broadcasts
            .with_label_values(&[signal.as_str()])
            .inc();
        self.listener.handle_control(signal);
    }

    /// Copy queue and reader counters into the health metrics.
    pub fn publish_stats(&self) {
        publish_stats(&self.health, &self.listener, &self.reader_stats);
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        // Signal partition workers, read tasks and the reporter to stop.
        self.cancel.cancel();

        self.listener.wait_for_shutdown().await;

        // Drop the loader last so kernel maps outlive their readers.
        self.loader.take();

        self.health.stop().await?;

        Ok(())
    }

    /// Spawn background stats reporter.
    fn spawn_stats_reporter(&self) {
        let cancel = self.cancel.clone();
        let health = Arc::clone(&self.health);
        let listener = Arc::clone(&self.listener);
        let reader_stats = Arc::clone(&self.reader_stats);
        let interval = self.cfg.stats_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let totals = publish_stats(&health, &listener, &reader_stats);
                        if totals.received == 0 && totals.consumed == 0 {
                            continue;
                        }

                        info!(
                            received = totals.received,
                            consumed = totals.consumed,
                            decode_errors = totals.decode_errors,
                            lost = totals.lost,
                            interval = ?interval,
                            "socket event stats",
                        );
                    }
                }
            }
        });
    }
}

#[derive(Debug, Default)]
struct ReportTotals {
    received: u64,
    consumed: u64,
    decode_errors: u64,
    lost: u64,
}

fn publish_stats(
    health: &HealthMetrics,
    listener: &Listener,
    reader_stats: &ReaderStats,
) -> ReportTotals {
    let mut totals = ReportTotals::default();

    let snapshot = reader_stats.snapshot();
    for (kind, count) in &snapshot.received {
        health
            .events_received
            .with_label_values(&[kind.as_str()])
            .inc_by(*count as f64);
        totals.received += count;
    }
    health
        .event_decode_errors
        .inc_by(snapshot.decode_errors as f64);
    health.perf_events_lost.inc_by(snapshot.lost as f64);
    totals.decode_errors = snapshot.decode_errors;
    totals.lost = snapshot.lost;

    let Some(queue) = listener.socket_data_queue() else {
        return totals;
    };

    for (partition, counts) in queue.stats().snapshot().iter().enumerate() {
        let label = partition.to_string();
        health
            .partition_events_routed
            .with_label_values(&[&label])
            .inc_by(counts.pushed as f64);
        health
            .partition_events_consumed
            .with_label_values(&[&label])
            .inc_by(counts.consumed as f64);
        totals.consumed += counts.consumed;
    }

    for partition in queue.partitions() {
        let depth = partition.depth();
        health
            .partition_queue_depth
            .with_label_values(&[&partition.index().to_string()])
            .set(depth as f64);
        if depth > 0 {
            debug!(partition = partition.index(), depth, "partition backlog");
        }
    }

    totals
}
