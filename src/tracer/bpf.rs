//! BPF object loading, kprobe attachment and perf buffer reading.
//!
//! Implements [`EventLoader`] with aya: every source is a perf event array
//! map in the loaded object, read by one task per online CPU.
//! All code is gated behind `#[cfg(feature = "bpf")]`.

use std::sync::Arc;

use anyhow::{Context, Result};
use aya::maps::perf::AsyncPerfEventArray;
use aya::programs::KProbe;
use aya::Ebpf;
use bytes::BytesMut;
use tokio_util::sync::CancellationToken;

use crate::config::{BpfConfig, KprobeConfig};
use crate::queue::RouteHandle;

use super::parse::{DATA_HEADER_SIZE, DETAIL_EVENT_SIZE, MAX_DATA_BUFFER_SIZE};
use super::stats::ReaderStats;
use super::{forward_record, EventDecoder, EventLoader, EventSource};

const PAGE_SIZE: usize = 4096;

/// Records drained from a CPU buffer per wakeup.
const READ_BATCH: usize = 16;

/// BPF program attachment statistics for Prometheus metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttachmentStats {
    pub kprobes_attached: u32,
    pub kprobes_failed: u32,
    pub kretprobes_attached: u32,
    pub kretprobes_failed: u32,
}

/// BPF-backed event loader.
///
/// Dropping the loader detaches every program and closes the maps.
pub struct BpfLoader {
    ebpf: parking_lot::Mutex<Ebpf>,
    stats: Arc<ReaderStats>,
    attach_stats: AttachmentStats,
}

impl BpfLoader {
    /// Load the configured object and attach its kprobes.
    pub fn load(cfg: &BpfConfig, stats: Arc<ReaderStats>) -> Result<Self> {
        let mut ebpf = Ebpf::load_file(&cfg.object_path)
            .with_context(|| format!("loading BPF object {}", cfg.object_path.display()))?;

        let attach_stats = attach_kprobes(&mut ebpf, &cfg.kprobes)?;
        log_attachment_stats(&attach_stats);

        tracing::info!(object = %cfg.object_path.display(), "BPF object loaded");

        Ok(Self {
            ebpf: parking_lot::Mutex::new(ebpf),
            stats,
            attach_stats,
        })
    }

    /// Return a copy of the attachment statistics.
    pub fn attachment_stats(&self) -> AttachmentStats {
        self.attach_stats
    }
}

impl EventLoader for BpfLoader {
    fn read_events_async(
        &self,
        source: &EventSource,
        per_cpu_buffer: usize,
        decoder: EventDecoder,
        route: RouteHandle,
        cancel: CancellationToken,
    ) -> Result<()> {
        let map = self
            .ebpf
            .lock()
            .take_map(source.name())
            .ok_or_else(|| anyhow::anyhow!("perf event map '{source}' not found"))?;
        let mut perf_array = AsyncPerfEventArray::try_from(map)
            .with_context(|| format!("creating perf event array from {source}"))?;

        let cpus = aya::util::online_cpus()
            .map_err(|(_, e)| e)
            .context("listing online CPUs")?;
        let pages = perf_page_count(per_cpu_buffer);
        let record_capacity = record_capacity(source);

        for cpu in &cpus {
            let mut buf = perf_array
                .open(*cpu, Some(pages))
                .with_context(|| format!("opening perf buffer for {source} on cpu {cpu}"))?;

            let route = route.clone();
            let cancel = cancel.clone();
            let stats = Arc::clone(&self.stats);
            let source = source.clone();
            let cpu = *cpu;

            tokio::spawn(async move {
                let mut buffers: Vec<BytesMut> = (0..READ_BATCH)
                    .map(|_| BytesMut::with_capacity(record_capacity))
                    .collect();

                loop {
                    let events = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        result = buf.read_events(&mut buffers) => match result {
                            Ok(events) => events,
                            Err(e) => {
                                tracing::warn!(source = %source, cpu, error = %e, "perf buffer read error");
                                break;
                            }
                        },
                    };

                    if events.lost > 0 {
                        stats.record_lost(events.lost as u64);
                    }

                    for raw in buffers.iter().take(events.read) {
                        // Delivery may wait on a full partition queue.
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return,
                            _ = forward_record(&raw[..], decoder, &route, &stats, &source) => {}
                        }
                    }
                }

                tracing::debug!(source = %source, cpu, "perf reader stopped");
            });
        }

        tracing::info!(
            source = %source,
            cpus = cpus.len(),
            pages,
            "perf readers started"
        );

        Ok(())
    }
}

/// Pages per CPU buffer: a power of two covering `per_cpu_buffer` bytes.
fn perf_page_count(per_cpu_buffer: usize) -> usize {
    per_cpu_buffer
        .div_ceil(PAGE_SIZE)
        .max(1)
        .next_power_of_two()
}

fn record_capacity(source: &EventSource) -> usize {
    if source.name() == super::SOCKET_DETAIL_SOURCE {
        DETAIL_EVENT_SIZE
    } else {
        DATA_HEADER_SIZE + MAX_DATA_BUFFER_SIZE
    }
}

// ---------------------------------------------------------------------------
// BPF program attachment
// ---------------------------------------------------------------------------

fn attach_kprobes(ebpf: &mut Ebpf, kprobes: &[KprobeConfig]) -> Result<AttachmentStats> {
    let mut stats = AttachmentStats::default();

    for kp in kprobes {
        if kp.required {
            attach_kprobe_required(ebpf, &kp.program, &kp.symbol, &mut stats)?;
        } else {
            attach_kprobe_optional(ebpf, &kp.program, &kp.symbol, &mut stats);
        }
    }

    Ok(stats)
}

/// Attach a required kprobe or kretprobe. BPF programs with section `kretprobe/`
/// are detected by aya and attached as return probes automatically.
fn attach_kprobe_required(
    ebpf: &mut Ebpf,
    prog_name: &str,
    symbol: &str,
    stats: &mut AttachmentStats,
) -> Result<()> {
    load_and_attach(ebpf, prog_name, symbol)
        .with_context(|| format!("attaching kprobe {prog_name} to {symbol}"))?;

    if is_kretprobe(prog_name) {
        stats.kretprobes_attached += 1;
        tracing::debug!(symbol, "attached kretprobe");
    } else {
        stats.kprobes_attached += 1;
        tracing::debug!(symbol, "attached kprobe");
    }

    Ok(())
}

fn attach_kprobe_optional(
    ebpf: &mut Ebpf,
    prog_name: &str,
    symbol: &str,
    stats: &mut AttachmentStats,
) {
    let kretprobe = is_kretprobe(prog_name);

    match load_and_attach(ebpf, prog_name, symbol) {
        Ok(()) => {
            if kretprobe {
                stats.kretprobes_attached += 1;
            } else {
                stats.kprobes_attached += 1;
            }
            tracing::debug!(symbol, "attached optional kprobe");
        }
        Err(e) => {
            if kretprobe {
                stats.kretprobes_failed += 1;
            } else {
                stats.kprobes_failed += 1;
            }
            tracing::warn!(symbol, error = %e, "optional kprobe attach failed");
        }
    }
}

fn load_and_attach(ebpf: &mut Ebpf, prog_name: &str, symbol: &str) -> Result<()> {
    let prog: &mut KProbe = ebpf
        .program_mut(prog_name)
        .ok_or_else(|| anyhow::anyhow!("kprobe program '{prog_name}' not found"))?
        .try_into()
        .with_context(|| format!("'{prog_name}' is not a kprobe program"))?;
    prog.load()
        .with_context(|| format!("loading kprobe {prog_name}"))?;
    prog.attach(symbol, 0)
        .with_context(|| format!("attaching to {symbol}"))?;
    Ok(())
}

fn is_kretprobe(prog_name: &str) -> bool {
    prog_name.starts_with("kretprobe_")
}

fn log_attachment_stats(stats: &AttachmentStats) {
    tracing::info!(
        kprobes_attached = stats.kprobes_attached,
        kprobes_failed = stats.kprobes_failed,
        kretprobes_attached = stats.kretprobes_attached,
        kretprobes_failed = stats.kretprobes_failed,
        "BPF program attachment summary"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perf_page_count() {
        assert_eq!(perf_page_count(0), 1);
        assert_eq!(perf_page_count(1), 1);
        assert_eq!(perf_page_count(4096), 1);
        assert_eq!(perf_page_count(4097), 2);
        assert_eq!(perf_page_count(400 * 1024), 128);
    }

    #[test]
    fn test_record_capacity_by_source() {
        assert_eq!(
            record_capacity(&EventSource::new(super::super::SOCKET_DETAIL_SOURCE)),
            DETAIL_EVENT_SIZE
        );
        assert_eq!(
            record_capacity(&EventSource::new(super::super::SOCKET_DATA_UPLOAD_SOURCE)),
            DATA_HEADER_SIZE + MAX_DATA_BUFFER_SIZE
        );
    }

    #[test]
    fn test_kretprobe_detection() {
        assert!(is_kretprobe("kretprobe_tcp_sendmsg"));
        assert!(!is_kretprobe("kprobe_tcp_sendmsg"));
    }
}
