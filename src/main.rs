use std::path::PathBuf;
#[cfg(feature = "bpf")]
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use socktrace::{agent, config};

/// eBPF socket profiling agent: partitioned dispatch of socket events.
#[derive(Parser)]
#[command(name = "socktrace", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level, overriding the config file
    /// (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
    /// Load and validate the configuration, then exit.
    CheckConfig,
}

/// Build-time version info, injected via RUSTFLAGS.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("socktrace {}", version::full());
        return Ok(());
    }

    // Config is required for everything else.
    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = config::Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    if let Some(Command::CheckConfig) = &cli.command {
        println!("config {} is valid", config_path.display());
        return Ok(());
    }

    // Initialize tracing.
    let level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        parallels = cfg.protocol_analyze.parallels,
        queue_size = cfg.protocol_analyze.queue_size,
        "starting socktrace",
    );

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: config::Config) -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    let mut agent = agent::Agent::new(cfg)?;
    start_agent(&mut agent).await?;

    // Wait for shutdown signal.
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }

    // Graceful shutdown.
    agent.stop().await?;

    tracing::info!("socktrace stopped");

    Ok(())
}

#[cfg(feature = "bpf")]
async fn start_agent(agent: &mut agent::Agent) -> Result<()> {
    use socktrace::tracer::bpf::BpfLoader;

    let loader = BpfLoader::load(&agent.config().bpf, agent.reader_stats())
        .context("loading BPF programs")?;

    let attach = loader.attachment_stats();
    let health = agent.health();
    health
        .bpf_programs_attached
        .with_label_values(&["kprobe"])
        .set(f64::from(attach.kprobes_attached));
    health
        .bpf_programs_attached
        .with_label_values(&["kretprobe"])
        .set(f64::from(attach.kretprobes_attached));
    health
        .bpf_programs_failed
        .with_label_values(&["kprobe"])
        .set(f64::from(attach.kprobes_failed));
    health
        .bpf_programs_failed
        .with_label_values(&["kretprobe"])
        .set(f64::from(attach.kretprobes_failed));

    agent.start(Arc::new(loader)).await
}

#[cfg(not(feature = "bpf"))]
async fn start_agent(_agent: &mut agent::Agent) -> Result<()> {
    anyhow::bail!("socktrace was built without the `bpf` feature; no kernel event loader available")
}
