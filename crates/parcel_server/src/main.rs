mod health;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use parcel_common::bg_supervisor::BgTaskSupervisor;
use parcel_common::clock::{Clock, SystemClock};
use parcel_common::config::{ParcelConfig, StorageBackend};
use parcel_store::admission::{usage_source_for, AdmissionController, AdmissionSampler};
use parcel_store::audit::{AuditLog, InMemoryAuditLog};
use parcel_store::codegen::CodeGenerator;
use parcel_store::memory::MemoryTracker;
use parcel_store::repository::ItemRepository;
use parcel_store::service::ParcelService;
use parcel_store::sweeper::{ExpirationSweeper, SweepSchedule};

#[derive(Parser, Debug)]
#[command(name = "parcel", about = "Parcel: pickup-code item redemption store")]
struct Cli {
    /// Config file path.
    #[arg(short, long, default_value = "parcel.toml")]
    config: String,

    /// Admin HTTP listen address (overrides config).
    #[arg(long)]
    admin_addr: Option<String>,

    /// Prometheus exporter listen address (overrides config).
    #[arg(long)]
    metrics_addr: Option<String>,

    /// Storage backend: memory or snapshot (overrides config).
    #[arg(long, value_parser = parse_backend)]
    backend: Option<StorageBackend>,

    /// Snapshot file path (overrides config).
    #[arg(long)]
    snapshot_path: Option<String>,

    /// Memory ceiling in bytes for the admission gate; 0 disables it.
    #[arg(long)]
    memory_ceiling_bytes: Option<u64>,

    /// Item lifetime in seconds (overrides config).
    #[arg(long)]
    ttl_secs: Option<u64>,

    /// Print the default configuration as TOML and exit.
    #[arg(long)]
    print_default_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.print_default_config {
        let toml_str = toml::to_string_pretty(&ParcelConfig::default())
            .unwrap_or_else(|e| format!("# failed to serialize default config: {}", e));
        println!("{}", toml_str);
        return Ok(());
    }

    parcel_observability::init_tracing();
    tracing::info!("Starting parcel...");

    let mut config = load_config(&cli.config);
    apply_overrides(&mut config, &cli);
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {}", e))?;
    tracing::info!("Config: {:?}", config);

    if !config.server.metrics_listen_addr.is_empty() {
        if let Err(e) = parcel_observability::init_metrics(&config.server.metrics_listen_addr) {
            tracing::warn!("Failed to initialize metrics: {}", e);
        }
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let tracker = Arc::new(MemoryTracker::new());
    let supervisor = Arc::new(BgTaskSupervisor::new());

    let store = parcel_store::open_store(&config.storage, clock.clone(), tracker.clone())
        .context("failed to open item store")?;
    let audit = Arc::new(InMemoryAuditLog::new(
        config.audit.clone(),
        clock.clone(),
        tracker.clone(),
    ));
    let admission = Arc::new(AdmissionController::new(
        config.admission.clone(),
        usage_source_for(config.admission.usage_source, tracker.clone()),
    ));
    if !config.admission.is_enabled() {
        tracing::info!("Admission control disabled (memory_ceiling_bytes = 0)");
    }

    let mut sampler = AdmissionSampler::start(
        admission.clone(),
        Duration::from_millis(config.admission.sample_interval_ms.max(1)),
        Some(supervisor.clone()),
    )
    .context("failed to start admission sampler")?;

    let audit_export = Some(&config.audit.export_path)
        .filter(|p| !p.is_empty())
        .map(PathBuf::from);
    let sweeper = if config.sweeper.enabled {
        Some(
            ExpirationSweeper::start(
                store.clone(),
                audit.clone(),
                clock.clone(),
                SweepSchedule::from_config(&config.sweeper),
                audit_export,
                Some(supervisor.clone()),
            )
            .context("failed to start expiration sweeper")?,
        )
    } else {
        tracing::warn!("Expiration sweeper disabled; expired items are only removed on access");
        None
    };

    let service = Arc::new(ParcelService::new(
        store.clone(),
        audit.clone(),
        admission,
        Arc::new(CodeGenerator::new(config.item.code_length)),
        clock,
        config.item.clone(),
    ));

    let (shutdown_tx, _) = tokio::sync::watch::channel(false);

    let health_state = Arc::new(health::HealthState::new(
        service,
        supervisor,
        tracker,
    ));
    let health_addr = config.server.admin_listen_addr.clone();
    let mut health_rx = shutdown_tx.subscribe();
    let health_state_for_server = health_state.clone();
    let health_task = tokio::spawn(async move {
        health::run_health_server(
            &health_addr,
            health_state_for_server,
            async move { let _ = health_rx.changed().await; },
        )
        .await;
    });

    let shutdown_reason = wait_for_shutdown_signal().await;
    tracing::info!("{}, initiating graceful shutdown", shutdown_reason);
    health_state.set_ready(false);
    sampler.stop();

    let drain_timeout = Duration::from_secs(config.server.shutdown_drain_timeout_secs.max(1));
    let export_path = config.audit.export_path.clone();
    let outcome = run_drain(drain_timeout, move || {
        drain_state(sweeper, store, audit.as_ref(), &export_path)
    })
    .await;

    let _ = shutdown_tx.send(true);
    let _ = health_task.await;
    if outcome == DrainOutcome::TimedOut {
        // Returning would drop the runtime, which joins the drain thread.
        tracing::warn!("parcel exiting with the final flush still running");
        std::process::exit(1);
    }
    tracing::info!("parcel stopped");
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainOutcome {
    Completed,
    Failed,
    TimedOut,
}

/// Run `drain` on the blocking pool, giving up on it after `timeout`.
async fn run_drain<F>(timeout: Duration, drain: F) -> DrainOutcome
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(drain)).await {
        Ok(Ok(Ok(()))) => {
            tracing::info!("Final sweep and flush complete");
            DrainOutcome::Completed
        }
        Ok(Ok(Err(e))) => {
            tracing::error!("Final flush failed: {:#}", e);
            DrainOutcome::Failed
        }
        Ok(Err(e)) => {
            tracing::error!("Final flush task panicked: {}", e);
            DrainOutcome::Failed
        }
        Err(_) => {
            tracing::error!(
                "Final flush did not finish within {}s, abandoning it",
                timeout.as_secs()
            );
            DrainOutcome::TimedOut
        }
    }
}

/// Stop the sweeper and persist what is left. With a sweeper, its final
/// pass sweeps, flushes and exports the audit trail; without one each of
/// those steps runs here, every step attempted even if an earlier one fails.
fn drain_state(
    sweeper: Option<ExpirationSweeper>,
    store: Arc<dyn ItemRepository>,
    audit: &dyn AuditLog,
    export_path: &str,
) -> Result<()> {
    if let Some(mut sweeper) = sweeper {
        let result = sweeper.stop_and_flush();
        tracing::info!(
            removed = result.expired_removed,
            audit_removed = result.audit.records_removed,
            flushed = result.flushed,
            exported = result.audit_exported.unwrap_or(0),
            "final sweep done"
        );
        if !result.is_clean() {
            anyhow::bail!("final sweep: {}", result.failure_summary());
        }
        return Ok(());
    }

    let mut failures = Vec::new();
    if let Err(e) = store.delete_expired() {
        failures.push(format!("expiry pass: {e}"));
    }
    if let Err(e) = store.flush() {
        failures.push(format!("flush: {e}"));
    }
    if !export_path.is_empty() {
        match audit.export_json(Path::new(export_path)) {
            Ok(written) => {
                tracing::info!(records = written, path = export_path, "audit log exported")
            }
            Err(e) => failures.push(format!("audit export to {export_path}: {e}")),
        }
    }
    if !failures.is_empty() {
        anyhow::bail!("final drain: {}", failures.join("; "));
    }
    Ok(())
}

fn apply_overrides(config: &mut ParcelConfig, cli: &Cli) {
    if let Some(ref addr) = cli.admin_addr {
        config.server.admin_listen_addr = addr.clone();
    }
    if let Some(ref addr) = cli.metrics_addr {
        config.server.metrics_listen_addr = addr.clone();
    }
    if let Some(backend) = cli.backend {
        config.storage.backend = backend;
    }
    if let Some(ref path) = cli.snapshot_path {
        config.storage.snapshot_path = path.clone();
    }
    if let Some(bytes) = cli.memory_ceiling_bytes {
        config.admission.memory_ceiling_bytes = bytes;
    }
    if let Some(ttl) = cli.ttl_secs {
        config.item.ttl_secs = ttl;
    }
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM, returning a description of which signal fired.
async fn wait_for_shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => "SIGINT (Ctrl+C) received",
                    _ = sigterm.recv() => "SIGTERM received",
                }
            }
            Err(e) => {
                tracing::warn!("Failed to register SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                "SIGINT (Ctrl+C) received"
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "SIGINT (Ctrl+C) received"
    }
}

fn parse_backend(s: &str) -> Result<StorageBackend, String> {
    match s.to_lowercase().as_str() {
        "memory" => Ok(StorageBackend::Memory),
        "snapshot" => Ok(StorageBackend::Snapshot),
        _ => Err(format!("Invalid backend '{}': expected memory or snapshot", s)),
    }
}

fn load_config(path: &str) -> ParcelConfig {
    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!("Loaded config from {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("Failed to parse config {}: {}, using defaults", path, e);
                ParcelConfig::default()
            }
        },
        Err(_) => {
            tracing::info!("Config file {} not found, using defaults", path);
            ParcelConfig::default()
        }
    }
}
