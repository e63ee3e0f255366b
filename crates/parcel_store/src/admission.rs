//! Memory-pressure write gate.
//!
//! `sample()` compares current usage against the configured ceiling and
//! moves the gate with hysteresis:
//! - open → closed once usage / ceiling ≥ `disable_threshold`
//! - closed → open only once usage / ceiling ≤ `enable_threshold`
//!
//! Between the two thresholds the gate keeps its previous position, so
//! usage hovering near one threshold cannot make it flap. Shares consult
//! the gate before touching the store; claims never do.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;

use parcel_common::bg_supervisor::{BgTaskSupervisor, TaskCriticality};
use parcel_common::config::{AdmissionConfig, UsageSourceKind};
use parcel_common::error::{ParcelError, ParcelResult};
use parcel_common::shutdown::ShutdownSignal;

use crate::memory::MemoryTracker;

/// Supplies the usage figure the gate is judged on.
pub trait UsageSource: Send + Sync {
    fn usage_bytes(&self) -> u64;
    fn name(&self) -> &'static str;
}

/// Bytes accounted by the store and audit log.
pub struct TrackedUsage {
    tracker: Arc<MemoryTracker>,
}

impl TrackedUsage {
    pub fn new(tracker: Arc<MemoryTracker>) -> Self {
        Self { tracker }
    }
}

impl UsageSource for TrackedUsage {
    fn usage_bytes(&self) -> u64 {
        self.tracker.total_bytes()
    }

    fn name(&self) -> &'static str {
        "tracked"
    }
}

/// Resident set size of this process, the `VmRSS` line of
/// `/proc/self/status`. The kernel reports it in kB, so the figure does not
/// depend on page size. Falls back to tracked usage where procfs is
/// unavailable.
pub struct ProcessRssUsage {
    status_path: PathBuf,
    fallback: TrackedUsage,
    warned: AtomicBool,
}

const STATUS_PATH: &str = "/proc/self/status";

impl ProcessRssUsage {
    pub fn new(tracker: Arc<MemoryTracker>) -> Self {
        Self::with_path(STATUS_PATH, tracker)
    }

    pub fn with_path(path: impl Into<PathBuf>, tracker: Arc<MemoryTracker>) -> Self {
        Self {
            status_path: path.into(),
            fallback: TrackedUsage::new(tracker),
            warned: AtomicBool::new(false),
        }
    }

    fn read_rss(&self) -> Option<u64> {
        let text = std::fs::read_to_string(&self.status_path).ok()?;
        parse_vm_rss_kib(&text).map(|kib| kib * 1024)
    }
}

/// `VmRSS:   12345 kB` → 12345.
fn parse_vm_rss_kib(text: &str) -> Option<u64> {
    text.lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|value| value.split_whitespace().next())
        .and_then(|n| n.parse().ok())
}

impl UsageSource for ProcessRssUsage {
    fn usage_bytes(&self) -> u64 {
        match self.read_rss() {
            Some(bytes) => bytes,
            None => {
                if !self.warned.swap(true, Ordering::Relaxed) {
                    tracing::warn!(
                        path = %self.status_path.display(),
                        "process RSS unavailable, falling back to tracked usage"
                    );
                }
                self.fallback.usage_bytes()
            }
        }
    }

    fn name(&self) -> &'static str {
        "process"
    }
}

/// Build the usage source selected by configuration.
pub fn usage_source_for(
    kind: UsageSourceKind,
    tracker: Arc<MemoryTracker>,
) -> Arc<dyn UsageSource> {
    match kind {
        UsageSourceKind::Tracked => Arc::new(TrackedUsage::new(tracker)),
        UsageSourceKind::Process => Arc::new(ProcessRssUsage::new(tracker)),
    }
}

/// Gate status as reported to callers and the admin endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AdmissionStatus {
    pub usage_bytes: u64,
    pub ceiling_bytes: u64,
    pub ratio: f64,
    pub percentage: f64,
    pub disabled: bool,
    pub rejected_writes: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct GateState {
    usage_bytes: u64,
    ratio: f64,
    disabled: bool,
}

pub struct AdmissionController {
    config: AdmissionConfig,
    source: Arc<dyn UsageSource>,
    gate: RwLock<GateState>,
    rejected_writes: AtomicU64,
    transitions: AtomicU64,
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let gate = *self.gate.read();
        f.debug_struct("AdmissionController")
            .field("source", &self.source.name())
            .field("ceiling_bytes", &self.config.memory_ceiling_bytes)
            .field("disabled", &gate.disabled)
            .field("ratio", &gate.ratio)
            .finish()
    }
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig, source: Arc<dyn UsageSource>) -> Self {
        Self {
            config,
            source,
            gate: RwLock::new(GateState::default()),
            rejected_writes: AtomicU64::new(0),
            transitions: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// Re-read usage and move the gate. The only writer of gate state.
    pub fn sample(&self) -> AdmissionStatus {
        let usage = self.source.usage_bytes();
        let ceiling = self.config.memory_ceiling_bytes;

        let mut gate = self.gate.write();
        let was_disabled = gate.disabled;
        let ratio = if ceiling == 0 {
            0.0
        } else {
            usage as f64 / ceiling as f64
        };
        let disabled = if ceiling == 0 {
            false
        } else if !was_disabled && ratio >= self.config.disable_threshold {
            true
        } else if was_disabled && ratio <= self.config.enable_threshold {
            false
        } else {
            was_disabled
        };
        *gate = GateState {
            usage_bytes: usage,
            ratio,
            disabled,
        };
        drop(gate);

        if disabled != was_disabled {
            self.transitions.fetch_add(1, Ordering::Relaxed);
            if disabled {
                tracing::warn!(
                    usage_bytes = usage,
                    ceiling_bytes = ceiling,
                    ratio,
                    threshold = self.config.disable_threshold,
                    "admission gate closed: new shares rejected"
                );
            } else {
                tracing::info!(
                    usage_bytes = usage,
                    ceiling_bytes = ceiling,
                    ratio,
                    threshold = self.config.enable_threshold,
                    "admission gate reopened"
                );
            }
        }
        parcel_observability::record_admission_sample(usage, ratio, disabled);
        self.status()
    }

    pub fn is_writes_disabled(&self) -> bool {
        self.gate.read().disabled
    }

    /// Gate check for a write path. Counts the rejection when closed.
    pub fn check_write(&self) -> ParcelResult<()> {
        let gate = *self.gate.read();
        if !gate.disabled {
            return Ok(());
        }
        self.rejected_writes.fetch_add(1, Ordering::Relaxed);
        parcel_observability::record_admission_rejected();
        Err(ParcelError::resource_exhausted(
            format!(
                "memory usage at {:.1}% of {} bytes, shares paused",
                gate.ratio * 100.0,
                self.config.memory_ceiling_bytes
            ),
            self.config.retry_after_ms,
        ))
    }

    pub fn status(&self) -> AdmissionStatus {
        let gate = *self.gate.read();
        AdmissionStatus {
            usage_bytes: gate.usage_bytes,
            ceiling_bytes: self.config.memory_ceiling_bytes,
            ratio: gate.ratio,
            percentage: gate.ratio * 100.0,
            disabled: gate.disabled,
            rejected_writes: self.rejected_writes.load(Ordering::Relaxed),
        }
    }

    pub fn transitions(&self) -> u64 {
        self.transitions.load(Ordering::Relaxed)
    }
}

pub const SAMPLER_TASK: &str = "admission-sampler";

/// Background thread calling [`AdmissionController::sample`] on a fixed
/// period until stopped.
pub struct AdmissionSampler {
    signal: ShutdownSignal,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl AdmissionSampler {
    /// Take one sample immediately, then one per `interval`.
    ///
    /// Returns `Err` if the thread cannot be spawned; the gate then keeps
    /// its last sampled position.
    pub fn start(
        controller: Arc<AdmissionController>,
        interval: Duration,
        supervisor: Option<Arc<BgTaskSupervisor>>,
    ) -> Result<Self, std::io::Error> {
        let signal = ShutdownSignal::new();
        let signal_clone = signal.clone();
        if let Some(sv) = &supervisor {
            sv.register(SAMPLER_TASK, "memory-admission", TaskCriticality::BestEffort);
        }
        let sv_thread = supervisor.clone();

        let handle = std::thread::Builder::new()
            .name("parcel-admission".into())
            .spawn(move || {
                tracing::info!(
                    interval_ms = interval.as_millis() as u64,
                    source = controller.source.name(),
                    "admission sampler started"
                );
                if let Some(sv) = &sv_thread {
                    sv.report_running(SAMPLER_TASK);
                }
                loop {
                    controller.sample();
                    if let Some(sv) = &sv_thread {
                        sv.report_tick(SAMPLER_TASK);
                    }
                    if signal_clone.wait_timeout(interval) {
                        break;
                    }
                }
                if let Some(sv) = &sv_thread {
                    sv.report_stopped(SAMPLER_TASK);
                }
                tracing::info!("admission sampler stopped");
            })
            .map_err(|e| {
                tracing::error!(
                    component = SAMPLER_TASK,
                    error = %e,
                    "failed to spawn admission sampler thread"
                );
                if let Some(sv) = &supervisor {
                    sv.report_failed(SAMPLER_TASK, &e.to_string());
                }
                e
            })?;

        Ok(Self {
            signal,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.signal.shutdown();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for AdmissionSampler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Usage source the test sets directly.
    struct FixedUsage(AtomicU64);

    impl FixedUsage {
        fn set(&self, v: u64) {
            self.0.store(v, Ordering::Relaxed);
        }
    }

    impl UsageSource for FixedUsage {
        fn usage_bytes(&self) -> u64 {
            self.0.load(Ordering::Relaxed)
        }
        fn name(&self) -> &'static str {
            "fixed"
        }
    }

    fn controller(ceiling: u64) -> (Arc<FixedUsage>, AdmissionController) {
        let usage = Arc::new(FixedUsage(AtomicU64::new(0)));
        let cfg = AdmissionConfig {
            memory_ceiling_bytes: ceiling,
            retry_after_ms: 250,
            ..AdmissionConfig::default()
        };
        (usage.clone(), AdmissionController::new(cfg, usage))
    }

    #[test]
    fn test_hysteresis_trace() {
        let (usage, ctrl) = controller(100);
        assert!(!ctrl.is_writes_disabled());

        usage.set(85);
        assert!(ctrl.sample().disabled);
        usage.set(75);
        assert!(ctrl.sample().disabled, "0.75 is inside the band, gate stays closed");
        usage.set(65);
        assert!(!ctrl.sample().disabled);
        assert_eq!(ctrl.transitions(), 2);
    }

    #[test]
    fn test_band_keeps_open_gate_open() {
        let (usage, ctrl) = controller(100);
        usage.set(75);
        assert!(!ctrl.sample().disabled);
        usage.set(79);
        assert!(!ctrl.sample().disabled);
        usage.set(80);
        assert!(ctrl.sample().disabled, "threshold itself closes the gate");
        usage.set(70);
        assert!(!ctrl.sample().disabled, "enable threshold itself reopens");
    }

    #[test]
    fn test_check_write_rejects_when_closed() {
        let (usage, ctrl) = controller(1000);
        assert!(ctrl.check_write().is_ok());

        usage.set(950);
        ctrl.sample();
        let err = ctrl.check_write().unwrap_err();
        assert!(err.is_transient());
        assert_eq!(err.retry_after_ms(), 250);
        assert_eq!(err.status_code(), 503);
        assert_eq!(ctrl.status().rejected_writes, 1);
    }

    #[test]
    fn test_zero_ceiling_never_closes() {
        let (usage, ctrl) = controller(0);
        usage.set(u64::MAX / 2);
        let status = ctrl.sample();
        assert!(!status.disabled);
        assert_eq!(status.ratio, 0.0);
        assert!(ctrl.check_write().is_ok());
    }

    #[test]
    fn test_status_reports_last_sample() {
        let (usage, ctrl) = controller(200);
        usage.set(50);
        ctrl.sample();
        let st = ctrl.status();
        assert_eq!(st.usage_bytes, 50);
        assert_eq!(st.ceiling_bytes, 200);
        assert!((st.percentage - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_tracked_usage_reads_tracker() {
        let tracker = Arc::new(MemoryTracker::new());
        tracker.alloc_item(300);
        tracker.alloc_audit(200);
        let src = TrackedUsage::new(tracker);
        assert_eq!(src.usage_bytes(), 500);
    }

    #[test]
    fn test_vm_rss_parsing_and_fallback() {
        let status = "Name:\tparcel\nVmPeak:\t  9000 kB\nVmRSS:\t   512 kB\nThreads:\t4\n";
        assert_eq!(parse_vm_rss_kib(status), Some(512));
        assert_eq!(parse_vm_rss_kib("Name:\tparcel\n"), None);
        assert_eq!(parse_vm_rss_kib("VmRSS:\tlots kB\n"), None);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status");
        std::fs::write(&path, status).unwrap();
        let tracker = Arc::new(MemoryTracker::new());
        tracker.alloc_item(77);
        let src = ProcessRssUsage::with_path(&path, tracker.clone());
        assert_eq!(src.usage_bytes(), 512 * 1024);

        let missing = ProcessRssUsage::with_path(dir.path().join("nope"), tracker);
        assert_eq!(missing.usage_bytes(), 77);
    }

    #[test]
    fn test_sampler_samples_and_stops() {
        let (usage, ctrl) = controller(100);
        usage.set(90);
        let ctrl = Arc::new(ctrl);
        let sv = Arc::new(BgTaskSupervisor::new());
        let mut sampler =
            AdmissionSampler::start(ctrl.clone(), Duration::from_secs(60), Some(sv.clone()))
                .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !ctrl.is_writes_disabled() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(ctrl.is_writes_disabled());

        let start = std::time::Instant::now();
        sampler.stop();
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(!sampler.is_running());
        assert_eq!(
            sv.task_state(SAMPLER_TASK),
            Some(parcel_common::bg_supervisor::TaskState::Stopped)
        );
    }
}
