//! Background expiration sweep.
//!
//! Two independent periods drive one thread:
//! - **fast** (minutes): `delete_expired`, audit retention, store flush and,
//!   when a path is configured, audit export
//! - **slow** (hour-scale): `delete_expired` only, as a backstop for records
//!   no lookup has touched
//!
//! Each step runs regardless of the others; a failing store never holds up
//! audit retention. Failures are collected on the [`SweepResult`].
//!
//! Lazy expiry on lookup and claim already hides stale records; the sweep
//! only reclaims their memory. Stopping wakes the thread at once and
//! [`ExpirationSweeper::stop_and_flush`] runs one last synchronous pass.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use parcel_common::bg_supervisor::{BgTaskSupervisor, TaskCriticality, TaskState};
use parcel_common::clock::Clock;
use parcel_common::config::SweeperConfig;
use parcel_common::error::StorageError;
use parcel_common::shutdown::ShutdownSignal;

use crate::audit::{AuditLog, PruneReport};
use crate::repository::ItemRepository;

pub const SWEEPER_TASK: &str = "expiry-sweeper";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepKind {
    Fast,
    Slow,
    /// The last pass at shutdown; same work as `Fast`.
    Final,
}

impl SweepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SweepKind::Fast => "fast",
            SweepKind::Slow => "slow",
            SweepKind::Final => "final",
        }
    }

    fn prunes_and_flushes(&self) -> bool {
        !matches!(self, SweepKind::Slow)
    }
}

/// A step of a pass that can fail on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepStep {
    DeleteExpired,
    Flush,
    AuditExport,
}

impl SweepStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            SweepStep::DeleteExpired => "delete_expired",
            SweepStep::Flush => "flush",
            SweepStep::AuditExport => "audit_export",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepFailure {
    pub step: SweepStep,
    pub error: String,
}

impl StepFailure {
    fn new(step: SweepStep, err: &StorageError) -> Self {
        Self {
            step,
            error: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepResult {
    pub kind: SweepKind,
    pub expired_removed: usize,
    pub audit: PruneReport,
    pub flushed: bool,
    /// Records written by the audit export, when one ran and succeeded.
    pub audit_exported: Option<usize>,
    pub failures: Vec<StepFailure>,
    pub duration_us: u64,
}

impl SweepResult {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// `step: error` pairs joined with `; `.
    pub fn failure_summary(&self) -> String {
        self.failures
            .iter()
            .map(|f| format!("{}: {}", f.step.as_str(), f.error))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Tick periods, resolved from [`SweeperConfig`].
#[derive(Debug, Clone, Copy)]
pub struct SweepSchedule {
    pub fast: Duration,
    pub slow: Duration,
}

impl SweepSchedule {
    pub fn from_config(config: &SweeperConfig) -> Self {
        Self {
            fast: Duration::from_secs(config.fast_interval_secs.max(1)),
            slow: Duration::from_secs(config.slow_interval_secs.max(1)),
        }
    }
}

/// Cumulative counters, lock-free.
#[derive(Debug, Default)]
pub struct SweepStats {
    pub fast_sweeps: AtomicU64,
    pub slow_sweeps: AtomicU64,
    pub expired_removed: AtomicU64,
    pub audit_records_pruned: AtomicU64,
    pub counters_pruned: AtomicU64,
    pub failures: AtomicU64,
    pub last_sweep_duration_us: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepStatsSnapshot {
    pub fast_sweeps: u64,
    pub slow_sweeps: u64,
    pub expired_removed: u64,
    pub audit_records_pruned: u64,
    pub counters_pruned: u64,
    pub failures: u64,
    pub last_sweep_duration_us: u64,
}

impl SweepStats {
    fn record(&self, r: &SweepResult) {
        match r.kind {
            SweepKind::Slow => self.slow_sweeps.fetch_add(1, Ordering::Relaxed),
            SweepKind::Fast | SweepKind::Final => self.fast_sweeps.fetch_add(1, Ordering::Relaxed),
        };
        self.expired_removed
            .fetch_add(r.expired_removed as u64, Ordering::Relaxed);
        self.audit_records_pruned
            .fetch_add(r.audit.records_removed as u64, Ordering::Relaxed);
        self.counters_pruned.fetch_add(
            (r.audit.code_counters_removed + r.audit.user_counters_removed) as u64,
            Ordering::Relaxed,
        );
        self.failures
            .fetch_add(r.failures.len() as u64, Ordering::Relaxed);
        self.last_sweep_duration_us
            .store(r.duration_us, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SweepStatsSnapshot {
        SweepStatsSnapshot {
            fast_sweeps: self.fast_sweeps.load(Ordering::Relaxed),
            slow_sweeps: self.slow_sweeps.load(Ordering::Relaxed),
            expired_removed: self.expired_removed.load(Ordering::Relaxed),
            audit_records_pruned: self.audit_records_pruned.load(Ordering::Relaxed),
            counters_pruned: self.counters_pruned.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            last_sweep_duration_us: self.last_sweep_duration_us.load(Ordering::Relaxed),
        }
    }
}

/// Store, audit log and clock shared by the sweep thread and the caller.
#[derive(Clone)]
struct SweepTargets {
    store: Arc<dyn ItemRepository>,
    audit: Arc<dyn AuditLog>,
    clock: Arc<dyn Clock>,
    audit_export: Option<PathBuf>,
    stats: Arc<SweepStats>,
}

impl SweepTargets {
    fn run(&self, kind: SweepKind) -> SweepResult {
        let start = Instant::now();
        let mut failures = Vec::new();

        let expired_removed = match self.store.delete_expired() {
            Ok(n) => n,
            Err(e) => {
                failures.push(StepFailure::new(SweepStep::DeleteExpired, &e));
                0
            }
        };

        let mut audit = PruneReport::default();
        let mut flushed = false;
        let mut audit_exported = None;
        if kind.prunes_and_flushes() {
            audit = self.audit.prune(self.clock.now());
            match self.store.flush() {
                Ok(()) => flushed = true,
                Err(e) => failures.push(StepFailure::new(SweepStep::Flush, &e)),
            }
            if let Some(path) = &self.audit_export {
                match self.audit.export_json(path) {
                    Ok(n) => audit_exported = Some(n),
                    Err(e) => failures.push(StepFailure::new(SweepStep::AuditExport, &e)),
                }
            }
        }

        let result = SweepResult {
            kind,
            expired_removed,
            audit,
            flushed,
            audit_exported,
            failures,
            duration_us: start.elapsed().as_micros() as u64,
        };
        self.stats.record(&result);
        parcel_observability::record_sweep(kind.as_str(), result.expired_removed, result.duration_us);
        if result.expired_removed > 0 {
            tracing::debug!(
                kind = kind.as_str(),
                removed = result.expired_removed,
                duration_us = result.duration_us,
                "expired items swept"
            );
        }
        for f in &result.failures {
            tracing::warn!(
                kind = kind.as_str(),
                step = f.step.as_str(),
                error = %f.error,
                "expiration sweep step failed"
            );
        }
        result
    }
}

/// Owns the sweep thread. Dropping it stops the thread without a final pass.
pub struct ExpirationSweeper {
    signal: ShutdownSignal,
    handle: Option<std::thread::JoinHandle<()>>,
    targets: SweepTargets,
}

impl ExpirationSweeper {
    /// Spawn the sweep thread. The first pass of each kind runs one full
    /// period after start.
    ///
    /// `audit_export`, when set, is rewritten on every fast and final pass.
    ///
    /// Returns `Err` if the thread cannot be spawned. Expired records are
    /// then only reclaimed lazily.
    pub fn start(
        store: Arc<dyn ItemRepository>,
        audit: Arc<dyn AuditLog>,
        clock: Arc<dyn Clock>,
        schedule: SweepSchedule,
        audit_export: Option<PathBuf>,
        supervisor: Option<Arc<BgTaskSupervisor>>,
    ) -> Result<Self, std::io::Error> {
        let targets = SweepTargets {
            store,
            audit,
            clock,
            audit_export,
            stats: Arc::new(SweepStats::default()),
        };
        let signal = ShutdownSignal::new();
        let signal_clone = signal.clone();
        let worker = targets.clone();
        if let Some(sv) = &supervisor {
            sv.register(SWEEPER_TASK, "expiration", TaskCriticality::Critical);
        }
        let sv_thread = supervisor.clone();

        let handle = std::thread::Builder::new()
            .name("parcel-sweeper".into())
            .spawn(move || {
                tracing::info!(
                    fast_secs = schedule.fast.as_secs_f64(),
                    slow_secs = schedule.slow.as_secs_f64(),
                    backend = worker.store.backend_name(),
                    "expiration sweeper started"
                );
                if let Some(sv) = &sv_thread {
                    sv.report_running(SWEEPER_TASK);
                }
                let mut next_fast = Instant::now() + schedule.fast;
                let mut next_slow = Instant::now() + schedule.slow;

                while !signal_clone.is_shutdown() {
                    let wake = next_fast.min(next_slow);
                    let wait = wake.saturating_duration_since(Instant::now());
                    if signal_clone.wait_timeout(wait) {
                        break;
                    }
                    let now = Instant::now();
                    let mut due = Vec::with_capacity(2);
                    if now >= next_fast {
                        due.push(SweepKind::Fast);
                        next_fast = now + schedule.fast;
                    }
                    if now >= next_slow {
                        due.push(SweepKind::Slow);
                        next_slow = now + schedule.slow;
                    }
                    for kind in due {
                        let res = worker.run(kind);
                        if let Some(sv) = &sv_thread {
                            report(sv, &res);
                        }
                    }
                }
                if let Some(sv) = &sv_thread {
                    sv.report_stopped(SWEEPER_TASK);
                }
                tracing::info!("expiration sweeper stopped");
            })
            .map_err(|e| {
                tracing::error!(
                    component = SWEEPER_TASK,
                    error = %e,
                    "failed to spawn expiration sweeper thread"
                );
                if let Some(sv) = &supervisor {
                    sv.report_failed(SWEEPER_TASK, &e.to_string());
                }
                e
            })?;

        Ok(Self {
            signal,
            handle: Some(handle),
            targets,
        })
    }

    /// Wake and join the sweep thread.
    pub fn stop(&mut self) {
        self.signal.shutdown();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }

    /// Stop, then run one final sweep + flush on the calling thread.
    pub fn stop_and_flush(&mut self) -> SweepResult {
        self.stop();
        self.targets.run(SweepKind::Final)
    }

    pub fn stats(&self) -> SweepStatsSnapshot {
        self.targets.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

fn report(sv: &BgTaskSupervisor, res: &SweepResult) {
    if res.is_clean() {
        if sv.task_state(SWEEPER_TASK) == Some(TaskState::Failed) {
            sv.report_running(SWEEPER_TASK);
        }
        sv.report_tick(SWEEPER_TASK);
    } else {
        sv.report_failed(SWEEPER_TASK, &res.failure_summary());
    }
}

impl Drop for ExpirationSweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use parcel_common::audit::ClientMeta;
    use parcel_common::clock::ManualClock;
    use parcel_common::config::AuditConfig;
    use parcel_common::item::{format_item_id, ClaimOutcome, Item, PickupCode};

    use crate::audit::InMemoryAuditLog;
    use crate::memory::MemoryTracker;
    use crate::memstore::InMemoryItemStore;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 8, 1, 0, 0, 0).unwrap()
    }

    fn item(code: &str, created: DateTime<Utc>) -> Item {
        Item {
            id: format_item_id(created, "A"),
            name: "Potion".into(),
            description: String::new(),
            type_id: 3,
            quantity: 5,
            durability: None,
            sharer_id: "A".into(),
            pickup_code: PickupCode::new(code),
            created_at: created,
            expires_at: created + ChronoDuration::hours(24),
            claimed: false,
            claimer_id: None,
        }
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<InMemoryItemStore>,
        audit: Arc<InMemoryAuditLog>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(t0()));
        let tracker = Arc::new(MemoryTracker::new());
        let store = Arc::new(InMemoryItemStore::new(clock.clone(), tracker.clone()));
        let audit = Arc::new(InMemoryAuditLog::new(
            AuditConfig::default(),
            clock.clone(),
            tracker,
        ));
        Fixture { clock, store, audit }
    }

    fn start(f: &Fixture, fast_ms: u64, slow_ms: u64, sv: Option<Arc<BgTaskSupervisor>>) -> ExpirationSweeper {
        ExpirationSweeper::start(
            f.store.clone(),
            f.audit.clone(),
            f.clock.clone(),
            SweepSchedule {
                fast: Duration::from_millis(fast_ms),
                slow: Duration::from_millis(slow_ms),
            },
            None,
            sv,
        )
        .unwrap()
    }

    #[test]
    fn test_stop_is_prompt() {
        let f = fixture();
        let mut sweeper = start(&f, 300_000, 3_600_000, None);
        assert!(sweeper.is_running());
        let begin = Instant::now();
        sweeper.stop();
        assert!(begin.elapsed() < Duration::from_secs(2));
        assert!(!sweeper.is_running());
    }

    #[test]
    fn test_fast_tick_removes_expired_and_prunes() {
        let f = fixture();
        f.store.create(item("111111", t0())).unwrap();
        f.store.create(item("222222", t0() + ChronoDuration::hours(12))).unwrap();
        f.audit.log_invalid_code("prober", "999999", &ClientMeta::default());
        f.clock.advance(ChronoDuration::days(8));
        f.store.create(item("333333", f.clock.now())).unwrap();

        let sv = Arc::new(BgTaskSupervisor::new());
        let mut sweeper = start(&f, 20, 3_600_000, Some(sv.clone()));
        let deadline = Instant::now() + Duration::from_secs(3);
        while sweeper.stats().fast_sweeps == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        sweeper.stop();

        let stats = sweeper.stats();
        assert!(stats.fast_sweeps >= 1);
        assert_eq!(stats.expired_removed, 2);
        assert_eq!(f.store.total_count().unwrap(), 1);
        assert_eq!(f.audit.code_attempts("999999"), 0);
        assert_eq!(sv.task_state(SWEEPER_TASK), Some(TaskState::Stopped));
    }

    #[test]
    fn test_slow_tick_only_sweeps() {
        let f = fixture();
        f.store.create(item("111111", t0())).unwrap();
        f.audit.log_invalid_code("prober", "999999", &ClientMeta::default());
        f.clock.advance(ChronoDuration::days(8));

        let mut sweeper = start(&f, 3_600_000, 20, None);
        let deadline = Instant::now() + Duration::from_secs(3);
        while sweeper.stats().slow_sweeps == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        sweeper.stop();
        assert!(sweeper.stats().slow_sweeps >= 1);
        assert_eq!(sweeper.stats().fast_sweeps, 0);
        assert_eq!(f.store.total_count().unwrap(), 0);
        // Counter pruning belongs to the fast period.
        assert_eq!(f.audit.code_attempts("999999"), 1);
    }

    #[test]
    fn test_stop_and_flush_runs_final_pass() {
        let f = fixture();
        f.store.create(item("111111", t0())).unwrap();
        f.store.create(item("222222", t0())).unwrap();
        assert!(matches!(
            f.store.claim(&PickupCode::new("222222"), "B").unwrap(),
            ClaimOutcome::Claimed(_)
        ));
        let mut sweeper = start(&f, 300_000, 3_600_000, None);
        f.clock.advance(ChronoDuration::hours(24));

        let res = sweeper.stop_and_flush();
        assert!(res.is_clean());
        assert_eq!(res.kind, SweepKind::Final);
        assert_eq!(res.expired_removed, 2, "expiry instant itself is sweepable");
        assert!(res.flushed);
        assert_eq!(f.store.total_count().unwrap(), 0);
        assert_eq!(sweeper.stats().fast_sweeps, 1);
    }

    /// Memory store whose delete or flush can be made to fail.
    struct FaultyStore {
        inner: InMemoryItemStore,
        fail_delete: bool,
        fail_flush: bool,
    }

    fn io_fault() -> StorageError {
        StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk gone"))
    }

    impl ItemRepository for FaultyStore {
        fn create(&self, item: Item) -> Result<(), StorageError> {
            self.inner.create(item)
        }
        fn lookup(&self, code: &PickupCode) -> Result<Option<Item>, StorageError> {
            self.inner.lookup(code)
        }
        fn claim(&self, code: &PickupCode, claimer_id: &str) -> Result<ClaimOutcome, StorageError> {
            self.inner.claim(code, claimer_id)
        }
        fn delete_expired(&self) -> Result<usize, StorageError> {
            if self.fail_delete {
                return Err(io_fault());
            }
            self.inner.delete_expired()
        }
        fn list_live(&self) -> Result<Vec<Item>, StorageError> {
            self.inner.list_live()
        }
        fn total_count(&self) -> Result<usize, StorageError> {
            self.inner.total_count()
        }
        fn claimed_count(&self) -> Result<usize, StorageError> {
            self.inner.claimed_count()
        }
        fn count_created_between(
            &self,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> Result<usize, StorageError> {
            self.inner.count_created_between(start, end)
        }
        fn flush(&self) -> Result<(), StorageError> {
            if self.fail_flush {
                return Err(io_fault());
            }
            Ok(())
        }
        fn backend_name(&self) -> &'static str {
            "faulty"
        }
    }

    fn faulty_targets(f: &Fixture, fail_delete: bool, fail_flush: bool) -> SweepTargets {
        SweepTargets {
            store: Arc::new(FaultyStore {
                inner: InMemoryItemStore::new(f.clock.clone(), Arc::new(MemoryTracker::new())),
                fail_delete,
                fail_flush,
            }),
            audit: f.audit.clone(),
            clock: f.clock.clone(),
            audit_export: None,
            stats: Arc::new(SweepStats::default()),
        }
    }

    #[test]
    fn test_failed_delete_still_prunes_and_flushes() {
        let f = fixture();
        f.audit.log_invalid_code("prober", "999999", &ClientMeta::default());
        f.clock.advance(ChronoDuration::days(8));
        let targets = faulty_targets(&f, true, false);

        let res = targets.run(SweepKind::Fast);
        assert!(!res.is_clean());
        assert_eq!(res.failures.len(), 1);
        assert_eq!(res.failures[0].step, SweepStep::DeleteExpired);
        assert!(res.failure_summary().starts_with("delete_expired: "));
        assert_eq!(res.audit.code_counters_removed, 1);
        assert!(res.flushed);
        assert_eq!(f.audit.code_attempts("999999"), 0);

        let stats = targets.stats.snapshot();
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.fast_sweeps, 1);
    }

    #[test]
    fn test_failed_flush_keeps_removed_count() {
        let f = fixture();
        let targets = faulty_targets(&f, false, true);
        targets.store.create(item("111111", t0())).unwrap();
        f.clock.advance(ChronoDuration::hours(25));

        let res = targets.run(SweepKind::Fast);
        assert_eq!(res.expired_removed, 1);
        assert!(!res.flushed);
        assert_eq!(res.failures[0].step, SweepStep::Flush);
        assert_eq!(targets.stats.snapshot().expired_removed, 1);
    }

    #[test]
    fn test_failed_pass_marks_task_failed_then_recovers() {
        let f = fixture();
        let sv = Arc::new(BgTaskSupervisor::new());
        sv.register(SWEEPER_TASK, "expiration", TaskCriticality::Critical);
        sv.report_running(SWEEPER_TASK);

        report(&sv, &faulty_targets(&f, true, false).run(SweepKind::Slow));
        assert_eq!(sv.task_state(SWEEPER_TASK), Some(TaskState::Failed));
        report(&sv, &faulty_targets(&f, false, false).run(SweepKind::Slow));
        assert_eq!(sv.task_state(SWEEPER_TASK), Some(TaskState::Running));
    }

    #[test]
    fn test_fast_and_final_passes_export_audit() {
        let f = fixture();
        f.audit.log_share("A", "123456", "item", &ClientMeta::default());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit_log.json");
        let mut targets = faulty_targets(&f, false, false);
        targets.audit_export = Some(path.clone());

        let slow = targets.run(SweepKind::Slow);
        assert_eq!(slow.audit_exported, None);
        assert!(!path.exists());

        let fast = targets.run(SweepKind::Fast);
        assert_eq!(fast.audit_exported, Some(1));
        assert!(path.exists());

        f.audit.log_duplicate_code("B", "123456", &ClientMeta::default());
        let mut sweeper = ExpirationSweeper::start(
            f.store.clone(),
            f.audit.clone(),
            f.clock.clone(),
            SweepSchedule {
                fast: Duration::from_secs(300),
                slow: Duration::from_secs(3600),
            },
            Some(path.clone()),
            None,
        )
        .unwrap();
        let last = sweeper.stop_and_flush();
        assert_eq!(last.audit_exported, Some(2));
        let exported: Vec<serde_json::Value> =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(exported.len(), 2);
    }

    #[test]
    fn test_schedule_from_config() {
        let s = SweepSchedule::from_config(&SweeperConfig::default());
        assert_eq!(s.fast, Duration::from_secs(300));
        assert_eq!(s.slow, Duration::from_secs(3600));
    }
}
