//! Audit trail and suspicious-activity detection for shares and claims.
//!
//! Every recorded event bumps an attempt counter for its pickup code and
//! for its actor. Claims on a code that already saw more than
//! `suspicious_attempt_threshold` attempts are escalated to `alert`; the
//! counter read and the increment happen under the same lock, so two racing
//! claims cannot both read a stale count.
//!
//! Retention is bounded twice: by count (above `capacity` the oldest records
//! are dropped down to `trim_to`) and by age through [`AuditLog::prune`],
//! which also expires idle attempt counters on a shorter horizon.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use parcel_common::audit::{
    AuditAction, AuditEvent, AuditLevel, AuditPage, AuditQuery, AuditRecord, ClientMeta,
};
use parcel_common::clock::Clock;
use parcel_common::config::AuditConfig;
use parcel_common::error::StorageError;

use crate::memory::MemoryTracker;

/// What a retention pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub records_removed: usize,
    pub code_counters_removed: usize,
    pub user_counters_removed: usize,
}

/// Append-only audit trail with attempt counters.
///
/// Implemented by [`InMemoryAuditLog`] or a test stub. The `log_*` helpers
/// fix severity, status and message for each kind of event.
pub trait AuditLog: Send + Sync {
    /// Append `event`, stamping the current time when it carries none.
    fn record(&self, event: AuditEvent) -> AuditRecord;

    /// Append a claim event, escalating it to a suspicious alert when its
    /// pickup code had already exceeded the attempt threshold.
    fn record_claim_attempt(&self, event: AuditEvent) -> AuditRecord;

    fn code_attempts(&self, code: &str) -> u64;

    fn user_attempts(&self, actor_id: &str) -> u64;

    /// Filtered page of records, newest first.
    fn query(&self, query: &AuditQuery) -> AuditPage;

    /// Drop records and counters past their retention horizon at `now`.
    fn prune(&self, now: DateTime<Utc>) -> PruneReport;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write the retained records to `path` as a JSON array, replacing the
    /// file atomically. Returns the number of records written.
    fn export_json(&self, path: &Path) -> Result<usize, StorageError>;

    fn log_share(
        &self,
        actor_id: &str,
        code: &str,
        item_id: &str,
        client: &ClientMeta,
    ) -> AuditRecord {
        self.record(
            AuditEvent::new(AuditAction::Share, AuditLevel::Info, actor_id, "item shared")
                .with_code(code)
                .with_item(item_id)
                .with_client(client)
                .with_status(200),
        )
    }

    fn log_claim(
        &self,
        actor_id: &str,
        code: &str,
        item_id: Option<&str>,
        success: bool,
        client: &ClientMeta,
    ) -> AuditRecord {
        let (level, message, status) = if success {
            (AuditLevel::Info, "item claimed", 200)
        } else {
            (AuditLevel::Warning, "item claim failed", 400)
        };
        let mut event = AuditEvent::new(AuditAction::Claim, level, actor_id, message)
            .with_code(code)
            .with_client(client)
            .with_status(status);
        if let Some(id) = item_id {
            event = event.with_item(id);
        }
        self.record_claim_attempt(event)
    }

    fn log_invalid_code(&self, actor_id: &str, code: &str, client: &ClientMeta) -> AuditRecord {
        self.record(
            AuditEvent::new(
                AuditAction::InvalidCode,
                AuditLevel::Warning,
                actor_id,
                "attempted to use a nonexistent pickup code",
            )
            .with_code(code)
            .with_client(client)
            .with_status(404),
        )
    }

    fn log_duplicate_code(&self, actor_id: &str, code: &str, client: &ClientMeta) -> AuditRecord {
        self.record(
            AuditEvent::new(
                AuditAction::DuplicateCode,
                AuditLevel::Alert,
                actor_id,
                "attempted to use an already claimed pickup code",
            )
            .with_code(code)
            .with_client(client)
            .with_status(409)
            .flagged("pickup code already claimed"),
        )
    }

    fn log_expired_code(&self, actor_id: &str, code: &str, client: &ClientMeta) -> AuditRecord {
        self.record(
            AuditEvent::new(
                AuditAction::ExpiredCode,
                AuditLevel::Warning,
                actor_id,
                "attempted to use an expired pickup code",
            )
            .with_code(code)
            .with_client(client)
            .with_status(410),
        )
    }

    fn log_error(
        &self,
        actor_id: &str,
        action: AuditAction,
        message: &str,
        status: u16,
        client: &ClientMeta,
    ) -> AuditRecord {
        self.record(
            AuditEvent::new(action, AuditLevel::Error, actor_id, message)
                .with_client(client)
                .with_status(status),
        )
    }
}

#[derive(Debug, Clone, Copy)]
struct AttemptCounter {
    count: u64,
    last_attempt: DateTime<Utc>,
}

/// Bytes charged per counter on top of its key.
const COUNTER_OVERHEAD: u64 = 48;

struct AuditState {
    records: VecDeque<AuditRecord>,
    code_attempts: HashMap<String, AttemptCounter>,
    user_attempts: HashMap<String, AttemptCounter>,
    next_event_id: u64,
}

pub struct InMemoryAuditLog {
    state: Mutex<AuditState>,
    config: AuditConfig,
    clock: Arc<dyn Clock>,
    tracker: Arc<MemoryTracker>,
    total_trimmed: AtomicU64,
}

impl InMemoryAuditLog {
    pub fn new(config: AuditConfig, clock: Arc<dyn Clock>, tracker: Arc<MemoryTracker>) -> Self {
        Self {
            state: Mutex::new(AuditState {
                records: VecDeque::new(),
                code_attempts: HashMap::new(),
                user_attempts: HashMap::new(),
                next_event_id: 1,
            }),
            config,
            clock,
            tracker,
            total_trimmed: AtomicU64::new(0),
        }
    }

    /// Records dropped by the count cap since start.
    pub fn total_trimmed(&self) -> u64 {
        self.total_trimmed.load(Ordering::Relaxed)
    }

    /// Retained records, oldest first.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.state.lock().records.iter().cloned().collect()
    }

    fn append(&self, mut event: AuditEvent, escalate_claim: bool) -> AuditRecord {
        let now = self.clock.now();
        let timestamp = event.timestamp.unwrap_or(now);
        let threshold = self.config.suspicious_attempt_threshold;

        let (record, trimmed) = {
            let mut st = self.state.lock();

            if escalate_claim {
                let prior = event
                    .pickup_code
                    .as_deref()
                    .filter(|c| !c.is_empty())
                    .and_then(|c| st.code_attempts.get(c))
                    .map_or(0, |c| c.count);
                if prior > threshold {
                    event.level = AuditLevel::Alert;
                    event.suspicious = true;
                    event.reason = Some(format!("pickup code attempt limit exceeded ({prior})"));
                }
            }

            let mut added_bytes = 0;
            if let Some(code) = event.pickup_code.as_deref().filter(|c| !c.is_empty()) {
                added_bytes += bump(&mut st.code_attempts, code, timestamp);
            }
            if !event.actor_id.is_empty() {
                added_bytes += bump(&mut st.user_attempts, &event.actor_id, timestamp);
            }

            let event_id = st.next_event_id;
            st.next_event_id += 1;
            let record = AuditRecord::from_event(event_id, timestamp, event);
            added_bytes += record.approx_size_bytes();
            st.records.push_back(record.clone());

            // Charged before the lock drops, so a concurrent trim or prune
            // never releases bytes that were not yet counted.
            self.tracker.alloc_audit(added_bytes);

            let mut trimmed = 0;
            if st.records.len() > self.config.capacity {
                let excess = st.records.len() - self.config.trim_to;
                let mut trimmed_bytes = 0;
                for old in st.records.drain(..excess) {
                    trimmed_bytes += old.approx_size_bytes();
                }
                self.tracker.dealloc_audit(trimmed_bytes);
                trimmed = excess;
            }
            (record, trimmed)
        };

        if trimmed > 0 {
            self.total_trimmed.fetch_add(trimmed as u64, Ordering::Relaxed);
            tracing::info!(
                removed = trimmed,
                kept = self.config.trim_to,
                "audit log over capacity, oldest records trimmed"
            );
        }
        emit(&record);
        parcel_observability::record_audit_event(
            record.action.as_str(),
            record.level.as_str(),
            record.suspicious,
        );
        record
    }
}

/// Increment `key`'s counter. Returns bytes newly charged (0 when the
/// counter already existed).
fn bump(map: &mut HashMap<String, AttemptCounter>, key: &str, at: DateTime<Utc>) -> u64 {
    match map.get_mut(key) {
        Some(c) => {
            c.count += 1;
            c.last_attempt = c.last_attempt.max(at);
            0
        }
        None => {
            map.insert(
                key.to_string(),
                AttemptCounter {
                    count: 1,
                    last_attempt: at,
                },
            );
            key.len() as u64 + COUNTER_OVERHEAD
        }
    }
}

fn emit(r: &AuditRecord) {
    let code = r.pickup_code.as_deref().unwrap_or("");
    macro_rules! audit_line {
        ($lvl:ident) => {
            tracing::$lvl!(
                event_id = r.event_id,
                action = %r.action,
                level = %r.level,
                actor = %r.actor_id,
                code,
                status = r.status_code.unwrap_or(0),
                suspicious = r.suspicious,
                reason = r.reason.as_deref().unwrap_or(""),
                "audit: {}",
                r.message
            )
        };
    }
    match r.level {
        AuditLevel::Info => audit_line!(info),
        AuditLevel::Warning => audit_line!(warn),
        AuditLevel::Error | AuditLevel::Alert => audit_line!(error),
    }
}

impl AuditLog for InMemoryAuditLog {
    fn record(&self, event: AuditEvent) -> AuditRecord {
        self.append(event, false)
    }

    fn record_claim_attempt(&self, event: AuditEvent) -> AuditRecord {
        self.append(event, true)
    }

    fn code_attempts(&self, code: &str) -> u64 {
        self.state
            .lock()
            .code_attempts
            .get(code)
            .map_or(0, |c| c.count)
    }

    fn user_attempts(&self, actor_id: &str) -> u64 {
        self.state
            .lock()
            .user_attempts
            .get(actor_id)
            .map_or(0, |c| c.count)
    }

    fn query(&self, query: &AuditQuery) -> AuditPage {
        let page = query.page.max(1) as usize;
        let page_size = if query.page_size < 1 {
            self.config.default_page_size
        } else {
            (query.page_size as usize).min(self.config.max_page_size)
        };
        let cutoff = query.window.cutoff(self.clock.now());

        let mut matched: Vec<AuditRecord> = {
            let st = self.state.lock();
            st.records
                .iter()
                .filter(|r| query.matches(r, cutoff))
                .cloned()
                .collect()
        };
        matched.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.event_id.cmp(&a.event_id))
        });

        let total = matched.len();
        let total_pages = total.div_ceil(page_size);
        let start = (page - 1).saturating_mul(page_size);
        let records = if start >= total {
            Vec::new()
        } else {
            matched.into_iter().skip(start).take(page_size).collect()
        };
        AuditPage {
            total,
            page,
            page_size,
            total_pages,
            records,
        }
    }

    fn prune(&self, now: DateTime<Utc>) -> PruneReport {
        let record_cutoff = now - Duration::days(i64::from(self.config.retention_days));
        let counter_cutoff = now - Duration::days(i64::from(self.config.attempt_retention_days));

        let mut freed = 0u64;
        let report = {
            let mut st = self.state.lock();
            let before = st.records.len();
            st.records.retain(|r| {
                let keep = r.timestamp >= record_cutoff;
                if !keep {
                    freed += r.approx_size_bytes();
                }
                keep
            });
            let records_removed = before - st.records.len();
            let code_counters_removed = prune_counters(&mut st.code_attempts, counter_cutoff, &mut freed);
            let user_counters_removed = prune_counters(&mut st.user_attempts, counter_cutoff, &mut freed);
            self.tracker.dealloc_audit(freed);
            PruneReport {
                records_removed,
                code_counters_removed,
                user_counters_removed,
            }
        };
        if report != PruneReport::default() {
            tracing::info!(
                records = report.records_removed,
                code_counters = report.code_counters_removed,
                user_counters = report.user_counters_removed,
                "audit retention pass"
            );
        }
        report
    }

    fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    fn export_json(&self, path: &Path) -> Result<usize, StorageError> {
        let records = self.records();
        let data = serde_json::to_vec_pretty(&records)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, path)?;
        tracing::debug!(path = %path.display(), records = records.len(), "audit log exported");
        Ok(records.len())
    }
}

fn prune_counters(
    map: &mut HashMap<String, AttemptCounter>,
    cutoff: DateTime<Utc>,
    freed: &mut u64,
) -> usize {
    let before = map.len();
    map.retain(|key, c| {
        let keep = c.last_attempt >= cutoff;
        if !keep {
            *freed += key.len() as u64 + COUNTER_OVERHEAD;
        }
        keep
    });
    before - map.len()
}
