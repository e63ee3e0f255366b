//! Redemption store backed by memory plus a JSON snapshot file.
//!
//! Reads and writes go to an [`InMemoryItemStore`]. `flush` rewrites the
//! snapshot with every unclaimed, unexpired record; `open` restores the
//! same subset. Claimed and expired records are never carried across a
//! restart.
//!
//! A successful claim is appended to a claim log (`<snapshot>.claims`, one
//! JSON line per claim, synced) before it is reported. `open` drops every
//! snapshot record named in the log, so a claim survives a crash that
//! happens before the next flush. `flush` truncates the log once the new
//! snapshot is in place.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use parcel_common::clock::Clock;
use parcel_common::error::StorageError;
use parcel_common::item::{ClaimOutcome, Item, PickupCode};

use crate::memory::MemoryTracker;
use crate::memstore::InMemoryItemStore;
use crate::repository::ItemRepository;

/// One line of the claim log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
struct ClaimEntry {
    pickup_code: String,
    item_id: String,
}

pub struct SnapshotItemStore {
    inner: InMemoryItemStore,
    path: PathBuf,
    claims_path: PathBuf,
    /// Held across claim-log appends and whole flushes, so a flush never
    /// truncates a claim its snapshot did not see.
    write_lock: Mutex<()>,
}

impl SnapshotItemStore {
    /// Open the store, restoring redeemable records from `path` when the
    /// file exists. A missing file is an empty store; an unreadable or
    /// corrupt one is an error.
    pub fn open(
        path: impl Into<PathBuf>,
        clock: Arc<dyn Clock>,
        tracker: Arc<MemoryTracker>,
    ) -> Result<Self, StorageError> {
        let path = path.into();
        let claims_path = claims_path_for(&path);
        let inner = InMemoryItemStore::new(clock, tracker);
        if let Some(items) = read_snapshot(&path)? {
            let claimed = read_claim_log(&claims_path)?;
            let now = inner.clock().now();
            let total = items.len();
            let keep: Vec<Item> = items
                .into_iter()
                .filter(|i| !i.claimed && !i.is_expired_at(now))
                .filter(|i| {
                    !claimed.contains(&ClaimEntry {
                        pickup_code: i.pickup_code.to_string(),
                        item_id: i.id.clone(),
                    })
                })
                .collect();
            let restored = inner.restore(keep);
            tracing::info!(
                path = %path.display(),
                restored,
                skipped = total - restored,
                logged_claims = claimed.len(),
                "item snapshot loaded"
            );
        }
        Ok(Self {
            inner,
            path,
            claims_path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append_claim(&self, item: &Item) -> Result<(), StorageError> {
        let entry = ClaimEntry {
            pickup_code: item.pickup_code.to_string(),
            item_id: item.id.clone(),
        };
        let mut line =
            serde_json::to_vec(&entry).map_err(|e| StorageError::Serialization(e.to_string()))?;
        line.push(b'\n');
        if let Some(dir) = self.claims_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.claims_path)?;
        file.write_all(&line)?;
        file.sync_data()?;
        Ok(())
    }
}

fn claims_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".claims");
    PathBuf::from(name)
}

fn read_snapshot(path: &Path) -> Result<Option<Vec<Item>>, StorageError> {
    if !path.exists() {
        return Ok(None);
    }
    let data = fs::read(path)?;
    let items: Vec<Item> =
        serde_json::from_slice(&data).map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(Some(items))
}

/// A torn trailing line (crash mid-append) is skipped; that claim was
/// never reported as successful.
fn read_claim_log(path: &Path) -> Result<HashSet<ClaimEntry>, StorageError> {
    if !path.exists() {
        return Ok(HashSet::new());
    }
    let data = fs::read_to_string(path)?;
    let mut entries = HashSet::new();
    for line in data.lines().filter(|l| !l.trim().is_empty()) {
        match serde_json::from_str::<ClaimEntry>(line) {
            Ok(entry) => {
                entries.insert(entry);
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping unreadable claim log line");
            }
        }
    }
    Ok(entries)
}

impl ItemRepository for SnapshotItemStore {
    fn create(&self, item: Item) -> Result<(), StorageError> {
        self.inner.create(item)
    }

    fn lookup(&self, code: &PickupCode) -> Result<Option<Item>, StorageError> {
        self.inner.lookup(code)
    }

    /// A claim is reported only after it reaches the claim log. If the
    /// append fails the in-memory claim is released and the error returned.
    fn claim(&self, code: &PickupCode, claimer_id: &str) -> Result<ClaimOutcome, StorageError> {
        let _guard = self.write_lock.lock();
        let outcome = self.inner.claim(code, claimer_id)?;
        if let ClaimOutcome::Claimed(item) = &outcome {
            if let Err(e) = self.append_claim(item) {
                self.inner.release_claim(code, claimer_id);
                tracing::error!(code = %code, error = %e, "claim log append failed, claim released");
                return Err(e);
            }
        }
        Ok(outcome)
    }

    fn delete_expired(&self) -> Result<usize, StorageError> {
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

    /// Write atomically: a temp file renamed over the snapshot, then the
    /// claim log is cut back to empty.
    fn flush(&self) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock();
        let now = self.inner.clock().now();
        let mut items = self
            .inner
            .collect_where(|i| !i.claimed && !i.is_expired_at(now));
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let data = serde_json::to_vec_pretty(&items)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, &self.path)?;
        if self.claims_path.exists() {
            fs::File::create(&self.claims_path)?;
        }
        tracing::debug!(path = %self.path.display(), items = items.len(), "item snapshot written");
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "snapshot"
    }
}
