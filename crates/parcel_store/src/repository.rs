//! The redemption store capability shared by all item backends.

use chrono::{DateTime, Utc};

use parcel_common::error::StorageError;
use parcel_common::item::{ClaimOutcome, Item, PickupCode};

/// Concurrent, time-bounded map of pickup code to item record.
///
/// Implemented by [`crate::memstore::InMemoryItemStore`] and
/// [`crate::snapshot::SnapshotItemStore`]. Every method judges expiry
/// against the store's own clock. A backend fault is reported as
/// `Err(StorageError)` and is never folded into an absent record.
pub trait ItemRepository: Send + Sync {
    /// Insert a new record keyed by its pickup code.
    ///
    /// Fails with [`StorageError::DuplicateCode`] while a live record holds
    /// the code. An expired record under the same code is replaced.
    fn create(&self, item: Item) -> Result<(), StorageError>;

    /// The record for `code` if present and not expired. An expired record
    /// is removed on the way out.
    fn lookup(&self, code: &PickupCode) -> Result<Option<Item>, StorageError>;

    /// Existence, claimed-flag and expiry checks plus the mutation, as one
    /// atomic step per code. At most one caller ever sees `Claimed`.
    fn claim(&self, code: &PickupCode, claimer_id: &str) -> Result<ClaimOutcome, StorageError>;

    /// Remove every record whose expiry is at or before now. Returns the
    /// number removed.
    fn delete_expired(&self) -> Result<usize, StorageError>;

    /// Clones of all non-expired records, most recently created first.
    fn list_live(&self) -> Result<Vec<Item>, StorageError>;

    /// Records held, including expired ones not yet swept.
    fn total_count(&self) -> Result<usize, StorageError>;

    /// Claimed records held.
    fn claimed_count(&self) -> Result<usize, StorageError>;

    /// Records created in `[start, end)`.
    fn count_created_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<usize, StorageError>;

    /// Make held state durable. No-op for memory-only backends.
    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str;
}
