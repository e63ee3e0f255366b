//! Pickup-code redemption store: item records, the memory-pressure write
//! gate, the audit trail and the background expiry sweep.

pub mod admission;
pub mod audit;
pub mod codegen;
pub mod memory;
pub mod memstore;
pub mod repository;
pub mod service;
pub mod snapshot;
pub mod sweeper;

use std::sync::Arc;

use parcel_common::clock::Clock;
use parcel_common::config::{StorageBackend, StorageConfig};
use parcel_common::error::StorageError;

pub use admission::{AdmissionController, AdmissionSampler, AdmissionStatus};
pub use audit::{AuditLog, InMemoryAuditLog};
pub use codegen::{CodeGenerator, CodeSource};
pub use memory::MemoryTracker;
pub use memstore::InMemoryItemStore;
pub use repository::ItemRepository;
pub use service::{ClaimRequest, ClaimResponse, ClaimStatus, ParcelService, ShareReceipt, ShareRequest};
pub use snapshot::SnapshotItemStore;
pub use sweeper::{ExpirationSweeper, SweepSchedule};

/// Open the item store selected by `config.backend`.
pub fn open_store(
    config: &StorageConfig,
    clock: Arc<dyn Clock>,
    tracker: Arc<MemoryTracker>,
) -> Result<Arc<dyn ItemRepository>, StorageError> {
    let store: Arc<dyn ItemRepository> = match config.backend {
        StorageBackend::Memory => Arc::new(InMemoryItemStore::new(clock, tracker)),
        StorageBackend::Snapshot => {
            Arc::new(SnapshotItemStore::open(&config.snapshot_path, clock, tracker)?)
        }
    };
    tracing::info!(backend = store.backend_name(), "item store opened");
    Ok(store)
}
