//! Byte accounting for the data the process holds on behalf of callers.
//!
//! The item store and the audit log report every insert and removal here.
//! The counters are lock-free and feed [`crate::admission::TrackedUsage`]:
//! - **item bytes**: records in the redemption store (live or awaiting sweep)
//! - **audit bytes**: retained audit records and attempt counters

use std::sync::atomic::{AtomicI64, Ordering};

use serde::Serialize;

/// Point-in-time view of tracked memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemorySnapshot {
    pub item_bytes: u64,
    pub audit_bytes: u64,
    pub total_bytes: u64,
}

/// Signed counters so a racing decrement cannot wrap to `u64::MAX`;
/// reads clamp at zero.
#[derive(Debug, Default)]
pub struct MemoryTracker {
    item_bytes: AtomicI64,
    audit_bytes: AtomicI64,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc_item(&self, bytes: u64) {
        self.item_bytes.fetch_add(bytes as i64, Ordering::Relaxed);
    }

    pub fn dealloc_item(&self, bytes: u64) {
        let prev = self.item_bytes.fetch_sub(bytes as i64, Ordering::Relaxed);
        debug_assert!(prev >= bytes as i64, "item_bytes underflow: prev={prev}, sub={bytes}");
    }

    pub fn alloc_audit(&self, bytes: u64) {
        self.audit_bytes.fetch_add(bytes as i64, Ordering::Relaxed);
    }

    pub fn dealloc_audit(&self, bytes: u64) {
        let prev = self.audit_bytes.fetch_sub(bytes as i64, Ordering::Relaxed);
        debug_assert!(prev >= bytes as i64, "audit_bytes underflow: prev={prev}, sub={bytes}");
    }

    pub fn item_bytes(&self) -> u64 {
        self.item_bytes.load(Ordering::Relaxed).max(0) as u64
    }

    pub fn audit_bytes(&self) -> u64 {
        self.audit_bytes.load(Ordering::Relaxed).max(0) as u64
    }

    pub fn total_bytes(&self) -> u64 {
        self.item_bytes() + self.audit_bytes()
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        let item_bytes = self.item_bytes();
        let audit_bytes = self.audit_bytes();
        MemorySnapshot {
            item_bytes,
            audit_bytes,
            total_bytes: item_bytes + audit_bytes,
        }
    }
}
