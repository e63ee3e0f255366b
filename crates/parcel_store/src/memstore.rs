//! In-memory redemption store.
//!
//! One `RwLock` guards the whole map. Lookups share the read side and only
//! escalate to the write side to drop a record found expired; create, claim
//! and sweep are exclusive for their full check-then-act sequence.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use parcel_common::clock::Clock;
use parcel_common::error::StorageError;
use parcel_common::item::{ClaimOutcome, Item, PickupCode};

use crate::memory::MemoryTracker;
use crate::repository::ItemRepository;

pub struct InMemoryItemStore {
    items: RwLock<HashMap<PickupCode, Item>>,
    clock: Arc<dyn Clock>,
    tracker: Arc<MemoryTracker>,
}

impl InMemoryItemStore {
    pub fn new(clock: Arc<dyn Clock>, tracker: Arc<MemoryTracker>) -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
            clock,
            tracker,
        }
    }

    /// Load records without expiry or duplicate checks. Used when restoring
    /// a snapshot into an empty store.
    pub(crate) fn restore(&self, items: Vec<Item>) -> usize {
        let mut map = self.items.write();
        let mut restored = 0;
        for item in items {
            self.tracker.alloc_item(item.approx_size_bytes());
            if let Some(old) = map.insert(item.pickup_code.clone(), item) {
                self.tracker.dealloc_item(old.approx_size_bytes());
            } else {
                restored += 1;
            }
        }
        restored
    }

    /// Clones of all records matching `keep`, in no particular order.
    pub(crate) fn collect_where(&self, keep: impl Fn(&Item) -> bool) -> Vec<Item> {
        self.items
            .read()
            .values()
            .filter(|item| keep(item))
            .cloned()
            .collect()
    }

    /// Undo a claim that could not be made durable. Only clears the record
    /// if `claimer_id` still holds it.
    pub(crate) fn release_claim(&self, code: &PickupCode, claimer_id: &str) -> bool {
        let mut map = self.items.write();
        let Some(item) = map.get_mut(code) else {
            return false;
        };
        if !item.claimed || item.claimer_id.as_deref() != Some(claimer_id) {
            return false;
        }
        let before = item.approx_size_bytes();
        item.claimed = false;
        item.claimer_id = None;
        self.tracker.alloc_item(item.approx_size_bytes());
        self.tracker.dealloc_item(before);
        true
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn remove_locked(&self, map: &mut HashMap<PickupCode, Item>, code: &PickupCode) {
        if let Some(old) = map.remove(code) {
            self.tracker.dealloc_item(old.approx_size_bytes());
        }
    }
}

impl ItemRepository for InMemoryItemStore {
    fn create(&self, item: Item) -> Result<(), StorageError> {
        let now = self.clock.now();
        let mut map = self.items.write();
        if let Some(existing) = map.get(&item.pickup_code) {
            if !existing.is_expired_at(now) {
                return Err(StorageError::DuplicateCode(item.pickup_code.to_string()));
            }
            tracing::debug!(code = %item.pickup_code, "replacing expired record on create");
            let code = item.pickup_code.clone();
            self.remove_locked(&mut map, &code);
        }
        self.tracker.alloc_item(item.approx_size_bytes());
        map.insert(item.pickup_code.clone(), item);
        Ok(())
    }

    fn lookup(&self, code: &PickupCode) -> Result<Option<Item>, StorageError> {
        {
            let map = self.items.read();
            match map.get(code) {
                None => return Ok(None),
                Some(item) if !item.is_expired_at(self.clock.now()) => {
                    return Ok(Some(item.clone()))
                }
                Some(_) => {}
            }
        }

        // Expired under the read lock. Another writer may have replaced or
        // removed it since, so decide again under the write lock.
        let mut map = self.items.write();
        let now = self.clock.now();
        match map.get(code) {
            None => return Ok(None),
            Some(item) if !item.is_expired_at(now) => return Ok(Some(item.clone())),
            Some(_) => {}
        }
        self.remove_locked(&mut map, code);
        tracing::debug!(code = %code, "expired record removed on lookup");
        Ok(None)
    }

    fn claim(&self, code: &PickupCode, claimer_id: &str) -> Result<ClaimOutcome, StorageError> {
        let mut map = self.items.write();
        let now = self.clock.now();
        let Some(item) = map.get_mut(code) else {
            return Ok(ClaimOutcome::NotFound);
        };
        if item.claimed {
            return Ok(ClaimOutcome::AlreadyClaimed);
        }
        if item.is_expired_at(now) {
            self.remove_locked(&mut map, code);
            return Ok(ClaimOutcome::Expired);
        }
        let before = item.approx_size_bytes();
        item.claimed = true;
        item.claimer_id = Some(claimer_id.to_string());
        let after = item.approx_size_bytes();
        self.tracker.alloc_item(after);
        self.tracker.dealloc_item(before);
        Ok(ClaimOutcome::Claimed(item.clone()))
    }

    fn delete_expired(&self) -> Result<usize, StorageError> {
        let mut map = self.items.write();
        let now = self.clock.now();
        let before = map.len();
        let mut freed = 0u64;
        map.retain(|_, item| {
            if item.is_sweepable_at(now) {
                freed += item.approx_size_bytes();
                false
            } else {
                true
            }
        });
        self.tracker.dealloc_item(freed);
        Ok(before - map.len())
    }

    fn list_live(&self) -> Result<Vec<Item>, StorageError> {
        let now = self.clock.now();
        let mut live = self.collect_where(|item| !item.is_expired_at(now));
        live.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(live)
    }

    fn total_count(&self) -> Result<usize, StorageError> {
        Ok(self.items.read().len())
    }

    fn claimed_count(&self) -> Result<usize, StorageError> {
        Ok(self.items.read().values().filter(|i| i.claimed).count())
    }

    fn count_created_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<usize, StorageError> {
        Ok(self
            .items
            .read()
            .values()
            .filter(|i| i.created_at >= start && i.created_at < end)
            .count())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use parcel_common::clock::ManualClock;
    use parcel_common::item::{format_item_id, Durability};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap()
    }

    fn setup() -> (Arc<ManualClock>, Arc<MemoryTracker>, InMemoryItemStore) {
        let clock = Arc::new(ManualClock::new(t0()));
        let tracker = Arc::new(MemoryTracker::new());
        let store = InMemoryItemStore::new(clock.clone(), tracker.clone());
        (clock, tracker, store)
    }

    fn item(code: &str, created: DateTime<Utc>) -> Item {
        Item {
            id: format_item_id(created, "A"),
            name: "Sword".into(),
            description: String::new(),
            type_id: 1,
            quantity: 1,
            durability: Some(Durability { value: 50, loss: 1 }),
            sharer_id: "A".into(),
            pickup_code: PickupCode::new(code),
            created_at: created,
            expires_at: created + Duration::hours(24),
            claimed: false,
            claimer_id: None,
        }
    }

    fn code(s: &str) -> PickupCode {
        PickupCode::new(s)
    }

    #[test]
    fn test_create_and_lookup() {
        let (_clock, tracker, store) = setup();
        store.create(item("111111", t0())).unwrap();
        let got = store.lookup(&code("111111")).unwrap().unwrap();
        assert_eq!(got.name, "Sword");
        assert!(tracker.item_bytes() > 0);
        assert!(store.lookup(&code("999999")).unwrap().is_none());
    }

    #[test]
    fn test_duplicate_live_code_rejected() {
        let (_clock, _tracker, store) = setup();
        store.create(item("111111", t0())).unwrap();
        let err = store.create(item("111111", t0())).unwrap_err();
        assert!(matches!(err, StorageError::DuplicateCode(c) if c == "111111"));
        assert_eq!(store.total_count().unwrap(), 1);
    }

    #[test]
    fn test_expired_code_can_be_reused() {
        let (clock, _tracker, store) = setup();
        store.create(item("111111", t0())).unwrap();
        clock.advance(Duration::hours(25));
        store.create(item("111111", clock.now())).unwrap();
        let got = store.lookup(&code("111111")).unwrap().unwrap();
        assert_eq!(got.created_at, clock.now());
        assert_eq!(store.total_count().unwrap(), 1);
    }

    #[test]
    fn test_lookup_boundary_and_lazy_removal() {
        let (clock, tracker, store) = setup();
        store.create(item("111111", t0())).unwrap();

        clock.set(t0() + Duration::hours(24));
        assert!(store.lookup(&code("111111")).unwrap().is_some());

        clock.advance(Duration::milliseconds(1));
        assert!(store.lookup(&code("111111")).unwrap().is_none());
        assert_eq!(store.total_count().unwrap(), 0);
        assert_eq!(tracker.item_bytes(), 0);
    }

    #[test]
    fn test_claim_transitions() {
        let (_clock, _tracker, store) = setup();
        store.create(item("111111", t0())).unwrap();

        match store.claim(&code("111111"), "B").unwrap() {
            ClaimOutcome::Claimed(it) => {
                assert!(it.claimed);
                assert_eq!(it.claimer_id.as_deref(), Some("B"));
            }
            other => panic!("expected Claimed, got {other:?}"),
        }
        assert_eq!(store.claim(&code("111111"), "D").unwrap(), ClaimOutcome::AlreadyClaimed);
        assert_eq!(store.claim(&code("111111"), "B").unwrap(), ClaimOutcome::AlreadyClaimed);
        assert_eq!(store.claim(&code("000000"), "B").unwrap(), ClaimOutcome::NotFound);

        // Claimed records stay held and keep their code reserved.
        assert_eq!(store.total_count().unwrap(), 1);
        assert_eq!(store.claimed_count().unwrap(), 1);
        assert!(store.create(item("111111", t0())).is_err());
    }

    #[test]
    fn test_claim_after_expiry_removes_record() {
        let (clock, _tracker, store) = setup();
        store.create(item("111111", t0())).unwrap();
        clock.advance(Duration::hours(24) + Duration::seconds(1));
        assert_eq!(store.claim(&code("111111"), "B").unwrap(), ClaimOutcome::Expired);
        assert_eq!(store.claim(&code("111111"), "B").unwrap(), ClaimOutcome::NotFound);
        assert_eq!(store.total_count().unwrap(), 0);
    }

    #[test]
    fn test_delete_expired_uses_inclusive_boundary() {
        let (clock, tracker, store) = setup();
        store.create(item("111111", t0())).unwrap();
        store.create(item("222222", t0() + Duration::hours(1))).unwrap();
        store.create(item("333333", t0() + Duration::hours(2))).unwrap();
        store.claim(&code("111111"), "B").unwrap();

        clock.set(t0() + Duration::hours(25));
        assert_eq!(store.delete_expired().unwrap(), 2);
        assert_eq!(store.total_count().unwrap(), 1);
        assert_eq!(store.claimed_count().unwrap(), 0);
        assert_eq!(store.delete_expired().unwrap(), 0);
        assert!(tracker.item_bytes() > 0);
    }

    #[test]
    fn test_list_live_newest_first_and_excludes_expired() {
        let (clock, _tracker, store) = setup();
        store.create(item("111111", t0())).unwrap();
        store.create(item("222222", t0() + Duration::hours(2))).unwrap();
        store.create(item("333333", t0() + Duration::hours(1))).unwrap();

        let live = store.list_live().unwrap();
        let codes: Vec<_> = live.iter().map(|i| i.pickup_code.as_str()).collect();
        assert_eq!(codes, vec!["222222", "333333", "111111"]);

        clock.set(t0() + Duration::hours(24) + Duration::minutes(30));
        let live = store.list_live().unwrap();
        assert_eq!(live.len(), 2);
        // listing does not delete
        assert_eq!(store.total_count().unwrap(), 3);
    }

    #[test]
    fn test_count_created_between() {
        let (_clock, _tracker, store) = setup();
        store.create(item("111111", t0())).unwrap();
        store.create(item("222222", t0() + Duration::minutes(30))).unwrap();
        store.create(item("333333", t0() + Duration::hours(2))).unwrap();
        let n = store
            .count_created_between(t0(), t0() + Duration::hours(1))
            .unwrap();
        assert_eq!(n, 2);
    }

    #[test]
    fn test_concurrent_claims_single_winner() {
        let (_clock, _tracker, store) = setup();
        store.create(item("424242", t0())).unwrap();
        let store = Arc::new(store);

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || store.claim(&code("424242"), &format!("c{i}")).unwrap())
            })
            .collect();
        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners = outcomes.iter().filter(|o| o.is_claimed()).count();
        assert_eq!(winners, 1);
        assert!(outcomes
            .iter()
            .filter(|o| !o.is_claimed())
            .all(|o| *o == ClaimOutcome::AlreadyClaimed));
    }
}
