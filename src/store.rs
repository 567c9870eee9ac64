//! Render-facing copy of the day's entries.
//!
//! The vector is kept in display order at all times: `ordering` ascending,
//! rows without an ordering last, `created_at` as the tie-breaker. Sorting is
//! stable so equal keys keep their relative position across merges.

use std::cmp::Ordering;

use crate::error::SyncError;
use crate::model::{Change, Entry, EntryId, EntryStatus};
use crate::observer::{Listener, Listeners, SubscriptionId};

/// Local edit applied before the remote side confirms it.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Insert(Entry),
    SetQuantity { id: EntryId, quantity: f64 },
    SetStatus { id: EntryId, status: EntryStatus },
    Delete { id: EntryId },
    /// Assigns `ordering = 0..N-1` following `ordered_ids`.
    Reorder { ordered_ids: Vec<EntryId> },
    /// Upsert a whole row; used to put back a prior value.
    Replace(Entry),
}

/// Value copy of the store, captured before a gesture.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreSnapshot(Vec<Entry>);

impl StoreSnapshot {
    pub fn entries(&self) -> &[Entry] {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DayTotals {
    pub planned: f64,
    pub eaten: f64,
}

impl DayTotals {
    pub fn total(&self) -> f64 {
        self.planned + self.eaten
    }
}

#[derive(Debug, Default)]
pub struct EntryStore {
    entries: Vec<Entry>,
    listeners: Listeners<[Entry]>,
}

impl EntryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries in display order.
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn get(&self, id: &EntryId) -> Option<&Entry> {
        self.entries.iter().find(|e| &e.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ordering for a row appended at the end.
    pub fn next_ordering(&self) -> i64 {
        self.entries
            .iter()
            .filter_map(|e| e.ordering)
            .max()
            .map_or(0, |max| max + 1)
    }

    pub fn totals(&self) -> DayTotals {
        totals_of(&self.entries)
    }

    pub fn subscribe(&mut self, listener: Listener<[Entry]>) -> SubscriptionId {
        self.listeners.subscribe(listener)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.listeners.unsubscribe(id)
    }

    pub fn replace_all(&mut self, entries: Vec<Entry>) {
        self.entries = entries;
        sort_for_display(&mut self.entries);
        self.notify();
    }

    pub fn apply_optimistic(&mut self, mutation: Mutation) -> Result<(), SyncError> {
        match mutation {
            Mutation::Insert(entry) => {
                if self.get(&entry.id).is_some() {
                    return Err(SyncError::DuplicateEntry(entry.id));
                }
                self.entries.push(entry);
                sort_for_display(&mut self.entries);
            }
            Mutation::SetQuantity { id, quantity } => {
                let slot = self.slot_mut(&id)?;
                *slot = slot.requantified(quantity);
            }
            Mutation::SetStatus { id, status } => {
                self.slot_mut(&id)?.status = status;
            }
            Mutation::Delete { id } => {
                let before = self.entries.len();
                self.entries.retain(|e| e.id != id);
                if self.entries.len() == before {
                    return Err(SyncError::UnknownEntry(id));
                }
            }
            Mutation::Reorder { ordered_ids } => {
                for id in &ordered_ids {
                    if self.get(id).is_none() {
                        return Err(SyncError::UnknownEntry(id.clone()));
                    }
                }
                for (idx, id) in ordered_ids.iter().enumerate() {
                    self.slot_mut(id)?.ordering = Some(idx as i64);
                }
                sort_for_display(&mut self.entries);
            }
            Mutation::Replace(entry) => {
                self.upsert(entry);
            }
        }
        self.notify();
        Ok(())
    }

    /// Merge a change that someone else made. Returns whether anything moved.
    ///
    /// A delete for a row that is already gone is a no-op, not an error.
    pub fn apply_remote_change(&mut self, change: &Change) -> bool {
        let changed = match change {
            Change::Insert { row } | Change::Update { row } => self.upsert(row.clone()),
            Change::Delete { id } => {
                let before = self.entries.len();
                self.entries.retain(|e| &e.id != id);
                self.entries.len() != before
            }
        };
        if changed {
            self.notify();
        }
        changed
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot(self.entries.clone())
    }

    pub fn restore(&mut self, snapshot: StoreSnapshot) {
        self.entries = snapshot.0;
        self.notify();
    }

    /// Put back each surviving row's ordering from `snapshot`. Rows deleted
    /// since are not brought back, and rows added since keep their place.
    pub fn restore_orderings(&mut self, snapshot: &StoreSnapshot) -> bool {
        let mut changed = false;
        for row in &mut self.entries {
            let Some(prior) = snapshot.0.iter().find(|e| e.id == row.id) else {
                continue;
            };
            if row.ordering != prior.ordering {
                row.ordering = prior.ordering;
                changed = true;
            }
        }
        if changed {
            sort_for_display(&mut self.entries);
            self.notify();
        }
        changed
    }

    fn upsert(&mut self, row: Entry) -> bool {
        match self.entries.iter_mut().find(|e| e.id == row.id) {
            Some(existing) => {
                if *existing == row {
                    return false;
                }
                let reorder = existing.ordering != row.ordering;
                *existing = row;
                if reorder {
                    sort_for_display(&mut self.entries);
                }
            }
            None => {
                self.entries.push(row);
                sort_for_display(&mut self.entries);
            }
        }
        true
    }

    fn slot_mut(&mut self, id: &EntryId) -> Result<&mut Entry, SyncError> {
        self.entries
            .iter_mut()
            .find(|e| &e.id == id)
            .ok_or_else(|| SyncError::UnknownEntry(id.clone()))
    }

    fn notify(&mut self) {
        self.listeners.notify(&self.entries);
    }
}

/// Planned and eaten value sums.
pub fn totals_of(entries: &[Entry]) -> DayTotals {
    entries.iter().fold(DayTotals::default(), |mut acc, e| {
        match e.status {
            EntryStatus::Planned => acc.planned += e.value_snapshot,
            EntryStatus::Eaten => acc.eaten += e.value_snapshot,
        }
        acc
    })
}

/// Stable display sort: ordering ascending (missing last), then `created_at`.
pub fn sort_for_display(entries: &mut [Entry]) {
    entries.sort_by(display_cmp);
}

fn display_cmp(a: &Entry, b: &Entry) -> Ordering {
    let ao = a.ordering.unwrap_or(i64::MAX);
    let bo = b.ordering.unwrap_or(i64::MAX);
    ao.cmp(&bo).then_with(|| a.created_at.cmp(&b.created_at))
}

/// True when the orderings in `entries` are exactly `0..N-1`.
pub fn is_dense(entries: &[Entry]) -> bool {
    let mut seen: Vec<i64> = entries.iter().filter_map(|e| e.ordering).collect();
    if seen.len() != entries.len() {
        return false;
    }
    seen.sort_unstable();
    seen.iter().enumerate().all(|(idx, o)| *o == idx as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use std::sync::{Arc, Mutex};

    fn row(id: &str, ordering: Option<i64>, minute: i64) -> Entry {
        Entry {
            id: EntryId::new(id),
            name: id.to_uppercase(),
            quantity: "1".into(),
            unit: "pc".into(),
            value_snapshot: 10.0,
            per_unit_snapshot: Some(10.0),
            status: EntryStatus::Planned,
            ordering,
            created_at: Utc.with_ymd_and_hms(2025, 10, 18, 8, 0, 0).unwrap()
                + Duration::minutes(minute),
        }
    }

    fn ids(store: &EntryStore) -> Vec<&str> {
        store.entries().iter().map(|e| e.id.as_str()).collect()
    }

    #[test]
    fn sorts_by_ordering_then_created_at() {
        let mut store = EntryStore::new();
        store.replace_all(vec![
            row("c", None, 0),
            row("b", Some(1), 5),
            row("a", Some(0), 9),
            row("d", Some(1), 1),
        ]);
        assert_eq!(ids(&store), vec!["a", "d", "b", "c"]);
    }

    #[test]
    fn equal_keys_keep_insertion_order() {
        let mut store = EntryStore::new();
        store.replace_all(vec![row("x", None, 0), row("y", None, 0)]);
        store
            .apply_remote_change(&Change::Insert { row: row("z", Some(0), 3) });
        assert_eq!(ids(&store), vec!["z", "x", "y"]);
    }

    #[test]
    fn remote_update_in_place_without_reorder() {
        let mut store = EntryStore::new();
        store.replace_all(vec![row("a", Some(0), 0), row("b", Some(1), 1)]);
        let mut b = row("b", Some(1), 1);
        b.quantity = "3".into();
        assert!(store.apply_remote_change(&Change::Update { row: b }));
        assert_eq!(store.get(&"b".into()).unwrap().quantity, "3");
        assert_eq!(ids(&store), vec!["a", "b"]);
        // same payload twice is not a change
        let mut b = row("b", Some(1), 1);
        b.quantity = "3".into();
        assert!(!store.apply_remote_change(&Change::Update { row: b }));
    }

    #[test]
    fn remote_delete_of_missing_row_is_noop() {
        let mut store = EntryStore::new();
        store.replace_all(vec![row("a", Some(0), 0)]);
        assert!(!store.apply_remote_change(&Change::Delete { id: "zzz".into() }));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn optimistic_errors_on_unknown_and_duplicate() {
        let mut store = EntryStore::new();
        store.replace_all(vec![row("a", Some(0), 0)]);
        assert_eq!(
            store.apply_optimistic(Mutation::SetStatus {
                id: "nope".into(),
                status: EntryStatus::Eaten
            }),
            Err(SyncError::UnknownEntry("nope".into()))
        );
        assert_eq!(
            store.apply_optimistic(Mutation::Insert(row("a", Some(1), 0))),
            Err(SyncError::DuplicateEntry("a".into()))
        );
    }

    #[test]
    fn reorder_assigns_dense_ordering() {
        let mut store = EntryStore::new();
        store.replace_all(vec![row("a", Some(4), 0), row("b", Some(9), 1), row("c", None, 2)]);
        store
            .apply_optimistic(Mutation::Reorder {
                ordered_ids: vec!["c".into(), "a".into(), "b".into()],
            })
            .unwrap();
        assert_eq!(ids(&store), vec!["c", "a", "b"]);
        assert!(is_dense(store.entries()));
    }

    #[test]
    fn snapshot_restore_round_trip_notifies() {
        let calls = Arc::new(Mutex::new(0));
        let mut store = EntryStore::new();
        store.replace_all(vec![row("a", Some(0), 0), row("b", Some(1), 1)]);

        let counter = calls.clone();
        store.subscribe(Box::new(move |_| *counter.lock().unwrap() += 1));

        let snap = store.snapshot();
        store
            .apply_optimistic(Mutation::Delete { id: "a".into() })
            .unwrap();
        assert_eq!(ids(&store), vec!["b"]);
        store.restore(snap);
        assert_eq!(ids(&store), vec!["a", "b"]);
        assert_eq!(*calls.lock().unwrap(), 2);
    }

    #[test]
    fn restore_orderings_skips_rows_deleted_since() {
        let mut store = EntryStore::new();
        store.replace_all(vec![row("a", Some(0), 0), row("b", Some(1), 1), row("c", Some(2), 2)]);
        let snap = store.snapshot();
        store
            .apply_optimistic(Mutation::Reorder {
                ordered_ids: vec!["c".into(), "a".into(), "b".into()],
            })
            .unwrap();
        store.apply_remote_change(&Change::Delete { id: "b".into() });

        assert!(store.restore_orderings(&snap));
        assert_eq!(ids(&store), vec!["a", "c"]);
        assert!(!store.restore_orderings(&snap));
    }

    #[test]
    fn totals_split_by_status() {
        let mut store = EntryStore::new();
        let mut eaten = row("b", Some(1), 1);
        eaten.status = EntryStatus::Eaten;
        eaten.value_snapshot = 32.5;
        store.replace_all(vec![row("a", Some(0), 0), eaten]);
        let totals = store.totals();
        assert_eq!(totals.planned, 10.0);
        assert_eq!(totals.eaten, 32.5);
        assert_eq!(totals.total(), 42.5);
    }
}
