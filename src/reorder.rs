//! Drag-and-drop reordering.
//!
//! Orderings are reassigned densely (`0..N-1`) on every move, so each
//! reorder rewrites every row of the scope. The whole id list travels in one
//! command under one operation id; only the dragged row shows as saving.

use std::collections::HashMap;

use tracing::{info, warn};

use crate::error::SyncError;
use crate::model::{Command, CommandPayload, EntryId, OpKind, OperationId, PendingOperation, ScopeKey};
use crate::registry::PendingRegistry;
use crate::store::{EntryStore, Mutation, StoreSnapshot};

/// Single-element move, `arrayMove` style.
pub fn move_item<T>(items: &mut Vec<T>, from: usize, to: usize) {
    let item = items.remove(from);
    items.insert(to, item);
}

#[derive(Debug, Default)]
pub struct ReorderCoordinator {
    snapshots: HashMap<OperationId, StoreSnapshot>,
    in_flight: Option<OperationId>,
}

impl ReorderCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_flight(&self) -> Option<OperationId> {
        self.in_flight
    }

    /// Apply a drag from `old_index` to `new_index` and return the command to send.
    ///
    /// Returns `Ok(None)` when the row did not move.
    pub fn on_drag_end(
        &mut self,
        old_index: usize,
        new_index: usize,
        scope: &ScopeKey,
        store: &mut EntryStore,
        registry: &mut PendingRegistry,
    ) -> Result<Option<Command>, SyncError> {
        let len = store.len();
        if old_index >= len || new_index >= len {
            return Err(SyncError::InvalidMove {
                from: old_index,
                to: new_index,
                len,
            });
        }
        if old_index == new_index {
            return Ok(None);
        }
        if self.in_flight.is_some() {
            return Err(SyncError::ReorderInFlight);
        }

        let snapshot = store.snapshot();
        let mut ordered_ids: Vec<EntryId> = store.entries().iter().map(|e| e.id.clone()).collect();
        move_item(&mut ordered_ids, old_index, new_index);
        let moved_id = ordered_ids[new_index].clone();

        store.apply_optimistic(Mutation::Reorder {
            ordered_ids: ordered_ids.clone(),
        })?;

        let op_id = OperationId::new();
        registry.register(
            PendingOperation::new(op_id, OpKind::Reorder, ordered_ids.clone())
                .with_saving(vec![moved_id.clone()]),
        );
        self.snapshots.insert(op_id, snapshot);
        self.in_flight = Some(op_id);

        info!(%op_id, %moved_id, from = old_index, to = new_index, rows = ordered_ids.len(), "reorder applied");
        Ok(Some(Command {
            op_id,
            scope: scope.clone(),
            payload: CommandPayload::Reorder { ordered_ids },
        }))
    }

    /// The command went through; the optimistic order is final.
    pub fn on_settled(&mut self, op_id: OperationId) {
        self.snapshots.remove(&op_id);
        if self.in_flight == Some(op_id) {
            self.in_flight = None;
        }
    }

    /// Put back the pre-drag order of the rows that still exist. Returns false
    /// if `op_id` is not a reorder this coordinator started.
    pub fn on_failure(&mut self, op_id: OperationId, store: &mut EntryStore) -> bool {
        let Some(snapshot) = self.snapshots.remove(&op_id) else {
            return false;
        };
        if self.in_flight == Some(op_id) {
            self.in_flight = None;
        }
        warn!(%op_id, "reorder failed; restoring pre-drag order");
        store.restore_orderings(&snapshot);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Entry, EntryStatus};
    use crate::store::is_dense;
    use chrono::Utc;

    fn store_of(ids: &[&str]) -> EntryStore {
        let mut store = EntryStore::new();
        store.replace_all(
            ids.iter()
                .enumerate()
                .map(|(i, id)| Entry {
                    id: EntryId::new(*id),
                    name: id.to_string(),
                    quantity: "1".into(),
                    unit: "pc".into(),
                    value_snapshot: 1.0,
                    per_unit_snapshot: Some(1.0),
                    status: EntryStatus::Planned,
                    ordering: Some(i as i64),
                    created_at: Utc::now(),
                })
                .collect(),
        );
        store
    }

    fn order(store: &EntryStore) -> Vec<String> {
        store.entries().iter().map(|e| e.id.to_string()).collect()
    }

    #[test]
    fn move_item_matches_array_move() {
        let mut v = vec![0, 1, 2, 3];
        move_item(&mut v, 2, 0);
        assert_eq!(v, vec![2, 0, 1, 3]);
        move_item(&mut v, 0, 3);
        assert_eq!(v, vec![0, 1, 3, 2]);
    }

    #[test]
    fn every_move_keeps_ordering_dense() {
        let scope = ScopeKey::new("day:2025-10-18");
        for from in 0..5 {
            for to in 0..5 {
                let mut store = store_of(&["a", "b", "c", "d", "e"]);
                let mut reg = PendingRegistry::default();
                let mut coord = ReorderCoordinator::new();
                coord
                    .on_drag_end(from, to, &scope, &mut store, &mut reg)
                    .unwrap();
                assert!(is_dense(store.entries()), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn second_drag_waits_for_first() {
        let scope = ScopeKey::new("day:2025-10-18");
        let mut store = store_of(&["a", "b", "c"]);
        let mut reg = PendingRegistry::default();
        let mut coord = ReorderCoordinator::new();

        let cmd = coord
            .on_drag_end(0, 2, &scope, &mut store, &mut reg)
            .unwrap()
            .unwrap();
        assert_eq!(
            coord.on_drag_end(0, 1, &scope, &mut store, &mut reg),
            Err(SyncError::ReorderInFlight)
        );
        coord.on_settled(cmd.op_id);
        assert!(coord.on_drag_end(0, 1, &scope, &mut store, &mut reg).is_ok());
    }

    #[test]
    fn failure_restores_snapshot() {
        let scope = ScopeKey::new("day:2025-10-18");
        let mut store = store_of(&["a", "b", "c"]);
        let mut reg = PendingRegistry::default();
        let mut coord = ReorderCoordinator::new();

        let cmd = coord
            .on_drag_end(2, 0, &scope, &mut store, &mut reg)
            .unwrap()
            .unwrap();
        assert_eq!(order(&store), vec!["c", "a", "b"]);
        assert!(coord.on_failure(cmd.op_id, &mut store));
        assert_eq!(order(&store), vec!["a", "b", "c"]);
        assert!(!coord.on_failure(cmd.op_id, &mut store));
        assert_eq!(coord.in_flight(), None);
    }

    #[test]
    fn out_of_range_and_noop_moves() {
        let scope = ScopeKey::new("day:2025-10-18");
        let mut store = store_of(&["a", "b"]);
        let mut reg = PendingRegistry::default();
        let mut coord = ReorderCoordinator::new();
        assert_eq!(
            coord.on_drag_end(0, 2, &scope, &mut store, &mut reg),
            Err(SyncError::InvalidMove { from: 0, to: 2, len: 2 })
        );
        assert_eq!(coord.on_drag_end(1, 1, &scope, &mut store, &mut reg), Ok(None));
        assert!(reg.is_empty());
    }
}
