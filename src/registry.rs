//! Bookkeeping for mutations this client has started but not yet seen settle.
//!
//! Nothing here can fail. All calls happen on the session's event loop, so a
//! caller that checks and then acks inside one `&mut` borrow cannot have the
//! state change underneath it.

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::model::{EntryId, OperationId, PendingOperation};
use crate::observer::{Listener, Listeners, SubscriptionId};

pub const DEFAULT_RECENT_ACK_CAPACITY: usize = 256;

#[derive(Debug)]
pub struct PendingRegistry {
    ops: Vec<PendingOperation>,
    recent_acks: VecDeque<OperationId>,
    recent_ack_set: HashSet<OperationId>,
    recent_ack_capacity: usize,
    listeners: Listeners<[PendingOperation]>,
}

impl Default for PendingRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_RECENT_ACK_CAPACITY)
    }
}

impl PendingRegistry {
    pub fn new(recent_ack_capacity: usize) -> Self {
        Self {
            ops: Vec::new(),
            recent_acks: VecDeque::new(),
            recent_ack_set: HashSet::new(),
            recent_ack_capacity,
            listeners: Listeners::new(),
        }
    }

    /// Insert or replace by id.
    pub fn register(&mut self, op: PendingOperation) {
        debug!(op_id = %op.id, kind = op.kind.as_str(), entities = op.entity_ids.len(), "register pending op");
        match self.ops.iter_mut().find(|o| o.id == op.id) {
            Some(existing) => *existing = op,
            None => self.ops.push(op),
        }
        self.notify();
    }

    /// Remove an operation. Unknown ids are ignored.
    pub fn ack(&mut self, id: OperationId) -> Option<PendingOperation> {
        let idx = self.ops.iter().position(|o| o.id == id)?;
        let op = self.ops.remove(idx);
        debug!(op_id = %id, kind = op.kind.as_str(), "ack pending op");
        self.remember_ack(id);
        self.notify();
        Some(op)
    }

    /// Remove every operation touching `entity`; true if any matched.
    pub fn ack_by_entity_id(&mut self, entity: &EntryId) -> bool {
        !self.take_by_entity_id(entity).is_empty()
    }

    /// Same as `ack_by_entity_id` but hands back what was removed.
    pub fn take_by_entity_id(&mut self, entity: &EntryId) -> Vec<PendingOperation> {
        let (taken, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.ops).into_iter().partition(|o| o.touches(entity));
        self.ops = kept;
        if !taken.is_empty() {
            for op in &taken {
                debug!(op_id = %op.id, %entity, "ack pending op by entity");
                self.remember_ack(op.id);
            }
            self.notify();
        }
        taken
    }

    /// Record that the direct response came back ok; the op stays registered
    /// for echo suppression but stops counting as saving.
    pub fn mark_confirmed(&mut self, id: OperationId) -> bool {
        let Some(op) = self.ops.iter_mut().find(|o| o.id == id) else {
            return false;
        };
        if op.confirmed_at.is_some() {
            return false;
        }
        op.confirmed_at = Some(Utc::now());
        self.notify();
        true
    }

    pub fn has_pending(&self, id: OperationId) -> bool {
        self.ops.iter().any(|o| o.id == id)
    }

    pub fn has_pending_for_entity(&self, entity: &EntryId) -> bool {
        self.ops.iter().any(|o| o.touches(entity))
    }

    pub fn has_saving_for_entity(&self, entity: &EntryId) -> bool {
        self.ops
            .iter()
            .any(|o| o.confirmed_at.is_none() && o.saving_ids().contains(entity))
    }

    pub fn was_recently_acked(&self, id: OperationId) -> bool {
        self.recent_ack_set.contains(&id)
    }

    pub fn get(&self, id: OperationId) -> Option<&PendingOperation> {
        self.ops.iter().find(|o| o.id == id)
    }

    /// Pending operations in registration order.
    pub fn list(&self) -> &[PendingOperation] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Drop operations confirmed before `cutoff` whose echo never came.
    pub fn sweep_confirmed(&mut self, cutoff: DateTime<Utc>) -> Vec<PendingOperation> {
        let (stale, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.ops)
            .into_iter()
            .partition(|o| o.confirmed_at.is_some_and(|at| at < cutoff));
        self.ops = kept;
        if !stale.is_empty() {
            self.notify();
        }
        stale
    }

    /// Forget everything, listeners included.
    pub fn reset(&mut self) {
        self.ops.clear();
        self.recent_acks.clear();
        self.recent_ack_set.clear();
        self.listeners = Listeners::new();
    }

    pub fn subscribe(&mut self, listener: Listener<[PendingOperation]>) -> SubscriptionId {
        self.listeners.subscribe(listener)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.listeners.unsubscribe(id)
    }

    fn remember_ack(&mut self, id: OperationId) {
        if self.recent_ack_capacity == 0 || !self.recent_ack_set.insert(id) {
            return;
        }
        self.recent_acks.push_back(id);
        while self.recent_acks.len() > self.recent_ack_capacity {
            if let Some(old) = self.recent_acks.pop_front() {
                self.recent_ack_set.remove(&old);
            }
        }
    }

    fn notify(&mut self) {
        self.listeners.notify(&self.ops);
    }
}
