//! Sans-IO composition of the sync components.
//!
//! The engine owns the store, the registry, the scheduler, the bridge and the
//! reorder coordinator. Every user gesture goes through one method here, which
//! applies it to the store right away and hands back the command to send (or
//! schedules it). The caller reports each command's outcome back through
//! `on_command_succeeded` / `on_command_failed`.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bridge::{BridgeStats, Reconciliation, ReconciliationBridge};
use crate::error::SyncError;
use crate::model::{
    Change, ChangeEvent, Command, CommandPayload, Entry, EntryId, EntryStatus, OpKind, OperationId,
    PendingOperation, ScopeKey, RATE_PLACES, VALUE_PLACES,
};
use crate::observer::{Listener, SubscriptionId};
use crate::quantity::{format_quantity, parse_positive_number, round_to};
use crate::registry::{PendingRegistry, DEFAULT_RECENT_ACK_CAPACITY};
use crate::reorder::ReorderCoordinator;
use crate::saving::{SavingIndicator, DEFAULT_MIN_VISIBLE};
use crate::scheduler::{CommitKey, DebouncedCommitScheduler, Field, Prepare, DEFAULT_DEBOUNCE};
use crate::store::{DayTotals, EntryStore, Mutation};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub debounce: Duration,
    pub saving_min_visible: Duration,
    pub recent_ack_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            saving_min_visible: DEFAULT_MIN_VISIBLE,
            recent_ack_capacity: DEFAULT_RECENT_ACK_CAPACITY,
        }
    }
}

/// How the value of a new entry was given.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EntryValue {
    /// Value of one unit; frozen as-is.
    PerUnit(f64),
    /// Value of the whole quantity; the per-unit rate is derived once.
    Total(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewEntry {
    pub id: Option<EntryId>,
    pub name: String,
    pub quantity: String,
    pub unit: String,
    pub value: EntryValue,
    pub status: EntryStatus,
}

impl NewEntry {
    pub fn new(
        name: impl Into<String>,
        quantity: impl Into<String>,
        unit: impl Into<String>,
        value: EntryValue,
    ) -> Self {
        Self {
            id: None,
            name: name.into(),
            quantity: quantity.into(),
            unit: unit.into(),
            value,
            status: EntryStatus::Planned,
        }
    }

    pub fn with_id(mut self, id: impl Into<EntryId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_status(mut self, status: EntryStatus) -> Self {
        self.status = status;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    /// Wait for the edit burst to go quiet.
    Debounced,
    /// Send now, replacing anything scheduled for the same field.
    Immediate,
}

/// What the user is told when a command comes back with an error.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureNotice {
    pub op_id: OperationId,
    pub kind: OpKind,
    pub message: String,
    /// False when a newer edit made the rollback moot.
    pub rolled_back: bool,
}

/// Value of one field before an operation touched it.
#[derive(Debug, Clone, PartialEq)]
enum Prior {
    Quantity {
        quantity: String,
        value_snapshot: f64,
        per_unit_snapshot: Option<f64>,
    },
    Status(EntryStatus),
    /// The row existed; a delete removed it.
    Present(Entry),
    /// The row did not exist; an insert created it.
    Absent,
}

impl Prior {
    fn quantity_of(entry: &Entry) -> Self {
        Prior::Quantity {
            quantity: entry.quantity.clone(),
            value_snapshot: entry.value_snapshot,
            per_unit_snapshot: entry.per_unit_snapshot,
        }
    }
}

#[derive(Debug)]
struct Tracked {
    kind: OpKind,
    entity: Option<EntryId>,
    priors: Vec<(Field, Prior)>,
}

#[derive(Debug)]
pub struct SyncEngine {
    scope: ScopeKey,
    store: EntryStore,
    registry: PendingRegistry,
    scheduler: DebouncedCommitScheduler,
    bridge: ReconciliationBridge,
    reorder: ReorderCoordinator,
    saving: SavingIndicator,
    tracked: HashMap<OperationId, Tracked>,
    latest: HashMap<(EntryId, Field), OperationId>,
    burst_origin: HashMap<EntryId, Prior>,
}

impl SyncEngine {
    pub fn new(scope: ScopeKey, settings: EngineSettings) -> Self {
        Self {
            bridge: ReconciliationBridge::new(scope.clone()),
            scope,
            store: EntryStore::new(),
            registry: PendingRegistry::new(settings.recent_ack_capacity),
            scheduler: DebouncedCommitScheduler::new(settings.debounce),
            reorder: ReorderCoordinator::new(),
            saving: SavingIndicator::new(settings.saving_min_visible),
            tracked: HashMap::new(),
            latest: HashMap::new(),
            burst_origin: HashMap::new(),
        }
    }

    pub fn scope(&self) -> &ScopeKey {
        &self.scope
    }

    pub fn store(&self) -> &EntryStore {
        &self.store
    }

    pub fn registry(&self) -> &PendingRegistry {
        &self.registry
    }

    pub fn entries(&self) -> &[Entry] {
        self.store.entries()
    }

    pub fn totals(&self) -> DayTotals {
        self.store.totals()
    }

    pub fn bridge(&self) -> &ReconciliationBridge {
        &self.bridge
    }

    pub fn bridge_stats(&self) -> BridgeStats {
        self.bridge.stats()
    }

    pub fn subscribe_entries(&mut self, listener: Listener<[Entry]>) -> SubscriptionId {
        self.store.subscribe(listener)
    }

    pub fn subscribe_pending(&mut self, listener: Listener<[PendingOperation]>) -> SubscriptionId {
        self.registry.subscribe(listener)
    }

    pub fn replace_all(&mut self, entries: Vec<Entry>) {
        self.store.replace_all(entries);
    }

    /// Full refresh that keeps local rows with work in flight.
    ///
    /// A row with a pending or scheduled operation keeps its local copy (or is
    /// kept at all, for an insert not yet persisted). A row whose delete is
    /// pending stays gone.
    pub fn reload(&mut self, entries: Vec<Entry>) {
        let mut incoming = entries;
        let deleting: Vec<EntryId> = self
            .registry
            .list()
            .iter()
            .filter(|op| op.kind == OpKind::Delete)
            .flat_map(|op| op.entity_ids.iter().cloned())
            .collect();
        incoming.retain(|e| !deleting.contains(&e.id));

        let mut kept = 0usize;
        for local in self.store.entries() {
            if !self.registry.has_pending_for_entity(&local.id)
                && !self.scheduler.has_scheduled_for(&local.id)
            {
                continue;
            }
            kept += 1;
            match incoming.iter_mut().find(|e| e.id == local.id) {
                Some(slot) => *slot = local.clone(),
                None => incoming.push(local.clone()),
            }
        }
        debug!(scope = %self.scope, rows = incoming.len(), kept, "reload");
        self.store.replace_all(incoming);
    }

    pub fn add_entry(&mut self, new: NewEntry) -> Result<Command, SyncError> {
        let qty = parse_positive_number(&new.quantity)
            .ok_or_else(|| SyncError::InvalidQuantity(new.quantity.clone()))?;
        let (rate, value) = match new.value {
            EntryValue::PerUnit(rate) => {
                check_value(rate)?;
                (rate, round_to(rate * qty, VALUE_PLACES))
            }
            EntryValue::Total(total) => {
                check_value(total)?;
                (round_to(total / qty, RATE_PLACES), round_to(total, VALUE_PLACES))
            }
        };

        let entry = Entry {
            id: new.id.unwrap_or_else(EntryId::generate),
            name: new.name.trim().to_string(),
            quantity: format_quantity(qty),
            unit: new.unit.trim().to_string(),
            value_snapshot: value,
            per_unit_snapshot: Some(rate),
            status: new.status,
            ordering: Some(self.store.next_ordering()),
            created_at: Utc::now(),
        };
        self.store.apply_optimistic(Mutation::Insert(entry.clone()))?;

        let id = entry.id.clone();
        let command = self.command(CommandPayload::Insert { entry });
        self.track(&command, Some(id), vec![(Field::Presence, Prior::Absent)]);
        Ok(command)
    }

    /// Apply a quantity edit. `Debounced` returns `None`; the command comes
    /// out of `fire_due` once the burst goes quiet.
    pub fn edit_quantity(
        &mut self,
        id: &EntryId,
        raw: &str,
        mode: CommitMode,
    ) -> Result<Option<Command>, SyncError> {
        let qty = parse_positive_number(raw)
            .ok_or_else(|| SyncError::InvalidQuantity(raw.to_string()))?;
        let current = self
            .store
            .get(id)
            .ok_or_else(|| SyncError::UnknownEntry(id.clone()))?;

        let key = CommitKey::quantity(id);
        if !self.scheduler.is_scheduled(&key) {
            self.burst_origin.insert(id.clone(), Prior::quantity_of(current));
        }
        self.store.apply_optimistic(Mutation::SetQuantity {
            id: id.clone(),
            quantity: qty,
        })?;

        let scope = self.scope.clone();
        let target = id.clone();
        let quantity = format_quantity(qty);
        let prepare: Prepare = Box::new(move |op_id| Command {
            op_id,
            scope,
            payload: CommandPayload::UpdateQuantity {
                id: target,
                quantity,
            },
        });

        match mode {
            CommitMode::Debounced => {
                self.scheduler.schedule(key, prepare);
                Ok(None)
            }
            CommitMode::Immediate => {
                let command = self.scheduler.flush_now(&key, prepare);
                self.track_quantity(&command, id);
                Ok(Some(command))
            }
        }
    }

    /// Set the status. A quantity edit still waiting on its debounce rides
    /// along in the same command.
    pub fn set_status(&mut self, id: &EntryId, status: EntryStatus) -> Result<Command, SyncError> {
        let prior_status = self
            .store
            .get(id)
            .map(|e| e.status)
            .ok_or_else(|| SyncError::UnknownEntry(id.clone()))?;
        self.store.apply_optimistic(Mutation::SetStatus {
            id: id.clone(),
            status,
        })?;

        let mut priors = vec![(Field::Status, Prior::Status(prior_status))];
        let payload = if self.scheduler.cancel(&CommitKey::quantity(id)) {
            if let Some(origin) = self.burst_origin.remove(id) {
                priors.push((Field::Quantity, origin));
            }
            let quantity = self
                .store
                .get(id)
                .map(|e| e.quantity.clone())
                .ok_or_else(|| SyncError::UnknownEntry(id.clone()))?;
            CommandPayload::UpdateQuantityAndStatus {
                id: id.clone(),
                quantity,
                status,
            }
        } else {
            CommandPayload::UpdateStatus {
                id: id.clone(),
                status,
            }
        };

        let command = self.command(payload);
        self.track(&command, Some(id.clone()), priors);
        Ok(command)
    }

    pub fn delete_entry(&mut self, id: &EntryId) -> Result<Command, SyncError> {
        let mut row = self
            .store
            .get(id)
            .cloned()
            .ok_or_else(|| SyncError::UnknownEntry(id.clone()))?;
        let cancelled = self.scheduler.cancel_entity(id);
        // An unsent quantity edit dies with the row; a rollback brings back what the server has.
        if let Some(Prior::Quantity {
            quantity,
            value_snapshot,
            per_unit_snapshot,
        }) = self.burst_origin.remove(id)
        {
            row.quantity = quantity;
            row.value_snapshot = value_snapshot;
            row.per_unit_snapshot = per_unit_snapshot;
        }
        self.store
            .apply_optimistic(Mutation::Delete { id: id.clone() })?;

        let command = self.command(CommandPayload::Delete { id: id.clone() });
        if cancelled > 0 {
            debug!(op_id = %command.op_id, entity = %id, cancelled, "scheduled commits dropped by delete");
        }
        self.track(
            &command,
            Some(id.clone()),
            vec![(Field::Presence, Prior::Present(row))],
        );
        Ok(command)
    }

    pub fn drag_end(&mut self, old_index: usize, new_index: usize) -> Result<Option<Command>, SyncError> {
        let command = self.reorder.on_drag_end(
            old_index,
            new_index,
            &self.scope,
            &mut self.store,
            &mut self.registry,
        )?;
        if let Some(command) = &command {
            for id in command.payload.entity_ids() {
                self.latest.insert((id, Field::Ordering), command.op_id);
            }
            self.tracked.insert(
                command.op_id,
                Tracked {
                    kind: OpKind::Reorder,
                    entity: None,
                    priors: Vec::new(),
                },
            );
        }
        Ok(command)
    }

    /// Commands whose debounce elapsed, each registered under its fresh op id.
    pub fn fire_due(&mut self, now: Instant) -> Vec<Command> {
        let commands = self.scheduler.fire_due(now);
        for command in &commands {
            if let CommandPayload::UpdateQuantity { id, .. } = &command.payload {
                let id = id.clone();
                self.track_quantity(command, &id);
            }
        }
        commands
    }

    /// Everything still scheduled, regardless of deadline.
    pub fn flush_all(&mut self) -> Vec<Command> {
        let commands = self.scheduler.flush_all();
        for command in &commands {
            if let CommandPayload::UpdateQuantity { id, .. } = &command.payload {
                let id = id.clone();
                self.track_quantity(command, &id);
            }
        }
        commands
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.scheduler.next_deadline()
    }

    pub fn reconcile(&mut self, event: ChangeEvent, now: Instant) -> Reconciliation {
        let entity = event.change.entity_id().clone();
        let server_ordering = match &event.change {
            Change::Insert { row } => Some(row.ordering),
            _ => None,
        };
        let outcome = self
            .bridge
            .reconcile(event, &mut self.registry, &mut self.store);
        match &outcome {
            Reconciliation::Echo(op) => {
                self.saving.release(op.saving_ids(), now);
                // The write landed; nothing left to roll back.
                if let Some(tracked) = self.tracked.get_mut(&op.id) {
                    tracked.priors.clear();
                }
                if op.kind == OpKind::Reorder {
                    self.reorder.on_settled(op.id);
                }
                if let Some(ordering) = server_ordering {
                    self.adopt_ordering(&entity, ordering);
                }
            }
            Reconciliation::HeuristicDelete { acked, .. } => {
                // Matched by entity only. The row is gone either way, but
                // whether our own write landed is known only from its response.
                for op in acked {
                    self.saving.release(op.saving_ids(), now);
                    if let Some(tracked) = self.tracked.get_mut(&op.id) {
                        if tracked.entity.as_ref() == Some(&entity) {
                            tracked.priors.clear();
                        }
                    }
                }
            }
            Reconciliation::EchoTail(_) | Reconciliation::Merged { .. } => {}
        }
        outcome
    }

    /// The server picks insert orderings; take its value unless a local
    /// reorder is still settling.
    fn adopt_ordering(&mut self, id: &EntryId, ordering: Option<i64>) {
        if self.reorder.in_flight().is_some() {
            return;
        }
        let Some(local) = self.store.get(id) else {
            return;
        };
        if local.ordering == ordering {
            return;
        }
        let mut row = local.clone();
        row.ordering = ordering;
        if let Err(err) = self.store.apply_optimistic(Mutation::Replace(row)) {
            warn!(%id, error = %err, "could not adopt server ordering");
        }
    }

    pub fn on_command_succeeded(&mut self, op_id: OperationId, now: Instant) {
        let Some(tracked) = self.tracked.remove(&op_id) else {
            debug!(%op_id, "response for untracked op");
            return;
        };
        if self.registry.mark_confirmed(op_id) {
            if let Some(op) = self.registry.get(op_id) {
                self.saving.release(op.saving_ids(), now);
            }
        }
        if tracked.kind == OpKind::Reorder {
            self.reorder.on_settled(op_id);
        }
        self.forget_latest(op_id);
        debug!(%op_id, kind = tracked.kind.as_str(), "command confirmed");
    }

    /// Ack the failed operation and undo what it alone still owns.
    ///
    /// Returns `None` for an operation this engine never issued.
    pub fn on_command_failed(
        &mut self,
        op_id: OperationId,
        message: impl Into<String>,
        now: Instant,
    ) -> Option<FailureNotice> {
        let message = message.into();
        let tracked = self.tracked.remove(&op_id)?;
        if let Some(op) = self.registry.ack(op_id) {
            self.saving.release(op.saving_ids(), now);
        }

        let mut rolled_back = false;
        if tracked.kind == OpKind::Reorder {
            rolled_back = self.reorder.on_failure(op_id, &mut self.store);
        }
        if let Some(entity) = &tracked.entity {
            for (field, prior) in tracked.priors {
                if !self.is_latest(entity, field, op_id) {
                    info!(%op_id, %entity, ?field, "newer attempt exists; rollback skipped");
                    continue;
                }
                rolled_back |= self.restore(entity, prior);
            }
        }
        self.forget_latest(op_id);

        warn!(%op_id, kind = tracked.kind.as_str(), rolled_back, error = %message, "command failed");
        Some(FailureNotice {
            op_id,
            kind: tracked.kind,
            message,
            rolled_back,
        })
    }

    pub fn is_saving(&self, id: &EntryId, now: Instant) -> bool {
        self.saving.is_visible(&self.registry, id, now)
    }

    pub fn saving_entities(&self, now: Instant) -> BTreeSet<EntryId> {
        self.saving.visible(&self.registry, now)
    }

    /// Drop expired linger windows; returns the next one still running.
    pub fn prune_saving(&mut self, now: Instant) -> Option<Instant> {
        self.saving.prune(now)
    }

    pub fn next_saving_expiry(&self) -> Option<Instant> {
        self.saving.next_expiry()
    }

    /// Forget confirmed operations whose echo has not shown up within `max_age`.
    pub fn sweep_stale(&mut self, max_age: Duration) -> Vec<PendingOperation> {
        let Some(cutoff) = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return Vec::new();
        };
        let stale = self.registry.sweep_confirmed(cutoff);
        for op in &stale {
            warn!(op_id = %op.id, kind = op.kind.as_str(), confirmed_at = ?op.confirmed_at, "echo never arrived; dropping confirmed op");
        }
        stale
    }

    fn command(&self, payload: CommandPayload) -> Command {
        Command {
            op_id: OperationId::new(),
            scope: self.scope.clone(),
            payload,
        }
    }

    fn track(&mut self, command: &Command, entity: Option<EntryId>, priors: Vec<(Field, Prior)>) {
        self.registry.register(command.pending_operation());
        if let Some(entity) = &entity {
            for (field, _) in &priors {
                self.latest.insert((entity.clone(), *field), command.op_id);
            }
        }
        self.tracked.insert(
            command.op_id,
            Tracked {
                kind: command.kind(),
                entity,
                priors,
            },
        );
    }

    fn track_quantity(&mut self, command: &Command, id: &EntryId) {
        let priors = self
            .burst_origin
            .remove(id)
            .map(|origin| vec![(Field::Quantity, origin)])
            .unwrap_or_default();
        self.track(command, Some(id.clone()), priors);
    }

    fn is_latest(&self, entity: &EntryId, field: Field, op_id: OperationId) -> bool {
        self.latest.get(&(entity.clone(), field)) == Some(&op_id)
            && !self
                .scheduler
                .is_scheduled(&CommitKey::new(entity.clone(), field))
    }

    fn forget_latest(&mut self, op_id: OperationId) {
        self.latest.retain(|_, latest| *latest != op_id);
    }

    fn restore(&mut self, entity: &EntryId, prior: Prior) -> bool {
        let mutation = match prior {
            Prior::Quantity {
                quantity,
                value_snapshot,
                per_unit_snapshot,
            } => {
                let Some(mut row) = self.store.get(entity).cloned() else {
                    return false;
                };
                row.quantity = quantity;
                row.value_snapshot = value_snapshot;
                row.per_unit_snapshot = per_unit_snapshot;
                Mutation::Replace(row)
            }
            Prior::Status(status) => Mutation::SetStatus {
                id: entity.clone(),
                status,
            },
            Prior::Present(row) => {
                if self.store.get(entity).is_some() {
                    return false;
                }
                Mutation::Replace(row)
            }
            Prior::Absent => Mutation::Delete { id: entity.clone() },
        };
        self.store.apply_optimistic(mutation).is_ok()
    }
}

fn check_value(value: f64) -> Result<(), SyncError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(SyncError::InvalidRate(value))
    }
}
