//! Push-feed consumer.
//!
//! Each event is classified before the store is touched:
//! 1. carried op id still pending -> ack and discard (our echo);
//! 2. carried op id acked moments ago -> discard (later row of the same echo);
//! 3. delete without op id -> best-effort ack by entity, delete applied anyway;
//! 4. anything else -> merge as someone else's change.

use futures::stream::BoxStream;
use tracing::{debug, instrument};

use crate::model::{Change, ChangeEvent, OperationId, PendingOperation, ScopeKey};
use crate::registry::PendingRegistry;
use crate::remote::RemoteStore;
use crate::store::EntryStore;

#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    /// Our own write came back; local state already has it.
    Echo(PendingOperation),
    /// Another row of an operation that was already acknowledged.
    EchoTail(OperationId),
    /// Delete without op id; `acked` lists local operations matched by entity.
    HeuristicDelete {
        acked: Vec<PendingOperation>,
        changed: bool,
    },
    Merged { changed: bool },
}

impl Reconciliation {
    /// Operations that this event took out of the registry.
    pub fn acked(&self) -> &[PendingOperation] {
        match self {
            Reconciliation::Echo(op) => std::slice::from_ref(op),
            Reconciliation::HeuristicDelete { acked, .. } => acked,
            Reconciliation::EchoTail(_) | Reconciliation::Merged { .. } => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub echoes: u64,
    pub echo_tails: u64,
    pub heuristic_deletes: u64,
    pub merged: u64,
}

#[derive(Debug)]
pub struct ReconciliationBridge {
    scope: ScopeKey,
    stats: BridgeStats,
}

impl ReconciliationBridge {
    pub fn new(scope: ScopeKey) -> Self {
        Self {
            scope,
            stats: BridgeStats::default(),
        }
    }

    pub fn scope(&self) -> &ScopeKey {
        &self.scope
    }

    pub fn stats(&self) -> BridgeStats {
        self.stats
    }

    /// Open the scoped change feed.
    #[instrument(skip_all, fields(scope = %self.scope))]
    pub async fn subscribe(
        &self,
        remote: &dyn RemoteStore,
    ) -> anyhow::Result<BoxStream<'static, ChangeEvent>> {
        remote.subscribe(&self.scope).await
    }

    /// Classify and apply one feed event. The pending check and the ack happen
    /// under the same borrow, before any store mutation.
    pub fn reconcile(
        &mut self,
        event: ChangeEvent,
        registry: &mut PendingRegistry,
        store: &mut EntryStore,
    ) -> Reconciliation {
        let ChangeEvent {
            change,
            carried_operation_id,
        } = event;

        let outcome = match carried_operation_id {
            Some(op_id) if registry.has_pending(op_id) => match registry.ack(op_id) {
                Some(op) => {
                    self.stats.echoes += 1;
                    Reconciliation::Echo(op)
                }
                None => self.merge(&change, store),
            },
            Some(op_id) if registry.was_recently_acked(op_id) => {
                self.stats.echo_tails += 1;
                Reconciliation::EchoTail(op_id)
            }
            None if matches!(change, Change::Delete { .. }) => {
                let acked = registry.take_by_entity_id(change.entity_id());
                let changed = store.apply_remote_change(&change);
                self.stats.heuristic_deletes += 1;
                Reconciliation::HeuristicDelete { acked, changed }
            }
            _ => self.merge(&change, store),
        };

        debug!(
            scope = %self.scope,
            change_type = ?change.change_type(),
            entity = %change.entity_id(),
            carried_op = ?carried_operation_id,
            outcome = outcome_label(&outcome),
            "change feed event"
        );
        outcome
    }

    fn merge(&mut self, change: &Change, store: &mut EntryStore) -> Reconciliation {
        self.stats.merged += 1;
        Reconciliation::Merged {
            changed: store.apply_remote_change(change),
        }
    }
}

fn outcome_label(outcome: &Reconciliation) -> &'static str {
    match outcome {
        Reconciliation::Echo(_) => "echo",
        Reconciliation::EchoTail(_) => "echo_tail",
        Reconciliation::HeuristicDelete { .. } => "heuristic_delete",
        Reconciliation::Merged { .. } => "merged",
    }
}
