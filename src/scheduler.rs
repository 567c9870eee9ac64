//! Debounced commits.
//!
//! A burst of edits to one field of one entry collapses into a single command
//! carrying the last value. A new edit replaces the pending one and restarts
//! its quiet period; nothing queues behind it.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use crate::model::{Command, EntryId, OperationId};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(600);

/// Editable field of an entry; also the unit of "latest attempt" tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Quantity,
    Status,
    /// Existence of the row (insert, delete).
    Presence,
    Ordering,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommitKey {
    pub entity: EntryId,
    pub field: Field,
}

impl CommitKey {
    pub fn new(entity: EntryId, field: Field) -> Self {
        Self { entity, field }
    }

    pub fn quantity(entity: &EntryId) -> Self {
        Self::new(entity.clone(), Field::Quantity)
    }
}

/// Builds the outbound command once its operation id exists.
pub type Prepare = Box<dyn FnOnce(OperationId) -> Command + Send>;

struct Scheduled {
    deadline: Instant,
    prepare: Prepare,
}

pub struct DebouncedCommitScheduler {
    delay: Duration,
    pending: HashMap<CommitKey, Scheduled>,
}

impl fmt::Debug for DebouncedCommitScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebouncedCommitScheduler")
            .field("delay", &self.delay)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Default for DebouncedCommitScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE)
    }
}

impl DebouncedCommitScheduler {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: HashMap::new(),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Start or restart the quiet period for `key`.
    pub fn schedule(&mut self, key: CommitKey, prepare: Prepare) {
        let deadline = Instant::now() + self.delay;
        self.pending.insert(key, Scheduled { deadline, prepare });
    }

    /// Drop any scheduled commit for `key` and build the command right away.
    pub fn flush_now(&mut self, key: &CommitKey, prepare: Prepare) -> Command {
        self.pending.remove(key);
        prepare(OperationId::new())
    }

    /// Clear a scheduled commit without sending it.
    pub fn cancel(&mut self, key: &CommitKey) -> bool {
        self.pending.remove(key).is_some()
    }

    /// Cancel every scheduled commit for one entry.
    pub fn cancel_entity(&mut self, entity: &EntryId) -> usize {
        let before = self.pending.len();
        self.pending.retain(|k, _| &k.entity != entity);
        before - self.pending.len()
    }

    pub fn is_scheduled(&self, key: &CommitKey) -> bool {
        self.pending.contains_key(key)
    }

    pub fn has_scheduled_for(&self, entity: &EntryId) -> bool {
        self.pending.keys().any(|k| &k.entity == entity)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|s| s.deadline).min()
    }

    /// Build commands for every key whose quiet period has elapsed, earliest first.
    pub fn fire_due(&mut self, now: Instant) -> Vec<Command> {
        let mut due: Vec<(Instant, CommitKey)> = self
            .pending
            .iter()
            .filter(|(_, s)| s.deadline <= now)
            .map(|(k, s)| (s.deadline, k.clone()))
            .collect();
        due.sort_by_key(|(deadline, _)| *deadline);

        due.into_iter()
            .filter_map(|(_, key)| self.pending.remove(&key))
            .map(|s| (s.prepare)(OperationId::new()))
            .collect()
    }

    /// Build every scheduled command now, regardless of deadline.
    pub fn flush_all(&mut self) -> Vec<Command> {
        let mut all: Vec<Scheduled> = self.pending.drain().map(|(_, s)| s).collect();
        all.sort_by_key(|s| s.deadline);
        all.into_iter()
            .map(|s| (s.prepare)(OperationId::new()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CommandPayload, ScopeKey};

    fn qty_prepare(id: &str, qty: &str) -> Prepare {
        let id = EntryId::new(id);
        let qty = qty.to_string();
        Box::new(move |op_id| Command {
            op_id,
            scope: ScopeKey::new("day:2025-10-18"),
            payload: CommandPayload::UpdateQuantity { id, quantity: qty },
        })
    }

    fn quantity_of(cmd: &Command) -> &str {
        match &cmd.payload {
            CommandPayload::UpdateQuantity { quantity, .. } => quantity,
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_collapses_to_last_value() {
        let mut s = DebouncedCommitScheduler::default();
        let key = CommitKey::quantity(&"e1".into());
        let start = Instant::now();

        s.schedule(key.clone(), qty_prepare("e1", "110"));
        tokio::time::advance(Duration::from_millis(100)).await;
        s.schedule(key.clone(), qty_prepare("e1", "120"));
        tokio::time::advance(Duration::from_millis(100)).await;
        s.schedule(key.clone(), qty_prepare("e1", "130"));

        assert_eq!(s.len(), 1);
        assert_eq!(s.next_deadline(), Some(start + Duration::from_millis(800)));

        tokio::time::advance(Duration::from_millis(599)).await;
        assert!(s.fire_due(Instant::now()).is_empty());

        tokio::time::advance(Duration::from_millis(1)).await;
        let fired = s.fire_due(Instant::now());
        assert_eq!(fired.len(), 1);
        assert_eq!(quantity_of(&fired[0]), "130");
        assert!(s.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn flush_supersedes_pending_timer() {
        let mut s = DebouncedCommitScheduler::default();
        let key = CommitKey::quantity(&"e1".into());
        s.schedule(key.clone(), qty_prepare("e1", "5"));

        let cmd = s.flush_now(&key, qty_prepare("e1", "6"));
        assert_eq!(quantity_of(&cmd), "6");

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(s.fire_due(Instant::now()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_independent_and_cancellable() {
        let mut s = DebouncedCommitScheduler::new(Duration::from_millis(50));
        let a = CommitKey::quantity(&"a".into());
        let b = CommitKey::quantity(&"b".into());
        s.schedule(a.clone(), qty_prepare("a", "1"));
        s.schedule(b.clone(), qty_prepare("b", "2"));
        assert!(s.cancel(&a));
        assert!(!s.cancel(&a));
        assert!(s.has_scheduled_for(&"b".into()));

        tokio::time::advance(Duration::from_millis(50)).await;
        let fired = s.fire_due(Instant::now());
        assert_eq!(fired.len(), 1);
        assert_eq!(quantity_of(&fired[0]), "2");
    }
}
