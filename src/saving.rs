//! "Saving…" label with a minimum visible duration.
//!
//! An entry shows as saving while the registry has an unconfirmed operation
//! for it, and for `min_visible` after that operation leaves, so fast
//! round-trips do not flicker. There is no upper bound.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use tokio::time::Instant;

use crate::model::EntryId;
use crate::registry::PendingRegistry;

pub const DEFAULT_MIN_VISIBLE: Duration = Duration::from_millis(250);

#[derive(Debug)]
pub struct SavingIndicator {
    min_visible: Duration,
    linger_until: HashMap<EntryId, Instant>,
}

impl Default for SavingIndicator {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_VISIBLE)
    }
}

impl SavingIndicator {
    pub fn new(min_visible: Duration) -> Self {
        Self {
            min_visible,
            linger_until: HashMap::new(),
        }
    }

    /// Start the linger window for entries whose operation just stopped saving.
    pub fn release<'a>(&mut self, ids: impl IntoIterator<Item = &'a EntryId>, now: Instant) {
        let until = now + self.min_visible;
        for id in ids {
            self.linger_until.insert(id.clone(), until);
        }
    }

    pub fn is_visible(&self, registry: &PendingRegistry, id: &EntryId, now: Instant) -> bool {
        registry.has_saving_for_entity(id)
            || self.linger_until.get(id).is_some_and(|until| *until > now)
    }

    /// Every entry currently showing the label.
    pub fn visible(&self, registry: &PendingRegistry, now: Instant) -> BTreeSet<EntryId> {
        let mut out: BTreeSet<EntryId> = self
            .linger_until
            .iter()
            .filter(|(_, until)| **until > now)
            .map(|(id, _)| id.clone())
            .collect();
        for op in registry.list().iter().filter(|o| o.confirmed_at.is_none()) {
            out.extend(op.saving_ids().iter().cloned());
        }
        out
    }

    /// Drop expired windows; returns the next expiry still pending.
    pub fn prune(&mut self, now: Instant) -> Option<Instant> {
        self.linger_until.retain(|_, until| *until > now);
        self.next_expiry()
    }

    pub fn next_expiry(&self) -> Option<Instant> {
        self.linger_until.values().min().copied()
    }
}
