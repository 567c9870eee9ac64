//! Plain observer registry: `subscribe` returns a handle, `unsubscribe` drops it,
//! and `notify` calls every listener synchronously in subscription order.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub type Listener<T> = Box<dyn FnMut(&T) + Send>;

pub struct Listeners<T: ?Sized> {
    next_id: u64,
    slots: Vec<(SubscriptionId, Listener<T>)>,
}

impl<T: ?Sized> Listeners<T> {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            slots: Vec::new(),
        }
    }

    pub fn subscribe(&mut self, listener: Listener<T>) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.slots.push((id, listener));
        id
    }

    /// Returns false if the handle was already removed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.slots.len();
        self.slots.retain(|(sid, _)| *sid != id);
        self.slots.len() != before
    }

    pub fn notify(&mut self, value: &T) {
        for (_, listener) in self.slots.iter_mut() {
            listener(value);
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl<T: ?Sized> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> fmt::Debug for Listeners<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.slots.len())
            .finish()
    }
}
