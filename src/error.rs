use thiserror::Error;

use crate::model::EntryId;

/// Rejections raised by the engine before anything is applied or sent.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SyncError {
    #[error("unknown entry {0}")]
    UnknownEntry(EntryId),
    #[error("entry {0} already exists")]
    DuplicateEntry(EntryId),
    #[error("invalid quantity {0:?}: expected a positive number")]
    InvalidQuantity(String),
    #[error("invalid value {0}: expected a finite number >= 0")]
    InvalidRate(f64),
    #[error("invalid move {from} -> {to} in a list of {len}")]
    InvalidMove { from: usize, to: usize, len: usize },
    #[error("a reorder is still being saved")]
    ReorderInFlight,
}
