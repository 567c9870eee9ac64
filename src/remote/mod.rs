//! The persistence side of the protocol.
//!
//! A remote store persists commands, stamps each written row with the
//! command's operation id, and broadcasts every change (ours included) on a
//! per-scope feed. Feed delivery is at-least-once with no ordering guarantee
//! relative to the command's own response.

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::model::{ChangeEvent, Command, Entry, ScopeKey};

pub mod sqlite;

pub use sqlite::SqliteRemote;

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Full snapshot of a scope, used for the initial load and reloads.
    async fn load(&self, scope: &ScopeKey) -> Result<Vec<Entry>>;

    /// Persist one command; the row(s) it writes carry `command.op_id`.
    async fn submit(&self, command: &Command) -> Result<()>;

    /// Open the scope's change feed. The stream ends when the feed drops.
    async fn subscribe(&self, scope: &ScopeKey) -> Result<BoxStream<'static, ChangeEvent>>;
}
