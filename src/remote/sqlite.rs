use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use sqlx::sqlite::{SqliteConnection, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, instrument, warn};

use super::RemoteStore;
use crate::model::{
    Change, ChangeEvent, Command, CommandPayload, Entry, EntryId, EntryStatus, OperationId,
    ScopeKey,
};
use crate::quantity::parse_positive_number;

pub type Pool = SqlitePool;

const ENTRY_COLUMNS: &str = "id, name, qty, unit, value_snapshot, per_unit_snapshot, status, ordering, created_at";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    if normalized.starts_with("sqlite::memory") {
        // Every connection to :memory: is its own database; keep exactly one alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect(&normalized)
            .await?;
        return Ok(pool);
    }
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Adds `mode=rwc` so a
/// fresh data dir gets its database file created on first connect.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match path_part.strip_prefix("~/") {
        Some(rest) => match std::env::var("HOME") {
            Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
            Err(_) => path_part.to_string(),
        },
        None => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let query = match query_part {
        Some(q) if q.contains("mode=") => q.to_string(),
        Some(q) => format!("{q}&mode=rwc"),
        None => "mode=rwc".to_string(),
    };
    format!("sqlite://{expanded_path}?{query}")
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// SQLite-backed remote store with an in-process broadcast change feed.
///
/// Writes are serialised behind one writer lock and run in a transaction, so
/// two reorders racing from different sessions apply one after the other and
/// the second is rejected if it was computed against a stale id set.
#[derive(Debug)]
pub struct SqliteRemote {
    pool: Pool,
    write_lock: Mutex<()>,
    events: StdMutex<broadcast::Sender<(ScopeKey, ChangeEvent)>>,
    capacity: usize,
    echo_delete_op_ids: bool,
}

impl SqliteRemote {
    pub fn new(pool: Pool, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self {
            pool,
            write_lock: Mutex::new(()),
            events: StdMutex::new(tx),
            capacity,
            echo_delete_op_ids: false,
        }
    }

    /// Stamp delete events with the operation id. Off by default: a deleted
    /// row has nowhere to keep it, so clients fall back to matching by entity.
    pub fn with_delete_op_ids(mut self, enabled: bool) -> Self {
        self.echo_delete_op_ids = enabled;
        self
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// End every open feed stream, as a network drop would.
    pub fn disconnect_feeds(&self) {
        let (tx, _) = broadcast::channel(self.capacity);
        if let Ok(mut guard) = self.events.lock() {
            *guard = tx;
        }
        info!("change feeds disconnected");
    }

    fn publish(&self, scope: &ScopeKey, event: ChangeEvent) {
        let Ok(tx) = self.events.lock() else {
            return;
        };
        // No subscribers is fine.
        let _ = tx.send((scope.clone(), event));
    }

    fn feed_receiver(&self) -> Result<broadcast::Receiver<(ScopeKey, ChangeEvent)>> {
        self.events
            .lock()
            .map(|tx| tx.subscribe())
            .map_err(|_| anyhow!("change feed sender poisoned"))
    }

    async fn apply_command(&self, command: &Command) -> Result<Vec<ChangeEvent>> {
        let scope = &command.scope;
        let op_id = command.op_id;
        let mut tx = self.pool.begin().await?;

        let events = match &command.payload {
            CommandPayload::Insert { entry } => {
                let ordering: i64 = sqlx::query_scalar(
                    "SELECT COALESCE(MAX(ordering) + 1, 0) FROM entries WHERE scope = ?",
                )
                .bind(scope.as_str())
                .fetch_one(&mut *tx)
                .await?;
                let mut row = entry.clone();
                row.ordering = Some(ordering);
                insert_entry(&mut tx, scope, &row, op_id).await?;
                vec![ChangeEvent::new(Change::Insert { row }, Some(op_id))]
            }
            CommandPayload::UpdateQuantity { id, quantity } => {
                let current = require_entry(&mut tx, scope, id).await?;
                let next = requantify(&current, quantity)?;
                write_entry(&mut tx, scope, &next, op_id).await?;
                vec![ChangeEvent::new(Change::Update { row: next }, Some(op_id))]
            }
            CommandPayload::UpdateStatus { id, status } => {
                let mut next = require_entry(&mut tx, scope, id).await?;
                next.status = *status;
                write_entry(&mut tx, scope, &next, op_id).await?;
                vec![ChangeEvent::new(Change::Update { row: next }, Some(op_id))]
            }
            CommandPayload::UpdateQuantityAndStatus {
                id,
                quantity,
                status,
            } => {
                let current = require_entry(&mut tx, scope, id).await?;
                let mut next = requantify(&current, quantity)?;
                next.status = *status;
                write_entry(&mut tx, scope, &next, op_id).await?;
                vec![ChangeEvent::new(Change::Update { row: next }, Some(op_id))]
            }
            CommandPayload::Delete { id } => {
                let res = sqlx::query("DELETE FROM entries WHERE id = ? AND scope = ?")
                    .bind(id.as_str())
                    .bind(scope.as_str())
                    .execute(&mut *tx)
                    .await?;
                if res.rows_affected() == 0 {
                    bail!("entry {} not found in {}", id, scope);
                }
                let carried = self.echo_delete_op_ids.then_some(op_id);
                vec![ChangeEvent::new(Change::Delete { id: id.clone() }, carried)]
            }
            CommandPayload::Reorder { ordered_ids } => {
                reorder_entries(&mut tx, scope, ordered_ids, op_id).await?;
                fetch_scope(&mut tx, scope)
                    .await?
                    .into_iter()
                    .map(|row| ChangeEvent::new(Change::Update { row }, Some(op_id)))
                    .collect()
            }
        };

        tx.commit().await?;
        Ok(events)
    }
}

#[async_trait]
impl RemoteStore for SqliteRemote {
    #[instrument(skip_all, fields(scope = %scope))]
    async fn load(&self, scope: &ScopeKey) -> Result<Vec<Entry>> {
        let mut conn = self.pool.acquire().await?;
        fetch_scope(&mut conn, scope).await
    }

    #[instrument(skip_all, fields(op_id = %command.op_id, kind = command.kind().as_str()))]
    async fn submit(&self, command: &Command) -> Result<()> {
        let _writer = self.write_lock.lock().await;
        let events = self
            .apply_command(command)
            .await
            .with_context(|| format!("{} command failed", command.kind().as_str()))?;
        debug!(events = events.len(), "command persisted");
        for event in events {
            self.publish(&command.scope, event);
        }
        Ok(())
    }

    #[instrument(skip_all, fields(scope = %scope))]
    async fn subscribe(&self, scope: &ScopeKey) -> Result<BoxStream<'static, ChangeEvent>> {
        let rx = self.feed_receiver()?;
        let scope = scope.clone();
        // A lagging subscriber is dropped: the session reconnects and reloads.
        let feed = stream::unfold(rx, |mut rx| async move {
            match rx.recv().await {
                Ok(msg) => Some((msg, rx)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "change feed lagged; closing feed");
                    None
                }
                Err(broadcast::error::RecvError::Closed) => None,
            }
        })
        .filter_map(move |(event_scope, event)| {
            let keep = event_scope == scope;
            futures::future::ready(keep.then_some(event))
        })
        .boxed();
        Ok(feed)
    }
}

fn requantify(current: &Entry, quantity: &str) -> Result<Entry> {
    let qty = parse_positive_number(quantity)
        .ok_or_else(|| anyhow!("invalid quantity {:?}", quantity))?;
    Ok(current.requantified(qty))
}

async fn insert_entry(
    conn: &mut SqliteConnection,
    scope: &ScopeKey,
    entry: &Entry,
    op_id: OperationId,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO entries (id, scope, name, qty, unit, value_snapshot, per_unit_snapshot, status, ordering, created_at, client_op_id) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(entry.id.as_str())
    .bind(scope.as_str())
    .bind(&entry.name)
    .bind(&entry.quantity)
    .bind(&entry.unit)
    .bind(entry.value_snapshot)
    .bind(entry.per_unit_snapshot)
    .bind(entry.status.as_str())
    .bind(entry.ordering)
    .bind(entry.created_at)
    .bind(op_id.to_string())
    .execute(&mut *conn)
    .await
    .with_context(|| format!("failed to insert entry {}", entry.id))?;
    Ok(())
}

async fn write_entry(
    conn: &mut SqliteConnection,
    scope: &ScopeKey,
    entry: &Entry,
    op_id: OperationId,
) -> Result<()> {
    sqlx::query(
        "UPDATE entries SET qty = ?, value_snapshot = ?, per_unit_snapshot = ?, status = ?, client_op_id = ? \
         WHERE id = ? AND scope = ?",
    )
    .bind(&entry.quantity)
    .bind(entry.value_snapshot)
    .bind(entry.per_unit_snapshot)
    .bind(entry.status.as_str())
    .bind(op_id.to_string())
    .bind(entry.id.as_str())
    .bind(scope.as_str())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn reorder_entries(
    conn: &mut SqliteConnection,
    scope: &ScopeKey,
    ordered_ids: &[EntryId],
    op_id: OperationId,
) -> Result<()> {
    let current: Vec<String> = sqlx::query_scalar("SELECT id FROM entries WHERE scope = ?")
        .bind(scope.as_str())
        .fetch_all(&mut *conn)
        .await?;
    let current: HashSet<&str> = current.iter().map(String::as_str).collect();
    let proposed: HashSet<&str> = ordered_ids.iter().map(EntryId::as_str).collect();
    if proposed.len() != ordered_ids.len() || proposed != current {
        bail!(
            "stale reorder for {}: {} ids proposed, {} rows present",
            scope,
            ordered_ids.len(),
            current.len()
        );
    }

    for (idx, id) in ordered_ids.iter().enumerate() {
        sqlx::query("UPDATE entries SET ordering = ?, client_op_id = ? WHERE id = ? AND scope = ?")
            .bind(idx as i64)
            .bind(op_id.to_string())
            .bind(id.as_str())
            .bind(scope.as_str())
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn require_entry(conn: &mut SqliteConnection, scope: &ScopeKey, id: &EntryId) -> Result<Entry> {
    let row = sqlx::query(&format!(
        "SELECT {ENTRY_COLUMNS} FROM entries WHERE id = ? AND scope = ?"
    ))
    .bind(id.as_str())
    .bind(scope.as_str())
    .fetch_optional(&mut *conn)
    .await?;
    let Some(row) = row else {
        bail!("entry {} not found in {}", id, scope);
    };
    entry_from_row(&row)
}

async fn fetch_scope(conn: &mut SqliteConnection, scope: &ScopeKey) -> Result<Vec<Entry>> {
    let rows = sqlx::query(&format!(
        "SELECT {ENTRY_COLUMNS} FROM entries WHERE scope = ? \
         ORDER BY ordering IS NULL, ordering ASC, created_at ASC"
    ))
    .bind(scope.as_str())
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(entry_from_row).collect()
}

fn entry_from_row(row: &SqliteRow) -> Result<Entry> {
    let id: String = row.get("id");
    let status_str: String = row.get("status");
    let status = EntryStatus::parse_status(&status_str)
        .ok_or_else(|| anyhow!("entry {} has unknown status {}", id, status_str))?;
    let created_at: DateTime<Utc> = row
        .try_get("created_at")
        .with_context(|| format!("entry {} has unreadable created_at", id))?;

    Ok(Entry {
        id: EntryId::new(id),
        name: row.get("name"),
        quantity: row.get("qty"),
        unit: row.get("unit"),
        value_snapshot: row.get("value_snapshot"),
        per_unit_snapshot: row.try_get::<Option<f64>, _>("per_unit_snapshot").ok().flatten(),
        status,
        ordering: row.try_get::<Option<i64>, _>("ordering").ok().flatten(),
        created_at,
    })
}
