use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::quantity::{format_quantity, parse_positive_number, round_to};

/// Decimal places kept on `value_snapshot`.
pub const VALUE_PLACES: i32 = 2;
/// Decimal places kept on a derived per-unit rate.
pub const RATE_PLACES: i32 = 4;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(String);

impl EntryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Client-side id for rows that must be referenced before the server answers.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntryId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EntryId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(Uuid);

impl OperationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight hex digits, for log lines and the pending-ops view.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Push-subscription and command scope, e.g. `day:2025-10-18`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeKey(String);

impl ScopeKey {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn day(date: NaiveDate) -> Self {
        Self(format!("day:{}", date.format("%Y-%m-%d")))
    }

    /// Strict `YYYY-MM-DD`; rejects impossible dates such as `2025-02-30`.
    pub fn parse_day(ymd: &str) -> Option<Self> {
        let ymd = ymd.trim();
        if ymd.len() != 10 {
            return None;
        }
        NaiveDate::parse_from_str(ymd, "%Y-%m-%d")
            .ok()
            .map(Self::day)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Planned,
    Eaten,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Planned => "planned",
            EntryStatus::Eaten => "eaten",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s.trim() {
            "planned" => Some(EntryStatus::Planned),
            "eaten" => Some(EntryStatus::Eaten),
            _ => None,
        }
    }

    pub fn toggled(&self) -> Self {
        match self {
            EntryStatus::Planned => EntryStatus::Eaten,
            EntryStatus::Eaten => EntryStatus::Planned,
        }
    }
}

/// One row of the day's collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub id: EntryId,
    pub name: String,
    /// Kept as text so the display shows exactly what was entered.
    pub quantity: String,
    pub unit: String,
    pub value_snapshot: f64,
    /// Frozen per-unit rate. Never re-derived once present.
    pub per_unit_snapshot: Option<f64>,
    pub status: EntryStatus,
    pub ordering: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Entry {
    /// Copy of this entry with a new quantity, carrying the frozen rate forward.
    ///
    /// Rows that predate the per-unit snapshot derive it once from
    /// `value_snapshot / quantity`; the result is frozen on the returned entry.
    /// If no usable rate exists only the quantity text changes.
    pub fn requantified(&self, qty: f64) -> Entry {
        let mut next = self.clone();
        next.quantity = format_quantity(qty);
        if let Some(rate) = self.rate() {
            next.value_snapshot = round_to(rate * qty, VALUE_PLACES);
            next.per_unit_snapshot = Some(rate);
        }
        next
    }

    pub fn rate(&self) -> Option<f64> {
        self.per_unit_snapshot
            .filter(|p| p.is_finite() && *p > 0.0)
            .or_else(|| self.derived_rate())
    }

    fn derived_rate(&self) -> Option<f64> {
        let base_qty = parse_positive_number(&self.quantity)?;
        if !self.value_snapshot.is_finite() {
            return None;
        }
        Some(round_to(self.value_snapshot / base_qty, RATE_PLACES)).filter(|r| *r > 0.0)
    }
}

/// Closed set of operation kinds; every consumer matches exhaustively.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Insert,
    UpdateQuantity,
    UpdateStatus,
    UpdateQuantityAndStatus,
    Delete,
    Reorder,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Insert => "insert",
            OpKind::UpdateQuantity => "update_quantity",
            OpKind::UpdateStatus => "update_status",
            OpKind::UpdateQuantityAndStatus => "update_quantity_and_status",
            OpKind::Delete => "delete",
            OpKind::Reorder => "reorder",
        }
    }
}

/// One in-flight mutation this client originated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub id: OperationId,
    pub kind: OpKind,
    pub entity_ids: Vec<EntryId>,
    /// Narrower set for the "saving…" label; `entity_ids` when absent.
    pub saving_entity_ids: Option<Vec<EntryId>>,
    pub started_at: DateTime<Utc>,
    /// Set once the command's direct response came back ok.
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl PendingOperation {
    pub fn new(id: OperationId, kind: OpKind, entity_ids: Vec<EntryId>) -> Self {
        Self {
            id,
            kind,
            entity_ids,
            saving_entity_ids: None,
            started_at: Utc::now(),
            confirmed_at: None,
        }
    }

    pub fn with_saving(mut self, saving_entity_ids: Vec<EntryId>) -> Self {
        self.saving_entity_ids = Some(saving_entity_ids);
        self
    }

    pub fn saving_ids(&self) -> &[EntryId] {
        self.saving_entity_ids.as_deref().unwrap_or(&self.entity_ids)
    }

    pub fn touches(&self, entity: &EntryId) -> bool {
        self.entity_ids.contains(entity)
    }
}

/// Outbound command body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandPayload {
    Insert { entry: Entry },
    UpdateQuantity { id: EntryId, quantity: String },
    UpdateStatus { id: EntryId, status: EntryStatus },
    UpdateQuantityAndStatus { id: EntryId, quantity: String, status: EntryStatus },
    Delete { id: EntryId },
    Reorder { ordered_ids: Vec<EntryId> },
}

impl CommandPayload {
    pub fn kind(&self) -> OpKind {
        match self {
            CommandPayload::Insert { .. } => OpKind::Insert,
            CommandPayload::UpdateQuantity { .. } => OpKind::UpdateQuantity,
            CommandPayload::UpdateStatus { .. } => OpKind::UpdateStatus,
            CommandPayload::UpdateQuantityAndStatus { .. } => OpKind::UpdateQuantityAndStatus,
            CommandPayload::Delete { .. } => OpKind::Delete,
            CommandPayload::Reorder { .. } => OpKind::Reorder,
        }
    }

    pub fn entity_ids(&self) -> Vec<EntryId> {
        match self {
            CommandPayload::Insert { entry } => vec![entry.id.clone()],
            CommandPayload::UpdateQuantity { id, .. }
            | CommandPayload::UpdateStatus { id, .. }
            | CommandPayload::UpdateQuantityAndStatus { id, .. }
            | CommandPayload::Delete { id } => vec![id.clone()],
            CommandPayload::Reorder { ordered_ids } => ordered_ids.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub op_id: OperationId,
    pub scope: ScopeKey,
    pub payload: CommandPayload,
}

impl Command {
    pub fn kind(&self) -> OpKind {
        self.payload.kind()
    }

    /// Registry record for this command, saving set defaulting to every touched row.
    pub fn pending_operation(&self) -> PendingOperation {
        PendingOperation::new(self.op_id, self.kind(), self.payload.entity_ids())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Change {
    Insert { row: Entry },
    Update { row: Entry },
    Delete { id: EntryId },
}

impl Change {
    pub fn change_type(&self) -> ChangeType {
        match self {
            Change::Insert { .. } => ChangeType::Insert,
            Change::Update { .. } => ChangeType::Update,
            Change::Delete { .. } => ChangeType::Delete,
        }
    }

    pub fn entity_id(&self) -> &EntryId {
        match self {
            Change::Insert { row } | Change::Update { row } => &row.id,
            Change::Delete { id } => id,
        }
    }
}

/// One message from the push feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub change: Change,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carried_operation_id: Option<OperationId>,
}

impl ChangeEvent {
    pub fn new(change: Change, carried_operation_id: Option<OperationId>) -> Self {
        Self {
            change,
            carried_operation_id,
        }
    }
}
