use super::row::{Row, RowId};
use super::zset::Weight;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Kind of an upstream row mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    /// Convert from string representation
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "insert" | "create" => Some(ChangeKind::Insert),
            "update" => Some(ChangeKind::Update),
            "delete" => Some(ChangeKind::Delete),
            _ => None,
        }
    }

    /// Net membership weight of the mutation
    #[inline]
    pub fn weight(&self) -> Weight {
        match self {
            ChangeKind::Insert => 1,
            ChangeKind::Update => 0,
            ChangeKind::Delete => -1,
        }
    }
}

/// One row mutation from the upstream change feed.
///
/// Inserts carry `after`, deletes carry `before`, updates carry both. The
/// replica fills in `before` for updates and deletes from its own state, so
/// producers may omit it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChangeEvent {
    pub table: SmolStr,
    #[serde(rename = "op")]
    pub kind: ChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Row>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Row>,
}

impl RowChangeEvent {
    pub fn insert(table: impl Into<SmolStr>, after: Row) -> Self {
        Self {
            table: table.into(),
            kind: ChangeKind::Insert,
            before: None,
            after: Some(after),
        }
    }

    pub fn update(table: impl Into<SmolStr>, before: Option<Row>, after: Row) -> Self {
        Self {
            table: table.into(),
            kind: ChangeKind::Update,
            before,
            after: Some(after),
        }
    }

    pub fn delete(table: impl Into<SmolStr>, before: Row) -> Self {
        Self {
            table: table.into(),
            kind: ChangeKind::Delete,
            before: Some(before),
            after: None,
        }
    }

    /// The row that identifies this change: `after` when present.
    pub fn identifying_row(&self) -> Option<&Row> {
        self.after.as_ref().or(self.before.as_ref())
    }
}

/// All changes committed upstream at one source version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedBatch {
    pub version: u64,
    pub changes: Vec<RowChangeEvent>,
}

/// A row flowing through a pipeline together with its identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OutputRow {
    pub id: RowId,
    pub row: Row,
}

impl OutputRow {
    pub fn new(id: RowId, row: Row) -> Self {
        Self { id, row }
    }
}

/// A weighted change to a relation. Updates never appear here: they travel
/// as a `Remove` of the old row followed by an `Add` of the new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Add(OutputRow),
    Remove(OutputRow),
}

impl Change {
    #[inline]
    pub fn weight(&self) -> Weight {
        match self {
            Change::Add(_) => 1,
            Change::Remove(_) => -1,
        }
    }

    #[inline]
    pub fn output(&self) -> &OutputRow {
        match self {
            Change::Add(r) | Change::Remove(r) => r,
        }
    }

    pub fn id(&self) -> &RowId {
        &self.output().id
    }

    pub fn row(&self) -> &Row {
        &self.output().row
    }

    pub fn is_add(&self) -> bool {
        matches!(self, Change::Add(_))
    }

    /// Same row with the given sign.
    pub fn with_weight(row: OutputRow, weight: Weight) -> Self {
        if weight > 0 {
            Change::Add(row)
        } else {
            Change::Remove(row)
        }
    }
}
