use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::frame::{Column, Frame, Value};
use crate::ident::TableIdent;

/// Snapshot data handed to `update_snapshot`: either an in-memory frame or a
/// table already present on the connection.
#[derive(Clone, Debug)]
pub enum Snapshot {
    Frame(Frame),
    Table(TableIdent),
}

impl From<Frame> for Snapshot {
    fn from(value: Frame) -> Self {
        Snapshot::Frame(value)
    }
}

impl From<TableIdent> for Snapshot {
    fn from(value: TableIdent) -> Self {
        Snapshot::Table(value)
    }
}

#[derive(Clone, Debug)]
pub struct UpdateSnapshotInput {
    pub data: Snapshot,
    pub target: TableIdent,
    pub timestamp: NaiveDateTime,
    pub filters: Option<Frame>,
    pub message: Option<String>,
    /// Reject updates earlier than the table's newest `from_ts`. Defaults to
    /// the store-wide configuration when unset.
    pub enforce_chronological_order: Option<bool>,
}

impl UpdateSnapshotInput {
    pub fn new(
        data: impl Into<Snapshot>,
        target: TableIdent,
        timestamp: NaiveDateTime,
    ) -> Self {
        Self {
            data: data.into(),
            target,
            timestamp,
            filters: None,
            message: None,
            enforce_chronological_order: None,
        }
    }
}

/// Row-level change counters for one reconciliation, as logged.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct UpdateReport {
    pub n_insertions: u64,
    pub n_deactivations: u64,
    pub n_redundant: u64,
}

/// One interlace input: a historical table plus the names its validity
/// columns carry when they deviate from `from_ts` / `until_ts`.
#[derive(Clone, Debug)]
pub struct InterlaceInput {
    pub target: TableIdent,
    pub from_col: Option<String>,
    pub until_col: Option<String>,
}

impl InterlaceInput {
    pub fn new(target: TableIdent) -> Self {
        Self {
            target,
            from_col: None,
            until_col: None,
        }
    }
}

/// A portable change set: every row version whose `from_ts` fell inside the
/// export window, including closed intervals. Serializable, so it can cross a
/// trust boundary between two sites.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Delta {
    pub columns: Vec<Column>,
    pub rows: Vec<DeltaRow>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeltaRow {
    pub payload: Vec<Value>,
    pub checksum: String,
    pub from_ts: NaiveDateTime,
    pub until_ts: Option<NaiveDateTime>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
