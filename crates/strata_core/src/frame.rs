use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::{StrataError, StrataResult};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    Text,
    Integer,
    Float,
    Boolean,
    Timestamp,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
}

impl Column {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Timestamp(NaiveDateTime),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn kind(&self) -> Option<ColumnKind> {
        match self {
            Value::Null => None,
            Value::Text(_) => Some(ColumnKind::Text),
            Value::Integer(_) => Some(ColumnKind::Integer),
            Value::Float(_) => Some(ColumnKind::Float),
            Value::Boolean(_) => Some(ColumnKind::Boolean),
            Value::Timestamp(_) => Some(ColumnKind::Timestamp),
        }
    }

    /// Canonical printable rendering. Stable across processes and platforms;
    /// nulls are rendered distinctly from empty strings.
    pub fn to_literal(&self) -> String {
        match self {
            Value::Null => "\u{0}NULL".to_string(),
            Value::Text(v) => v.clone(),
            Value::Integer(v) => v.to_string(),
            Value::Float(v) => format!("{v}"),
            Value::Boolean(v) => v.to_string(),
            Value::Timestamp(v) => v.format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(value: NaiveDateTime) -> Self {
        Value::Timestamp(value)
    }
}

/// An in-memory relation: named, kinded columns plus rows of cells. Snapshots,
/// key filters, and query results all travel as frames.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    columns: Vec<Column>,
    rows: Vec<Vec<Value>>,
}

impl Frame {
    pub fn new(columns: Vec<Column>) -> StrataResult<Self> {
        if columns.is_empty() {
            return Err(StrataError::schema_mismatch("frame has no columns"));
        }
        for (idx, column) in columns.iter().enumerate() {
            if column.name.is_empty() {
                return Err(StrataError::schema_mismatch("empty column name"));
            }
            if columns[..idx].iter().any(|c| c.name == column.name) {
                return Err(StrataError::schema_mismatch(format!(
                    "duplicate column '{}'",
                    column.name
                )));
            }
        }
        Ok(Self {
            columns,
            rows: Vec::new(),
        })
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn push_row(&mut self, row: Vec<Value>) -> StrataResult<()> {
        if row.len() != self.columns.len() {
            return Err(StrataError::schema_mismatch(format!(
                "row has {} cells, frame has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        for (cell, column) in row.iter().zip(&self.columns) {
            if let Some(kind) = cell.kind()
                && kind != column.kind
                && !(kind == ColumnKind::Integer && column.kind == ColumnKind::Float)
            {
                return Err(StrataError::schema_mismatch(format!(
                    "cell kind {kind:?} does not fit column '{}' ({:?})",
                    column.name, column.kind
                )));
            }
        }
        self.rows.push(row);
        Ok(())
    }

    /// Reorder and restrict columns to `names`, erroring on any absent name.
    pub fn project(&self, names: &[String]) -> StrataResult<Frame> {
        let mut indices = Vec::with_capacity(names.len());
        let mut columns = Vec::with_capacity(names.len());
        for name in names {
            let idx = self.column_index(name).ok_or_else(|| {
                StrataError::schema_mismatch(format!("column '{name}' not in frame"))
            })?;
            indices.push(idx);
            columns.push(self.columns[idx].clone());
        }
        let mut projected = Frame::new(columns)?;
        for row in &self.rows {
            projected.push_row(indices.iter().map(|&idx| row[idx].clone()).collect())?;
        }
        Ok(projected)
    }

    /// Keep only rows whose cells over `key_names` match some row of `keys`.
    pub fn semi_join(&self, keys: &Frame, key_names: &[String]) -> StrataResult<Frame> {
        let allowed: std::collections::HashSet<Vec<String>> = keys
            .project(key_names)?
            .rows()
            .iter()
            .map(|row| row.iter().map(Value::to_literal).collect())
            .collect();
        let indices: Vec<usize> = key_names
            .iter()
            .map(|name| {
                self.column_index(name).ok_or_else(|| {
                    StrataError::schema_mismatch(format!("key column '{name}' not in frame"))
                })
            })
            .collect::<StrataResult<_>>()?;
        let mut out = Frame::new(self.columns.clone())?;
        for row in &self.rows {
            let key: Vec<String> = indices.iter().map(|&idx| row[idx].to_literal()).collect();
            if allowed.contains(&key) {
                out.push_row(row.clone())?;
            }
        }
        Ok(out)
    }

    /// Rows rendered to canonical literals, sorted — handy for order-free
    /// comparison in tests and key sets.
    pub fn literal_rows(&self) -> Vec<Vec<String>> {
        let mut rendered: Vec<Vec<String>> = self
            .rows
            .iter()
            .map(|row| row.iter().map(Value::to_literal).collect())
            .collect();
        rendered.sort();
        rendered
    }
}
