use std::fmt;

use chrono::NaiveDateTime;
use sea_orm::DatabaseBackend;
use serde::{Deserialize, Serialize};

use crate::{StrataError, StrataResult};

/// A parsed `catalog.schema.table` identifier. Missing parts are resolved
/// against the connection's defaults before any statement is built.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct TableIdent {
    pub catalog: Option<String>,
    pub schema: Option<String>,
    pub table: String,
}

impl TableIdent {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            catalog: None,
            schema: None,
            table: table.into(),
        }
    }

    pub fn with_schema(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            catalog: None,
            schema: Some(schema.into()),
            table: table.into(),
        }
    }

    /// Parse `table`, `schema.table`, or `catalog.schema.table`. Segments may
    /// be double-quoted to carry dots or spaces.
    pub fn parse(raw: &str) -> StrataResult<Self> {
        let parts = split_segments(raw)?;
        match parts.as_slice() {
            [table] => Ok(Self {
                catalog: None,
                schema: None,
                table: table.clone(),
            }),
            [schema, table] => Ok(Self {
                catalog: None,
                schema: Some(schema.clone()),
                table: table.clone(),
            }),
            [catalog, schema, table] => Ok(Self {
                catalog: Some(catalog.clone()),
                schema: Some(schema.clone()),
                table: table.clone(),
            }),
            _ => Err(StrataError::invalid_identifier(format!(
                "'{raw}' has {} segments, expected 1..=3",
                parts.len()
            ))),
        }
    }

    /// The identifier with its schema filled in when absent.
    pub fn resolved(&self, default_schema: &str) -> Self {
        Self {
            catalog: self.catalog.clone(),
            schema: Some(
                self.schema
                    .clone()
                    .unwrap_or_else(|| default_schema.to_string()),
            ),
            table: self.table.clone(),
        }
    }

    pub fn schema_or(&self, default_schema: &str) -> String {
        self.schema
            .clone()
            .unwrap_or_else(|| default_schema.to_string())
    }

    /// Dialect-correct quoted rendering, e.g. `"main"."mtcars"` on SQLite and
    /// PostgreSQL or `` `main`.`mtcars` `` on MySQL.
    pub fn quoted(&self, backend: DatabaseBackend) -> String {
        let mut parts = Vec::with_capacity(3);
        if let Some(catalog) = &self.catalog {
            parts.push(quote_segment(backend, catalog));
        }
        if let Some(schema) = &self.schema {
            parts.push(quote_segment(backend, schema));
        }
        parts.push(quote_segment(backend, &self.table));
        parts.join(".")
    }
}

impl fmt::Display for TableIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(catalog) = &self.catalog {
            write!(f, "{catalog}.")?;
        }
        if let Some(schema) = &self.schema {
            write!(f, "{schema}.")?;
        }
        write!(f, "{}", self.table)
    }
}

fn quote_segment(backend: DatabaseBackend, segment: &str) -> String {
    match backend {
        DatabaseBackend::MySql => format!("`{}`", segment.replace('`', "``")),
        _ => format!("\"{}\"", segment.replace('"', "\"\"")),
    }
}

/// Render a timestamp as a literal the backend accepts in raw SQL. Statements
/// built through the query builder bind timestamps as parameters instead;
/// this form is for log lines and diagnostics.
pub fn timestamp_literal(backend: DatabaseBackend, ts: NaiveDateTime) -> String {
    let rendered = ts.format("%Y-%m-%d %H:%M:%S%.6f");
    match backend {
        DatabaseBackend::Postgres => format!("TIMESTAMP '{rendered}'"),
        _ => format!("'{rendered}'"),
    }
}

fn split_segments(raw: &str) -> StrataResult<Vec<String>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(StrataError::invalid_identifier("empty identifier"));
    }
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = raw.chars().peekable();
    let mut quoted = false;
    while let Some(ch) = chars.next() {
        match ch {
            '"' if quoted => {
                // Doubled quote inside a quoted segment is an escaped quote.
                if chars.peek() == Some(&'"') {
                    chars.next();
                    current.push('"');
                } else {
                    quoted = false;
                }
            }
            '"' => {
                if !current.is_empty() {
                    return Err(StrataError::invalid_identifier(format!(
                        "'{raw}': quote in the middle of a segment"
                    )));
                }
                quoted = true;
            }
            '.' if !quoted => {
                if current.is_empty() {
                    return Err(StrataError::invalid_identifier(format!(
                        "'{raw}': empty segment"
                    )));
                }
                segments.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    if quoted {
        return Err(StrataError::invalid_identifier(format!(
            "'{raw}': unterminated quote"
        )));
    }
    if current.is_empty() {
        return Err(StrataError::invalid_identifier(format!(
            "'{raw}': empty segment"
        )));
    }
    segments.push(current);
    Ok(segments)
}
