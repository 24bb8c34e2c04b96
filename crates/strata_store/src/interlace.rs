use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDateTime;
use sea_orm::sea_query::Query;

use crate::db::{CHECKSUM, FROM_TS, UNTIL_TS, col, query_all, read_cell, read_opt_ts, read_ts, table_ref};
use crate::store::HistoryStore;
use strata_core::{
    Column, ColumnKind, Frame, InterlaceInput, StrataError, StrataResult, Value,
};

struct SourceRow {
    key: Vec<String>,
    key_values: Vec<Value>,
    from: NaiveDateTime,
    until: Option<NaiveDateTime>,
    payload: Vec<Value>,
}

struct Source {
    payload_columns: Vec<Column>,
    rows: Vec<SourceRow>,
}

struct KeyBucket {
    key_values: Vec<Value>,
    instants: BTreeSet<NaiveDateTime>,
    unbounded: bool,
}

/// Union the inputs on the shared key, splitting every validity interval on
/// the merged set of boundaries. Unbounded intervals are ordered after every
/// finite instant here rather than relying on the backend's NULL sort.
pub(crate) async fn interlace(
    store: &HistoryStore,
    inputs: &[InterlaceInput],
    by: &[String],
) -> StrataResult<Frame> {
    if inputs.is_empty() {
        return Err(StrataError::invalid_identifier(
            "interlace needs at least one input table",
        ));
    }
    if by.is_empty() {
        return Err(StrataError::schema_mismatch(
            "interlace needs at least one key column",
        ));
    }

    let mut sources = Vec::with_capacity(inputs.len());
    let mut key_columns: Option<Vec<Column>> = None;
    for input in inputs {
        let ident = store.resolve(&input.target).await?;
        let declared = store
            .describe(store.connection(), &ident)
            .await?
            .ok_or_else(|| {
                StrataError::invalid_identifier(format!("table {ident} does not exist"))
            })?;
        let from_col = input.from_col.clone().unwrap_or_else(|| FROM_TS.to_string());
        let until_col = input
            .until_col
            .clone()
            .unwrap_or_else(|| UNTIL_TS.to_string());
        for required in [&from_col, &until_col] {
            if !declared.iter().any(|c| &c.name == required) {
                return Err(StrataError::schema_mismatch(format!(
                    "validity column '{required}' not present in {ident}"
                )));
            }
        }
        let keys: Vec<Column> = by
            .iter()
            .map(|key| {
                declared
                    .iter()
                    .find(|c| &c.name == key)
                    .cloned()
                    .ok_or_else(|| {
                        StrataError::schema_mismatch(format!(
                            "key column '{key}' not present in {ident}"
                        ))
                    })
            })
            .collect::<StrataResult<_>>()?;
        if key_columns.is_none() {
            key_columns = Some(keys.clone());
        }
        let payload_columns: Vec<Column> = declared
            .iter()
            .filter(|c| {
                !by.contains(&c.name)
                    && c.name != from_col
                    && c.name != until_col
                    && c.name != CHECKSUM
            })
            .cloned()
            .collect();

        let mut select = Query::select();
        select.from(table_ref(&ident));
        for key in &keys {
            select.column(col(&key.name));
        }
        for column in &payload_columns {
            select.column(col(&column.name));
        }
        select.column(col(&from_col));
        select.column(col(&until_col));
        let rows = query_all(store.connection(), &select).await?;

        let mut parsed = Vec::with_capacity(rows.len());
        for row in rows {
            let key_values = keys
                .iter()
                .map(|key| read_cell(&row, &key.name, key.kind))
                .collect::<StrataResult<Vec<Value>>>()?;
            let payload = payload_columns
                .iter()
                .map(|column| read_cell(&row, &column.name, column.kind))
                .collect::<StrataResult<Vec<Value>>>()?;
            let from = read_ts(&row, &from_col)?;
            let until = read_opt_ts(&row, &until_col)?;
            parsed.push(SourceRow {
                key: key_values.iter().map(Value::to_literal).collect(),
                key_values,
                from,
                until,
                payload,
            });
        }
        sources.push(Source {
            payload_columns,
            rows: parsed,
        });
    }

    let mut buckets: BTreeMap<Vec<String>, KeyBucket> = BTreeMap::new();
    for source in &sources {
        for row in &source.rows {
            let bucket = buckets.entry(row.key.clone()).or_insert_with(|| KeyBucket {
                key_values: row.key_values.clone(),
                instants: BTreeSet::new(),
                unbounded: false,
            });
            bucket.instants.insert(row.from);
            match row.until {
                Some(until) => {
                    bucket.instants.insert(until);
                }
                None => bucket.unbounded = true,
            }
        }
    }

    let mut columns = key_columns.unwrap_or_default();
    for source in &sources {
        columns.extend(source.payload_columns.iter().cloned());
    }
    columns.push(Column::new(FROM_TS, ColumnKind::Timestamp));
    columns.push(Column::new(UNTIL_TS, ColumnKind::Timestamp));
    let mut out = Frame::new(columns)?;

    for (key, bucket) in &buckets {
        let instants: Vec<NaiveDateTime> = bucket.instants.iter().copied().collect();
        let mut intervals: Vec<(NaiveDateTime, Option<NaiveDateTime>)> = instants
            .windows(2)
            .map(|pair| (pair[0], Some(pair[1])))
            .collect();
        if bucket.unbounded
            && let Some(last) = instants.last()
        {
            intervals.push((*last, None));
        }
        for (from, until) in intervals {
            let mut cells = bucket.key_values.clone();
            for source in &sources {
                let matched = source
                    .rows
                    .iter()
                    .find(|row| row.key == *key && row.from <= from && covers(row.until, until));
                match matched {
                    Some(row) => cells.extend(row.payload.iter().cloned()),
                    None => cells.extend(std::iter::repeat_n(
                        Value::Null,
                        source.payload_columns.len(),
                    )),
                }
            }
            cells.push(Value::Timestamp(from));
            cells.push(until.map_or(Value::Null, Value::Timestamp));
            out.push_row(cells)?;
        }
    }
    Ok(out)
}

fn covers(until: Option<NaiveDateTime>, interval_end: Option<NaiveDateTime>) -> bool {
    match (until, interval_end) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(until), Some(end)) => until >= end,
    }
}

#[cfg(test)]
mod tests {
    use super::covers;
    use chrono::NaiveDate;

    fn at(day: u32) -> chrono::NaiveDateTime {
        NaiveDate::from_ymd_opt(2021, 1, day)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    #[test]
    fn unbounded_rows_cover_everything() {
        assert!(covers(None, Some(at(2))));
        assert!(covers(None, None));
    }

    #[test]
    fn bounded_rows_never_cover_unbounded_intervals() {
        assert!(!covers(Some(at(9)), None));
        assert!(covers(Some(at(9)), Some(at(9))));
        assert!(!covers(Some(at(8)), Some(at(9))));
    }
}
