use chrono::NaiveDateTime;
use sea_orm::sea_query;
use sea_orm::sea_query::{
    Alias, ColumnDef, IntoTableRef, MysqlQueryBuilder, PostgresQueryBuilder, QueryStatementWriter,
    SqliteQueryBuilder, TableRef, Value as SeaValue,
};
use sea_orm::{ConnectionTrait, DatabaseBackend, QueryResult, Statement};
use sea_orm_migration::prelude::Iden;

use strata_core::{Column, ColumnKind, StrataError, StrataResult, TableIdent, Value};

/// Inter-process lock registry, one row per held historical table.
#[derive(Iden, Clone, Copy)]
pub enum Locks {
    Table,
    Schema,
    #[iden = "table"]
    TableName,
    User,
    Pid,
    LockStart,
}

/// Append-only sink receiving one record per snapshot update.
#[derive(Iden, Clone, Copy)]
pub enum UpdateLogs {
    Table,
    StartTime,
    EndTime,
    SnapshotTime,
    Target,
    Message,
    NInsertions,
    NDeactivations,
    NRedundant,
    Success,
}

pub const CHECKSUM: &str = "checksum";
pub const FROM_TS: &str = "from_ts";
pub const UNTIL_TS: &str = "until_ts";
pub const BOOKKEEPING: [&str; 3] = [CHECKSUM, FROM_TS, UNTIL_TS];

pub(crate) fn col(name: &str) -> Alias {
    Alias::new(name)
}

pub(crate) fn col_name(column: impl sea_query::Iden) -> String {
    column.to_string()
}

pub(crate) fn table_ref(ident: &TableIdent) -> TableRef {
    match &ident.schema {
        Some(schema) => (Alias::new(schema), Alias::new(&ident.table)).into_table_ref(),
        None => Alias::new(&ident.table).into_table_ref(),
    }
}

pub(crate) fn build_stmt<S: QueryStatementWriter>(
    backend: DatabaseBackend,
    stmt: &S,
) -> (String, sea_orm::sea_query::Values) {
    match backend {
        DatabaseBackend::Sqlite => stmt.build(SqliteQueryBuilder),
        DatabaseBackend::Postgres => stmt.build(PostgresQueryBuilder),
        DatabaseBackend::MySql => stmt.build(MysqlQueryBuilder),
        _ => stmt.build(SqliteQueryBuilder),
    }
}

pub(crate) async fn exec<C, S>(conn: &C, stmt: &S) -> StrataResult<u64>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    let backend = conn.get_database_backend();
    let (sql, values) = build_stmt(backend, stmt);
    let result = conn
        .execute_raw(Statement::from_sql_and_values(backend, sql, values))
        .await?;
    Ok(result.rows_affected())
}

pub(crate) async fn query_all<C, S>(conn: &C, stmt: &S) -> StrataResult<Vec<QueryResult>>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    let backend = conn.get_database_backend();
    let (sql, values) = build_stmt(backend, stmt);
    let rows = conn
        .query_all_raw(Statement::from_sql_and_values(backend, sql, values))
        .await?;
    Ok(rows)
}

pub(crate) async fn query_one<C, S>(conn: &C, stmt: &S) -> StrataResult<Option<QueryResult>>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    let backend = conn.get_database_backend();
    let (sql, values) = build_stmt(backend, stmt);
    let row = conn
        .query_one_raw(Statement::from_sql_and_values(backend, sql, values))
        .await?;
    Ok(row)
}

/// Typed null when the cell is absent, so every backend binds the right
/// parameter type.
pub(crate) fn cell_value(kind: ColumnKind, value: &Value) -> StrataResult<SeaValue> {
    let sea = match (kind, value) {
        (ColumnKind::Text, Value::Null) => SeaValue::String(None),
        (ColumnKind::Integer, Value::Null) => SeaValue::BigInt(None),
        (ColumnKind::Float, Value::Null) => SeaValue::Double(None),
        (ColumnKind::Boolean, Value::Null) => SeaValue::Bool(None),
        (ColumnKind::Timestamp, Value::Null) => SeaValue::ChronoDateTime(None),
        (ColumnKind::Text, Value::Text(v)) => SeaValue::from(v.clone()),
        (ColumnKind::Integer, Value::Integer(v)) => SeaValue::from(*v),
        (ColumnKind::Float, Value::Float(v)) => SeaValue::from(*v),
        (ColumnKind::Float, Value::Integer(v)) => SeaValue::from(*v as f64),
        (ColumnKind::Boolean, Value::Boolean(v)) => SeaValue::from(*v),
        (ColumnKind::Timestamp, Value::Timestamp(v)) => SeaValue::from(*v),
        (kind, value) => {
            return Err(StrataError::schema_mismatch(format!(
                "cell {value:?} does not fit column kind {kind:?}"
            )));
        }
    };
    Ok(sea)
}

pub(crate) fn ts_value(value: Option<NaiveDateTime>) -> SeaValue {
    SeaValue::ChronoDateTime(value)
}

pub(crate) fn read_cell(row: &QueryResult, name: &str, kind: ColumnKind) -> StrataResult<Value> {
    let value = match kind {
        ColumnKind::Text => row
            .try_get::<Option<String>>("", name)?
            .map_or(Value::Null, Value::Text),
        ColumnKind::Integer => read_opt_i64(row, name)?.map_or(Value::Null, Value::Integer),
        ColumnKind::Float => {
            if let Ok(value) = row.try_get::<Option<f64>>("", name) {
                value.map_or(Value::Null, Value::Float)
            } else {
                read_opt_i64(row, name)?.map_or(Value::Null, |v| Value::Float(v as f64))
            }
        }
        ColumnKind::Boolean => {
            if let Ok(value) = row.try_get::<Option<bool>>("", name) {
                value.map_or(Value::Null, Value::Boolean)
            } else {
                read_opt_i64(row, name)?.map_or(Value::Null, |v| Value::Boolean(v != 0))
            }
        }
        ColumnKind::Timestamp => read_opt_ts(row, name)?.map_or(Value::Null, Value::Timestamp),
    };
    Ok(value)
}

fn read_opt_i64(row: &QueryResult, name: &str) -> StrataResult<Option<i64>> {
    if let Ok(value) = row.try_get::<Option<i64>>("", name) {
        return Ok(value);
    }
    let value = row.try_get::<Option<i32>>("", name)?;
    Ok(value.map(i64::from))
}

pub(crate) fn read_opt_ts(row: &QueryResult, name: &str) -> StrataResult<Option<NaiveDateTime>> {
    if let Ok(value) = row.try_get::<Option<NaiveDateTime>>("", name) {
        return Ok(value);
    }
    let raw = row.try_get::<Option<String>>("", name)?;
    let Some(raw) = raw else {
        return Ok(None);
    };
    parse_ts(&raw).map(Some)
}

pub(crate) fn read_ts(row: &QueryResult, name: &str) -> StrataResult<NaiveDateTime> {
    read_opt_ts(row, name)?
        .ok_or_else(|| StrataError::backend(format!("column '{name}' is unexpectedly null")))
}

fn parse_ts(raw: &str) -> StrataResult<NaiveDateTime> {
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(parsed);
        }
    }
    Err(StrataError::backend(format!("unparseable timestamp '{raw}'")))
}

/// Map a backend's declared column type onto the frame kinds. Anything
/// unrecognized degrades to text.
pub(crate) fn parse_column_kind(declared: &str) -> ColumnKind {
    let declared = declared.to_ascii_lowercase();
    if declared.contains("bool") || declared.starts_with("tinyint") {
        ColumnKind::Boolean
    } else if declared.contains("timestamp") || declared.contains("datetime") {
        ColumnKind::Timestamp
    } else if declared.contains("int") {
        ColumnKind::Integer
    } else if ["real", "float", "double", "decimal", "numeric"]
        .iter()
        .any(|t| declared.contains(t))
    {
        ColumnKind::Float
    } else {
        ColumnKind::Text
    }
}

pub(crate) fn column_def(column: &Column) -> ColumnDef {
    let mut def = ColumnDef::new(Alias::new(&column.name));
    match column.kind {
        ColumnKind::Text => def.text(),
        ColumnKind::Integer => def.big_integer(),
        ColumnKind::Float => def.double(),
        ColumnKind::Boolean => def.boolean(),
        ColumnKind::Timestamp => def.timestamp(),
    };
    def
}

#[cfg(test)]
mod tests {
    use super::{Locks, col_name, parse_column_kind};
    use strata_core::ColumnKind;

    #[test]
    fn lock_columns_render_the_reserved_names() {
        assert_eq!(col_name(Locks::Table), "locks");
        assert_eq!(col_name(Locks::TableName), "table");
        assert_eq!(col_name(Locks::User), "user");
        assert_eq!(col_name(Locks::LockStart), "lock_start");
    }

    #[test]
    fn declared_types_map_to_kinds() {
        assert_eq!(parse_column_kind("TEXT"), ColumnKind::Text);
        assert_eq!(parse_column_kind("character varying"), ColumnKind::Text);
        assert_eq!(parse_column_kind("BIGINT"), ColumnKind::Integer);
        assert_eq!(parse_column_kind("tinyint"), ColumnKind::Boolean);
        assert_eq!(parse_column_kind("double precision"), ColumnKind::Float);
        assert_eq!(
            parse_column_kind("timestamp without time zone"),
            ColumnKind::Timestamp
        );
        assert_eq!(parse_column_kind("DATETIME"), ColumnKind::Timestamp);
    }
}
