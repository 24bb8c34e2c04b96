use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use sea_orm::ConnectionTrait;
use sea_orm::sea_query::{ColumnDef, Expr, Query, Table};
use sea_orm::{DatabaseConnection, Statement};

use crate::db::{UpdateLogs, exec, table_ref, ts_value};
use crate::store::build_create_stmt;
use strata_core::{LogRecord, StrataResult, TableIdent, UpdateLogger};

/// The store's configured sink: always traces, optionally appends to a log
/// file per update, optionally inserts one row per update into a log table.
pub struct StoreLogger {
    conn: DatabaseConnection,
    table: Option<TableIdent>,
    file: Option<PathBuf>,
    target: String,
}

impl StoreLogger {
    pub(crate) fn new(
        conn: DatabaseConnection,
        table: Option<TableIdent>,
        dir: Option<String>,
        target: &TableIdent,
        start: NaiveDateTime,
    ) -> Self {
        let file = dir.map(|dir| {
            let dir = PathBuf::from(dir);
            if let Err(err) = std::fs::create_dir_all(&dir) {
                tracing::warn!(error = %err, "could not create log directory");
            }
            dir.join(format!(
                "{}_{}.log",
                start.format("%Y%m%d_%H%M%S"),
                target.table
            ))
        });
        Self {
            conn,
            table,
            file,
            target: target.to_string(),
        }
    }

    fn append_line(&self, level: &str, message: &str) {
        let Some(path) = &self.file else {
            return;
        };
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(mut file) => {
                let now = chrono::Utc::now().naive_utc();
                let _ = writeln!(
                    file,
                    "{} {level} {message}",
                    now.format("%Y-%m-%d %H:%M:%S%.3f")
                );
            }
            Err(err) => tracing::warn!(error = %err, "could not append to log file"),
        }
    }

    async fn ensure_log_table(&self, table: &TableIdent) -> StrataResult<()> {
        let backend = self.conn.get_database_backend();
        let mut stmt = Table::create();
        stmt.table(table_ref(table));
        stmt.if_not_exists();
        let mut start_time = ColumnDef::new(UpdateLogs::StartTime);
        start_time.timestamp().not_null();
        stmt.col(&mut start_time);
        let mut end_time = ColumnDef::new(UpdateLogs::EndTime);
        end_time.timestamp();
        stmt.col(&mut end_time);
        let mut snapshot_time = ColumnDef::new(UpdateLogs::SnapshotTime);
        snapshot_time.timestamp().not_null();
        stmt.col(&mut snapshot_time);
        let mut target = ColumnDef::new(UpdateLogs::Target);
        target.string().not_null();
        stmt.col(&mut target);
        let mut message = ColumnDef::new(UpdateLogs::Message);
        message.text();
        stmt.col(&mut message);
        let mut n_insertions = ColumnDef::new(UpdateLogs::NInsertions);
        n_insertions.big_integer().not_null();
        stmt.col(&mut n_insertions);
        let mut n_deactivations = ColumnDef::new(UpdateLogs::NDeactivations);
        n_deactivations.big_integer().not_null();
        stmt.col(&mut n_deactivations);
        let mut n_redundant = ColumnDef::new(UpdateLogs::NRedundant);
        n_redundant.big_integer().not_null();
        stmt.col(&mut n_redundant);
        let mut success = ColumnDef::new(UpdateLogs::Success);
        success.boolean().not_null();
        stmt.col(&mut success);
        let sql = build_create_stmt(backend, &stmt);
        self.conn
            .execute_raw(Statement::from_string(backend, sql))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl UpdateLogger for StoreLogger {
    fn log_info(&self, message: &str) {
        tracing::info!(target_table = %self.target, "{message}");
        self.append_line("INFO", message);
    }

    fn log_error(&self, message: &str) {
        tracing::error!(target_table = %self.target, "{message}");
        self.append_line("ERROR", message);
    }

    async fn finalize_entry(&self, record: &LogRecord) -> StrataResult<()> {
        self.append_line(
            "INFO",
            &format!(
                "finished: success={} insertions={} deactivations={} redundant={}",
                record.success,
                record.report.n_insertions,
                record.report.n_deactivations,
                record.report.n_redundant
            ),
        );
        let Some(table) = self.table.clone() else {
            return Ok(());
        };
        self.ensure_log_table(&table).await?;
        let insert = Query::insert()
            .into_table(table_ref(&table))
            .columns([
                UpdateLogs::StartTime,
                UpdateLogs::EndTime,
                UpdateLogs::SnapshotTime,
                UpdateLogs::Target,
                UpdateLogs::Message,
                UpdateLogs::NInsertions,
                UpdateLogs::NDeactivations,
                UpdateLogs::NRedundant,
                UpdateLogs::Success,
            ])
            .values_panic([
                Expr::val(ts_value(Some(record.start_time))),
                Expr::val(ts_value(record.end_time)),
                Expr::val(ts_value(Some(record.snapshot_time))),
                Expr::val(record.target.clone()),
                Expr::val(record.message.clone()),
                Expr::val(record.report.n_insertions as i64),
                Expr::val(record.report.n_deactivations as i64),
                Expr::val(record.report.n_redundant as i64),
                Expr::val(record.success),
            ])
            .to_owned();
        exec(&self.conn, &insert).await?;
        Ok(())
    }
}
