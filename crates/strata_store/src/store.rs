use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use sea_orm::sea_query::{
    Alias, ColumnDef, Cond, Expr, MysqlQueryBuilder, Order, PostgresQueryBuilder, Query,
    SimpleExpr, SqliteQueryBuilder, Table, TableCreateStatement, TableDropStatement,
};
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection,
    DatabaseTransaction, ExprTrait, Statement, TransactionTrait,
};

use crate::config::{DatabaseConfig, StrataConfig};
use crate::db::{
    BOOKKEEPING, CHECKSUM, FROM_TS, UNTIL_TS, cell_value, col, column_def, exec,
    parse_column_kind, query_all, query_one, read_cell, read_opt_ts, table_ref, ts_value,
};
use crate::logging::StoreLogger;
use crate::{delta, interlace, lock};
use strata_core::api::{DeltaApi, InterlaceApi, LockApi, SnapshotApi, TableMetaApi};
use strata_core::{
    Column, ColumnKind, Delta, Frame, InterlaceInput, LogRecord, Snapshot, StrataError,
    StrataResult, TableIdent, UpdateLogger, UpdateReport, UpdateSnapshotInput, Value,
    row_checksum,
};

static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

/// Upper bound on bind parameters per staged insert; SQLite's default limit
/// is the smallest of the supported backends.
const MAX_BIND_PARAMS: usize = 400;

#[derive(Clone)]
pub struct HistoryStore {
    conn: DatabaseConnection,
    backend: DatabaseBackend,
    default_schema: Option<String>,
    log_table: Option<String>,
    log_path: Option<String>,
    enforce_chronological_order: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct BackendCapabilities {
    pub transactional_ddl: bool,
    pub native_upsert: bool,
    pub schema_qualified_temp_tables: bool,
}

/// Per-call LIFO stack of staging tables to drop. Drained on every exit path
/// before the transaction resolves; drop failures are logged, not raised.
pub(crate) struct ScopedCleanup {
    drops: Vec<String>,
}

impl ScopedCleanup {
    pub(crate) fn new() -> Self {
        Self { drops: Vec::new() }
    }

    pub(crate) fn defer_drop(&mut self, name: impl Into<String>) {
        self.drops.push(name.into());
    }

    pub(crate) async fn run<C: ConnectionTrait>(&mut self, conn: &C, backend: DatabaseBackend) {
        while let Some(name) = self.drops.pop() {
            let stmt = Table::drop().table(Alias::new(&name)).if_exists().to_owned();
            let sql = build_drop_stmt(backend, &stmt);
            if let Err(err) = conn
                .execute_raw(Statement::from_string(backend, sql))
                .await
            {
                tracing::warn!(table = %name, error = %err, "staging table drop failed");
            }
        }
    }
}

/// Key restriction for one reconciliation: a staged table of key tuples plus
/// the key column names.
struct FilterScope {
    table: String,
    keys: Vec<String>,
}

impl HistoryStore {
    pub async fn connect(config: &StrataConfig, base_dir: &Path) -> StrataResult<Self> {
        let url = build_connection_url(config, base_dir)?;
        let mut options = ConnectOptions::new(url);
        if let Some(pool) = &config.pool {
            if let Some(max) = pool.max_connections {
                options.max_connections(max);
            }
            if let Some(min) = pool.min_connections {
                options.min_connections(min);
            }
            if let Some(timeout_ms) = pool.connect_timeout_ms {
                options.connect_timeout(Duration::from_millis(timeout_ms));
            }
            if let Some(timeout_ms) = pool.acquire_timeout_ms {
                options.acquire_timeout(Duration::from_millis(timeout_ms));
            }
            if let Some(timeout_ms) = pool.idle_timeout_ms {
                options.idle_timeout(Duration::from_millis(timeout_ms));
            }
        }
        let conn = Database::connect(options).await.map_err(StrataError::from)?;
        let backend = conn.get_database_backend();
        Ok(Self {
            conn,
            backend,
            default_schema: config.default_schema.clone(),
            log_table: config.log_table.clone(),
            log_path: config.log_path.clone(),
            enforce_chronological_order: config.enforce_chronological_order.unwrap_or(true),
        })
    }

    pub async fn connect_sqlite(path: &Path) -> StrataResult<Self> {
        let config = StrataConfig::default_sqlite(path.to_string_lossy());
        Self::connect(&config, path.parent().unwrap_or_else(|| Path::new("."))).await
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.conn
    }

    pub fn backend(&self) -> DatabaseBackend {
        self.backend
    }

    pub fn capabilities(&self) -> BackendCapabilities {
        match self.backend {
            DatabaseBackend::Sqlite => BackendCapabilities {
                transactional_ddl: true,
                native_upsert: true,
                schema_qualified_temp_tables: false,
            },
            DatabaseBackend::Postgres => BackendCapabilities {
                transactional_ddl: true,
                native_upsert: true,
                schema_qualified_temp_tables: false,
            },
            DatabaseBackend::MySql => BackendCapabilities {
                transactional_ddl: false,
                native_upsert: false,
                schema_qualified_temp_tables: true,
            },
            _ => BackendCapabilities {
                transactional_ddl: false,
                native_upsert: false,
                schema_qualified_temp_tables: false,
            },
        }
    }

    /// Parse a raw identifier and resolve its schema against the connection.
    pub async fn id(&self, raw: &str) -> StrataResult<TableIdent> {
        let ident = TableIdent::parse(raw)?;
        self.resolve(&ident).await
    }

    pub async fn resolve(&self, ident: &TableIdent) -> StrataResult<TableIdent> {
        if ident.schema.is_some() {
            return Ok(ident.clone());
        }
        Ok(ident.resolved(&self.default_schema().await?))
    }

    /// The schema unqualified identifiers resolve into: the configured
    /// override when present, otherwise the backend's own default.
    pub async fn default_schema(&self) -> StrataResult<String> {
        if let Some(schema) = &self.default_schema {
            return Ok(schema.clone());
        }
        match self.backend {
            DatabaseBackend::Sqlite => Ok("main".to_string()),
            DatabaseBackend::Postgres => self
                .scalar_string("SELECT current_schema()")
                .await?
                .ok_or(StrataError::SchemaUnresolved),
            DatabaseBackend::MySql => self
                .scalar_string("SELECT DATABASE()")
                .await?
                .ok_or(StrataError::SchemaUnresolved),
            _ => Ok("dbo".to_string()),
        }
    }

    /// Schema receiving temporary tables on this backend.
    pub async fn get_schema(&self, temporary: bool) -> StrataResult<String> {
        if !temporary {
            return self.default_schema().await;
        }
        match self.backend {
            DatabaseBackend::Sqlite => Ok("temp".to_string()),
            DatabaseBackend::Postgres => Ok("pg_temp".to_string()),
            _ => self.default_schema().await,
        }
    }

    pub async fn get_catalog(&self) -> StrataResult<Option<String>> {
        match self.backend {
            DatabaseBackend::Sqlite => Ok(Some("main".to_string())),
            DatabaseBackend::Postgres => self.scalar_string("SELECT current_database()").await,
            DatabaseBackend::MySql => self.scalar_string("SELECT DATABASE()").await,
            _ => Ok(None),
        }
    }

    async fn scalar_string(&self, sql: &str) -> StrataResult<Option<String>> {
        let row = self
            .conn
            .query_one_raw(Statement::from_string(self.backend, sql.to_string()))
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(row.try_get_by_index::<Option<String>>(0)?)
    }

    /// Declared columns of a table in declared order, or None when the table
    /// does not exist.
    pub(crate) async fn describe<C: ConnectionTrait>(
        &self,
        conn: &C,
        ident: &TableIdent,
    ) -> StrataResult<Option<Vec<Column>>> {
        let (sql, values): (&str, Vec<sea_orm::sea_query::Value>) = match self.backend {
            DatabaseBackend::Sqlite => (
                "SELECT \"name\", \"type\" FROM pragma_table_info(?) ORDER BY \"cid\"",
                vec![ident.table.clone().into()],
            ),
            DatabaseBackend::Postgres => (
                "SELECT column_name AS \"name\", data_type AS \"type\" \
                 FROM information_schema.columns \
                 WHERE table_schema = $1 AND table_name = $2 \
                 ORDER BY ordinal_position",
                vec![
                    ident.schema.clone().unwrap_or_default().into(),
                    ident.table.clone().into(),
                ],
            ),
            _ => (
                "SELECT column_name AS `name`, data_type AS `type` \
                 FROM information_schema.columns \
                 WHERE table_schema = ? AND table_name = ? \
                 ORDER BY ordinal_position",
                vec![
                    ident.schema.clone().unwrap_or_default().into(),
                    ident.table.clone().into(),
                ],
            ),
        };
        let rows = conn
            .query_all_raw(Statement::from_sql_and_values(
                self.backend,
                sql,
                values,
            ))
            .await?;
        if rows.is_empty() {
            return Ok(None);
        }
        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("", "name")?;
            let declared: String = row.try_get("", "type")?;
            columns.push(Column::new(name, parse_column_kind(&declared)));
        }
        Ok(Some(columns))
    }

    pub(crate) fn historical_layout(columns: &[Column]) -> bool {
        let has = |name: &str, kind: ColumnKind| {
            columns.iter().any(|c| c.name == name && c.kind == kind)
        };
        has(CHECKSUM, ColumnKind::Text)
            && has(FROM_TS, ColumnKind::Timestamp)
            && has(UNTIL_TS, ColumnKind::Timestamp)
    }

    pub(crate) fn payload_of(columns: &[Column]) -> Vec<Column> {
        columns
            .iter()
            .filter(|c| !BOOKKEEPING.contains(&c.name.as_str()))
            .cloned()
            .collect()
    }

    /// Declared payload columns of an existing historical table, checked for
    /// the bookkeeping layout.
    pub(crate) async fn historical_payload<C: ConnectionTrait>(
        &self,
        conn: &C,
        target: &TableIdent,
    ) -> StrataResult<Option<Vec<Column>>> {
        let Some(columns) = self.describe(conn, target).await? else {
            return Ok(None);
        };
        if !Self::historical_layout(&columns) {
            return Err(StrataError::not_historical(
                target.schema.clone().unwrap_or_default(),
                target.table.clone(),
            ));
        }
        Ok(Some(Self::payload_of(&columns)))
    }

    pub(crate) async fn create_historical<C: ConnectionTrait>(
        &self,
        conn: &C,
        columns: &[Column],
        target: &TableIdent,
        temporary: bool,
    ) -> StrataResult<()> {
        let mut stmt = Table::create();
        if temporary {
            stmt.table(Alias::new(&target.table));
            stmt.temporary();
        } else {
            stmt.table(table_ref(target));
        }
        for column in columns {
            if BOOKKEEPING.contains(&column.name.as_str()) {
                continue;
            }
            let mut def = column_def(column);
            stmt.col(&mut def);
        }
        let mut checksum = ColumnDef::new(col(CHECKSUM));
        checksum.text().not_null();
        stmt.col(&mut checksum);
        let mut from_ts = ColumnDef::new(col(FROM_TS));
        from_ts.timestamp().not_null();
        stmt.col(&mut from_ts);
        let mut until_ts = ColumnDef::new(col(UNTIL_TS));
        until_ts.timestamp();
        stmt.col(&mut until_ts);
        self.exec_schema(conn, &stmt).await
    }

    pub(crate) async fn exec_schema<C: ConnectionTrait>(
        &self,
        conn: &C,
        stmt: &TableCreateStatement,
    ) -> StrataResult<()> {
        let sql = build_create_stmt(self.backend, stmt);
        conn.execute_raw(Statement::from_string(self.backend, sql))
            .await?;
        Ok(())
    }

    /// Read an entire plain table into a frame, in declared column order.
    pub(crate) async fn read_table_frame(&self, ident: &TableIdent) -> StrataResult<Frame> {
        let ident = self.resolve(ident).await?;
        let columns = self.describe(&self.conn, &ident).await?.ok_or_else(|| {
            StrataError::invalid_identifier(format!("table {ident} does not exist"))
        })?;
        let mut select = Query::select();
        select.from(table_ref(&ident));
        for column in &columns {
            select.column(col(&column.name));
        }
        let rows = query_all(&self.conn, &select).await?;
        frame_from_rows(columns, rows)
    }

    fn staging_name() -> String {
        format!(
            "strata_stage_{}_{}",
            std::process::id(),
            STAGING_SEQ.fetch_add(1, Ordering::SeqCst)
        )
    }

    /// Copy a frame into a fresh temporary table on the given session,
    /// optionally fingerprinting each row into a `checksum` column.
    async fn stage_frame(
        &self,
        tx: &DatabaseTransaction,
        cleanup: &mut ScopedCleanup,
        frame: &Frame,
        with_checksum: bool,
    ) -> StrataResult<String> {
        let name = Self::staging_name();
        let mut stmt = Table::create();
        stmt.table(Alias::new(&name));
        stmt.temporary();
        for column in frame.columns() {
            let mut def = column_def(column);
            stmt.col(&mut def);
        }
        if with_checksum {
            let mut def = ColumnDef::new(col(CHECKSUM));
            def.text().not_null();
            stmt.col(&mut def);
        }
        self.exec_schema(tx, &stmt).await?;
        cleanup.defer_drop(&name);

        let mut columns: Vec<Alias> = frame.columns().iter().map(|c| col(&c.name)).collect();
        if with_checksum {
            columns.push(col(CHECKSUM));
        }
        let width = columns.len();
        let rows_per_stmt = (MAX_BIND_PARAMS / width).max(1);
        for chunk in frame.rows().chunks(rows_per_stmt) {
            let mut insert = Query::insert();
            insert.into_table(Alias::new(&name));
            insert.columns(columns.clone());
            for row in chunk {
                let mut values = Vec::with_capacity(width);
                for (cell, column) in row.iter().zip(frame.columns()) {
                    values.push(Expr::val(cell_value(column.kind, cell)?));
                }
                if with_checksum {
                    values.push(Expr::val(row_checksum(frame.columns(), row)));
                }
                insert.values_panic(values);
            }
            exec(tx, &insert).await?;
        }
        Ok(name)
    }

    fn live_at(t: NaiveDateTime) -> Cond {
        Cond::all()
            .add(Expr::col(col(FROM_TS)).lte(t))
            .add(
                Cond::any()
                    .add(Expr::col(col(UNTIL_TS)).gt(t))
                    .add(Expr::col(col(UNTIL_TS)).is_null()),
            )
    }

    /// `EXISTS` restriction of the target table to key tuples present in the
    /// staged filter table.
    fn scope_cond(target_table: &str, scope: &FilterScope) -> SimpleExpr {
        let mut sub = Query::select();
        sub.from(Alias::new(&scope.table));
        sub.expr(Expr::val(1));
        for key in &scope.keys {
            sub.and_where(
                Expr::col((Alias::new(&scope.table), Alias::new(key)))
                    .equals((Alias::new(target_table), Alias::new(key))),
            );
        }
        Expr::exists(sub)
    }

    async fn boundary_after(
        &self,
        tx: &DatabaseTransaction,
        target: &TableIdent,
        column: &str,
        t: NaiveDateTime,
        scope: Option<&FilterScope>,
    ) -> StrataResult<Option<NaiveDateTime>> {
        let mut select = Query::select();
        select.from(table_ref(target));
        select.expr_as(Expr::col(col(column)).min(), Alias::new("value"));
        select.and_where(Expr::col(col(column)).gt(t));
        if let Some(scope) = scope {
            select.and_where(Self::scope_cond(&target.table, scope));
        }
        let Some(row) = query_one(tx, &select).await? else {
            return Ok(None);
        };
        read_opt_ts(&row, "value")
    }

    /// Earliest future boundary in the scoped history: rows inserted at `t`
    /// close at this instant so a later backfill splices in cleanly.
    async fn next_timestamp(
        &self,
        tx: &DatabaseTransaction,
        target: &TableIdent,
        t: NaiveDateTime,
        scope: Option<&FilterScope>,
    ) -> StrataResult<Option<NaiveDateTime>> {
        let next_from = self.boundary_after(tx, target, FROM_TS, t, scope).await?;
        let next_until = self.boundary_after(tx, target, UNTIL_TS, t, scope).await?;
        Ok(match (next_from, next_until) {
            (Some(a), Some(b)) => Some(Ord::min(a, b)),
            (Some(a), None) => Some(a),
            (None, b) => b,
        })
    }

    async fn max_from_ts(
        &self,
        tx: &DatabaseTransaction,
        target: &TableIdent,
    ) -> StrataResult<Option<NaiveDateTime>> {
        let mut select = Query::select();
        select.from(table_ref(target));
        select.expr_as(Expr::col(col(FROM_TS)).max(), Alias::new("value"));
        let Some(row) = query_one(tx, &select).await? else {
            return Ok(None);
        };
        read_opt_ts(&row, "value")
    }

    async fn configured_logger(&self, target: &TableIdent, start: NaiveDateTime) -> StoreLogger {
        let table = match &self.log_table {
            Some(raw) => match TableIdent::parse(raw) {
                Ok(ident) => match self.resolve(&ident).await {
                    Ok(resolved) => Some(resolved),
                    Err(err) => {
                        tracing::warn!(error = %err, "log table schema unresolved");
                        None
                    }
                },
                Err(err) => {
                    tracing::warn!(error = %err, "invalid log_table identifier");
                    None
                }
            },
            None => None,
        };
        StoreLogger::new(
            self.conn.clone(),
            table,
            self.log_path.clone(),
            target,
            start,
        )
    }

    /// `update_snapshot` with a caller-supplied sink instead of the
    /// configured one.
    pub async fn update_snapshot_with_logger(
        &self,
        input: UpdateSnapshotInput,
        logger: &dyn UpdateLogger,
    ) -> StrataResult<UpdateReport> {
        let target = self.resolve(&input.target).await?;
        let enforce = input
            .enforce_chronological_order
            .unwrap_or(self.enforce_chronological_order);
        let snapshot = match input.data {
            Snapshot::Frame(frame) => frame,
            Snapshot::Table(ident) => self.read_table_frame(&ident).await?,
        };
        let schema = target
            .schema
            .clone()
            .ok_or(StrataError::SchemaUnresolved)?;
        let lock_schema = self.default_schema().await?;
        let mut record = LogRecord::begin(
            target.to_string(),
            input.timestamp,
            input.message.clone(),
        );

        match lock::acquire(
            &self.conn,
            &lock_schema,
            &schema,
            &target.table,
            &lock::HostProbe,
        )
        .await?
        {
            lock::LockState::Acquired => {}
            lock::LockState::Busy { user, pid } => {
                return Err(StrataError::LockBusy {
                    schema,
                    table: target.table.clone(),
                    user,
                    pid,
                });
            }
        }
        logger.log_info(&format!(
            "updating {target} at {}",
            input.timestamp.format("%Y-%m-%d %H:%M:%S%.6f")
        ));

        let outcome = self
            .reconcile(
                &target,
                snapshot,
                input.timestamp,
                input.filters.as_ref(),
                enforce,
                logger,
            )
            .await;

        record.end_time = Some(chrono::Utc::now().naive_utc());
        match &outcome {
            Ok(report) => {
                record.report = *report;
                record.success = true;
            }
            Err(err) => logger.log_error(&err.to_string()),
        }
        if let Err(err) = logger.finalize_entry(&record).await {
            tracing::warn!(target_table = %target, error = %err, "log sink failed");
        }
        let unlocked = lock::release(
            &self.conn,
            &lock_schema,
            &schema,
            &target.table,
            std::process::id(),
        )
        .await;
        let report = outcome?;
        unlocked?;
        Ok(report)
    }

    async fn reconcile(
        &self,
        target: &TableIdent,
        snapshot: Frame,
        t: NaiveDateTime,
        filters: Option<&Frame>,
        enforce: bool,
        logger: &dyn UpdateLogger,
    ) -> StrataResult<UpdateReport> {
        let tx = self.conn.begin().await?;
        let mut cleanup = ScopedCleanup::new();
        let result = self
            .reconcile_in(&tx, &mut cleanup, target, snapshot, t, filters, enforce, logger)
            .await;
        cleanup.run(&tx, self.backend).await;
        match result {
            Ok(report) => {
                tx.commit().await?;
                Ok(report)
            }
            Err(err) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "rollback failed after reconcile error");
                }
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn reconcile_in(
        &self,
        tx: &DatabaseTransaction,
        cleanup: &mut ScopedCleanup,
        target: &TableIdent,
        snapshot: Frame,
        t: NaiveDateTime,
        filters: Option<&Frame>,
        enforce: bool,
        logger: &dyn UpdateLogger,
    ) -> StrataResult<UpdateReport> {
        // Snapshots read back from another historical table may still carry
        // bookkeeping columns; they are never part of the payload.
        let snapshot = {
            let non_bookkeeping: Vec<String> = snapshot
                .column_names()
                .into_iter()
                .filter(|name| !BOOKKEEPING.contains(&name.as_str()))
                .collect();
            if non_bookkeeping.len() == snapshot.columns().len() {
                snapshot
            } else {
                snapshot.project(&non_bookkeeping)?
            }
        };
        let payload = match self.historical_payload(tx, target).await? {
            Some(payload) => {
                let mut expected: Vec<&str> =
                    payload.iter().map(|c| c.name.as_str()).collect();
                let mut supplied: Vec<&str> = snapshot
                    .columns()
                    .iter()
                    .map(|c| c.name.as_str())
                    .collect();
                expected.sort_unstable();
                supplied.sort_unstable();
                if expected != supplied {
                    return Err(StrataError::schema_mismatch(format!(
                        "snapshot columns {supplied:?} do not match {target} payload {expected:?}"
                    )));
                }
                payload
            }
            None => {
                logger.log_info(&format!("creating historical table {target}"));
                self.create_historical(tx, snapshot.columns(), target, false)
                    .await?;
                Self::payload_of(snapshot.columns())
            }
        };

        // Snapshot cells in declared column order; the fingerprint depends
        // on it.
        let snapshot = snapshot.project(
            &payload
                .iter()
                .map(|c| c.name.clone())
                .collect::<Vec<String>>(),
        )?;

        if enforce
            && let Some(max_from) = self.max_from_ts(tx, target).await?
            && t < max_from
        {
            return Err(StrataError::out_of_order(format!(
                "timestamp {t} precedes the newest from_ts {max_from} of {target}"
            )));
        }

        let (snapshot, scope) = match filters {
            Some(filters) => {
                let keys = filters.column_names();
                for key in &keys {
                    if !payload.iter().any(|c| &c.name == key) {
                        return Err(StrataError::schema_mismatch(format!(
                            "filter column '{key}' is not a payload column of {target}"
                        )));
                    }
                }
                let restricted = snapshot.semi_join(filters, &keys)?;
                let table = self.stage_frame(tx, cleanup, filters, false).await?;
                (restricted, Some(FilterScope { table, keys }))
            }
            None => (snapshot, None),
        };

        let stage = self.stage_frame(tx, cleanup, &snapshot, true).await?;
        logger.log_info(&format!(
            "staged {} snapshot rows for {target}",
            snapshot.len()
        ));

        let next_ts = self.next_timestamp(tx, target, t, scope.as_ref()).await?;

        // Deactivations: live rows whose checksum left the snapshot close at t.
        let mut deactivate = Query::update();
        deactivate.table(table_ref(target));
        deactivate.values([(col(UNTIL_TS), ts_value(Some(t)).into())]);
        deactivate.cond_where(Self::live_at(t));
        deactivate.and_where(
            Expr::col(col(CHECKSUM)).not_in_subquery(
                Query::select()
                    .column(col(CHECKSUM))
                    .from(Alias::new(&stage))
                    .to_owned(),
            ),
        );
        if let Some(scope) = &scope {
            deactivate.and_where(Self::scope_cond(&target.table, scope));
        }
        let n_deactivations = exec(tx, &deactivate).await?;
        logger.log_info(&format!("deactivated {n_deactivations} rows"));

        // Insertions: snapshot checksums not live at t open at t and close at
        // the next boundary.
        let mut live_checksums = Query::select();
        live_checksums.from(table_ref(target));
        live_checksums.column(col(CHECKSUM));
        live_checksums.cond_where(Self::live_at(t));
        if let Some(scope) = &scope {
            live_checksums.and_where(Self::scope_cond(&target.table, scope));
        }
        let mut source = Query::select();
        source.from(Alias::new(&stage));
        for column in &payload {
            source.column(col(&column.name));
        }
        source.column(col(CHECKSUM));
        source.expr(Expr::val(ts_value(Some(t))));
        source.expr(Expr::val(ts_value(next_ts)));
        source.and_where(
            Expr::col((Alias::new(&stage), col(CHECKSUM)))
                .not_in_subquery(live_checksums),
        );
        let mut insert = Query::insert();
        insert.into_table(table_ref(target));
        let mut insert_columns: Vec<Alias> =
            payload.iter().map(|c| col(&c.name)).collect();
        insert_columns.push(col(CHECKSUM));
        insert_columns.push(col(FROM_TS));
        insert_columns.push(col(UNTIL_TS));
        insert.columns(insert_columns);
        insert
            .select_from(source)
            .map_err(|err| StrataError::backend(err.to_string()))?;
        let n_insertions = exec(tx, &insert).await?;
        logger.log_info(&format!("inserted {n_insertions} rows"));

        // Rows superseded at the instant they appeared carry no information.
        let mut zero_length = Query::delete();
        zero_length.from_table(table_ref(target));
        zero_length.and_where(Expr::col(col(FROM_TS)).equals(col(UNTIL_TS)));
        if let Some(scope) = &scope {
            zero_length.and_where(Self::scope_cond(&target.table, scope));
        }
        let n_zero = exec(tx, &zero_length).await?;

        let n_collapsed = if enforce {
            0
        } else {
            self.collapse_adjacent(tx, target, scope.as_ref()).await?
        };
        let n_redundant = n_zero + n_collapsed;
        if n_redundant > 0 {
            logger.log_info(&format!("removed {n_redundant} redundant rows"));
        }

        Ok(UpdateReport {
            n_insertions,
            n_deactivations,
            n_redundant,
        })
    }

    /// Merge adjacent same-checksum rows whose intervals meet. Runs after
    /// out-of-order updates, which are the only source of such pairs.
    async fn collapse_adjacent(
        &self,
        tx: &DatabaseTransaction,
        target: &TableIdent,
        scope: Option<&FilterScope>,
    ) -> StrataResult<u64> {
        let mut select = Query::select();
        select.from(table_ref(target));
        select.column(col(CHECKSUM));
        select.column(col(FROM_TS));
        select.column(col(UNTIL_TS));
        if let Some(scope) = scope {
            select.and_where(Self::scope_cond(&target.table, scope));
        }
        select.order_by(col(CHECKSUM), Order::Asc);
        select.order_by(col(FROM_TS), Order::Asc);
        let rows = query_all(tx, &select).await?;

        let mut collapsed = 0u64;
        let mut prev: Option<(String, NaiveDateTime, Option<NaiveDateTime>)> = None;
        for row in rows {
            let checksum: String = row.try_get("", CHECKSUM)?;
            let from_ts = read_opt_ts(&row, FROM_TS)?.ok_or_else(|| {
                StrataError::backend(format!("null from_ts in {target}"))
            })?;
            let until_ts = read_opt_ts(&row, UNTIL_TS)?;
            if let Some(previous) = &mut prev
                && previous.0 == checksum
                && previous.2 == Some(from_ts)
            {
                let mut delete = Query::delete();
                delete.from_table(table_ref(target));
                delete.and_where(Expr::col(col(CHECKSUM)).eq(checksum.clone()));
                delete.and_where(Expr::col(col(FROM_TS)).eq(from_ts));
                exec(tx, &delete).await?;
                let mut update = Query::update();
                update.table(table_ref(target));
                update.values([(col(UNTIL_TS), ts_value(until_ts).into())]);
                update.and_where(Expr::col(col(CHECKSUM)).eq(checksum.clone()));
                update.and_where(Expr::col(col(FROM_TS)).eq(previous.1));
                exec(tx, &update).await?;
                previous.2 = until_ts;
                collapsed += 1;
            } else {
                prev = Some((checksum, from_ts, until_ts));
            }
        }
        Ok(collapsed)
    }
}

#[async_trait]
impl SnapshotApi for HistoryStore {
    async fn update_snapshot(&self, input: UpdateSnapshotInput) -> StrataResult<UpdateReport> {
        let start = chrono::Utc::now().naive_utc();
        let target = self.resolve(&input.target).await?;
        let logger = self.configured_logger(&target, start).await;
        self.update_snapshot_with_logger(input, &logger).await
    }

    async fn get_table(
        &self,
        target: &TableIdent,
        slice_ts: Option<NaiveDateTime>,
        include_slice_info: bool,
    ) -> StrataResult<Frame> {
        let target = self.resolve(target).await?;
        let payload = self
            .historical_payload(&self.conn, &target)
            .await?
            .ok_or_else(|| {
                StrataError::invalid_identifier(format!("table {target} does not exist"))
            })?;
        let mut columns = payload;
        if include_slice_info {
            columns.push(Column::new(CHECKSUM, ColumnKind::Text));
            columns.push(Column::new(FROM_TS, ColumnKind::Timestamp));
            columns.push(Column::new(UNTIL_TS, ColumnKind::Timestamp));
        }
        let mut select = Query::select();
        select.from(table_ref(&target));
        for column in &columns {
            select.column(col(&column.name));
        }
        if let Some(t) = slice_ts {
            select.cond_where(Self::live_at(t));
        }
        let rows = query_all(&self.conn, &select).await?;
        frame_from_rows(columns, rows)
    }

    async fn filter_keys(
        &self,
        target: &TableIdent,
        filters: Option<&Frame>,
    ) -> StrataResult<Frame> {
        let frame = self.read_table_frame(target).await?;
        match filters {
            Some(filters) => frame.semi_join(filters, &filters.column_names()),
            None => Ok(frame),
        }
    }
}

#[async_trait]
impl TableMetaApi for HistoryStore {
    async fn is_historical(&self, target: &TableIdent) -> StrataResult<bool> {
        let target = self.resolve(target).await?;
        let Some(columns) = self.describe(&self.conn, &target).await? else {
            return Ok(false);
        };
        Ok(Self::historical_layout(&columns))
    }

    async fn create_table(
        &self,
        sample: &Frame,
        target: &TableIdent,
        temporary: bool,
    ) -> StrataResult<()> {
        let target = self.resolve(target).await?;
        self.create_historical(&self.conn, sample.columns(), &target, temporary)
            .await
    }
}

#[async_trait]
impl LockApi for HistoryStore {
    async fn lock_table(
        &self,
        target: &TableIdent,
        schema: Option<&str>,
    ) -> StrataResult<bool> {
        let target = self.resolve(target).await?;
        let target_schema = target
            .schema
            .clone()
            .ok_or(StrataError::SchemaUnresolved)?;
        let lock_schema = match schema {
            Some(schema) => schema.to_string(),
            None => self.default_schema().await?,
        };
        match lock::acquire(
            &self.conn,
            &lock_schema,
            &target_schema,
            &target.table,
            &lock::HostProbe,
        )
        .await?
        {
            lock::LockState::Acquired => Ok(true),
            lock::LockState::Busy { .. } => Ok(false),
        }
    }

    async fn unlock_table(
        &self,
        target: &TableIdent,
        schema: Option<&str>,
        pid: Option<u32>,
    ) -> StrataResult<()> {
        let target = self.resolve(target).await?;
        let target_schema = target
            .schema
            .clone()
            .ok_or(StrataError::SchemaUnresolved)?;
        let lock_schema = match schema {
            Some(schema) => schema.to_string(),
            None => self.default_schema().await?,
        };
        lock::release(
            &self.conn,
            &lock_schema,
            &target_schema,
            &target.table,
            pid.unwrap_or_else(std::process::id),
        )
        .await
    }
}

#[async_trait]
impl InterlaceApi for HistoryStore {
    async fn interlace(&self, inputs: &[InterlaceInput], by: &[String]) -> StrataResult<Frame> {
        interlace::interlace(self, inputs, by).await
    }
}

#[async_trait]
impl DeltaApi for HistoryStore {
    async fn delta_export(
        &self,
        target: &TableIdent,
        from_ts: NaiveDateTime,
        until_ts: Option<NaiveDateTime>,
    ) -> StrataResult<Delta> {
        delta::export(self, target, from_ts, until_ts).await
    }

    async fn delta_load(&self, target: &TableIdent, deltas: Vec<Delta>) -> StrataResult<()> {
        delta::load(self, target, deltas).await
    }
}

pub(crate) fn frame_from_rows(
    columns: Vec<Column>,
    rows: Vec<sea_orm::QueryResult>,
) -> StrataResult<Frame> {
    let mut frame = Frame::new(columns.clone())?;
    for row in rows {
        let cells = columns
            .iter()
            .map(|column| read_cell(&row, &column.name, column.kind))
            .collect::<StrataResult<Vec<Value>>>()?;
        frame.push_row(cells)?;
    }
    Ok(frame)
}

fn build_connection_url(config: &StrataConfig, base_dir: &Path) -> StrataResult<String> {
    match &config.database {
        DatabaseConfig::Sqlite { .. } => {
            let path = config.sqlite_path(base_dir)?;
            Ok(format!("sqlite://{}?mode=rwc", path.display()))
        }
        DatabaseConfig::Postgres { url } => Ok(url.clone()),
        DatabaseConfig::Mysql { url } => Ok(url.clone()),
    }
}

pub(crate) fn build_create_stmt(
    backend: DatabaseBackend,
    stmt: &TableCreateStatement,
) -> String {
    match backend {
        DatabaseBackend::Sqlite => stmt.build(SqliteQueryBuilder),
        DatabaseBackend::Postgres => stmt.build(PostgresQueryBuilder),
        DatabaseBackend::MySql => stmt.build(MysqlQueryBuilder),
        _ => stmt.build(SqliteQueryBuilder),
    }
}

pub(crate) fn build_drop_stmt(backend: DatabaseBackend, stmt: &TableDropStatement) -> String {
    match backend {
        DatabaseBackend::Sqlite => stmt.build(SqliteQueryBuilder),
        DatabaseBackend::Postgres => stmt.build(PostgresQueryBuilder),
        DatabaseBackend::MySql => stmt.build(MysqlQueryBuilder),
        _ => stmt.build(SqliteQueryBuilder),
    }
}
