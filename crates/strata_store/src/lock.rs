use chrono::Utc;
use sea_orm::sea_query::{Alias, ColumnDef, Expr, Index, IntoTableRef, Query, Table, TableRef};
use sea_orm::{ConnectionTrait, DatabaseConnection, ExprTrait, SqlErr, Statement};

use crate::db::{Locks, build_stmt, col_name, exec, query_one};
use crate::store::build_create_stmt;
use strata_core::{ProcessProbe, StrataError, StrataResult};

/// Outcome of a lock attempt. A dead owner never reaches here; it raises
/// `StaleLock` instead.
pub(crate) enum LockState {
    Acquired,
    Busy { user: String, pid: u32 },
}

/// Liveness via signal 0. Pids we may not signal still exist, so permission
/// errors count as alive; only a missing process is dead.
pub struct HostProbe;

impl ProcessProbe for HostProbe {
    fn is_alive(&self, pid: u32) -> bool {
        #[cfg(unix)]
        {
            use nix::errno::Errno;
            use nix::sys::signal::kill;
            use nix::unistd::Pid;
            if pid > i32::MAX as u32 {
                return false;
            }
            match kill(Pid::from_raw(pid as i32), None) {
                Ok(()) => true,
                Err(Errno::ESRCH) => false,
                Err(_) => true,
            }
        }
        #[cfg(not(unix))]
        {
            let _ = pid;
            true
        }
    }
}

pub(crate) fn lock_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

fn locks_ref(lock_schema: &str) -> TableRef {
    (Alias::new(lock_schema), Locks::Table).into_table_ref()
}

async fn ensure_lock_table(conn: &DatabaseConnection, lock_schema: &str) -> StrataResult<()> {
    let backend = conn.get_database_backend();
    let mut stmt = Table::create();
    stmt.table(locks_ref(lock_schema));
    stmt.if_not_exists();
    let mut schema_col = ColumnDef::new(Locks::Schema);
    schema_col.string().not_null();
    stmt.col(&mut schema_col);
    let mut table_col = ColumnDef::new(Locks::TableName);
    table_col.string().not_null();
    stmt.col(&mut table_col);
    let mut user_col = ColumnDef::new(Locks::User);
    user_col.string().not_null();
    stmt.col(&mut user_col);
    let mut pid_col = ColumnDef::new(Locks::Pid);
    pid_col.big_integer().not_null();
    stmt.col(&mut pid_col);
    let mut start_col = ColumnDef::new(Locks::LockStart);
    start_col.double().not_null();
    stmt.col(&mut start_col);
    stmt.primary_key(
        Index::create()
            .name("pk_locks")
            .col(Locks::Schema)
            .col(Locks::TableName),
    );
    let sql = build_create_stmt(backend, &stmt);
    conn.execute_raw(Statement::from_string(backend, sql)).await?;
    Ok(())
}

/// Take the per-table lock. The primary key on `(schema, table)` arbitrates
/// the insert race; a losing insert is only tolerated when it is a unique
/// violation, anything else propagates.
pub(crate) async fn acquire(
    conn: &DatabaseConnection,
    lock_schema: &str,
    schema: &str,
    table: &str,
    probe: &dyn ProcessProbe,
) -> StrataResult<LockState> {
    ensure_lock_table(conn, lock_schema).await?;
    let backend = conn.get_database_backend();
    let pid = std::process::id();
    let user = lock_user();

    for _ in 0..2 {
        let now = Utc::now().timestamp_micros() as f64 / 1_000_000.0;
        let insert = Query::insert()
            .into_table(locks_ref(lock_schema))
            .columns([
                Locks::Schema,
                Locks::TableName,
                Locks::User,
                Locks::Pid,
                Locks::LockStart,
            ])
            .values_panic([
                Expr::val(schema),
                Expr::val(table),
                Expr::val(user.clone()),
                Expr::val(pid as i64),
                Expr::val(now),
            ])
            .to_owned();
        let (sql, values) = build_stmt(backend, &insert);
        if let Err(err) = conn
            .execute_raw(Statement::from_sql_and_values(backend, sql, values))
            .await
        {
            match err.sql_err() {
                Some(SqlErr::UniqueConstraintViolation(_)) => {}
                _ => return Err(err.into()),
            }
        }

        let select = Query::select()
            .from(locks_ref(lock_schema))
            .columns([Locks::User, Locks::Pid])
            .and_where(Expr::col(Locks::Schema).eq(schema))
            .and_where(Expr::col(Locks::TableName).eq(table))
            .limit(1)
            .to_owned();
        let Some(row) = query_one(conn, &select).await? else {
            // Owner vanished between our losing insert and the read; retry.
            continue;
        };
        let owner_user: String = row.try_get("", &col_name(Locks::User))?;
        let owner_pid: i64 = row.try_get("", &col_name(Locks::Pid))?;
        let owner_pid = owner_pid as u32;
        if owner_pid == pid {
            return Ok(LockState::Acquired);
        }
        if probe.is_alive(owner_pid) {
            return Ok(LockState::Busy {
                user: owner_user,
                pid: owner_pid,
            });
        }
        return Err(StrataError::StaleLock {
            schema: schema.to_string(),
            table: table.to_string(),
            user: owner_user,
            pid: owner_pid,
        });
    }
    Ok(LockState::Busy {
        user: "unknown".to_string(),
        pid: 0,
    })
}

/// Drop the lock row held by `pid`. A missing registry means there is
/// nothing to release.
pub(crate) async fn release(
    conn: &DatabaseConnection,
    lock_schema: &str,
    schema: &str,
    table: &str,
    pid: u32,
) -> StrataResult<()> {
    let probe = Query::select()
        .from(locks_ref(lock_schema))
        .expr(Expr::val(1))
        .limit(1)
        .to_owned();
    if query_one(conn, &probe).await.is_err() {
        return Ok(());
    }
    let delete = Query::delete()
        .from_table(locks_ref(lock_schema))
        .and_where(Expr::col(Locks::Schema).eq(schema))
        .and_where(Expr::col(Locks::TableName).eq(table))
        .and_where(Expr::col(Locks::Pid).eq(pid as i64))
        .to_owned();
    exec(conn, &delete).await?;
    Ok(())
}
