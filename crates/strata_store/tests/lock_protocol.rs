use chrono::{NaiveDate, NaiveDateTime};
use sea_orm::{ConnectionTrait, Statement};
use strata_store::api::{LockApi, SnapshotApi};
use strata_store::{
    Column, ColumnKind, Frame, HistoryStore, StrataError, TableIdent, UpdateSnapshotInput, Value,
};
use tempfile::tempdir;

fn ts(day: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2020, 1, day)
        .expect("date")
        .and_hms_opt(0, 0, 0)
        .expect("time")
}

fn snapshot() -> Frame {
    let mut frame = Frame::new(vec![
        Column::new("car", ColumnKind::Text),
        Column::new("hp", ColumnKind::Integer),
    ])
    .expect("frame");
    frame
        .push_row(vec![Value::from("Mazda RX4"), Value::from(110)])
        .expect("row");
    frame
}

async fn open() -> (tempfile::TempDir, HistoryStore) {
    let dir = tempdir().expect("tempdir");
    let store = HistoryStore::connect_sqlite(&dir.path().join("strata.sqlite"))
        .await
        .expect("connect");
    (dir, store)
}

async fn insert_foreign_lock(store: &HistoryStore, table: &str, user: &str, pid: u32) {
    // Create the registry first so the raw insert has somewhere to land.
    let ident = TableIdent::new(table);
    assert!(store.lock_table(&ident, None).await.expect("lock"));
    store
        .unlock_table(&ident, None, None)
        .await
        .expect("unlock");
    store
        .connection()
        .execute_raw(Statement::from_sql_and_values(
            store.backend(),
            "INSERT INTO \"main\".\"locks\" (\"schema\", \"table\", \"user\", \"pid\", \"lock_start\") \
             VALUES (?, ?, ?, ?, ?)",
            [
                "main".into(),
                table.into(),
                user.into(),
                (pid as i64).into(),
                0.0f64.into(),
            ],
        ))
        .await
        .expect("insert lock row");
}

#[tokio::test]
async fn lock_is_reentrant_within_one_process() -> strata_store::StrataResult<()> {
    let (_dir, store) = open().await;
    let ident = TableIdent::new("mtcars");
    assert!(store.lock_table(&ident, None).await?);
    assert!(store.lock_table(&ident, None).await?);
    store.unlock_table(&ident, None, None).await?;
    assert!(store.lock_table(&ident, None).await?);
    store.unlock_table(&ident, None, None).await?;
    Ok(())
}

#[tokio::test]
async fn locks_on_distinct_tables_do_not_interfere() -> strata_store::StrataResult<()> {
    let (_dir, store) = open().await;
    assert!(store.lock_table(&TableIdent::new("a"), None).await?);
    assert!(store.lock_table(&TableIdent::new("b"), None).await?);
    store.unlock_table(&TableIdent::new("a"), None, None).await?;
    store.unlock_table(&TableIdent::new("b"), None, None).await?;
    Ok(())
}

#[tokio::test]
async fn unlock_without_lock_table_is_a_noop() -> strata_store::StrataResult<()> {
    let (_dir, store) = open().await;
    store
        .unlock_table(&TableIdent::new("mtcars"), None, None)
        .await?;
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn dead_owner_makes_the_lock_stale() -> strata_store::StrataResult<()> {
    let (_dir, store) = open().await;
    let mut child = std::process::Command::new("true")
        .spawn()
        .expect("spawn child");
    let dead_pid = child.id();
    child.wait().expect("wait child");
    insert_foreign_lock(&store, "mtcars", "ghost", dead_pid).await;

    let err = store
        .update_snapshot(UpdateSnapshotInput::new(
            snapshot(),
            TableIdent::new("mtcars"),
            ts(1),
        ))
        .await
        .expect_err("stale lock");
    match err {
        StrataError::StaleLock { user, pid, .. } => {
            assert_eq!(user, "ghost");
            assert_eq!(pid, dead_pid);
        }
        other => panic!("expected StaleLock, got {other:?}"),
    }

    // Manual removal of the lock row allows the retry.
    store
        .connection()
        .execute_raw(Statement::from_sql_and_values(
            store.backend(),
            "DELETE FROM \"main\".\"locks\" WHERE \"table\" = ?",
            ["mtcars".into()],
        ))
        .await
        .expect("remove lock row");
    store
        .update_snapshot(UpdateSnapshotInput::new(
            snapshot(),
            TableIdent::new("mtcars"),
            ts(1),
        ))
        .await?;
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn live_foreign_owner_means_busy() -> strata_store::StrataResult<()> {
    let (_dir, store) = open().await;
    let mut child = std::process::Command::new("sleep")
        .arg("30")
        .spawn()
        .expect("spawn sleeper");
    insert_foreign_lock(&store, "mtcars", "other", child.id()).await;

    assert!(!store.lock_table(&TableIdent::new("mtcars"), None).await?);
    let err = store
        .update_snapshot(UpdateSnapshotInput::new(
            snapshot(),
            TableIdent::new("mtcars"),
            ts(1),
        ))
        .await
        .expect_err("busy lock");
    assert!(matches!(err, StrataError::LockBusy { .. }));

    child.kill().expect("kill sleeper");
    child.wait().expect("wait sleeper");
    Ok(())
}
