use chrono::NaiveDateTime;
use sea_orm::{ExprTrait, TransactionTrait};
use sea_orm::sea_query::{Expr, Order, Query};

use crate::db::{
    CHECKSUM, FROM_TS, UNTIL_TS, cell_value, col, exec, query_all, query_one, read_cell,
    read_opt_ts, read_ts, table_ref, ts_value,
};
use crate::lock;
use crate::store::HistoryStore;
use strata_core::{Delta, DeltaRow, StrataError, StrataResult, TableIdent, Value, row_checksum};

pub(crate) async fn export(
    store: &HistoryStore,
    target: &TableIdent,
    from_ts: NaiveDateTime,
    until_ts: Option<NaiveDateTime>,
) -> StrataResult<Delta> {
    let target = store.resolve(target).await?;
    let payload = store
        .historical_payload(store.connection(), &target)
        .await?
        .ok_or_else(|| {
            StrataError::invalid_identifier(format!("table {target} does not exist"))
        })?;

    let mut select = Query::select();
    select.from(table_ref(&target));
    for column in &payload {
        select.column(col(&column.name));
    }
    select.column(col(CHECKSUM));
    select.column(col(FROM_TS));
    select.column(col(UNTIL_TS));
    select.and_where(Expr::col(col(FROM_TS)).gte(from_ts));
    if let Some(until) = until_ts {
        select.and_where(Expr::col(col(FROM_TS)).lt(until));
    }
    select.order_by(col(FROM_TS), Order::Asc);
    let rows = query_all(store.connection(), &select).await?;

    let mut delta_rows = Vec::with_capacity(rows.len());
    for row in rows {
        let cells = payload
            .iter()
            .map(|column| read_cell(&row, &column.name, column.kind))
            .collect::<StrataResult<Vec<Value>>>()?;
        delta_rows.push(DeltaRow {
            payload: cells,
            checksum: row.try_get("", CHECKSUM)?,
            from_ts: read_ts(&row, FROM_TS)?,
            until_ts: read_opt_ts(&row, UNTIL_TS)?,
        });
    }
    Ok(Delta {
        columns: payload,
        rows: delta_rows,
    })
}

pub(crate) async fn load(
    store: &HistoryStore,
    target: &TableIdent,
    deltas: Vec<Delta>,
) -> StrataResult<()> {
    let target = store.resolve(target).await?;
    for delta in deltas {
        apply(store, &target, delta).await?;
    }
    Ok(())
}

async fn apply(store: &HistoryStore, target: &TableIdent, delta: Delta) -> StrataResult<()> {
    let schema = target
        .schema
        .clone()
        .ok_or(StrataError::SchemaUnresolved)?;
    let lock_schema = store.default_schema().await?;
    match lock::acquire(
        store.connection(),
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
    let result = apply_locked(store, target, delta).await;
    let unlocked = lock::release(
        store.connection(),
        &lock_schema,
        &schema,
        &target.table,
        std::process::id(),
    )
    .await;
    result?;
    unlocked
}

async fn apply_locked(
    store: &HistoryStore,
    target: &TableIdent,
    delta: Delta,
) -> StrataResult<()> {
    let tx = store.connection().begin().await?;
    let result = replay(store, &tx, target, &delta).await;
    match result {
        Ok(()) => {
            tx.commit().await?;
            Ok(())
        }
        Err(err) => {
            if let Err(rollback) = tx.rollback().await {
                tracing::warn!(error = %rollback, "rollback failed after delta error");
            }
            Err(err)
        }
    }
}

/// Replay exported row versions by increasing `from_ts`: insert missing
/// `(checksum, from_ts)` versions and adopt the exported interval end where
/// it differs. Reaches the same end state as re-running `update_snapshot`
/// per distinct instant, and also carries pure interval closures.
async fn replay(
    store: &HistoryStore,
    tx: &sea_orm::DatabaseTransaction,
    target: &TableIdent,
    delta: &Delta,
) -> StrataResult<()> {
    let payload = match store.historical_payload(tx, target).await? {
        Some(payload) => {
            let mut expected: Vec<&str> = payload.iter().map(|c| c.name.as_str()).collect();
            let mut supplied: Vec<&str> =
                delta.columns.iter().map(|c| c.name.as_str()).collect();
            expected.sort_unstable();
            supplied.sort_unstable();
            if expected != supplied {
                return Err(StrataError::schema_mismatch(format!(
                    "delta columns {supplied:?} do not match {target} payload {expected:?}"
                )));
            }
            payload
        }
        None => {
            store
                .create_historical(tx, &delta.columns, target, false)
                .await?;
            delta.columns.clone()
        }
    };

    let index: Vec<usize> = payload
        .iter()
        .map(|column| {
            delta
                .columns
                .iter()
                .position(|c| c.name == column.name)
                .ok_or_else(|| {
                    StrataError::schema_mismatch(format!(
                        "delta lacks payload column '{}'",
                        column.name
                    ))
                })
        })
        .collect::<StrataResult<_>>()?;

    let mut rows: Vec<&DeltaRow> = delta.rows.iter().collect();
    rows.sort_by_key(|row| row.from_ts);

    for row in rows {
        if row.payload.len() != delta.columns.len() {
            return Err(StrataError::schema_mismatch(format!(
                "delta row has {} cells, delta has {} columns",
                row.payload.len(),
                delta.columns.len()
            )));
        }
        let ordered: Vec<Value> = index.iter().map(|&i| row.payload[i].clone()).collect();
        // The fingerprint is recomputed in the target's declared order, so a
        // delta whose columns travel in a different order still lands on the
        // same row identity.
        let checksum = row_checksum(&payload, &ordered);

        let existing = {
            let select = Query::select()
                .from(table_ref(target))
                .column(col(UNTIL_TS))
                .and_where(Expr::col(col(CHECKSUM)).eq(checksum.clone()))
                .and_where(Expr::col(col(FROM_TS)).eq(row.from_ts))
                .limit(1)
                .to_owned();
            query_one(tx, &select).await?
        };
        match existing {
            Some(existing) => {
                let existing_until = read_opt_ts(&existing, UNTIL_TS)?;
                if existing_until != row.until_ts {
                    let mut update = Query::update();
                    update.table(table_ref(target));
                    update.values([(col(UNTIL_TS), ts_value(row.until_ts).into())]);
                    update.and_where(Expr::col(col(CHECKSUM)).eq(checksum.clone()));
                    update.and_where(Expr::col(col(FROM_TS)).eq(row.from_ts));
                    exec(tx, &update).await?;
                }
            }
            None => {
                let mut columns: Vec<_> = payload.iter().map(|c| col(&c.name)).collect();
                columns.push(col(CHECKSUM));
                columns.push(col(FROM_TS));
                columns.push(col(UNTIL_TS));
                let mut values = Vec::with_capacity(columns.len());
                for (cell, column) in ordered.iter().zip(&payload) {
                    values.push(Expr::val(cell_value(column.kind, cell)?));
                }
                values.push(Expr::val(checksum.clone()));
                values.push(Expr::val(ts_value(Some(row.from_ts))));
                values.push(Expr::val(ts_value(row.until_ts)));
                let insert = Query::insert()
                    .into_table(table_ref(target))
                    .columns(columns)
                    .values_panic(values)
                    .to_owned();
                exec(tx, &insert).await?;
            }
        }
    }
    Ok(())
}
