use chrono::{NaiveDate, NaiveDateTime};
use strata_store::api::SnapshotApi;
use strata_store::{
    Column, ColumnKind, Frame, HistoryStore, StrataError, TableIdent, UpdateSnapshotInput, Value,
};
use tempfile::tempdir;

fn ts(day: u32, hour: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2020, 1, day)
        .expect("date")
        .and_hms_opt(hour, 0, 0)
        .expect("time")
}

fn mtcars(rows: &[(&str, i64)]) -> Frame {
    let mut frame = Frame::new(vec![
        Column::new("car", ColumnKind::Text),
        Column::new("hp", ColumnKind::Integer),
    ])
    .expect("frame");
    for (car, hp) in rows {
        frame
            .push_row(vec![Value::from(*car), Value::from(*hp)])
            .expect("row");
    }
    frame
}

async fn open() -> (tempfile::TempDir, HistoryStore) {
    let dir = tempdir().expect("tempdir");
    let store = HistoryStore::connect_sqlite(&dir.path().join("strata.sqlite"))
        .await
        .expect("connect");
    (dir, store)
}

fn target() -> TableIdent {
    TableIdent::new("mtcars")
}

#[tokio::test]
async fn initial_load_opens_unbounded_intervals() -> strata_store::StrataResult<()> {
    let (_dir, store) = open().await;
    let snapshot = mtcars(&[("Mazda RX4", 110), ("Mazda RX4 Wag", 110), ("Datsun 710", 93)]);
    let report = store
        .update_snapshot(UpdateSnapshotInput::new(snapshot, target(), ts(1, 11)))
        .await?;
    assert_eq!(report.n_insertions, 3);
    assert_eq!(report.n_deactivations, 0);
    assert_eq!(report.n_redundant, 0);

    let history = store.get_table(&target(), None, true).await?;
    assert_eq!(history.len(), 3);
    let from_idx = history.column_index("from_ts").expect("from_ts");
    let until_idx = history.column_index("until_ts").expect("until_ts");
    for row in history.rows() {
        assert_eq!(row[from_idx], Value::Timestamp(ts(1, 11)));
        assert_eq!(row[until_idx], Value::Null);
    }
    Ok(())
}

#[tokio::test]
async fn additive_update_preserves_existing_rows() -> strata_store::StrataResult<()> {
    let (_dir, store) = open().await;
    let initial = mtcars(&[("Mazda RX4", 110), ("Mazda RX4 Wag", 110), ("Datsun 710", 93)]);
    store
        .update_snapshot(UpdateSnapshotInput::new(initial.clone(), target(), ts(1, 11)))
        .await?;
    let wider = mtcars(&[
        ("Mazda RX4", 110),
        ("Mazda RX4 Wag", 110),
        ("Datsun 710", 93),
        ("Hornet 4 Drive", 110),
        ("Hornet Sportabout", 175),
    ]);
    let report = store
        .update_snapshot(UpdateSnapshotInput::new(wider.clone(), target(), ts(2, 12)))
        .await?;
    assert_eq!(report.n_insertions, 2);
    assert_eq!(report.n_deactivations, 0);

    let at_first = store.get_table(&target(), Some(ts(1, 11)), false).await?;
    assert_eq!(at_first.literal_rows(), initial.literal_rows());
    let at_second = store.get_table(&target(), Some(ts(2, 12)), false).await?;
    assert_eq!(at_second.literal_rows(), wider.literal_rows());
    Ok(())
}

#[tokio::test]
async fn value_change_closes_and_reopens_the_row() -> strata_store::StrataResult<()> {
    let (_dir, store) = open().await;
    let rows = [
        ("Mazda RX4", 110),
        ("Mazda RX4 Wag", 110),
        ("Datsun 710", 93),
        ("Hornet 4 Drive", 110),
        ("Hornet Sportabout", 175),
    ];
    store
        .update_snapshot(UpdateSnapshotInput::new(mtcars(&rows), target(), ts(1, 11)))
        .await?;
    let mut changed = rows;
    changed[0] = ("Mazda RX4", 55);
    let report = store
        .update_snapshot(UpdateSnapshotInput::new(mtcars(&changed), target(), ts(3, 10)))
        .await?;
    assert_eq!(report.n_insertions, 1);
    assert_eq!(report.n_deactivations, 1);

    let history = store.get_table(&target(), None, true).await?;
    assert_eq!(history.len(), 6);
    let live = store.get_table(&target(), Some(ts(3, 10)), false).await?;
    assert_eq!(live.literal_rows(), mtcars(&changed).literal_rows());

    let car_idx = history.column_index("car").expect("car");
    let hp_idx = history.column_index("hp").expect("hp");
    let until_idx = history.column_index("until_ts").expect("until_ts");
    let closed = history
        .rows()
        .iter()
        .find(|row| row[car_idx] == Value::from("Mazda RX4") && row[hp_idx] == Value::from(110))
        .expect("superseded row");
    assert_eq!(closed[until_idx], Value::Timestamp(ts(3, 10)));
    Ok(())
}

#[tokio::test]
async fn reapplying_the_same_snapshot_writes_nothing() -> strata_store::StrataResult<()> {
    let (_dir, store) = open().await;
    let snapshot = mtcars(&[("Mazda RX4", 110), ("Datsun 710", 93)]);
    store
        .update_snapshot(UpdateSnapshotInput::new(snapshot.clone(), target(), ts(1, 11)))
        .await?;
    let before = store.get_table(&target(), None, true).await?;

    // Same instant, same snapshot.
    let same_t = store
        .update_snapshot(UpdateSnapshotInput::new(snapshot.clone(), target(), ts(1, 11)))
        .await?;
    assert_eq!(same_t.n_insertions, 0);
    assert_eq!(same_t.n_deactivations, 0);
    assert_eq!(same_t.n_redundant, 0);

    // Later instant, identical content: the fingerprints persist.
    let later = store
        .update_snapshot(UpdateSnapshotInput::new(snapshot, target(), ts(2, 11)))
        .await?;
    assert_eq!(later.n_insertions, 0);
    assert_eq!(later.n_deactivations, 0);

    let after = store.get_table(&target(), None, true).await?;
    assert_eq!(after.literal_rows(), before.literal_rows());
    Ok(())
}

#[tokio::test]
async fn empty_snapshot_into_empty_table_stays_empty() -> strata_store::StrataResult<()> {
    let (_dir, store) = open().await;
    let report = store
        .update_snapshot(UpdateSnapshotInput::new(mtcars(&[]), target(), ts(1, 0)))
        .await?;
    assert_eq!(report.n_insertions, 0);
    assert_eq!(report.n_deactivations, 0);
    let history = store.get_table(&target(), None, false).await?;
    assert!(history.is_empty());
    Ok(())
}

#[tokio::test]
async fn empty_snapshot_deactivates_every_live_row() -> strata_store::StrataResult<()> {
    let (_dir, store) = open().await;
    store
        .update_snapshot(UpdateSnapshotInput::new(
            mtcars(&[("Mazda RX4", 110), ("Datsun 710", 93)]),
            target(),
            ts(1, 0),
        ))
        .await?;
    let report = store
        .update_snapshot(UpdateSnapshotInput::new(mtcars(&[]), target(), ts(2, 0)))
        .await?;
    assert_eq!(report.n_deactivations, 2);
    assert_eq!(report.n_insertions, 0);

    let live = store.get_table(&target(), Some(ts(2, 0)), false).await?;
    assert!(live.is_empty());
    // Deactivation closes intervals, it never deletes history.
    let history = store.get_table(&target(), None, true).await?;
    assert_eq!(history.len(), 2);
    let until_idx = history.column_index("until_ts").expect("until_ts");
    for row in history.rows() {
        assert_eq!(row[until_idx], Value::Timestamp(ts(2, 0)));
    }
    Ok(())
}

#[tokio::test]
async fn out_of_order_update_is_rejected_and_leaves_no_trace() -> strata_store::StrataResult<()> {
    let (_dir, store) = open().await;
    store
        .update_snapshot(UpdateSnapshotInput::new(
            mtcars(&[("Mazda RX4", 110)]),
            target(),
            ts(2, 0),
        ))
        .await?;
    let before = store.get_table(&target(), None, true).await?;

    let err = store
        .update_snapshot(UpdateSnapshotInput::new(
            mtcars(&[("Datsun 710", 93)]),
            target(),
            ts(1, 0),
        ))
        .await
        .expect_err("out of order");
    assert!(matches!(err, StrataError::OutOfOrder { .. }));

    let after = store.get_table(&target(), None, true).await?;
    assert_eq!(after.literal_rows(), before.literal_rows());

    // The lock was released on the failure path.
    store
        .update_snapshot(UpdateSnapshotInput::new(
            mtcars(&[("Mazda RX4", 110)]),
            target(),
            ts(3, 0),
        ))
        .await?;
    Ok(())
}

#[tokio::test]
async fn backfill_splices_against_the_next_boundary() -> strata_store::StrataResult<()> {
    let (_dir, store) = open().await;
    store
        .update_snapshot(UpdateSnapshotInput::new(
            mtcars(&[("Mazda RX4", 110)]),
            target(),
            ts(1, 0),
        ))
        .await?;
    store
        .update_snapshot(UpdateSnapshotInput::new(
            mtcars(&[("Mazda RX4", 110), ("Datsun 710", 93)]),
            target(),
            ts(3, 0),
        ))
        .await?;

    let mut backfill = UpdateSnapshotInput::new(
        mtcars(&[("Mazda RX4", 110), ("Honda Civic", 52)]),
        target(),
        ts(2, 0),
    );
    backfill.enforce_chronological_order = Some(false);
    let report = store.update_snapshot(backfill).await?;
    assert_eq!(report.n_insertions, 1);
    assert_eq!(report.n_deactivations, 0);

    let history = store.get_table(&target(), None, true).await?;
    let car_idx = history.column_index("car").expect("car");
    let from_idx = history.column_index("from_ts").expect("from_ts");
    let until_idx = history.column_index("until_ts").expect("until_ts");
    let honda = history
        .rows()
        .iter()
        .find(|row| row[car_idx] == Value::from("Honda Civic"))
        .expect("spliced row");
    assert_eq!(honda[from_idx], Value::Timestamp(ts(2, 0)));
    // Closed at the next boundary so later history stays untouched.
    assert_eq!(honda[until_idx], Value::Timestamp(ts(3, 0)));
    Ok(())
}

#[tokio::test]
async fn adjacent_identical_intervals_collapse() -> strata_store::StrataResult<()> {
    let (_dir, store) = open().await;
    store
        .update_snapshot(UpdateSnapshotInput::new(
            mtcars(&[("Mazda RX4", 110)]),
            target(),
            ts(1, 0),
        ))
        .await?;
    store
        .update_snapshot(UpdateSnapshotInput::new(mtcars(&[]), target(), ts(2, 0)))
        .await?;

    // Reintroduce the identical row at the instant its previous interval
    // closed; with chronology off the two meeting intervals must merge.
    let mut reintroduce =
        UpdateSnapshotInput::new(mtcars(&[("Mazda RX4", 110)]), target(), ts(2, 0));
    reintroduce.enforce_chronological_order = Some(false);
    let report = store.update_snapshot(reintroduce).await?;
    assert_eq!(report.n_insertions, 1);
    assert_eq!(report.n_redundant, 1);

    let history = store.get_table(&target(), None, true).await?;
    assert_eq!(history.len(), 1);
    let from_idx = history.column_index("from_ts").expect("from_ts");
    let until_idx = history.column_index("until_ts").expect("until_ts");
    assert_eq!(history.rows()[0][from_idx], Value::Timestamp(ts(1, 0)));
    assert_eq!(history.rows()[0][until_idx], Value::Null);
    Ok(())
}

#[tokio::test]
async fn same_instant_supersede_leaves_no_zero_length_rows() -> strata_store::StrataResult<()> {
    let (_dir, store) = open().await;
    store
        .update_snapshot(UpdateSnapshotInput::new(
            mtcars(&[("Mazda RX4", 110), ("Datsun 710", 93)]),
            target(),
            ts(1, 0),
        ))
        .await?;
    let report = store
        .update_snapshot(UpdateSnapshotInput::new(
            mtcars(&[("Datsun 710", 93)]),
            target(),
            ts(1, 0),
        ))
        .await?;
    assert_eq!(report.n_deactivations, 1);
    assert_eq!(report.n_redundant, 1);

    let history = store.get_table(&target(), None, true).await?;
    assert_eq!(history.len(), 1);
    let car_idx = history.column_index("car").expect("car");
    assert_eq!(history.rows()[0][car_idx], Value::from("Datsun 710"));
    Ok(())
}

#[tokio::test]
async fn filters_restrict_the_reconciled_key_set() -> strata_store::StrataResult<()> {
    let (_dir, store) = open().await;
    store
        .update_snapshot(UpdateSnapshotInput::new(
            mtcars(&[("Mazda RX4", 110), ("Datsun 710", 93)]),
            target(),
            ts(1, 0),
        ))
        .await?;

    let mut keys = Frame::new(vec![Column::new("car", ColumnKind::Text)]).expect("keys");
    keys.push_row(vec![Value::from("Mazda RX4")]).expect("row");
    let mut input = UpdateSnapshotInput::new(
        mtcars(&[("Mazda RX4", 55), ("Datsun 710", 7)]),
        target(),
        ts(2, 0),
    );
    input.filters = Some(keys);
    let report = store.update_snapshot(input).await?;
    // The Datsun rows on both sides were out of scope.
    assert_eq!(report.n_insertions, 1);
    assert_eq!(report.n_deactivations, 1);

    let live = store.get_table(&target(), Some(ts(2, 0)), false).await?;
    assert_eq!(
        live.literal_rows(),
        mtcars(&[("Mazda RX4", 55), ("Datsun 710", 93)]).literal_rows()
    );
    Ok(())
}

#[tokio::test]
async fn snapshot_with_unknown_columns_is_rejected() -> strata_store::StrataResult<()> {
    let (_dir, store) = open().await;
    store
        .update_snapshot(UpdateSnapshotInput::new(
            mtcars(&[("Mazda RX4", 110)]),
            target(),
            ts(1, 0),
        ))
        .await?;
    let mut other = Frame::new(vec![
        Column::new("car", ColumnKind::Text),
        Column::new("cyl", ColumnKind::Integer),
    ])
    .expect("frame");
    other
        .push_row(vec![Value::from("Mazda RX4"), Value::from(6)])
        .expect("row");
    let err = store
        .update_snapshot(UpdateSnapshotInput::new(other, target(), ts(2, 0)))
        .await
        .expect_err("schema mismatch");
    assert!(matches!(err, StrataError::SchemaMismatch { .. }));
    Ok(())
}
