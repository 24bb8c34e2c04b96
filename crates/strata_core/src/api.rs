use async_trait::async_trait;
use chrono::NaiveDateTime;

use crate::StrataResult;
use crate::frame::Frame;
use crate::ident::TableIdent;
use crate::ops::{Delta, InterlaceInput, UpdateReport, UpdateSnapshotInput};

#[async_trait]
pub trait SnapshotApi {
    /// Reconcile a snapshot observed at `input.timestamp` against the target
    /// historical table, applying the minimal insertions and deactivations.
    async fn update_snapshot(&self, input: UpdateSnapshotInput) -> StrataResult<UpdateReport>;

    /// Rows live at `slice_ts`, or the full history when `slice_ts` is None.
    async fn get_table(
        &self,
        target: &TableIdent,
        slice_ts: Option<NaiveDateTime>,
        include_slice_info: bool,
    ) -> StrataResult<Frame>;

    /// Semi-join restrict a table to rows whose key tuple appears in
    /// `filters`. `None` passes everything through.
    async fn filter_keys(
        &self,
        target: &TableIdent,
        filters: Option<&Frame>,
    ) -> StrataResult<Frame>;
}

#[async_trait]
pub trait TableMetaApi {
    async fn is_historical(&self, target: &TableIdent) -> StrataResult<bool>;

    /// Create a table shaped like `sample` extended with the bookkeeping
    /// columns, unless they are already present in the sample.
    async fn create_table(
        &self,
        sample: &Frame,
        target: &TableIdent,
        temporary: bool,
    ) -> StrataResult<()>;
}

#[async_trait]
pub trait LockApi {
    /// Attempt to take the named table's lock. `Ok(false)` means a live
    /// process holds it; a dead owner raises `StaleLock`.
    async fn lock_table(&self, target: &TableIdent, schema: Option<&str>) -> StrataResult<bool>;

    /// Release the lock held by `pid` (this process when `None`). No-op when
    /// the lock table does not exist.
    async fn unlock_table(
        &self,
        target: &TableIdent,
        schema: Option<&str>,
        pid: Option<u32>,
    ) -> StrataResult<()>;
}

#[async_trait]
pub trait InterlaceApi {
    /// Union several historical tables over the shared key columns `by`,
    /// splitting validity intervals on the common refinement of their axes.
    async fn interlace(&self, inputs: &[InterlaceInput], by: &[String]) -> StrataResult<Frame>;
}

#[async_trait]
pub trait DeltaApi {
    /// Export every row version whose `from_ts` lies in `[from_ts, until_ts)`
    /// (unbounded above when `until_ts` is None).
    async fn delta_export(
        &self,
        target: &TableIdent,
        from_ts: NaiveDateTime,
        until_ts: Option<NaiveDateTime>,
    ) -> StrataResult<Delta>;

    /// Apply deltas in order, creating the target when missing. Equivalent to
    /// replaying the exported row versions by increasing `from_ts`.
    async fn delta_load(&self, target: &TableIdent, deltas: Vec<Delta>) -> StrataResult<()>;
}
