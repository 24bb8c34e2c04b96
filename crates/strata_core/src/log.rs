use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::StrataResult;
use crate::ops::UpdateReport;

/// One structured entry describing a snapshot update, finalized exactly once
/// per call whether the update succeeded or failed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub target: String,
    pub snapshot_time: NaiveDateTime,
    pub message: Option<String>,
    pub report: UpdateReport,
    pub success: bool,
    pub start_time: NaiveDateTime,
    pub end_time: Option<NaiveDateTime>,
}

impl LogRecord {
    pub fn begin(target: String, snapshot_time: NaiveDateTime, message: Option<String>) -> Self {
        Self {
            target,
            snapshot_time,
            message,
            report: UpdateReport::default(),
            success: false,
            start_time: chrono::Utc::now().naive_utc(),
            end_time: None,
        }
    }
}

/// Sink for reconciliation progress and the final per-update record. The
/// store owns a configured implementation; callers may supply their own.
#[async_trait]
pub trait UpdateLogger: Send + Sync {
    /// Progress line; informational only.
    fn log_info(&self, message: &str);

    /// Failure line. The caller raises after this returns; implementations
    /// must not swallow the record.
    fn log_error(&self, message: &str);

    /// Append the finalized record to the durable sink, if any.
    async fn finalize_entry(&self, record: &LogRecord) -> StrataResult<()>;
}

/// Logger that drops everything. Used when no sink is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullLogger;

#[async_trait]
impl UpdateLogger for NullLogger {
    fn log_info(&self, _message: &str) {}

    fn log_error(&self, _message: &str) {}

    async fn finalize_entry(&self, _record: &LogRecord) -> StrataResult<()> {
        Ok(())
    }
}
