pub mod api;
pub mod error;
pub mod fingerprint;
pub mod frame;
pub mod ident;
pub mod log;
pub mod ops;
pub mod probe;

pub use api::{DeltaApi, InterlaceApi, LockApi, SnapshotApi, TableMetaApi};
pub use error::{StrataError, StrataResult};
pub use fingerprint::row_checksum;
pub use frame::{Column, ColumnKind, Frame, Value};
pub use ident::{TableIdent, timestamp_literal};
pub use log::{LogRecord, NullLogger, UpdateLogger};
pub use ops::{
    Delta, DeltaRow, InterlaceInput, Snapshot, UpdateReport, UpdateSnapshotInput,
};
pub use probe::ProcessProbe;
