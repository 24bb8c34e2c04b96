pub mod config;
pub mod datastore;
mod db;
mod delta;
mod interlace;
mod lock;
pub mod logging;
pub mod store;

pub mod api {
    pub use strata_core::api::*;
}

pub use strata_core::*;

pub use config::{DatabaseConfig, PoolConfig, StrataConfig};
pub use datastore::{default_sqlite_path, load_or_init_config, open_store};
pub use db::{BOOKKEEPING, CHECKSUM, FROM_TS, UNTIL_TS};
pub use lock::HostProbe;
pub use logging::StoreLogger;
pub use store::{BackendCapabilities, HistoryStore};
