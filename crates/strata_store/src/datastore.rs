use std::path::{Path, PathBuf};

use crate::{HistoryStore, StrataConfig, StrataResult};

const DEFAULT_DB_NAME: &str = "strata.sqlite";

pub fn load_or_init_config(base: &Path) -> StrataResult<StrataConfig> {
    let default_sqlite = base.join(DEFAULT_DB_NAME);
    StrataConfig::load_or_init(base, &default_sqlite)
}

pub async fn open_store(base: &Path) -> StrataResult<HistoryStore> {
    let config = load_or_init_config(base)?;
    HistoryStore::connect(&config, base).await
}

pub fn default_sqlite_path(base: &Path) -> PathBuf {
    base.join(DEFAULT_DB_NAME)
}
