use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use strata_core::{StrataError, StrataResult};

const DEFAULT_CONFIG_NAME: &str = "strata.json";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum DatabaseConfig {
    Sqlite { path: Option<String> },
    Postgres { url: String },
    Mysql { url: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_connections: Option<u32>,
    pub min_connections: Option<u32>,
    pub connect_timeout_ms: Option<u64>,
    pub acquire_timeout_ms: Option<u64>,
    pub idle_timeout_ms: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StrataConfig {
    pub database: DatabaseConfig,
    pub pool: Option<PoolConfig>,
    /// Overrides the backend's default schema resolution.
    pub default_schema: Option<String>,
    /// Identifier of the table receiving one record per update.
    pub log_table: Option<String>,
    /// Directory receiving one log file per update.
    pub log_path: Option<String>,
    /// Store-wide default for rejecting out-of-order updates.
    pub enforce_chronological_order: Option<bool>,
}

impl StrataConfig {
    pub fn default_sqlite(path: impl Into<String>) -> Self {
        Self {
            database: DatabaseConfig::Sqlite {
                path: Some(path.into()),
            },
            pool: None,
            default_schema: None,
            log_table: None,
            log_path: None,
            enforce_chronological_order: Some(true),
        }
    }

    pub fn load_or_init(base_dir: &Path, default_sqlite_path: &Path) -> StrataResult<Self> {
        fs::create_dir_all(base_dir)
            .map_err(|err| StrataError::backend(format!("create config dir: {err}")))?;
        let config_path = base_dir.join(DEFAULT_CONFIG_NAME);
        if config_path.exists() {
            let raw = fs::read_to_string(&config_path)
                .map_err(|err| StrataError::backend(format!("read config: {err}")))?;
            let config: StrataConfig = serde_json::from_str(&raw)
                .map_err(|err| StrataError::backend(format!("parse config: {err}")))?;
            return Ok(config);
        }
        let default = StrataConfig::default_sqlite(default_sqlite_path.to_string_lossy());
        let payload = serde_json::to_string_pretty(&default)
            .map_err(|err| StrataError::backend(format!("serialize config: {err}")))?;
        fs::write(&config_path, payload)
            .map_err(|err| StrataError::backend(format!("write config: {err}")))?;
        Ok(default)
    }

    pub fn sqlite_path(&self, base_dir: &Path) -> StrataResult<PathBuf> {
        match &self.database {
            DatabaseConfig::Sqlite { path } => {
                let path = path.clone().unwrap_or_else(|| "strata.sqlite".to_string());
                let candidate = PathBuf::from(path);
                if candidate.is_absolute() {
                    Ok(candidate)
                } else {
                    Ok(base_dir.join(candidate))
                }
            }
            _ => Err(StrataError::backend("config is not sqlite backend")),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match self.database {
            DatabaseConfig::Sqlite { .. } => "sqlite",
            DatabaseConfig::Postgres { .. } => "postgres",
            DatabaseConfig::Mysql { .. } => "mysql",
        }
    }

    pub fn connection_url(&self) -> Option<&str> {
        match &self.database {
            DatabaseConfig::Sqlite { .. } => None,
            DatabaseConfig::Postgres { url } | DatabaseConfig::Mysql { url } => Some(url.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::StrataConfig;

    #[test]
    fn default_config_enforces_chronology() {
        let config = StrataConfig::default_sqlite("strata.sqlite");
        assert_eq!(config.backend_name(), "sqlite");
        assert_eq!(config.enforce_chronological_order, Some(true));
        assert!(config.connection_url().is_none());
    }
}
