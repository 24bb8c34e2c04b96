use thiserror::Error;

#[derive(Debug, Error)]
pub enum StrataError {
    #[error("invalid identifier: {message}")]
    InvalidIdentifier { message: String },
    #[error("no default schema resolvable for this connection")]
    SchemaUnresolved,
    #[error("table {schema}.{table} is locked by a live process (user {user}, pid {pid})")]
    LockBusy {
        schema: String,
        table: String,
        user: String,
        pid: u32,
    },
    #[error(
        "stale lock on {schema}.{table}: owning pid {pid} (user {user}) is dead; \
         remove the lock row manually before retrying"
    )]
    StaleLock {
        schema: String,
        table: String,
        user: String,
        pid: u32,
    },
    #[error("schema mismatch: {message}")]
    SchemaMismatch { message: String },
    #[error("table {schema}.{table} exists but lacks the history bookkeeping columns")]
    NotHistorical { schema: String, table: String },
    #[error("out-of-order update: {message}")]
    OutOfOrder { message: String },
    #[error("backend error: {message}")]
    Backend { message: String },
}

impl StrataError {
    pub fn invalid_identifier(message: impl Into<String>) -> Self {
        Self::InvalidIdentifier {
            message: message.into(),
        }
    }

    pub fn schema_mismatch(message: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            message: message.into(),
        }
    }

    pub fn not_historical(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self::NotHistorical {
            schema: schema.into(),
            table: table.into(),
        }
    }

    pub fn out_of_order(message: impl Into<String>) -> Self {
        Self::OutOfOrder {
            message: message.into(),
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }
}

pub type StrataResult<T> = Result<T, StrataError>;

impl From<sea_orm::DbErr> for StrataError {
    fn from(value: sea_orm::DbErr) -> Self {
        StrataError::backend(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::StrataError;

    #[test]
    fn helper_constructors_set_variants() {
        let err = StrataError::invalid_identifier("bad");
        assert!(matches!(err, StrataError::InvalidIdentifier { .. }));
        let err = StrataError::schema_mismatch("cols");
        assert!(matches!(err, StrataError::SchemaMismatch { .. }));
        let err = StrataError::not_historical("main", "t");
        assert!(matches!(err, StrataError::NotHistorical { .. }));
        let err = StrataError::out_of_order("t earlier than head");
        assert!(matches!(err, StrataError::OutOfOrder { .. }));
        let err = StrataError::backend("disk");
        assert!(matches!(err, StrataError::Backend { .. }));
    }

    #[test]
    fn stale_lock_names_the_owner() {
        let err = StrataError::StaleLock {
            schema: "main".to_string(),
            table: "mtcars".to_string(),
            user: "etl".to_string(),
            pid: 4242,
        };
        let rendered = err.to_string();
        assert!(rendered.contains("main.mtcars"));
        assert!(rendered.contains("4242"));
        assert!(rendered.contains("etl"));
    }
}
