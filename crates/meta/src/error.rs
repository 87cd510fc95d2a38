use thiserror::Error;

/// Metadata-store failures.
#[derive(Debug, Error)]
pub enum MetaError {
    #[error("{what} {id:?} not found")]
    NotFound { what: &'static str, id: String },

    #[error("Version {uid:?} already exists")]
    AlreadyExists { uid: String },

    #[error("Lock {scope}:{name} is held by {owner} ({reason})")]
    LockConflict {
        scope: String,
        name: String,
        owner: String,
        reason: String,
    },

    #[error(
        "Immutable setting {key:?} changed: repository recorded {recorded:?}, \
         configuration now says {configured:?}.  Changing it would make existing \
         data unreadable; refusing to continue"
    )]
    ImmutableSettingChanged {
        key: String,
        recorded: String,
        configured: String,
    },

    #[error("Database is not initialized (run database-init)")]
    NotInitialized,

    #[error("Database schema version {found} is newer than this binary supports ({supported})")]
    SchemaTooNew { found: i64, supported: i64 },

    #[error("Database schema version {found} is older than {required} (run database-migrate)")]
    MigrationRequired { found: i64, required: i64 },

    #[error("Database already initialized; pass force to re-initialize")]
    AlreadyInitialized,

    #[error("Invalid database URL {url:?} (expected sqlite:<path> or sqlite::memory:)")]
    InvalidDatabaseUrl { url: String },

    #[error("Malformed row: {reason}")]
    Malformed { reason: String },

    #[error(transparent)]
    Sql(#[from] rusqlite::Error),
}

impl MetaError {
    pub fn not_found(what: &'static str, id: impl ToString) -> Self {
        MetaError::NotFound {
            what,
            id: id.to_string(),
        }
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        MetaError::Malformed {
            reason: reason.into(),
        }
    }
}
