// ⚠️ Error types for the merge engine
// Storage failures are classified once, at the rusqlite boundary, so the
// rewriter can tell a uniqueness conflict apart from everything else.

use crate::record::Value;
use rusqlite::ffi;
use serde::Serialize;
use thiserror::Error;

/// Result type for store and catalog operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by a [`RecordStore`](crate::store::RecordStore) or
/// [`SchemaCatalog`](crate::catalog::SchemaCatalog).
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another row already holds the same combination of unique fields.
    #[error("uniqueness violation: {message}")]
    UniquenessViolation { message: String },

    /// Any other database failure.
    #[error("database error: {0}")]
    Sqlite(rusqlite::Error),

    /// Schema metadata that the engine cannot work with.
    #[error("invalid schema: {0}")]
    InvalidSchema(String),
}

impl StoreError {
    pub fn is_uniqueness_violation(&self) -> bool {
        matches!(self, StoreError::UniquenessViolation { .. })
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(failure, message)
                if failure.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
                    || failure.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
            {
                StoreError::UniquenessViolation {
                    message: message.clone().unwrap_or_else(|| failure.to_string()),
                }
            }
            _ => StoreError::Sqlite(err),
        }
    }
}

/// The stage of a merge that produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStage {
    /// Loading the obsolete/surviving records by identity.
    Lookup,
    /// Reading the referential graph from the schema catalog.
    SchemaResolution,
    /// Querying for records that reference the obsolete record.
    RecordScan,
    /// Repointing or deleting referencing records.
    Rewrite,
}

impl MergeStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStage::Lookup => "lookup",
            MergeStage::SchemaResolution => "schema resolution",
            MergeStage::RecordScan => "record scan",
            MergeStage::Rewrite => "rewrite",
        }
    }
}

/// Errors surfaced to callers of [`MergeEngine`](crate::merge::MergeEngine).
#[derive(Debug, Error)]
pub enum MergeError {
    /// The two records belong to different entity types. Nothing was written.
    #[error("cannot merge a {obsolete_type} record into a {surviving_type} record")]
    TypeMismatch {
        obsolete_type: String,
        surviving_type: String,
    },

    #[error("no {entity_type} record with identity {identity}")]
    RecordNotFound { entity_type: String, identity: Value },

    /// The store failed while loading a record by identity.
    #[error("lookup of {entity_type} {identity} failed: {source}")]
    Lookup {
        entity_type: String,
        identity: Value,
        #[source]
        source: StoreError,
    },

    #[error("schema resolution failed: {0}")]
    Schema(#[source] StoreError),

    #[error("scan of {entity_type}.{field} failed: {source}")]
    Scan {
        entity_type: String,
        field: String,
        #[source]
        source: StoreError,
    },

    #[error("{entity_type} record has no field {field}")]
    MissingField { entity_type: String, field: String },

    /// A referencing record could not be repointed or deleted. Records
    /// handled before it stay committed unless the merge ran as one
    /// transaction.
    #[error("rewrite of {entity_type} {identity} ({field}) failed: {source}")]
    Rewrite {
        entity_type: String,
        identity: Value,
        field: String,
        #[source]
        source: StoreError,
    },

    #[error("transaction failed: {0}")]
    Transaction(#[from] StoreError),
}

impl MergeError {
    pub fn stage(&self) -> MergeStage {
        match self {
            MergeError::TypeMismatch { .. }
            | MergeError::RecordNotFound { .. }
            | MergeError::Lookup { .. } => MergeStage::Lookup,
            MergeError::Schema(_) => MergeStage::SchemaResolution,
            MergeError::Scan { .. } | MergeError::MissingField { .. } => MergeStage::RecordScan,
            MergeError::Rewrite { .. } | MergeError::Transaction(_) => MergeStage::Rewrite,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_unique_constraint_is_classified() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE tag (id INTEGER PRIMARY KEY, label TEXT UNIQUE);
             INSERT INTO tag (label) VALUES ('a');",
        )
        .unwrap();

        let err = conn
            .execute("INSERT INTO tag (label) VALUES ('a')", [])
            .unwrap_err();
        let err = StoreError::from(err);

        assert!(err.is_uniqueness_violation(), "got {:?}", err);
    }

    #[test]
    fn test_primary_key_conflict_is_classified() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE link (a INTEGER, b INTEGER, PRIMARY KEY (a, b));
             INSERT INTO link VALUES (1, 2);",
        )
        .unwrap();

        let err = conn.execute("INSERT INTO link VALUES (1, 2)", []).unwrap_err();

        assert!(StoreError::from(err).is_uniqueness_violation());
    }

    #[test]
    fn test_not_null_is_not_a_uniqueness_violation() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE note (id INTEGER PRIMARY KEY, body TEXT NOT NULL);")
            .unwrap();

        let err = conn
            .execute("INSERT INTO note (body) VALUES (NULL)", [])
            .unwrap_err();

        assert!(matches!(StoreError::from(err), StoreError::Sqlite(_)));
    }

    #[test]
    fn test_stage_mapping() {
        let mismatch = MergeError::TypeMismatch {
            obsolete_type: "dog".to_string(),
            surviving_type: "person".to_string(),
        };
        assert_eq!(mismatch.stage(), MergeStage::Lookup);

        let scan = MergeError::Scan {
            entity_type: "dog".to_string(),
            field: "owner_id".to_string(),
            source: StoreError::InvalidSchema("gone".to_string()),
        };
        assert_eq!(scan.stage(), MergeStage::RecordScan);
        assert_eq!(scan.stage().as_str(), "record scan");
    }
}
