// 🌊 Merge Orchestrator - fold one record into another
//
// merge(obsolete, surviving):
//   1. both records must share an entity type (checked before any write)
//   2. look up the relations that reference that type in the cached index
//   3. collect every referencing row (the full scan finishes before the
//      first write, so rewriting never races the scan)
//   4. repoint or dedupe each row
//
// Running the same merge twice finds nothing the second time, and chained
// merges compose because every run reads the store's current state.

use crate::catalog::{SchemaCatalog, SqliteCatalog};
use crate::error::MergeError;
use crate::finder::{find_related, RelatedRecord};
use crate::fk_index::ForeignKeyIndex;
use crate::record::{Record, Value};
use crate::rewriter::{ensure_same_type, rewrite, RecordOutcome, RewriteOutcome};
use crate::store::RecordStore;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

const MERGE_SCOPE: &str = "waterfall_merge";

// ============================================================================
// OPTIONS
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionScope {
    /// Every referencing row commits on its own. A failure part way leaves
    /// earlier rows repointed; rerun the merge to resume.
    #[default]
    PerRecord,
    /// The whole merge commits or rolls back as one unit.
    WholeMerge,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeOptions {
    pub scope: TransactionScope,
    /// Delete the obsolete record once nothing references it any more.
    pub delete_obsolete: bool,
}

// ============================================================================
// REPORT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeReport {
    pub entity_type: String,
    pub obsolete: Value,
    pub surviving: Value,
    pub repointed: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub obsolete_deleted: bool,
    pub outcomes: Vec<RecordOutcome>,
}

impl MergeReport {
    fn new(obsolete: &Record, surviving: &Record, outcomes: Vec<RecordOutcome>) -> Self {
        let count = |kind: RewriteOutcome| outcomes.iter().filter(|o| o.outcome == kind).count();

        MergeReport {
            entity_type: obsolete.entity_type().to_string(),
            obsolete: obsolete.identity().clone(),
            surviving: surviving.identity().clone(),
            repointed: count(RewriteOutcome::Repointed),
            deleted: count(RewriteOutcome::DeletedAsDuplicate),
            unchanged: count(RewriteOutcome::Unchanged),
            obsolete_deleted: false,
            outcomes,
        }
    }

    /// Number of referencing rows the merge looked at.
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }
}

// ============================================================================
// MERGE ENGINE
// ============================================================================

/// Holds the foreign-key index for the lifetime of the engine. Build a new
/// engine after schema changes; the index does not refresh itself.
pub struct MergeEngine {
    index: ForeignKeyIndex,
    options: MergeOptions,
}

impl MergeEngine {
    pub fn new(index: ForeignKeyIndex, options: MergeOptions) -> Self {
        MergeEngine { index, options }
    }

    pub fn from_catalog(
        catalog: &impl SchemaCatalog,
        options: MergeOptions,
    ) -> Result<Self, MergeError> {
        let index = ForeignKeyIndex::build(catalog).map_err(MergeError::Schema)?;
        Ok(MergeEngine::new(index, options))
    }

    /// Engine for every table of an SQLite database.
    pub fn for_sqlite(conn: &Connection, options: MergeOptions) -> Result<Self, MergeError> {
        MergeEngine::from_catalog(&SqliteCatalog::new(conn), options)
    }

    pub fn index(&self) -> &ForeignKeyIndex {
        &self.index
    }

    pub fn options(&self) -> &MergeOptions {
        &self.options
    }

    /// Every row a merge of `obsolete` would touch, without writing.
    pub fn plan_merge<S: RecordStore>(
        &self,
        store: &S,
        obsolete: &Record,
    ) -> Result<Vec<RelatedRecord>, MergeError> {
        let relations = self.index.relations_referencing(obsolete.entity_type());
        find_related(store, obsolete, relations).collect()
    }

    pub fn merge<S: RecordStore>(
        &self,
        store: &S,
        obsolete: &Record,
        surviving: &Record,
    ) -> Result<MergeReport, MergeError> {
        ensure_same_type(obsolete, surviving)?;

        let span = tracing::info_span!(
            "merge",
            entity_type = %obsolete.entity_type(),
            obsolete = %obsolete.identity(),
            surviving = %surviving.identity(),
        );
        let _guard = span.enter();

        let report = match self.options.scope {
            TransactionScope::PerRecord => self.run(store, obsolete, surviving)?,
            TransactionScope::WholeMerge => store
                .scoped_transaction(MERGE_SCOPE, || self.run(store, obsolete, surviving))?,
        };

        tracing::info!(
            repointed = report.repointed,
            deleted = report.deleted,
            unchanged = report.unchanged,
            obsolete_deleted = report.obsolete_deleted,
            "merge complete"
        );
        Ok(report)
    }

    /// Load both records by identity, then merge them.
    pub fn merge_by_identity<S: RecordStore>(
        &self,
        store: &S,
        entity_type: &str,
        obsolete: &Value,
        surviving: &Value,
    ) -> Result<MergeReport, MergeError> {
        let obsolete = self.fetch_required(store, entity_type, obsolete)?;
        let surviving = self.fetch_required(store, entity_type, surviving)?;
        self.merge(store, &obsolete, &surviving)
    }

    pub fn fetch_required<S: RecordStore>(
        &self,
        store: &S,
        entity_type: &str,
        identity: &Value,
    ) -> Result<Record, MergeError> {
        store
            .fetch(entity_type, identity)
            .map_err(|source| MergeError::Lookup {
                entity_type: entity_type.to_string(),
                identity: identity.clone(),
                source,
            })?
            .ok_or_else(|| MergeError::RecordNotFound {
                entity_type: entity_type.to_string(),
                identity: identity.clone(),
            })
    }

    fn run<S: RecordStore>(
        &self,
        store: &S,
        obsolete: &Record,
        surviving: &Record,
    ) -> Result<MergeReport, MergeError> {
        let pairs = self.plan_merge(store, obsolete)?;
        tracing::debug!(related = pairs.len(), "collected referencing records");

        let outcomes = rewrite(store, pairs, obsolete, surviving)?;
        let mut report = MergeReport::new(obsolete, surviving, outcomes);

        if self.options.delete_obsolete && !obsolete.same_row(surviving) {
            let removed = store
                .delete(obsolete)
                .map_err(|source| MergeError::Rewrite {
                    entity_type: obsolete.entity_type().to_string(),
                    identity: obsolete.identity().clone(),
                    field: obsolete.identity_field().to_string(),
                    source,
                })?;
            report.obsolete_deleted = removed > 0;
        }

        Ok(report)
    }
}

// ============================================================================
// TESTS
// ============================================================================
