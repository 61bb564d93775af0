// ✏️ Key Rewriter / Conflict Resolver
//
// Repoints each referencing row at the surviving record. When the store
// rejects the update as a uniqueness conflict, the surviving record already
// has an equivalent dependent, so the row is deleted instead. Each row is
// handled inside its own savepoint.

use crate::error::{MergeError, StoreError};
use crate::finder::RelatedRecord;
use crate::record::{Record, Value};
use crate::store::RecordStore;
use serde::Serialize;

const RECORD_SCOPE: &str = "waterfall_record";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RewriteOutcome {
    /// The field now holds the surviving record's value.
    Repointed,
    /// Repointing collided with an existing row; this row was removed.
    DeletedAsDuplicate,
    /// Nothing to write: the values already agree, or the row was removed
    /// earlier in the same merge.
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordOutcome {
    pub entity_type: String,
    pub identity: Value,
    pub field: String,
    pub outcome: RewriteOutcome,
}

/// Fail unless both records belong to the same entity type.
pub fn ensure_same_type(obsolete: &Record, surviving: &Record) -> Result<(), MergeError> {
    if obsolete.entity_type() != surviving.entity_type() {
        return Err(MergeError::TypeMismatch {
            obsolete_type: obsolete.entity_type().to_string(),
            surviving_type: surviving.entity_type().to_string(),
        });
    }
    Ok(())
}

fn target_value<'r>(record: &'r Record, field: &str) -> Result<&'r Value, MergeError> {
    record.get(field).ok_or_else(|| MergeError::MissingField {
        entity_type: record.entity_type().to_string(),
        field: field.to_string(),
    })
}

/// Repoint every pair from `obsolete` to `surviving`. Stops at the first
/// error that is not a uniqueness conflict; rows handled before it stay
/// committed.
pub fn rewrite<S, I>(
    store: &S,
    pairs: I,
    obsolete: &Record,
    surviving: &Record,
) -> Result<Vec<RecordOutcome>, MergeError>
where
    S: RecordStore,
    I: IntoIterator<Item = RelatedRecord>,
{
    ensure_same_type(obsolete, surviving)?;

    let mut outcomes = Vec::new();
    for RelatedRecord { mut record, relation } in pairs {
        let old_value = target_value(obsolete, &relation.target_field)?;
        let new_value = target_value(surviving, &relation.target_field)?;

        let outcome = if old_value == new_value {
            RewriteOutcome::Unchanged
        } else {
            store
                .scoped_transaction(RECORD_SCOPE, || -> Result<RewriteOutcome, StoreError> {
                    record.set(&relation.field, new_value.clone());
                    match store.save(&mut record) {
                        Ok(0) => Ok(RewriteOutcome::Unchanged),
                        Ok(_) => Ok(RewriteOutcome::Repointed),
                        Err(err) if err.is_uniqueness_violation() => {
                            tracing::debug!(
                                entity_type = %record.entity_type(),
                                identity = %record.identity(),
                                field = %relation.field,
                                error = %err,
                                "duplicate dependent, deleting"
                            );
                            store.delete(&record)?;
                            Ok(RewriteOutcome::DeletedAsDuplicate)
                        }
                        Err(err) => Err(err),
                    }
                })
                .map_err(|source| MergeError::Rewrite {
                    entity_type: record.entity_type().to_string(),
                    identity: record.identity().clone(),
                    field: relation.field.clone(),
                    source,
                })?
        };

        tracing::debug!(
            entity_type = %record.entity_type(),
            identity = %record.identity(),
            field = %relation.field,
            ?outcome,
            "rewrote reference"
        );
        outcomes.push(RecordOutcome {
            entity_type: record.entity_type().to_string(),
            identity: record.identity().clone(),
            field: relation.field,
            outcome,
        });
    }

    Ok(outcomes)
}

// ============================================================================
// TESTS
// ============================================================================
