// 🔗 Foreign-Key Index - who references whom
//
// Built once from a SchemaCatalog and then read-only. The index is a plain
// value: rebuild it after a schema migration, it will not notice on its own.

use crate::catalog::{EntityType, SchemaCatalog};
use crate::error::StoreResult;
use serde::Serialize;
use std::collections::HashMap;

/// `referencing_type.field` stores a value of `target_type.target_field`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForeignKeyRelation {
    pub referencing_type: String,
    pub field: String,
    pub target_type: String,
    pub target_field: String,
}

#[derive(Debug, Clone, Default)]
pub struct ForeignKeyIndex {
    entity_types: HashMap<String, EntityType>,
    referencing: HashMap<String, Vec<ForeignKeyRelation>>,
}

impl ForeignKeyIndex {
    /// Scan every entity type the catalog knows and file each foreign-key
    /// field under the type it points to.
    pub fn build(catalog: &impl SchemaCatalog) -> StoreResult<Self> {
        let mut index = ForeignKeyIndex::default();

        for entity_type in catalog.list_entity_types()? {
            for field in catalog.fields_of(&entity_type)? {
                let Some(target) = field.foreign_key else {
                    continue;
                };
                index
                    .referencing
                    .entry(target.entity_type.clone())
                    .or_default()
                    .push(ForeignKeyRelation {
                        referencing_type: entity_type.name.clone(),
                        field: field.name,
                        target_type: target.entity_type,
                        target_field: target.field,
                    });
            }
            index
                .entity_types
                .insert(entity_type.name.clone(), entity_type);
        }

        tracing::debug!(
            entity_types = index.entity_types.len(),
            targets = index.referencing.len(),
            "foreign-key index built"
        );
        Ok(index)
    }

    /// Relations whose field stores a value of `target_type`, in catalog
    /// order. Unknown types have none.
    pub fn relations_referencing(&self, target_type: &str) -> &[ForeignKeyRelation] {
        self.referencing
            .get(target_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn entity_type(&self, name: &str) -> Option<&EntityType> {
        self.entity_types.get(name)
    }

    /// Number of entity types that are referenced by at least one relation.
    pub fn len(&self) -> usize {
        self.referencing.len()
    }

    pub fn is_empty(&self) -> bool {
        self.referencing.is_empty()
    }
}

// ============================================================================
// TESTS
// ============================================================================
