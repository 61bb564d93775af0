// 🔍 Related-Record Finder - every row that points at the obsolete record
//
// Yields (record, relation) pairs one relation at a time. The store is only
// queried for a relation once the previous relation's rows are consumed, so
// a caller that rewrites while iterating sees its own writes in later
// batches. The iterator is single-use; call `find_related` again to rescan.

use crate::error::MergeError;
use crate::fk_index::ForeignKeyRelation;
use crate::record::Record;
use crate::store::RecordStore;
use std::slice;
use std::vec;

/// A row that references the obsolete record through `relation`.
#[derive(Debug, Clone)]
pub struct RelatedRecord {
    pub record: Record,
    pub relation: ForeignKeyRelation,
}

pub fn find_related<'a, S: RecordStore>(
    store: &'a S,
    obsolete: &'a Record,
    relations: &'a [ForeignKeyRelation],
) -> RelatedRecords<'a, S> {
    RelatedRecords {
        store,
        obsolete,
        relations: relations.iter(),
        current: None,
        failed: false,
    }
}

pub struct RelatedRecords<'a, S: RecordStore> {
    store: &'a S,
    obsolete: &'a Record,
    relations: slice::Iter<'a, ForeignKeyRelation>,
    current: Option<(&'a ForeignKeyRelation, vec::IntoIter<Record>)>,
    failed: bool,
}

impl<S: RecordStore> RelatedRecords<'_, S> {
    fn fail(&mut self, err: MergeError) -> Option<Result<RelatedRecord, MergeError>> {
        self.failed = true;
        self.current = None;
        Some(Err(err))
    }
}

impl<S: RecordStore> Iterator for RelatedRecords<'_, S> {
    type Item = Result<RelatedRecord, MergeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        loop {
            if let Some((relation, batch)) = self.current.as_mut() {
                if let Some(record) = batch.next() {
                    return Some(Ok(RelatedRecord {
                        record,
                        relation: (*relation).clone(),
                    }));
                }
            }
            self.current = None;

            let relation = self.relations.next()?;
            let Some(value) = self.obsolete.get(&relation.target_field) else {
                return self.fail(MergeError::MissingField {
                    entity_type: self.obsolete.entity_type().to_string(),
                    field: relation.target_field.clone(),
                });
            };

            match self
                .store
                .filter_by_field(&relation.referencing_type, &relation.field, value)
            {
                Ok(batch) => {
                    tracing::debug!(
                        entity_type = %relation.referencing_type,
                        field = %relation.field,
                        matches = batch.len(),
                        "scanned relation"
                    );
                    self.current = Some((relation, batch.into_iter()));
                }
                Err(source) => {
                    return self.fail(MergeError::Scan {
                        entity_type: relation.referencing_type.clone(),
                        field: relation.field.clone(),
                        source,
                    });
                }
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Value;
    use crate::store::SqliteStore;
    use rusqlite::Connection;

    fn create_test_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE person (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
             CREATE TABLE dog (
                 id INTEGER PRIMARY KEY,
                 name TEXT NOT NULL,
                 owner_id INTEGER REFERENCES person(id),
                 walker_id INTEGER REFERENCES person(id)
             );
             INSERT INTO person VALUES (1, 'zookeeper1'), (2, 'zookeeper2');
             INSERT INTO dog VALUES (1, 'fido', 2, 1), (2, 'rex', 1, 2), (3, 'spot', 2, 2);",
        )
        .unwrap();
        conn
    }

    fn relation(field: &str) -> ForeignKeyRelation {
        ForeignKeyRelation {
            referencing_type: "dog".to_string(),
            field: field.to_string(),
            target_type: "person".to_string(),
            target_field: "id".to_string(),
        }
    }

    #[test]
    fn test_finds_every_referencing_row_per_relation() {
        let conn = create_test_db();
        let store = SqliteStore::new(&conn);
        let obsolete = store.fetch("person", &Value::Integer(2)).unwrap().unwrap();
        let relations = vec![relation("owner_id"), relation("walker_id")];

        let found: Vec<_> = find_related(&store, &obsolete, &relations)
            .collect::<Result<_, _>>()
            .unwrap();

        let pairs: Vec<(String, String)> = found
            .iter()
            .map(|r| (r.record.get("name").unwrap().to_string(), r.relation.field.clone()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("fido".to_string(), "owner_id".to_string()),
                ("spot".to_string(), "owner_id".to_string()),
                ("rex".to_string(), "walker_id".to_string()),
                ("spot".to_string(), "walker_id".to_string()),
            ]
        );
    }

    #[test]
    fn test_no_relations_yields_nothing() {
        let conn = create_test_db();
        let store = SqliteStore::new(&conn);
        let obsolete = store.fetch("person", &Value::Integer(1)).unwrap().unwrap();

        assert_eq!(find_related(&store, &obsolete, &[]).count(), 0);
    }

    #[test]
    fn test_scan_failure_names_the_relation_and_stops() {
        let conn = create_test_db();
        let store = SqliteStore::new(&conn);
        let obsolete = store.fetch("person", &Value::Integer(2)).unwrap().unwrap();
        let relations = vec![
            ForeignKeyRelation {
                referencing_type: "vanished".to_string(),
                ..relation("owner_id")
            },
            relation("owner_id"),
        ];

        let mut found = find_related(&store, &obsolete, &relations);

        match found.next() {
            Some(Err(MergeError::Scan { entity_type, field, .. })) => {
                assert_eq!(entity_type, "vanished");
                assert_eq!(field, "owner_id");
            }
            other => panic!("expected scan error, got {:?}", other),
        }
        assert!(found.next().is_none());
    }

    #[test]
    fn test_missing_target_field_is_reported() {
        let conn = create_test_db();
        let store = SqliteStore::new(&conn);
        let obsolete = store.fetch("person", &Value::Integer(2)).unwrap().unwrap();
        let relations = vec![ForeignKeyRelation {
            target_field: "badge_code".to_string(),
            ..relation("owner_id")
        }];

        let err = find_related(&store, &obsolete, &relations)
            .next()
            .unwrap()
            .unwrap_err();

        assert!(matches!(err, MergeError::MissingField { .. }));
    }
}
