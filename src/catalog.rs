// 🗂️ Schema Catalog - enumerates entity types and their foreign keys
//
// The merge engine never hardcodes the referential graph. It asks a catalog
// for every entity type and its fields once, when the foreign-key index is
// built. `SqliteCatalog` reads the graph straight out of SQLite's own schema
// tables, so join tables and self-references show up like any other key.

use crate::error::{StoreError, StoreResult};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::BTreeMap;

/// Column used to address rows of tables without a single-column primary key.
pub const ROWID: &str = "rowid";

// ============================================================================
// SCHEMA TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityType {
    pub name: String,
    /// Single-column primary key, or `rowid`.
    pub identity_field: String,
}

impl EntityType {
    pub fn new(name: impl Into<String>, identity_field: impl Into<String>) -> Self {
        EntityType {
            name: name.into(),
            identity_field: identity_field.into(),
        }
    }
}

/// Where a foreign-key field points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForeignKeyTarget {
    pub entity_type: String,
    pub field: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldDescriptor {
    pub name: String,
    pub foreign_key: Option<ForeignKeyTarget>,
}

impl FieldDescriptor {
    pub fn plain(name: impl Into<String>) -> Self {
        FieldDescriptor {
            name: name.into(),
            foreign_key: None,
        }
    }

    pub fn foreign_key(
        name: impl Into<String>,
        target_type: impl Into<String>,
        target_field: impl Into<String>,
    ) -> Self {
        FieldDescriptor {
            name: name.into(),
            foreign_key: Some(ForeignKeyTarget {
                entity_type: target_type.into(),
                field: target_field.into(),
            }),
        }
    }

    pub fn is_foreign_key(&self) -> bool {
        self.foreign_key.is_some()
    }

    pub fn target_type(&self) -> Option<&str> {
        self.foreign_key.as_ref().map(|fk| fk.entity_type.as_str())
    }

    pub fn target_field(&self) -> Option<&str> {
        self.foreign_key.as_ref().map(|fk| fk.field.as_str())
    }
}

// ============================================================================
// CATALOG TRAIT
// ============================================================================

/// Source of schema metadata for the foreign-key index.
pub trait SchemaCatalog {
    /// Every entity type, in declaration order.
    fn list_entity_types(&self) -> StoreResult<Vec<EntityType>>;

    /// Fields of one entity type, in declaration order.
    fn fields_of(&self, entity_type: &EntityType) -> StoreResult<Vec<FieldDescriptor>>;
}

// ============================================================================
// SQLITE CATALOG
// ============================================================================

pub struct SqliteCatalog<'c> {
    conn: &'c Connection,
}

impl<'c> SqliteCatalog<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        SqliteCatalog { conn }
    }
}

/// Name of the single-column primary key of `table`, if it has one.
pub fn primary_key_column(conn: &Connection, table: &str) -> StoreResult<Option<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1) WHERE pk > 0")?;
    let keys = stmt
        .query_map(params![table], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(match keys.as_slice() {
        [single] => Some(single.clone()),
        _ => None,
    })
}

/// Identity column for `table`: its primary key, else `rowid`.
pub fn identity_column(conn: &Connection, table: &str) -> StoreResult<String> {
    Ok(primary_key_column(conn, table)?.unwrap_or_else(|| ROWID.to_string()))
}

struct ForeignKeyRow {
    target_table: String,
    from: String,
    to: Option<String>,
}

impl SchemaCatalog for SqliteCatalog<'_> {
    fn list_entity_types(&self) -> StoreResult<Vec<EntityType>> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        names
            .into_iter()
            .map(|name| -> StoreResult<EntityType> {
                let identity_field = identity_column(self.conn, &name)?;
                Ok(EntityType {
                    name,
                    identity_field,
                })
            })
            .collect()
    }

    fn fields_of(&self, entity_type: &EntityType) -> StoreResult<Vec<FieldDescriptor>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM pragma_table_info(?1) ORDER BY cid")?;
        let columns = stmt
            .query_map(params![entity_type.name], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        if columns.is_empty() {
            return Err(StoreError::InvalidSchema(format!(
                "table {} has no columns",
                entity_type.name
            )));
        }

        // Group constraint rows by constraint id; more than one row means a
        // composite key.
        let mut stmt = self.conn.prepare(
            "SELECT id, \"table\", \"from\", \"to\" FROM pragma_foreign_key_list(?1)
             ORDER BY id, seq",
        )?;
        let mut constraints: BTreeMap<i64, Vec<ForeignKeyRow>> = BTreeMap::new();
        let rows = stmt.query_map(params![entity_type.name], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                ForeignKeyRow {
                    target_table: row.get(1)?,
                    from: row.get(2)?,
                    to: row.get(3)?,
                },
            ))
        })?;
        for row in rows {
            let (id, fk) = row?;
            constraints.entry(id).or_default().push(fk);
        }

        let mut targets: BTreeMap<String, ForeignKeyTarget> = BTreeMap::new();
        for (_, mut parts) in constraints {
            if parts.len() != 1 {
                tracing::warn!(
                    entity_type = %entity_type.name,
                    columns = parts.len(),
                    "skipping composite foreign key"
                );
                continue;
            }
            let fk = parts.remove(0);
            let target_field = match fk.to {
                Some(to) => to,
                None => match primary_key_column(self.conn, &fk.target_table)? {
                    Some(pk) => pk,
                    None => {
                        tracing::warn!(
                            entity_type = %entity_type.name,
                            field = %fk.from,
                            target = %fk.target_table,
                            "foreign key targets a table without a single-column primary key"
                        );
                        continue;
                    }
                },
            };
            targets.insert(
                fk.from,
                ForeignKeyTarget {
                    entity_type: fk.target_table,
                    field: target_field,
                },
            );
        }

        Ok(columns
            .into_iter()
            .map(|name| {
                let foreign_key = targets.remove(&name);
                FieldDescriptor { name, foreign_key }
            })
            .collect())
    }
}

// ============================================================================
// TESTS
// ============================================================================
