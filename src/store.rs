// 💾 Record Store - the persistence boundary of the merge engine
//
// The engine only needs four things from storage: find rows by one field,
// write changed fields back, delete a row, and run a body all-or-nothing.
// `SqliteStore` provides them on top of a borrowed rusqlite connection,
// using savepoints so scoped transactions nest.

use crate::catalog::{identity_column, ROWID};
use crate::error::{StoreError, StoreResult};
use crate::record::{Record, Value};
use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, params_from_iter, Connection};

// ============================================================================
// STORE TRAIT
// ============================================================================

pub trait RecordStore {
    /// Load one record by identity.
    fn fetch(&self, entity_type: &str, identity: &Value) -> StoreResult<Option<Record>>;

    /// Every record of `entity_type` whose `field` equals `value`.
    fn filter_by_field(
        &self,
        entity_type: &str,
        field: &str,
        value: &Value,
    ) -> StoreResult<Vec<Record>>;

    /// Persist the record's dirty fields. Returns the number of rows
    /// written: zero means the row no longer exists. A uniqueness conflict
    /// is reported as [`StoreError::UniquenessViolation`].
    fn save(&self, record: &mut Record) -> StoreResult<usize>;

    /// Remove the record. Returns the number of rows removed.
    fn delete(&self, record: &Record) -> StoreResult<usize>;

    /// Run `body` so that either all of its writes persist or none do.
    /// Calls may nest; `name` identifies the scope.
    fn scoped_transaction<T, E, F>(&self, name: &str, body: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<StoreError>;
}

// ============================================================================
// SQLITE VALUE MAPPING
// ============================================================================

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            Value::Integer(n) => ToSqlOutput::Borrowed(ValueRef::Integer(*n)),
            Value::Real(r) => ToSqlOutput::Borrowed(ValueRef::Real(*r)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

impl FromSql for Value {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Ok(match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(n) => Value::Integer(n),
            ValueRef::Real(r) => Value::Real(r),
            ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Value::Blob(b.to_vec()),
        })
    }
}

/// Quote an identifier for interpolation into SQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

// ============================================================================
// SQLITE STORE
// ============================================================================

pub struct SqliteStore<'c> {
    conn: &'c Connection,
}

impl<'c> SqliteStore<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        SqliteStore { conn }
    }

    pub fn connection(&self) -> &Connection {
        self.conn
    }

    /// Run a `SELECT ... WHERE <column> = ?1` and build records. `rowid` is
    /// only selected for tables addressed by it, so `WITHOUT ROWID` tables
    /// with a single-column primary key read like any other.
    fn select_where(
        &self,
        entity_type: &str,
        column: &str,
        value: &Value,
    ) -> StoreResult<Vec<Record>> {
        let identity_field = identity_column(self.conn, entity_type)?;
        let by_rowid = identity_field == ROWID;
        let sql = format!(
            "SELECT {}* FROM {} WHERE {} = ?1",
            if by_rowid { "rowid, " } else { "" },
            quote_ident(entity_type),
            quote_ident(column)
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let first_field = usize::from(by_rowid);

        let rows = stmt
            .query_map(params![value], |row| {
                let rowid = if by_rowid {
                    Some(row.get::<_, i64>(0)?)
                } else {
                    None
                };
                let mut fields = Vec::with_capacity(columns.len() - first_field);
                for (i, name) in columns.iter().enumerate().skip(first_field) {
                    fields.push((name.clone(), row.get::<_, Value>(i)?));
                }
                Ok((rowid, fields))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(rowid, fields)| -> StoreResult<Record> {
                let identity = match rowid {
                    Some(rowid) => Value::Integer(rowid),
                    None => fields
                        .iter()
                        .find(|(name, _)| *name == identity_field)
                        .map(|(_, v)| v.clone())
                        .ok_or_else(|| {
                            StoreError::InvalidSchema(format!(
                                "{} has no column {}",
                                entity_type, identity_field
                            ))
                        })?,
                };
                Ok(fields
                    .into_iter()
                    .fold(Record::new(entity_type, &identity_field, identity), |rec, (name, v)| {
                        rec.with_field(name, v)
                    }))
            })
            .collect()
    }
}

impl RecordStore for SqliteStore<'_> {
    fn fetch(&self, entity_type: &str, identity: &Value) -> StoreResult<Option<Record>> {
        let identity_field = identity_column(self.conn, entity_type)?;
        Ok(self
            .select_where(entity_type, &identity_field, identity)?
            .into_iter()
            .next())
    }

    fn filter_by_field(
        &self,
        entity_type: &str,
        field: &str,
        value: &Value,
    ) -> StoreResult<Vec<Record>> {
        // NULL never equals anything, so a NULL key references nothing.
        if value.is_null() {
            return Ok(Vec::new());
        }
        self.select_where(entity_type, field, value)
    }

    fn save(&self, record: &mut Record) -> StoreResult<usize> {
        let (assignments, mut values): (Vec<String>, Vec<&Value>) = record
            .dirty_fields()
            .enumerate()
            .map(|(i, (name, value))| (format!("{} = ?{}", quote_ident(name), i + 1), value))
            .unzip();

        if assignments.is_empty() {
            return Ok(0);
        }

        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?{}",
            quote_ident(record.entity_type()),
            assignments.join(", "),
            quote_ident(record.identity_field()),
            values.len() + 1
        );
        values.push(record.identity());

        let written = self.conn.execute(&sql, params_from_iter(values))?;
        record.mark_clean();
        Ok(written)
    }

    fn delete(&self, record: &Record) -> StoreResult<usize> {
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?1",
            quote_ident(record.entity_type()),
            quote_ident(record.identity_field())
        );
        Ok(self.conn.execute(&sql, params![record.identity()])?)
    }

    fn scoped_transaction<T, E, F>(&self, name: &str, body: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<StoreError>,
    {
        let savepoint = quote_ident(name);
        self.conn
            .execute_batch(&format!("SAVEPOINT {}", savepoint))
            .map_err(StoreError::from)?;

        match body() {
            Ok(value) => {
                self.conn
                    .execute_batch(&format!("RELEASE {}", savepoint))
                    .map_err(StoreError::from)?;
                Ok(value)
            }
            Err(err) => {
                let rollback =
                    format!("ROLLBACK TO {}; RELEASE {}", savepoint, savepoint);
                if let Err(rollback_err) = self.conn.execute_batch(&rollback) {
                    tracing::warn!(savepoint = name, error = %rollback_err, "rollback failed");
                }
                Err(err)
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

    fn create_test_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE person (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
             CREATE TABLE cat_owners (
                 cat_id INTEGER NOT NULL,
                 person_id INTEGER NOT NULL,
                 PRIMARY KEY (cat_id, person_id)
             );
             INSERT INTO person (id, name) VALUES (1, 'zookeeper1'), (2, 'zookeeper2');
             INSERT INTO cat_owners VALUES (10, 1), (10, 2), (11, 2);",
        )
        .unwrap();
        conn
    }

    fn count(conn: &Connection, sql: &str) -> i64 {
        conn.query_row(sql, [], |row| row.get(0)).unwrap()
    }

    #[test]
    fn test_fetch_by_primary_key() {
        let conn = create_test_db();
        let store = SqliteStore::new(&conn);

        let person = store.fetch("person", &Value::Integer(2)).unwrap().unwrap();

        assert_eq!(person.identity_field(), "id");
        assert_eq!(person.get("name"), Some(&Value::from("zookeeper2")));
        assert!(store.fetch("person", &Value::Integer(99)).unwrap().is_none());
    }

    #[test]
    fn test_filter_uses_rowid_without_single_primary_key() {
        let conn = create_test_db();
        let store = SqliteStore::new(&conn);

        let links = store
            .filter_by_field("cat_owners", "person_id", &Value::Integer(2))
            .unwrap();

        assert_eq!(links.len(), 2);
        assert!(links.iter().all(|l| l.identity_field() == ROWID));
        assert!(store
            .filter_by_field("cat_owners", "person_id", &Value::Null)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_without_rowid_table_reads_and_writes_by_primary_key() {
        let conn = create_test_db();
        conn.execute_batch(
            "CREATE TABLE badge (
                 code TEXT PRIMARY KEY,
                 holder INTEGER REFERENCES person(id)
             ) WITHOUT ROWID;
             INSERT INTO badge VALUES ('A-1', 2), ('B-7', 2);",
        )
        .unwrap();
        let store = SqliteStore::new(&conn);

        let mut badges = store
            .filter_by_field("badge", "holder", &Value::Integer(2))
            .unwrap();
        assert_eq!(badges.len(), 2);
        assert_eq!(badges[0].identity_field(), "code");
        assert_eq!(badges[0].identity(), &Value::from("A-1"));
        assert_eq!(badges[0].get("rowid"), None);

        badges[0].set("holder", Value::Integer(1));
        assert_eq!(store.save(&mut badges[0]).unwrap(), 1);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM badge WHERE holder = 1"), 1);
    }

    #[test]
    fn test_parsed_identities_reach_text_and_integer_keys() {
        let conn = create_test_db();
        conn.execute_batch(
            "CREATE TABLE agent (code TEXT PRIMARY KEY, name TEXT);
             INSERT INTO agent VALUES ('007', 'bond'), ('7', 'seven');",
        )
        .unwrap();
        let store = SqliteStore::new(&conn);

        let bond = store
            .fetch("agent", &Value::parse_identity("007"))
            .unwrap()
            .unwrap();
        assert_eq!(bond.get("name"), Some(&Value::from("bond")));

        let seven = store
            .fetch("agent", &Value::parse_identity("7"))
            .unwrap()
            .unwrap();
        assert_eq!(seven.get("name"), Some(&Value::from("seven")));

        // INTEGER affinity converts the padded text for comparison
        let person = store
            .fetch("person", &Value::parse_identity("02"))
            .unwrap()
            .unwrap();
        assert_eq!(person.identity(), &Value::Integer(2));
    }

    #[test]
    fn test_save_writes_only_dirty_fields() {
        let conn = create_test_db();
        let store = SqliteStore::new(&conn);

        let mut stale = store.fetch("person", &Value::Integer(1)).unwrap().unwrap();
        conn.execute("UPDATE person SET name = 'renamed' WHERE id = 1", [])
            .unwrap();

        // Nothing dirty: nothing written, the concurrent rename survives
        assert_eq!(store.save(&mut stale).unwrap(), 0);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM person WHERE name = 'renamed'"), 1);

        stale.set("name", Value::from("keeper"));
        assert_eq!(store.save(&mut stale).unwrap(), 1);
        assert!(!stale.is_dirty());
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM person WHERE name = 'keeper'"), 1);
    }

    #[test]
    fn test_save_reports_uniqueness_violation() {
        let conn = create_test_db();
        let store = SqliteStore::new(&conn);

        let mut link = store
            .filter_by_field("cat_owners", "person_id", &Value::Integer(2))
            .unwrap()
            .into_iter()
            .find(|l| l.get("cat_id") == Some(&Value::Integer(10)))
            .unwrap();
        link.set("person_id", Value::Integer(1));

        let err = store.save(&mut link).unwrap_err();
        assert!(err.is_uniqueness_violation(), "got {:?}", err);
    }

    #[test]
    fn test_delete_missing_row_affects_nothing() {
        let conn = create_test_db();
        let store = SqliteStore::new(&conn);

        let person = store.fetch("person", &Value::Integer(2)).unwrap().unwrap();
        assert_eq!(store.delete(&person).unwrap(), 1);
        assert_eq!(store.delete(&person).unwrap(), 0);
    }

    #[test]
    fn test_scoped_transaction_rolls_back_on_error() {
        let conn = create_test_db();
        let store = SqliteStore::new(&conn);

        let result: Result<(), StoreError> = store.scoped_transaction("outer", || {
            conn.execute("DELETE FROM person", [])?;
            Err(StoreError::InvalidSchema("abort".to_string()))
        });

        assert!(result.is_err());
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM person"), 2);
    }

    #[test]
    fn test_nested_scopes_commit_independently() {
        let conn = create_test_db();
        let store = SqliteStore::new(&conn);

        let result: Result<(), StoreError> = store.scoped_transaction("outer", || {
            store.scoped_transaction("inner", || {
                conn.execute("DELETE FROM person WHERE id = 1", [])?;
                Ok::<_, StoreError>(())
            })?;
            let inner_failed: Result<(), StoreError> = store.scoped_transaction("inner", || {
                conn.execute("DELETE FROM person WHERE id = 2", [])?;
                Err(StoreError::InvalidSchema("abort".to_string()))
            });
            assert!(inner_failed.is_err());
            Ok(())
        });

        assert!(result.is_ok());
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM person"), 1);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM person WHERE id = 2"), 1);
    }
}
