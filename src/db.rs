use crate::merge::MergeReport;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Name of the audit table. It holds no foreign keys, so it never shows up
/// in the referential graph of the database it lives in.
pub const EVENTS_TABLE: &str = "waterfall_events";

/// Event for audit trail: one row per merge that touched the database
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

/// Open a database for merging: WAL journal and enforced foreign keys.
pub fn open_database(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("Failed to open database {}", path.display()))?;

    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    setup_database(&conn)?;
    Ok(conn)
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // ==========================================================================
    // Events Table (audit trail of merges)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS waterfall_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_waterfall_events_entity
         ON waterfall_events(entity_type, entity_id)",
        [],
    )?;

    Ok(())
}

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO waterfall_events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Get events for a specific entity, newest first
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM waterfall_events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY timestamp DESC, id DESC",
    )?;

    let rows = stmt
        .query_map(params![entity_type, entity_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(
            |(event_id, timestamp, event_type, entity_type, entity_id, data, actor)| -> Result<Event> {
                Ok(Event {
                    event_id,
                    timestamp: DateTime::parse_from_rfc3339(&timestamp)
                        .with_context(|| format!("Bad event timestamp {}", timestamp))?
                        .with_timezone(&Utc),
                    event_type,
                    entity_type,
                    entity_id,
                    data: serde_json::from_str(&data).context("Bad event payload")?,
                    actor,
                })
            },
        )
        .collect()
}

/// Record a finished merge against both the obsolete and surviving record.
pub fn record_merge(conn: &Connection, report: &MergeReport, actor: &str) -> Result<()> {
    let data = serde_json::to_value(report)?;

    let merged_away = Event::new(
        "merged_into",
        &report.entity_type,
        &report.obsolete.to_string(),
        data.clone(),
        actor,
    );
    insert_event(conn, &merged_away)?;

    if report.obsolete != report.surviving {
        let absorbed = Event::new(
            "absorbed",
            &report.entity_type,
            &report.surviving.to_string(),
            data,
            actor,
        );
        insert_event(conn, &absorbed)?;
    }

    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SqliteCatalog;
    use crate::fk_index::ForeignKeyIndex;
    use crate::merge::{MergeEngine, MergeOptions};
    use crate::record::Value;
    use crate::store::SqliteStore;

    #[test]
    fn test_event_log() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let event = Event::new(
            "test_event",
            "person",
            "test_id_123",
            serde_json::json!({"test": "data"}),
            "test_actor",
        );

        insert_event(&conn, &event).unwrap();

        let events = get_events_for_entity(&conn, "person", "test_id_123").unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "test_event");
        assert_eq!(events[0].actor, "test_actor");
        assert_eq!(events[0].data["test"], "data");
    }

    #[test]
    fn test_setup_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        setup_database(&conn).unwrap();
    }

    #[test]
    fn test_events_table_is_not_in_the_graph() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn.execute_batch("CREATE TABLE person (id INTEGER PRIMARY KEY);")
            .unwrap();

        let index = ForeignKeyIndex::build(&SqliteCatalog::new(&conn)).unwrap();

        assert!(index.is_empty());
        assert!(index.entity_type(EVENTS_TABLE).is_some());
    }

    #[test]
    fn test_record_merge_logs_both_sides() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn.execute_batch(
            "CREATE TABLE person (id INTEGER PRIMARY KEY, name TEXT);
             CREATE TABLE dog (id INTEGER PRIMARY KEY, owner_id INTEGER REFERENCES person(id));
             INSERT INTO person VALUES (1, 'a'), (2, 'b');
             INSERT INTO dog VALUES (1, 2);",
        )
        .unwrap();
        let store = SqliteStore::new(&conn);
        let engine =
            MergeEngine::from_catalog(&SqliteCatalog::new(&conn), MergeOptions::default())
                .unwrap();
        let report = engine
            .merge_by_identity(&store, "person", &Value::Integer(2), &Value::Integer(1))
            .unwrap();

        record_merge(&conn, &report, "test").unwrap();

        let obsolete_events = get_events_for_entity(&conn, "person", "2").unwrap();
        let surviving_events = get_events_for_entity(&conn, "person", "1").unwrap();
        assert_eq!(obsolete_events.len(), 1);
        assert_eq!(obsolete_events[0].event_type, "merged_into");
        assert_eq!(obsolete_events[0].data["repointed"], 1);
        assert_eq!(surviving_events[0].event_type, "absorbed");
    }
}
