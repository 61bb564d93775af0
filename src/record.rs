// 🧾 Records - storage-agnostic rows the merge engine reads and rewrites
//
// A Record is a snapshot of one row: its entity type, its identity and a map
// of column values. Writes go through `set`, which marks the column dirty so
// a store only persists what the engine actually changed.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

// ============================================================================
// VALUE
// ============================================================================

/// A single column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    /// Parse an identity typed by a user. Only canonical integers become
    /// integers; `"007"` or `"+5"` stay text so text keys remain reachable.
    /// SQLite still matches such text against INTEGER columns by affinity.
    pub fn parse_identity(raw: &str) -> Value {
        let trimmed = raw.trim();
        match trimmed.parse::<i64>() {
            Ok(n) if n.to_string() == trimmed => Value::Integer(n),
            _ => Value::Text(trimmed.to_string()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Integer(n) => write!(f, "{}", n),
            Value::Real(r) => write!(f, "{}", r),
            Value::Text(s) => write!(f, "{}", s),
            Value::Blob(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

// ============================================================================
// RECORD
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    entity_type: String,
    identity_field: String,
    identity: Value,
    fields: BTreeMap<String, Value>,
    #[serde(skip)]
    dirty: BTreeSet<String>,
}

impl Record {
    pub fn new(
        entity_type: impl Into<String>,
        identity_field: impl Into<String>,
        identity: Value,
    ) -> Self {
        Record {
            entity_type: entity_type.into(),
            identity_field: identity_field.into(),
            identity,
            fields: BTreeMap::new(),
            dirty: BTreeSet::new(),
        }
    }

    /// Builder used when loading a row; does not mark the field dirty.
    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    /// Name of the column that identifies this record (`rowid` when the
    /// table has no single-column primary key).
    pub fn identity_field(&self) -> &str {
        &self.identity_field
    }

    pub fn identity(&self) -> &Value {
        &self.identity
    }

    /// Current value of a field. The identity field always resolves, even
    /// when it is the implicit `rowid`.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields
            .get(field)
            .or_else(|| (field == self.identity_field).then_some(&self.identity))
    }

    /// Change a field and mark it for the next save.
    pub fn set(&mut self, field: &str, value: Value) {
        self.fields.insert(field.to_string(), value);
        self.dirty.insert(field.to_string());
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    /// Fields changed since the record was loaded or last saved.
    pub fn dirty_fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.dirty
            .iter()
            .filter_map(|name| self.fields.get(name).map(|v| (name.as_str(), v)))
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    pub fn mark_clean(&mut self) {
        self.dirty.clear();
    }

    /// Two records are the same row when type and identity agree.
    pub fn same_row(&self, other: &Record) -> bool {
        self.entity_type == other.entity_type && self.identity == other.identity
    }
}

// ============================================================================
// TESTS
// ============================================================================
