//! Schemaless record model shared by every store backend.
//!
//! A record is an opaque JSON field map plus a unique id. Consumers are
//! agnostic to record shape beyond the id and the conventional
//! `created_at` field used for newest-first ordering.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::SystemTime;
use uuid::Uuid;

/// Conventional creation-timestamp field consulted for ordering.
pub const CREATED_AT_FIELD: &str = "created_at";

/// A single structured item within a collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    pub id: Uuid,
    /// Field name → value. Shape is entirely up to the application.
    pub fields: Map<String, Value>,
}

impl Record {
    /// Create a record with a fresh v4 id.
    pub fn new(fields: Map<String, Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            fields,
        }
    }

    /// Create with explicit id (for testing)
    pub fn with_id(id: Uuid, fields: Map<String, Value>) -> Self {
        Self { id, fields }
    }

    /// Look up a field value by name.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Creation timestamp in unix seconds, if the record carries one.
    ///
    /// Accepts an integer value or a string holding an integer; anything
    /// else is treated as absent.
    pub fn created_at(&self) -> Option<i64> {
        match self.fields.get(CREATED_AT_FIELD) {
            Some(Value::Number(n)) => n.as_i64(),
            Some(Value::String(s)) => s.parse::<i64>().ok(),
            _ => None,
        }
    }

    /// Set `created_at` to `now` unless the record already has one.
    ///
    /// Called by store backends on insert so that newest-first ordering
    /// works without the application stamping timestamps itself.
    pub fn stamp_created_at(&mut self, now: i64) {
        if !self.fields.contains_key(CREATED_AT_FIELD) {
            self.fields
                .insert(CREATED_AT_FIELD.to_string(), Value::from(now));
        }
    }

    /// Keep only the named fields.
    ///
    /// The id is not a field and always survives. `created_at` is kept
    /// even when unselected so that ordering survives projection.
    pub fn project(&self, selection: &[String]) -> Record {
        let mut fields = Map::new();
        for name in selection {
            if let Some(value) = self.fields.get(name) {
                fields.insert(name.clone(), value.clone());
            }
        }
        if !fields.contains_key(CREATED_AT_FIELD) {
            if let Some(ts) = self.fields.get(CREATED_AT_FIELD) {
                fields.insert(CREATED_AT_FIELD.to_string(), ts.clone());
            }
        }
        Record {
            id: self.id,
            fields,
        }
    }
}

/// Current unix time in seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Sort records newest-created-first.
///
/// Records without a readable `created_at` sort after those with one.
/// The sort is stable, so insertion order breaks ties.
pub fn sort_newest_first(records: &mut [Record]) {
    records.sort_by(|a, b| match (a.created_at(), b.created_at()) {
        (Some(a_ts), Some(b_ts)) => b_ts.cmp(&a_ts),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
}
