//! Change notifications pushed to subscribers on every committed mutation.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of mutation that occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ChangeKind {
    Insert = 1,
    Update = 2,
    Delete = 3,
}

/// An asynchronous push event scoped to a single collection.
///
/// One event is emitted per committed mutation. Bursts are not coalesced;
/// a subscriber that re-fetches on every event issues one fetch per event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEvent {
    pub collection: String,
    pub kind: ChangeKind,
    pub id: Uuid,
}

impl ChangeEvent {
    pub fn new(collection: impl Into<String>, kind: ChangeKind, id: Uuid) -> Self {
        Self {
            collection: collection.into(),
            kind,
            id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_kind_values() {
        assert_eq!(ChangeKind::Insert as u8, 1);
        assert_eq!(ChangeKind::Update as u8, 2);
        assert_eq!(ChangeKind::Delete as u8, 3);
    }

    #[test]
    fn test_change_event_new() {
        let id = Uuid::new_v4();
        let event = ChangeEvent::new("ideas", ChangeKind::Insert, id);
        assert_eq!(event.collection, "ideas");
        assert_eq!(event.kind, ChangeKind::Insert);
        assert_eq!(event.id, id);
    }
}
