//! Binary protocol for collection synchronization.
//!
//! Wire format (bincode-encoded envelope):
//! ```text
//! ┌──────────┬───────────┬────────────┬──────────┬──────────┐
//! │ msg_type │ client_id │ collection │ seq      │ payload  │
//! │ 1 byte   │ 16 bytes  │ variable   │ 8 bytes  │ variable │
//! └──────────┴───────────┴────────────┴──────────┴──────────┘
//! ```
//!
//! Payloads are serde_json-encoded: records are schemaless field maps, so
//! they travel in a self-describing format inside the opaque payload bytes.
//! `seq` correlates a request with its Snapshot/Ack/Error response.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use shoal_core::{ChangeKind, Record};

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// First message from a client, announces its id
    Hello = 1,
    /// Client requests the change feed of a collection
    Subscribe = 2,
    /// Snapshot read request
    Query = 3,
    /// Snapshot read response
    Snapshot = 4,
    /// Insert a record
    Insert = 5,
    /// Partially update a record
    Update = 6,
    /// Delete a record
    Delete = 7,
    /// Mutation acknowledged
    Ack = 8,
    /// A mutation committed somewhere — subscribers should re-fetch
    Change = 9,
    /// Request failed
    Error = 10,
    /// Heartbeat ping
    Ping = 11,
    /// Heartbeat pong
    Pong = 12,
}

/// Query parameters: optional field selection and row limit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryPayload {
    pub fields: Option<Vec<String>>,
    pub limit: Option<usize>,
}

/// Snapshot response: the full ordered record set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotPayload {
    pub records: Vec<Record>,
}

/// Insert request body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InsertPayload {
    pub record: Record,
}

/// Partial update request body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdatePayload {
    pub id: Uuid,
    pub fields: Map<String, Value>,
}

/// Delete request body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeletePayload {
    pub id: Uuid,
}

/// Change notification body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangePayload {
    pub kind: ChangeKind,
    pub id: Uuid,
}

/// Error response body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorPayload {
    pub message: String,
}

/// Top-level protocol message.
///
/// Serialized with bincode for minimal overhead; the payload is JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub msg_type: MessageType,
    pub client_id: Uuid,
    /// Collection this message is scoped to (empty for Hello/Ping/Pong)
    pub collection: String,
    /// Request/response correlation number (0 for unsolicited messages)
    pub seq: u64,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

impl WireMessage {
    /// Create the client's opening message.
    pub fn hello(client_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::Hello,
            client_id,
            collection: String::new(),
            seq: 0,
            payload: Vec::new(),
        }
    }

    /// Create a change-feed subscription request.
    pub fn subscribe(client_id: Uuid, collection: impl Into<String>) -> Self {
        Self {
            msg_type: MessageType::Subscribe,
            client_id,
            collection: collection.into(),
            seq: 0,
            payload: Vec::new(),
        }
    }

    /// Create a snapshot read request.
    pub fn query(
        client_id: Uuid,
        collection: impl Into<String>,
        seq: u64,
        query: &QueryPayload,
    ) -> Self {
        Self {
            msg_type: MessageType::Query,
            client_id,
            collection: collection.into(),
            seq,
            payload: serde_json::to_vec(query).unwrap_or_default(),
        }
    }

    /// Create a snapshot response.
    pub fn snapshot(collection: impl Into<String>, seq: u64, records: Vec<Record>) -> Self {
        let payload = SnapshotPayload { records };
        Self {
            msg_type: MessageType::Snapshot,
            client_id: Uuid::nil(),
            collection: collection.into(),
            seq,
            payload: serde_json::to_vec(&payload).unwrap_or_default(),
        }
    }

    /// Create an insert request.
    pub fn insert(
        client_id: Uuid,
        collection: impl Into<String>,
        seq: u64,
        record: Record,
    ) -> Self {
        let payload = InsertPayload { record };
        Self {
            msg_type: MessageType::Insert,
            client_id,
            collection: collection.into(),
            seq,
            payload: serde_json::to_vec(&payload).unwrap_or_default(),
        }
    }

    /// Create a partial update request.
    pub fn update(
        client_id: Uuid,
        collection: impl Into<String>,
        seq: u64,
        id: Uuid,
        fields: Map<String, Value>,
    ) -> Self {
        let payload = UpdatePayload { id, fields };
        Self {
            msg_type: MessageType::Update,
            client_id,
            collection: collection.into(),
            seq,
            payload: serde_json::to_vec(&payload).unwrap_or_default(),
        }
    }

    /// Create a delete request.
    pub fn delete(client_id: Uuid, collection: impl Into<String>, seq: u64, id: Uuid) -> Self {
        let payload = DeletePayload { id };
        Self {
            msg_type: MessageType::Delete,
            client_id,
            collection: collection.into(),
            seq,
            payload: serde_json::to_vec(&payload).unwrap_or_default(),
        }
    }

    /// Create a mutation acknowledgement.
    pub fn ack(collection: impl Into<String>, seq: u64) -> Self {
        Self {
            msg_type: MessageType::Ack,
            client_id: Uuid::nil(),
            collection: collection.into(),
            seq,
            payload: Vec::new(),
        }
    }

    /// Create a change notification.
    pub fn change(collection: impl Into<String>, kind: ChangeKind, id: Uuid) -> Self {
        let payload = ChangePayload { kind, id };
        Self {
            msg_type: MessageType::Change,
            client_id: Uuid::nil(),
            collection: collection.into(),
            seq: 0,
            payload: serde_json::to_vec(&payload).unwrap_or_default(),
        }
    }

    /// Create an error response.
    pub fn error(collection: impl Into<String>, seq: u64, message: impl Into<String>) -> Self {
        let payload = ErrorPayload {
            message: message.into(),
        };
        Self {
            msg_type: MessageType::Error,
            client_id: Uuid::nil(),
            collection: collection.into(),
            seq,
            payload: serde_json::to_vec(&payload).unwrap_or_default(),
        }
    }

    /// Create a ping message.
    pub fn ping(client_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::Ping,
            client_id,
            collection: String::new(),
            seq: 0,
            payload: Vec::new(),
        }
    }

    /// Create a pong message.
    pub fn pong(client_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::Pong,
            client_id,
            collection: String::new(),
            seq: 0,
            payload: Vec::new(),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Parse a query payload.
    pub fn query_payload(&self) -> Result<QueryPayload, ProtocolError> {
        if self.msg_type != MessageType::Query {
            return Err(ProtocolError::InvalidMessageType);
        }
        Self::decode_payload(&self.payload)
    }

    /// Parse a snapshot payload.
    pub fn snapshot_records(&self) -> Result<Vec<Record>, ProtocolError> {
        if self.msg_type != MessageType::Snapshot {
            return Err(ProtocolError::InvalidMessageType);
        }
        let payload: SnapshotPayload = Self::decode_payload(&self.payload)?;
        Ok(payload.records)
    }

    /// Parse an insert payload.
    pub fn insert_record(&self) -> Result<Record, ProtocolError> {
        if self.msg_type != MessageType::Insert {
            return Err(ProtocolError::InvalidMessageType);
        }
        let payload: InsertPayload = Self::decode_payload(&self.payload)?;
        Ok(payload.record)
    }

    /// Parse an update payload.
    pub fn update_payload(&self) -> Result<UpdatePayload, ProtocolError> {
        if self.msg_type != MessageType::Update {
            return Err(ProtocolError::InvalidMessageType);
        }
        Self::decode_payload(&self.payload)
    }

    /// Parse a delete payload.
    pub fn delete_id(&self) -> Result<Uuid, ProtocolError> {
        if self.msg_type != MessageType::Delete {
            return Err(ProtocolError::InvalidMessageType);
        }
        let payload: DeletePayload = Self::decode_payload(&self.payload)?;
        Ok(payload.id)
    }

    /// Parse a change payload.
    pub fn change_payload(&self) -> Result<ChangePayload, ProtocolError> {
        if self.msg_type != MessageType::Change {
            return Err(ProtocolError::InvalidMessageType);
        }
        Self::decode_payload(&self.payload)
    }

    /// Parse an error payload.
    pub fn error_message(&self) -> Result<String, ProtocolError> {
        if self.msg_type != MessageType::Error {
            return Err(ProtocolError::InvalidMessageType);
        }
        let payload: ErrorPayload = Self::decode_payload(&self.payload)?;
        Ok(payload.message)
    }

    fn decode_payload<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
