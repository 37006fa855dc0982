//! The durable, storage-agnostic form of one outbox entry.
//!
//! An [`Envelope`] is what a producer appends to the outbox inside its
//! business transaction and what a drain loop later hands to the
//! dispatcher. It carries an identity, the time it was enqueued, a set of
//! string headers, and an opaque payload that only the codec interprets.
//!
//! Envelopes are immutable once persisted. Delivery state (pending, claimed,
//! done) belongs to the store, never to the envelope itself.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Header carrying the command type tag used to pick a deserializer.
pub const COMMAND_TYPE_HEADER: &str = "courier-command-type";

/// Header naming the payload encoding (e.g. `application/json`).
pub const CONTENT_TYPE_HEADER: &str = "courier-content-type";

/// Header carrying an optional correlation id for tracing related work.
pub const CORRELATION_ID_HEADER: &str = "courier-correlation-id";

/// Header map. Keys are unique; order is irrelevant.
pub type Headers = HashMap<String, String>;

/// One outbox command, as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    id: Uuid,
    enqueued_at: DateTime<Utc>,
    headers: Headers,
    payload: Vec<u8>,
}

impl Envelope {
    /// Create a fresh envelope with a new time-ordered id and the current time.
    pub fn new(headers: Headers, payload: Vec<u8>) -> Self {
        Self {
            id: Uuid::now_v7(),
            enqueued_at: Utc::now(),
            headers,
            payload,
        }
    }

    /// Rebuild an envelope from a stored row.
    ///
    /// Stores use this when loading; the id and timestamp are taken as-is.
    pub fn from_parts(
        id: Uuid,
        enqueued_at: DateTime<Utc>,
        headers: Headers,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            id,
            enqueued_at,
            headers,
            payload,
        }
    }

    /// Add a header before the envelope is persisted.
    ///
    /// Replaces any existing value for the same key.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Attach a correlation id header.
    pub fn with_correlation_id(self, correlation_id: Uuid) -> Self {
        self.with_header(CORRELATION_ID_HEADER, correlation_id.to_string())
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The command type tag, if the envelope has one.
    pub fn command_type(&self) -> Option<&str> {
        self.header(COMMAND_TYPE_HEADER)
    }

    /// The correlation id, if present and well formed.
    pub fn correlation_id(&self) -> Option<Uuid> {
        self.header(CORRELATION_ID_HEADER)
            .and_then(|raw| Uuid::parse_str(raw).ok())
    }

    /// Split into owned parts, e.g. for writing a row.
    pub fn into_parts(self) -> (Uuid, DateTime<Utc>, Headers, Vec<u8>) {
        (self.id, self.enqueued_at, self.headers, self.payload)
    }
}
