//! The message envelope moved through brokers, routers and handlers.
//!
//! A [`Message`] is an immutable value: an id, an opaque payload (usually a
//! JSON-encoded domain event) and a string metadata map. Metadata carries the
//! correlation id and anything else that must travel with the payload across
//! asynchronous hops.
//!
//! There are no setters. Builders such as [`Message::with_metadata`] consume
//! the message and return a new one, so a handler holding a delivered message
//! cannot change what the broker or the next middleware sees.
//!
//! # Example
//!
//! ```
//! use courier_core::message::Message;
//! use courier_core::correlation::CORRELATION_ID_KEY;
//!
//! let message = Message::new(br#"{"ticket_id":"T1"}"#.to_vec())
//!     .with_metadata(CORRELATION_ID_KEY, "req-42");
//!
//! assert_eq!(message.correlation_id(), Some("req-42"));
//!
//! // Messages produced while handling another keep its metadata.
//! let produced = message.derive(br#"{"order_id":"O1"}"#.to_vec());
//! assert_ne!(produced.id(), message.id());
//! assert_eq!(produced.correlation_id(), Some("req-42"));
//! ```

use crate::correlation::CORRELATION_ID_KEY;
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// String key/value pairs travelling with a message.
pub type Metadata = HashMap<String, String>;

/// Immutable envelope: id, payload bytes and metadata.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    id: Uuid,
    payload: Vec<u8>,
    metadata: Metadata,
}

impl Message {
    /// Create a message with a fresh random id and empty metadata.
    #[must_use]
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self::with_id(Uuid::new_v4(), payload)
    }

    /// Create a message with an explicit id.
    ///
    /// Brokers use this to rebuild a message read back from the wire.
    #[must_use]
    pub fn with_id(id: Uuid, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            payload: payload.into(),
            metadata: Metadata::new(),
        }
    }

    /// Return a copy of this message with `key` set to `value` in its metadata.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Return a copy of this message with all entries of `metadata` merged in.
    #[must_use]
    pub fn with_metadata_map(mut self, metadata: Metadata) -> Self {
        self.metadata.extend(metadata);
        self
    }

    /// Build a new message (fresh id) that inherits this message's metadata.
    ///
    /// Used for messages produced while handling another one, so that the
    /// correlation id round-trips through the republish.
    #[must_use]
    pub fn derive(&self, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(payload).with_metadata_map(self.metadata.clone())
    }

    /// The message id.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// The raw payload bytes.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// All metadata entries.
    #[must_use]
    pub const fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Look up one metadata entry.
    #[must_use]
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// The correlation id, if one is attached.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.metadata_value(CORRELATION_ID_KEY)
            .filter(|id| !id.is_empty())
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("payload_len", &self.payload.len())
            .field("metadata", &self.metadata)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_correlation_id_counts_as_missing() {
        let message = Message::new(vec![1]).with_metadata(CORRELATION_ID_KEY, "");
        assert_eq!(message.correlation_id(), None);
    }

    #[test]
    fn derive_keeps_metadata_but_not_id() {
        let original = Message::new(b"a".to_vec())
            .with_metadata(CORRELATION_ID_KEY, "c-1")
            .with_metadata("tenant", "acme");

        let derived = original.derive(b"b".to_vec());

        assert_ne!(derived.id(), original.id());
        assert_eq!(derived.payload(), b"b");
        assert_eq!(derived.metadata(), original.metadata());
    }

    #[test]
    fn debug_does_not_dump_payload() {
        let message = Message::new(b"secret-card-number".to_vec());
        let rendered = format!("{message:?}");
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("payload_len: 18"));
    }
}
