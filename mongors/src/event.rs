//! Command and connection-pool observability events (`spec.md` §6
//! "Observability surface"). SDAM events live alongside the SDAM engine at
//! [`crate::sdam::events`]; these two enums cover the other two event
//! families the spec names.
//!
//! Delivered over per-client `tokio::sync::broadcast` channels. A slow
//! subscriber drops events rather than backpressuring the driver: its next
//! `recv()` returns `RecvError::Lagged(n)` reporting how many it missed,
//! the channel's native lagged-receiver behavior.

use std::time::Duration;

use crate::bson::Document;
use crate::sdam::ServerAddress;

/// `spec.md` §6 "Command" events. Document fields over
/// [`crate::event::MAX_DOCUMENT_LENGTH_FOR_EVENTS`] are elided to keep log
/// lines bounded, per the spec's explicit requirement.
#[derive(Debug, Clone)]
pub enum CommandEvent {
    Started {
        command: Document,
        command_name: String,
        request_id: i32,
        operation_id: u64,
        connection_id: u64,
        database_name: String,
    },
    Succeeded {
        request_id: i32,
        command_name: String,
        reply: Document,
        duration: Duration,
    },
    Failed {
        request_id: i32,
        command_name: String,
        failure: String,
        duration: Duration,
    },
}

/// Document fields longer than this (in encoded bytes) are replaced with a
/// placeholder before being attached to a [`CommandEvent`].
pub const MAX_DOCUMENT_LENGTH_FOR_EVENTS: usize = 1000;

/// Elides any top-level field whose encoded value exceeds
/// [`MAX_DOCUMENT_LENGTH_FOR_EVENTS`] bytes, replacing it with a sentinel
/// string so a command carrying a multi-megabyte payload doesn't blow up a
/// log line.
pub fn redact_oversized_fields(doc: &Document) -> Document {
    let mut out = Document::new();
    for (key, value) in doc.iter() {
        let encoded_len = match value {
            crate::bson::Bson::Document(d) => crate::bson::encode_document(d).len(),
            crate::bson::Bson::String(s) => s.len(),
            crate::bson::Bson::Array(items) => items.len() * 8,
            _ => 0,
        };
        if encoded_len > MAX_DOCUMENT_LENGTH_FOR_EVENTS {
            out.insert(key.clone(), "<truncated for event size>".to_string());
        } else {
            out.insert(key.clone(), value.clone());
        }
    }
    out
}

/// `spec.md` §6 "Pool" events.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    ConnectionCreated { address: ServerAddress, connection_id: u64 },
    ConnectionReady { address: ServerAddress, connection_id: u64 },
    ConnectionClosed { address: ServerAddress, connection_id: u64 },
    CheckedOut { address: ServerAddress, connection_id: u64 },
    CheckedIn { address: ServerAddress, connection_id: u64 },
    PoolCleared { address: ServerAddress },
}
