//! Session store (C9): append-only conversation persistence. No direct
//! teacher analogue — `km_tools` has no session layer — so this is grounded
//! directly on spec section 4.9's JSONL header+event format, with the
//! file-writing idiom (a `Mutex`-guarded writer per resource) borrowed from
//! `km_tools::logger::SimpleLogger`, corrected to true append-mode rather
//! than that logger's rewrite-the-whole-file-on-every-write approach.

pub mod file;
pub mod memory;

pub use file::FileSessionStore;
pub use memory::MemorySessionStore;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::model::{Message, Usage};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session id '{0}' is invalid")]
    InvalidId(String),
    #[error("session '{0}' not found")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionHeader {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forked_from: Option<String>,
}

/// One line of a session's event log: either an ordinary turn, or the
/// single summarizing event a `compact` leaves behind. `kind` is the wire
/// discriminator (spec section 6); `Compacted` carries the `compact_marker`
/// tag rather than its Rust variant name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEvent {
    Turn {
        timestamp: DateTime<Utc>,
        messages: Vec<Message>,
        usage: Usage,
    },
    #[serde(rename = "compact_marker")]
    Compacted {
        timestamp: DateTime<Utc>,
        messages: Vec<Message>,
    },
}

impl SessionEvent {
    fn messages(&self) -> &[Message] {
        match self {
            SessionEvent::Turn { messages, .. } => messages,
            SessionEvent::Compacted { messages, .. } => messages,
        }
    }

    fn timestamp(&self) -> DateTime<Utc> {
        match self {
            SessionEvent::Turn { timestamp, .. } => *timestamp,
            SessionEvent::Compacted { timestamp, .. } => *timestamp,
        }
    }
}

/// The `{line_type, data}` envelope every line of a session's JSONL file is
/// wrapped in (spec section 6), serialized adjacently tagged so `data` nests
/// the header or event payload rather than splicing its fields in place.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "line_type", content = "data", rename_all = "snake_case")]
pub(crate) enum SessionLine {
    Header(SessionHeader),
    Event(SessionEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub header: SessionHeader,
    pub events: Vec<SessionEvent>,
}

impl Session {
    /// The flattened message history across every event, in log order.
    pub fn messages(&self) -> Vec<Message> {
        self.events.iter().flat_map(|e| e.messages().to_vec()).collect()
    }

    /// Derive `updated_at` from the latest event timestamp rather than a
    /// separately stored field, so the file backend never has to rewrite an
    /// already-written header to keep it current.
    pub(crate) fn recompute_updated_at(&mut self) {
        if let Some(latest) = self.events.iter().map(SessionEvent::timestamp).max() {
            if latest > self.header.updated_at {
                self.header.updated_at = latest;
            }
        }
    }
}

pub type Summarizer = Box<dyn Fn(&[Message]) -> Vec<Message> + Send + Sync>;

/// Persistence contract for C9 (spec section 4.9). `compact` takes the
/// summarizer by reference rather than by value so the trait stays object
/// safe for `Arc<dyn SessionStore>` callers.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn open(&self, id: &str) -> Result<Session, SessionError>;
    async fn append_turn(&self, id: &str, messages: Vec<Message>, usage: Usage) -> Result<(), SessionError>;
    async fn compact(&self, id: &str, summarizer: &Summarizer) -> Result<(), SessionError>;
    async fn fork(&self, id: &str, new_id: &str) -> Result<(), SessionError>;
    async fn list(&self, offset: usize, limit: usize) -> Result<Vec<SessionHeader>, SessionError>;
    async fn delete(&self, id: &str) -> Result<(), SessionError>;
}

/// Reject IDs containing path separators, `.`, `..`, or backslashes (spec
/// section 4.9/8's path-traversal guard).
pub fn validate_session_id(id: &str) -> Result<(), SessionError> {
    if id.is_empty() || id.chars().any(|c| c == '/' || c == '\\' || c == '.') {
        return Err(SessionError::InvalidId(id.to_string()));
    }
    Ok(())
}
