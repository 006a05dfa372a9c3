//! In-memory session backend: a lock-guarded id→session map (spec section
//! 4.9's "in-memory map" backend; mirrors the top-level read-write lock the
//! file backend's directory scan does, but over a `HashMap` instead of disk).

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use super::{Session, SessionError, SessionEvent, SessionHeader, SessionStore, Summarizer};
use crate::model::{Message, Usage};

use super::validate_session_id;

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn open(&self, id: &str) -> Result<Session, SessionError> {
        validate_session_id(id)?;
        let mut sessions = self.sessions.write().unwrap();
        if let Some(session) = sessions.get(id) {
            return Ok(session.clone());
        }
        let now = Utc::now();
        let session = Session {
            header: SessionHeader { id: id.to_string(), title: id.to_string(), created_at: now, updated_at: now, metadata: HashMap::new(), forked_from: None },
            events: Vec::new(),
        };
        sessions.insert(id.to_string(), session.clone());
        Ok(session)
    }

    async fn append_turn(&self, id: &str, messages: Vec<Message>, usage: Usage) -> Result<(), SessionError> {
        validate_session_id(id)?;
        let mut sessions = self.sessions.write().unwrap();
        let session = sessions.get_mut(id).ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        session.events.push(SessionEvent::Turn { timestamp: Utc::now(), messages, usage });
        session.recompute_updated_at();
        Ok(())
    }

    async fn compact(&self, id: &str, summarizer: &Summarizer) -> Result<(), SessionError> {
        validate_session_id(id)?;
        let mut sessions = self.sessions.write().unwrap();
        let session = sessions.get_mut(id).ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        let flattened = session.messages();
        let summary = summarizer(&flattened);
        session.events = vec![SessionEvent::Compacted { timestamp: Utc::now(), messages: summary }];
        session.recompute_updated_at();
        Ok(())
    }

    async fn fork(&self, id: &str, new_id: &str) -> Result<(), SessionError> {
        validate_session_id(id)?;
        validate_session_id(new_id)?;
        let mut sessions = self.sessions.write().unwrap();
        let source = sessions.get(id).ok_or_else(|| SessionError::NotFound(id.to_string()))?.clone();
        let now = Utc::now();
        let forked = Session {
            header: SessionHeader {
                id: new_id.to_string(),
                title: source.header.title.clone(),
                created_at: now,
                updated_at: now,
                metadata: source.header.metadata.clone(),
                forked_from: Some(id.to_string()),
            },
            events: source.events.clone(),
        };
        sessions.insert(new_id.to_string(), forked);
        Ok(())
    }

    async fn list(&self, offset: usize, limit: usize) -> Result<Vec<SessionHeader>, SessionError> {
        let sessions = self.sessions.read().unwrap();
        let mut headers: Vec<SessionHeader> = sessions.values().map(|s| s.header.clone()).collect();
        headers.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(headers.into_iter().skip(offset).take(limit).collect())
    }

    async fn delete(&self, id: &str) -> Result<(), SessionError> {
        validate_session_id(id)?;
        self.sessions.write().unwrap().remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Message;

    #[tokio::test]
    async fn open_creates_a_new_session_with_a_header() {
        let store = MemorySessionStore::new();
        let session = store.open("abc").await.unwrap();
        assert_eq!(session.header.id, "abc");
        assert!(session.events.is_empty());
    }

    #[tokio::test]
    async fn append_turn_accumulates_events_in_order() {
        let store = MemorySessionStore::new();
        store.open("abc").await.unwrap();
        store.append_turn("abc", vec![Message::user_text("hi")], Usage::default()).await.unwrap();
        store.append_turn("abc", vec![Message::assistant_text("hello")], Usage::default()).await.unwrap();
        let session = store.open("abc").await.unwrap();
        assert_eq!(session.messages().len(), 2);
    }

    #[tokio::test]
    async fn compact_replaces_the_log_with_one_summarizing_event() {
        let store = MemorySessionStore::new();
        store.open("abc").await.unwrap();
        store.append_turn("abc", vec![Message::user_text("hi")], Usage::default()).await.unwrap();
        store.append_turn("abc", vec![Message::assistant_text("hello")], Usage::default()).await.unwrap();
        let summarizer: Summarizer = Box::new(|messages| vec![Message::system_text(format!("summary of {} messages", messages.len()))]);
        store.compact("abc", &summarizer).await.unwrap();
        let session = store.open("abc").await.unwrap();
        assert_eq!(session.events.len(), 1);
        assert_eq!(session.messages()[0].last_text(), "summary of 2 messages");
    }

    #[tokio::test]
    async fn fork_deep_copies_events_and_records_forked_from() {
        let store = MemorySessionStore::new();
        store.open("abc").await.unwrap();
        store.append_turn("abc", vec![Message::user_text("hi")], Usage::default()).await.unwrap();
        store.fork("abc", "abc-2").await.unwrap();
        let forked = store.open("abc-2").await.unwrap();
        assert_eq!(forked.header.forked_from.as_deref(), Some("abc"));
        assert_eq!(forked.messages().len(), 1);
    }

    #[tokio::test]
    async fn open_defaults_title_to_the_session_id() {
        let store = MemorySessionStore::new();
        let session = store.open("abc").await.unwrap();
        assert_eq!(session.header.title, "abc");
        assert!(session.header.metadata.is_empty());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = MemorySessionStore::new();
        store.open("abc").await.unwrap();
        store.delete("abc").await.unwrap();
        store.delete("abc").await.unwrap();
    }

    #[tokio::test]
    async fn invalid_ids_are_rejected() {
        let store = MemorySessionStore::new();
        let err = store.open("../evil").await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidId(_)));
    }
}
