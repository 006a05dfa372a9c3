//! Append-only file session backend: one JSONL file per session, each line
//! a [`SessionLine`] envelope wrapping either a [`SessionHeader`] or a
//! [`SessionEvent`]. The writer idiom (a `Mutex`-guarded handle per
//! resource) is borrowed from `km_tools::logger::SimpleLogger`, but
//! `append_turn` opens in true append-mode and never reads the file back,
//! per spec section 4.9's O(1)-append requirement: `updated_at` is derived
//! from per-event timestamps at read time instead of being stored in the
//! header and rewritten on every turn.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use super::{validate_session_id, Session, SessionError, SessionEvent, SessionHeader, SessionLine, SessionStore, Summarizer};
use crate::model::{Message, Usage};

pub struct FileSessionStore {
    dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, SessionError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, locks: Mutex::new(HashMap::new()) })
    }

    fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        self.locks.lock().unwrap().entry(id.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Resolve `id` to a path guaranteed to live inside the store directory.
    /// `validate_session_id` already rejects separators and dots, so this is
    /// defense in depth against any future relaxation of that check.
    fn path_for(&self, id: &str) -> Result<PathBuf, SessionError> {
        validate_session_id(id)?;
        let path = self.dir.join(format!("{id}.jsonl"));
        if path.parent() != Some(self.dir.as_path()) {
            return Err(SessionError::InvalidId(id.to_string()));
        }
        Ok(path)
    }

    fn read_session(path: &Path) -> Result<Option<Session>, SessionError> {
        if !path.exists() {
            return Ok(None);
        }
        let file = File::open(path)?;
        let mut lines = BufReader::new(file).lines();
        let header_line = match lines.next() {
            Some(line) => line?,
            None => return Ok(None),
        };
        let header = match serde_json::from_str::<SessionLine>(&header_line)? {
            SessionLine::Header(header) => header,
            SessionLine::Event(_) => return Err(SessionError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, "session file missing header line"))),
        };
        let mut events = Vec::new();
        for line in lines {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<SessionLine>(&line)? {
                SessionLine::Event(event) => events.push(event),
                SessionLine::Header(_) => return Err(SessionError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, "unexpected header line in session body"))),
            }
        }
        let mut session = Session { header, events };
        session.recompute_updated_at();
        Ok(Some(session))
    }

    fn write_session(path: &Path, session: &Session) -> Result<(), SessionError> {
        let mut file = File::create(path)?;
        writeln!(file, "{}", serde_json::to_string(&SessionLine::Header(session.header.clone()))?)?;
        for event in &session.events {
            writeln!(file, "{}", serde_json::to_string(&SessionLine::Event(event.clone()))?)?;
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn open(&self, id: &str) -> Result<Session, SessionError> {
        let path = self.path_for(id)?;
        let _guard = self.lock_for(id);
        let _guard = _guard.lock().unwrap();
        if let Some(session) = Self::read_session(&path)? {
            return Ok(session);
        }
        let now = Utc::now();
        let session = Session {
            header: SessionHeader { id: id.to_string(), title: id.to_string(), created_at: now, updated_at: now, metadata: HashMap::new(), forked_from: None },
            events: Vec::new(),
        };
        Self::write_session(&path, &session)?;
        Ok(session)
    }

    async fn append_turn(&self, id: &str, messages: Vec<Message>, usage: Usage) -> Result<(), SessionError> {
        let path = self.path_for(id)?;
        let lock = self.lock_for(id);
        let _guard = lock.lock().unwrap();
        if !path.exists() {
            return Err(SessionError::NotFound(id.to_string()));
        }
        let event = SessionEvent::Turn { timestamp: Utc::now(), messages, usage };
        let mut file = OpenOptions::new().append(true).open(&path)?;
        writeln!(file, "{}", serde_json::to_string(&SessionLine::Event(event))?)?;
        Ok(())
    }

    async fn compact(&self, id: &str, summarizer: &Summarizer) -> Result<(), SessionError> {
        let path = self.path_for(id)?;
        let lock = self.lock_for(id);
        let _guard = lock.lock().unwrap();
        let mut session = Self::read_session(&path)?.ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        let flattened = session.messages();
        let summary = summarizer(&flattened);
        session.events = vec![SessionEvent::Compacted { timestamp: Utc::now(), messages: summary }];
        session.recompute_updated_at();
        Self::write_session(&path, &session)
    }

    async fn fork(&self, id: &str, new_id: &str) -> Result<(), SessionError> {
        let source_path = self.path_for(id)?;
        let new_path = self.path_for(new_id)?;
        let source_lock = self.lock_for(id);
        let _source_guard = source_lock.lock().unwrap();
        let source = Self::read_session(&source_path)?.ok_or_else(|| SessionError::NotFound(id.to_string()))?;
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
        let new_lock = self.lock_for(new_id);
        let _new_guard = new_lock.lock().unwrap();
        Self::write_session(&new_path, &forked)
    }

    async fn list(&self, offset: usize, limit: usize) -> Result<Vec<SessionHeader>, SessionError> {
        let mut headers = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            if let Some(session) = Self::read_session(&path)? {
                headers.push(session.header);
            }
        }
        headers.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(headers.into_iter().skip(offset).take(limit).collect())
    }

    async fn delete(&self, id: &str) -> Result<(), SessionError> {
        let path = self.path_for(id)?;
        let lock = self.lock_for(id);
        let _guard = lock.lock().unwrap();
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn open_creates_a_header_line() {
        let dir = tempdir().unwrap();
        let store = FileSessionStore::new(dir.path()).unwrap();
        let session = store.open("s1").await.unwrap();
        assert_eq!(session.header.id, "s1");
        assert!(dir.path().join("s1.jsonl").exists());
    }

    #[tokio::test]
    async fn append_turn_is_readable_back_in_order() {
        let dir = tempdir().unwrap();
        let store = FileSessionStore::new(dir.path()).unwrap();
        store.open("s1").await.unwrap();
        store.append_turn("s1", vec![Message::user_text("hi")], Usage::default()).await.unwrap();
        store.append_turn("s1", vec![Message::assistant_text("hello")], Usage::default()).await.unwrap();
        let session = store.open("s1").await.unwrap();
        let messages = session.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].last_text(), "hi");
        assert_eq!(messages[1].last_text(), "hello");
    }

    #[tokio::test]
    async fn rejects_ids_that_would_traverse_outside_the_store() {
        let dir = tempdir().unwrap();
        let store = FileSessionStore::new(dir.path()).unwrap();
        let err = store.open("../escape").await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidId(_)));
    }

    #[tokio::test]
    async fn fork_produces_an_independent_file_with_forked_from_set() {
        let dir = tempdir().unwrap();
        let store = FileSessionStore::new(dir.path()).unwrap();
        store.open("s1").await.unwrap();
        store.append_turn("s1", vec![Message::user_text("hi")], Usage::default()).await.unwrap();
        store.fork("s1", "s2").await.unwrap();
        let forked = store.open("s2").await.unwrap();
        assert_eq!(forked.header.forked_from.as_deref(), Some("s1"));
        assert_eq!(forked.messages().len(), 1);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = FileSessionStore::new(dir.path()).unwrap();
        store.open("s1").await.unwrap();
        store.delete("s1").await.unwrap();
        store.delete("s1").await.unwrap();
    }

    #[tokio::test]
    async fn header_and_event_lines_use_the_line_type_envelope() {
        let dir = tempdir().unwrap();
        let store = FileSessionStore::new(dir.path()).unwrap();
        store.open("s1").await.unwrap();
        store.append_turn("s1", vec![Message::user_text("hi")], Usage::default()).await.unwrap();

        let raw = fs::read_to_string(dir.path().join("s1.jsonl")).unwrap();
        let mut lines = raw.lines();
        let header_line: serde_json::Value = serde_json::from_str(lines.next().unwrap()).unwrap();
        assert_eq!(header_line["line_type"], "header");
        assert_eq!(header_line["data"]["id"], "s1");

        let event_line: serde_json::Value = serde_json::from_str(lines.next().unwrap()).unwrap();
        assert_eq!(event_line["line_type"], "event");
        assert_eq!(event_line["data"]["kind"], "turn");
        assert!(event_line["data"]["timestamp"].is_string());
    }

    #[tokio::test]
    async fn append_turn_never_rewrites_the_header_line() {
        let dir = tempdir().unwrap();
        let store = FileSessionStore::new(dir.path()).unwrap();
        store.open("s1").await.unwrap();
        let before = fs::read_to_string(dir.path().join("s1.jsonl")).unwrap();
        store.append_turn("s1", vec![Message::user_text("hi")], Usage::default()).await.unwrap();
        let after = fs::read_to_string(dir.path().join("s1.jsonl")).unwrap();
        assert!(after.starts_with(&before), "header line must stay byte-identical across an append");
    }

    #[tokio::test]
    async fn list_orders_by_updated_at_descending() {
        let dir = tempdir().unwrap();
        let store = FileSessionStore::new(dir.path()).unwrap();
        store.open("older").await.unwrap();
        store.open("newer").await.unwrap();
        store.append_turn("newer", vec![Message::user_text("hi")], Usage::default()).await.unwrap();
        let headers = store.list(0, 10).await.unwrap();
        assert_eq!(headers[0].id, "newer");
    }
}
