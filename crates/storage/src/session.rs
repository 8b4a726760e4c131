use chrono::{DateTime, Utc};
use nanocell_core::types::{ChatMessage, Role};
use nanocell_core::{Paths, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "_type")]
enum SessionLine {
    #[serde(rename = "metadata")]
    Metadata {
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        #[serde(default)]
        metadata: serde_json::Value,
    },
    #[serde(untagged)]
    Message(SessionMessage),
}

/// Conversation history for one session key.
#[derive(Debug, Clone)]
pub struct Session {
    pub key: String,
    pub messages: Vec<SessionMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

impl Session {
    pub fn new(key: &str) -> Self {
        let now = Utc::now();
        Self {
            key: key.to_string(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            metadata: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    pub fn add_message(&mut self, role: Role, content: &str) {
        let now = Utc::now();
        self.messages.push(SessionMessage {
            role,
            content: content.to_string(),
            timestamp: now,
        });
        self.updated_at = now;
    }

    /// The last `limit` messages as plain role/content chat messages.
    pub fn get_history(&self, limit: usize) -> Vec<ChatMessage> {
        let start = self.messages.len().saturating_sub(limit);
        self.messages[start..]
            .iter()
            .map(|m| match m.role {
                Role::System => ChatMessage::system(&m.content),
                Role::User => ChatMessage::user(&m.content),
                // Tool results are never replayed on their own; keep the text.
                Role::Assistant | Role::Tool => ChatMessage::assistant(&m.content),
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub path: PathBuf,
}

/// JSONL-backed session store with an in-memory cache.
///
/// Each file starts with a `{"_type": "metadata", ...}` line followed by one
/// line per message.
pub struct SessionManager {
    paths: Paths,
    cache: Mutex<HashMap<String, Session>>,
}

impl SessionManager {
    pub fn new(paths: Paths) -> Self {
        Self {
            paths,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a snapshot of the session, loading it from disk or creating an
    /// empty one. Unreadable files are logged and replaced by a fresh session.
    pub fn get_or_create(&self, key: &str) -> Session {
        if let Some(session) = self.lock_cache().get(key) {
            return session.clone();
        }

        let session = match self.load(key) {
            Ok(Some(session)) => session,
            Ok(None) => Session::new(key),
            Err(e) => {
                warn!(session = key, error = %e, "Failed to load session, starting fresh");
                Session::new(key)
            }
        };
        self.lock_cache().insert(key.to_string(), session.clone());
        session
    }

    fn load(&self, key: &str) -> Result<Option<Session>> {
        let path = self.paths.session_file(key);
        if !path.exists() {
            return Ok(None);
        }

        let reader = BufReader::new(File::open(&path)?);
        let mut session = Session::new(key);

        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<SessionLine>(&line) {
                Ok(SessionLine::Message(msg)) => session.messages.push(msg),
                Ok(SessionLine::Metadata {
                    created_at,
                    updated_at,
                    metadata,
                }) => {
                    session.created_at = created_at;
                    session.updated_at = updated_at;
                    session.metadata = metadata;
                }
                Err(e) => {
                    debug!(error = %e, "Failed to parse session line, skipping");
                }
            }
        }

        Ok(Some(session))
    }

    pub fn save(&self, session: &Session) -> Result<()> {
        let path = self.paths.session_file(&session.key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = File::create(&path)?;
        let metadata = SessionLine::Metadata {
            created_at: session.created_at,
            updated_at: session.updated_at,
            metadata: session.metadata.clone(),
        };
        writeln!(file, "{}", serde_json::to_string(&metadata)?)?;
        for msg in &session.messages {
            writeln!(file, "{}", serde_json::to_string(msg)?)?;
        }

        debug!(session = %session.key, messages = session.messages.len(), "Session saved");
        self.lock_cache().insert(session.key.clone(), session.clone());
        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<bool> {
        self.lock_cache().remove(key);
        let path = self.paths.session_file(key);
        if path.exists() {
            std::fs::remove_file(&path)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Sessions found on disk, most recently updated first. Keys are
    /// reconstructed from file names, so `_` reads back as `:`.
    pub fn list(&self) -> Result<Vec<SessionInfo>> {
        let dir = self.paths.sessions_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut sessions = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            let Some(stem) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".jsonl"))
            else {
                continue;
            };

            let Ok(file) = File::open(&path) else {
                continue;
            };
            let mut first = String::new();
            if BufReader::new(file).read_line(&mut first).is_err() {
                continue;
            }
            if let Ok(SessionLine::Metadata {
                created_at, updated_at, ..
            }) = serde_json::from_str::<SessionLine>(first.trim())
            {
                sessions.push(SessionInfo {
                    key: stem.replace('_', ":"),
                    created_at,
                    updated_at,
                    path: path.clone(),
                });
            }
        }

        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, Session>> {
        // A poisoned cache only means another thread panicked mid-insert.
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (tempfile::TempDir, SessionManager) {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::with_base(dir.path().to_path_buf());
        (dir, SessionManager::new(paths))
    }

    #[test]
    fn test_history_limit_keeps_latest() {
        let mut session = Session::new("cli:direct");
        for i in 0..5 {
            session.add_message(Role::User, &format!("q{}", i));
            session.add_message(Role::Assistant, &format!("a{}", i));
        }
        let history = session.get_history(3);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].text(), "a3");
        assert_eq!(history[1].role, Role::User);
        assert_eq!(history[2].text(), "a4");
        assert_eq!(session.get_history(50).len(), 10);
    }

    #[test]
    fn test_save_and_reload_from_disk() {
        let (dir, mgr) = manager();
        let mut session = mgr.get_or_create("telegram:42");
        session.add_message(Role::User, "hello");
        session.add_message(Role::Assistant, "hi there");
        mgr.save(&session).unwrap();

        let raw = std::fs::read_to_string(dir.path().join("sessions/telegram_42.jsonl")).unwrap();
        let first: serde_json::Value = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
        assert_eq!(first["_type"], "metadata");
        assert_eq!(raw.lines().count(), 3);

        // A fresh manager has an empty cache and must read the file.
        let mgr2 = SessionManager::new(Paths::with_base(dir.path().to_path_buf()));
        let loaded = mgr2.get_or_create("telegram:42");
        assert_eq!(loaded.messages, session.messages);
        assert_eq!(loaded.created_at, session.created_at);
    }

    #[test]
    fn test_get_or_create_returns_cached_snapshot() {
        let (_dir, mgr) = manager();
        let mut session = mgr.get_or_create("cli:direct");
        session.add_message(Role::User, "unsaved");
        assert!(mgr.get_or_create("cli:direct").messages.is_empty());

        mgr.save(&session).unwrap();
        assert_eq!(mgr.get_or_create("cli:direct").messages.len(), 1);
    }

    #[test]
    fn test_list_and_delete() {
        let (_dir, mgr) = manager();
        assert!(mgr.list().unwrap().is_empty());

        let mut session = mgr.get_or_create("cli:direct");
        session.add_message(Role::User, "x");
        mgr.save(&session).unwrap();

        let listed = mgr.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, "cli:direct");

        assert!(mgr.delete("cli:direct").unwrap());
        assert!(!mgr.delete("cli:direct").unwrap());
        assert!(mgr.list().unwrap().is_empty());
    }
}
