//! Durable local storage for the active session id

use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

/// Fixed key under which the active session id is stored
pub const SESSION_KEY: &str = "chatSessionId";

/// Durable key/value slot holding the current session id
pub trait SessionStore: Send + Sync {
    /// Read the stored session id, if any
    fn load(&self) -> crate::Result<Option<String>>;

    /// Store the session id, replacing any previous value
    fn save(&self, session_id: &str) -> crate::Result<()>;

    /// Remove the stored session id
    fn remove(&self) -> crate::Result<()>;
}

/// Session store backed by a small JSON file (`state.json`)
#[derive(Debug)]
pub struct FileSessionStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileSessionStore {
    /// Create a store keeping its state file in `dir`
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            path: dir.as_ref().join("state.json"),
            lock: Mutex::new(()),
        }
    }

    /// Path of the state file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> crate::Result<Map<String, Value>> {
        if !self.path.exists() {
            return Ok(Map::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(Map::new());
        }
        match serde_json::from_str::<Value>(&content) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) | Err(_) => {
                tracing::warn!(path = %self.path.display(), "Ignoring unreadable session state file");
                Ok(Map::new())
            }
        }
    }

    fn write_map(&self, map: Map<String, Value>) -> crate::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&Value::Object(map))?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self) -> crate::Result<Option<String>> {
        let _guard = self.lock.lock();
        let map = self.read_map()?;
        Ok(map
            .get(SESSION_KEY)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(ToString::to_string))
    }

    fn save(&self, session_id: &str) -> crate::Result<()> {
        let _guard = self.lock.lock();
        let mut map = self.read_map()?;
        map.insert(SESSION_KEY.to_string(), Value::String(session_id.to_string()));
        self.write_map(map)
    }

    fn remove(&self) -> crate::Result<()> {
        let _guard = self.lock.lock();
        let mut map = self.read_map()?;
        if map.remove(SESSION_KEY).is_some() {
            self.write_map(map)?;
        }
        Ok(())
    }
}

/// In-memory store, for tests and ephemeral runs
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    value: Mutex<Option<String>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that already holds a session id
    pub fn with_session(session_id: impl Into<String>) -> Self {
        Self {
            value: Mutex::new(Some(session_id.into())),
        }
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> crate::Result<Option<String>> {
        Ok(self.value.lock().clone())
    }

    fn save(&self, session_id: &str) -> crate::Result<()> {
        *self.value.lock() = Some(session_id.to_string());
        Ok(())
    }

    fn remove(&self) -> crate::Result<()> {
        *self.value.lock() = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_store_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(temp_dir.path());
        assert_eq!(store.load().unwrap(), None);

        store.save("abc-123").unwrap();
        assert_eq!(store.load().unwrap().as_deref(), Some("abc-123"));

        // A fresh store over the same directory sees the persisted value
        let reopened = FileSessionStore::new(temp_dir.path());
        assert_eq!(reopened.load().unwrap().as_deref(), Some("abc-123"));

        reopened.remove().unwrap();
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_file_store_preserves_other_keys() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(temp_dir.path());
        std::fs::write(store.path(), r#"{"theme":"dark"}"#).unwrap();

        store.save("s1").unwrap();
        store.remove().unwrap();

        let content = std::fs::read_to_string(store.path()).unwrap();
        let value: Value = serde_json::from_str(&content).unwrap();
        assert_eq!(value["theme"], "dark");
        assert!(value.get(SESSION_KEY).is_none());
    }

    #[test]
    fn test_file_store_tolerates_corrupt_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(temp_dir.path());
        std::fs::write(store.path(), "not json").unwrap();
        assert_eq!(store.load().unwrap(), None);
        store.save("s2").unwrap();
        assert_eq!(store.load().unwrap().as_deref(), Some("s2"));
    }
}
