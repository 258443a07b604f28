//! Narrow interfaces over the durable backing stores.
//!
//! The record store (keyed rows in named tables) and the document store
//! (content by path) are consumed as opaque, already-durable services.
//! Only these verbs exist; everything behind them is out of scope. The
//! in-memory implementations back the tests and any embedder that wants
//! volatile storage.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// Keyed record storage, namespaced by table.
pub trait RecordStore: Send + Sync {
    fn get(&self, table: &str, key: &str) -> Result<Option<Vec<u8>>, BackingError>;
    fn put(&self, table: &str, key: &str, value: Vec<u8>) -> Result<(), BackingError>;
    fn delete(&self, table: &str, key: &str) -> Result<(), BackingError>;
    fn list(&self, table: &str) -> Result<Vec<String>, BackingError>;
}

/// Document content storage, keyed by path.
pub trait DocStore: Send + Sync {
    fn read(&self, path: &str) -> Result<Option<String>, BackingError>;
    fn write(&self, path: &str, content: &str) -> Result<(), BackingError>;
    fn list(&self) -> Result<Vec<String>, BackingError>;
    fn rename(&self, from: &str, to: &str) -> Result<(), BackingError>;
}

/// In-memory record store.
#[derive(Default)]
pub struct MemoryRecords {
    tables: Mutex<HashMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryRecords {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for MemoryRecords {
    fn get(&self, table: &str, key: &str) -> Result<Option<Vec<u8>>, BackingError> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.get(table).and_then(|t| t.get(key)).cloned())
    }

    fn put(&self, table: &str, key: &str, value: Vec<u8>) -> Result<(), BackingError> {
        let mut tables = self.tables.lock().unwrap();
        tables
            .entry(table.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, table: &str, key: &str) -> Result<(), BackingError> {
        let mut tables = self.tables.lock().unwrap();
        if let Some(t) = tables.get_mut(table) {
            t.remove(key);
        }
        Ok(())
    }

    fn list(&self, table: &str) -> Result<Vec<String>, BackingError> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .get(table)
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default())
    }
}

/// In-memory document store.
#[derive(Default)]
pub struct MemoryDocs {
    docs: Mutex<BTreeMap<String, String>>,
}

impl MemoryDocs {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DocStore for MemoryDocs {
    fn read(&self, path: &str) -> Result<Option<String>, BackingError> {
        Ok(self.docs.lock().unwrap().get(path).cloned())
    }

    fn write(&self, path: &str, content: &str) -> Result<(), BackingError> {
        self.docs
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_string());
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>, BackingError> {
        Ok(self.docs.lock().unwrap().keys().cloned().collect())
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), BackingError> {
        let mut docs = self.docs.lock().unwrap();
        match docs.remove(from) {
            Some(content) => {
                docs.insert(to.to_string(), content);
                Ok(())
            }
            None => Err(BackingError::NotFound(from.to_string())),
        }
    }
}

/// Document store that fails the next `n` writes, for exercising retry
/// paths in tests.
pub struct FlakyDocs {
    inner: MemoryDocs,
    failures_left: AtomicU32,
}

impl FlakyDocs {
    pub fn failing(n: u32) -> Self {
        Self {
            inner: MemoryDocs::new(),
            failures_left: AtomicU32::new(n),
        }
    }
}

impl DocStore for FlakyDocs {
    fn read(&self, path: &str) -> Result<Option<String>, BackingError> {
        self.inner.read(path)
    }

    fn write(&self, path: &str, content: &str) -> Result<(), BackingError> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(BackingError::Unavailable("injected write failure".into()));
        }
        self.inner.write(path, content)
    }

    fn list(&self) -> Result<Vec<String>, BackingError> {
        self.inner.list()
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), BackingError> {
        self.inner.rename(from, to)
    }
}

/// Backing store errors.
#[derive(Debug, Clone)]
pub enum BackingError {
    NotFound(String),
    Unavailable(String),
}

impl std::fmt::Display for BackingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackingError::NotFound(what) => write!(f, "not found: {what}"),
            BackingError::Unavailable(why) => write!(f, "backing store unavailable: {why}"),
        }
    }
}

impl std::error::Error for BackingError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_roundtrip() {
        let records = MemoryRecords::new();
        records.put("workspaces", "w1", b"alpha".to_vec()).unwrap();
        records.put("workspaces", "w2", b"beta".to_vec()).unwrap();

        assert_eq!(
            records.get("workspaces", "w1").unwrap(),
            Some(b"alpha".to_vec())
        );
        assert_eq!(records.get("workspaces", "missing").unwrap(), None);
        assert_eq!(records.get("other", "w1").unwrap(), None);
        assert_eq!(records.list("workspaces").unwrap(), vec!["w1", "w2"]);

        records.delete("workspaces", "w1").unwrap();
        assert_eq!(records.get("workspaces", "w1").unwrap(), None);
    }

    #[test]
    fn test_docs_roundtrip() {
        let docs = MemoryDocs::new();
        docs.write("notes/a", "content a").unwrap();
        docs.write("notes/b", "content b").unwrap();

        assert_eq!(docs.read("notes/a").unwrap(), Some("content a".into()));
        assert_eq!(docs.read("notes/missing").unwrap(), None);
        assert_eq!(docs.list().unwrap(), vec!["notes/a", "notes/b"]);
    }

    #[test]
    fn test_docs_rename() {
        let docs = MemoryDocs::new();
        docs.write("old", "x").unwrap();
        docs.rename("old", "new").unwrap();

        assert_eq!(docs.read("old").unwrap(), None);
        assert_eq!(docs.read("new").unwrap(), Some("x".into()));
        assert!(matches!(
            docs.rename("gone", "anywhere"),
            Err(BackingError::NotFound(_))
        ));
    }

    #[test]
    fn test_flaky_docs_recovers() {
        let docs = FlakyDocs::failing(2);
        assert!(docs.write("p", "1").is_err());
        assert!(docs.write("p", "2").is_err());
        assert!(docs.write("p", "3").is_ok());
        assert_eq!(docs.read("p").unwrap(), Some("3".into()));
    }
}
