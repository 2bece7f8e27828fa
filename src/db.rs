//! SQLite-backed durable key-value storage.
//!
//! The database lives at `~/.home-presence/presence.db` and holds the small
//! JSON documents the service must survive a restart with (sensor ownership and
//! beacon names). Values are stored as JSON text, one row per key.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::error::PresenceError;

/// Durable key-value storage used by the persistence gateway.
pub trait KeyValueStore: Send {
    fn get(&self, key: &str) -> Result<Option<Value>, PresenceError>;
    fn put(&mut self, key: &str, value: &Value) -> Result<(), PresenceError>;
}

/// SQLite connection wrapper for the key-value table.
pub struct PresenceDb {
    conn: Connection,
}

impl PresenceDb {
    /// Open (or create) the database at `~/.home-presence/presence.db`.
    pub fn open() -> Result<Self, PresenceError> {
        let path = crate::state::db_path()?;
        Self::open_at(path)
    }

    /// Open a database at an explicit path. Useful for testing.
    pub fn open_at(path: PathBuf) -> Result<Self, PresenceError> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::apply_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, PresenceError> {
        let conn = Connection::open_in_memory()?;
        Self::apply_schema(&conn)?;
        Ok(Self { conn })
    }

    fn apply_schema(conn: &Connection) -> Result<(), PresenceError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv_store (
                key        TEXT PRIMARY KEY,
                value      TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )?;
        Ok(())
    }
}

impl KeyValueStore for PresenceDb {
    fn get(&self, key: &str) -> Result<Option<Value>, PresenceError> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    fn put(&mut self, key: &str, value: &Value) -> Result<(), PresenceError> {
        let text = serde_json::to_string(value)?;
        let now = chrono::Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO kv_store (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE
             SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, text, now],
        )?;
        Ok(())
    }
}

/// Volatile store for tests and for running without durable state.
///
/// Clones share the same contents.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    values: Arc<Mutex<HashMap<String, Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>, PresenceError> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn put(&mut self, key: &str, value: &Value) -> Result<(), PresenceError> {
        self.values.lock().insert(key.to_string(), value.clone());
        Ok(())
    }
}
