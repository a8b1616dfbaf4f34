use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection};

use super::Store;
use crate::conversation::Conversation;
use crate::key::ThreadKey;

/// SQLite-backed conversation store.
///
/// Uses a `Mutex<Connection>` for thread-safe interior mutability.
/// The database is created/migrated on `open()`.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a sqlite database at the given path.
    pub fn open(path: &Path) -> Result<Self, String> {
        let conn = Connection::open(path).map_err(|e| format!("sqlite open: {e}"))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Open an in-memory database (useful for tests).
    pub fn open_memory() -> Result<Self, String> {
        let conn = Connection::open_in_memory().map_err(|e| format!("sqlite open: {e}"))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), String> {
        let conn = self.conn.lock().map_err(|e| format!("lock: {e}"))?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS conversations (
                room_id     TEXT NOT NULL,
                thread_id   TEXT NOT NULL,
                body        TEXT NOT NULL,
                updated_at  TEXT NOT NULL,
                PRIMARY KEY (room_id, thread_id)
            );
            ",
        )
        .map_err(|e| format!("migrate: {e}"))?;
        Ok(())
    }
}

impl Store for SqliteStore {
    fn upsert_conversation(
        &self,
        key: &ThreadKey,
        conversation: &Conversation,
    ) -> Result<(), String> {
        let body = serde_json::to_string(conversation)
            .map_err(|e| format!("encode conversation: {e}"))?;
        let conn = self.conn.lock().map_err(|e| format!("lock: {e}"))?;
        conn.execute(
            "INSERT INTO conversations (room_id, thread_id, body, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(room_id, thread_id) DO UPDATE SET
                body = excluded.body,
                updated_at = excluded.updated_at",
            params![key.room_id, key.thread_id, body, Utc::now().to_rfc3339()],
        )
        .map_err(|e| format!("upsert_conversation: {e}"))?;
        Ok(())
    }

    fn get_conversation(&self, key: &ThreadKey) -> Result<Option<Conversation>, String> {
        let conn = self.conn.lock().map_err(|e| format!("lock: {e}"))?;
        let mut stmt = conn
            .prepare("SELECT body FROM conversations WHERE room_id = ?1 AND thread_id = ?2")
            .map_err(|e| format!("get_conversation prepare: {e}"))?;
        let mut rows = stmt
            .query_map(params![key.room_id, key.thread_id], |row| {
                row.get::<_, String>(0)
            })
            .map_err(|e| format!("get_conversation query: {e}"))?;

        match rows.next() {
            Some(Ok(body)) => serde_json::from_str(&body)
                .map(Some)
                .map_err(|e| format!("decode conversation: {e}")),
            Some(Err(e)) => Err(format!("get_conversation row: {e}")),
            None => Ok(None),
        }
    }

    fn delete_conversation(&self, key: &ThreadKey) -> Result<(), String> {
        let conn = self.conn.lock().map_err(|e| format!("lock: {e}"))?;
        conn.execute(
            "DELETE FROM conversations WHERE room_id = ?1 AND thread_id = ?2",
            params![key.room_id, key.thread_id],
        )
        .map_err(|e| format!("delete_conversation: {e}"))?;
        Ok(())
    }

    fn list_keys(&self) -> Result<Vec<ThreadKey>, String> {
        let conn = self.conn.lock().map_err(|e| format!("lock: {e}"))?;
        let mut stmt = conn
            .prepare(
                "SELECT room_id, thread_id FROM conversations
                 ORDER BY updated_at DESC, room_id, thread_id",
            )
            .map_err(|e| format!("list_keys prepare: {e}"))?;
        let rows = stmt
            .query_map([], |row| Ok(ThreadKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(|e| format!("list_keys query: {e}"))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("list_keys row: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ChatMessage;

    fn make_store() -> SqliteStore {
        SqliteStore::open_memory().unwrap()
    }

    fn conversation(text: &str) -> Conversation {
        let mut conv = Conversation::default();
        conv.push(ChatMessage::user("u1", text));
        conv
    }

    #[test]
    fn upsert_then_get_returns_latest_body() {
        let store = make_store();
        let key = ThreadKey::new("r1", "t1");
        store.upsert_conversation(&key, &conversation("first")).unwrap();
        store.upsert_conversation(&key, &conversation("second")).unwrap();

        let stored = store.get_conversation(&key).unwrap().unwrap();
        assert_eq!(stored, conversation("second"));
        assert_eq!(store.list_keys().unwrap(), vec![key]);
    }

    #[test]
    fn keys_are_scoped_by_room() {
        let store = make_store();
        store
            .upsert_conversation(&ThreadKey::new("r1", "t1"), &conversation("a"))
            .unwrap();
        assert!(store
            .get_conversation(&ThreadKey::new("r2", "t1"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn delete_removes_row() {
        let store = make_store();
        let key = ThreadKey::new("r1", "t1");
        store.upsert_conversation(&key, &conversation("a")).unwrap();
        store.delete_conversation(&key).unwrap();
        assert!(store.get_conversation(&key).unwrap().is_none());
        assert!(store.list_keys().unwrap().is_empty());
    }
}
