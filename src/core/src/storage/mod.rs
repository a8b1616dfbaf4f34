mod sqlite;

pub use sqlite::SqliteStore;

use crate::conversation::Conversation;
use crate::key::ThreadKey;

/// Persistence for merged conversations.
///
/// All methods use `&self`; implementations handle interior mutability
/// (e.g. `Mutex<Connection>` for sqlite).
pub trait Store: Send + Sync + 'static {
    /// Persist or replace the conversation of a thread.
    fn upsert_conversation(&self, key: &ThreadKey, conversation: &Conversation)
        -> Result<(), String>;

    /// Get the stored conversation of a thread.
    fn get_conversation(&self, key: &ThreadKey) -> Result<Option<Conversation>, String>;

    fn delete_conversation(&self, key: &ThreadKey) -> Result<(), String>;

    /// All stored keys, most recently updated first.
    fn list_keys(&self) -> Result<Vec<ThreadKey>, String>;
}
