use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::completion::CompletionSink;
use crate::conversation::Conversation;
use crate::error::BackendError;
use crate::key::ThreadKey;
use crate::remote::BackendApi;
use crate::run::RunCompletion;
use crate::storage::Store;

/// Last known conversation per thread.
///
/// Reads fall back to the store, then to the backend. Writes only happen
/// through [`CompletionSink`] or an explicit [`HistoryCache::merge`].
pub struct HistoryCache {
    entries: RwLock<HashMap<ThreadKey, Conversation>>,
    store: Option<Arc<dyn Store>>,
    backend: Arc<dyn BackendApi>,
}

impl HistoryCache {
    pub fn new(backend: Arc<dyn BackendApi>, store: Option<Arc<dyn Store>>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            store,
            backend,
        }
    }

    /// Cached conversation without any I/O.
    pub fn cached(&self, key: &ThreadKey) -> Option<Conversation> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub async fn get(&self, key: &ThreadKey) -> Result<Conversation, BackendError> {
        if let Some(conversation) = self.cached(key) {
            return Ok(conversation);
        }
        if let Some(conversation) = self.load_stored(key) {
            self.insert(key, conversation.clone());
            return Ok(conversation);
        }
        let conversation = self.backend.get_history(key).await?;
        tracing::debug!(
            room_id = %key.room_id,
            thread_id = %key.thread_id,
            messages = conversation.messages.len(),
            "history loaded from backend"
        );
        // A completion may have landed while the request was in flight.
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        Ok(entries
            .entry(key.clone())
            .or_insert(conversation)
            .clone())
    }

    /// Replace the entry for `key` and write it through to the store.
    pub fn merge(&self, key: &ThreadKey, conversation: Conversation) {
        if let Some(store) = self.store.as_ref() {
            if let Err(e) = store.upsert_conversation(key, &conversation) {
                tracing::warn!(%key, error = %e, "persist conversation failed");
            }
        }
        self.insert(key, conversation);
    }

    pub fn invalidate(&self, key: &ThreadKey) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    fn insert(&self, key: &ThreadKey, conversation: Conversation) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), conversation);
    }

    fn load_stored(&self, key: &ThreadKey) -> Option<Conversation> {
        let store = self.store.as_ref()?;
        match store.get_conversation(key) {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(%key, error = %e, "load stored conversation failed");
                None
            }
        }
    }
}

impl CompletionSink for HistoryCache {
    fn on_run_completed(&self, completion: &RunCompletion) {
        if let Some(conversation) = completion.conversation.as_ref() {
            self.merge(&completion.key, conversation.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ChatMessage;
    use crate::run::RunOutcome;
    use crate::storage::SqliteStore;
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingBackend {
        history_calls: AtomicUsize,
    }

    impl BackendApi for CountingBackend {
        fn create_run<'a>(
            &'a self,
            _key: &'a ThreadKey,
        ) -> BoxFuture<'a, Result<String, BackendError>> {
            Box::pin(async { Ok("run-1".to_string()) })
        }

        fn get_history<'a>(
            &'a self,
            _key: &'a ThreadKey,
        ) -> BoxFuture<'a, Result<Conversation, BackendError>> {
            self.history_calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {
                let mut conv = Conversation::default();
                conv.push(ChatMessage::user("remote", "from backend"));
                Ok(conv)
            })
        }
    }

    fn completion(key: &ThreadKey, conversation: Option<Conversation>) -> RunCompletion {
        RunCompletion {
            key: key.clone(),
            run_id: Some("run-1".into()),
            outcome: RunOutcome::Success,
            conversation,
        }
    }

    #[tokio::test]
    async fn miss_loads_once_from_backend() {
        let backend = Arc::new(CountingBackend::default());
        let cache = HistoryCache::new(backend.clone(), None);
        let key = ThreadKey::new("r1", "t1");

        assert!(cache.cached(&key).is_none());
        let first = cache.get(&key).await.unwrap();
        let second = cache.get(&key).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(backend.history_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn store_is_consulted_before_backend() {
        let backend = Arc::new(CountingBackend::default());
        let store = Arc::new(SqliteStore::open_memory().unwrap());
        let key = ThreadKey::new("r1", "t1");
        let mut stored = Conversation::default();
        stored.push(ChatMessage::user("local", "from store"));
        store.upsert_conversation(&key, &stored).unwrap();

        let cache = HistoryCache::new(backend.clone(), Some(store));
        assert_eq!(cache.get(&key).await.unwrap(), stored);
        assert_eq!(backend.history_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn completion_with_conversation_replaces_entry_and_persists() {
        let backend = Arc::new(CountingBackend::default());
        let store = Arc::new(SqliteStore::open_memory().unwrap());
        let cache = HistoryCache::new(backend, Some(store.clone()));
        let key = ThreadKey::new("r1", "t1");
        let mut conv = Conversation::default();
        conv.push(ChatMessage::user("u1", "hi"));

        cache.on_run_completed(&completion(&key, Some(conv.clone())));
        assert_eq!(cache.cached(&key), Some(conv.clone()));
        assert_eq!(store.get_conversation(&key).unwrap(), Some(conv));

        cache.on_run_completed(&completion(&key, None));
        assert!(cache.cached(&key).is_some());

        cache.invalidate(&key);
        assert!(cache.cached(&key).is_none());
    }
}
