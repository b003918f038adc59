//! Process-local tracker store.
//!
//! Holds the serialized dialogue of every conversation in a map. Nothing
//! survives a restart; the store is the default backend and the fallback
//! target of [`crate::resilient::FailSafeTrackerStore`].

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use parley_types::{Domain, Tracker};
use tracing::debug;

use crate::broker::EventBroker;
use crate::codec;
use crate::error::StoreError;
use crate::store::{StoreContext, TrackerStore};

/// Stores conversation history in memory.
///
/// A save replaces the whole serialized log of the conversation.
/// Concurrent saves for the same conversation are not coordinated.
#[derive(Default)]
pub struct InMemoryTrackerStore {
    context: StoreContext,
    store: RwLock<HashMap<String, String>>,
}

impl InMemoryTrackerStore {
    /// Create an empty store.
    pub fn new(domain: Option<Arc<Domain>>, event_broker: Option<Arc<dyn EventBroker>>) -> Self {
        Self {
            context: StoreContext::new(domain, event_broker),
            store: RwLock::new(HashMap::new()),
        }
    }

    /// Number of conversations held.
    pub fn len(&self) -> usize {
        self.store.read().len()
    }

    /// Whether no conversation is held.
    pub fn is_empty(&self) -> bool {
        self.store.read().is_empty()
    }
}

#[async_trait]
impl TrackerStore for InMemoryTrackerStore {
    fn name(&self) -> &'static str {
        "InMemoryTrackerStore"
    }

    fn context(&self) -> &StoreContext {
        &self.context
    }

    async fn save(&self, tracker: &Tracker) -> Result<(), StoreError> {
        self.stream_events(tracker).await?;
        let serialised = codec::serialise_tracker(tracker)?;
        self.store
            .write()
            .insert(tracker.sender_id().to_owned(), serialised);
        Ok(())
    }

    async fn retrieve(&self, sender_id: &str) -> Result<Option<Tracker>, StoreError> {
        let serialised = self.store.read().get(sender_id).cloned();
        match serialised {
            Some(serialised) => {
                debug!(sender_id = sender_id, "recreating tracker");
                Ok(Some(self.deserialise_tracker(sender_id, serialised.as_bytes())?))
            }
            None => {
                debug!(sender_id = sender_id, "could not find tracker for conversation ID");
                Ok(None)
            }
        }
    }

    async fn keys(&self) -> Result<BTreeSet<String>, StoreError> {
        Ok(self.store.read().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::indexing_slicing)]

    use parley_types::{ACTION_LISTEN_NAME, Event};
    use serde_json::json;

    use super::*;
    use crate::broker::InMemoryEventBroker;

    #[tokio::test]
    async fn unknown_conversation_is_absent() {
        let store = InMemoryTrackerStore::new(Some(Arc::new(Domain::empty())), None);
        assert!(store.retrieve("nobody").await.unwrap().is_none());
        assert!(!store.exists("nobody").await.unwrap());
    }

    #[tokio::test]
    async fn get_or_create_persists_listening_event() {
        let store = InMemoryTrackerStore::new(Some(Arc::new(Domain::empty())), None);
        let tracker = store.get_or_create_tracker("u1", None, true).await.unwrap();
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.latest_action_name(), Some(ACTION_LISTEN_NAME));

        let stored = store.retrieve("u1").await.unwrap().unwrap();
        assert_eq!(stored, tracker);
        assert_eq!(store.keys().await.unwrap(), BTreeSet::from(["u1".to_owned()]));
    }

    #[tokio::test]
    async fn get_or_create_limits_history_of_existing_tracker() {
        let store = InMemoryTrackerStore::new(Some(Arc::new(Domain::empty())), None);
        let mut tracker = store.init_tracker("u1", None);
        for index in 0..5 {
            tracker.update(Event::action(&format!("step_{index}")));
        }
        store.save(&tracker).await.unwrap();

        let limited = store.get_or_create_tracker("u1", Some(2), true).await.unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited.max_event_history(), Some(2));
        assert_eq!(limited.latest_action_name(), Some("step_4"));
    }

    #[tokio::test]
    async fn get_or_create_can_skip_listening_event() {
        let store = InMemoryTrackerStore::new(None, None);
        let tracker = store.get_or_create_tracker("u1", None, false).await.unwrap();
        assert!(tracker.is_empty());
        assert!(store.exists("u1").await.unwrap());
    }

    #[tokio::test]
    async fn save_replaces_log_and_streams_only_new_events() {
        let broker = Arc::new(InMemoryEventBroker::new());
        let store = InMemoryTrackerStore::new(
            Some(Arc::new(Domain::empty())),
            Some(Arc::clone(&broker) as Arc<dyn EventBroker>),
        );

        let mut tracker = store.get_or_create_tracker("u1", None, true).await.unwrap();
        tracker.update(Event::action("greet"));
        store.save(&tracker).await.unwrap();
        store.save(&tracker).await.unwrap();

        let published = broker.published();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0]["name"], json!(ACTION_LISTEN_NAME));
        assert_eq!(published[1]["name"], json!("greet"));
        assert_eq!(published[1]["sender_id"], json!("u1"));

        assert_eq!(store.len(), 1);
        let stored = store.retrieve("u1").await.unwrap().unwrap();
        assert_eq!(stored.len(), 2);
    }

    #[tokio::test]
    async fn retrieve_seeds_slots_from_current_domain() {
        let store = InMemoryTrackerStore::new(None, None);
        let mut tracker = store.init_tracker("u1", None);
        tracker.update(Event::listening());
        store.save(&tracker).await.unwrap();

        store.set_domain(Some(Arc::new(Domain::empty().with_slot("city", json!("Lima")))));
        let stored = store.retrieve("u1").await.unwrap().unwrap();
        assert_eq!(stored.slot("city"), Some(&json!("Lima")));
    }
}
