//! The tracker store contract shared by every backend.
//!
//! A backend implements [`TrackerStore::save`], [`TrackerStore::retrieve`]
//! and [`TrackerStore::keys`]; everything else has a default built on top
//! of those three. A backend that leaves one of them out reports
//! [`StoreError::NotImplemented`] when it is called.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use parley_types::{Domain, Event, Tracker};
use tracing::debug;

use crate::broker::{EventBroker, event_body};
use crate::codec;
use crate::error::StoreError;

/// State every backend carries: the conversation schema and the broker.
#[derive(Default)]
pub struct StoreContext {
    domain: RwLock<Option<Arc<Domain>>>,
    event_broker: Option<Arc<dyn EventBroker>>,
}

impl StoreContext {
    /// Create a context.
    pub fn new(domain: Option<Arc<Domain>>, event_broker: Option<Arc<dyn EventBroker>>) -> Self {
        Self {
            domain: RwLock::new(domain),
            event_broker,
        }
    }

    /// The current conversation schema.
    pub fn domain(&self) -> Option<Arc<Domain>> {
        self.domain.read().clone()
    }

    /// Replace the conversation schema.
    pub fn set_domain(&self, domain: Option<Arc<Domain>>) {
        *self.domain.write() = domain;
    }

    /// The broker newly persisted events are forwarded to.
    pub fn event_broker(&self) -> Option<Arc<dyn EventBroker>> {
        self.event_broker.clone()
    }
}

/// Durable record of conversation event logs.
#[async_trait]
pub trait TrackerStore: Send + Sync {
    /// Backend name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Shared store state.
    fn context(&self) -> &StoreContext;

    /// Persist the tracker's event log.
    ///
    /// Saving an unchanged tracker again must not duplicate events, and only
    /// events not yet persisted are forwarded to the broker.
    async fn save(&self, tracker: &Tracker) -> Result<(), StoreError> {
        let _ = tracker;
        Err(StoreError::NotImplemented {
            store: self.name(),
            operation: "save",
        })
    }

    /// Rebuild the tracker for the latest conversation session.
    ///
    /// Returns `Ok(None)` if no events exist for `sender_id`.
    async fn retrieve(&self, sender_id: &str) -> Result<Option<Tracker>, StoreError> {
        let _ = sender_id;
        Err(StoreError::NotImplemented {
            store: self.name(),
            operation: "retrieve",
        })
    }

    /// Rebuild the tracker from events across all conversation sessions.
    async fn retrieve_full(&self, sender_id: &str) -> Result<Option<Tracker>, StoreError> {
        self.retrieve(sender_id).await
    }

    /// All known conversation ids.
    async fn keys(&self) -> Result<BTreeSet<String>, StoreError> {
        Err(StoreError::NotImplemented {
            store: self.name(),
            operation: "keys",
        })
    }

    /// Whether a tracker exists for `sender_id`.
    async fn exists(&self, sender_id: &str) -> Result<bool, StoreError> {
        Ok(self.retrieve(sender_id).await?.is_some())
    }

    /// The current conversation schema.
    fn domain(&self) -> Option<Arc<Domain>> {
        self.context().domain()
    }

    /// Replace the conversation schema.
    fn set_domain(&self, domain: Option<Arc<Domain>>) {
        self.context().set_domain(domain);
    }

    /// The broker newly persisted events are forwarded to.
    fn event_broker(&self) -> Option<Arc<dyn EventBroker>> {
        self.context().event_broker()
    }

    /// An empty tracker seeded with the domain's initial slot values.
    fn init_tracker(&self, sender_id: &str, max_event_history: Option<usize>) -> Tracker {
        let slots = self
            .domain()
            .map(|domain| domain.initial_slots())
            .unwrap_or_default();
        Tracker::new(sender_id, slots, max_event_history)
    }

    /// Create and persist a new tracker for `sender_id`.
    ///
    /// The tracker starts listening unless `append_action_listen` is false.
    async fn create_tracker(
        &self,
        sender_id: &str,
        append_action_listen: bool,
        max_event_history: Option<usize>,
    ) -> Result<Tracker, StoreError> {
        let mut tracker = self.init_tracker(sender_id, max_event_history);
        if append_action_listen {
            tracker.update(Event::listening());
        }
        self.save(&tracker).await?;
        Ok(tracker)
    }

    /// Retrieve the tracker for `sender_id`, creating it if none exists.
    ///
    /// `max_event_history` applies to the returned tracker in both cases.
    async fn get_or_create_tracker(
        &self,
        sender_id: &str,
        max_event_history: Option<usize>,
        append_action_listen: bool,
    ) -> Result<Tracker, StoreError> {
        if let Some(mut tracker) = self.retrieve(sender_id).await? {
            tracker.set_max_event_history(max_event_history);
            return Ok(tracker);
        }
        self.create_tracker(sender_id, append_action_listen, max_event_history)
            .await
    }

    /// Number of events currently persisted for `sender_id`.
    async fn number_of_existing_events(&self, sender_id: &str) -> Result<usize, StoreError> {
        Ok(self
            .retrieve(sender_id)
            .await?
            .map_or(0, |tracker| tracker.len()))
    }

    /// Forward the events of `tracker` that are not yet persisted.
    async fn stream_events(&self, tracker: &Tracker) -> Result<(), StoreError> {
        let Some(broker) = self.event_broker() else {
            return Ok(());
        };
        let offset = self.number_of_existing_events(tracker.sender_id()).await?;
        publish_events(broker.as_ref(), tracker.sender_id(), tracker.events().iter().skip(offset))
            .await
    }

    /// Decode a stored tracker for `sender_id`.
    fn deserialise_tracker(&self, sender_id: &str, raw: &[u8]) -> Result<Tracker, StoreError> {
        let (dialogue, _format) = codec::decode_dialogue(sender_id, raw)?;
        let mut tracker = self.init_tracker(sender_id, None);
        tracker.recreate_from_dialogue(dialogue);
        Ok(tracker)
    }
}

/// Publish events for one conversation, in order.
pub async fn publish_events<'a>(
    broker: &dyn EventBroker,
    sender_id: &str,
    events: impl Iterator<Item = &'a Event> + Send,
) -> Result<(), StoreError> {
    let mut published = 0_usize;
    for event in events {
        broker.publish(event_body(sender_id, event)?).await?;
        published = published.saturating_add(1);
    }
    if published > 0 {
        debug!(sender_id = sender_id, count = published, "streamed events to broker");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    /// A backend that only implements the mandatory accessors.
    #[derive(Default)]
    struct BareStore {
        context: StoreContext,
    }

    #[async_trait]
    impl TrackerStore for BareStore {
        fn name(&self) -> &'static str {
            "BareStore"
        }

        fn context(&self) -> &StoreContext {
            &self.context
        }
    }

    #[tokio::test]
    async fn missing_operations_report_not_implemented() {
        let store = BareStore::default();
        let tracker = store.init_tracker("u1", None);

        assert!(matches!(
            store.save(&tracker).await,
            Err(StoreError::NotImplemented { operation: "save", .. })
        ));
        assert!(matches!(
            store.retrieve("u1").await,
            Err(StoreError::NotImplemented { operation: "retrieve", .. })
        ));
        assert!(matches!(
            store.keys().await,
            Err(StoreError::NotImplemented { operation: "keys", .. })
        ));
    }

    #[test]
    fn init_tracker_uses_domain_slots() {
        let store = BareStore::default();
        store.set_domain(Some(Arc::new(
            Domain::empty().with_slot("city", serde_json::json!("Oslo")),
        )));
        let tracker = store.init_tracker("u1", Some(10));
        assert_eq!(tracker.slot("city"), Some(&serde_json::json!("Oslo")));
        assert_eq!(tracker.max_event_history(), Some(10));
        assert!(tracker.is_empty());
    }
}
