//! Fail-safe decorator around a primary tracker store.
//!
//! Read failures of the primary degrade to "nothing found". A failed save
//! is retried once on a fallback store, which defaults to an
//! [`InMemoryTrackerStore`] created on first use. The default fallback
//! forwards its saves to the primary's broker. Fatal errors (see
//! [`StoreError::is_fatal`]) are never swallowed.

use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use parley_types::{Domain, Tracker};
use tracing::error;

use crate::broker::EventBroker;
use crate::error::StoreError;
use crate::memory::InMemoryTrackerStore;
use crate::store::{StoreContext, TrackerStore};

/// Called with every error the decorator recovers from.
pub type ErrorCallback = Box<dyn Fn(&StoreError) + Send + Sync>;

/// Wraps a primary store and recovers from its failures.
pub struct FailSafeTrackerStore {
    context: StoreContext,
    primary: Arc<dyn TrackerStore>,
    fallback: OnceLock<Arc<dyn TrackerStore>>,
    on_error: Option<ErrorCallback>,
}

impl FailSafeTrackerStore {
    /// Wrap `primary`.
    pub fn new(primary: Arc<dyn TrackerStore>) -> Self {
        Self {
            context: StoreContext::new(primary.domain(), primary.event_broker()),
            primary,
            fallback: OnceLock::new(),
            on_error: None,
        }
    }

    /// Use `fallback` for saves the primary cannot take.
    #[must_use]
    pub fn with_fallback(mut self, fallback: Arc<dyn TrackerStore>) -> Self {
        self.fallback = OnceLock::from(fallback);
        self
    }

    /// Report recovered errors to `callback` instead of the log.
    #[must_use]
    pub fn with_error_callback(mut self, callback: ErrorCallback) -> Self {
        self.on_error = Some(callback);
        self
    }

    /// The wrapped store.
    pub fn primary(&self) -> &Arc<dyn TrackerStore> {
        &self.primary
    }

    /// The fallback store, created on first use with the primary's domain
    /// and broker.
    pub fn fallback(&self) -> &Arc<dyn TrackerStore> {
        self.fallback.get_or_init(|| {
            Arc::new(InMemoryTrackerStore::new(
                self.primary.domain(),
                self.primary.event_broker(),
            )) as Arc<dyn TrackerStore>
        })
    }

    /// Report a recovered error, or hand back one that must propagate.
    fn recover(&self, error: StoreError) -> Result<(), StoreError> {
        if error.is_fatal() {
            return Err(error);
        }
        match &self.on_error {
            Some(callback) => callback(&error),
            None => error!(
                store = self.primary.name(),
                error = %error,
                "An exception occurred while trying to access the tracker store"
            ),
        }
        Ok(())
    }
}

#[async_trait]
impl TrackerStore for FailSafeTrackerStore {
    fn name(&self) -> &'static str {
        "FailSafeTrackerStore"
    }

    fn context(&self) -> &StoreContext {
        &self.context
    }

    fn domain(&self) -> Option<Arc<Domain>> {
        self.primary.domain()
    }

    fn set_domain(&self, domain: Option<Arc<Domain>>) {
        self.context.set_domain(domain.clone());
        if let Some(fallback) = self.fallback.get() {
            fallback.set_domain(domain.clone());
        }
        self.primary.set_domain(domain);
    }

    fn event_broker(&self) -> Option<Arc<dyn EventBroker>> {
        self.primary.event_broker()
    }

    async fn save(&self, tracker: &Tracker) -> Result<(), StoreError> {
        match self.primary.save(tracker).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.recover(e)?;
                self.fallback().save(tracker).await
            }
        }
    }

    async fn retrieve(&self, sender_id: &str) -> Result<Option<Tracker>, StoreError> {
        match self.primary.retrieve(sender_id).await {
            Ok(tracker) => Ok(tracker),
            Err(e) => self.recover(e).map(|()| None),
        }
    }

    async fn retrieve_full(&self, sender_id: &str) -> Result<Option<Tracker>, StoreError> {
        match self.primary.retrieve_full(sender_id).await {
            Ok(tracker) => Ok(tracker),
            Err(e) => self.recover(e).map(|()| None),
        }
    }

    async fn keys(&self) -> Result<BTreeSet<String>, StoreError> {
        match self.primary.keys().await {
            Ok(keys) => Ok(keys),
            Err(e) => self.recover(e).map(|()| BTreeSet::new()),
        }
    }

    async fn exists(&self, sender_id: &str) -> Result<bool, StoreError> {
        match self.primary.exists(sender_id).await {
            Ok(exists) => Ok(exists),
            Err(e) => self.recover(e).map(|()| false),
        }
    }
}
