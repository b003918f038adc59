//! Tracker store selection from endpoint configuration.
//!
//! A [`TrackerStoreRegistry`] maps kind tags to async constructors. The
//! built-in kinds are `memory`, `sql` and `redis`; further kinds are added
//! with [`TrackerStoreRegistry::register`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use parley_types::Domain;
use tracing::{debug, warn};

use crate::broker::EventBroker;
use crate::config::EndpointConfig;
use crate::error::StoreError;
use crate::memory::InMemoryTrackerStore;
use crate::redis::{RedisTrackerStore, RedisTrackerStoreOptions};
use crate::sql::{SqlConfig, SqlEnvironment, SqlTrackerStore, SqlTrackerStoreOptions};
use crate::store::TrackerStore;

/// Kind tag of [`InMemoryTrackerStore`].
pub const MEMORY_KIND: &str = "memory";
/// Kind tag of [`SqlTrackerStore`].
pub const SQL_KIND: &str = "sql";
/// Kind tag of [`RedisTrackerStore`].
pub const REDIS_KIND: &str = "redis";

/// Inputs handed to a store constructor.
#[derive(Clone)]
pub struct StoreArgs {
    /// The endpoint being constructed.
    pub endpoint: EndpointConfig,
    /// Conversation schema.
    pub domain: Option<Arc<Domain>>,
    /// Broker for newly persisted events.
    pub event_broker: Option<Arc<dyn EventBroker>>,
}

/// Builds a store from its endpoint.
pub type StoreConstructor = Arc<
    dyn Fn(StoreArgs) -> BoxFuture<'static, Result<Arc<dyn TrackerStore>, StoreError>>
        + Send
        + Sync,
>;

/// Wrap an async function as a [`StoreConstructor`].
pub fn constructor<F, Fut>(build: F) -> StoreConstructor
where
    F: Fn(StoreArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Arc<dyn TrackerStore>, StoreError>> + Send + 'static,
{
    Arc::new(move |args| build(args).boxed())
}

/// Maps kind tags to store constructors.
#[derive(Clone)]
pub struct TrackerStoreRegistry {
    constructors: HashMap<String, StoreConstructor>,
}

impl Default for TrackerStoreRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(
            MEMORY_KIND,
            constructor(|args: StoreArgs| async move {
                Ok(Arc::new(InMemoryTrackerStore::new(args.domain, args.event_broker))
                    as Arc<dyn TrackerStore>)
            }),
        );
        registry.register(SQL_KIND, constructor(sql_store));
        registry.register(REDIS_KIND, constructor(redis_store));
        registry
    }
}

impl TrackerStoreRegistry {
    /// Registry with the built-in kinds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry without any kind.
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Register `constructor` for `kind`, replacing any previous one.
    pub fn register(&mut self, kind: &str, constructor: StoreConstructor) {
        self.constructors.insert(kind.to_lowercase(), constructor);
    }

    /// Whether `kind` has a constructor.
    pub fn contains(&self, kind: &str) -> bool {
        self.constructors.contains_key(&kind.to_lowercase())
    }

    /// Create the store described by `endpoint`.
    ///
    /// Without an endpoint or kind tag the in-memory store is used. An
    /// unknown kind falls back to the in-memory store without a broker.
    ///
    /// # Errors
    ///
    /// Returns the constructor's error. Connectivity failures are reported
    /// as [`StoreError::Connection`] naming the tracker store.
    pub async fn create(
        &self,
        endpoint: Option<&EndpointConfig>,
        domain: Option<Arc<Domain>>,
        event_broker: Option<Arc<dyn EventBroker>>,
    ) -> Result<Arc<dyn TrackerStore>, StoreError> {
        let Some((endpoint, kind)) =
            endpoint.and_then(|endpoint| endpoint.kind().map(|kind| (endpoint, kind)))
        else {
            debug!("no tracker store configured, using in-memory store");
            return Ok(Arc::new(InMemoryTrackerStore::new(domain, event_broker)));
        };

        let Some(constructor) = self.constructors.get(&kind) else {
            warn!(
                kind = %kind,
                "Tracker store type is not registered. Falling back to the in-memory tracker store."
            );
            return Ok(Arc::new(InMemoryTrackerStore::new(domain, None)));
        };

        let args = StoreArgs {
            endpoint: endpoint.clone(),
            domain,
            event_broker,
        };
        match constructor(args).await {
            Ok(store) => {
                debug!(kind = %kind, store = store.name(), "connected to tracker store");
                Ok(store)
            }
            Err(StoreError::Connection { message }) => Err(StoreError::connection(format!(
                "Cannot connect to tracker store: {message}"
            ))),
            Err(e) => Err(e),
        }
    }
}

async fn sql_store(args: StoreArgs) -> Result<Arc<dyn TrackerStore>, StoreError> {
    let mut options: SqlTrackerStoreOptions = args.endpoint.options()?;
    if options.host.is_none() {
        options.host.clone_from(&args.endpoint.url);
    }
    let config = SqlConfig::new(options).with_environment(SqlEnvironment::from_env()?);
    let store = SqlTrackerStore::connect(&config, args.domain, args.event_broker).await?;
    Ok(Arc::new(store))
}

async fn redis_store(args: StoreArgs) -> Result<Arc<dyn TrackerStore>, StoreError> {
    let mut options: RedisTrackerStoreOptions = args.endpoint.options()?;
    if options.url.is_none() {
        options.url.clone_from(&args.endpoint.url);
    }
    let store = RedisTrackerStore::connect(&options, args.domain, args.event_broker).await?;
    Ok(Arc::new(store))
}
