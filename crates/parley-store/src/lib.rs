//! Persistence layer for Parley conversation trackers.
//!
//! A tracker store records the event log of every conversation and rebuilds
//! a [`parley_types::Tracker`] from it on demand. Newly persisted events are
//! forwarded to an optional [`EventBroker`].
//!
//! # Architecture
//!
//! ```text
//! TrackerStoreRegistry --(endpoints.yml)--> Arc<dyn TrackerStore>
//!     |
//!     +-- InMemoryTrackerStore   (whole tracker per conversation, process-local)
//!     +-- SqlTrackerStore        (one row per event, PostgreSQL or SQLite)
//!     +-- RedisTrackerStore      (whole tracker per key)
//!     +-- FailSafeTrackerStore   (decorator: degrade reads, fall back on save)
//! ```
//!
//! # Modules
//!
//! - [`store`] -- The [`TrackerStore`] contract and its default operations
//! - [`memory`] -- Process-local backend
//! - [`sql`] -- Relational backend with per-session reads
//! - [`redis`] -- Key-value backend
//! - [`resilient`] -- Fail-safe decorator
//! - [`factory`] -- Backend selection by kind tag
//! - [`broker`] -- Event brokers
//! - [`codec`] -- Whole-tracker serialization, including the legacy format
//! - [`config`] -- Endpoint configuration
//! - [`retry`] -- Startup retry policy
//! - [`error`] -- Shared error types

pub mod broker;
pub mod codec;
pub mod config;
pub mod error;
pub mod factory;
pub mod memory;
pub mod redis;
pub mod resilient;
pub mod retry;
pub mod sql;
pub mod store;

// Re-export primary types for convenience.
pub use broker::{EventBroker, InMemoryEventBroker, NatsEventBroker, create_event_broker};
pub use config::{ConfigError, EndpointConfig, EndpointsConfig};
pub use error::StoreError;
pub use factory::{StoreArgs, StoreConstructor, TrackerStoreRegistry, constructor};
pub use memory::InMemoryTrackerStore;
pub use redis::{RedisTrackerStore, RedisTrackerStoreOptions};
pub use resilient::{ErrorCallback, FailSafeTrackerStore};
pub use retry::{RetryPolicy, Sleeper, TokioSleeper};
pub use sql::{SqlConfig, SqlEnvironment, SqlTrackerStore, SqlTrackerStoreOptions};
pub use store::{StoreContext, TrackerStore};
