//! Key-value tracker store on Redis.
//!
//! # Key Patterns
//!
//! | Pattern | Type | Description |
//! |---------|------|-------------|
//! | `{ns}tracker:{sender_id}` | String | Serialized dialogue of one conversation |
//! | `{ns}index:trackers` | Set | Conversation ids with a tracker key |
//!
//! The namespace `{ns}` is empty by default; a custom key prefix `p` makes
//! it `p:`. Index entries whose tracker key has expired are pruned when
//! the keys are listed.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use fred::prelude::*;
use fred::types::Expiration;
use parley_types::{Domain, Tracker};
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::broker::EventBroker;
use crate::codec;
use crate::error::StoreError;
use crate::store::{StoreContext, TrackerStore};

/// Key prefix used when none is configured.
pub const DEFAULT_KEY_PREFIX: &str = "tracker:";

/// Key of the conversation index set, below the namespace.
pub const INDEX_KEY: &str = "index:trackers";

/// Connection options of a Redis endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RedisTrackerStoreOptions {
    /// Complete `redis://` URL, or a host name.
    pub url: Option<String>,
    /// Port; 6379 when unset.
    pub port: Option<u16>,
    /// Database index.
    pub db: Option<u32>,
    /// Password.
    pub password: Option<String>,
    /// Alphanumeric prefix namespacing the tracker keys.
    pub key_prefix: Option<String>,
    /// Seconds after which a saved tracker expires.
    pub record_exp: Option<i64>,
}

impl RedisTrackerStoreOptions {
    /// The connection URL.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`] if the parts do not form a URL.
    pub fn connection_url(&self) -> Result<String, StoreError> {
        let host = self.url.as_deref().unwrap_or("localhost");
        if host.contains("://") {
            return Ok(host.to_owned());
        }
        let invalid = |e: String| StoreError::config(format!("invalid Redis URL: {e}"));
        let mut url = Url::parse(&format!("redis://{host}")).map_err(|e| invalid(e.to_string()))?;
        if url.port().is_none() {
            url.set_port(Some(self.port.unwrap_or(6379)))
                .map_err(|()| invalid("port cannot be set".to_owned()))?;
        }
        if let Some(password) = &self.password {
            url.set_password(Some(password))
                .map_err(|()| invalid("password cannot be set".to_owned()))?;
        }
        url.set_path(&self.db.unwrap_or(0).to_string());
        Ok(url.into())
    }

    /// The key layout selected by `key_prefix`.
    pub fn key_layout(&self) -> KeyLayout {
        match self.key_prefix.as_deref().filter(|prefix| !prefix.is_empty()) {
            None => KeyLayout::default(),
            Some(prefix) if prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') => {
                KeyLayout {
                    namespace: format!("{prefix}:"),
                }
            }
            Some(prefix) => {
                warn!(
                    key_prefix = prefix,
                    "Omitting provided non-alphanumeric Redis key prefix. Using default \
                     'tracker:' instead."
                );
                KeyLayout::default()
            }
        }
    }

    /// The effective prefix of tracker keys.
    pub fn resolved_key_prefix(&self) -> String {
        self.key_layout().tracker_prefix()
    }
}

/// Where trackers and the conversation index live.
///
/// Tracker keys and the index key never share a prefix, so no
/// conversation id can overwrite the index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyLayout {
    namespace: String,
}

impl KeyLayout {
    /// Prefix of every tracker key.
    pub fn tracker_prefix(&self) -> String {
        format!("{}{DEFAULT_KEY_PREFIX}", self.namespace)
    }

    /// Key holding the tracker of `sender_id`.
    pub fn tracker(&self, sender_id: &str) -> String {
        format!("{}{sender_id}", self.tracker_prefix())
    }

    /// Key of the conversation index set.
    pub fn index(&self) -> String {
        format!("{}{INDEX_KEY}", self.namespace)
    }
}

/// Stores each conversation's serialized dialogue under one key.
pub struct RedisTrackerStore {
    context: StoreContext,
    client: Client,
    keys: KeyLayout,
    record_exp: Option<i64>,
}

impl RedisTrackerStore {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`] if the URL cannot be parsed, or
    /// [`StoreError::Connection`] if the server is unreachable.
    pub async fn connect(
        options: &RedisTrackerStoreOptions,
        domain: Option<Arc<Domain>>,
        event_broker: Option<Arc<dyn EventBroker>>,
    ) -> Result<Self, StoreError> {
        let url = options.connection_url()?;
        let config = Config::from_url(&url)
            .map_err(|e| StoreError::config(format!("invalid Redis URL: {e}")))?;
        let client = Builder::from_config(config).build()?;
        client.init().await?;

        let keys = options.key_layout();
        info!(key_prefix = %keys.tracker_prefix(), "connected to Redis tracker store");
        Ok(Self {
            context: StoreContext::new(domain, event_broker),
            client,
            keys,
            record_exp: options.record_exp,
        })
    }

    /// Key holding the tracker of `sender_id`.
    pub fn key(&self, sender_id: &str) -> String {
        self.keys.tracker(sender_id)
    }

    /// Drop index entries whose tracker key has expired.
    async fn prune_index(&self, members: Vec<String>) -> Result<BTreeSet<String>, StoreError> {
        let mut live = BTreeSet::new();
        for sender_id in members {
            let found: u32 = self.client.exists(self.key(&sender_id)).await?;
            if found > 0 {
                live.insert(sender_id);
            } else {
                debug!(sender_id = %sender_id, "removing expired tracker from index");
                let _: u32 = self.client.srem(self.keys.index(), sender_id.as_str()).await?;
            }
        }
        Ok(live)
    }
}

#[async_trait]
impl TrackerStore for RedisTrackerStore {
    fn name(&self) -> &'static str {
        "RedisTrackerStore"
    }

    fn context(&self) -> &StoreContext {
        &self.context
    }

    async fn save(&self, tracker: &Tracker) -> Result<(), StoreError> {
        self.stream_events(tracker).await?;
        let serialised = codec::serialise_tracker(tracker)?;
        let expiration = self.record_exp.map(Expiration::EX);
        let _: () = self
            .client
            .set(
                self.key(tracker.sender_id()),
                serialised.as_str(),
                expiration,
                None,
                false,
            )
            .await?;
        let _: u32 = self
            .client
            .sadd(self.keys.index(), tracker.sender_id())
            .await?;
        Ok(())
    }

    async fn retrieve(&self, sender_id: &str) -> Result<Option<Tracker>, StoreError> {
        let stored: Option<Vec<u8>> = self.client.get(self.key(sender_id)).await?;
        match stored {
            Some(raw) => {
                debug!(sender_id = sender_id, "recreating tracker");
                Ok(Some(self.deserialise_tracker(sender_id, &raw)?))
            }
            None => {
                debug!(sender_id = sender_id, "could not find tracker for conversation ID");
                Ok(None)
            }
        }
    }

    async fn keys(&self) -> Result<BTreeSet<String>, StoreError> {
        let members: Vec<String> = self.client.smembers(self.keys.index()).await?;
        self.prune_index(members).await
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn url_from_parts() {
        let options = RedisTrackerStoreOptions {
            url: Some("cache.internal".to_owned()),
            db: Some(2),
            password: Some("s3cret".to_owned()),
            ..RedisTrackerStoreOptions::default()
        };
        assert_eq!(
            options.connection_url().unwrap(),
            "redis://:s3cret@cache.internal:6379/2"
        );
    }

    #[test]
    fn full_url_is_kept() {
        let options = RedisTrackerStoreOptions {
            url: Some("redis://cache:6380/1".to_owned()),
            port: Some(1),
            ..RedisTrackerStoreOptions::default()
        };
        assert_eq!(options.connection_url().unwrap(), "redis://cache:6380/1");
    }

    #[test]
    fn index_never_collides_with_a_tracker_key() {
        for layout in [
            RedisTrackerStoreOptions::default().key_layout(),
            RedisTrackerStoreOptions {
                key_prefix: Some("bot".to_owned()),
                ..RedisTrackerStoreOptions::default()
            }
            .key_layout(),
        ] {
            let index = layout.index();
            for sender_id in ["index", "index:trackers", "", "tracker:index"] {
                assert_ne!(layout.tracker(sender_id), index);
            }
            assert!(!index.starts_with(&layout.tracker_prefix()));
        }
    }

    #[test]
    fn key_layouts() {
        let layout = KeyLayout::default();
        assert_eq!(layout.tracker("u1"), "tracker:u1");
        assert_eq!(layout.index(), "index:trackers");

        let options = RedisTrackerStoreOptions {
            key_prefix: Some("bot_1".to_owned()),
            ..RedisTrackerStoreOptions::default()
        };
        let layout = options.key_layout();
        assert_eq!(layout.tracker("u1"), "bot_1:tracker:u1");
        assert_eq!(layout.index(), "bot_1:index:trackers");
    }

    #[test]
    fn key_prefixes() {
        let mut options = RedisTrackerStoreOptions::default();
        assert_eq!(options.resolved_key_prefix(), "tracker:");

        options.key_prefix = Some("bot_1".to_owned());
        assert_eq!(options.resolved_key_prefix(), "bot_1:tracker:");

        options.key_prefix = Some("bad prefix!".to_owned());
        assert_eq!(options.resolved_key_prefix(), "tracker:");
    }
}
