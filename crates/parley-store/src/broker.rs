//! Event brokers that receive newly persisted events.
//!
//! Every store forwards the events appended since the last save to its
//! broker, one message per event, in append order. The message body is the
//! conversation id merged with the event's own fields:
//!
//! ```json
//! {"sender_id": "u1", "event": "action", "timestamp": 1760400000.25, "name": "greet"}
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use parley_types::Event;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::EndpointConfig;
use crate::error::StoreError;

/// Default NATS subject for published events.
pub const DEFAULT_SUBJECT: &str = "parley.events";

/// Destination for newly persisted conversation events.
#[async_trait]
pub trait EventBroker: Send + Sync {
    /// Publish one message body.
    async fn publish(&self, body: Value) -> Result<(), StoreError>;
}

/// Build the broker message for one event of a conversation.
///
/// Event fields win over the `sender_id` key if they collide.
///
/// # Errors
///
/// Returns [`StoreError::Serialization`] if the event cannot be serialized.
pub fn event_body(sender_id: &str, event: &Event) -> Result<Value, StoreError> {
    let mut body = Map::new();
    body.insert("sender_id".to_owned(), Value::String(sender_id.to_owned()));
    if let Value::Object(fields) = event.as_value()? {
        body.extend(fields);
    }
    Ok(Value::Object(body))
}

// =========================================================================
// NATS
// =========================================================================

/// Options for [`NatsEventBroker`] read from the endpoint parameters.
#[derive(Debug, Clone, Deserialize)]
struct NatsOptions {
    #[serde(default = "default_subject")]
    subject: String,
}

fn default_subject() -> String {
    DEFAULT_SUBJECT.to_owned()
}

/// Publishes event bodies as JSON on a NATS subject.
pub struct NatsEventBroker {
    client: async_nats::Client,
    subject: String,
}

impl NatsEventBroker {
    /// Connect to a NATS server.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] if the connection cannot be established.
    pub async fn connect(url: &str, subject: &str) -> Result<Self, StoreError> {
        info!(url = url, subject = subject, "connecting to NATS server");
        let client = async_nats::connect(url)
            .await
            .map_err(|e| StoreError::connection(format!("failed to connect to {url}: {e}")))?;
        info!("NATS connection established");
        Ok(Self {
            client,
            subject: subject.to_owned(),
        })
    }
}

#[async_trait]
impl EventBroker for NatsEventBroker {
    async fn publish(&self, body: Value) -> Result<(), StoreError> {
        let payload = serde_json::to_vec(&body)?;
        debug!(subject = %self.subject, "publishing event");
        self.client
            .publish(self.subject.clone(), payload.into())
            .await
            .map_err(|e| StoreError::Broker {
                message: format!("failed to publish to {}: {e}", self.subject),
            })
    }
}

// =========================================================================
// In-memory
// =========================================================================

/// Records every published body in order.
#[derive(Debug, Default)]
pub struct InMemoryEventBroker {
    published: Mutex<Vec<Value>>,
}

impl InMemoryEventBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// All bodies published so far, oldest first.
    pub fn published(&self) -> Vec<Value> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl EventBroker for InMemoryEventBroker {
    async fn publish(&self, body: Value) -> Result<(), StoreError> {
        self.published.lock().push(body);
        Ok(())
    }
}

/// Create the broker described by an endpoint, if any.
///
/// Supported kinds are `nats` and `memory`. Unknown kinds are logged and
/// yield no broker.
///
/// # Errors
///
/// Returns [`StoreError::Config`] if the endpoint is missing required
/// parameters, or [`StoreError::Connection`] if the broker is unreachable.
pub async fn create_event_broker(
    endpoint: Option<&EndpointConfig>,
) -> Result<Option<Arc<dyn EventBroker>>, StoreError> {
    let Some(endpoint) = endpoint else {
        return Ok(None);
    };
    let Some(kind) = endpoint.kind() else {
        return Ok(None);
    };

    match kind.as_str() {
        "nats" => {
            let url = endpoint
                .url
                .as_deref()
                .ok_or_else(|| StoreError::config("the nats event broker requires a `url`"))?;
            let options: NatsOptions = endpoint.options()?;
            let broker = NatsEventBroker::connect(url, &options.subject).await?;
            Ok(Some(Arc::new(broker)))
        }
        "memory" | "in_memory" => Ok(Some(Arc::new(InMemoryEventBroker::new()))),
        other => {
            warn!(kind = other, "event broker type not found, not publishing events");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use parley_types::EventKind;
    use serde_json::json;

    #[test]
    fn body_merges_sender_id_with_event_fields() {
        let event = Event::at(
            EventKind::ActionExecuted {
                name: "greet".to_owned(),
                policy: None,
                confidence: None,
            },
            2.0,
        );
        let body = event_body("u1", &event).unwrap();
        assert_eq!(
            body,
            json!({"sender_id": "u1", "event": "action", "timestamp": 2.0, "name": "greet"})
        );
    }

    #[tokio::test]
    async fn in_memory_broker_keeps_order() {
        let broker = InMemoryEventBroker::new();
        broker.publish(json!({"n": 1})).await.unwrap();
        broker.publish(json!({"n": 2})).await.unwrap();
        assert_eq!(broker.published(), vec![json!({"n": 1}), json!({"n": 2})]);
    }

    #[tokio::test]
    async fn unknown_broker_kind_yields_none() {
        let endpoint = EndpointConfig::of_kind("carrier-pigeon");
        let broker = create_event_broker(Some(&endpoint)).await.unwrap();
        assert!(broker.is_none());
    }

    #[tokio::test]
    async fn missing_endpoint_yields_none() {
        assert!(create_event_broker(None).await.unwrap().is_none());
    }
}
