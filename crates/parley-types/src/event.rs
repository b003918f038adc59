//! Conversation events.
//!
//! An [`Event`] is one immutable entry of a conversation's event log. On the
//! wire it is a single flat JSON object: the `event` key carries the type
//! discriminator, `timestamp` carries Unix seconds, and the variant fields sit
//! beside them:
//!
//! ```json
//! {"event": "action", "timestamp": 1760400000.25, "name": "action_listen"}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Name of the action a conversation is waiting in while listening for input.
pub const ACTION_LISTEN_NAME: &str = "action_listen";

/// Type name of the session boundary event.
pub const SESSION_STARTED: &str = "session_started";

/// A single entry in a conversation's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unix timestamp in seconds when the event was created.
    pub timestamp: f64,
    /// Type-specific payload, including the `event` discriminator.
    #[serde(flatten)]
    pub kind: EventKind,
}

/// The type-specific part of an [`Event`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum EventKind {
    /// A message sent by the user.
    #[serde(rename = "user")]
    UserUttered {
        /// Raw user text.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        /// NLU result attached to the message.
        #[serde(default)]
        parse_data: ParseData,
        /// Channel the message arrived on.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input_channel: Option<String>,
        /// Channel-specific message identifier.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },

    /// A message sent by the assistant.
    #[serde(rename = "bot")]
    BotUttered {
        /// Message text.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        /// Rich response data (buttons, attachments).
        #[serde(default)]
        data: Value,
    },

    /// An action was run by the assistant.
    #[serde(rename = "action")]
    ActionExecuted {
        /// Action name.
        name: String,
        /// Policy that predicted the action.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        policy: Option<String>,
        /// Prediction confidence.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        confidence: Option<f64>,
    },

    /// A slot was set to a new value.
    #[serde(rename = "slot")]
    SlotSet {
        /// Slot name.
        name: String,
        /// New slot value.
        #[serde(default)]
        value: Value,
    },

    /// A new conversation session started. Marks a session boundary.
    #[serde(rename = "session_started")]
    SessionStarted,

    /// The conversation was restarted.
    #[serde(rename = "restart")]
    Restarted,

    /// The assistant stopped responding to the conversation.
    #[serde(rename = "pause")]
    ConversationPaused,

    /// The assistant resumed responding to the conversation.
    #[serde(rename = "resume")]
    ConversationResumed,
}

/// NLU parse result attached to a user message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParseData {
    /// Top intent prediction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<IntentPrediction>,
    /// Extracted entities, kept opaque.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<Value>,
}

/// A predicted intent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntentPrediction {
    /// Intent name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Prediction confidence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl Event {
    /// Create an event stamped with the current time.
    pub fn new(kind: EventKind) -> Self {
        Self {
            timestamp: now_timestamp(),
            kind,
        }
    }

    /// Create an event with an explicit timestamp.
    pub const fn at(kind: EventKind, timestamp: f64) -> Self {
        Self { timestamp, kind }
    }

    /// An `action` event for the named action.
    pub fn action(name: &str) -> Self {
        Self::new(EventKind::ActionExecuted {
            name: name.to_owned(),
            policy: None,
            confidence: None,
        })
    }

    /// The synthetic event a fresh tracker starts with.
    pub fn listening() -> Self {
        Self::action(ACTION_LISTEN_NAME)
    }

    /// A `user` event with optional text and intent.
    pub fn user(text: &str, intent: Option<&str>) -> Self {
        Self::new(EventKind::UserUttered {
            text: Some(text.to_owned()),
            parse_data: ParseData {
                intent: intent.map(|name| IntentPrediction {
                    name: Some(name.to_owned()),
                    confidence: Some(1.0),
                }),
                entities: Vec::new(),
            },
            input_channel: None,
            message_id: None,
        })
    }

    /// A `slot` event.
    pub fn slot(name: &str, value: Value) -> Self {
        Self::new(EventKind::SlotSet {
            name: name.to_owned(),
            value,
        })
    }

    /// A `session_started` event.
    pub fn session_started() -> Self {
        Self::new(EventKind::SessionStarted)
    }

    /// The type discriminator as written to the `event` key.
    pub const fn type_name(&self) -> &'static str {
        match self.kind {
            EventKind::UserUttered { .. } => "user",
            EventKind::BotUttered { .. } => "bot",
            EventKind::ActionExecuted { .. } => "action",
            EventKind::SlotSet { .. } => "slot",
            EventKind::SessionStarted => SESSION_STARTED,
            EventKind::Restarted => "restart",
            EventKind::ConversationPaused => "pause",
            EventKind::ConversationResumed => "resume",
        }
    }

    /// Whether this event opens a new conversation session.
    pub const fn is_session_start(&self) -> bool {
        matches!(self.kind, EventKind::SessionStarted)
    }

    /// Name of the predicted intent, for `user` events that carry one.
    pub fn intent_name(&self) -> Option<&str> {
        match &self.kind {
            EventKind::UserUttered { parse_data, .. } => parse_data
                .intent
                .as_ref()
                .and_then(|intent| intent.name.as_deref()),
            _ => None,
        }
    }

    /// Name of the executed action, for `action` events.
    pub fn action_name(&self) -> Option<&str> {
        match &self.kind {
            EventKind::ActionExecuted { name, .. } => Some(name),
            _ => None,
        }
    }

    /// The structured payload of this event.
    ///
    /// # Errors
    ///
    /// Returns [`serde_json::Error`] if a slot or bot payload cannot be
    /// represented as JSON.
    pub fn as_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// Current UTC time as fractional Unix seconds with microsecond precision.
#[allow(clippy::cast_precision_loss, clippy::arithmetic_side_effects)]
pub fn now_timestamp() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use serde_json::json;

    #[test]
    fn action_event_is_flat_json() {
        let event = Event::at(
            EventKind::ActionExecuted {
                name: "greet".to_owned(),
                policy: None,
                confidence: None,
            },
            12.5,
        );
        let value = event.as_value().unwrap();
        assert_eq!(
            value,
            json!({"event": "action", "timestamp": 12.5, "name": "greet"})
        );
    }

    #[test]
    fn session_started_has_only_discriminator_and_timestamp() {
        let event = Event::at(EventKind::SessionStarted, 3.0);
        let value = event.as_value().unwrap();
        assert_eq!(value, json!({"event": "session_started", "timestamp": 3.0}));

        let decoded: Event = serde_json::from_value(value).unwrap();
        assert!(decoded.is_session_start());
    }

    #[test]
    fn user_event_exposes_intent_name() {
        let raw = json!({
            "event": "user",
            "timestamp": 1.0,
            "text": "hi there",
            "parse_data": {"intent": {"name": "greet", "confidence": 0.93}}
        });
        let event: Event = serde_json::from_value(raw).unwrap();
        assert_eq!(event.type_name(), "user");
        assert_eq!(event.intent_name(), Some("greet"));
        assert_eq!(event.action_name(), None);
    }

    #[test]
    fn slot_event_has_no_action_name() {
        let event = Event::slot("city", json!("Berlin"));
        assert_eq!(event.type_name(), "slot");
        assert_eq!(event.action_name(), None);
        assert_eq!(event.intent_name(), None);
    }

    #[test]
    fn unknown_event_type_is_rejected() {
        let raw = json!({"event": "teleport", "timestamp": 1.0});
        assert!(serde_json::from_value::<Event>(raw).is_err());
    }

    #[test]
    fn listening_event_names_listen_action() {
        let event = Event::listening();
        assert_eq!(event.action_name(), Some(ACTION_LISTEN_NAME));
        assert!(event.timestamp > 0.0);
    }
}
