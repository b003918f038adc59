//! Conversation state rebuilt from an event log.
//!
//! A [`Tracker`] is never persisted itself. Stores persist its events and
//! rebuild it by replaying them on top of the domain's initial slot values.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::{Event, EventKind};

/// The structured-text form of a tracker: its conversation id and events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dialogue {
    /// Conversation id.
    pub name: String,
    /// Events in append order.
    pub events: Vec<Event>,
}

/// In-memory state of one conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct Tracker {
    sender_id: String,
    events: VecDeque<Event>,
    initial_slots: BTreeMap<String, Value>,
    slots: BTreeMap<String, Value>,
    max_event_history: Option<usize>,
}

impl Tracker {
    /// Create an empty tracker with the given initial slot values.
    ///
    /// When `max_event_history` is set only the newest events are kept.
    pub fn new(
        sender_id: &str,
        initial_slots: BTreeMap<String, Value>,
        max_event_history: Option<usize>,
    ) -> Self {
        Self {
            sender_id: sender_id.to_owned(),
            events: VecDeque::new(),
            slots: initial_slots.clone(),
            initial_slots,
            max_event_history,
        }
    }

    /// Create a tracker by replaying `events` in order.
    pub fn from_events(
        sender_id: &str,
        events: impl IntoIterator<Item = Event>,
        initial_slots: BTreeMap<String, Value>,
    ) -> Self {
        let mut tracker = Self::new(sender_id, initial_slots, None);
        for event in events {
            tracker.update(event);
        }
        tracker
    }

    /// Conversation id.
    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    /// Events in append order.
    pub const fn events(&self) -> &VecDeque<Event> {
        &self.events
    }

    /// Number of events held by the tracker.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the tracker holds no events.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Maximum number of events retained, if limited.
    pub const fn max_event_history(&self) -> Option<usize> {
        self.max_event_history
    }

    /// Limit the number of retained events, dropping the oldest ones now.
    pub fn set_max_event_history(&mut self, max_event_history: Option<usize>) {
        self.max_event_history = max_event_history;
        self.enforce_history_limit();
    }

    fn enforce_history_limit(&mut self) {
        if let Some(limit) = self.max_event_history {
            while self.events.len() > limit {
                self.events.pop_front();
            }
        }
    }

    /// Append an event and apply its effect on the conversation state.
    pub fn update(&mut self, event: Event) {
        match &event.kind {
            EventKind::SlotSet { name, value } => {
                self.slots.insert(name.clone(), value.clone());
            }
            EventKind::Restarted | EventKind::SessionStarted => {
                self.slots.clone_from(&self.initial_slots);
            }
            _ => {}
        }

        self.events.push_back(event);
        self.enforce_history_limit();
    }

    /// Current value of a slot.
    pub fn slot(&self, name: &str) -> Option<&Value> {
        self.slots.get(name)
    }

    /// Current values of all slots.
    pub const fn slots(&self) -> &BTreeMap<String, Value> {
        &self.slots
    }

    /// Name of the most recently executed action.
    pub fn latest_action_name(&self) -> Option<&str> {
        self.events.iter().rev().find_map(Event::action_name)
    }

    /// Intent of the most recent user message.
    pub fn latest_intent_name(&self) -> Option<&str> {
        self.events
            .iter()
            .rev()
            .find(|event| matches!(event.kind, EventKind::UserUttered { .. }))
            .and_then(Event::intent_name)
    }

    /// Snapshot this tracker as a [`Dialogue`].
    pub fn as_dialogue(&self) -> Dialogue {
        Dialogue {
            name: self.sender_id.clone(),
            events: self.events.iter().cloned().collect(),
        }
    }

    /// Reset the state and replay a dialogue's events.
    pub fn recreate_from_dialogue(&mut self, dialogue: Dialogue) {
        self.events.clear();
        self.slots.clone_from(&self.initial_slots);
        for event in dialogue.events {
            self.update(event);
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::indexing_slicing)]

    use super::*;
    use serde_json::json;

    fn slots() -> BTreeMap<String, Value> {
        BTreeMap::from([("city".to_owned(), Value::Null)])
    }

    #[test]
    fn slot_events_update_state() {
        let mut tracker = Tracker::new("u1", slots(), None);
        tracker.update(Event::slot("city", json!("Paris")));
        assert_eq!(tracker.slot("city"), Some(&json!("Paris")));
    }

    #[test]
    fn session_start_resets_slots_but_keeps_events() {
        let mut tracker = Tracker::new("u1", slots(), None);
        tracker.update(Event::slot("city", json!("Paris")));
        tracker.update(Event::session_started());
        assert_eq!(tracker.slot("city"), Some(&Value::Null));
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn max_event_history_drops_oldest() {
        let mut tracker = Tracker::new("u1", BTreeMap::new(), Some(2));
        tracker.update(Event::action("a"));
        tracker.update(Event::action("b"));
        tracker.update(Event::action("c"));
        let names: Vec<_> = tracker.events().iter().filter_map(Event::action_name).collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[test]
    fn lowering_the_history_limit_trims_existing_events() {
        let mut tracker = Tracker::new("u1", BTreeMap::new(), None);
        for name in ["a", "b", "c", "d"] {
            tracker.update(Event::action(name));
        }
        tracker.set_max_event_history(Some(2));
        assert_eq!(tracker.max_event_history(), Some(2));
        assert_eq!(tracker.latest_action_name(), Some("d"));
        assert_eq!(tracker.len(), 2);

        tracker.set_max_event_history(None);
        tracker.update(Event::action("e"));
        assert_eq!(tracker.len(), 3);
    }

    #[test]
    fn latest_names() {
        let mut tracker = Tracker::new("u1", BTreeMap::new(), None);
        tracker.update(Event::listening());
        tracker.update(Event::user("hello", Some("greet")));
        tracker.update(Event::action("utter_greet"));
        assert_eq!(tracker.latest_action_name(), Some("utter_greet"));
        assert_eq!(tracker.latest_intent_name(), Some("greet"));
    }

    #[test]
    fn dialogue_replay_rebuilds_the_same_tracker() {
        let mut tracker = Tracker::new("u1", slots(), None);
        tracker.update(Event::listening());
        tracker.update(Event::slot("city", json!("Rome")));

        let dialogue = tracker.as_dialogue();
        assert_eq!(dialogue.name, "u1");

        let mut rebuilt = Tracker::new("u1", slots(), None);
        rebuilt.recreate_from_dialogue(dialogue);
        assert_eq!(rebuilt, tracker);
        assert_eq!(rebuilt.events()[1].type_name(), "slot");
    }
}
