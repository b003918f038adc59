//! Conversation model for the Parley tracker store.
//!
//! Stores persist event logs; everything else in this crate is derived from
//! them. A [`Tracker`] is rebuilt by replaying [`Event`]s on top of the
//! [`Domain`]'s initial slot values.
//!
//! # Modules
//!
//! - [`event`] -- Event records and their wire format
//! - [`tracker`] -- Conversation state and its [`Dialogue`] text form
//! - [`domain`] -- Slot schema used to seed trackers

pub mod domain;
pub mod event;
pub mod tracker;

// Re-export primary types for convenience.
pub use domain::{Domain, DomainError, Slot};
pub use event::{
    ACTION_LISTEN_NAME, Event, EventKind, IntentPrediction, ParseData, SESSION_STARTED,
    now_timestamp,
};
pub use tracker::{Dialogue, Tracker};
