//! Tracker serialization for whole-tracker backends.
//!
//! Trackers are written as the JSON text of their [`Dialogue`]. Older
//! deployments wrote a binary (CBOR) encoding of the same dialogue; those
//! records are still readable so they can be migrated, but are never
//! produced. Binary records are recognised by not being valid UTF-8.

use parley_types::{Dialogue, Tracker};
use tracing::warn;

use crate::error::StoreError;

/// Format a stored tracker was decoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredFormat {
    /// JSON text.
    Text,
    /// Legacy binary encoding.
    LegacyBinary,
}

/// Serialize a tracker to its structured-text form.
///
/// # Errors
///
/// Returns [`StoreError::Serialization`] if an event payload cannot be
/// represented as JSON.
pub fn serialise_tracker(tracker: &Tracker) -> Result<String, StoreError> {
    Ok(serde_json::to_string(&tracker.as_dialogue())?)
}

/// Decode a stored tracker into a [`Dialogue`].
///
/// Emits one deprecation warning when the legacy binary path is taken.
///
/// # Errors
///
/// Returns [`StoreError::Serialization`] for malformed text, or
/// [`StoreError::LegacyDecode`] for malformed binary records.
pub fn decode_dialogue(
    sender_id: &str,
    raw: &[u8],
) -> Result<(Dialogue, StoredFormat), StoreError> {
    match std::str::from_utf8(raw) {
        Ok(text) => Ok((serde_json::from_str(text)?, StoredFormat::Text)),
        Err(_) => {
            warn!(
                sender_id = sender_id,
                "Found legacy binary tracker for this conversation ID. Deserialization of \
                 binary trackers is deprecated and will be removed in a future release. \
                 Future save operations of this tracker will use JSON serialisation."
            );
            let dialogue = decode_legacy(raw)?;
            Ok((dialogue, StoredFormat::LegacyBinary))
        }
    }
}

fn decode_legacy(raw: &[u8]) -> Result<Dialogue, StoreError> {
    ciborium::from_reader(raw).map_err(|e| StoreError::LegacyDecode {
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parley_types::Event;
    use tracing::Level;
    use tracing_subscriber::Layer;
    use tracing_subscriber::layer::{Context, SubscriberExt};

    use super::*;

    /// Counts `WARN` events.
    struct WarnCounter(Arc<AtomicUsize>);

    impl<S: tracing::Subscriber> Layer<S> for WarnCounter {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            if *event.metadata().level() == Level::WARN {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn sample_tracker() -> Tracker {
        let mut tracker = Tracker::new("u1", BTreeMap::new(), None);
        tracker.update(Event::listening());
        tracker.update(Event::user("hi", Some("greet")));
        tracker
    }

    fn count_warnings<T>(f: impl FnOnce() -> T) -> (T, usize) {
        let counter = Arc::new(AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry().with(WarnCounter(Arc::clone(&counter)));
        let result = tracing::subscriber::with_default(subscriber, f);
        (result, counter.load(Ordering::SeqCst))
    }

    #[test]
    fn text_round_trip_without_warning() {
        let tracker = sample_tracker();
        let text = serialise_tracker(&tracker).unwrap();

        let ((dialogue, format), warnings) =
            count_warnings(|| decode_dialogue("u1", text.as_bytes()).unwrap());
        assert_eq!(format, StoredFormat::Text);
        assert_eq!(warnings, 0);
        assert_eq!(dialogue, tracker.as_dialogue());
    }

    #[test]
    fn legacy_binary_decodes_with_one_notice() {
        let tracker = sample_tracker();
        let mut raw = Vec::new();
        ciborium::into_writer(&tracker.as_dialogue(), &mut raw).unwrap();
        assert!(std::str::from_utf8(&raw).is_err());

        let ((dialogue, format), warnings) =
            count_warnings(|| decode_dialogue("u1", &raw).unwrap());
        assert_eq!(format, StoredFormat::LegacyBinary);
        assert_eq!(warnings, 1);
        assert_eq!(dialogue, tracker.as_dialogue());
    }

    #[test]
    fn corrupt_binary_is_a_legacy_decode_error() {
        let result = decode_dialogue("u1", &[0xff, 0xfe, 0x00]);
        assert!(matches!(result, Err(StoreError::LegacyDecode { .. })));
    }

    #[test]
    fn malformed_text_is_a_serialization_error() {
        let result = decode_dialogue("u1", b"{not json");
        assert!(matches!(result, Err(StoreError::Serialization(_))));
    }
}
