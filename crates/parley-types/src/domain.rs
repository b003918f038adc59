//! Conversation schema.
//!
//! The tracker store only needs the slot definitions from the domain: every
//! tracker it rebuilds starts from the domain's initial slot values.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

/// Errors that can occur when loading a domain file.
#[derive(Debug, thiserror::Error)]
pub enum DomainError {
    /// Failed to read the domain file from disk.
    #[error("failed to read domain file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse the domain YAML.
    #[error("failed to parse domain YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        #[from]
        source: serde_yml::Error,
    },
}

/// A slot definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Slot {
    /// Value the slot holds before anything sets it.
    #[serde(default)]
    pub initial_value: Value,
}

/// The conversation schema trackers are validated against.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Domain {
    /// Slot definitions keyed by slot name.
    #[serde(default)]
    pub slots: BTreeMap<String, Slot>,
}

impl Domain {
    /// A domain without slots.
    pub const fn empty() -> Self {
        Self {
            slots: BTreeMap::new(),
        }
    }

    /// Add a slot definition.
    #[must_use]
    pub fn with_slot(mut self, name: &str, initial_value: Value) -> Self {
        self.slots.insert(name.to_owned(), Slot { initial_value });
        self
    }

    /// Initial values for every slot, keyed by slot name.
    pub fn initial_slots(&self) -> BTreeMap<String, Value> {
        self.slots
            .iter()
            .map(|(name, slot)| (name.clone(), slot.initial_value.clone()))
            .collect()
    }

    /// Load a domain from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::Io`] if the file cannot be read, or
    /// [`DomainError::Yaml`] if the content is not a valid domain.
    pub fn from_file(path: &Path) -> Result<Self, DomainError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse a domain from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::Yaml`] if the string is not a valid domain.
    pub fn parse(yaml: &str) -> Result<Self, DomainError> {
        Ok(serde_yml::from_str(yaml)?)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use serde_json::json;

    #[test]
    fn parse_slots_with_initial_values() {
        let yaml = r"
slots:
  city:
    initial_value: Berlin
  visits:
    initial_value: 0
  name: {}
";
        let domain = Domain::parse(yaml).unwrap();
        let slots = domain.initial_slots();
        assert_eq!(slots.get("city"), Some(&json!("Berlin")));
        assert_eq!(slots.get("visits"), Some(&json!(0)));
        assert_eq!(slots.get("name"), Some(&Value::Null));
    }

    #[test]
    fn empty_yaml_is_empty_domain() {
        let domain = Domain::parse("{}").unwrap();
        assert_eq!(domain, Domain::empty());
    }
}
