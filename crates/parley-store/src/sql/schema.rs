//! Definition of the events table and the statements run against it.
//!
//! Every statement is rendered per dialect at runtime; values are always
//! bound as parameters. Only the table name is interpolated, and it is
//! validated as a plain identifier on construction.

use chrono::NaiveDateTime;

use super::url::Dialect;
use crate::error::StoreError;

/// Default name of the events table.
pub const DEFAULT_TABLE_NAME: &str = "events";

/// Text form timestamps are bound in.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Render a timestamp for binding.
pub fn format_timestamp(timestamp: NaiveDateTime) -> String {
    timestamp.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a timestamp read back as text.
///
/// Accepts any fractional precision, including none.
pub fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text.trim(), "%Y-%m-%d %H:%M:%S%.f").ok()
}

/// Validate `name` as an unquoted SQL identifier.
///
/// # Errors
///
/// Returns [`StoreError::Config`] unless `name` is non-empty ASCII
/// alphanumerics and underscores, not starting with a digit.
pub fn validate_identifier(name: &str) -> Result<(), StoreError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(StoreError::config(format!("invalid SQL identifier '{name}'")))
    }
}

/// The table holding one row per conversation event.
///
/// Columns: `id`, `sender_id` (indexed), `type_name`, `timestamp`,
/// `intent_name`, `action_name` and `data` (the serialized event).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventsTable {
    name: String,
}

impl Default for EventsTable {
    fn default() -> Self {
        Self {
            name: DEFAULT_TABLE_NAME.to_owned(),
        }
    }
}

impl EventsTable {
    /// Describe a table called `name`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`] if `name` is not a plain identifier.
    pub fn new(name: &str) -> Result<Self, StoreError> {
        validate_identifier(name)?;
        Ok(Self {
            name: name.to_owned(),
        })
    }

    /// Table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sequence backing `id` on `PostgreSQL`.
    pub fn sequence_name(&self) -> String {
        format!("{}_seq", self.name)
    }

    /// Index over `sender_id`.
    pub fn index_name(&self) -> String {
        format!("ix_{}_sender_id", self.name)
    }

    /// Idempotent DDL creating the table and its supporting objects.
    pub fn create_statements(&self, dialect: Dialect) -> Vec<String> {
        let table = &self.name;
        let id_column = match dialect {
            Dialect::Postgresql => format!(
                "id INTEGER NOT NULL DEFAULT nextval('{}') PRIMARY KEY",
                self.sequence_name()
            ),
            Dialect::Sqlite => "id INTEGER PRIMARY KEY AUTOINCREMENT".to_owned(),
        };
        let create_table = format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
                {id_column}, \
                sender_id VARCHAR(255) NOT NULL, \
                type_name VARCHAR(255) NOT NULL, \
                timestamp TIMESTAMP, \
                intent_name VARCHAR(255), \
                action_name VARCHAR(255), \
                data TEXT NOT NULL\
             )"
        );
        let create_index = format!(
            "CREATE INDEX IF NOT EXISTS {} ON {table} (sender_id)",
            self.index_name()
        );

        match dialect {
            Dialect::Postgresql => vec![
                format!("CREATE SEQUENCE IF NOT EXISTS {}", self.sequence_name()),
                create_table,
                create_index,
            ],
            Dialect::Sqlite => vec![create_table, create_index],
        }
    }

    /// Bind expression for a timestamp parameter.
    pub fn timestamp_param(dialect: Dialect, index: usize) -> String {
        match dialect {
            Dialect::Postgresql => format!("CAST(${index} AS TIMESTAMP)"),
            Dialect::Sqlite => format!("${index}"),
        }
    }

    /// Insert one event row.
    ///
    /// Binds `sender_id`, `type_name`, `timestamp`, `intent_name`,
    /// `action_name` and `data`, in that order.
    pub fn insert_sql(&self, dialect: Dialect) -> String {
        format!(
            "INSERT INTO {} (sender_id, type_name, timestamp, intent_name, action_name, data) \
             VALUES ($1, $2, {}, $4, $5, $6)",
            self.name,
            Self::timestamp_param(dialect, 3)
        )
    }

    /// Serialized events of one conversation in insertion order.
    ///
    /// Binds `sender_id`; unless `full_history`, also binds `sender_id`
    /// and the session-start type name to restrict the rows to the latest
    /// session.
    pub fn select_events_sql(&self, full_history: bool) -> String {
        format!(
            "SELECT e.data FROM {} e WHERE {} ORDER BY e.timestamp, e.id",
            self.name,
            self.conversation_filter(full_history)
        )
    }

    /// Number of rows of one conversation, bound like
    /// [`EventsTable::select_events_sql`].
    pub fn count_events_sql(&self, full_history: bool) -> String {
        format!(
            "SELECT COUNT(*) FROM {} e WHERE {}",
            self.name,
            self.conversation_filter(full_history)
        )
    }

    /// Newest row timestamp of one conversation, as text.
    ///
    /// Binds `sender_id`.
    pub fn max_timestamp_sql(&self) -> String {
        format!(
            "SELECT CAST(MAX(timestamp) AS TEXT) FROM {} WHERE sender_id = $1",
            self.name
        )
    }

    /// Distinct conversation ids.
    pub fn select_sender_ids_sql(&self) -> String {
        format!("SELECT DISTINCT sender_id FROM {}", self.name)
    }

    fn conversation_filter(&self, full_history: bool) -> String {
        if full_history {
            "e.sender_id = $1".to_owned()
        } else {
            format!(
                "e.sender_id = $1 AND e.timestamp >= COALESCE(\
                    (SELECT MAX(s.timestamp) FROM {} s \
                     WHERE s.sender_id = $2 AND s.type_name = $3), \
                    e.timestamp)",
                self.name
            )
        }
    }
}
