//! Process-environment tuning for the SQL backend.

use std::env;

use crate::error::StoreError;

/// Variable naming the `PostgreSQL` schema to use.
pub const POSTGRESQL_SCHEMA: &str = "POSTGRESQL_SCHEMA";
/// Variable with the base pool size.
pub const POSTGRESQL_POOL_SIZE: &str = "POSTGRESQL_POOL_SIZE";
/// Variable with the number of connections allowed beyond the pool size.
pub const POSTGRESQL_MAX_OVERFLOW: &str = "POSTGRESQL_MAX_OVERFLOW";

/// Default base pool size.
pub const DEFAULT_POOL_SIZE: u32 = 50;
/// Default overflow allowance.
pub const DEFAULT_MAX_OVERFLOW: u32 = 100;

/// Environment-level settings that apply to `PostgreSQL` only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlEnvironment {
    /// Schema pinned as the session search path.
    pub schema: Option<String>,
    /// Base pool size.
    pub pool_size: u32,
    /// Connections allowed beyond `pool_size`.
    pub max_overflow: u32,
}

impl Default for SqlEnvironment {
    fn default() -> Self {
        Self {
            schema: None,
            pool_size: DEFAULT_POOL_SIZE,
            max_overflow: DEFAULT_MAX_OVERFLOW,
        }
    }
}

impl SqlEnvironment {
    /// Read settings from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`] if a pool size is not an integer.
    pub fn from_env() -> Result<Self, StoreError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Read settings through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, StoreError> {
        let schema = lookup(POSTGRESQL_SCHEMA).filter(|schema| !schema.trim().is_empty());
        Ok(Self {
            schema,
            pool_size: parse_count(&lookup, POSTGRESQL_POOL_SIZE, DEFAULT_POOL_SIZE)?,
            max_overflow: parse_count(&lookup, POSTGRESQL_MAX_OVERFLOW, DEFAULT_MAX_OVERFLOW)?,
        })
    }

    /// Upper bound of open connections.
    pub const fn max_connections(&self) -> u32 {
        self.pool_size.saturating_add(self.max_overflow)
    }
}

fn parse_count(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: u32,
) -> Result<u32, StoreError> {
    lookup(name).map_or(Ok(default), |value| {
        value
            .trim()
            .parse()
            .map_err(|e| StoreError::config(format!("{name} must be a non-negative integer: {e}")))
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let env = SqlEnvironment::from_lookup(lookup(&[])).unwrap();
        assert_eq!(env, SqlEnvironment::default());
        assert_eq!(env.max_connections(), 150);
    }

    #[test]
    fn reads_overrides() {
        let env = SqlEnvironment::from_lookup(lookup(&[
            (POSTGRESQL_SCHEMA, "conversations"),
            (POSTGRESQL_POOL_SIZE, "5"),
            (POSTGRESQL_MAX_OVERFLOW, " 2 "),
        ]))
        .unwrap();
        assert_eq!(env.schema.as_deref(), Some("conversations"));
        assert_eq!(env.max_connections(), 7);
    }

    #[test]
    fn rejects_non_numeric_pool_size() {
        let result = SqlEnvironment::from_lookup(lookup(&[(POSTGRESQL_POOL_SIZE, "many")]));
        assert!(matches!(result, Err(StoreError::Config { .. })));
    }
}
