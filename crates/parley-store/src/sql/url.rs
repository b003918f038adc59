//! Connection URL construction for the SQL backend.
//!
//! A configured host that already contains `://` is used verbatim and the
//! dialect is taken from its scheme. Otherwise the URL is assembled from
//! its parts: a `host:port` host string is split, and an inline port wins
//! over the separately configured one.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use ::url::Url;

use crate::error::StoreError;

/// Database name used for `SQLite` when none is configured.
pub const DEFAULT_SQLITE_DB: &str = "parley.db";

/// Name `SQLite` reserves for a private in-memory database.
pub const SQLITE_MEMORY_DB: &str = ":memory:";

/// Supported SQL dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// `PostgreSQL`.
    Postgresql,
    /// `SQLite`.
    Sqlite,
}

impl Dialect {
    /// URL scheme understood by the driver.
    pub const fn scheme(self) -> &'static str {
        match self {
            Self::Postgresql => "postgresql",
            Self::Sqlite => "sqlite",
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

impl FromStr for Dialect {
    type Err = StoreError;

    /// Accepts driver-qualified names such as `postgresql+psycopg2`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let name = value.split('+').next().unwrap_or(value).trim();
        match name.to_ascii_lowercase().as_str() {
            "postgresql" | "postgres" => Ok(Self::Postgresql),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(StoreError::config(format!("unsupported SQL dialect '{other}'"))),
        }
    }
}

/// Connection parts used to assemble a URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UrlParts {
    /// Host name, `host:port`, or a complete URL.
    pub host: Option<String>,
    /// Port, overridden by a port inlined in `host`.
    pub port: Option<u16>,
    /// User name.
    pub username: Option<String>,
    /// Password.
    pub password: Option<String>,
    /// Extra query parameters.
    pub query: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Verbatim(String),
    Parts(UrlParts),
}

/// A resolved database location for one dialect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseUrl {
    dialect: Dialect,
    target: Target,
}

impl DatabaseUrl {
    /// Resolve the location of a database.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`] if a verbatim URL has an unsupported
    /// scheme or the host string cannot be parsed.
    pub fn build(dialect: Dialect, parts: UrlParts) -> Result<Self, StoreError> {
        if let Some(host) = parts.host.as_deref().filter(|host| host.contains("://")) {
            let scheme = host.split("://").next().unwrap_or_default();
            return Ok(Self {
                dialect: scheme.parse()?,
                target: Target::Verbatim(host.to_owned()),
            });
        }

        let mut parts = parts;
        if let Some(host) = parts.host.take() {
            let (name, inline_port) = split_host(&host)?;
            parts.host = Some(name);
            parts.port = inline_port.or(parts.port);
        }
        Ok(Self {
            dialect,
            target: Target::Parts(parts),
        })
    }

    /// Dialect of the database.
    pub const fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Whether the URL was configured verbatim.
    pub const fn is_verbatim(&self) -> bool {
        matches!(self.target, Target::Verbatim(_))
    }

    /// Connection URL for `database`, pinning `schema` as the search path.
    ///
    /// A verbatim URL ignores `database`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`] if the parts do not form a valid URL.
    pub fn to_url(&self, database: &str, schema: Option<&str>) -> Result<String, StoreError> {
        match (&self.target, self.dialect) {
            (Target::Verbatim(url), Dialect::Sqlite) => Ok(url.clone()),
            (Target::Verbatim(url), Dialect::Postgresql) => {
                let mut url = parse(url)?;
                if let Some(schema) = schema {
                    url.query_pairs_mut()
                        .append_pair("options", &search_path(schema));
                }
                Ok(url.into())
            }
            (Target::Parts(_), Dialect::Sqlite) => Ok(sqlite_url(database)),
            (Target::Parts(parts), Dialect::Postgresql) => {
                postgres_url(parts, database, schema).map(Into::into)
            }
        }
    }

    /// Connection URL with the password masked, for logs.
    pub fn redacted(&self, database: &str) -> String {
        let Ok(url) = self.to_url(database, None) else {
            return format!("{}://<invalid>", self.dialect);
        };
        match Url::parse(&url) {
            Ok(mut parsed) if parsed.password().is_some() => {
                if parsed.set_password(Some("***")).is_ok() {
                    parsed.into()
                } else {
                    url
                }
            }
            _ => url,
        }
    }
}

fn parse(url: &str) -> Result<Url, StoreError> {
    Url::parse(url).map_err(|e| StoreError::config(format!("invalid database URL: {e}")))
}

fn split_host(host: &str) -> Result<(String, Option<u16>), StoreError> {
    let parsed = parse(&format!("postgresql://{host}"))?;
    let name = parsed
        .host_str()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| StoreError::config(format!("invalid database host '{host}'")))?;
    Ok((name.to_owned(), parsed.port()))
}

fn search_path(schema: &str) -> String {
    format!("-c search_path={schema}")
}

fn sqlite_url(database: &str) -> String {
    if database.is_empty() || database == SQLITE_MEMORY_DB {
        "sqlite::memory:".to_owned()
    } else {
        format!("sqlite://{database}?mode=rwc")
    }
}

fn postgres_url(parts: &UrlParts, database: &str, schema: Option<&str>) -> Result<Url, StoreError> {
    let mut url = parse("postgresql://localhost")?;
    if let Some(host) = &parts.host {
        url.set_host(Some(host))
            .map_err(|e| StoreError::config(format!("invalid database host '{host}': {e}")))?;
    }
    url.set_port(parts.port)
        .map_err(|()| StoreError::config("database port cannot be set"))?;
    if let Some(username) = &parts.username {
        url.set_username(username)
            .map_err(|()| StoreError::config("database username cannot be set"))?;
    }
    if let Some(password) = &parts.password {
        url.set_password(Some(password))
            .map_err(|()| StoreError::config("database password cannot be set"))?;
    }
    url.set_path(database);

    if !parts.query.is_empty() || schema.is_some() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in &parts.query {
            pairs.append_pair(key, value);
        }
        if let Some(schema) = schema {
            pairs.append_pair("options", &search_path(schema));
        }
    }
    Ok(url)
}
