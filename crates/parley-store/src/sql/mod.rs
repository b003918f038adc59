//! Relational tracker store.
//!
//! Events are stored one row per event in an append-only table (see
//! [`EventsTable`]), so saving a tracker only inserts the events appended
//! since it was last persisted. A conversation's latest session is
//! selected in SQL: only rows at or after its newest `session_started`
//! row are read.
//!
//! Uses [`sqlx`]'s `Any` driver with runtime query construction so one
//! implementation serves both `PostgreSQL` and `SQLite`. Timestamps are
//! bound as fixed-format text and only ever compared and ordered inside
//! the database.

mod environment;
mod schema;
mod url;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Once};

use async_trait::async_trait;
use chrono::{NaiveDateTime, SubsecRound, TimeDelta, Utc};
use parley_types::{Domain, Event, SESSION_STARTED, Tracker};
use serde::Deserialize;
use sqlx::any::{Any, AnyArguments, AnyPoolOptions, AnyRow};
use sqlx::query::QueryScalar;
use sqlx::{Acquire, AnyConnection, AnyPool, FromRow, Transaction};
use tracing::{debug, error, info, warn};

pub use self::environment::{
    DEFAULT_MAX_OVERFLOW, DEFAULT_POOL_SIZE, POSTGRESQL_MAX_OVERFLOW, POSTGRESQL_POOL_SIZE,
    POSTGRESQL_SCHEMA, SqlEnvironment,
};
pub use self::schema::{
    DEFAULT_TABLE_NAME, EventsTable, TIMESTAMP_FORMAT, format_timestamp, parse_timestamp,
    validate_identifier,
};
pub use self::url::{DEFAULT_SQLITE_DB, DatabaseUrl, Dialect, SQLITE_MEMORY_DB, UrlParts};
use crate::broker::EventBroker;
use crate::error::{StoreError, is_unique_violation};
use crate::retry::RetryPolicy;
use crate::store::{StoreContext, TrackerStore, publish_events};

static INSTALL_DRIVERS: Once = Once::new();

/// Connection options of an SQL endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SqlTrackerStoreOptions {
    /// Dialect name; `sqlite` when unset.
    pub dialect: Option<String>,
    /// Host, `host:port`, or a complete connection URL.
    pub host: Option<String>,
    /// Port.
    pub port: Option<u16>,
    /// Database name; `parley.db` for `SQLite` when unset.
    pub db: Option<String>,
    /// User name.
    pub username: Option<String>,
    /// Password.
    pub password: Option<String>,
    /// Database to log in to when the target database may not exist yet.
    pub login_db: Option<String>,
    /// Extra connection URL parameters.
    pub query: BTreeMap<String, String>,
    /// Events table name; `events` when unset.
    pub table: Option<String>,
    /// Deprecated: make [`TrackerStore::retrieve`] read every session.
    pub retrieve_events_from_previous_conversation_sessions: bool,
}

impl SqlTrackerStoreOptions {
    /// Options for a private in-memory `SQLite` database.
    pub fn sqlite_memory() -> Self {
        Self {
            dialect: Some(Dialect::Sqlite.scheme().to_owned()),
            db: Some(SQLITE_MEMORY_DB.to_owned()),
            ..Self::default()
        }
    }

    fn dialect(&self) -> Result<Dialect, StoreError> {
        self.dialect
            .as_deref()
            .map_or(Ok(Dialect::Sqlite), str::parse)
    }

    fn database(&self, dialect: Dialect) -> String {
        match (&self.db, dialect) {
            (Some(db), _) => db.clone(),
            (None, Dialect::Sqlite) => DEFAULT_SQLITE_DB.to_owned(),
            (None, Dialect::Postgresql) => "parley".to_owned(),
        }
    }

    fn url_parts(&self) -> UrlParts {
        UrlParts {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            password: self.password.clone(),
            query: self.query.clone(),
        }
    }
}

/// Everything [`SqlTrackerStore::connect`] needs besides the domain and
/// the broker.
#[derive(Debug, Clone)]
pub struct SqlConfig {
    /// Endpoint options.
    pub options: SqlTrackerStoreOptions,
    /// Process-environment tuning.
    pub environment: SqlEnvironment,
    /// Retry policy for the connect-and-bootstrap sequence.
    pub retry: RetryPolicy,
}

impl SqlConfig {
    /// Configuration with default environment and retry policy.
    pub fn new(options: SqlTrackerStoreOptions) -> Self {
        Self {
            options,
            environment: SqlEnvironment::default(),
            retry: RetryPolicy::default(),
        }
    }

    /// Replace the environment tuning.
    #[must_use]
    pub fn with_environment(mut self, environment: SqlEnvironment) -> Self {
        self.environment = environment;
        self
    }

    /// Replace the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Tracker store persisting one row per event.
pub struct SqlTrackerStore {
    context: StoreContext,
    pool: AnyPool,
    dialect: Dialect,
    table: EventsTable,
    schema: Option<String>,
    full_history_retrieve: bool,
}

impl SqlTrackerStore {
    /// Connect, create the target database if asked to, and create the
    /// events table.
    ///
    /// The whole sequence is retried under the configured policy while
    /// the database is unreachable.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`] for invalid options, or the first
    /// error the retry policy gives up on.
    pub async fn connect(
        config: &SqlConfig,
        domain: Option<Arc<Domain>>,
        event_broker: Option<Arc<dyn EventBroker>>,
    ) -> Result<Self, StoreError> {
        INSTALL_DRIVERS.call_once(sqlx::any::install_default_drivers);

        let options = &config.options;
        let environment = &config.environment;
        let url = &DatabaseUrl::build(options.dialect()?, options.url_parts())?;
        let dialect = url.dialect();
        let database = &options.database(dialect);
        let table = &options
            .table
            .as_deref()
            .map_or_else(|| Ok(EventsTable::default()), EventsTable::new)?;
        let schema = match dialect {
            Dialect::Postgresql => environment.schema.clone(),
            Dialect::Sqlite => None,
        };
        let schema_ref = schema.as_deref();

        debug!(url = %url.redacted(database), "attempting to connect to database");

        let pool = config
            .retry
            .run(move |attempt| async move {
                if let Some(login_db) = options.login_db.as_deref() {
                    create_database_if_missing(url, login_db, database).await?;
                }
                let pool = open_pool(url, database, schema_ref, environment).await?;
                create_tables(&pool, dialect, table).await?;
                debug!(attempt = attempt, "connection to SQL database successful");
                Ok::<_, StoreError>(pool)
            })
            .await?;

        let full_history_retrieve = options.retrieve_events_from_previous_conversation_sessions;
        if full_history_retrieve {
            warn!(
                "The option `retrieve_events_from_previous_conversation_sessions` is \
                 deprecated and will be removed in a future release. Use \
                 `retrieve_full` to load the events of all conversation sessions."
            );
        }

        info!(dialect = %dialect, table = table.name(), "SQL tracker store ready");

        Ok(Self {
            context: StoreContext::new(domain, event_broker),
            pool,
            dialect,
            table: table.clone(),
            schema,
            full_history_retrieve,
        })
    }

    /// The underlying connection pool.
    pub const fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// Dialect of the connected database.
    pub const fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// The events table.
    pub const fn table(&self) -> &EventsTable {
        &self.table
    }

    /// Close every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
        debug!("SQL connection pool closed");
    }

    /// Fail when the configured schema is gone.
    async fn ensure_schema_exists(&self, conn: &mut AnyConnection) -> Result<(), StoreError> {
        let Some(schema) = self.schema.as_deref() else {
            return Ok(());
        };
        let found: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM information_schema.schemata \
             WHERE CAST(schema_name AS TEXT) = $1",
        )
        .bind(schema)
        .fetch_one(&mut *conn)
        .await?;
        if found == 0 {
            return Err(StoreError::SchemaMissing {
                schema: schema.to_owned(),
            });
        }
        Ok(())
    }

    /// A pooled connection for reads.
    async fn session(&self) -> Result<sqlx::pool::PoolConnection<Any>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        self.ensure_schema_exists(&mut conn).await?;
        Ok(conn)
    }

    /// A transaction for writes; dropping it uncommitted rolls back.
    async fn transaction(&self) -> Result<Transaction<'static, Any>, StoreError> {
        let mut tx = self.pool.begin().await?;
        self.ensure_schema_exists(&mut tx).await?;
        Ok(tx)
    }

    async fn retrieve_events(
        &self,
        sender_id: &str,
        full_history: bool,
    ) -> Result<Vec<Event>, StoreError> {
        let sql = self.table.select_events_sql(full_history);
        let mut conn = self.session().await?;
        let rows: Vec<String> = conversation_query(&sql, sender_id, full_history)
            .fetch_all(&mut *conn)
            .await?;
        rows.iter()
            .map(|data| serde_json::from_str(data).map_err(StoreError::from))
            .collect()
    }

    async fn retrieve_tracker(
        &self,
        sender_id: &str,
        full_history: bool,
    ) -> Result<Option<Tracker>, StoreError> {
        let events = self.retrieve_events(sender_id, full_history).await?;
        let Some(domain) = self.domain() else {
            debug!(sender_id = sender_id, "no domain set, cannot recreate tracker");
            return Ok(None);
        };
        if events.is_empty() {
            debug!(sender_id = sender_id, "could not find tracker for conversation ID");
            return Ok(None);
        }
        debug!(sender_id = sender_id, count = events.len(), "recreating tracker from events");
        Ok(Some(Tracker::from_events(
            sender_id,
            events,
            domain.initial_slots(),
        )))
    }

    async fn count_events(
        &self,
        conn: &mut AnyConnection,
        sender_id: &str,
    ) -> Result<usize, StoreError> {
        let sql = self.table.count_events_sql(self.full_history_retrieve);
        let count: i64 = conversation_query(&sql, sender_id, self.full_history_retrieve)
            .fetch_one(&mut *conn)
            .await?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// Newest stored timestamp of a conversation.
    ///
    /// An unreadable value is logged and ignored.
    async fn latest_timestamp(
        &self,
        conn: &mut AnyConnection,
        sender_id: &str,
    ) -> Result<Option<NaiveDateTime>, StoreError> {
        let sql = self.table.max_timestamp_sql();
        let latest: Option<String> = sqlx::query_scalar(&sql)
            .bind(sender_id)
            .fetch_one(&mut *conn)
            .await?;
        Ok(latest.and_then(|text| {
            let parsed = parse_timestamp(&text);
            if parsed.is_none() {
                warn!(sender_id = sender_id, timestamp = %text, "unreadable stored timestamp");
            }
            parsed
        }))
    }

    /// Insert one row inside its own savepoint.
    ///
    /// A unique-key conflict rolls back only this row.
    async fn insert_event(
        &self,
        tx: &mut Transaction<'static, Any>,
        sender_id: &str,
        event: &Event,
        timestamp: NaiveDateTime,
    ) -> Result<(), StoreError> {
        let sql = self.table.insert_sql(self.dialect);
        let data = serde_json::to_string(event)?;
        let mut savepoint = Acquire::begin(&mut *tx).await?;
        let inserted = sqlx::query(&sql)
            .bind(sender_id)
            .bind(event.type_name())
            .bind(format_timestamp(timestamp))
            .bind(event.intent_name())
            .bind(event.action_name())
            .bind(data)
            .execute(&mut *savepoint)
            .await;

        match inserted {
            Ok(_) => savepoint.commit().await?,
            Err(e) if is_unique_violation(&e) => {
                error!(
                    sender_id = sender_id,
                    event = event.type_name(),
                    error = %e,
                    "skipping event that conflicts with a stored row"
                );
                savepoint.rollback().await?;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}

#[async_trait]
impl TrackerStore for SqlTrackerStore {
    fn name(&self) -> &'static str {
        "SqlTrackerStore"
    }

    fn context(&self) -> &StoreContext {
        &self.context
    }

    async fn save(&self, tracker: &Tracker) -> Result<(), StoreError> {
        let sender_id = tracker.sender_id();
        let mut tx = self.transaction().await?;
        let existing = self.count_events(&mut tx, sender_id).await?;
        let new_events: Vec<&Event> = tracker.events().iter().skip(existing).collect();

        let latest = if new_events.is_empty() {
            None
        } else {
            self.latest_timestamp(&mut tx, sender_id).await?
        };
        let mut clock = BatchClock::starting_after(latest);
        for event in &new_events {
            self.insert_event(&mut tx, sender_id, event, clock.next()).await?;
        }
        tx.commit().await?;
        debug!(
            sender_id = sender_id,
            count = new_events.len(),
            "tracker saved to SQL store"
        );

        if let Some(broker) = self.event_broker() {
            publish_events(broker.as_ref(), sender_id, new_events.into_iter()).await?;
        }
        Ok(())
    }

    async fn retrieve(&self, sender_id: &str) -> Result<Option<Tracker>, StoreError> {
        self.retrieve_tracker(sender_id, self.full_history_retrieve)
            .await
    }

    async fn retrieve_full(&self, sender_id: &str) -> Result<Option<Tracker>, StoreError> {
        self.retrieve_tracker(sender_id, true).await
    }

    async fn keys(&self) -> Result<BTreeSet<String>, StoreError> {
        let sql = self.table.select_sender_ids_sql();
        let mut conn = self.session().await?;
        let ids: Vec<String> = sqlx::query_scalar(&sql).fetch_all(&mut *conn).await?;
        Ok(ids.into_iter().collect())
    }

    async fn exists(&self, sender_id: &str) -> Result<bool, StoreError> {
        let sql = self.table.count_events_sql(true);
        let mut conn = self.session().await?;
        let count: i64 = conversation_query(&sql, sender_id, true)
            .fetch_one(&mut *conn)
            .await?;
        Ok(count > 0)
    }
}

/// Bind the conversation filter of [`EventsTable`] queries.
fn conversation_query<'q, O>(
    sql: &'q str,
    sender_id: &'q str,
    full_history: bool,
) -> QueryScalar<'q, Any, O, AnyArguments<'q>>
where
    (O,): for<'r> FromRow<'r, AnyRow>,
{
    let query = sqlx::query_scalar(sql).bind(sender_id);
    if full_history {
        query
    } else {
        query.bind(sender_id).bind(SESSION_STARTED)
    }
}

/// Issues strictly increasing UTC timestamps with microsecond precision.
#[derive(Debug, Default)]
struct BatchClock {
    last: Option<NaiveDateTime>,
}

impl BatchClock {
    /// A clock whose first stamp is later than `last`.
    const fn starting_after(last: Option<NaiveDateTime>) -> Self {
        Self { last }
    }

    fn next(&mut self) -> NaiveDateTime {
        let now = Utc::now().naive_utc().trunc_subsecs(6);
        let stamp = match self.last {
            Some(last) if now <= last => last
                .checked_add_signed(TimeDelta::microseconds(1))
                .unwrap_or(now),
            _ => now,
        };
        self.last = Some(stamp);
        stamp
    }
}

async fn open_pool(
    url: &DatabaseUrl,
    database: &str,
    schema: Option<&str>,
    environment: &SqlEnvironment,
) -> Result<AnyPool, StoreError> {
    let connect_url = url.to_url(database, schema)?;
    let pool_options = match url.dialect() {
        Dialect::Postgresql => {
            AnyPoolOptions::new().max_connections(environment.max_connections())
        }
        // An in-memory database lives exactly as long as its connection.
        Dialect::Sqlite if connect_url.contains(SQLITE_MEMORY_DB) => AnyPoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None),
        Dialect::Sqlite => AnyPoolOptions::new(),
    };
    Ok(pool_options.connect(&connect_url).await?)
}

/// Create `database` through a connection to `login_db` if it is missing.
async fn create_database_if_missing(
    url: &DatabaseUrl,
    login_db: &str,
    database: &str,
) -> Result<(), StoreError> {
    if url.dialect() != Dialect::Postgresql || url.is_verbatim() {
        warn!(
            dialect = %url.dialect(),
            "`login_db` is only supported for PostgreSQL connections built from parts, ignoring it"
        );
        return Ok(());
    }
    validate_identifier(database)?;

    let login_pool = AnyPoolOptions::new()
        .max_connections(1)
        .connect(&url.to_url(login_db, None)?)
        .await?;
    let result = create_database(&login_pool, database).await;
    login_pool.close().await;
    result
}

async fn create_database(login_pool: &AnyPool, database: &str) -> Result<(), StoreError> {
    let found: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM pg_catalog.pg_database WHERE CAST(datname AS TEXT) = $1",
    )
    .bind(database)
    .fetch_one(login_pool)
    .await?;
    if found > 0 {
        return Ok(());
    }

    match sqlx::query(&format!("CREATE DATABASE \"{database}\""))
        .execute(login_pool)
        .await
        .map_err(StoreError::from)
    {
        Ok(_) => {
            info!(database = database, "database created");
            Ok(())
        }
        Err(e) if e.is_connection() => Err(e),
        Err(e) => {
            error!(database = database, error = %e, "could not create database");
            Ok(())
        }
    }
}

/// Run the table DDL.
///
/// Failures other than lost connectivity are logged: another instance may
/// be creating the same objects.
async fn create_tables(
    pool: &AnyPool,
    dialect: Dialect,
    table: &EventsTable,
) -> Result<(), StoreError> {
    for statement in table.create_statements(dialect) {
        if let Err(e) = sqlx::query(&statement).execute(pool).await {
            let e = StoreError::from(e);
            if e.is_connection() {
                return Err(e);
            }
            error!(table = table.name(), error = %e, "could not create tables");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::arithmetic_side_effects)]

    use super::*;

    #[test]
    fn batch_clock_is_strictly_increasing() {
        let mut clock = BatchClock::default();
        let stamps: Vec<NaiveDateTime> = (0..200).map(|_| clock.next()).collect();
        assert!(stamps.windows(2).all(|pair| pair.first() < pair.last()));
        assert!(
            stamps
                .iter()
                .all(|stamp| stamp.and_utc().timestamp_subsec_nanos() % 1000 == 0)
        );
    }

    #[test]
    fn batch_clock_starts_after_stored_rows() {
        let stored = Utc::now().naive_utc().trunc_subsecs(6) + TimeDelta::hours(1);
        let mut clock = BatchClock::starting_after(Some(stored));
        let first = clock.next();
        assert_eq!(first, stored + TimeDelta::microseconds(1));
        assert!(clock.next() > first);

        let mut fresh = BatchClock::starting_after(None);
        assert!(fresh.next() <= Utc::now().naive_utc());
    }

    #[test]
    fn options_deserialize_from_endpoint_parameters() {
        let options: SqlTrackerStoreOptions = serde_json::from_value(serde_json::json!({
            "dialect": "postgresql",
            "port": 5433,
            "db": "tracker",
            "login_db": "postgres",
            "query": {"sslmode": "disable"},
        }))
        .unwrap();
        assert_eq!(options.dialect().unwrap(), Dialect::Postgresql);
        assert_eq!(options.database(Dialect::Postgresql), "tracker");
        assert_eq!(options.url_parts().port, Some(5433));
        assert!(!options.retrieve_events_from_previous_conversation_sessions);
    }

    #[test]
    fn sqlite_is_the_default_dialect() {
        let options = SqlTrackerStoreOptions::default();
        assert_eq!(options.dialect().unwrap(), Dialect::Sqlite);
        assert_eq!(options.database(Dialect::Sqlite), DEFAULT_SQLITE_DB);
    }

    #[tokio::test]
    async fn unsupported_dialect_is_rejected_before_connecting() {
        let options = SqlTrackerStoreOptions {
            dialect: Some("oracle".to_owned()),
            ..SqlTrackerStoreOptions::default()
        };
        let result = SqlTrackerStore::connect(&SqlConfig::new(options), None, None).await;
        assert!(matches!(result, Err(StoreError::Config { .. })));
    }
}
