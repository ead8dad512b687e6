//! Durable SQLite event log.
//!
//! # Schema
//! One `events` table with the canonical event columns; indexes on
//! `(kind, timestamp)` and `(severity)`.
//!
//! # SQLite durability settings
//! Applied at open: WAL, synchronous=FULL, wal_autocheckpoint=1000,
//! foreign_keys=ON.  PRAGMA integrity_check runs at open; returns error if
//! it fails.
//!
//! The store is the only component allowed to fail the publish path; callers
//! treat `store` failures as log-and-continue (the live fan-out is best
//! effort, recovery goes through `replay`).

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, params};
use thiserror::Error;
use ve_protocol::{Event, EventKind, Severity};

/// Default `query` result cap when the filter does not set one.
pub const DEFAULT_QUERY_LIMIT: usize = 100;
/// Hard `query` result cap.
pub const MAX_QUERY_LIMIT: usize = 1000;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Error type for event log operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("integrity check failed: {0}")]
    IntegrityCheckFailed(String),
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid row {id}: {reason}")]
    InvalidRow { id: String, reason: String },
    #[error("replay aborted: {0}")]
    ReplayAborted(ReplayCallbackError),
}

/// Error a replay callback may return to abort the replay.
pub type ReplayCallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Conjunctive query filter.  Unset fields do not constrain the result.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub kind: Option<EventKind>,
    pub min_severity: Option<Severity>,
    pub model_id: Option<String>,
    pub provider_id: Option<String>,
    pub client_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Clamped to `1..=MAX_QUERY_LIMIT`; `DEFAULT_QUERY_LIMIT` when unset.
    pub limit: Option<usize>,
}

impl EventFilter {
    pub fn new() -> Self {
        EventFilter::default()
    }

    pub fn kind(mut self, kind: EventKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn min_severity(mut self, severity: Severity) -> Self {
        self.min_severity = Some(severity);
        self
    }

    pub fn model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    pub fn provider(mut self, provider_id: impl Into<String>) -> Self {
        self.provider_id = Some(provider_id.into());
        self
    }

    pub fn client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Aggregate counters over the whole log.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct EventLogStats {
    pub total: u64,
    pub processed: u64,
    pub critical: u64,
    pub error: u64,
    pub warning: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

/// The persistence contract the bus and publisher depend on.
///
/// Implementations must be safe for concurrent use; `SqliteEventStore`
/// serializes through an internal mutex.
pub trait EventSink: Send + Sync {
    /// Durable write.  The row is immutable apart from `processed_at`.
    fn store(&self, event: &Event) -> Result<(), StoreError>;

    /// Filtered query, newest first.
    fn query(&self, filter: &EventFilter) -> Result<Vec<Event>, StoreError>;

    fn get_by_id(&self, id: &str) -> Result<Option<Event>, StoreError>;

    /// Delete events older than `age`; returns the number deleted.
    fn delete_older_than(&self, age: Duration) -> Result<usize, StoreError>;

    fn stats(&self) -> Result<EventLogStats, StoreError>;

    /// Chronological ascending replay of events at or after `since`.
    ///
    /// `kinds` empty means all kinds.  A callback error aborts the replay
    /// and surfaces as `StoreError::ReplayAborted`.  Returns the number of
    /// events the callback accepted.
    fn replay(
        &self,
        since: DateTime<Utc>,
        kinds: &[EventKind],
        callback: &mut dyn FnMut(Event) -> Result<(), ReplayCallbackError>,
    ) -> Result<usize, StoreError>;

    /// Record the first dispatcher pass over the event.  Set once.
    fn mark_processed(&self, id: &str, when: DateTime<Utc>) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// SqliteEventStore
// ---------------------------------------------------------------------------

const SCHEMA_SQL: &str = include_str!("schema.sql");

const EVENT_COLUMNS: &str = "id, kind, severity, title, message, details_json, \
     model_id, provider_id, verification_id, issue_id, client_id, user_id, \
     source, timestamp, processed_at";

/// SQLite-backed event log.
pub struct SqliteEventStore {
    conn: Mutex<Connection>,
}

impl SqliteEventStore {
    /// Open (or create) the log at the given path.
    ///
    /// Applies PRAGMAs, runs `PRAGMA integrity_check`, and creates the
    /// schema if needed.  Returns `Err` if integrity_check fails.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        apply_pragmas(&conn)?;
        run_integrity_check(&conn)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(SqliteEventStore {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory log for tests and ephemeral deployments.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(SqliteEventStore {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("event store mutex poisoned")
    }
}

impl EventSink for SqliteEventStore {
    fn store(&self, event: &Event) -> Result<(), StoreError> {
        let details_json = serde_json::to_string(&event.details)?;
        self.lock().execute(
            "INSERT INTO events
                 (id, kind, severity, title, message, details_json,
                  model_id, provider_id, verification_id, issue_id, client_id, user_id,
                  source, timestamp, processed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                event.id,
                event.kind.as_tag(),
                event.severity.as_tag(),
                event.title,
                event.message,
                details_json,
                event.model_id,
                event.provider_id,
                event.verification_id,
                event.issue_id,
                event.client_id,
                event.user_id,
                event.source,
                encode_timestamp(event.timestamp),
                event.processed_at.map(encode_timestamp),
            ],
        )?;
        Ok(())
    }

    fn query(&self, filter: &EventFilter) -> Result<Vec<Event>, StoreError> {
        let mut sql = format!("SELECT {EVENT_COLUMNS} FROM events");
        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(kind) = filter.kind {
            clauses.push("kind = ?".to_owned());
            params.push(Box::new(kind.as_tag().to_owned()));
        }
        if let Some(min) = filter.min_severity {
            clauses.push(severity_in_clause(min));
        }
        if let Some(model_id) = &filter.model_id {
            clauses.push("model_id = ?".to_owned());
            params.push(Box::new(model_id.clone()));
        }
        if let Some(provider_id) = &filter.provider_id {
            clauses.push("provider_id = ?".to_owned());
            params.push(Box::new(provider_id.clone()));
        }
        if let Some(client_id) = &filter.client_id {
            clauses.push("client_id = ?".to_owned());
            params.push(Box::new(client_id.clone()));
        }
        if let Some(since) = filter.since {
            clauses.push("timestamp >= ?".to_owned());
            params.push(Box::new(encode_timestamp(since)));
        }
        if let Some(until) = filter.until {
            clauses.push("timestamp <= ?".to_owned());
            params.push(Box::new(encode_timestamp(until)));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY timestamp DESC LIMIT ?");
        let limit = filter
            .limit
            .unwrap_or(DEFAULT_QUERY_LIMIT)
            .clamp(1, MAX_QUERY_LIMIT);
        params.push(Box::new(limit as i64));

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(params.iter().map(|p| &**p)),
            map_raw_event,
        )?;
        let mut events = Vec::new();
        for row in rows {
            events.push(decode_event(row?)?);
        }
        Ok(events)
    }

    fn get_by_id(&self, id: &str) -> Result<Option<Event>, StoreError> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare(&format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1"))?;
        let mut rows = stmt.query_map(params![id], map_raw_event)?;
        match rows.next() {
            Some(row) => Ok(Some(decode_event(row?)?)),
            None => Ok(None),
        }
    }

    fn delete_older_than(&self, age: Duration) -> Result<usize, StoreError> {
        // An age outside chrono's range, or one that would underflow the
        // clock, matches nothing instead of panicking.
        let cutoff = chrono::Duration::from_std(age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        let deleted = self.lock().execute(
            "DELETE FROM events WHERE timestamp < ?1",
            params![encode_timestamp(cutoff)],
        )?;
        Ok(deleted)
    }

    fn stats(&self) -> Result<EventLogStats, StoreError> {
        let conn = self.lock();
        let (total, processed, critical, error, warning, oldest, newest) = conn.query_row(
            "SELECT COUNT(*),
                    COUNT(processed_at),
                    SUM(CASE WHEN severity = 'critical' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN severity = 'error' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN severity = 'warning' THEN 1 ELSE 0 END),
                    MIN(timestamp),
                    MAX(timestamp)
             FROM events",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                ))
            },
        )?;
        Ok(EventLogStats {
            total: total.max(0) as u64,
            processed: processed.max(0) as u64,
            critical: critical.unwrap_or(0).max(0) as u64,
            error: error.unwrap_or(0).max(0) as u64,
            warning: warning.unwrap_or(0).max(0) as u64,
            oldest: oldest.map(|t| decode_timestamp("", &t)).transpose()?,
            newest: newest.map(|t| decode_timestamp("", &t)).transpose()?,
        })
    }

    fn replay(
        &self,
        since: DateTime<Utc>,
        kinds: &[EventKind],
        callback: &mut dyn FnMut(Event) -> Result<(), ReplayCallbackError>,
    ) -> Result<usize, StoreError> {
        let mut sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE timestamp >= ?1");
        if !kinds.is_empty() {
            let tags: Vec<String> = kinds.iter().map(|k| format!("'{}'", k.as_tag())).collect();
            sql.push_str(&format!(" AND kind IN ({})", tags.join(", ")));
        }
        sql.push_str(" ORDER BY timestamp ASC");

        // Collect under the lock, then run the callback without it: the
        // callback may publish, which can re-enter the store.
        let events = {
            let conn = self.lock();
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![encode_timestamp(since)], map_raw_event)?;
            let mut events = Vec::new();
            for row in rows {
                events.push(decode_event(row?)?);
            }
            events
        };

        let mut replayed = 0;
        for event in events {
            callback(event).map_err(StoreError::ReplayAborted)?;
            replayed += 1;
        }
        Ok(replayed)
    }

    fn mark_processed(&self, id: &str, when: DateTime<Utc>) -> Result<(), StoreError> {
        self.lock().execute(
            "UPDATE events SET processed_at = ?2 WHERE id = ?1 AND processed_at IS NULL",
            params![id, encode_timestamp(when)],
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

struct RawEventRow {
    id: String,
    kind: String,
    severity: String,
    title: String,
    message: String,
    details_json: String,
    model_id: Option<String>,
    provider_id: Option<String>,
    verification_id: Option<String>,
    issue_id: Option<String>,
    client_id: Option<String>,
    user_id: Option<String>,
    source: String,
    timestamp: String,
    processed_at: Option<String>,
}

fn map_raw_event(row: &rusqlite::Row<'_>) -> Result<RawEventRow, rusqlite::Error> {
    Ok(RawEventRow {
        id: row.get(0)?,
        kind: row.get(1)?,
        severity: row.get(2)?,
        title: row.get(3)?,
        message: row.get(4)?,
        details_json: row.get(5)?,
        model_id: row.get(6)?,
        provider_id: row.get(7)?,
        verification_id: row.get(8)?,
        issue_id: row.get(9)?,
        client_id: row.get(10)?,
        user_id: row.get(11)?,
        source: row.get(12)?,
        timestamp: row.get(13)?,
        processed_at: row.get(14)?,
    })
}

fn decode_event(raw: RawEventRow) -> Result<Event, StoreError> {
    let kind: EventKind = raw.kind.parse().map_err(|_| StoreError::InvalidRow {
        id: raw.id.clone(),
        reason: format!("unknown kind '{}'", raw.kind),
    })?;
    let severity: Severity = raw.severity.parse().map_err(|_| StoreError::InvalidRow {
        id: raw.id.clone(),
        reason: format!("unknown severity '{}'", raw.severity),
    })?;
    let details = serde_json::from_str(&raw.details_json).map_err(|e| StoreError::InvalidRow {
        id: raw.id.clone(),
        reason: format!("details: {e}"),
    })?;
    let timestamp = decode_timestamp(&raw.id, &raw.timestamp)?;
    let processed_at = raw
        .processed_at
        .map(|t| decode_timestamp(&raw.id, &t))
        .transpose()?;
    Ok(Event {
        id: raw.id,
        kind,
        severity,
        title: raw.title,
        message: raw.message,
        details,
        model_id: raw.model_id,
        provider_id: raw.provider_id,
        verification_id: raw.verification_id,
        issue_id: raw.issue_id,
        client_id: raw.client_id,
        user_id: raw.user_id,
        source: raw.source,
        timestamp,
        processed_at,
    })
}

fn encode_timestamp(ts: DateTime<Utc>) -> String {
    // Fixed nanosecond precision keeps TEXT ordering chronological.
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn decode_timestamp(id: &str, text: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidRow {
            id: id.to_owned(),
            reason: format!("timestamp '{text}': {e}"),
        })
}

/// `severity >= min` as a SQL clause over the text column, so the
/// `(severity)` index stays usable.
fn severity_in_clause(min: Severity) -> String {
    let tags: Vec<String> = [
        Severity::Debug,
        Severity::Info,
        Severity::Warning,
        Severity::Error,
        Severity::Critical,
    ]
    .into_iter()
    .filter(|s| *s >= min)
    .map(|s| format!("'{}'", s.as_tag()))
    .collect();
    format!("severity IN ({})", tags.join(", "))
}

fn apply_pragmas(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=FULL;
         PRAGMA wal_autocheckpoint=1000;
         PRAGMA foreign_keys=ON;",
    )?;
    Ok(())
}

fn run_integrity_check(conn: &Connection) -> Result<(), StoreError> {
    let result: String = conn.pragma_query_value(None, "integrity_check", |row| row.get(0))?;
    if result != "ok" {
        return Err(StoreError::IntegrityCheckFailed(result));
    }
    Ok(())
}
