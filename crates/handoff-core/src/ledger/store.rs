//! `SQLite`-backed store and the ledger primitives.

// SQLite returns i64 for counts; they're always non-negative here.
// Mutex poisoning indicates a panic in another thread, which is unrecoverable.
#![allow(clippy::missing_panics_doc)]

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, OpenFlags, OptionalExtension, Transaction, params};
use thiserror::Error;

use crate::error::CoreError;
use crate::events::{Event, EventType, Producer, secrets};
use crate::projection::{self, ProjectionMode};

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Errors from the event ledger.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LedgerError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The payload or tags matched a known secret pattern.
    #[error("payload rejected: matches secret pattern {pattern}")]
    SecretInPayload {
        /// The name of the matching pattern.
        pattern: &'static str,
    },

    /// Envelope (de)serialization failed.
    #[error("event serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The shared `SQLite` store: one serialized connection, WAL mode.
///
/// All kernel state lives here — the event log and every read model. Cloning
/// is cheap; clones share the connection.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Opens or creates a store at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(LedgerError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(LedgerError::from)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Creates an in-memory store for tests and embedded use.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self, CoreError> {
        let conn = Connection::open_in_memory().map_err(LedgerError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(LedgerError::from)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` inside a transaction, committing on `Ok`.
    pub(crate) fn with_tx<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, CoreError>,
    ) -> Result<T, CoreError> {
        let mut conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.transaction().map_err(LedgerError::from)?;
        let out = f(&tx)?;
        tx.commit().map_err(LedgerError::from)?;
        Ok(out)
    }

    /// Runs `f` with the raw connection (read paths).
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, CoreError>,
    ) -> Result<T, CoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        f(&conn)
    }
}

/// The outcome of an append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Append {
    /// A new event row was written (and projected).
    Appended {
        /// The new event's id.
        event_id: String,
    },
    /// The idempotency key matched an existing event; nothing was written.
    Deduplicated {
        /// The existing event's id.
        event_id: String,
    },
}

impl Append {
    /// The id of the (new or pre-existing) event.
    #[must_use]
    pub fn event_id(&self) -> &str {
        match self {
            Self::Appended { event_id } | Self::Deduplicated { event_id } => event_id,
        }
    }

    /// `true` when the idempotency key suppressed the write.
    #[must_use]
    pub const fn is_deduplicated(&self) -> bool {
        matches!(self, Self::Deduplicated { .. })
    }
}

/// Appends an event and projects it, inside the caller's transaction.
///
/// Contract, in order:
/// 1. Scan `payload` and `tags` for secret patterns; reject on match.
/// 2. If `idempotency_key` is set and an event with that key exists, return
///    its id — no second row, no projector re-run.
/// 3. Insert the row and invoke the inline projectors.
pub(crate) fn append(
    tx: &Transaction<'_>,
    event: &Event,
    mode: &ProjectionMode<'_>,
) -> Result<Append, CoreError> {
    if let Some(pattern) = secrets::scan_value(&event.payload) {
        return Err(LedgerError::SecretInPayload { pattern }.into());
    }
    if let Some(tags) = &event.tags {
        if let Some(pattern) = tags.iter().find_map(|t| secrets::scan_str(t)) {
            return Err(LedgerError::SecretInPayload { pattern }.into());
        }
    }

    if let Some(key) = &event.idempotency_key {
        let existing: Option<String> = tx
            .query_row(
                "SELECT event_id FROM events WHERE idempotency_key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(LedgerError::from)?;
        if let Some(event_id) = existing {
            tracing::debug!(%event_id, key = %key, "append deduplicated by idempotency key");
            return Ok(Append::Deduplicated { event_id });
        }
    }

    let tags_json = event
        .tags
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(LedgerError::from)?;
    let payload_json = serde_json::to_string(&event.payload).map_err(LedgerError::from)?;

    tx.execute(
        "INSERT INTO events (event_id, tenant_id, project_id, event_type, version, ts, \
         correlation_id, causation_id, command_id, run_id, card_id, decision_id, \
         idempotency_key, producer_service, producer_version, tags, payload) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        params![
            event.event_id,
            event.tenant_id,
            event.project_id,
            event.event_type.as_str(),
            event.version,
            event.ts,
            event.correlation_id,
            event.causation_id,
            event.command_id,
            event.run_id,
            event.card_id,
            event.decision_id,
            event.idempotency_key,
            event.producer.service,
            event.producer.version,
            tags_json,
            payload_json,
        ],
    )
    .map_err(LedgerError::from)?;

    projection::apply(tx, event, mode)?;

    Ok(Append::Appended {
        event_id: event.event_id.clone(),
    })
}

const SELECT_EVENT: &str = "SELECT event_id, tenant_id, project_id, event_type, version, ts, \
     correlation_id, causation_id, command_id, run_id, card_id, decision_id, idempotency_key, \
     producer_service, producer_version, tags, payload FROM events";

pub(crate) fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let event_type: String = row.get(3)?;
    let tags: Option<String> = row.get(15)?;
    let payload: String = row.get(16)?;
    let json_err = |idx: usize, e: serde_json::Error| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    };
    Ok(Event {
        event_id: row.get(0)?,
        tenant_id: row.get(1)?,
        project_id: row.get(2)?,
        event_type: EventType::parse(&event_type).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Text,
                format!("unknown event type: {event_type}").into(),
            )
        })?,
        version: row.get(4)?,
        ts: row.get(5)?,
        correlation_id: row.get(6)?,
        causation_id: row.get(7)?,
        command_id: row.get(8)?,
        run_id: row.get(9)?,
        card_id: row.get(10)?,
        decision_id: row.get(11)?,
        idempotency_key: row.get(12)?,
        producer: Producer {
            service: row.get(13)?,
            version: row.get(14)?,
        },
        tags: tags
            .map(|t| serde_json::from_str(&t))
            .transpose()
            .map_err(|e| json_err(15, e))?,
        payload: serde_json::from_str(&payload).map_err(|e| json_err(16, e))?,
    })
}

/// Reads the chronologically ordered chain for one correlation id.
pub(crate) fn by_correlation(
    conn: &Connection,
    project_id: &str,
    correlation_id: &str,
) -> Result<Vec<Event>, CoreError> {
    let sql = format!(
        "{SELECT_EVENT} WHERE project_id = ?1 AND correlation_id = ?2 ORDER BY ts ASC, event_id ASC"
    );
    let events = conn
        .prepare(&sql)
        .map_err(LedgerError::from)?
        .query_map(params![project_id, correlation_id], row_to_event)
        .map_err(LedgerError::from)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(LedgerError::from)?;
    Ok(events)
}

/// An optional `[since, until)` time bound, in ms.
#[derive(Debug, Clone, Copy, Default)]
pub struct TsRange {
    /// Inclusive lower bound.
    pub since_ts: Option<i64>,
    /// Exclusive upper bound.
    pub until_ts: Option<i64>,
}

/// Reads events of one type across projects within a tenant.
pub(crate) fn by_type(
    conn: &Connection,
    tenant_id: &str,
    event_type: EventType,
    range: TsRange,
    limit: u32,
) -> Result<Vec<Event>, CoreError> {
    let sql = format!(
        "{SELECT_EVENT} WHERE tenant_id = ?1 AND event_type = ?2 \
         AND ts >= ?3 AND ts < ?4 ORDER BY ts ASC, event_id ASC LIMIT ?5"
    );
    let events = conn
        .prepare(&sql)
        .map_err(LedgerError::from)?
        .query_map(
            params![
                tenant_id,
                event_type.as_str(),
                range.since_ts.unwrap_or(0),
                range.until_ts.unwrap_or(i64::MAX),
                limit,
            ],
            row_to_event,
        )
        .map_err(LedgerError::from)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(LedgerError::from)?;
    Ok(events)
}

/// Reads a replay batch with a composite `(ts, event_id)` cursor.
///
/// When `after_event_id` is provided, events at `since_ts` with
/// `event_id <= after_event_id` are excluded. Ordering is
/// `(ts ASC, event_id ASC)`, enforced by the covering index.
pub(crate) fn by_ts_range(
    conn: &Connection,
    project_id: &str,
    since_ts: i64,
    until_ts: Option<i64>,
    after_event_id: Option<&str>,
    limit: u32,
) -> Result<Vec<Event>, CoreError> {
    let sql = format!(
        "{SELECT_EVENT} WHERE project_id = ?1 AND ts < ?2 \
         AND (ts > ?3 OR (ts = ?3 AND event_id > ?4)) \
         ORDER BY ts ASC, event_id ASC LIMIT ?5"
    );
    let events = conn
        .prepare(&sql)
        .map_err(LedgerError::from)?
        .query_map(
            params![
                project_id,
                until_ts.unwrap_or(i64::MAX),
                since_ts,
                // Every event id sorts above the empty string, so with no
                // cursor the predicate degenerates to ts >= since_ts.
                after_event_id.unwrap_or(""),
                limit,
            ],
            row_to_event,
        )
        .map_err(LedgerError::from)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(LedgerError::from)?;
    Ok(events)
}

