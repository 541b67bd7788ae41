//! Replay engine.
//!
//! Rebuilds a named read model from the event log using the composite
//! `(ts, event_id)` cursor, invoking the same projector functions as the
//! live write path with side effects suppressed. Projector idempotence is
//! the load-bearing invariant: replaying any contiguous slice into an empty
//! model produces the same rows as live application. Replay never mutates
//! the log.
//!
//! When events older than the retention window are needed, the engine first
//! applies NDJSON archive files (checksum-validated, chronological order),
//! then drains the live store from where the archives end.

pub mod archive;


pub use archive::ArchiveError;

use std::path::Path;

use rusqlite::params;
use serde::Serialize;

use crate::core::Core;
use crate::error::CoreError;
use crate::events::{EventType, Scope, payloads};
use crate::ledger;
use crate::projection::{self, ProjectionMode};

pub use crate::projection::ReadModel;

/// Counters from one rebuild.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RebuildReport {
    /// Events applied from archive files.
    pub archived_events: u64,
    /// Events applied from the live store.
    pub live_events: u64,
}

/// One detected divergence between a read model and the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriftFinding {
    /// The read model that diverged.
    pub model: ReadModel,
    /// What diverged.
    pub detail: String,
}

impl Core {
    /// Rebuilds one read model for a project from the live event store.
    ///
    /// Truncates the model's rows for the project, then streams the
    /// project's events in `(ts, event_id)` order, applying the projector
    /// with replay mode (no job enqueues, no wakes). One transaction: a
    /// failed rebuild leaves the previous rows intact.
    ///
    /// # Errors
    ///
    /// Returns an error when a query or a projector application fails.
    pub fn rebuild_model(
        &self,
        scope: &Scope,
        model: ReadModel,
    ) -> Result<RebuildReport, CoreError> {
        let batch_size = self.config().replay_batch_size;
        self.store().with_tx(|tx| {
            truncate_model(tx, scope, model)?;
            let live_events = apply_live_events(tx, scope, model, 0, None, batch_size)?;
            tracing::info!(model = model.table(), live_events, "read model rebuilt");
            Ok(RebuildReport {
                archived_events: 0,
                live_events,
            })
        })
    }

    /// Rebuilds one read model from archived files plus the live store.
    ///
    /// Archive files for the scope are applied in chronological order after
    /// checksum validation; the live store is then drained from the last
    /// archived `(ts, event_id)` cursor onward.
    ///
    /// # Errors
    ///
    /// Returns archive validation errors, query errors, or projector
    /// failures.
    pub fn rebuild_model_from_archive(
        &self,
        scope: &Scope,
        model: ReadModel,
        archive_dir: &Path,
    ) -> Result<RebuildReport, CoreError> {
        let batch_size = self.config().replay_batch_size;
        let files = archive::list_files(archive_dir, scope)?;
        self.store().with_tx(|tx| {
            truncate_model(tx, scope, model)?;

            let mut archived_events = 0u64;
            let mut cursor: Option<(i64, String)> = None;
            for path in &files {
                for event in archive::read_file(path)? {
                    if event.tenant_id != scope.tenant_id || event.project_id != scope.project_id {
                        continue;
                    }
                    projection::apply_model(tx, &event, model)?;
                    archived_events += 1;
                    cursor = Some((event.ts, event.event_id.clone()));
                }
            }

            let (since_ts, after_event_id) = cursor
                .as_ref()
                .map_or((0, None), |(ts, id)| (*ts, Some(id.as_str())));
            let live_events =
                apply_live_events(tx, scope, model, since_ts, after_event_id, batch_size)?;
            tracing::info!(
                model = model.table(),
                archived_events,
                live_events,
                "read model rebuilt from archive"
            );
            Ok(RebuildReport {
                archived_events,
                live_events,
            })
        })
    }

    /// Exports one day of a project's events as an archive file.
    ///
    /// `date` is `YYYY-MM-DD` (UTC). Returns the path, or `None` when the
    /// day has no events.
    ///
    /// # Errors
    ///
    /// Returns an error on query or filesystem failure.
    pub fn write_archive(
        &self,
        scope: &Scope,
        date: &str,
        dir: &Path,
    ) -> Result<Option<std::path::PathBuf>, CoreError> {
        let day_start = chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .map_err(|e| CoreError::InvalidEncoding {
                detail: format!("bad archive date {date}: {e}"),
            })?
            .and_hms_opt(0, 0, 0)
            .map_or(0, |dt| dt.and_utc().timestamp_millis());
        let day_end = day_start + 24 * 60 * 60 * 1000;

        let events = self.store().with_conn(|conn| {
            let mut all = Vec::new();
            let mut cursor: Option<(i64, String)> = None;
            loop {
                let (since, after) = cursor
                    .as_ref()
                    .map_or((day_start, None), |(ts, id)| (*ts, Some(id.as_str())));
                let batch = ledger::by_ts_range(
                    conn,
                    &scope.project_id,
                    since,
                    Some(day_end),
                    after,
                    self.config().replay_batch_size,
                )?;
                if batch.is_empty() {
                    break;
                }
                cursor = batch.last().map(|e| (e.ts, e.event_id.clone()));
                all.extend(batch);
            }
            Ok(all)
        })?;

        if events.is_empty() {
            return Ok(None);
        }
        let path = archive::write_file(dir, scope, date, &events)?;
        tracing::info!(path = %path.display(), events = events.len(), "archive written");
        Ok(Some(path))
    }

    /// Checks event-derived invariants against the live read models and
    /// appends a `ReconciliationDrift` event per divergence found.
    ///
    /// # Errors
    ///
    /// Returns an error when a query fails; an empty result means no drift.
    pub fn reconcile(&self, scope: &Scope) -> Result<Vec<DriftFinding>, CoreError> {
        let mut findings = Vec::new();

        self.store().with_conn(|conn| {
            // Every admitted command must have a row.
            let requested: i64 = conn.query_row(
                "SELECT COUNT(DISTINCT command_id) FROM events \
                 WHERE project_id = ?1 AND event_type = 'CommandRequested'",
                params![scope.project_id],
                |row| row.get(0),
            )?;
            let command_rows: i64 = conn.query_row(
                "SELECT COUNT(*) FROM commands WHERE project_id = ?1",
                params![scope.project_id],
                |row| row.get(0),
            )?;
            if requested != command_rows {
                findings.push(DriftFinding {
                    model: ReadModel::Commands,
                    detail: format!(
                        "{requested} distinct CommandRequested events but {command_rows} command rows"
                    ),
                });
            }

            // At most one DecisionRendered per decision, and RENDERED rows
            // must match rendered decisions in the log.
            let over_rendered: i64 = conn.query_row(
                "SELECT COUNT(*) FROM (SELECT decision_id FROM events \
                 WHERE project_id = ?1 AND event_type = 'DecisionRendered' \
                 GROUP BY decision_id HAVING COUNT(*) > 1)",
                params![scope.project_id],
                |row| row.get(0),
            )?;
            if over_rendered > 0 {
                findings.push(DriftFinding {
                    model: ReadModel::Decisions,
                    detail: format!(
                        "{over_rendered} decisions have more than one DecisionRendered event"
                    ),
                });
            }
            let rendered_events: i64 = conn.query_row(
                "SELECT COUNT(DISTINCT decision_id) FROM events \
                 WHERE project_id = ?1 AND event_type = 'DecisionRendered'",
                params![scope.project_id],
                |row| row.get(0),
            )?;
            let rendered_rows: i64 = conn.query_row(
                "SELECT COUNT(*) FROM decisions WHERE project_id = ?1 AND state = 'RENDERED'",
                params![scope.project_id],
                |row| row.get(0),
            )?;
            if rendered_events != rendered_rows {
                findings.push(DriftFinding {
                    model: ReadModel::Decisions,
                    detail: format!(
                        "{rendered_events} decisions rendered in the log but {rendered_rows} \
                         RENDERED rows"
                    ),
                });
            }

            // A card's attempt equals its count of transitions into RUNNING.
            let attempt_drift: i64 = conn.query_row(
                "SELECT COUNT(*) FROM cards c WHERE c.project_id = ?1 AND c.attempt != \
                 (SELECT COUNT(*) FROM events e WHERE e.card_id = c.card_id \
                  AND e.event_type = 'CardTransitioned' \
                  AND json_extract(e.payload, '$.to') = 'RUNNING')",
                params![scope.project_id],
                |row| row.get(0),
            )?;
            if attempt_drift > 0 {
                findings.push(DriftFinding {
                    model: ReadModel::Cards,
                    detail: format!(
                        "{attempt_drift} cards whose attempt differs from their RUNNING \
                         transition count"
                    ),
                });
            }
            Ok(())
        })?;

        for finding in &findings {
            tracing::warn!(
                model = finding.model.table(),
                detail = %finding.detail,
                "reconciliation drift"
            );
            self.store().with_tx(|tx| {
                let event = self.event(
                    scope,
                    EventType::ReconciliationDrift,
                    scope.project_id.clone(),
                    serde_json::to_value(payloads::ReconciliationDrift {
                        model: finding.model.table().to_string(),
                        detail: finding.detail.clone(),
                    })?,
                );
                self.append_live(tx, &event)?;
                Ok(())
            })?;
        }
        Ok(findings)
    }
}

fn truncate_model(
    tx: &rusqlite::Transaction<'_>,
    scope: &Scope,
    model: ReadModel,
) -> Result<(), CoreError> {
    tx.execute(
        &format!(
            "DELETE FROM {} WHERE tenant_id = ?1 AND project_id = ?2",
            model.table()
        ),
        params![scope.tenant_id, scope.project_id],
    )?;
    Ok(())
}

fn apply_live_events(
    tx: &rusqlite::Transaction<'_>,
    scope: &Scope,
    model: ReadModel,
    since_ts: i64,
    after_event_id: Option<&str>,
    batch_size: u32,
) -> Result<u64, CoreError> {
    let mut applied = 0u64;
    let mut cursor = after_event_id.map(|id| (since_ts, id.to_string()));
    loop {
        let (since, after) = cursor
            .as_ref()
            .map_or((since_ts, None), |(ts, id)| (*ts, Some(id.as_str())));
        let batch = ledger::by_ts_range(tx, &scope.project_id, since, None, after, batch_size)?;
        if batch.is_empty() {
            break;
        }
        for event in &batch {
            projection::apply_model(tx, event, model)?;
            applied += 1;
        }
        cursor = batch.last().map(|e| (e.ts, e.event_id.clone()));
    }
    Ok(applied)
}
