//! Idempotent projectors mapping events to read-model mutations.
//!
//! Projectors run inline, in the same transaction as the append — that is
//! what makes the read models read-your-writes visible and the decision
//! render CAS correct without external locks. The replay engine invokes the
//! same functions standalone with [`ProjectionMode::Replay`], which
//! suppresses the side-effectful behavior (job enqueues, decision wakes).
//!
//! # Idempotence
//!
//! Applying the same event twice must produce the same row state. Inserts
//! use `INSERT OR IGNORE`; updates carry a `last_event_id < ?event` guard,
//! so a live event at or below the row's high-water mark is a no-op. Event
//! ids are monotonic (see [`crate::ids`]), which makes the guard a plain
//! string comparison.


use rusqlite::{Transaction, params};

use crate::card::CardState;
use crate::error::CoreError;
use crate::events::{Event, EventType, payloads};
use crate::jobs::{JobQueue, JobRequest, WakeOutcome};
use crate::ledger::LedgerError;

/// How a projection pass is being driven.
pub enum ProjectionMode<'a> {
    /// Live write path: side effects (job enqueues, wakes) are emitted.
    Live {
        /// The job primitive receiving the effects.
        jobs: &'a dyn JobQueue,
    },
    /// Replay rebuild: side effects are suppressed.
    Replay,
}

/// A named read model the replay engine can rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadModel {
    /// The `commands` table.
    Commands,
    /// The `runs` table.
    Runs,
    /// The `cards` table.
    Cards,
    /// The `decisions` table.
    Decisions,
    /// The `artifacts` table.
    Artifacts,
}

impl ReadModel {
    /// The backing table name.
    #[must_use]
    pub const fn table(self) -> &'static str {
        match self {
            Self::Commands => "commands",
            Self::Runs => "runs",
            Self::Cards => "cards",
            Self::Decisions => "decisions",
            Self::Artifacts => "artifacts",
        }
    }
}

impl serde::Serialize for ReadModel {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.table())
    }
}

/// Applies an event to every read model, then emits live effects.
pub(crate) fn apply(
    tx: &Transaction<'_>,
    event: &Event,
    mode: &ProjectionMode<'_>,
) -> Result<(), CoreError> {
    for model in [
        ReadModel::Commands,
        ReadModel::Runs,
        ReadModel::Cards,
        ReadModel::Decisions,
        ReadModel::Artifacts,
    ] {
        apply_model(tx, event, model)?;
    }
    if let ProjectionMode::Live { jobs } = mode {
        emit_effects(event, *jobs)?;
    }
    Ok(())
}

/// Applies an event to a single read model (replay entry point).
pub(crate) fn apply_model(
    tx: &Transaction<'_>,
    event: &Event,
    model: ReadModel,
) -> Result<(), CoreError> {
    match model {
        ReadModel::Commands => project_commands(tx, event),
        ReadModel::Runs => project_runs(tx, event),
        ReadModel::Cards => project_cards(tx, event),
        ReadModel::Decisions => project_decisions(tx, event),
        ReadModel::Artifacts => project_artifacts(tx, event),
    }
}

/// Live side effects: dispatch enqueue on admission, decision wakes on
/// render/expiry. Replay never reaches this.
fn emit_effects(event: &Event, jobs: &dyn JobQueue) -> Result<(), CoreError> {
    match event.event_type {
        EventType::CommandRequested => {
            let payload: payloads::CommandRequested =
                serde_json::from_value(event.payload.clone())?;
            let pool = payload
                .spec
                .constraints
                .as_ref()
                .and_then(|c| c.concurrency_key.clone())
                .unwrap_or_else(|| event.project_id.clone());
            jobs.enqueue(JobRequest {
                name: "card.dispatch".to_string(),
                pool,
                payload: serde_json::json!({
                    "tenant_id": event.tenant_id,
                    "project_id": event.project_id,
                    "card_id": payload.card_id,
                    "command_id": payload.command_id,
                }),
            });
        }
        EventType::DecisionRendered => {
            if let Some(decision_id) = &event.decision_id {
                let payload: payloads::DecisionRendered =
                    serde_json::from_value(event.payload.clone())?;
                jobs.wake(decision_id, WakeOutcome::Rendered {
                    option: payload.selected_option,
                });
            }
        }
        EventType::DecisionExpired => {
            // With a fallback the DecisionRendered that follows in the same
            // transaction carries the wake; without one this is the signal.
            let payload: payloads::DecisionExpired = serde_json::from_value(event.payload.clone())?;
            if !payload.had_fallback {
                if let Some(decision_id) = &event.decision_id {
                    jobs.wake(decision_id, WakeOutcome::Expired { fallback: None });
                }
            }
        }
        _ => {}
    }
    Ok(())
}

fn project_commands(tx: &Transaction<'_>, event: &Event) -> Result<(), CoreError> {
    match event.event_type {
        EventType::CommandRequested => {
            let payload: payloads::CommandRequested =
                serde_json::from_value(event.payload.clone())?;
            tx.execute(
                "INSERT INTO commands (command_id, tenant_id, project_id, status, latest_run_id, \
                 priority, spec, updated_ts, last_event_id) \
                 VALUES (?1, ?2, ?3, 'PENDING', NULL, ?4, ?5, ?6, ?7) \
                 ON CONFLICT (command_id) DO NOTHING",
                params![
                    payload.command_id,
                    event.tenant_id,
                    event.project_id,
                    payload.priority,
                    serde_json::to_string(&payload.spec)?,
                    event.ts,
                    event.event_id,
                ],
            )
            .map_err(LedgerError::from)?;
        }
        EventType::CommandStarted => {
            let payload: payloads::CommandStarted = serde_json::from_value(event.payload.clone())?;
            let Some(command_id) = &event.command_id else {
                return Ok(());
            };
            tx.execute(
                "UPDATE commands SET status = 'RUNNING', latest_run_id = ?1, updated_ts = ?2, \
                 last_event_id = ?3 WHERE command_id = ?4 AND last_event_id < ?3",
                params![payload.run_id, event.ts, event.event_id, command_id],
            )
            .map_err(LedgerError::from)?;
        }
        EventType::CommandSucceeded | EventType::CommandFailed | EventType::CommandCanceled => {
            let Some(command_id) = &event.command_id else {
                return Ok(());
            };
            let status = match event.event_type {
                EventType::CommandSucceeded => "SUCCEEDED",
                EventType::CommandFailed => "FAILED",
                _ => "CANCELED",
            };
            tx.execute(
                "UPDATE commands SET status = ?1, updated_ts = ?2, last_event_id = ?3 \
                 WHERE command_id = ?4 AND last_event_id < ?3",
                params![status, event.ts, event.event_id, command_id],
            )
            .map_err(LedgerError::from)?;
        }
        _ => {}
    }
    Ok(())
}

fn project_runs(tx: &Transaction<'_>, event: &Event) -> Result<(), CoreError> {
    match event.event_type {
        EventType::CommandStarted => {
            let payload: payloads::CommandStarted = serde_json::from_value(event.payload.clone())?;
            let Some(command_id) = &event.command_id else {
                return Ok(());
            };
            tx.execute(
                "INSERT INTO runs (run_id, tenant_id, project_id, command_id, status, attempt, \
                 started_ts, executor, last_event_id) \
                 VALUES (?1, ?2, ?3, ?4, 'RUNNING', ?5, ?6, ?7, ?8) \
                 ON CONFLICT (run_id) DO NOTHING",
                params![
                    payload.run_id,
                    event.tenant_id,
                    event.project_id,
                    command_id,
                    payload.attempt,
                    event.ts,
                    payload.executor,
                    event.event_id,
                ],
            )
            .map_err(LedgerError::from)?;
        }
        EventType::CommandSucceeded => {
            let payload: payloads::CommandSucceeded =
                serde_json::from_value(event.payload.clone())?;
            tx.execute(
                "UPDATE runs SET status = 'SUCCEEDED', ended_ts = ?1, last_event_id = ?2 \
                 WHERE run_id = ?3 AND last_event_id < ?2",
                params![event.ts, event.event_id, payload.run_id],
            )
            .map_err(LedgerError::from)?;
        }
        EventType::CommandFailed => {
            let payload: payloads::CommandFailed = serde_json::from_value(event.payload.clone())?;
            tx.execute(
                "UPDATE runs SET status = 'FAILED', ended_ts = ?1, error = ?2, last_event_id = ?3 \
                 WHERE run_id = ?4 AND last_event_id < ?3",
                params![event.ts, payload.error, event.event_id, payload.run_id],
            )
            .map_err(LedgerError::from)?;
        }
        EventType::CommandCanceled => {
            let payload: payloads::CommandCanceled = serde_json::from_value(event.payload.clone())?;
            if let Some(run_id) = &event.run_id {
                tx.execute(
                    "UPDATE runs SET status = 'FAILED', ended_ts = ?1, error = ?2, \
                     last_event_id = ?3 WHERE run_id = ?4 AND last_event_id < ?3",
                    params![event.ts, payload.reason, event.event_id, run_id],
                )
                .map_err(LedgerError::from)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn project_cards(tx: &Transaction<'_>, event: &Event) -> Result<(), CoreError> {
    match event.event_type {
        EventType::CardCreated => {
            let payload: payloads::CardCreated = serde_json::from_value(event.payload.clone())?;
            let capabilities = payload
                .capabilities
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            tx.execute(
                "INSERT INTO cards (card_id, tenant_id, project_id, command_id, state, priority, \
                 title, spec, attempt, retry_at_ts, capabilities, created_ts, updated_ts, \
                 last_event_id) \
                 VALUES (?1, ?2, ?3, ?4, 'READY', ?5, ?6, ?7, 0, NULL, ?8, ?9, ?9, ?10) \
                 ON CONFLICT (card_id) DO NOTHING",
                params![
                    payload.card_id,
                    event.tenant_id,
                    event.project_id,
                    payload.command_id,
                    payload.priority,
                    payload.title,
                    serde_json::to_string(&payload.spec)?,
                    capabilities,
                    event.ts,
                    event.event_id,
                ],
            )
            .map_err(LedgerError::from)?;
        }
        EventType::CardTransitioned => {
            let payload: payloads::CardTransitioned =
                serde_json::from_value(event.payload.clone())?;
            let Some(card_id) = &event.card_id else {
                return Ok(());
            };
            let entering_running = payload.to == CardState::Running;
            let retry_at = if payload.to == CardState::RetryScheduled {
                payload.retry_at_ts
            } else {
                // Cleared on every other entry, so retry_at_ts is set iff
                // the card sits in RETRY_SCHEDULED.
                None
            };
            tx.execute(
                "UPDATE cards SET state = ?1, attempt = attempt + ?2, retry_at_ts = ?3, \
                 updated_ts = ?4, last_event_id = ?5 \
                 WHERE card_id = ?6 AND last_event_id < ?5",
                params![
                    payload.to.as_str(),
                    i64::from(entering_running),
                    retry_at,
                    event.ts,
                    event.event_id,
                    card_id,
                ],
            )
            .map_err(LedgerError::from)?;
        }
        _ => {}
    }
    Ok(())
}

fn project_decisions(tx: &Transaction<'_>, event: &Event) -> Result<(), CoreError> {
    let Some(decision_id) = &event.decision_id else {
        return Ok(());
    };
    match event.event_type {
        EventType::DecisionRequested => {
            let payload: payloads::DecisionRequested =
                serde_json::from_value(event.payload.clone())?;
            let artifact_refs = payload
                .artifact_refs
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            tx.execute(
                "INSERT INTO decisions (decision_id, tenant_id, project_id, card_id, command_id, \
                 run_id, state, urgency, title, context_summary, options, artifact_refs, \
                 source_thread, requested_at, expires_at, fallback_option, last_event_id) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'PENDING', ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, \
                 ?15, ?16) \
                 ON CONFLICT (decision_id) DO NOTHING",
                params![
                    payload.decision_id,
                    event.tenant_id,
                    event.project_id,
                    payload.card_id,
                    payload.command_id,
                    payload.run_id,
                    payload.urgency.as_str(),
                    payload.title,
                    payload.context_summary,
                    serde_json::to_string(&payload.options)?,
                    artifact_refs,
                    payload.source_thread,
                    event.ts,
                    payload.expires_at,
                    payload.fallback_option,
                    event.event_id,
                ],
            )
            .map_err(LedgerError::from)?;
        }
        EventType::DecisionClaimed => {
            let payload: payloads::DecisionClaimed = serde_json::from_value(event.payload.clone())?;
            tx.execute(
                "UPDATE decisions SET state = 'CLAIMED', claimed_by = ?1, claimed_until = ?2, \
                 last_event_id = ?3 WHERE decision_id = ?4 AND last_event_id < ?3",
                params![
                    payload.claimed_by,
                    payload.claimed_until,
                    event.event_id,
                    decision_id,
                ],
            )
            .map_err(LedgerError::from)?;
        }
        EventType::DecisionRendered => {
            let payload: payloads::DecisionRendered =
                serde_json::from_value(event.payload.clone())?;
            tx.execute(
                "UPDATE decisions SET state = 'RENDERED', rendered_option = ?1, rendered_by = ?2, \
                 rendered_at = ?3, claimed_by = NULL, claimed_until = NULL, last_event_id = ?4 \
                 WHERE decision_id = ?5 AND last_event_id < ?4",
                params![
                    payload.selected_option,
                    payload.rendered_by,
                    payload.rendered_at,
                    event.event_id,
                    decision_id,
                ],
            )
            .map_err(LedgerError::from)?;
        }
        EventType::DecisionExpired => {
            tx.execute(
                "UPDATE decisions SET state = 'EXPIRED', claimed_by = NULL, claimed_until = NULL, \
                 last_event_id = ?1 WHERE decision_id = ?2 AND last_event_id < ?1",
                params![event.event_id, decision_id],
            )
            .map_err(LedgerError::from)?;
        }
        EventType::DecisionClaimExpired => {
            tx.execute(
                "UPDATE decisions SET state = 'PENDING', claimed_by = NULL, claimed_until = NULL, \
                 last_event_id = ?1 WHERE decision_id = ?2 AND last_event_id < ?1",
                params![event.event_id, decision_id],
            )
            .map_err(LedgerError::from)?;
        }
        EventType::DecisionDeferred => {
            let payload: payloads::DecisionDeferred =
                serde_json::from_value(event.payload.clone())?;
            if let Some(new_expires_at) = payload.new_expires_at {
                tx.execute(
                    "UPDATE decisions SET expires_at = ?1, last_event_id = ?2 \
                     WHERE decision_id = ?3 AND last_event_id < ?2",
                    params![new_expires_at, event.event_id, decision_id],
                )
                .map_err(LedgerError::from)?;
            }
        }
        // Render rejections are audit-only; no read-model change.
        _ => {}
    }
    Ok(())
}

fn project_artifacts(tx: &Transaction<'_>, event: &Event) -> Result<(), CoreError> {
    if event.event_type != EventType::ArtifactProduced {
        return Ok(());
    }
    let payload: payloads::ArtifactProduced = serde_json::from_value(event.payload.clone())?;
    let manifest = &payload.manifest;
    let labels = manifest
        .labels
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let links = manifest
        .links
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    // OR IGNORE doubles as the per-project dedup guard on
    // (project_id, content_sha256).
    tx.execute(
        "INSERT OR IGNORE INTO artifacts (artifact_id, tenant_id, project_id, content_sha256, \
         media_type, logical_name, byte_size, labels, created_at, command_id, run_id, event_id, \
         storage_pointer, links) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            manifest.artifact_id,
            event.tenant_id,
            event.project_id,
            manifest.content_sha256,
            manifest.media_type,
            manifest.logical_name,
            manifest.byte_size,
            labels,
            manifest.created_at,
            manifest.provenance.command_id,
            manifest.provenance.run_id,
            manifest.provenance.event_id,
            serde_json::to_string(&manifest.storage_pointer)?,
            links,
        ],
    )
    .map_err(LedgerError::from)?;
    Ok(())
}
