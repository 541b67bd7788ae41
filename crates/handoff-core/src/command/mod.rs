//! Command admission and runner-side operations.
//!
//! A command is the logical request to do work; it fans out to one or more
//! runs, each tracked by the card state machine. Admission is a single
//! transaction: append `CommandRequested` (idempotency-keyed), insert the
//! command and card read models via the inline projectors, append
//! `CardCreated`, and enqueue a dispatch job. A duplicate idempotency key
//! yields the original ids and suppresses the inserts.
//!
//! The runner operations (`start_command`, `succeed_command`,
//! `fail_command`, `cancel_command`) produce the canonical event sequences:
//!
//! ```text
//! CommandRequested -> CardCreated -> CardTransitioned(READY->RUNNING) + CommandStarted
//!   -> ArtifactProduced* -> CommandSucceeded -> CardTransitioned(RUNNING->DONE)
//! ```

#[cfg(test)]
mod tests;

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::{Identity, Role};
use crate::card::{self, CardConstraints, CardSpec, CardState, TransitionRequest};
use crate::core::Core;
use crate::error::CoreError;
use crate::events::{EventType, Scope, payloads};
use crate::ids;

/// The lifecycle state of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    /// Admitted, not yet started.
    Pending,
    /// A run is executing.
    Running,
    /// Finished successfully (terminal).
    Succeeded,
    /// Failed (terminal unless a retry starts a new run).
    Failed,
    /// Canceled (terminal).
    Canceled,
}

impl CommandStatus {
    /// Returns the string representation of this status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
        }
    }

    /// Parses a status from its string representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "SUCCEEDED" => Some(Self::Succeeded),
            "FAILED" => Some(Self::Failed),
            "CANCELED" => Some(Self::Canceled),
            _ => None,
        }
    }
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution constraints on a command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandConstraints {
    /// Priority; lower is more urgent. Defaults to 50 at admission.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    /// Named pool key for bounded concurrency.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency_key: Option<String>,
    /// Maximum retry attempts after the first failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Per-run execution timeout enforced by the job primitive.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<i64>,
}

/// What a command asks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// The command type (e.g. `digest.compile`).
    pub command_type: String,
    /// Command schema version, when the caller pins one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_version: Option<String>,
    /// Arguments forwarded to the worker.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    /// Free-form context for the worker and operators.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    /// Execution constraints.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub constraints: Option<CommandConstraints>,
}

impl CommandSpec {
    /// A spec with just a command type.
    #[must_use]
    pub fn new(command_type: impl Into<String>) -> Self {
        Self {
            command_type: command_type.into(),
            command_version: None,
            args: None,
            context: None,
            constraints: None,
        }
    }

    /// Effective priority (default 50; lower is more urgent).
    #[must_use]
    pub fn priority(&self) -> i64 {
        self.constraints
            .as_ref()
            .and_then(|c| c.priority)
            .unwrap_or(50)
    }

    /// Derives the card-level spec for this command.
    #[must_use]
    pub fn card_spec(&self) -> CardSpec {
        CardSpec {
            command_type: self.command_type.clone(),
            args: self.args.clone(),
            constraints: self.constraints.as_ref().map(|c| CardConstraints {
                concurrency_key: c.concurrency_key.clone(),
                max_retries: c.max_retries,
            }),
        }
    }
}

/// The command read model row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    /// Command identifier.
    pub command_id: String,
    /// Tenant scope.
    pub tenant_id: String,
    /// Project scope.
    pub project_id: String,
    /// Current status.
    pub status: CommandStatus,
    /// The most recent run, once one has started.
    pub latest_run_id: Option<String>,
    /// Priority (lower = more urgent).
    pub priority: i64,
    /// The admitted spec.
    pub spec: CommandSpec,
    /// Last update timestamp (ms).
    pub updated_ts: i64,
    /// Id of the last event applied to this row.
    pub last_event_id: String,
}

/// Parameters for [`Core::request_command`].
#[derive(Debug, Clone)]
pub struct CommandRequest {
    /// What to execute.
    pub spec: CommandSpec,
    /// Human-readable work title.
    pub title: String,
    /// Chain identity; defaults to the new command id.
    pub correlation_id: Option<String>,
    /// Capabilities the executing worker must hold.
    pub capabilities: Option<Vec<String>>,
    /// Deduplication key carried by the event log.
    pub idempotency_key: Option<String>,
}

/// The result of command admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Admitted {
    /// The admitted (or original, when deduplicated) command.
    pub command_id: String,
    /// The created (or original) card.
    pub card_id: String,
    /// `true` when the idempotency key matched a previous admission.
    pub deduplicated: bool,
}

const SELECT_COMMAND: &str = "SELECT command_id, tenant_id, project_id, status, latest_run_id, \
     priority, spec, updated_ts, last_event_id FROM commands";

pub(crate) fn row_to_command(row: &rusqlite::Row<'_>) -> rusqlite::Result<Command> {
    let status: String = row.get(3)?;
    let spec: String = row.get(6)?;
    Ok(Command {
        command_id: row.get(0)?,
        tenant_id: row.get(1)?,
        project_id: row.get(2)?,
        status: CommandStatus::parse(&status).unwrap_or(CommandStatus::Failed),
        latest_run_id: row.get(4)?,
        priority: row.get(5)?,
        spec: serde_json::from_str(&spec).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
        })?,
        updated_ts: row.get(7)?,
        last_event_id: row.get(8)?,
    })
}

/// Loads a command within its scope. Cross-project ids come back as `None`.
pub(crate) fn load(
    conn: &Connection,
    scope: &Scope,
    command_id: &str,
) -> Result<Option<Command>, CoreError> {
    let sql =
        format!("{SELECT_COMMAND} WHERE command_id = ?1 AND tenant_id = ?2 AND project_id = ?3");
    let command = conn
        .prepare(&sql)?
        .query_row(
            params![command_id, scope.tenant_id, scope.project_id],
            row_to_command,
        )
        .optional()?;
    Ok(command)
}

impl Core {
    /// Admits a command. Roles: bot, operator, owner.
    ///
    /// In a single transaction: appends `CommandRequested` (carrying the
    /// idempotency key), lets the projectors insert the command row
    /// (`PENDING`, priority from `spec.constraints.priority`, default 50)
    /// and the card row (`READY`), and appends `CardCreated`. A duplicate
    /// idempotency key returns the original ids, appends a
    /// `CommandSkippedDuplicate` audit event, and suppresses everything
    /// else.
    ///
    /// # Errors
    ///
    /// Returns access-guard errors or a ledger rejection (e.g.
    /// `secret_in_payload`).
    pub fn request_command(
        &self,
        ident: &Identity,
        project_id: &str,
        request: CommandRequest,
    ) -> Result<Admitted, CoreError> {
        let ctx = self.guard(ident, project_id, &[Role::Bot, Role::Operator, Role::Owner])?;
        let scope = ctx.scope();

        let command_id = ids::command_id();
        let card_id = ids::card_id();
        let correlation = request
            .correlation_id
            .clone()
            .unwrap_or_else(|| command_id.clone());
        let priority = request.spec.priority();

        self.store().with_tx(|tx| {
            let requested = payloads::CommandRequested {
                command_id: command_id.clone(),
                card_id: card_id.clone(),
                title: request.title.clone(),
                priority,
                spec: request.spec.clone(),
                capabilities: request.capabilities.clone(),
            };
            let mut requested_event = self
                .event(
                    &scope,
                    EventType::CommandRequested,
                    correlation.clone(),
                    serde_json::to_value(&requested)?,
                )
                .with_command(&command_id)
                .with_card(&card_id);
            if let Some(key) = &request.idempotency_key {
                requested_event = requested_event.with_idempotency_key(key.clone());
            }

            let appended = self.append_live(tx, &requested_event)?;
            if appended.is_deduplicated() {
                // Recover the original ids from the first admission and make
                // the suppression observable in the log.
                let original = events_payload_for(tx, appended.event_id())?;
                let skipped = payloads::CommandSkippedDuplicate {
                    original_event_id: appended.event_id().to_string(),
                    command_id: original.command_id.clone(),
                    card_id: original.card_id.clone(),
                };
                let skip_correlation = request
                    .correlation_id
                    .clone()
                    .unwrap_or_else(|| original.command_id.clone());
                let skip_event = self
                    .event(
                        &scope,
                        EventType::CommandSkippedDuplicate,
                        skip_correlation,
                        serde_json::to_value(&skipped)?,
                    )
                    .with_command(&original.command_id)
                    .with_card(&original.card_id)
                    .with_causation(appended.event_id());
                self.append_live(tx, &skip_event)?;
                tracing::info!(
                    command_id = %original.command_id,
                    "duplicate admission suppressed by idempotency key"
                );
                return Ok(Admitted {
                    command_id: original.command_id,
                    card_id: original.card_id,
                    deduplicated: true,
                });
            }

            let created = payloads::CardCreated {
                card_id: card_id.clone(),
                command_id: command_id.clone(),
                title: request.title.clone(),
                priority,
                spec: request.spec.card_spec(),
                capabilities: request.capabilities.clone(),
            };
            let created_event = self
                .event(
                    &scope,
                    EventType::CardCreated,
                    correlation.clone(),
                    serde_json::to_value(&created)?,
                )
                .with_command(&command_id)
                .with_card(&card_id)
                .with_causation(appended.event_id());
            self.append_live(tx, &created_event)?;

            tracing::info!(%command_id, %card_id, priority, "command admitted");
            Ok(Admitted {
                command_id: command_id.clone(),
                card_id: card_id.clone(),
                deduplicated: false,
            })
        })
    }

    /// Admits a standalone card for an existing command. Roles: bot, owner.
    ///
    /// Used when a bot fans one command into several work items; appends
    /// `CardCreated` only.
    ///
    /// # Errors
    ///
    /// [`CoreError::NotFound`] when the command does not exist in scope.
    pub fn create_card(
        &self,
        ident: &Identity,
        project_id: &str,
        command_id: &str,
        title: &str,
        spec: CardSpec,
    ) -> Result<String, CoreError> {
        let ctx = self.guard(ident, project_id, &[Role::Bot, Role::Owner])?;
        let scope = ctx.scope();
        let card_id = ids::card_id();

        self.store().with_tx(|tx| {
            let command = load(tx, &scope, command_id)?
                .ok_or_else(|| CoreError::not_found("command", command_id))?;
            let created = payloads::CardCreated {
                card_id: card_id.clone(),
                command_id: command_id.to_string(),
                title: title.to_string(),
                priority: command.priority,
                spec,
                capabilities: None,
            };
            let event = self
                .event(
                    &scope,
                    EventType::CardCreated,
                    command_id,
                    serde_json::to_value(&created)?,
                )
                .with_command(command_id)
                .with_card(&card_id);
            self.append_live(tx, &event)?;
            Ok(card_id.clone())
        })
    }

    /// Starts executing a card's command. System/runner-facing.
    ///
    /// Transitions the card `READY -> RUNNING` and appends `CommandStarted`
    /// with a freshly minted run id, in one transaction. `correlation_id`
    /// continues the admission chain; it defaults to the command id. Returns
    /// the run id.
    ///
    /// # Errors
    ///
    /// - [`CoreError::NotFound`] when command or card are absent in scope.
    /// - [`CoreError::InvalidTransition`] when the card is not `READY`, or
    ///   the command is already terminal.
    pub fn start_command(
        &self,
        scope: &Scope,
        command_id: &str,
        card_id: &str,
        executor: Option<&str>,
        correlation_id: Option<&str>,
    ) -> Result<String, CoreError> {
        let run_id = ids::run_id();
        let correlation = correlation_id.unwrap_or(command_id).to_string();
        self.store().with_tx(|tx| {
            let command = load(tx, scope, command_id)?
                .ok_or_else(|| CoreError::not_found("command", command_id))?;
            if matches!(
                command.status,
                CommandStatus::Succeeded | CommandStatus::Canceled
            ) {
                return Err(CoreError::InvalidTransition {
                    from: command.status.as_str().to_string(),
                    to: CommandStatus::Running.as_str().to_string(),
                });
            }
            let card = card::load(tx, scope, card_id)?
                .ok_or_else(|| CoreError::not_found("card", card_id))?;

            let transition = TransitionRequest {
                to: CardState::Running,
                reason: "dispatched".to_string(),
                correlation_id: Some(correlation.clone()),
                run_id: Some(run_id.clone()),
                decision_id: None,
                retry_at_ts: None,
            };
            let transition_event_id = self.transition_in_tx(tx, &card, &transition, None, None)?;

            let started = payloads::CommandStarted {
                run_id: run_id.clone(),
                attempt: card.attempt + 1,
                executor: executor.map(ToString::to_string),
            };
            let event = self
                .event(
                    scope,
                    EventType::CommandStarted,
                    correlation.clone(),
                    serde_json::to_value(&started)?,
                )
                .with_command(command_id)
                .with_card(card_id)
                .with_run(&run_id)
                .with_causation(transition_event_id);
            self.append_live(tx, &event)?;
            Ok(run_id.clone())
        })
    }

    /// Records a successful run. System/runner-facing.
    ///
    /// Appends `CommandSucceeded` and transitions the card
    /// `RUNNING -> DONE`.
    ///
    /// # Errors
    ///
    /// [`CoreError::NotFound`] / [`CoreError::InvalidTransition`] as for the
    /// other runner operations.
    pub fn succeed_command(
        &self,
        scope: &Scope,
        command_id: &str,
        card_id: &str,
        run_id: &str,
        result: Option<Value>,
        correlation_id: Option<&str>,
    ) -> Result<(), CoreError> {
        let correlation = correlation_id.unwrap_or(command_id).to_string();
        self.store().with_tx(|tx| {
            let card = card::load(tx, scope, card_id)?
                .ok_or_else(|| CoreError::not_found("card", card_id))?;
            let succeeded = payloads::CommandSucceeded {
                run_id: run_id.to_string(),
                result,
            };
            let event = self
                .event(
                    scope,
                    EventType::CommandSucceeded,
                    correlation.clone(),
                    serde_json::to_value(&succeeded)?,
                )
                .with_command(command_id)
                .with_card(card_id)
                .with_run(run_id);
            let appended = self.append_live(tx, &event)?;

            let transition = TransitionRequest {
                to: CardState::Done,
                reason: "command succeeded".to_string(),
                correlation_id: Some(correlation.clone()),
                run_id: Some(run_id.to_string()),
                decision_id: None,
                retry_at_ts: None,
            };
            self.transition_in_tx(tx, &card, &transition, None, Some(appended.event_id()))?;
            Ok(())
        })
    }

    /// Records a failed run. System/runner-facing.
    ///
    /// Appends `CommandFailed`; when the failure is retryable and the card
    /// has attempts left, schedules a retry (`CommandRetryScheduled` +
    /// `RUNNING -> RETRY_SCHEDULED` with an exponential backoff timer);
    /// otherwise the card goes `RUNNING -> FAILED`.
    ///
    /// # Errors
    ///
    /// [`CoreError::NotFound`] / [`CoreError::InvalidTransition`] as for the
    /// other runner operations.
    pub fn fail_command(
        &self,
        scope: &Scope,
        command_id: &str,
        card_id: &str,
        run_id: &str,
        error: &str,
        retryable: bool,
        correlation_id: Option<&str>,
    ) -> Result<(), CoreError> {
        let correlation = correlation_id.unwrap_or(command_id).to_string();
        self.store().with_tx(|tx| {
            let card = card::load(tx, scope, card_id)?
                .ok_or_else(|| CoreError::not_found("card", card_id))?;

            let failed = payloads::CommandFailed {
                run_id: run_id.to_string(),
                error: error.to_string(),
                retryable,
            };
            let event = self
                .event(
                    scope,
                    EventType::CommandFailed,
                    correlation.clone(),
                    serde_json::to_value(&failed)?,
                )
                .with_command(command_id)
                .with_card(card_id)
                .with_run(run_id);
            let appended = self.append_live(tx, &event)?;

            let retries_left = card.attempt <= card.spec.max_retries();
            if retryable && retries_left {
                let retry_at_ts =
                    Self::now_ms() + self.config().retry_backoff_ms(card.attempt);
                let scheduled = payloads::CommandRetryScheduled {
                    run_id: run_id.to_string(),
                    attempt: card.attempt,
                    retry_at_ts,
                };
                let retry_event = self
                    .event(
                        scope,
                        EventType::CommandRetryScheduled,
                        correlation.clone(),
                        serde_json::to_value(&scheduled)?,
                    )
                    .with_command(command_id)
                    .with_card(card_id)
                    .with_run(run_id)
                    .with_causation(appended.event_id());
                let retry_appended = self.append_live(tx, &retry_event)?;

                let transition = TransitionRequest {
                    to: CardState::RetryScheduled,
                    reason: format!("retry scheduled after failure: {error}"),
                    correlation_id: Some(correlation.clone()),
                    run_id: Some(run_id.to_string()),
                    decision_id: None,
                    retry_at_ts: Some(retry_at_ts),
                };
                self.transition_in_tx(tx, &card, &transition, None, Some(retry_appended.event_id()))?;
                tracing::info!(%command_id, %card_id, retry_at_ts, "retry scheduled");
            } else {
                let transition = TransitionRequest {
                    to: CardState::Failed,
                    reason: error.to_string(),
                    correlation_id: Some(correlation.clone()),
                    run_id: Some(run_id.to_string()),
                    decision_id: None,
                    retry_at_ts: None,
                };
                self.transition_in_tx(tx, &card, &transition, None, Some(appended.event_id()))?;
                tracing::warn!(%command_id, %card_id, error, "command failed terminally");
            }
            Ok(())
        })
    }

    /// Cancels a command. Roles: operator, owner.
    ///
    /// Appends `CommandCanceled`; a card in `RUNNING` or `NEEDS_DECISION`
    /// transitions to `FAILED`. A `READY` card stays — the state machine has
    /// no `READY -> FAILED` edge; the dispatch path skips cards whose
    /// command is terminal.
    ///
    /// # Errors
    ///
    /// - [`CoreError::NotFound`] when the command is absent in scope.
    /// - [`CoreError::InvalidTransition`] when the command is already
    ///   terminal.
    pub fn cancel_command(
        &self,
        ident: &Identity,
        project_id: &str,
        command_id: &str,
        reason: &str,
    ) -> Result<(), CoreError> {
        let ctx = self.guard(ident, project_id, &[Role::Operator, Role::Owner])?;
        let scope = ctx.scope();
        self.store().with_tx(|tx| {
            let command = load(tx, &scope, command_id)?
                .ok_or_else(|| CoreError::not_found("command", command_id))?;
            if matches!(
                command.status,
                CommandStatus::Succeeded | CommandStatus::Failed | CommandStatus::Canceled
            ) {
                return Err(CoreError::InvalidTransition {
                    from: command.status.as_str().to_string(),
                    to: CommandStatus::Canceled.as_str().to_string(),
                });
            }

            let canceled = payloads::CommandCanceled {
                reason: reason.to_string(),
                canceled_by: ctx.user_id.clone(),
            };
            let mut event = self
                .event(
                    &scope,
                    EventType::CommandCanceled,
                    command_id,
                    serde_json::to_value(&canceled)?,
                )
                .with_command(command_id);
            if let Some(run_id) = &command.latest_run_id {
                event = event.with_run(run_id);
            }
            let appended = self.append_live(tx, &event)?;

            for card in cards_for_command(tx, &scope, command_id)? {
                if matches!(card.state, CardState::Running | CardState::NeedsDecision) {
                    let transition = TransitionRequest {
                        to: CardState::Failed,
                        reason: "command canceled".to_string(),
                        correlation_id: None,
                        run_id: None,
                        decision_id: None,
                        retry_at_ts: None,
                    };
                    self.transition_in_tx(tx, &card, &transition, None, Some(appended.event_id()))?;
                }
            }
            Ok(())
        })
    }

    /// Looks up a command in the caller's project. Any member role.
    ///
    /// # Errors
    ///
    /// [`CoreError::NotFound`] for unknown or cross-project ids.
    pub fn get_command(
        &self,
        ident: &Identity,
        project_id: &str,
        command_id: &str,
    ) -> Result<Command, CoreError> {
        let ctx = self.guard(
            ident,
            project_id,
            &[Role::Owner, Role::Operator, Role::Viewer, Role::Bot],
        )?;
        self.store()
            .with_conn(|conn| load(conn, &ctx.scope(), command_id))?
            .ok_or_else(|| CoreError::not_found("command", command_id))
    }
}

fn events_payload_for(
    conn: &Connection,
    event_id: &str,
) -> Result<payloads::CommandRequested, CoreError> {
    let payload: String = conn.query_row(
        "SELECT payload FROM events WHERE event_id = ?1",
        params![event_id],
        |row| row.get(0),
    )?;
    Ok(serde_json::from_str(&payload)?)
}

pub(crate) fn cards_for_command(
    conn: &Connection,
    scope: &Scope,
    command_id: &str,
) -> Result<Vec<crate::card::Card>, CoreError> {
    let cards = conn
        .prepare(
            "SELECT card_id, tenant_id, project_id, command_id, state, priority, title, spec, \
             attempt, retry_at_ts, capabilities, created_ts, updated_ts, last_event_id, \
             leased_to, lease_until_ts, last_heartbeat_ts FROM cards \
             WHERE command_id = ?1 AND tenant_id = ?2 AND project_id = ?3 ORDER BY card_id ASC",
        )?
        .query_map(
            params![command_id, scope.tenant_id, scope.project_id],
            crate::card::row_to_card,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(cards)
}
