//! Card state machine.
//!
//! A card is the work-item view over a command; it owns the finite state
//! machine that gates all scheduling. Transitions are the only way a card
//! changes state, the edge table is closed, and every applied edge emits a
//! `CardTransitioned` event in the same transaction.
//!
//! ```text
//! READY ----------> RUNNING ----------> DONE
//!   ^                 |  |
//!   |                 |  +-----------> FAILED
//! RETRY_SCHEDULED <---+  |               ^
//!                        v               |
//!                  NEEDS_DECISION -------+
//!                        |
//!                        +------------> RUNNING
//! ```


use rusqlite::{Connection, OptionalExtension, Transaction, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::Core;
use crate::error::CoreError;
use crate::events::{Event, EventType, Scope, payloads};

/// The lifecycle state of a card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CardState {
    /// Open for dispatch.
    Ready,
    /// An attempt is executing.
    Running,
    /// Blocked on a human decision.
    NeedsDecision,
    /// Waiting for the retry timer.
    RetryScheduled,
    /// Finished successfully (terminal).
    Done,
    /// Finished unsuccessfully (terminal).
    Failed,
}

impl CardState {
    /// Returns the string representation of this state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::NeedsDecision => "NEEDS_DECISION",
            Self::RetryScheduled => "RETRY_SCHEDULED",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }

    /// Parses a state from its string representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "READY" => Some(Self::Ready),
            "RUNNING" => Some(Self::Running),
            "NEEDS_DECISION" => Some(Self::NeedsDecision),
            "RETRY_SCHEDULED" => Some(Self::RetryScheduled),
            "DONE" => Some(Self::Done),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Returns `true` for terminal states (`DONE`, `FAILED`).
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Returns `true` when the edge `self -> to` is in the transition table.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Ready, Self::Running)
                | (
                    Self::Running,
                    Self::Done | Self::NeedsDecision | Self::Failed | Self::RetryScheduled
                )
                | (Self::NeedsDecision, Self::Running | Self::Failed)
                | (Self::RetryScheduled, Self::Ready)
        )
    }
}

impl std::fmt::Display for CardState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution constraints on a card.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardConstraints {
    /// Named pool key for bounded concurrency in the job primitive.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency_key: Option<String>,
    /// Maximum retry attempts after the first failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

/// What a card executes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardSpec {
    /// The command type to execute.
    pub command_type: String,
    /// Arguments forwarded to the worker.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    /// Execution constraints.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub constraints: Option<CardConstraints>,
}

impl CardSpec {
    /// Maximum retries, defaulting to zero when unconstrained.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.constraints
            .as_ref()
            .and_then(|c| c.max_retries)
            .unwrap_or(0)
    }

    /// The concurrency pool key, when constrained.
    #[must_use]
    pub fn concurrency_key(&self) -> Option<&str> {
        self.constraints
            .as_ref()
            .and_then(|c| c.concurrency_key.as_deref())
    }
}

/// The card read model row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Card {
    /// Card identifier.
    pub card_id: String,
    /// Tenant scope.
    pub tenant_id: String,
    /// Project scope.
    pub project_id: String,
    /// The command this card tracks.
    pub command_id: String,
    /// Current state.
    pub state: CardState,
    /// Priority (lower = more urgent).
    pub priority: i64,
    /// Human-readable title.
    pub title: String,
    /// Execution spec.
    pub spec: CardSpec,
    /// Count of entries into `RUNNING`; increments on each such transition.
    pub attempt: u32,
    /// Retry timer; set iff `state == RETRY_SCHEDULED`.
    pub retry_at_ts: Option<i64>,
    /// Required worker capabilities.
    pub capabilities: Option<Vec<String>>,
    /// Creation timestamp (ms).
    pub created_ts: i64,
    /// Last update timestamp (ms).
    pub updated_ts: i64,
    /// Id of the last event applied to this row.
    pub last_event_id: String,
    /// External-worker lease holder. Reserved; always absent here.
    pub leased_to: Option<String>,
    /// External-worker lease deadline. Reserved; always absent here.
    pub lease_until_ts: Option<i64>,
    /// External-worker heartbeat. Reserved; always absent here.
    pub last_heartbeat_ts: Option<i64>,
}

impl Card {
    /// Returns this card's scope.
    #[must_use]
    pub fn scope(&self) -> Scope {
        Scope::new(&self.tenant_id, &self.project_id)
    }
}

/// Parameters for a card transition.
#[derive(Debug, Clone)]
pub struct TransitionRequest {
    /// Target state.
    pub to: CardState,
    /// Why the transition happens (recorded in the event payload).
    pub reason: String,
    /// Chain identity; defaults to the card's `command_id`.
    pub correlation_id: Option<String>,
    /// Subject run, when applicable.
    pub run_id: Option<String>,
    /// Subject decision, when applicable.
    pub decision_id: Option<String>,
    /// Retry timer; required when `to == RETRY_SCHEDULED`.
    pub retry_at_ts: Option<i64>,
}

impl TransitionRequest {
    /// A transition with just a target state and reason.
    #[must_use]
    pub fn new(to: CardState, reason: impl Into<String>) -> Self {
        Self {
            to,
            reason: reason.into(),
            correlation_id: None,
            run_id: None,
            decision_id: None,
            retry_at_ts: None,
        }
    }
}

const SELECT_CARD: &str = "SELECT card_id, tenant_id, project_id, command_id, state, priority, \
     title, spec, attempt, retry_at_ts, capabilities, created_ts, updated_ts, last_event_id, \
     leased_to, lease_until_ts, last_heartbeat_ts FROM cards";

pub(crate) fn row_to_card(row: &rusqlite::Row<'_>) -> rusqlite::Result<Card> {
    let state: String = row.get(4)?;
    let spec: String = row.get(7)?;
    let capabilities: Option<String> = row.get(10)?;
    Ok(Card {
        card_id: row.get(0)?,
        tenant_id: row.get(1)?,
        project_id: row.get(2)?,
        command_id: row.get(3)?,
        state: CardState::parse(&state).unwrap_or(CardState::Failed),
        priority: row.get(5)?,
        title: row.get(6)?,
        spec: serde_json::from_str(&spec).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
        })?,
        attempt: row.get(8)?,
        retry_at_ts: row.get(9)?,
        capabilities: capabilities
            .map(|c| serde_json::from_str(&c))
            .transpose()
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    10,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?,
        created_ts: row.get(11)?,
        updated_ts: row.get(12)?,
        last_event_id: row.get(13)?,
        leased_to: row.get(14)?,
        lease_until_ts: row.get(15)?,
        last_heartbeat_ts: row.get(16)?,
    })
}

/// Loads a card within its scope. Cross-project ids come back as `None`.
pub(crate) fn load(
    conn: &Connection,
    scope: &Scope,
    card_id: &str,
) -> Result<Option<Card>, CoreError> {
    let sql = format!("{SELECT_CARD} WHERE card_id = ?1 AND tenant_id = ?2 AND project_id = ?3");
    let card = conn
        .prepare(&sql)?
        .query_row(
            params![card_id, scope.tenant_id, scope.project_id],
            row_to_card,
        )
        .optional()?;
    Ok(card)
}

impl Core {
    /// Looks up a card in the caller's project. Any member role.
    ///
    /// # Errors
    ///
    /// [`CoreError::NotFound`] for unknown or cross-project ids.
    pub fn get_card(
        &self,
        ident: &crate::auth::Identity,
        project_id: &str,
        card_id: &str,
    ) -> Result<Card, CoreError> {
        use crate::auth::Role;
        let ctx = self.guard(
            ident,
            project_id,
            &[Role::Owner, Role::Operator, Role::Viewer, Role::Bot],
        )?;
        self.store()
            .with_conn(|conn| load(conn, &ctx.scope(), card_id))?
            .ok_or_else(|| CoreError::not_found("card", card_id))
    }

    /// Applies one edge of the card state machine.
    ///
    /// Validates the edge against the closed table, appends the paired
    /// `CardTransitioned` event, and lets the inline projector patch the row
    /// (state, `updated_ts`, `attempt` increment on entry to `RUNNING`,
    /// `retry_at_ts` handling). Everything happens in one transaction.
    ///
    /// This is a system-facing operation: callers are the runner paths and
    /// the sweeper, not end users.
    ///
    /// # Errors
    ///
    /// - [`CoreError::NotFound`] if the card does not exist in scope.
    /// - [`CoreError::InvalidTransition`] if the edge is not in the table.
    pub fn transition_card(
        &self,
        scope: &Scope,
        card_id: &str,
        request: TransitionRequest,
    ) -> Result<Card, CoreError> {
        self.store().with_tx(|tx| {
            let card = load(tx, scope, card_id)?
                .ok_or_else(|| CoreError::not_found("card", card_id))?;
            self.transition_in_tx(tx, &card, &request, None, None)?;
            load(tx, scope, card_id)?.ok_or_else(|| CoreError::not_found("card", card_id))
        })
    }

    /// Transition step shared by the interactive paths and the sweeper.
    ///
    /// The caller has already loaded the card inside `tx`; `now_override`
    /// carries the sweeper's pinned clock and `causation_id` the event that
    /// triggered the edge. Returns the transition event id.
    pub(crate) fn transition_in_tx(
        &self,
        tx: &Transaction<'_>,
        card: &Card,
        request: &TransitionRequest,
        now_override: Option<i64>,
        causation_id: Option<&str>,
    ) -> Result<String, CoreError> {
        if !card.state.can_transition_to(request.to) {
            return Err(CoreError::InvalidTransition {
                from: card.state.as_str().to_string(),
                to: request.to.as_str().to_string(),
            });
        }

        let payload = payloads::CardTransitioned {
            from: card.state,
            to: request.to,
            reason: request.reason.clone(),
            retry_at_ts: request.retry_at_ts,
        };
        let correlation = request
            .correlation_id
            .clone()
            .unwrap_or_else(|| card.command_id.clone());

        let mut event = Event::new(
            &card.scope(),
            EventType::CardTransitioned,
            correlation,
            serde_json::to_value(payload)?,
            self.producer(),
        )
        .with_card(&card.card_id)
        .with_command(&card.command_id);
        if let Some(run_id) = &request.run_id {
            event = event.with_run(run_id);
        }
        if let Some(decision_id) = &request.decision_id {
            event = event.with_decision(decision_id);
        }
        if let Some(now) = now_override {
            event = event.with_ts(now);
        }
        if let Some(causation_id) = causation_id {
            event = event.with_causation(causation_id);
        }

        tracing::debug!(
            card_id = %card.card_id,
            from = %card.state,
            to = %request.to,
            reason = %request.reason,
            "card transition"
        );

        let appended = self.append_live(tx, &event)?;
        Ok(appended.event_id().to_string())
    }
}

/// Returns cards whose retry timer has fired (sweeper phase 1 scan).
pub(crate) fn due_retries(conn: &Connection, now: i64) -> Result<Vec<Card>, CoreError> {
    let sql =
        format!("{SELECT_CARD} WHERE state = 'RETRY_SCHEDULED' AND retry_at_ts <= ?1 ORDER BY retry_at_ts ASC");
    let cards = conn
        .prepare(&sql)?
        .query_map(params![now], row_to_card)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(cards)
}
