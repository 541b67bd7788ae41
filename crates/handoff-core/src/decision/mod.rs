//! Decision lifecycle.
//!
//! A decision is a structured request for human selection among enumerated
//! options, with urgency and optional expiration/fallback. The lifecycle:
//!
//! ```text
//! DecisionRequested --> PENDING --claim--> CLAIMED --render--> RENDERED
//!                          |                  |
//!                          |                  +--lease lapses--> PENDING
//!                          +---------expiry (sweeper)---------> EXPIRED
//! ```
//!
//! # Claiming is advisory, the render CAS is the safety net
//!
//! A claim is a short-TTL lease giving one operator the right to render
//! without interference; it is UX optimization, not pessimistic locking.
//! Rendering is a compare-and-set inside one serialized transaction: the
//! first writer wins, every later attempt is durably recorded as
//! `DecisionRenderRejected` and surfaced as a structured (non-error)
//! rejection. Exactly one `DecisionRendered` event exists per decision,
//! ever.
//!
//! A claim does not extend `expires_at`: the sweeper expires claimed
//! decisions on schedule, and the operator's late render is rejected as
//! already resolved.

#[cfg(test)]
mod tests;

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::artifact::{self, ArtifactManifest};
use crate::auth::{Identity, Role};
use crate::card::{self, CardState, TransitionRequest};
use crate::command::{self, CommandSpec};
use crate::core::Core;
use crate::error::CoreError;
use crate::events::{Event, EventType, Scope, payloads};
use crate::ids;
use crate::ledger;

/// The lifecycle state of a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionState {
    /// Waiting in the queue.
    Pending,
    /// Leased to an operator.
    Claimed,
    /// An option was rendered (terminal).
    Rendered,
    /// Expired without a fallback (terminal).
    Expired,
}

impl DecisionState {
    /// Returns the string representation of this state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Claimed => "CLAIMED",
            Self::Rendered => "RENDERED",
            Self::Expired => "EXPIRED",
        }
    }

    /// Parses a state from its string representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "CLAIMED" => Some(Self::Claimed),
            "RENDERED" => Some(Self::Rendered),
            "EXPIRED" => Some(Self::Expired),
            _ => None,
        }
    }

    /// The lowercase status string used by snapshots.
    #[must_use]
    pub const fn as_status(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Rendered => "rendered",
            Self::Expired => "expired",
        }
    }
}

impl std::fmt::Display for DecisionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How soon an operator should look at a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    /// Drop everything.
    Now,
    /// Sometime today.
    Today,
    /// No deadline pressure; sheddable under load.
    Whenever,
}

impl Urgency {
    /// Returns the string representation of this urgency.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Now => "now",
            Self::Today => "today",
            Self::Whenever => "whenever",
        }
    }

    /// Parses an urgency from its string representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "now" => Some(Self::Now),
            "today" => Some(Self::Today),
            "whenever" => Some(Self::Whenever),
            _ => None,
        }
    }

    /// Sort rank: `now < today < whenever`.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Now => 0,
            Self::Today => 1,
            Self::Whenever => 2,
        }
    }
}

/// One enumerated option an operator can select.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionOption {
    /// Stable option key (unique within the decision).
    pub key: String,
    /// Operator-facing label.
    pub label: String,
    /// What selecting this option will cause.
    pub consequence: String,
}

impl DecisionOption {
    /// Creates an option.
    #[must_use]
    pub fn new(
        key: impl Into<String>,
        label: impl Into<String>,
        consequence: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            label: label.into(),
            consequence: consequence.into(),
        }
    }
}

/// The decision read model row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    /// Decision identifier.
    pub decision_id: String,
    /// Tenant scope.
    pub tenant_id: String,
    /// Project scope.
    pub project_id: String,
    /// The card blocked on this decision.
    pub card_id: String,
    /// The originating command.
    pub command_id: String,
    /// The run that raised the decision.
    pub run_id: String,
    /// Current state.
    pub state: DecisionState,
    /// Operator-facing urgency.
    pub urgency: Urgency,
    /// Operator-facing title.
    pub title: String,
    /// Short context summary for the queue view.
    pub context_summary: Option<String>,
    /// The enumerated options.
    pub options: Vec<DecisionOption>,
    /// Artifacts the operator should look at.
    pub artifact_refs: Option<Vec<String>>,
    /// External conversation reference.
    pub source_thread: Option<String>,
    /// When the decision was requested (ms).
    pub requested_at: i64,
    /// Expiry deadline, if any.
    pub expires_at: Option<i64>,
    /// Option auto-selected on expiry, if any.
    pub fallback_option: Option<String>,
    /// Current lease holder.
    pub claimed_by: Option<String>,
    /// Current lease deadline.
    pub claimed_until: Option<i64>,
    /// The rendered option; set iff `state == RENDERED`.
    pub rendered_option: Option<String>,
    /// Who rendered.
    pub rendered_by: Option<String>,
    /// When the render happened.
    pub rendered_at: Option<i64>,
    /// Id of the last event applied to this row.
    pub last_event_id: String,
}

impl Decision {
    /// Returns this decision's scope.
    #[must_use]
    pub fn scope(&self) -> Scope {
        Scope::new(&self.tenant_id, &self.project_id)
    }

    /// `true` when `key` matches one of the enumerated options.
    #[must_use]
    pub fn has_option(&self, key: &str) -> bool {
        self.options.iter().any(|o| o.key == key)
    }
}

/// Parameters for [`Core::request_decision`].
#[derive(Debug, Clone)]
pub struct DecisionRequest {
    /// The card to block on this decision.
    pub card_id: String,
    /// The originating command.
    pub command_id: String,
    /// The run raising the decision.
    pub run_id: String,
    /// Chain identity carried by the requesting bot; defaults to
    /// `command_id`.
    pub correlation_id: Option<String>,
    /// Operator-facing urgency.
    pub urgency: Urgency,
    /// Operator-facing title.
    pub title: String,
    /// Short context summary.
    pub context_summary: Option<String>,
    /// The enumerated options (non-empty, unique keys).
    pub options: Vec<DecisionOption>,
    /// Artifacts the operator should look at.
    pub artifact_refs: Option<Vec<String>>,
    /// External conversation reference.
    pub source_thread: Option<String>,
    /// Expiry deadline.
    pub expires_at: Option<i64>,
    /// Option auto-selected on expiry.
    pub fallback_option: Option<String>,
}

/// The structured outcome of a claim attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ClaimOutcome {
    /// The caller now holds the lease.
    Claimed {
        /// Lease deadline.
        claimed_until: i64,
    },
    /// Another operator holds a live lease. Not an error: the caller shows
    /// "X is reviewing".
    AlreadyClaimed {
        /// The current lease holder.
        claimed_by: String,
        /// Their lease deadline.
        claimed_until: i64,
    },
}

/// The structured outcome of a render attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RenderOutcome {
    /// The caller won the compare-and-set.
    Rendered {
        /// The selected option key.
        selected_option: String,
    },
    /// The caller lost; the rejection is durably recorded in the log.
    Rejected {
        /// Why (`"already resolved (STATE)"` or `"claimed_by_another"`).
        reason: String,
    },
}

/// A point-in-time snapshot for bots awaiting a decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionSnapshot {
    /// `pending`, `claimed`, `rendered`, or `expired`.
    pub status: String,
    /// The rendered option, once rendered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_option: Option<String>,
    /// Who rendered, once rendered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rendered_by: Option<String>,
}

/// The context bundle assembled by [`Core::decision_detail`].
#[derive(Debug, Clone, Serialize)]
pub struct DecisionDetail {
    /// The decision row.
    pub decision: Decision,
    /// The originating command's spec, when the command still resolves.
    pub command_spec: Option<CommandSpec>,
    /// Resolved manifests for `artifact_refs`.
    pub artifacts: Vec<ArtifactManifest>,
    /// The event chain for `correlation_id == command_id`.
    pub events: Vec<Event>,
}

/// Identity the sweeper renders fallbacks under.
pub const SWEEPER_ACTOR: &str = "system:sweeper";

const SELECT_DECISION: &str = "SELECT decision_id, tenant_id, project_id, card_id, command_id, \
     run_id, state, urgency, title, context_summary, options, artifact_refs, source_thread, \
     requested_at, expires_at, fallback_option, claimed_by, claimed_until, rendered_option, \
     rendered_by, rendered_at, last_event_id FROM decisions";

pub(crate) fn row_to_decision(row: &rusqlite::Row<'_>) -> rusqlite::Result<Decision> {
    let state: String = row.get(6)?;
    let urgency: String = row.get(7)?;
    let options: String = row.get(10)?;
    let artifact_refs: Option<String> = row.get(11)?;
    let json_err = |idx: usize, e: serde_json::Error| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    };
    Ok(Decision {
        decision_id: row.get(0)?,
        tenant_id: row.get(1)?,
        project_id: row.get(2)?,
        card_id: row.get(3)?,
        command_id: row.get(4)?,
        run_id: row.get(5)?,
        state: DecisionState::parse(&state).unwrap_or(DecisionState::Expired),
        urgency: Urgency::parse(&urgency).unwrap_or(Urgency::Whenever),
        title: row.get(8)?,
        context_summary: row.get(9)?,
        options: serde_json::from_str(&options).map_err(|e| json_err(10, e))?,
        artifact_refs: artifact_refs
            .map(|r| serde_json::from_str(&r))
            .transpose()
            .map_err(|e| json_err(11, e))?,
        source_thread: row.get(12)?,
        requested_at: row.get(13)?,
        expires_at: row.get(14)?,
        fallback_option: row.get(15)?,
        claimed_by: row.get(16)?,
        claimed_until: row.get(17)?,
        rendered_option: row.get(18)?,
        rendered_by: row.get(19)?,
        rendered_at: row.get(20)?,
        last_event_id: row.get(21)?,
    })
}

/// Loads a decision within its scope. Cross-project ids come back as `None`.
pub(crate) fn load(
    conn: &Connection,
    scope: &Scope,
    decision_id: &str,
) -> Result<Option<Decision>, CoreError> {
    let sql =
        format!("{SELECT_DECISION} WHERE decision_id = ?1 AND tenant_id = ?2 AND project_id = ?3");
    let decision = conn
        .prepare(&sql)?
        .query_row(
            params![decision_id, scope.tenant_id, scope.project_id],
            row_to_decision,
        )
        .optional()?;
    Ok(decision)
}

/// Decisions past their expiry, still in `{PENDING, CLAIMED}` (sweeper scan).
pub(crate) fn due_expiries(conn: &Connection, now: i64) -> Result<Vec<Decision>, CoreError> {
    let sql = format!(
        "{SELECT_DECISION} WHERE state IN ('PENDING', 'CLAIMED') AND expires_at IS NOT NULL \
         AND expires_at <= ?1 ORDER BY expires_at ASC"
    );
    let decisions = conn
        .prepare(&sql)?
        .query_map(params![now], row_to_decision)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(decisions)
}

/// Claimed decisions whose lease lapsed (sweeper scan).
pub(crate) fn lapsed_claims(conn: &Connection, now: i64) -> Result<Vec<Decision>, CoreError> {
    let sql = format!(
        "{SELECT_DECISION} WHERE state = 'CLAIMED' AND claimed_until IS NOT NULL \
         AND claimed_until < ?1 ORDER BY claimed_until ASC"
    );
    let decisions = conn
        .prepare(&sql)?
        .query_map(params![now], row_to_decision)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(decisions)
}

/// Per-project backlog of `now`-urgency decisions in `{PENDING, CLAIMED}`.
pub(crate) fn now_backlogs(conn: &Connection) -> Result<Vec<(Scope, u64)>, CoreError> {
    let rows = conn
        .prepare(
            "SELECT tenant_id, project_id, COUNT(*) FROM decisions \
             WHERE urgency = 'now' AND state IN ('PENDING', 'CLAIMED') \
             GROUP BY tenant_id, project_id",
        )?
        .query_map([], |row| {
            Ok((
                Scope::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
                row.get::<_, i64>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows
        .into_iter()
        .map(|(scope, count)| (scope, u64::try_from(count).unwrap_or(0)))
        .collect())
}

/// `whenever`-urgency `PENDING` decisions of one project (load-shed scan).
pub(crate) fn whenever_pending(
    conn: &Connection,
    scope: &Scope,
) -> Result<Vec<Decision>, CoreError> {
    let sql = format!(
        "{SELECT_DECISION} WHERE tenant_id = ?1 AND project_id = ?2 AND urgency = 'whenever' \
         AND state = 'PENDING' ORDER BY requested_at ASC"
    );
    let decisions = conn
        .prepare(&sql)?
        .query_map(params![scope.tenant_id, scope.project_id], row_to_decision)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(decisions)
}

impl Core {
    /// Requests a human decision. Roles: bot, owner.
    ///
    /// Validates the option list (non-empty, unique keys) and the fallback
    /// (must match an option key), inserts the decision in `PENDING`, and
    /// transitions the card `RUNNING -> NEEDS_DECISION` — one transaction.
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidOptions`] / [`CoreError::InvalidFallback`] on
    ///   validation failure.
    /// - [`CoreError::NotFound`] for unknown or cross-project cards.
    /// - [`CoreError::InvalidTransition`] when the card is not `RUNNING`.
    pub fn request_decision(
        &self,
        ident: &Identity,
        project_id: &str,
        request: DecisionRequest,
    ) -> Result<String, CoreError> {
        let ctx = self.guard(ident, project_id, &[Role::Bot, Role::Owner])?;
        let scope = ctx.scope();

        if request.options.is_empty() {
            return Err(CoreError::InvalidOptions {
                detail: "options must not be empty".to_string(),
            });
        }
        let mut seen = std::collections::HashSet::new();
        for option in &request.options {
            if !seen.insert(option.key.as_str()) {
                return Err(CoreError::InvalidOptions {
                    detail: format!("duplicate option key: {}", option.key),
                });
            }
        }
        if let Some(fallback) = &request.fallback_option {
            if !request.options.iter().any(|o| &o.key == fallback) {
                return Err(CoreError::InvalidFallback {
                    fallback: fallback.clone(),
                });
            }
        }

        let decision_id = ids::decision_id();
        let correlation = request
            .correlation_id
            .clone()
            .unwrap_or_else(|| request.command_id.clone());
        self.store().with_tx(|tx| {
            let card = card::load(tx, &scope, &request.card_id)?
                .ok_or_else(|| CoreError::not_found("card", &request.card_id))?;

            let payload = payloads::DecisionRequested {
                decision_id: decision_id.clone(),
                card_id: request.card_id.clone(),
                command_id: request.command_id.clone(),
                run_id: request.run_id.clone(),
                urgency: request.urgency,
                title: request.title.clone(),
                context_summary: request.context_summary.clone(),
                options: request.options.clone(),
                artifact_refs: request.artifact_refs.clone(),
                source_thread: request.source_thread.clone(),
                expires_at: request.expires_at,
                fallback_option: request.fallback_option.clone(),
            };
            let event = self
                .event(
                    &scope,
                    EventType::DecisionRequested,
                    correlation.clone(),
                    serde_json::to_value(&payload)?,
                )
                .with_command(&request.command_id)
                .with_card(&request.card_id)
                .with_run(&request.run_id)
                .with_decision(&decision_id);
            let appended = self.append_live(tx, &event)?;

            let transition = TransitionRequest {
                to: CardState::NeedsDecision,
                reason: "awaiting human decision".to_string(),
                correlation_id: Some(correlation.clone()),
                run_id: Some(request.run_id.clone()),
                decision_id: Some(decision_id.clone()),
                retry_at_ts: None,
            };
            self.transition_in_tx(tx, &card, &transition, None, Some(appended.event_id()))?;

            tracing::info!(
                %decision_id,
                card_id = %request.card_id,
                urgency = request.urgency.as_str(),
                "decision requested"
            );
            Ok(decision_id.clone())
        })
    }

    /// Claims a decision for review. Roles: operator, owner.
    ///
    /// Re-claiming by the current holder extends the lease. A live lease
    /// held by someone else yields [`ClaimOutcome::AlreadyClaimed`] — a
    /// structured outcome, not an error. A lapsed lease is taken over
    /// silently; the sweeper reclaims leases on its own schedule too.
    ///
    /// # Errors
    ///
    /// - [`CoreError::NotFound`] for unknown or cross-project ids.
    /// - [`CoreError::NotClaimable`] when the state is not `PENDING` or
    ///   `CLAIMED`.
    pub fn claim_decision(
        &self,
        ident: &Identity,
        project_id: &str,
        decision_id: &str,
    ) -> Result<ClaimOutcome, CoreError> {
        let ctx = self.guard(ident, project_id, &[Role::Operator, Role::Owner])?;
        let scope = ctx.scope();
        let now = Self::now_ms();
        let claimed_until = now + self.config().claim_ttl_ms;

        self.store().with_tx(|tx| {
            let decision = load(tx, &scope, decision_id)?
                .ok_or_else(|| CoreError::not_found("decision", decision_id))?;
            if !matches!(
                decision.state,
                DecisionState::Pending | DecisionState::Claimed
            ) {
                return Err(CoreError::NotClaimable {
                    state: decision.state,
                });
            }
            if let (Some(holder), Some(until)) = (&decision.claimed_by, decision.claimed_until) {
                if holder != &ctx.user_id && until > now {
                    return Ok(ClaimOutcome::AlreadyClaimed {
                        claimed_by: holder.clone(),
                        claimed_until: until,
                    });
                }
            }

            let payload = payloads::DecisionClaimed {
                claimed_by: ctx.user_id.clone(),
                claimed_until,
            };
            let event = self
                .event(
                    &scope,
                    EventType::DecisionClaimed,
                    decision.command_id.clone(),
                    serde_json::to_value(&payload)?,
                )
                .with_command(&decision.command_id)
                .with_card(&decision.card_id)
                .with_decision(decision_id);
            self.append_live(tx, &event)?;

            tracing::debug!(%decision_id, claimed_by = %ctx.user_id, "decision claimed");
            Ok(ClaimOutcome::Claimed { claimed_until })
        })
    }

    /// Extends the caller's claim lease. Roles: operator, owner.
    ///
    /// Renewals are high-frequency and low-signal, so no event is emitted;
    /// the lease deadline is patched in place.
    ///
    /// # Errors
    ///
    /// - [`CoreError::NotFound`] for unknown or cross-project ids.
    /// - [`CoreError::NotYourClaim`] unless the decision is `CLAIMED` by the
    ///   caller.
    pub fn renew_claim(
        &self,
        ident: &Identity,
        project_id: &str,
        decision_id: &str,
    ) -> Result<i64, CoreError> {
        let ctx = self.guard(ident, project_id, &[Role::Operator, Role::Owner])?;
        let scope = ctx.scope();
        let claimed_until = Self::now_ms() + self.config().claim_ttl_ms;

        self.store().with_tx(|tx| {
            let decision = load(tx, &scope, decision_id)?
                .ok_or_else(|| CoreError::not_found("decision", decision_id))?;
            if decision.state != DecisionState::Claimed
                || decision.claimed_by.as_deref() != Some(ctx.user_id.as_str())
            {
                return Err(CoreError::NotYourClaim);
            }
            tx.execute(
                "UPDATE decisions SET claimed_until = ?1 WHERE decision_id = ?2",
                params![claimed_until, decision_id],
            )?;
            Ok(claimed_until)
        })
    }

    /// Renders an option on a decision. Roles: operator, owner.
    ///
    /// The compare-and-set point, with exactly-one-winner semantics: the
    /// read of the current state and the write of the render result are one
    /// serialized transaction. Losers get a durable
    /// `DecisionRenderRejected` event and a structured
    /// [`RenderOutcome::Rejected`] — the operation is never silent.
    ///
    /// # Errors
    ///
    /// - [`CoreError::NotFound`] for unknown or cross-project ids.
    /// - [`CoreError::InvalidOption`] when the key is not among the options.
    pub fn render_decision(
        &self,
        ident: &Identity,
        project_id: &str,
        decision_id: &str,
        option_key: &str,
        note: Option<&str>,
    ) -> Result<RenderOutcome, CoreError> {
        let ctx = self.guard(ident, project_id, &[Role::Operator, Role::Owner])?;
        let scope = ctx.scope();
        let now = Self::now_ms();

        self.store().with_tx(|tx| {
            let decision = load(tx, &scope, decision_id)?
                .ok_or_else(|| CoreError::not_found("decision", decision_id))?;

            if !matches!(
                decision.state,
                DecisionState::Pending | DecisionState::Claimed
            ) {
                let reason = format!("already resolved ({})", decision.state);
                self.append_render_rejected(tx, &decision, option_key, &ctx.user_id, &reason)?;
                return Ok(RenderOutcome::Rejected { reason });
            }
            if decision.state == DecisionState::Claimed
                && decision.claimed_by.as_deref() != Some(ctx.user_id.as_str())
            {
                let reason = "claimed_by_another".to_string();
                self.append_render_rejected(tx, &decision, option_key, &ctx.user_id, &reason)?;
                return Ok(RenderOutcome::Rejected { reason });
            }
            if !decision.has_option(option_key) {
                return Err(CoreError::InvalidOption {
                    option_key: option_key.to_string(),
                });
            }

            let payload = payloads::DecisionRendered {
                selected_option: option_key.to_string(),
                rendered_by: ctx.user_id.clone(),
                rendered_at: now,
                note: note.map(ToString::to_string),
            };
            let event = self
                .event(
                    &scope,
                    EventType::DecisionRendered,
                    decision.command_id.clone(),
                    serde_json::to_value(&payload)?,
                )
                .with_command(&decision.command_id)
                .with_card(&decision.card_id)
                .with_run(&decision.run_id)
                .with_decision(decision_id);
            self.append_live(tx, &event)?;

            tracing::info!(
                %decision_id,
                option = option_key,
                rendered_by = %ctx.user_id,
                "decision rendered"
            );
            Ok(RenderOutcome::Rendered {
                selected_option: option_key.to_string(),
            })
        })
    }

    /// Lists `PENDING` and `CLAIMED` decisions, most urgent first. Any role.
    ///
    /// Sorted by urgency rank (`now < today < whenever`), then
    /// `requested_at` ascending.
    ///
    /// # Errors
    ///
    /// Returns an error when the caller is not a member or the query fails.
    pub fn pending_decisions(
        &self,
        ident: &Identity,
        project_id: &str,
        urgency: Option<Urgency>,
    ) -> Result<Vec<Decision>, CoreError> {
        let ctx = self.guard(
            ident,
            project_id,
            &[Role::Owner, Role::Operator, Role::Viewer, Role::Bot],
        )?;
        let scope = ctx.scope();
        self.store().with_conn(|conn| {
            let sql = format!(
                "{SELECT_DECISION} WHERE tenant_id = ?1 AND project_id = ?2 \
                 AND state IN ('PENDING', 'CLAIMED') AND (?3 IS NULL OR urgency = ?3) \
                 ORDER BY CASE urgency WHEN 'now' THEN 0 WHEN 'today' THEN 1 ELSE 2 END, \
                 requested_at ASC, decision_id ASC"
            );
            let decisions = conn
                .prepare(&sql)?
                .query_map(
                    params![
                        scope.tenant_id,
                        scope.project_id,
                        urgency.map(Urgency::as_str)
                    ],
                    row_to_decision,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(decisions)
        })
    }

    /// Assembles the context bundle for a decision. Any role.
    ///
    /// Returns `None` for unknown or cross-project ids (not an error; the
    /// UI treats both identically).
    ///
    /// # Errors
    ///
    /// Returns an error when the caller is not a member or a query fails.
    pub fn decision_detail(
        &self,
        ident: &Identity,
        project_id: &str,
        decision_id: &str,
    ) -> Result<Option<DecisionDetail>, CoreError> {
        let ctx = self.guard(
            ident,
            project_id,
            &[Role::Owner, Role::Operator, Role::Viewer, Role::Bot],
        )?;
        let scope = ctx.scope();
        self.store().with_conn(|conn| {
            let Some(decision) = load(conn, &scope, decision_id)? else {
                return Ok(None);
            };
            let command_spec =
                command::load(conn, &scope, &decision.command_id)?.map(|c| c.spec);
            let mut artifacts = Vec::new();
            if let Some(refs) = &decision.artifact_refs {
                for artifact_id in refs {
                    if let Some(manifest) = artifact::load(conn, &scope, artifact_id)? {
                        artifacts.push(manifest);
                    }
                }
            }
            let events = ledger::by_correlation(conn, &scope.project_id, &decision.command_id)?;
            Ok(Some(DecisionDetail {
                decision,
                command_spec,
                artifacts,
                events,
            }))
        })
    }

    /// Point-in-time snapshot for a bot awaiting a decision. Roles: bot,
    /// owner.
    ///
    /// # Errors
    ///
    /// [`CoreError::NotFound`] for unknown or cross-project ids.
    pub fn await_decision(
        &self,
        ident: &Identity,
        project_id: &str,
        decision_id: &str,
    ) -> Result<DecisionSnapshot, CoreError> {
        let ctx = self.guard(ident, project_id, &[Role::Bot, Role::Owner])?;
        let scope = ctx.scope();
        let decision = self
            .store()
            .with_conn(|conn| load(conn, &scope, decision_id))?
            .ok_or_else(|| CoreError::not_found("decision", decision_id))?;
        Ok(DecisionSnapshot {
            status: decision.state.as_status().to_string(),
            selected_option: decision.rendered_option,
            rendered_by: decision.rendered_by,
        })
    }

    fn append_render_rejected(
        &self,
        tx: &rusqlite::Transaction<'_>,
        decision: &Decision,
        attempted_option: &str,
        attempted_by: &str,
        reason: &str,
    ) -> Result<(), CoreError> {
        let payload = payloads::DecisionRenderRejected {
            attempted_option: attempted_option.to_string(),
            attempted_by: attempted_by.to_string(),
            current_state: decision.state,
            reason: reason.to_string(),
        };
        let event = self
            .event(
                &decision.scope(),
                EventType::DecisionRenderRejected,
                decision.command_id.clone(),
                serde_json::to_value(&payload)?,
            )
            .with_command(&decision.command_id)
            .with_card(&decision.card_id)
            .with_decision(&decision.decision_id);
        self.append_live(tx, &event)?;
        tracing::debug!(
            decision_id = %decision.decision_id,
            attempted_by,
            reason,
            "render rejected"
        );
        Ok(())
    }
}
