//! The periodic liveness sweeper.
//!
//! Invoked by an external scheduler (≈ every 2 minutes). One pass runs four
//! phases in order, each over the full active set:
//!
//! 1. **Release retries** — `RETRY_SCHEDULED` cards whose timer fired go
//!    back to `READY`.
//! 2. **Expire decisions** — past-deadline decisions either auto-resolve via
//!    their fallback (the card resumes) or expire terminally (the card
//!    fails).
//! 3. **Reclaim lapsed claims** — `CLAIMED` decisions whose lease passed
//!    return to `PENDING` for other claimants.
//! 4. **Load shedding** — projects whose `now`-urgency backlog exceeds the
//!    defer threshold get their `whenever`-urgency decisions deferred:
//!    fallback-bearing ones auto-resolve, the rest have their expiry pushed
//!    out. Past the emergency threshold an `SloBreached` event is appended
//!    for external alerting.
//!
//! Every write goes through the event log and the same transition
//! primitives the interactive paths use; the sweeper never edits read
//! models out-of-band. Each item is its own transaction: one failing
//! decision does not abort the pass.


use serde::Serialize;

use crate::card::{CardState, TransitionRequest};
use crate::core::Core;
use crate::decision::{self, Decision, DecisionState, SWEEPER_ACTOR};
use crate::error::CoreError;
use crate::events::{EventType, Scope, payloads};

/// Counters from one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Cards released from `RETRY_SCHEDULED`.
    pub retries_released: u32,
    /// Decisions expired (with or without fallback).
    pub decisions_expired: u32,
    /// Expired decisions that auto-resolved via fallback.
    pub fallbacks_applied: u32,
    /// Claim leases reclaimed.
    pub claims_reclaimed: u32,
    /// `whenever` decisions deferred under load.
    pub decisions_deferred: u32,
    /// Projects past the emergency threshold.
    pub emergencies: u32,
    /// Items that failed; the pass continued past them.
    pub errors: u32,
}

impl Core {
    /// Runs one sweep pass.
    ///
    /// `now` overrides the clock (the scheduler passes `None`; tests and
    /// catch-up drivers pin a timestamp). Per-item failures are isolated:
    /// they are counted in [`SweepReport::errors`] and logged, and the pass
    /// moves on.
    ///
    /// # Errors
    ///
    /// Only scan-level failures (the store itself erroring) abort the pass.
    pub fn sweep(&self, now: Option<i64>) -> Result<SweepReport, CoreError> {
        let now = now.unwrap_or_else(Self::now_ms);
        let mut report = SweepReport::default();

        self.release_retries(now, &mut report)?;
        self.expire_decisions(now, &mut report)?;
        self.reclaim_claims(now, &mut report)?;
        self.shed_load(now, &mut report)?;

        tracing::info!(
            retries_released = report.retries_released,
            decisions_expired = report.decisions_expired,
            claims_reclaimed = report.claims_reclaimed,
            decisions_deferred = report.decisions_deferred,
            errors = report.errors,
            "sweep pass complete"
        );
        Ok(report)
    }

    /// Phase 1: reopen cards whose retry timer fired.
    fn release_retries(&self, now: i64, report: &mut SweepReport) -> Result<(), CoreError> {
        let due = self
            .store()
            .with_conn(|conn| crate::card::due_retries(conn, now))?;
        for card in due {
            let result = self.store().with_tx(|tx| {
                // Reload under the transaction; the card may have moved.
                let Some(current) = crate::card::load(tx, &card.scope(), &card.card_id)? else {
                    return Ok(false);
                };
                if current.state != CardState::RetryScheduled
                    || current.retry_at_ts.is_none_or(|t| t > now)
                {
                    return Ok(false);
                }
                let transition = TransitionRequest {
                    to: CardState::Ready,
                    reason: "retry timer fired".to_string(),
                    correlation_id: None,
                    run_id: None,
                    decision_id: None,
                    retry_at_ts: None,
                };
                self.transition_in_tx(tx, &current, &transition, Some(now), None)?;
                Ok(true)
            });
            match result {
                Ok(true) => report.retries_released += 1,
                Ok(false) => {}
                Err(e) => {
                    report.errors += 1;
                    tracing::warn!(card_id = %card.card_id, error = %e, "retry release failed");
                }
            }
        }
        Ok(())
    }

    /// Phase 2: expire past-deadline decisions, applying fallbacks.
    fn expire_decisions(&self, now: i64, report: &mut SweepReport) -> Result<(), CoreError> {
        let due = self
            .store()
            .with_conn(|conn| decision::due_expiries(conn, now))?;
        for decision in due {
            match self.expire_one(&decision, now) {
                Ok(true) => {
                    report.decisions_expired += 1;
                    if decision.fallback_option.is_some() {
                        report.fallbacks_applied += 1;
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    report.errors += 1;
                    tracing::warn!(
                        decision_id = %decision.decision_id,
                        error = %e,
                        "decision expiration failed"
                    );
                }
            }
        }
        Ok(())
    }

    fn expire_one(&self, stale: &Decision, now: i64) -> Result<bool, CoreError> {
        let scope = stale.scope();
        self.store().with_tx(|tx| {
            let Some(decision) = decision::load(tx, &scope, &stale.decision_id)? else {
                return Ok(false);
            };
            if !matches!(
                decision.state,
                DecisionState::Pending | DecisionState::Claimed
            ) || decision.expires_at.is_none_or(|t| t > now)
            {
                return Ok(false);
            }

            let had_fallback = decision.fallback_option.is_some();
            let expired = self
                .event(
                    &scope,
                    EventType::DecisionExpired,
                    decision.command_id.clone(),
                    serde_json::to_value(payloads::DecisionExpired { had_fallback })?,
                )
                .with_command(&decision.command_id)
                .with_card(&decision.card_id)
                .with_decision(&decision.decision_id)
                .with_ts(now);
            let expired_append = self.append_live(tx, &expired)?;

            if let Some(fallback) = &decision.fallback_option {
                self.render_fallback_in_tx(
                    tx,
                    &decision,
                    fallback,
                    "auto-resolved via fallback on expiration",
                    "decision expired, fallback applied",
                    expired_append.event_id(),
                    now,
                )?;
                tracing::info!(
                    decision_id = %decision.decision_id,
                    fallback,
                    "decision expired, fallback applied"
                );
            } else {
                if let Some(card) = crate::card::load(tx, &scope, &decision.card_id)? {
                    if card.state == CardState::NeedsDecision {
                        let transition = TransitionRequest {
                            to: CardState::Failed,
                            reason: "decision expired, no fallback".to_string(),
                            correlation_id: None,
                            run_id: Some(decision.run_id.clone()),
                            decision_id: Some(decision.decision_id.clone()),
                            retry_at_ts: None,
                        };
                        self.transition_in_tx(
                            tx,
                            &card,
                            &transition,
                            Some(now),
                            Some(expired_append.event_id()),
                        )?;
                    }
                }
                tracing::warn!(
                    decision_id = %decision.decision_id,
                    "decision expired with no fallback"
                );
            }
            Ok(true)
        })
    }

    /// Phase 3: return lapsed claims to the queue.
    fn reclaim_claims(&self, now: i64, report: &mut SweepReport) -> Result<(), CoreError> {
        let lapsed = self
            .store()
            .with_conn(|conn| decision::lapsed_claims(conn, now))?;
        for stale in lapsed {
            let scope = stale.scope();
            let result = self.store().with_tx(|tx| {
                let Some(decision) = decision::load(tx, &scope, &stale.decision_id)? else {
                    return Ok(false);
                };
                let (Some(claimed_by), Some(claimed_until)) =
                    (decision.claimed_by.clone(), decision.claimed_until)
                else {
                    return Ok(false);
                };
                if decision.state != DecisionState::Claimed || claimed_until >= now {
                    return Ok(false);
                }
                let event = self
                    .event(
                        &scope,
                        EventType::DecisionClaimExpired,
                        decision.command_id.clone(),
                        serde_json::to_value(payloads::DecisionClaimExpired {
                            claimed_by: claimed_by.clone(),
                            claimed_until,
                        })?,
                    )
                    .with_command(&decision.command_id)
                    .with_card(&decision.card_id)
                    .with_decision(&decision.decision_id)
                    .with_ts(now);
                self.append_live(tx, &event)?;
                tracing::debug!(
                    decision_id = %decision.decision_id,
                    claimed_by = %claimed_by,
                    "claim lease reclaimed"
                );
                Ok(true)
            });
            match result {
                Ok(true) => report.claims_reclaimed += 1,
                Ok(false) => {}
                Err(e) => {
                    report.errors += 1;
                    tracing::warn!(
                        decision_id = %stale.decision_id,
                        error = %e,
                        "claim reclamation failed"
                    );
                }
            }
        }
        Ok(())
    }

    /// Phase 4: defer `whenever` decisions in overloaded projects.
    fn shed_load(&self, now: i64, report: &mut SweepReport) -> Result<(), CoreError> {
        let backlogs = self.store().with_conn(|conn| decision::now_backlogs(conn))?;
        for (scope, backlog) in backlogs {
            if backlog <= u64::from(self.config().defer_threshold) {
                continue;
            }
            let sheddable = self
                .store()
                .with_conn(|conn| decision::whenever_pending(conn, &scope))?;
            for stale in sheddable {
                match self.defer_one(&stale, now) {
                    Ok(true) => report.decisions_deferred += 1,
                    Ok(false) => {}
                    Err(e) => {
                        report.errors += 1;
                        tracing::warn!(
                            decision_id = %stale.decision_id,
                            error = %e,
                            "deferral failed"
                        );
                    }
                }
            }

            if backlog > u64::from(self.config().emergency_threshold) {
                report.emergencies += 1;
                self.emit_emergency(&scope, backlog, now, report);
            }
        }
        Ok(())
    }

    fn defer_one(&self, stale: &Decision, now: i64) -> Result<bool, CoreError> {
        let scope = stale.scope();
        self.store().with_tx(|tx| {
            let Some(decision) = decision::load(tx, &scope, &stale.decision_id)? else {
                return Ok(false);
            };
            if decision.state != DecisionState::Pending {
                return Ok(false);
            }

            if let Some(fallback) = &decision.fallback_option {
                let deferred = self
                    .event(
                        &scope,
                        EventType::DecisionDeferred,
                        decision.command_id.clone(),
                        serde_json::to_value(payloads::DecisionDeferred {
                            action: payloads::DeferAction::AutoResolvedWithFallback,
                            new_expires_at: None,
                        })?,
                    )
                    .with_command(&decision.command_id)
                    .with_card(&decision.card_id)
                    .with_decision(&decision.decision_id)
                    .with_ts(now);
                let deferred_append = self.append_live(tx, &deferred)?;
                self.render_fallback_in_tx(
                    tx,
                    &decision,
                    fallback,
                    "auto-resolved via fallback under load shedding",
                    "decision deferred, fallback applied",
                    deferred_append.event_id(),
                    now,
                )?;
                tracing::info!(
                    decision_id = %decision.decision_id,
                    fallback,
                    "whenever decision shed via fallback"
                );
            } else {
                let new_expires_at =
                    decision.expires_at.unwrap_or(now) + self.config().load_shed_deferral_ms;
                let deferred = self
                    .event(
                        &scope,
                        EventType::DecisionDeferred,
                        decision.command_id.clone(),
                        serde_json::to_value(payloads::DecisionDeferred {
                            action: payloads::DeferAction::ExtendedExpiry,
                            new_expires_at: Some(new_expires_at),
                        })?,
                    )
                    .with_command(&decision.command_id)
                    .with_card(&decision.card_id)
                    .with_decision(&decision.decision_id)
                    .with_ts(now);
                self.append_live(tx, &deferred)?;
                tracing::info!(
                    decision_id = %decision.decision_id,
                    new_expires_at,
                    "whenever decision expiry extended under load"
                );
            }
            Ok(true)
        })
    }

    fn emit_emergency(&self, scope: &Scope, backlog: u64, now: i64, report: &mut SweepReport) {
        tracing::error!(
            project_id = %scope.project_id,
            backlog,
            threshold = self.config().emergency_threshold,
            "now-urgency decision backlog past emergency threshold"
        );
        let result = self.store().with_tx(|tx| {
            let payload = payloads::SloBreached {
                now_backlog: backlog,
                threshold: self.config().emergency_threshold,
            };
            let event = self
                .event(
                    scope,
                    EventType::SloBreached,
                    scope.project_id.clone(),
                    serde_json::to_value(payload)?,
                )
                .with_ts(now);
            self.append_live(tx, &event)?;
            Ok(())
        });
        if let Err(e) = result {
            report.errors += 1;
            tracing::warn!(error = %e, "failed to record SLO breach");
        }
    }

    /// Fallback render shared by expiry and load shedding: `DecisionRendered`
    /// as `system:sweeper`, then the card (if still blocked) resumes.
    #[allow(clippy::too_many_arguments)]
    fn render_fallback_in_tx(
        &self,
        tx: &rusqlite::Transaction<'_>,
        decision: &Decision,
        fallback: &str,
        note: &str,
        card_reason: &str,
        causation_event_id: &str,
        now: i64,
    ) -> Result<(), CoreError> {
        let scope = decision.scope();
        let rendered = self
            .event(
                &scope,
                EventType::DecisionRendered,
                decision.command_id.clone(),
                serde_json::to_value(payloads::DecisionRendered {
                    selected_option: fallback.to_string(),
                    rendered_by: SWEEPER_ACTOR.to_string(),
                    rendered_at: now,
                    note: Some(note.to_string()),
                })?,
            )
            .with_command(&decision.command_id)
            .with_card(&decision.card_id)
            .with_run(&decision.run_id)
            .with_decision(&decision.decision_id)
            .with_causation(causation_event_id)
            .with_ts(now);
        let rendered_append = self.append_live(tx, &rendered)?;

        if let Some(card) = crate::card::load(tx, &scope, &decision.card_id)? {
            if card.state == CardState::NeedsDecision {
                let transition = TransitionRequest {
                    to: CardState::Running,
                    reason: card_reason.to_string(),
                    correlation_id: None,
                    run_id: Some(decision.run_id.clone()),
                    decision_id: Some(decision.decision_id.clone()),
                    retry_at_ts: None,
                };
                self.transition_in_tx(
                    tx,
                    &card,
                    &transition,
                    Some(now),
                    Some(rendered_append.event_id()),
                )?;
            }
        }
        Ok(())
    }
}
