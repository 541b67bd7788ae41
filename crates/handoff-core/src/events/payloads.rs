//! Typed payloads for each event type.
//!
//! Producers serialize these into the [`Event`](super::Event) envelope's
//! `payload` field; projectors deserialize them back. Both sides go through
//! `serde_json`, so the payload schema is exactly what these structs derive.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::artifact::ArtifactManifest;
use crate::card::{CardSpec, CardState};
use crate::command::CommandSpec;
use crate::decision::{DecisionOption, DecisionState, Urgency};

/// Payload of [`EventType::CommandRequested`](super::EventType::CommandRequested).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequested {
    /// The admitted command's id.
    pub command_id: String,
    /// The card created alongside the command.
    pub card_id: String,
    /// Human-readable work title.
    pub title: String,
    /// Effective priority (lower = more urgent).
    pub priority: i64,
    /// The command spec as submitted.
    pub spec: CommandSpec,
    /// Capabilities the executing worker must hold.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<String>>,
}

/// Payload of [`EventType::CommandStarted`](super::EventType::CommandStarted).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandStarted {
    /// The run minted for this execution attempt.
    pub run_id: String,
    /// 1-based attempt number (matches the card's post-transition `attempt`).
    pub attempt: u32,
    /// Executor identity, when reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor: Option<String>,
}

/// Payload of [`EventType::CommandSucceeded`](super::EventType::CommandSucceeded).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSucceeded {
    /// The run that finished.
    pub run_id: String,
    /// Optional structured result.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

/// Payload of [`EventType::CommandFailed`](super::EventType::CommandFailed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandFailed {
    /// The run that failed.
    pub run_id: String,
    /// Failure description, recorded on the run row.
    pub error: String,
    /// Whether the failure is eligible for retry scheduling.
    pub retryable: bool,
}

/// Payload of [`EventType::CommandCanceled`](super::EventType::CommandCanceled).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandCanceled {
    /// Why the command was canceled.
    pub reason: String,
    /// Who canceled it.
    pub canceled_by: String,
}

/// Payload of [`EventType::CommandRetryScheduled`](super::EventType::CommandRetryScheduled).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRetryScheduled {
    /// The failed run.
    pub run_id: String,
    /// The attempt that failed.
    pub attempt: u32,
    /// When the retry timer fires.
    pub retry_at_ts: i64,
}

/// Payload of [`EventType::CommandSkippedDuplicate`](super::EventType::CommandSkippedDuplicate).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSkippedDuplicate {
    /// The event whose idempotency key suppressed this admission.
    pub original_event_id: String,
    /// The originally admitted command.
    pub command_id: String,
    /// The originally created card.
    pub card_id: String,
}

/// Payload of [`EventType::CardCreated`](super::EventType::CardCreated).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardCreated {
    /// The new card's id.
    pub card_id: String,
    /// The command this card tracks.
    pub command_id: String,
    /// Human-readable work title.
    pub title: String,
    /// Priority (lower = more urgent).
    pub priority: i64,
    /// The card's execution spec.
    pub spec: CardSpec,
    /// Required worker capabilities.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<String>>,
}

/// Payload of [`EventType::CardTransitioned`](super::EventType::CardTransitioned).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardTransitioned {
    /// State before the transition.
    pub from: CardState,
    /// State after the transition.
    pub to: CardState,
    /// Why the transition happened.
    pub reason: String,
    /// Retry timer, present iff `to == RETRY_SCHEDULED`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_at_ts: Option<i64>,
}

/// Payload of [`EventType::DecisionRequested`](super::EventType::DecisionRequested).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRequested {
    /// The new decision's id.
    pub decision_id: String,
    /// The card blocked on this decision.
    pub card_id: String,
    /// The originating command.
    pub command_id: String,
    /// The run that raised the decision.
    pub run_id: String,
    /// Operator-facing urgency.
    pub urgency: Urgency,
    /// Operator-facing title.
    pub title: String,
    /// Short context summary for the queue view.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_summary: Option<String>,
    /// The enumerated options (non-empty, unique keys).
    pub options: Vec<DecisionOption>,
    /// Artifacts the operator should look at.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_refs: Option<Vec<String>>,
    /// External conversation reference.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_thread: Option<String>,
    /// Expiry deadline, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    /// Option auto-selected on expiry, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_option: Option<String>,
}

/// Payload of [`EventType::DecisionClaimed`](super::EventType::DecisionClaimed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionClaimed {
    /// The claiming operator.
    pub claimed_by: String,
    /// Lease deadline.
    pub claimed_until: i64,
}

/// Payload of [`EventType::DecisionRendered`](super::EventType::DecisionRendered).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRendered {
    /// The chosen option key.
    pub selected_option: String,
    /// Who rendered (an operator, or `system:sweeper`).
    pub rendered_by: String,
    /// When the render happened.
    pub rendered_at: i64,
    /// Free-form operator note.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Payload of [`EventType::DecisionRenderRejected`](super::EventType::DecisionRenderRejected).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRenderRejected {
    /// The option the loser tried to render.
    pub attempted_option: String,
    /// Who lost the compare-and-set.
    pub attempted_by: String,
    /// The decision's state at rejection time.
    pub current_state: DecisionState,
    /// Rejection reason (`"already resolved (STATE)"` or
    /// `"claimed_by_another"`).
    pub reason: String,
}

/// Payload of [`EventType::DecisionExpired`](super::EventType::DecisionExpired).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionExpired {
    /// Whether a fallback option was available (and therefore applied).
    pub had_fallback: bool,
}

/// Payload of [`EventType::DecisionClaimExpired`](super::EventType::DecisionClaimExpired).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionClaimExpired {
    /// The operator whose lease lapsed.
    pub claimed_by: String,
    /// The deadline that passed.
    pub claimed_until: i64,
}

/// What the sweeper did to a deferred decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferAction {
    /// The decision had a fallback and was auto-resolved with it.
    AutoResolvedWithFallback,
    /// The decision had no fallback; its expiry was pushed out.
    ExtendedExpiry,
}

/// Payload of [`EventType::DecisionDeferred`](super::EventType::DecisionDeferred).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionDeferred {
    /// What the sweeper did.
    pub action: DeferAction,
    /// The new expiry, present iff `action == extended_expiry`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_expires_at: Option<i64>,
}

/// Payload of [`EventType::ArtifactProduced`](super::EventType::ArtifactProduced).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactProduced {
    /// The full manifest; the projector inserts it verbatim.
    pub manifest: ArtifactManifest,
}

/// Payload of [`EventType::SloBreached`](super::EventType::SloBreached).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SloBreached {
    /// Count of `now`-urgency decisions pending in the project.
    pub now_backlog: u64,
    /// The emergency threshold that was exceeded.
    pub threshold: u32,
}

/// Payload of [`EventType::ReconciliationDrift`](super::EventType::ReconciliationDrift).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationDrift {
    /// The read model that diverged.
    pub model: String,
    /// What diverged.
    pub detail: String,
}
