//! Event envelope and the closed set of event types.
//!
//! Every state-changing fact in the kernel is an [`Event`]: an immutable,
//! scoped, correlated record with a type-specific JSON payload. Events are
//! appended to the [ledger](crate::ledger) — never updated, never deleted —
//! and projected into the read models in the same transaction.
//!
//! # Correlation
//!
//! `correlation_id` ties every event in a chain from request to terminal
//! state; `causation_id` records the parent event that triggered this one.
//! Within one correlation chain events are ordered by `(ts, event_id)`.

pub mod payloads;
pub mod secrets;


use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids;

/// A `(tenant_id, project_id)` pair. Every entity in the kernel is scoped by
/// one; no operation crosses scopes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    /// Tenant identifier.
    pub tenant_id: String,
    /// Project identifier.
    pub project_id: String,
}

impl Scope {
    /// Creates a scope.
    #[must_use]
    pub fn new(tenant_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            project_id: project_id.into(),
        }
    }
}

/// The service that produced an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Producer {
    /// Producing service name.
    pub service: String,
    /// Producing service version.
    pub version: String,
}

impl Producer {
    /// The kernel's own producer identity.
    #[must_use]
    pub fn kernel() -> Self {
        Self {
            service: "handoff-core".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// The closed set of event types.
///
/// Adding a variant is a schema change; projectors, the replay engine, and
/// the archive format all dispatch on this set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum EventType {
    /// A command was admitted.
    CommandRequested,
    /// A run of a command started executing.
    CommandStarted,
    /// A command finished successfully.
    CommandSucceeded,
    /// A command run failed.
    CommandFailed,
    /// A command was canceled.
    CommandCanceled,
    /// A failed command was scheduled for retry.
    CommandRetryScheduled,
    /// A duplicate admission was suppressed by its idempotency key.
    CommandSkippedDuplicate,
    /// A bot requested a human decision.
    DecisionRequested,
    /// An operator claimed a decision for review.
    DecisionClaimed,
    /// An option was rendered on a decision (terminal to the consumer).
    DecisionRendered,
    /// A render attempt lost the compare-and-set and was rejected.
    DecisionRenderRejected,
    /// A decision passed its expiry without being rendered.
    DecisionExpired,
    /// A claim lease lapsed and the decision returned to the queue.
    DecisionClaimExpired,
    /// A `whenever`-urgency decision was deferred under load.
    DecisionDeferred,
    /// An artifact manifest was registered.
    ArtifactProduced,
    /// A card (work item) was created.
    CardCreated,
    /// A card moved along one edge of the state machine.
    CardTransitioned,
    /// A service-level objective was breached (emergency backlog).
    SloBreached,
    /// A read model diverged from its event-derived expectation.
    ReconciliationDrift,
}

impl EventType {
    /// All event types, in declaration order.
    pub const ALL: [Self; 19] = [
        Self::CommandRequested,
        Self::CommandStarted,
        Self::CommandSucceeded,
        Self::CommandFailed,
        Self::CommandCanceled,
        Self::CommandRetryScheduled,
        Self::CommandSkippedDuplicate,
        Self::DecisionRequested,
        Self::DecisionClaimed,
        Self::DecisionRendered,
        Self::DecisionRenderRejected,
        Self::DecisionExpired,
        Self::DecisionClaimExpired,
        Self::DecisionDeferred,
        Self::ArtifactProduced,
        Self::CardCreated,
        Self::CardTransitioned,
        Self::SloBreached,
        Self::ReconciliationDrift,
    ];

    /// Returns the string representation of this event type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CommandRequested => "CommandRequested",
            Self::CommandStarted => "CommandStarted",
            Self::CommandSucceeded => "CommandSucceeded",
            Self::CommandFailed => "CommandFailed",
            Self::CommandCanceled => "CommandCanceled",
            Self::CommandRetryScheduled => "CommandRetryScheduled",
            Self::CommandSkippedDuplicate => "CommandSkippedDuplicate",
            Self::DecisionRequested => "DecisionRequested",
            Self::DecisionClaimed => "DecisionClaimed",
            Self::DecisionRendered => "DecisionRendered",
            Self::DecisionRenderRejected => "DecisionRenderRejected",
            Self::DecisionExpired => "DecisionExpired",
            Self::DecisionClaimExpired => "DecisionClaimExpired",
            Self::DecisionDeferred => "DecisionDeferred",
            Self::ArtifactProduced => "ArtifactProduced",
            Self::CardCreated => "CardCreated",
            Self::CardTransitioned => "CardTransitioned",
            Self::SloBreached => "SloBreached",
            Self::ReconciliationDrift => "ReconciliationDrift",
        }
    }

    /// Parses an event type from its string representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable ledger event.
///
/// Construct with [`Event::new`] and the `with_*` builders; the ledger
/// assigns nothing — the envelope is complete before append, which is what
/// makes the composite `(ts, event_id)` cursor stable across replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier (`evt_` ULID).
    pub event_id: String,
    /// Tenant scope.
    pub tenant_id: String,
    /// Project scope.
    pub project_id: String,
    /// Event type.
    pub event_type: EventType,
    /// Payload schema version.
    pub version: u32,
    /// Milliseconds since the Unix epoch, assigned at construction.
    pub ts: i64,
    /// Chain identity: shared by every event from request to terminal state.
    pub correlation_id: String,
    /// Parent event id, when this event was triggered by another.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    /// Subject command, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
    /// Subject run, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// Subject card, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub card_id: Option<String>,
    /// Subject decision, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision_id: Option<String>,
    /// Deduplication key; at most one event per key exists in the log.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// The producing service.
    pub producer: Producer,
    /// Free-form tags (scanned for secrets like the payload).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    /// Type-specific payload (see [`payloads`]).
    pub payload: Value,
}

impl Event {
    /// Creates an event with a freshly minted id and the current timestamp.
    #[must_use]
    pub fn new(
        scope: &Scope,
        event_type: EventType,
        correlation_id: impl Into<String>,
        payload: Value,
        producer: Producer,
    ) -> Self {
        Self {
            event_id: ids::event_id(),
            tenant_id: scope.tenant_id.clone(),
            project_id: scope.project_id.clone(),
            event_type,
            version: 1,
            ts: chrono::Utc::now().timestamp_millis(),
            correlation_id: correlation_id.into(),
            causation_id: None,
            command_id: None,
            run_id: None,
            card_id: None,
            decision_id: None,
            idempotency_key: None,
            producer,
            tags: None,
            payload,
        }
    }

    /// Returns this event's scope.
    #[must_use]
    pub fn scope(&self) -> Scope {
        Scope::new(&self.tenant_id, &self.project_id)
    }

    /// Sets the parent event id.
    #[must_use]
    pub fn with_causation(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }

    /// Sets the subject command id.
    #[must_use]
    pub fn with_command(mut self, command_id: impl Into<String>) -> Self {
        self.command_id = Some(command_id.into());
        self
    }

    /// Sets the subject run id.
    #[must_use]
    pub fn with_run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Sets the subject card id.
    #[must_use]
    pub fn with_card(mut self, card_id: impl Into<String>) -> Self {
        self.card_id = Some(card_id.into());
        self
    }

    /// Sets the subject decision id.
    #[must_use]
    pub fn with_decision(mut self, decision_id: impl Into<String>) -> Self {
        self.decision_id = Some(decision_id.into());
        self
    }

    /// Sets the idempotency key.
    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Sets free-form tags.
    #[must_use]
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = Some(tags);
        self
    }

    /// Overrides the timestamp (sweeper passes its `now`; tests pin clocks).
    #[must_use]
    pub const fn with_ts(mut self, ts: i64) -> Self {
        self.ts = ts;
        self
    }
}
